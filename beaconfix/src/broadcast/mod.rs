//! Position broadcasting.
//!
//! The [`PositionBroadcaster`] owns the set of live subscribers. Each
//! subscriber has its own bounded queue and its own heartbeat task:
//!
//! ```text
//!                        ┌──► queue ──► Subscription (transport task)
//! publish(payload) ──────┼──► queue ──► Subscription
//!                        └──► queue ──► Subscription
//!                              ▲
//!                heartbeat task (one per subscriber, cancelled on unsubscribe)
//! ```
//!
//! Publishing never waits on a subscriber: a full queue drops that
//! subscriber's copy (counted in telemetry), a closed queue removes the
//! subscriber. Heartbeats are only queued into an empty queue. Membership
//! changes and publish iteration are serialized by one lock around the
//! subscriber table.
//!
//! The WebSocket transport lives in [`server`].

mod payload;
pub mod server;

pub use payload::{Payload, ProximityEntry};
pub use server::{BroadcastServer, TransportError};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::telemetry::PipelineMetrics;

/// Default interval of the per-subscriber heartbeat.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Default per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Broadcaster settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastConfig {
    pub heartbeat_interval: Duration,
    pub queue_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Identifies one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Receiving end of a subscription.
///
/// Yields `None` once the subscriber has been removed and its queue is
/// drained.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<Arc<Payload>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next payload.
    pub async fn recv(&mut self) -> Option<Arc<Payload>> {
        self.rx.recv().await
    }

    /// Take a queued payload without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<Payload>> {
        self.rx.try_recv().ok()
    }
}

/// Per-publish delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers the payload was queued for.
    pub delivered: usize,
    /// Subscribers whose queue was full.
    pub dropped: usize,
    /// Subscribers found closed and removed.
    pub removed: usize,
}

struct SubscriberEntry {
    tx: mpsc::Sender<Arc<Payload>>,
    heartbeat: CancellationToken,
}

/// Fan-out of payloads to live subscribers.
pub struct PositionBroadcaster {
    config: BroadcastConfig,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriberId, SubscriberEntry>>,
    proximity: Arc<RwLock<Vec<ProximityEntry>>>,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl PositionBroadcaster {
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
            proximity: Arc::new(RwLock::new(Vec::new())),
            metrics: None,
        }
    }

    /// Record broadcast activity in `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register a new subscriber.
    ///
    /// The subscription first receives a [`Payload::Hello`], then heartbeats
    /// every `heartbeat_interval` and every published payload, until it is
    /// unsubscribed. Must be called within a Tokio runtime.
    pub fn subscribe(&self) -> Subscription {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));

        // Fresh channel with capacity >= 1, cannot fail.
        let _ = tx.try_send(Arc::new(Payload::hello()));

        let heartbeat = CancellationToken::new();
        tokio::spawn(heartbeat_task(
            id,
            tx.downgrade(),
            Arc::clone(&self.proximity),
            self.config.heartbeat_interval,
            heartbeat.clone(),
        ));

        self.subscribers
            .lock()
            .insert(id, SubscriberEntry { tx, heartbeat });
        if let Some(m) = &self.metrics {
            m.subscriber_connected();
        }
        debug!(subscriber = %id, "Subscriber registered");

        Subscription { id, rx }
    }

    /// Queue `payload` for every current subscriber.
    pub fn publish(&self, payload: Payload) -> PublishReport {
        let payload = Arc::new(payload);
        let mut report = PublishReport::default();
        let mut closed = Vec::new();

        let mut subscribers = self.subscribers.lock();
        for (id, entry) in subscribers.iter() {
            match entry.tx.try_send(Arc::clone(&payload)) {
                Ok(()) => report.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(
                        subscriber = %id,
                        kind = payload.kind(),
                        "Subscriber queue full, payload dropped"
                    );
                    if let Some(m) = &self.metrics {
                        m.payload_dropped();
                    }
                    report.dropped += 1;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in closed {
            if let Some(entry) = subscribers.remove(&id) {
                self.retire(id, entry);
                report.removed += 1;
            }
        }
        drop(subscribers);

        if let Some(m) = &self.metrics {
            m.payload_published();
        }
        trace!(kind = payload.kind(), ?report, "Payload published");
        report
    }

    /// Remove a subscriber and stop its heartbeat.
    ///
    /// Returns `false` if the subscriber was already gone.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        match self.subscribers.lock().remove(&id) {
            Some(entry) => {
                self.retire(id, entry);
                true
            }
            None => false,
        }
    }

    fn retire(&self, id: SubscriberId, entry: SubscriberEntry) {
        entry.heartbeat.cancel();
        if let Some(m) = &self.metrics {
            m.subscriber_dropped();
        }
        debug!(subscriber = %id, "Subscriber removed");
    }

    /// Number of live subscribers, reaping any whose receiver is gone.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        let closed: Vec<SubscriberId> = subscribers
            .iter()
            .filter(|(_, e)| e.tx.is_closed())
            .map(|(id, _)| *id)
            .collect();
        for id in closed {
            if let Some(entry) = subscribers.remove(&id) {
                self.retire(id, entry);
            }
        }
        subscribers.len()
    }

    /// Insert or replace one beacon's proximity entry.
    pub fn update_proximity(&self, entry: ProximityEntry) {
        let mut proximity = self.proximity.write();
        match proximity.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => {
                proximity.push(entry);
                proximity.sort_by(|a, b| a.id.cmp(&b.id));
            }
        }
    }

    /// Current proximity list.
    pub fn proximity(&self) -> Vec<ProximityEntry> {
        self.proximity.read().clone()
    }

    /// Remove every subscriber.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.subscribers.lock().drain().collect();
        for (id, entry) in drained {
            self.retire(id, entry);
        }
    }
}

impl Drop for PositionBroadcaster {
    fn drop(&mut self) {
        for entry in self.subscribers.get_mut().values() {
            entry.heartbeat.cancel();
        }
    }
}

async fn heartbeat_task(
    id: SubscriberId,
    tx: mpsc::WeakSender<Arc<Payload>>,
    proximity: Arc<RwLock<Vec<ProximityEntry>>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; hello already went out.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(tx) = tx.upgrade() else { break };
                // Skip while the subscriber still has undrained payloads.
                if tx.capacity() < tx.max_capacity() {
                    continue;
                }
                let payload = Payload::heartbeat(proximity.read().clone());
                match tx.try_send(Arc::new(payload)) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
        }
    }
    trace!(subscriber = %id, "Heartbeat stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::Proximity;

    fn broadcaster() -> PositionBroadcaster {
        PositionBroadcaster::new(BroadcastConfig::default())
    }

    fn marker(cycle: u64) -> Payload {
        Payload::unresolved(cycle, "test")
    }

    fn is_marker(p: &Payload, cycle: u64) -> bool {
        matches!(p, Payload::Unresolved { cycle: c, .. } if *c == cycle)
    }

    #[tokio::test]
    async fn test_hello_first() {
        let b = broadcaster();
        let mut sub = b.subscribe();
        b.publish(marker(1));

        assert_eq!(sub.recv().await.unwrap().kind(), "hello");
        assert!(is_marker(&sub.recv().await.unwrap(), 1));
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber_once() {
        let b = Arc::new(broadcaster());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let b = Arc::clone(&b);
                tokio::spawn(async move { b.subscribe() })
            })
            .collect();
        let mut subs = Vec::new();
        for h in handles {
            subs.push(h.await.unwrap());
        }

        let report = b.publish(marker(7));
        assert_eq!(report.delivered, 8);

        for sub in &mut subs {
            let mut seen = 0;
            while let Some(p) = sub.try_recv() {
                if is_marker(&p, 7) {
                    seen += 1;
                }
            }
            assert_eq!(seen, 1);
        }
    }

    #[tokio::test]
    async fn test_closed_subscriber_removed_others_unaffected() {
        let b = broadcaster();
        let dropped = b.subscribe();
        let mut kept = b.subscribe();
        drop(dropped);

        let report = b.publish(marker(1));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.removed, 1);
        assert_eq!(b.subscriber_count(), 1);

        assert_eq!(kept.recv().await.unwrap().kind(), "hello");
        assert!(is_marker(&kept.recv().await.unwrap(), 1));
    }

    #[tokio::test]
    async fn test_no_delivery_after_unsubscribe() {
        let b = broadcaster();
        let mut sub = b.subscribe();
        assert!(b.unsubscribe(sub.id()));
        assert!(!b.unsubscribe(sub.id()));

        b.publish(marker(3));
        let mut received = Vec::new();
        while let Some(p) = sub.recv().await {
            received.push(p);
        }
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].kind(), "hello");
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let b = PositionBroadcaster::new(BroadcastConfig {
            queue_capacity: 2,
            ..Default::default()
        });
        let _sub = b.subscribe();

        assert_eq!(b.publish(marker(1)).delivered, 1);
        let report = b.publish(marker(2));
        assert_eq!(report.dropped, 1);
        assert_eq!(b.subscriber_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_subscriber_keeps_room_for_payloads() {
        let metrics = Arc::new(PipelineMetrics::new());
        let b = PositionBroadcaster::new(BroadcastConfig {
            heartbeat_interval: Duration::from_millis(10),
            queue_capacity: 4,
        })
        .with_metrics(Arc::clone(&metrics));
        let mut sub = b.subscribe();

        // Never drained: hello sits in the queue while many heartbeats come due.
        tokio::time::sleep(Duration::from_secs(1)).await;

        for cycle in 1..=3 {
            assert_eq!(b.publish(marker(cycle)).delivered, 1);
        }
        assert_eq!(b.publish(marker(4)).dropped, 1);
        assert_eq!(metrics.snapshot().payloads_dropped, 1);

        assert_eq!(sub.try_recv().unwrap().kind(), "hello");
        for cycle in 1..=3 {
            assert!(is_marker(&sub.try_recv().unwrap(), cycle));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_periodic_with_proximity() {
        let b = broadcaster();
        b.update_proximity(ProximityEntry {
            id: "alpha".into(),
            proximity: Proximity::Near,
            rssi: Some(-62),
        });
        let mut sub = b.subscribe();
        assert_eq!(sub.recv().await.unwrap().kind(), "hello");

        for _ in 0..3 {
            let payload = sub.recv().await.unwrap();
            match payload.as_ref() {
                Payload::Heartbeat { beacons, .. } => {
                    assert_eq!(beacons.len(), 1);
                    assert_eq!(beacons[0].proximity, Proximity::Near);
                }
                other => panic!("expected heartbeat, got {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_stops_heartbeat() {
        let b = broadcaster();
        let mut sub = b.subscribe();
        b.unsubscribe(sub.id());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sub.recv().await.unwrap().kind(), "hello");
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn test_update_proximity_replaces_and_sorts() {
        let b = broadcaster();
        for (id, p) in [("bravo", Proximity::Far), ("alpha", Proximity::Near), ("bravo", Proximity::Immediate)] {
            b.update_proximity(ProximityEntry {
                id: id.into(),
                proximity: p,
                rssi: None,
            });
        }
        let list = b.proximity();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id.as_str(), "alpha");
        assert_eq!(list[1].proximity, Proximity::Immediate);
    }
}
