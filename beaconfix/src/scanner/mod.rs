//! Peripheral discovery.
//!
//! The scanner drives a [`PeripheralAdapter`] scan and turns its raw,
//! possibly duplicated stream of peripherals into a clean event stream:
//!
//! ```text
//! adapter ──► (service filter) ──► (dedupe by address) ──► ScanEvent::Discovered
//!                                                          ...
//!                                                          ScanEvent::Finished
//! ```
//!
//! The scan runs on its own task so the caller is never blocked. It ends
//! when the optional deadline elapses, when the adapter stops producing, or
//! when the cancellation token fires; in every case a final
//! [`ScanEvent::Finished`] tells the caller how many peripherals matched, so
//! a scan with zero matches is reported explicitly rather than leaving the
//! caller waiting.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::peripheral::{GattUuid, PeripheralAdapter, PeripheralError, PeripheralHandle};

/// Capacity of the discovery event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// What to scan for.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanFilter {
    /// Only peripherals advertising this service are reported.
    pub service: GattUuid,
    /// Overall scan deadline; `None` scans until cancelled.
    pub deadline: Option<Duration>,
}

impl ScanFilter {
    /// An open-ended scan for `service`.
    pub fn new(service: GattUuid) -> Self {
        Self {
            service,
            deadline: None,
        }
    }

    /// Bound the scan to `deadline`.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Why a scan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanEnd {
    /// The configured deadline elapsed.
    DeadlineElapsed,
    /// The adapter stopped producing peripherals.
    AdapterClosed,
    /// The caller cancelled the scan.
    Cancelled,
}

/// Events emitted by a running scan.
#[derive(Clone)]
pub enum ScanEvent {
    /// A matching peripheral seen for the first time in this scan.
    Discovered(PeripheralHandle),
    /// The scan has ended. Always the last event.
    Finished {
        /// Number of distinct matching peripherals reported.
        matched: usize,
        /// Why the scan ended.
        reason: ScanEnd,
    },
}

impl std::fmt::Debug for ScanEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discovered(p) => f
                .debug_tuple("Discovered")
                .field(&p.advertisement().address)
                .finish(),
            Self::Finished { matched, reason } => f
                .debug_struct("Finished")
                .field("matched", matched)
                .field("reason", reason)
                .finish(),
        }
    }
}

/// Errors that prevent a scan from starting.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScanError {
    /// The radio adapter cannot be used; no discovery is performed.
    #[error("adapter unavailable: {0}")]
    AdapterUnavailable(String),
}

impl From<PeripheralError> for ScanError {
    fn from(err: PeripheralError) -> Self {
        match err {
            PeripheralError::AdapterUnavailable(msg) => Self::AdapterUnavailable(msg),
            other => Self::AdapterUnavailable(other.to_string()),
        }
    }
}

/// Discovers peripherals advertising a known service.
pub struct PeripheralScanner {
    adapter: Arc<dyn PeripheralAdapter>,
}

impl PeripheralScanner {
    /// Create a scanner over the given adapter.
    pub fn new(adapter: Arc<dyn PeripheralAdapter>) -> Self {
        Self { adapter }
    }

    /// Start a scan.
    ///
    /// Returns once the adapter has accepted the scan; discoveries then
    /// arrive on the returned channel. Each distinct peripheral (by address)
    /// is reported at most once per scan.
    ///
    /// # Errors
    ///
    /// [`ScanError::AdapterUnavailable`] if the adapter refuses to scan.
    pub async fn scan(
        &self,
        filter: ScanFilter,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ScanEvent>, ScanError> {
        let mut raw = self.adapter.start_scan(&filter.service).await?;
        info!(service = %filter.service, deadline = ?filter.deadline, "Scan started");

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let adapter = Arc::clone(&self.adapter);

        tokio::spawn(async move {
            let deadline = async {
                match filter.deadline {
                    Some(d) => tokio::time::sleep(d).await,
                    None => std::future::pending().await,
                }
            };
            tokio::pin!(deadline);

            let mut seen: HashSet<String> = HashSet::new();
            let reason = loop {
                tokio::select! {
                    _ = cancel.cancelled() => break ScanEnd::Cancelled,
                    _ = &mut deadline => break ScanEnd::DeadlineElapsed,
                    next = raw.recv() => {
                        let Some(peripheral) = next else {
                            break ScanEnd::AdapterClosed;
                        };
                        let adv = peripheral.advertisement();
                        if !adv.advertises_service(&filter.service) {
                            continue;
                        }
                        if !seen.insert(adv.address.clone()) {
                            continue;
                        }
                        debug!(address = %adv.address, name = ?adv.local_name, "Peripheral discovered");
                        if tx.send(ScanEvent::Discovered(peripheral)).await.is_err() {
                            break ScanEnd::Cancelled;
                        }
                    }
                }
            };

            adapter.stop_scan().await;

            let matched = seen.len();
            if matched == 0 {
                warn!(reason = ?reason, "Scan finished without matching peripherals");
            } else {
                info!(matched, reason = ?reason, "Scan finished");
            }
            let _ = tx.send(ScanEvent::Finished { matched, reason }).await;
        });

        Ok(rx)
    }
}
