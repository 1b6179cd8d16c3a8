//! Per-peripheral acquisition state machine.
//!
//! A [`PeripheralSession`] walks one discovered peripheral through a fixed
//! sequence of stages, each backed by one asynchronous radio operation:
//!
//! ```text
//! Idle ──► Connecting ──► ServiceDiscovery ──► CharacteristicDiscovery ──► Reading ──► Done(reading)
//!              │                 │                       │                     │
//!              └─────────────────┴───────────────────────┴─────────────────────┴──► Failed(reason)
//! ```
//!
//! Stages are never skipped. Any stage failure moves straight to `Failed`
//! with a reason tag, and any stage exceeding its deadline fails with
//! [`SessionFailure::ReadTimeout`]. `Done` and `Failed` are terminal:
//! [`PeripheralSession::run`] consumes the session, always releases the
//! connection, and returns exactly one [`SessionOutcome`]. The release is
//! itself bounded by the connect deadline, so a radio stack that never
//! finishes disconnecting cannot hold a session short of its terminal state.
//!
//! Sessions share nothing with each other, so any number can run
//! concurrently; a slow peripheral only ever delays its own session.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::beacon::BeaconId;
use crate::peripheral::{GattUuid, PeripheralError, PeripheralHandle};

/// Width in bytes of the characteristic value.
pub const READING_WIDTH: usize = 4;

/// Default deadline for the connect stage.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for each discovery stage.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default deadline for the read stage.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// A value read from a beacon, paired with the beacon it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct RawReading {
    /// Beacon that produced the value.
    pub beacon: BeaconId,
    /// Decoded characteristic value.
    pub value: i32,
    /// When the read completed.
    pub read_at: DateTime<Utc>,
}

/// Decode a characteristic payload: a 4-byte big-endian signed integer.
///
/// Any other width is a read error.
pub fn decode_reading(bytes: &[u8]) -> Result<i32, SessionFailure> {
    let raw: [u8; READING_WIDTH] = bytes.try_into().map_err(|_| {
        SessionFailure::ReadError(format!(
            "expected {READING_WIDTH} bytes, got {}",
            bytes.len()
        ))
    })?;
    Ok(i32::from_be_bytes(raw))
}

/// Why a session failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionFailure {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("service {0} not found")]
    ServiceNotFound(GattUuid),

    #[error("characteristic {0} not found")]
    CharacteristicNotFound(GattUuid),

    /// A stage exceeded its deadline.
    #[error("timed out during {0}")]
    ReadTimeout(SessionStage),

    #[error("read error: {0}")]
    ReadError(String),

    /// The session was cancelled by shutdown before finishing.
    #[error("aborted during {0}")]
    Aborted(SessionStage),
}

impl SessionFailure {
    /// Short tag used in logs and telemetry.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::ConnectionRefused(_) => "connection-refused",
            Self::ServiceNotFound(_) => "service-not-found",
            Self::CharacteristicNotFound(_) => "characteristic-not-found",
            Self::ReadTimeout(_) => "read-timeout",
            Self::ReadError(_) => "read-error",
            Self::Aborted(_) => "aborted",
        }
    }
}

/// Full session state, including terminal payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Idle,
    Connecting,
    ServiceDiscovery,
    CharacteristicDiscovery,
    Reading,
    Done(RawReading),
    Failed(SessionFailure),
}

impl SessionState {
    /// The payload-free stage of this state.
    pub fn stage(&self) -> SessionStage {
        match self {
            Self::Idle => SessionStage::Idle,
            Self::Connecting => SessionStage::Connecting,
            Self::ServiceDiscovery => SessionStage::ServiceDiscovery,
            Self::CharacteristicDiscovery => SessionStage::CharacteristicDiscovery,
            Self::Reading => SessionStage::Reading,
            Self::Done(_) => SessionStage::Done,
            Self::Failed(_) => SessionStage::Failed,
        }
    }

    /// Whether the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Failed(_))
    }
}

/// Payload-free mirror of [`SessionState`], cheap to copy into histories
/// and status tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStage {
    Idle,
    Connecting,
    ServiceDiscovery,
    CharacteristicDiscovery,
    Reading,
    Done,
    Failed,
}

impl fmt::Display for SessionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::ServiceDiscovery => "service discovery",
            Self::CharacteristicDiscovery => "characteristic discovery",
            Self::Reading => "reading",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Per-stage deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    pub connect: Duration,
    pub discovery: Duration,
    pub read: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_CONNECT_TIMEOUT,
            discovery: DEFAULT_DISCOVERY_TIMEOUT,
            read: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// GATT target of a session: which service and characteristic to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub service: GattUuid,
    pub characteristic: GattUuid,
}

/// Result of running a session to completion.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    /// Beacon the session served.
    pub beacon: BeaconId,
    /// Terminal state: the reading or the failure reason.
    pub result: Result<RawReading, SessionFailure>,
    /// Every stage entered, in order, ending with `Done` or `Failed`.
    pub history: Vec<SessionStage>,
}

impl SessionOutcome {
    /// The last error, if the session failed.
    pub fn last_error(&self) -> Option<&SessionFailure> {
        self.result.as_ref().err()
    }
}

/// Observer invoked on every stage transition.
pub type StageObserver = Box<dyn Fn(&BeaconId, SessionStage) + Send + Sync>;

/// One beacon's connect/discover/read state machine.
pub struct PeripheralSession {
    beacon: BeaconId,
    peripheral: PeripheralHandle,
    target: SessionTarget,
    timeouts: SessionTimeouts,
    state: SessionState,
    history: Vec<SessionStage>,
    observer: Option<StageObserver>,
}

impl PeripheralSession {
    /// Create an idle session for `peripheral`, identified as `beacon`.
    pub fn new(
        beacon: BeaconId,
        peripheral: PeripheralHandle,
        target: SessionTarget,
        timeouts: SessionTimeouts,
    ) -> Self {
        Self {
            beacon,
            peripheral,
            target,
            timeouts,
            state: SessionState::Idle,
            history: vec![SessionStage::Idle],
            observer: None,
        }
    }

    /// Invoke `observer` on every transition.
    pub fn with_observer(mut self, observer: StageObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Current state.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Beacon served by this session.
    pub fn beacon(&self) -> &BeaconId {
        &self.beacon
    }

    fn enter(&mut self, state: SessionState) {
        let stage = state.stage();
        debug!(beacon = %self.beacon, stage = %stage, "Session transition");
        self.history.push(stage);
        if let Some(observer) = &self.observer {
            observer(&self.beacon, stage);
        }
        self.state = state;
    }

    /// Run the session to a terminal state.
    ///
    /// The connection is always released before returning, whatever the
    /// outcome. Cancelling `cancel` fails the session with
    /// [`SessionFailure::Aborted`].
    pub async fn run(mut self, cancel: CancellationToken) -> SessionOutcome {
        let result = self.drive(&cancel).await;

        // Released before the terminal transition so a reader of the
        // terminal stage never sees a held connection.
        self.release().await;

        match &result {
            Ok(reading) => self.enter(SessionState::Done(reading.clone())),
            Err(failure) => {
                warn!(
                    beacon = %self.beacon,
                    reason = failure.tag(),
                    error = %failure,
                    "Session failed"
                );
                self.enter(SessionState::Failed(failure.clone()));
            }
        }

        SessionOutcome {
            beacon: self.beacon,
            result,
            history: self.history,
        }
    }

    async fn release(&self) {
        let deadline = self.timeouts.connect;
        if tokio::time::timeout(deadline, self.peripheral.disconnect())
            .await
            .is_err()
        {
            debug!(
                beacon = %self.beacon,
                deadline_ms = deadline.as_millis() as u64,
                "Disconnect did not complete, abandoning release"
            );
        }
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> Result<RawReading, SessionFailure> {
        let peripheral = self.peripheral.clone();

        // Connecting
        self.enter(SessionState::Connecting);
        let stage = SessionStage::Connecting;
        stage_step(stage, self.timeouts.connect, cancel, peripheral.connect())
            .await?
            .map_err(|e| map_peripheral_error(e, stage))?;

        // ServiceDiscovery
        self.enter(SessionState::ServiceDiscovery);
        let stage = SessionStage::ServiceDiscovery;
        let service = stage_step(
            stage,
            self.timeouts.discovery,
            cancel,
            peripheral.discover_service(&self.target.service),
        )
        .await?
        .map_err(|e| map_peripheral_error(e, stage))?;

        // CharacteristicDiscovery
        self.enter(SessionState::CharacteristicDiscovery);
        let stage = SessionStage::CharacteristicDiscovery;
        let characteristic = stage_step(
            stage,
            self.timeouts.discovery,
            cancel,
            peripheral.discover_characteristic(&service, &self.target.characteristic),
        )
        .await?
        .map_err(|e| map_peripheral_error(e, stage))?;

        // Reading
        self.enter(SessionState::Reading);
        let stage = SessionStage::Reading;
        let bytes = stage_step(stage, self.timeouts.read, cancel, peripheral.read(&characteristic))
            .await?
            .map_err(|e| map_peripheral_error(e, stage))?;
        let value = decode_reading(&bytes)?;

        Ok(RawReading {
            beacon: self.beacon.clone(),
            value,
            read_at: Utc::now(),
        })
    }
}

/// Await one stage under its deadline and the cancellation token.
async fn stage_step<T>(
    stage: SessionStage,
    deadline: Duration,
    cancel: &CancellationToken,
    op: impl std::future::Future<Output = T>,
) -> Result<T, SessionFailure> {
    tokio::select! {
        _ = cancel.cancelled() => Err(SessionFailure::Aborted(stage)),
        out = tokio::time::timeout(deadline, op) => {
            out.map_err(|_| SessionFailure::ReadTimeout(stage))
        }
    }
}

fn map_peripheral_error(err: PeripheralError, stage: SessionStage) -> SessionFailure {
    match err {
        PeripheralError::ConnectionRefused { reason, .. } => {
            SessionFailure::ConnectionRefused(reason)
        }
        PeripheralError::ServiceNotFound(uuid) => SessionFailure::ServiceNotFound(uuid),
        PeripheralError::CharacteristicNotFound(uuid) => {
            SessionFailure::CharacteristicNotFound(uuid)
        }
        PeripheralError::ReadFailed(msg) => SessionFailure::ReadError(msg),
        other if stage == SessionStage::Connecting => {
            SessionFailure::ConnectionRefused(other.to_string())
        }
        other => SessionFailure::ReadError(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peripheral::{SimulatedBeacon, SimulatedFault};
    use std::sync::Arc;

    const SERVICE: &str = "12345678-1234-5678-1234-56789abcdef0";
    const CHAR: &str = "abcdef12-3456-7890-abcd-ef1234567890";

    fn target() -> SessionTarget {
        SessionTarget {
            service: SERVICE.into(),
            characteristic: CHAR.into(),
        }
    }

    fn simulated(value: i32) -> Arc<SimulatedBeacon> {
        Arc::new(SimulatedBeacon::new("AA:01", "alpha", SERVICE.into(), CHAR.into()).with_value(value))
    }

    fn session(beacon: &Arc<SimulatedBeacon>) -> PeripheralSession {
        let handle: PeripheralHandle = beacon.clone();
        PeripheralSession::new(
            BeaconId::new("alpha"),
            handle,
            target(),
            SessionTimeouts::default(),
        )
    }

    use SessionStage::*;

    #[test]
    fn test_decode_reading_big_endian() {
        assert_eq!(decode_reading(&[0, 0, 0xEF, 0x32]).unwrap(), 61_234);
        assert_eq!(decode_reading(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap(), -1);
        assert_eq!(decode_reading(&[0x80, 0, 0, 0]).unwrap(), i32::MIN);
    }

    #[test]
    fn test_decode_reading_wrong_width() {
        assert!(matches!(
            decode_reading(&[0, 1, 2]),
            Err(SessionFailure::ReadError(_))
        ));
        assert!(matches!(
            decode_reading(&[0, 1, 2, 3, 4]),
            Err(SessionFailure::ReadError(_))
        ));
    }

    #[tokio::test]
    async fn test_happy_path_visits_every_stage() {
        let beacon = simulated(61_234);
        let outcome = session(&beacon).run(CancellationToken::new()).await;

        let reading = outcome.result.as_ref().unwrap();
        assert_eq!(reading.value, 61_234);
        assert_eq!(reading.beacon.as_str(), "alpha");
        assert_eq!(
            outcome.history,
            vec![
                Idle,
                Connecting,
                ServiceDiscovery,
                CharacteristicDiscovery,
                Reading,
                Done
            ]
        );
        assert!(!beacon.is_connected());
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let beacon = simulated(1);
        beacon.fail_next(SimulatedFault::RefuseConnection);

        let outcome = session(&beacon).run(CancellationToken::new()).await;
        assert!(matches!(
            outcome.last_error(),
            Some(SessionFailure::ConnectionRefused(_))
        ));
        assert_eq!(outcome.history, vec![Idle, Connecting, Failed]);
    }

    #[tokio::test]
    async fn test_service_not_found() {
        let beacon = simulated(1);
        beacon.fail_next(SimulatedFault::MissingService);

        let outcome = session(&beacon).run(CancellationToken::new()).await;
        assert_eq!(outcome.last_error().map(|e| e.tag()), Some("service-not-found"));
        assert_eq!(outcome.history, vec![Idle, Connecting, ServiceDiscovery, Failed]);
        assert!(!beacon.is_connected());
    }

    #[tokio::test]
    async fn test_characteristic_not_found() {
        let beacon = simulated(1);
        beacon.fail_next(SimulatedFault::MissingCharacteristic);

        let outcome = session(&beacon).run(CancellationToken::new()).await;
        assert_eq!(
            outcome.last_error().map(|e| e.tag()),
            Some("characteristic-not-found")
        );
        assert_eq!(
            outcome.history,
            vec![Idle, Connecting, ServiceDiscovery, CharacteristicDiscovery, Failed]
        );
    }

    #[tokio::test]
    async fn test_read_error() {
        let beacon = simulated(1);
        beacon.fail_next(SimulatedFault::ReadError);

        let outcome = session(&beacon).run(CancellationToken::new()).await;
        assert_eq!(outcome.last_error().map(|e| e.tag()), Some("read-error"));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_read_error() {
        let beacon = simulated(1);
        beacon.set_raw_payload(vec![1, 2]);

        let outcome = session(&beacon).run(CancellationToken::new()).await;
        assert!(matches!(
            outcome.last_error(),
            Some(SessionFailure::ReadError(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_read_times_out_and_releases() {
        let beacon = simulated(1);
        beacon.fail_next(SimulatedFault::SlowRead(Duration::from_secs(60)));

        let outcome = session(&beacon).run(CancellationToken::new()).await;
        assert_eq!(
            outcome.last_error(),
            Some(&SessionFailure::ReadTimeout(SessionStage::Reading))
        );
        assert!(!beacon.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_connect_times_out() {
        let beacon = simulated(1);
        beacon.fail_next(SimulatedFault::StallConnect);

        let outcome = session(&beacon).run(CancellationToken::new()).await;
        assert_eq!(
            outcome.last_error(),
            Some(&SessionFailure::ReadTimeout(SessionStage::Connecting))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_session() {
        let beacon = simulated(1);
        beacon.fail_next(SimulatedFault::StallConnect);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = session(&beacon).run(cancel).await;
        assert_eq!(
            outcome.last_error(),
            Some(&SessionFailure::Aborted(SessionStage::Connecting))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_disconnect_still_reaches_done() {
        let beacon = simulated(42);
        beacon.fail_next(SimulatedFault::StallDisconnect);

        let outcome = tokio::time::timeout(
            Duration::from_secs(3600),
            session(&beacon).run(CancellationToken::new()),
        )
        .await
        .expect("session never reached a terminal state");

        assert_eq!(outcome.result.unwrap().value, 42);
        assert_eq!(outcome.history.last(), Some(&Done));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_session_on_unresponsive_radio_fails() {
        let beacon = simulated(1);
        beacon.fail_next(SimulatedFault::Unresponsive);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let outcome = tokio::time::timeout(Duration::from_secs(3600), session(&beacon).run(cancel))
            .await
            .expect("session never reached a terminal state");

        assert_eq!(
            outcome.last_error(),
            Some(&SessionFailure::Aborted(SessionStage::Connecting))
        );
        assert_eq!(outcome.history.last(), Some(&Failed));
        assert!(started.elapsed() <= Duration::from_secs(5) + DEFAULT_CONNECT_TIMEOUT);
    }

    #[tokio::test]
    async fn test_observer_sees_transitions() {
        let beacon = simulated(7);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let outcome = session(&beacon)
            .with_observer(Box::new(move |_, stage| sink.lock().push(stage)))
            .run(CancellationToken::new())
            .await;

        assert!(outcome.result.is_ok());
        assert_eq!(seen.lock().last(), Some(&Done));
        assert_eq!(seen.lock().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_sessions_independent() {
        let slow = simulated(1);
        slow.fail_next(SimulatedFault::SlowRead(Duration::from_secs(60)));
        let fast = Arc::new(
            SimulatedBeacon::new("AA:02", "bravo", SERVICE.into(), CHAR.into()).with_value(2),
        );

        let slow_task = tokio::spawn(session(&slow).run(CancellationToken::new()));
        let fast_handle: PeripheralHandle = fast.clone();
        let fast_outcome = PeripheralSession::new(
            BeaconId::new("bravo"),
            fast_handle,
            target(),
            SessionTimeouts::default(),
        )
        .run(CancellationToken::new())
        .await;

        assert_eq!(fast_outcome.result.unwrap().value, 2);
        assert!(slow_task.await.unwrap().result.is_err());
    }
}
