//! In-process simulated beacons.
//!
//! [`SimulatedBeacon`] plays the role of the peripheral-side GATT server: it
//! advertises one service and exposes one characteristic whose value is a
//! 4-byte big-endian signed integer, exactly as the hardware encoder writes
//! it. Faults can be injected per session attempt so the state machine's
//! failure paths can be exercised without radio hardware.
//!
//! # Example
//!
//! ```ignore
//! use beaconfix::peripheral::{SimulatedAdapter, SimulatedBeacon, SimulatedFault};
//!
//! let beacon = SimulatedBeacon::new("AA:01", "alpha", service, characteristic)
//!     .with_value(61_234);
//! beacon.fail_next(SimulatedFault::RefuseConnection);
//!
//! let adapter = SimulatedAdapter::new(vec![beacon]);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    Advertisement, BoxFuture, CharacteristicHandle, GattUuid, Peripheral, PeripheralAdapter,
    PeripheralError, PeripheralHandle, ServiceHandle,
};

/// Default delay between simulated advertisements.
pub const DEFAULT_ADVERTISEMENT_INTERVAL: Duration = Duration::from_millis(20);

/// Encode a value the way the peripheral-side encoder does.
pub fn encode_value(value: i32) -> [u8; 4] {
    value.to_be_bytes()
}

/// A fault applied to one session attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedFault {
    /// `connect` fails.
    RefuseConnection,
    /// `connect` never completes.
    StallConnect,
    /// The configured service is not exposed.
    MissingService,
    /// The configured characteristic is not exposed.
    MissingCharacteristic,
    /// `read` fails.
    ReadError,
    /// `read` completes only after the given delay.
    SlowRead(Duration),
    /// `disconnect` never completes.
    StallDisconnect,
    /// Neither `connect` nor `disconnect` ever completes.
    Unresponsive,
}

/// A simulated beacon peripheral.
pub struct SimulatedBeacon {
    advertisement: Advertisement,
    service: GattUuid,
    characteristic: GattUuid,
    payload: Mutex<Vec<u8>>,
    /// Faults consumed one per connection attempt.
    queued_faults: Mutex<VecDeque<SimulatedFault>>,
    /// Fault applied whenever the queue is empty.
    persistent_fault: Mutex<Option<SimulatedFault>>,
    /// Fault in effect for the current connection.
    active_fault: Mutex<Option<SimulatedFault>>,
    connected: AtomicBool,
    connections: AtomicU64,
    reads: AtomicU64,
}

impl SimulatedBeacon {
    /// Create a beacon advertising `service` and exposing `characteristic`.
    pub fn new(
        address: &str,
        name: &str,
        service: GattUuid,
        characteristic: GattUuid,
    ) -> Self {
        let advertisement = Advertisement::new(address)
            .with_name(name)
            .with_service(service.clone());
        Self {
            advertisement,
            service,
            characteristic,
            payload: Mutex::new(encode_value(0).to_vec()),
            queued_faults: Mutex::new(VecDeque::new()),
            persistent_fault: Mutex::new(None),
            active_fault: Mutex::new(None),
            connected: AtomicBool::new(false),
            connections: AtomicU64::new(0),
            reads: AtomicU64::new(0),
        }
    }

    /// Set the characteristic value.
    pub fn with_value(self, value: i32) -> Self {
        self.set_value(value);
        self
    }

    /// Set the advertisement signal strength.
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.advertisement.rssi = Some(rssi);
        self
    }

    /// Update the characteristic value.
    pub fn set_value(&self, value: i32) {
        *self.payload.lock() = encode_value(value).to_vec();
    }

    /// Replace the raw characteristic bytes (for malformed payloads).
    pub fn set_raw_payload(&self, bytes: Vec<u8>) {
        *self.payload.lock() = bytes;
    }

    /// Apply `fault` to the next connection attempt only.
    pub fn fail_next(&self, fault: SimulatedFault) {
        self.queued_faults.lock().push_back(fault);
    }

    /// Apply `fault` to every connection attempt until cleared.
    pub fn set_fault(&self, fault: Option<SimulatedFault>) {
        *self.persistent_fault.lock() = fault;
    }

    /// Whether a connection is currently held.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of connection attempts so far.
    pub fn connection_attempts(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }

    /// Number of successful reads so far.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    fn fault(&self) -> Option<SimulatedFault> {
        *self.active_fault.lock()
    }
}

impl Peripheral for SimulatedBeacon {
    fn advertisement(&self) -> &Advertisement {
        &self.advertisement
    }

    fn connect(&self) -> BoxFuture<'_, Result<(), PeripheralError>> {
        Box::pin(async move {
            self.connections.fetch_add(1, Ordering::SeqCst);
            let fault = self
                .queued_faults
                .lock()
                .pop_front()
                .or(*self.persistent_fault.lock());
            *self.active_fault.lock() = fault;

            match fault {
                Some(SimulatedFault::RefuseConnection) => Err(PeripheralError::ConnectionRefused {
                    address: self.advertisement.address.clone(),
                    reason: "simulated refusal".to_string(),
                }),
                Some(SimulatedFault::StallConnect | SimulatedFault::Unresponsive) => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
                _ => {
                    self.connected.store(true, Ordering::SeqCst);
                    debug!(address = %self.advertisement.address, "Simulated beacon connected");
                    Ok(())
                }
            }
        })
    }

    fn discover_service(
        &self,
        service: &GattUuid,
    ) -> BoxFuture<'_, Result<ServiceHandle, PeripheralError>> {
        let service = service.clone();
        Box::pin(async move {
            if !self.is_connected() {
                return Err(PeripheralError::NotConnected(
                    self.advertisement.address.clone(),
                ));
            }
            if self.fault() == Some(SimulatedFault::MissingService) || service != self.service {
                return Err(PeripheralError::ServiceNotFound(service));
            }
            Ok(ServiceHandle::new(service))
        })
    }

    fn discover_characteristic(
        &self,
        service: &ServiceHandle,
        characteristic: &GattUuid,
    ) -> BoxFuture<'_, Result<CharacteristicHandle, PeripheralError>> {
        let service = service.uuid.clone();
        let characteristic = characteristic.clone();
        Box::pin(async move {
            if self.fault() == Some(SimulatedFault::MissingCharacteristic)
                || characteristic != self.characteristic
            {
                return Err(PeripheralError::CharacteristicNotFound(characteristic));
            }
            Ok(CharacteristicHandle::new(service, characteristic))
        })
    }

    fn read(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> BoxFuture<'_, Result<Vec<u8>, PeripheralError>> {
        let uuid = characteristic.uuid.clone();
        Box::pin(async move {
            match self.fault() {
                Some(SimulatedFault::ReadError) => {
                    return Err(PeripheralError::ReadFailed(
                        "simulated read error".to_string(),
                    ))
                }
                Some(SimulatedFault::SlowRead(delay)) => tokio::time::sleep(delay).await,
                _ => {}
            }
            if uuid != self.characteristic {
                return Err(PeripheralError::CharacteristicNotFound(uuid));
            }
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.payload.lock().clone())
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if matches!(
                self.fault(),
                Some(SimulatedFault::StallDisconnect | SimulatedFault::Unresponsive)
            ) {
                std::future::pending::<()>().await;
            }
            self.connected.store(false, Ordering::SeqCst);
            *self.active_fault.lock() = None;
        })
    }
}

/// An adapter that "discovers" a fixed list of simulated beacons.
///
/// Each scan announces every beacon `repeat` times (to exercise duplicate
/// suppression) and then keeps the scan open until `stop_scan` is called,
/// like an open-ended radio scan.
pub struct SimulatedAdapter {
    beacons: Vec<Arc<SimulatedBeacon>>,
    available: bool,
    repeat: usize,
    interval: Duration,
    scan: Mutex<Option<CancellationToken>>,
}

impl SimulatedAdapter {
    /// Create an adapter announcing the given beacons.
    pub fn new(beacons: Vec<SimulatedBeacon>) -> Self {
        Self::from_shared(beacons.into_iter().map(Arc::new).collect())
    }

    /// Create an adapter from beacons the caller keeps handles to.
    pub fn from_shared(beacons: Vec<Arc<SimulatedBeacon>>) -> Self {
        Self {
            beacons,
            available: true,
            repeat: 1,
            interval: DEFAULT_ADVERTISEMENT_INTERVAL,
            scan: Mutex::new(None),
        }
    }

    /// An adapter that reports itself unavailable.
    pub fn unavailable() -> Self {
        let mut adapter = Self::from_shared(Vec::new());
        adapter.available = false;
        adapter
    }

    /// Announce each beacon this many times per scan.
    pub fn with_repeat(mut self, repeat: usize) -> Self {
        self.repeat = repeat.max(1);
        self
    }

    /// Delay between announcements.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Shared handles to the simulated beacons.
    pub fn beacons(&self) -> &[Arc<SimulatedBeacon>] {
        &self.beacons
    }
}

impl PeripheralAdapter for SimulatedAdapter {
    fn start_scan(
        &self,
        _service: &GattUuid,
    ) -> BoxFuture<'_, Result<mpsc::UnboundedReceiver<PeripheralHandle>, PeripheralError>> {
        Box::pin(async move {
            if !self.available {
                return Err(PeripheralError::AdapterUnavailable(
                    "simulated adapter is powered off".to_string(),
                ));
            }

            let (tx, rx) = mpsc::unbounded_channel();
            let stop = CancellationToken::new();
            if let Some(previous) = self.scan.lock().replace(stop.clone()) {
                previous.cancel();
            }

            let beacons = self.beacons.clone();
            let repeat = self.repeat;
            let interval = self.interval;
            tokio::spawn(async move {
                for _ in 0..repeat {
                    for beacon in &beacons {
                        let handle: PeripheralHandle = beacon.clone();
                        if tx.send(handle).is_err() {
                            return;
                        }
                        tokio::select! {
                            _ = stop.cancelled() => return,
                            _ = tokio::time::sleep(interval) => {}
                        }
                    }
                }
                // Open-ended: hold the channel until the scan is stopped.
                stop.cancelled().await;
            });

            Ok(rx)
        })
    }

    fn stop_scan(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(stop) = self.scan.lock().take() {
                stop.cancel();
            }
        })
    }
}
