//! Peripheral radio abstraction.
//!
//! The radio stack is an external collaborator. This module defines the small
//! surface beaconfix needs from it and nothing more:
//!
//! - [`PeripheralAdapter`] - starts/stops a scan and yields peripherals
//! - [`Peripheral`] - connect, discover one service, discover one
//!   characteristic, read it
//!
//! Both traits use boxed futures so they can be used as trait objects
//! (`Arc<dyn Peripheral>`), which lets the pipeline run unchanged against the
//! [`SimulatedAdapter`] in tests and against real hardware in production.
//!
//! # Backends
//!
//! - [`SimulatedAdapter`] - in-process beacons with fault injection
//! - `BtleAdapter` - real Bluetooth LE via `btleplug` (feature `bluetooth`)

#[cfg(feature = "bluetooth")]
mod btle;
mod simulated;

#[cfg(feature = "bluetooth")]
pub use btle::BtleAdapter;
pub use simulated::{SimulatedAdapter, SimulatedBeacon, SimulatedFault};

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Shared handle to a discovered peripheral.
pub type PeripheralHandle = Arc<dyn Peripheral>;

/// A GATT service or characteristic UUID.
///
/// Stored as a lowercase string so textual UUIDs from configuration and from
/// the radio stack compare equal regardless of case.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GattUuid(String);

impl GattUuid {
    /// Create a UUID from its textual form.
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().to_ascii_lowercase())
    }

    /// Textual form (lowercase).
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GattUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GattUuid {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// What a peripheral announced when it was discovered.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    /// Hardware (or platform) address.
    pub address: String,
    /// Advertised local name, if any.
    pub local_name: Option<String>,
    /// Advertised service UUIDs.
    pub services: Vec<GattUuid>,
    /// Received signal strength of the advertisement (dBm).
    pub rssi: Option<i16>,
}

impl Advertisement {
    /// Create an advertisement with only an address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            local_name: None,
            services: Vec::new(),
            rssi: None,
        }
    }

    /// Set the advertised local name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    /// Add an advertised service.
    pub fn with_service(mut self, service: GattUuid) -> Self {
        self.services.push(service);
        self
    }

    /// Set the advertisement signal strength.
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Whether this peripheral advertises the given service.
    pub fn advertises_service(&self, service: &GattUuid) -> bool {
        self.services.iter().any(|s| s == service)
    }

    /// Best human-readable label: name if advertised, otherwise address.
    pub fn label(&self) -> &str {
        self.local_name.as_deref().unwrap_or(&self.address)
    }
}

/// Opaque handle to a discovered service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    pub(crate) uuid: GattUuid,
}

impl ServiceHandle {
    pub(crate) fn new(uuid: GattUuid) -> Self {
        Self { uuid }
    }

    /// UUID of the discovered service.
    pub fn uuid(&self) -> &GattUuid {
        &self.uuid
    }
}

/// Opaque handle to a discovered characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicHandle {
    pub(crate) service: GattUuid,
    pub(crate) uuid: GattUuid,
}

impl CharacteristicHandle {
    pub(crate) fn new(service: GattUuid, uuid: GattUuid) -> Self {
        Self { service, uuid }
    }

    /// UUID of the service owning this characteristic.
    pub fn service(&self) -> &GattUuid {
        &self.service
    }

    /// UUID of the characteristic.
    pub fn uuid(&self) -> &GattUuid {
        &self.uuid
    }
}

/// Errors reported by the radio stack.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PeripheralError {
    /// No usable adapter (powered off, missing, permission denied).
    #[error("adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// The peripheral refused or dropped the connection.
    #[error("connection to {address} refused: {reason}")]
    ConnectionRefused { address: String, reason: String },

    /// The requested service is not exposed by the peripheral.
    #[error("service {0} not found")]
    ServiceNotFound(GattUuid),

    /// The requested characteristic is not exposed by the service.
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(GattUuid),

    /// Reading the characteristic failed.
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// The operation requires a connection that is not established.
    #[error("peripheral {0} is not connected")]
    NotConnected(String),
}

/// A discoverable peripheral exposing one readable characteristic.
///
/// Each method is one suspension point of the session state machine; the
/// caller owns timeouts, so implementations may wait as long as the radio
/// stack requires.
pub trait Peripheral: Send + Sync {
    /// Advertisement captured at discovery time.
    fn advertisement(&self) -> &Advertisement;

    /// Establish a connection.
    fn connect(&self) -> BoxFuture<'_, Result<(), PeripheralError>>;

    /// Discover a service by UUID.
    fn discover_service(
        &self,
        service: &GattUuid,
    ) -> BoxFuture<'_, Result<ServiceHandle, PeripheralError>>;

    /// Discover a characteristic within a previously discovered service.
    fn discover_characteristic(
        &self,
        service: &ServiceHandle,
        characteristic: &GattUuid,
    ) -> BoxFuture<'_, Result<CharacteristicHandle, PeripheralError>>;

    /// Read the current characteristic value.
    fn read(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> BoxFuture<'_, Result<Vec<u8>, PeripheralError>>;

    /// Release the connection. Best effort, never fails.
    fn disconnect(&self) -> BoxFuture<'_, ()>;
}

/// A radio adapter able to scan for peripherals.
pub trait PeripheralAdapter: Send + Sync {
    /// Start scanning for peripherals advertising `service`.
    ///
    /// Every advertisement seen is forwarded on the returned channel, which
    /// may include duplicates and non-matching peripherals; filtering is the
    /// scanner's job. The channel closes when the adapter stops scanning.
    fn start_scan(
        &self,
        service: &GattUuid,
    ) -> BoxFuture<'_, Result<mpsc::UnboundedReceiver<PeripheralHandle>, PeripheralError>>;

    /// Stop an active scan. Best effort.
    fn stop_scan(&self) -> BoxFuture<'_, ()>;
}
