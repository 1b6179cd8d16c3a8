//! Bluetooth LE backend built on `btleplug`.
//!
//! Uses the first adapter reported by the platform manager. Discovery events
//! are turned into [`BtlePeripheral`] handles carrying the advertisement
//! properties seen at discovery time.

use std::sync::Arc;

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    Advertisement, BoxFuture, CharacteristicHandle, GattUuid, Peripheral, PeripheralAdapter,
    PeripheralError, PeripheralHandle, ServiceHandle,
};

fn parse_uuid(uuid: &GattUuid) -> Result<Uuid, PeripheralError> {
    Uuid::parse_str(uuid.as_str())
        .map_err(|e| PeripheralError::AdapterUnavailable(format!("invalid uuid {uuid}: {e}")))
}

/// Real Bluetooth LE adapter.
pub struct BtleAdapter {
    central: Adapter,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl BtleAdapter {
    /// Open the first Bluetooth adapter on this host.
    pub async fn open() -> Result<Self, PeripheralError> {
        let manager = Manager::new()
            .await
            .map_err(|e| PeripheralError::AdapterUnavailable(e.to_string()))?;
        let central = manager
            .adapters()
            .await
            .map_err(|e| PeripheralError::AdapterUnavailable(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                PeripheralError::AdapterUnavailable("no Bluetooth adapter found".to_string())
            })?;

        Ok(Self {
            central,
            forwarder: Mutex::new(None),
        })
    }
}

impl PeripheralAdapter for BtleAdapter {
    fn start_scan(
        &self,
        service: &GattUuid,
    ) -> BoxFuture<'_, Result<mpsc::UnboundedReceiver<PeripheralHandle>, PeripheralError>> {
        let service = service.clone();
        Box::pin(async move {
            let uuid = parse_uuid(&service)?;
            let mut events = self
                .central
                .events()
                .await
                .map_err(|e| PeripheralError::AdapterUnavailable(e.to_string()))?;
            self.central
                .start_scan(ScanFilter {
                    services: vec![uuid],
                })
                .await
                .map_err(|e| PeripheralError::AdapterUnavailable(e.to_string()))?;

            let (tx, rx) = mpsc::unbounded_channel();
            let central = self.central.clone();
            let handle = tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    let id = match event {
                        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                        _ => continue,
                    };
                    let peripheral = match central.peripheral(&id).await {
                        Ok(p) => p,
                        Err(e) => {
                            debug!(error = %e, "Discovered peripheral vanished");
                            continue;
                        }
                    };
                    let advertisement = match peripheral.properties().await {
                        Ok(Some(props)) => {
                            let mut adv = Advertisement::new(props.address.to_string());
                            adv.local_name = props.local_name;
                            adv.rssi = props.rssi;
                            adv.services = props
                                .services
                                .iter()
                                .map(|u| GattUuid::new(&u.to_string()))
                                .collect();
                            adv
                        }
                        Ok(None) => continue,
                        Err(e) => {
                            debug!(error = %e, "Failed to read peripheral properties");
                            continue;
                        }
                    };
                    let handle: PeripheralHandle = Arc::new(BtlePeripheral {
                        inner: peripheral,
                        advertisement,
                        characteristic: Mutex::new(None),
                    });
                    if tx.send(handle).is_err() {
                        break;
                    }
                }
            });

            if let Some(previous) = self.forwarder.lock().replace(handle) {
                previous.abort();
            }
            Ok(rx)
        })
    }

    fn stop_scan(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(e) = self.central.stop_scan().await {
                warn!(error = %e, "Failed to stop Bluetooth scan");
            }
            if let Some(forwarder) = self.forwarder.lock().take() {
                forwarder.abort();
            }
        })
    }
}

/// A peripheral discovered by [`BtleAdapter`].
pub struct BtlePeripheral {
    inner: PlatformPeripheral,
    advertisement: Advertisement,
    characteristic: Mutex<Option<Characteristic>>,
}

impl Peripheral for BtlePeripheral {
    fn advertisement(&self) -> &Advertisement {
        &self.advertisement
    }

    fn connect(&self) -> BoxFuture<'_, Result<(), PeripheralError>> {
        Box::pin(async move {
            self.inner
                .connect()
                .await
                .map_err(|e| PeripheralError::ConnectionRefused {
                    address: self.advertisement.address.clone(),
                    reason: e.to_string(),
                })
        })
    }

    fn discover_service(
        &self,
        service: &GattUuid,
    ) -> BoxFuture<'_, Result<ServiceHandle, PeripheralError>> {
        let service = service.clone();
        Box::pin(async move {
            let uuid = parse_uuid(&service)?;
            self.inner
                .discover_services()
                .await
                .map_err(|e| PeripheralError::ReadFailed(e.to_string()))?;
            if self.inner.services().iter().any(|s| s.uuid == uuid) {
                Ok(ServiceHandle::new(service))
            } else {
                Err(PeripheralError::ServiceNotFound(service))
            }
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
            let service_uuid = parse_uuid(&service)?;
            let char_uuid = parse_uuid(&characteristic)?;
            let found = self
                .inner
                .services()
                .into_iter()
                .filter(|s| s.uuid == service_uuid)
                .flat_map(|s| s.characteristics.into_iter())
                .find(|c| c.uuid == char_uuid);

            match found {
                Some(c) => {
                    *self.characteristic.lock() = Some(c);
                    Ok(CharacteristicHandle::new(service, characteristic))
                }
                None => Err(PeripheralError::CharacteristicNotFound(characteristic)),
            }
        })
    }

    fn read(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> BoxFuture<'_, Result<Vec<u8>, PeripheralError>> {
        let uuid = characteristic.uuid.clone();
        Box::pin(async move {
            let target = self
                .characteristic
                .lock()
                .clone()
                .ok_or(PeripheralError::CharacteristicNotFound(uuid))?;
            self.inner
                .read(&target)
                .await
                .map_err(|e| PeripheralError::ReadFailed(e.to_string()))
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(e) = self.inner.disconnect().await {
                debug!(address = %self.advertisement.address, error = %e, "Disconnect failed");
            }
        })
    }
}
