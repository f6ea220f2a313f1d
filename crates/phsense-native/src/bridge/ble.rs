//! btleplug implementation of the platform seam.
//!
//! The first adapter reported by the OS is used. Its `CentralEvent` stream
//! is pumped into [`PlatformEvent`]s by a background task; peripherals seen
//! there are cached by id so later commands can reach them. Each subscribed
//! peripheral gets its own notification pump.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use phsense_core::types::DeviceId;

use super::platform::{
    AdapterState, Advertisement, BlePlatform, DiscoveredCharacteristic, PlatformError,
    PlatformEvent, PlatformResult,
};

type PeripheralCache = Arc<RwLock<HashMap<DeviceId, Peripheral>>>;

/// BLE platform backed by the host Bluetooth stack.
pub struct BtleplugPlatform {
    adapter: Adapter,
    peripherals: PeripheralCache,
    central_pump: Mutex<Option<JoinHandle<()>>>,
    notification_pumps: Mutex<HashMap<DeviceId, JoinHandle<()>>>,
    events: mpsc::Sender<PlatformEvent>,
    receiver: Mutex<Option<mpsc::Receiver<PlatformEvent>>>,
}

impl BtleplugPlatform {
    /// Open the first Bluetooth adapter and start listening to it.
    ///
    /// # Errors
    ///
    /// [`PlatformError::Unavailable`] if the OS exposes no adapter or the
    /// adapter event stream cannot be opened.
    pub async fn new(event_capacity: usize) -> PlatformResult<Self> {
        let manager = Manager::new().await.map_err(unavailable)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(unavailable)?
            .into_iter()
            .next()
            .ok_or_else(|| PlatformError::Unavailable("No Bluetooth adapter found".into()))?;

        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter {info}"),
            Err(e) => debug!("Adapter info unavailable: {e}"),
        }

        let (events, receiver) = mpsc::channel(event_capacity.max(1));
        let peripherals = PeripheralCache::default();
        let central_events = adapter.events().await.map_err(unavailable)?;

        let pump = tokio::spawn(pump_central_events(
            adapter.clone(),
            central_events,
            Arc::clone(&peripherals),
            events.clone(),
        ));

        Ok(Self {
            adapter,
            peripherals,
            central_pump: Mutex::new(Some(pump)),
            notification_pumps: Mutex::new(HashMap::new()),
            events,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    fn pumps(&self) -> MutexGuard<'_, HashMap<DeviceId, JoinHandle<()>>> {
        self.notification_pumps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn peripheral(&self, id: &DeviceId) -> PlatformResult<Peripheral> {
        if let Some(peripheral) = self.peripherals.read().await.get(id) {
            return Ok(peripheral.clone());
        }

        // Not seen through the event stream yet; ask the adapter directly
        let found = self
            .adapter
            .peripherals()
            .await
            .map_err(transport)?
            .into_iter()
            .find(|p| p.id().to_string() == id.as_str())
            .ok_or_else(|| PlatformError::UnknownPeripheral(id.clone()))?;

        self.peripherals.write().await.insert(id.clone(), found.clone());
        Ok(found)
    }

    async fn linked(&self, id: &DeviceId) -> PlatformResult<Peripheral> {
        let peripheral = self.peripheral(id).await?;
        if peripheral.is_connected().await.map_err(transport)? {
            Ok(peripheral)
        } else {
            Err(PlatformError::NotConnected(id.clone()))
        }
    }
}

#[async_trait]
impl BlePlatform for BtleplugPlatform {
    async fn adapter_state(&self) -> PlatformResult<AdapterState> {
        self.adapter
            .adapter_state()
            .await
            .map(adapter_state)
            .map_err(transport)
    }

    async fn start_scan(&self, services: Vec<Uuid>) -> PlatformResult<()> {
        self.adapter
            .start_scan(ScanFilter { services })
            .await
            .map_err(transport)
    }

    async fn stop_scan(&self) -> PlatformResult<()> {
        self.adapter.stop_scan().await.map_err(transport)
    }

    async fn connect(&self, id: &DeviceId) -> PlatformResult<()> {
        let peripheral = self.peripheral(id).await?;
        peripheral.connect().await.map_err(transport)
    }

    async fn discover_services(&self, id: &DeviceId) -> PlatformResult<Vec<DiscoveredCharacteristic>> {
        let peripheral = self.linked(id).await?;
        peripheral.discover_services().await.map_err(transport)?;

        let characteristics = peripheral
            .services()
            .iter()
            .flat_map(|service| {
                service.characteristics.iter().map(|c| DiscoveredCharacteristic {
                    service: service.uuid,
                    uuid: c.uuid,
                })
            })
            .collect();
        Ok(characteristics)
    }

    async fn subscribe(&self, id: &DeviceId, characteristic: Uuid) -> PlatformResult<()> {
        let peripheral = self.linked(id).await?;
        let target = find_characteristic(&peripheral, characteristic)?;
        peripheral.subscribe(&target).await.map_err(transport)?;

        let stream = peripheral.notifications().await.map_err(transport)?;
        let pump = tokio::spawn(pump_notifications(id.clone(), stream, self.events.clone()));
        if let Some(previous) = self.pumps().insert(id.clone(), pump) {
            previous.abort();
        }
        Ok(())
    }

    async fn write(&self, id: &DeviceId, characteristic: Uuid, payload: &[u8]) -> PlatformResult<()> {
        let peripheral = self.linked(id).await?;
        let target = find_characteristic(&peripheral, characteristic)?;
        peripheral
            .write(&target, payload, WriteType::WithResponse)
            .await
            .map_err(transport)
    }

    async fn disconnect(&self, id: &DeviceId) -> PlatformResult<()> {
        if let Some(pump) = self.pumps().remove(id) {
            pump.abort();
        }

        let peripheral = self.peripheral(id).await?;
        if peripheral.is_connected().await.map_err(transport)? {
            peripheral.disconnect().await.map_err(transport)?;
        }
        Ok(())
    }

    async fn is_connected(&self, id: &DeviceId) -> PlatformResult<bool> {
        let peripheral = self.peripheral(id).await?;
        peripheral.is_connected().await.map_err(transport)
    }

    fn take_events(&self) -> Option<mpsc::Receiver<PlatformEvent>> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn shutdown(&self) {
        for (_, pump) in self.pumps().drain() {
            pump.abort();
        }
        let central = self
            .central_pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(central) = central {
            central.abort();
        }
    }
}

// ============================================================================
// Event Pumps
// ============================================================================

async fn pump_central_events<S>(
    adapter: Adapter,
    mut central_events: S,
    peripherals: PeripheralCache,
    events: mpsc::Sender<PlatformEvent>,
) where
    S: tokio_stream::Stream<Item = CentralEvent> + Unpin,
{
    while let Some(event) = central_events.next().await {
        let translated = match event {
            CentralEvent::DeviceDiscovered(pid) | CentralEvent::DeviceUpdated(pid) => {
                match advertisement(&adapter, &pid, &peripherals).await {
                    Some(advertisement) => PlatformEvent::Discovered(advertisement),
                    None => continue,
                }
            }
            CentralEvent::DeviceDisconnected(pid) => {
                PlatformEvent::Disconnected(DeviceId::new(pid.to_string()))
            }
            CentralEvent::StateUpdate(state) => PlatformEvent::StateChanged(adapter_state(state)),
            _ => continue,
        };

        if events.send(translated).await.is_err() {
            debug!("Platform event receiver dropped, stopping adapter pump");
            return;
        }
    }

    warn!("Adapter event stream ended");
    let _ = events
        .send(PlatformEvent::ScanFailed("adapter event stream ended".into()))
        .await;
}

async fn advertisement(
    adapter: &Adapter,
    pid: &PeripheralId,
    peripherals: &PeripheralCache,
) -> Option<Advertisement> {
    let peripheral = match adapter.peripheral(pid).await {
        Ok(p) => p,
        Err(e) => {
            debug!("Discovered peripheral {pid:?} vanished: {e}");
            return None;
        }
    };
    let properties = match peripheral.properties().await {
        Ok(Some(properties)) => properties,
        Ok(None) => return None,
        Err(e) => {
            debug!("No properties for {pid:?}: {e}");
            return None;
        }
    };

    let id = DeviceId::new(peripheral.id().to_string());
    peripherals.write().await.insert(id.clone(), peripheral);

    Some(Advertisement {
        id,
        name: properties.local_name,
        rssi: properties.rssi,
        services: properties.services,
    })
}

async fn pump_notifications<S>(device_id: DeviceId, mut stream: S, events: mpsc::Sender<PlatformEvent>)
where
    S: tokio_stream::Stream<Item = btleplug::api::ValueNotification> + Unpin,
{
    while let Some(notification) = stream.next().await {
        let event = PlatformEvent::Notification {
            device_id: device_id.clone(),
            characteristic: notification.uuid,
            value: notification.value,
        };
        if events.send(event).await.is_err() {
            return;
        }
    }
    debug!("Notification stream for {device_id} closed");
}

// ============================================================================
// Helpers
// ============================================================================

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> PlatformResult<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or(PlatformError::MissingCharacteristic(uuid))
}

fn adapter_state(state: CentralState) -> AdapterState {
    match state {
        CentralState::PoweredOn => AdapterState::PoweredOn,
        CentralState::PoweredOff => AdapterState::PoweredOff,
        _ => AdapterState::Unknown,
    }
}

#[allow(clippy::needless_pass_by_value)]
fn transport(error: btleplug::Error) -> PlatformError {
    PlatformError::Transport(error.to_string())
}

#[allow(clippy::needless_pass_by_value)]
fn unavailable(error: btleplug::Error) -> PlatformError {
    PlatformError::Unavailable(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_state_mapping() {
        assert_eq!(adapter_state(CentralState::PoweredOn), AdapterState::PoweredOn);
        assert_eq!(adapter_state(CentralState::PoweredOff), AdapterState::PoweredOff);
        assert_eq!(adapter_state(CentralState::Unknown), AdapterState::Unknown);
    }

    #[test]
    fn test_transport_error_text() {
        let err = transport(btleplug::Error::DeviceNotFound);
        assert!(matches!(err, PlatformError::Transport(_)));
    }
}
