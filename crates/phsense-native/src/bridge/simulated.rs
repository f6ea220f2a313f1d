//! Simulated BLE platform.
//!
//! Virtual pH sensors behind the [`BlePlatform`] seam: the adapter powers
//! on, sensors advertise (optionally several times), accept a link, expose
//! the pH service, and push readings on a timer once subscribed. Written
//! calibrations are decoded and applied to later readings.
//!
//! Hooks such as [`SimulatedPlatform::drop_link`] and
//! [`SimulatedPlatform::fail_next_write`] let tests drive edge cases.

use std::collections::{HashMap, HashSet};
use std::f64::consts::TAU;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use phsense_core::calibration::CalibrationCoefficients;
use phsense_core::protocol::{
    decode_calibration, CALIBRATION_CHAR_UUID, PH_READING_CHAR_UUID, PH_SERVICE_UUID,
};
use phsense_core::types::DeviceId;

use super::platform::{
    AdapterState, Advertisement, BlePlatform, DiscoveredCharacteristic, PlatformError,
    PlatformEvent, PlatformResult,
};

/// Generic Access service, exposed by sensors without the pH service.
const GAP_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1800_0000_1000_8000_0080_5f9b_34fb);
/// Device Name characteristic.
const DEVICE_NAME_CHAR_UUID: Uuid = Uuid::from_u128(0x0000_2a00_0000_1000_8000_0080_5f9b_34fb);

/// Factory mapping used until a calibration is written: 1.0 V reads pH 7.
const FACTORY_SLOPE: f64 = -3.0;
const FACTORY_INTERCEPT: f64 = 10.0;

/// Amplitude of the reading wobble (volts).
const WOBBLE_VOLTS: f64 = 0.02;
/// Ticks per wobble period.
const WOBBLE_PERIOD: f64 = 40.0;

// ============================================================================
// Configuration
// ============================================================================

/// One virtual peripheral.
#[derive(Clone, Debug, PartialEq)]
pub struct VirtualSensor {
    /// Peripheral identity
    pub id: DeviceId,
    /// Advertised name
    pub name: Option<String>,
    /// Advertised signal strength (dBm)
    pub rssi: i16,
    /// Probe voltage the sensor reads
    pub voltage: f64,
    /// Whether the sensor exposes the pH service
    pub has_ph_service: bool,
}

impl VirtualSensor {
    /// A pH sensor reading `voltage`.
    #[must_use]
    pub fn ph_probe(id: impl Into<DeviceId>, name: Option<&str>, voltage: f64) -> Self {
        Self {
            id: id.into(),
            name: name.map(str::to_string),
            rssi: -60,
            voltage,
            has_ph_service: true,
        }
    }

    /// A peripheral that advertises but carries no pH service.
    #[must_use]
    pub fn other(id: impl Into<DeviceId>, name: Option<&str>) -> Self {
        Self {
            has_ph_service: false,
            ..Self::ph_probe(id, name, 0.0)
        }
    }

    fn advertisement(&self) -> Advertisement {
        let mut advertisement = Advertisement::new(self.id.clone(), self.name.clone(), Some(self.rssi));
        if self.has_ph_service {
            advertisement.services.push(PH_SERVICE_UUID);
        }
        advertisement
    }
}

/// Simulated platform configuration.
#[derive(Clone, Debug)]
pub struct SimulatedConfig {
    /// Peripherals in range
    pub sensors: Vec<VirtualSensor>,
    /// Reading period once subscribed (`None` = only explicit [`SimulatedPlatform::notify`])
    pub notify_interval: Option<Duration>,
    /// How many times each sensor advertises per scan start
    pub advertise_repeats: usize,
    /// Adapter state at creation
    pub initial_state: AdapterState,
    /// Depth of the event channel
    pub event_capacity: usize,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            sensors: Vec::new(),
            notify_interval: None,
            advertise_repeats: 1,
            initial_state: AdapterState::PoweredOn,
            event_capacity: 256,
        }
    }
}

// ============================================================================
// Platform
// ============================================================================

#[derive(Debug, Default)]
struct SimState {
    adapter: Option<AdapterState>,
    scanning: bool,
    links: HashSet<DeviceId>,
    tickers: HashMap<DeviceId, JoinHandle<()>>,
    calibrations: HashMap<DeviceId, CalibrationCoefficients>,
    writes: Vec<(DeviceId, Uuid, Vec<u8>)>,
    fail_connect: Option<String>,
    fail_write: Option<String>,
    connect_delay: Duration,
}

impl SimState {
    fn adapter(&self) -> AdapterState {
        self.adapter.unwrap_or(AdapterState::Unknown)
    }

    fn drop_link(&mut self, id: &DeviceId) -> bool {
        if let Some(ticker) = self.tickers.remove(id) {
            ticker.abort();
        }
        self.links.remove(id)
    }
}

/// BLE platform backed by virtual sensors.
pub struct SimulatedPlatform {
    sensors: Vec<VirtualSensor>,
    notify_interval: Option<Duration>,
    advertise_repeats: usize,
    state: Arc<Mutex<SimState>>,
    events: mpsc::Sender<PlatformEvent>,
    receiver: Mutex<Option<mpsc::Receiver<PlatformEvent>>>,
}

impl SimulatedPlatform {
    /// Create a platform with the given sensors and timing.
    #[must_use]
    pub fn new(config: SimulatedConfig) -> Self {
        let (events, receiver) = mpsc::channel(config.event_capacity.max(1));
        let state = SimState {
            adapter: Some(config.initial_state),
            ..SimState::default()
        };
        Self {
            sensors: config.sensors,
            notify_interval: config.notify_interval,
            advertise_repeats: config.advertise_repeats.max(1),
            state: Arc::new(Mutex::new(state)),
            events,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Two pH probes and one unrelated peripheral, reading once a second.
    #[must_use]
    pub fn demo() -> Self {
        Self::new(SimulatedConfig {
            sensors: vec![
                VirtualSensor::ph_probe("SIM:PH:01", Some("pH-Probe-01"), 1.0),
                VirtualSensor::ph_probe("SIM:PH:02", Some("pH-Probe-02"), 1.4),
                VirtualSensor::other("SIM:HR:01", Some("HeartStrap")),
            ],
            notify_interval: Some(Duration::from_secs(1)),
            advertise_repeats: 3,
            ..SimulatedConfig::default()
        })
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sensor(&self, id: &DeviceId) -> PlatformResult<&VirtualSensor> {
        self.sensors
            .iter()
            .find(|s| &s.id == id)
            .ok_or_else(|| PlatformError::UnknownPeripheral(id.clone()))
    }

    fn require_link(&self, id: &DeviceId) -> PlatformResult<&VirtualSensor> {
        let sensor = self.sensor(id)?;
        if self.lock().links.contains(id) {
            Ok(sensor)
        } else {
            Err(PlatformError::NotConnected(id.clone()))
        }
    }

    fn emit(&self, event: PlatformEvent) {
        emit(&self.events, event);
    }

    // ========================================================================
    // Test hooks
    // ========================================================================

    /// Change the adapter power state and report it.
    pub fn set_adapter_state(&self, adapter: AdapterState) {
        {
            let mut state = self.lock();
            state.adapter = Some(adapter);
            if !adapter.is_ready() {
                state.scanning = false;
            }
        }
        self.emit(PlatformEvent::StateChanged(adapter));
    }

    /// Whether discovery is running.
    pub fn is_scanning(&self) -> bool {
        self.lock().scanning
    }

    /// Whether a link to `id` is up.
    pub fn is_linked(&self, id: &DeviceId) -> bool {
        self.lock().links.contains(id)
    }

    /// Push an arbitrary event into the stream.
    pub fn inject(&self, event: PlatformEvent) {
        self.emit(event);
    }

    /// Push one pH reading from `id`, linked or not.
    pub fn notify(&self, id: &DeviceId, value: f32) {
        self.emit(PlatformEvent::Notification {
            device_id: id.clone(),
            characteristic: PH_READING_CHAR_UUID,
            value: value.to_le_bytes().to_vec(),
        });
    }

    /// The peripheral drops the link on its own.
    pub fn drop_link(&self, id: &DeviceId) {
        self.lock().drop_link(id);
        info!("Simulated link loss for {id}");
        self.emit(PlatformEvent::Disconnected(id.clone()));
    }

    /// Make the next connect fail with `reason`.
    pub fn fail_next_connect(&self, reason: impl Into<String>) {
        self.lock().fail_connect = Some(reason.into());
    }

    /// Make the next write fail with `reason`.
    pub fn fail_next_write(&self, reason: impl Into<String>) {
        self.lock().fail_write = Some(reason.into());
    }

    /// Delay every connect by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    /// Accepted writes in order.
    pub fn writes(&self) -> Vec<(DeviceId, Uuid, Vec<u8>)> {
        self.lock().writes.clone()
    }

    /// Calibration last written to `id`.
    pub fn calibration_for(&self, id: &DeviceId) -> Option<CalibrationCoefficients> {
        self.lock().calibrations.get(id).copied()
    }
}

#[async_trait]
impl BlePlatform for SimulatedPlatform {
    async fn adapter_state(&self) -> PlatformResult<AdapterState> {
        Ok(self.lock().adapter())
    }

    async fn start_scan(&self, services: Vec<Uuid>) -> PlatformResult<()> {
        {
            let mut state = self.lock();
            if !state.adapter().is_ready() {
                return Err(PlatformError::Unavailable(format!(
                    "adapter is {:?}",
                    state.adapter()
                )));
            }
            state.scanning = true;
        }
        debug!("Simulated scan started");

        let visible = self.sensors.iter().filter(|s| {
            services.is_empty() || (s.has_ph_service && services.contains(&PH_SERVICE_UUID))
        });
        for sensor in visible {
            for _ in 0..self.advertise_repeats {
                self.emit(PlatformEvent::Discovered(sensor.advertisement()));
            }
        }
        Ok(())
    }

    async fn stop_scan(&self) -> PlatformResult<()> {
        self.lock().scanning = false;
        debug!("Simulated scan stopped");
        Ok(())
    }

    async fn connect(&self, id: &DeviceId) -> PlatformResult<()> {
        self.sensor(id)?;
        let delay = self.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if !state.adapter().is_ready() {
            return Err(PlatformError::Unavailable("adapter powered off".into()));
        }
        if let Some(reason) = state.fail_connect.take() {
            return Err(PlatformError::Transport(reason));
        }
        state.links.insert(id.clone());
        debug!("Simulated link up for {id}");
        Ok(())
    }

    async fn discover_services(&self, id: &DeviceId) -> PlatformResult<Vec<DiscoveredCharacteristic>> {
        let sensor = self.require_link(id)?;
        let characteristics = if sensor.has_ph_service {
            vec![
                DiscoveredCharacteristic {
                    service: PH_SERVICE_UUID,
                    uuid: PH_READING_CHAR_UUID,
                },
                DiscoveredCharacteristic {
                    service: PH_SERVICE_UUID,
                    uuid: CALIBRATION_CHAR_UUID,
                },
            ]
        } else {
            vec![DiscoveredCharacteristic {
                service: GAP_SERVICE_UUID,
                uuid: DEVICE_NAME_CHAR_UUID,
            }]
        };
        Ok(characteristics)
    }

    async fn subscribe(&self, id: &DeviceId, characteristic: Uuid) -> PlatformResult<()> {
        let sensor = self.require_link(id)?;
        if !sensor.has_ph_service || characteristic != PH_READING_CHAR_UUID {
            return Err(PlatformError::MissingCharacteristic(characteristic));
        }

        if let Some(interval) = self.notify_interval {
            let ticker = spawn_ticker(
                sensor.clone(),
                interval,
                Arc::clone(&self.state),
                self.events.clone(),
            );
            if let Some(previous) = self.lock().tickers.insert(id.clone(), ticker) {
                previous.abort();
            }
        }
        Ok(())
    }

    async fn write(&self, id: &DeviceId, characteristic: Uuid, payload: &[u8]) -> PlatformResult<()> {
        let sensor = self.require_link(id)?;
        if let Some(reason) = self.lock().fail_write.take() {
            return Err(PlatformError::Transport(reason));
        }
        if !sensor.has_ph_service || characteristic != CALIBRATION_CHAR_UUID {
            return Err(PlatformError::MissingCharacteristic(characteristic));
        }

        let coefficients =
            decode_calibration(payload).map_err(|e| PlatformError::Transport(e.to_string()))?;
        info!(
            "Simulated sensor {id} calibrated: m={} b={}",
            coefficients.slope(),
            coefficients.intercept()
        );

        let mut state = self.lock();
        state.calibrations.insert(id.clone(), coefficients);
        state.writes.push((id.clone(), characteristic, payload.to_vec()));
        Ok(())
    }

    async fn disconnect(&self, id: &DeviceId) -> PlatformResult<()> {
        let was_linked = self.lock().drop_link(id);
        if was_linked {
            debug!("Simulated link down for {id}");
            self.emit(PlatformEvent::Disconnected(id.clone()));
        }
        Ok(())
    }

    async fn is_connected(&self, id: &DeviceId) -> PlatformResult<bool> {
        Ok(self.is_linked(id))
    }

    fn take_events(&self) -> Option<mpsc::Receiver<PlatformEvent>> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn shutdown(&self) {
        let mut state = self.lock();
        for (_, ticker) in state.tickers.drain() {
            ticker.abort();
        }
        state.links.clear();
        state.scanning = false;
    }
}

fn emit(events: &mpsc::Sender<PlatformEvent>, event: PlatformEvent) {
    match events.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            warn!("Simulated event channel full, dropping {event:?}");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Simulated event channel closed");
        }
    }
}

fn spawn_ticker(
    sensor: VirtualSensor,
    interval: Duration,
    state: Arc<Mutex<SimState>>,
    events: mpsc::Sender<PlatformEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        let mut tick: u32 = 0;
        loop {
            timer.tick().await;
            let calibration = state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .calibrations
                .get(&sensor.id)
                .copied();

            let voltage = sensor.voltage + WOBBLE_VOLTS * (TAU * f64::from(tick) / WOBBLE_PERIOD).sin();
            let ph = calibration.map_or(FACTORY_SLOPE * voltage + FACTORY_INTERCEPT, |c| c.apply(voltage));
            tick = tick.wrapping_add(1);

            #[allow(clippy::cast_possible_truncation)]
            let event = PlatformEvent::Notification {
                device_id: sensor.id.clone(),
                characteristic: PH_READING_CHAR_UUID,
                value: (ph as f32).to_le_bytes().to_vec(),
            };
            if events.send(event).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use phsense_core::protocol::{decode_sample, encode_calibration};

    fn probe_platform(interval: Option<Duration>) -> SimulatedPlatform {
        SimulatedPlatform::new(SimulatedConfig {
            sensors: vec![
                VirtualSensor::ph_probe("p1", Some("pH-1"), 1.0),
                VirtualSensor::other("o1", Some("Other")),
            ],
            notify_interval: interval,
            advertise_repeats: 2,
            ..SimulatedConfig::default()
        })
    }

    fn drain(rx: &mut mpsc::Receiver<PlatformEvent>) -> Vec<PlatformEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_scan_advertises_with_repeats() {
        let platform = probe_platform(None);
        let mut rx = platform.take_events().unwrap();
        assert!(platform.take_events().is_none());

        platform.start_scan(Vec::new()).await.unwrap();
        let discovered = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, PlatformEvent::Discovered(_)))
            .count();
        assert_eq!(discovered, 4);

        platform.start_scan(vec![PH_SERVICE_UUID]).await.unwrap();
        let ids: Vec<DeviceId> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                PlatformEvent::Discovered(a) => Some(a.id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![DeviceId::new("p1"), DeviceId::new("p1")]);
    }

    #[tokio::test]
    async fn test_connect_and_discover() {
        let platform = probe_platform(None);

        let err = platform.connect(&DeviceId::new("ghost")).await.unwrap_err();
        assert!(matches!(err, PlatformError::UnknownPeripheral(_)));

        let p1 = DeviceId::new("p1");
        assert!(platform.discover_services(&p1).await.is_err());
        platform.connect(&p1).await.unwrap();
        assert!(platform.is_linked(&p1));
        assert_eq!(platform.discover_services(&p1).await.unwrap().len(), 2);

        let o1 = DeviceId::new("o1");
        platform.connect(&o1).await.unwrap();
        let chars = platform.discover_services(&o1).await.unwrap();
        assert!(chars.iter().all(|c| c.service != PH_SERVICE_UUID));
    }

    #[tokio::test]
    async fn test_fail_next_connect_is_one_shot() {
        let platform = probe_platform(None);
        let p1 = DeviceId::new("p1");
        platform.fail_next_connect("refused");

        assert!(platform.connect(&p1).await.is_err());
        assert!(platform.connect(&p1).await.is_ok());
    }

    #[tokio::test]
    async fn test_calibration_write_applied_to_readings() {
        let platform = probe_platform(Some(Duration::from_millis(5)));
        let mut rx = platform.take_events().unwrap();
        let p1 = DeviceId::new("p1");

        platform.connect(&p1).await.unwrap();
        let coefficients = CalibrationCoefficients::new(0.0, 5.5).unwrap();
        let payload = encode_calibration(&coefficients).unwrap();
        platform.write(&p1, CALIBRATION_CHAR_UUID, &payload).await.unwrap();
        assert_eq!(platform.calibration_for(&p1), Some(coefficients));
        assert_eq!(platform.writes().len(), 1);

        platform.subscribe(&p1, PH_READING_CHAR_UUID).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Some(PlatformEvent::Notification { value, .. }) = rx.recv().await {
                    return value;
                }
            }
        })
        .await
        .unwrap();
        assert!((decode_sample(&event) - 5.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_fail_next_write() {
        let platform = probe_platform(None);
        let p1 = DeviceId::new("p1");
        platform.connect(&p1).await.unwrap();
        platform.fail_next_write("gatt error");

        let payload = encode_calibration(&CalibrationCoefficients::new(-3.0, 10.0).unwrap()).unwrap();
        assert!(platform.write(&p1, CALIBRATION_CHAR_UUID, &payload).await.is_err());
        assert!(platform.writes().is_empty());
        assert!(platform.calibration_for(&p1).is_none());
    }

    #[tokio::test]
    async fn test_drop_link_reports_disconnect() {
        let platform = probe_platform(None);
        let mut rx = platform.take_events().unwrap();
        let p1 = DeviceId::new("p1");
        platform.connect(&p1).await.unwrap();

        platform.drop_link(&p1);
        assert!(!platform.is_linked(&p1));
        assert!(matches!(
            drain(&mut rx).last(),
            Some(PlatformEvent::Disconnected(id)) if *id == p1
        ));

        // Disconnecting a dead link is silent
        platform.disconnect(&p1).await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }
}
