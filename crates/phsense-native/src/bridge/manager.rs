//! Session manager.
//!
//! Composes the platform, the registry, the scanner and the session slot
//! behind one handle. Platform events are consumed by a single dispatcher
//! task in arrival order; API calls and the dispatcher share one state
//! lock, and every snapshot is published while that lock is held so
//! observers never see an older registry after a newer one.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use phsense_core::calibration::{CalibrationCoefficients, CalibrationInput};
use phsense_core::protocol::{encode_calibration, CALIBRATION_CHAR_UUID, PH_READING_CHAR_UUID};
use phsense_core::types::{DeviceId, Sample};

use super::config::SessionConfig;
use super::error::{SessionError, SessionResult};
use super::platform::{AdapterState, BlePlatform, PlatformEvent};
use super::registry::{DeviceRegistry, RegistrySnapshot};
use super::scanner::{record_advertisement, ScanController};
use super::session::{bounded, Connector, SessionSlot, SessionState};

/// Notifications published to observers.
#[derive(Clone, Debug)]
pub enum ManagerEvent {
    /// The registry changed
    Snapshot(RegistrySnapshot),
    /// A pH reading arrived from the subscribed device
    Sample(Sample),
    /// A session reached the subscribed state
    Connected(DeviceId),
    /// A session ended
    Disconnected {
        /// Device whose session ended
        device_id: DeviceId,
        /// True when the peripheral or the stack dropped the link
        unsolicited: bool,
    },
    /// Discovery could not start or stopped on its own
    ScanError(String),
}

struct CoreState {
    registry: DeviceRegistry,
    sessions: SessionSlot,
    /// Devices whose link we cancelled and whose disconnect event may
    /// still be queued
    cancelled_links: HashSet<DeviceId>,
}

struct Inner {
    platform: Arc<dyn BlePlatform>,
    config: SessionConfig,
    state: RwLock<CoreState>,
    scanner: tokio::sync::Mutex<ScanController>,
    events: broadcast::Sender<ManagerEvent>,
    closed: AtomicBool,
}

/// Facade over one BLE platform and the single sensor session.
pub struct SessionManager {
    inner: Arc<Inner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Claim the platform event stream, feed it the current adapter state
    /// and start dispatching.
    ///
    /// Discovery starts automatically the first time the adapter reports
    /// powered on.
    ///
    /// # Errors
    ///
    /// [`SessionError::EventsUnavailable`] if another owner already took the
    /// platform's event stream.
    pub async fn start(platform: Arc<dyn BlePlatform>, config: SessionConfig) -> SessionResult<Self> {
        let events = platform.take_events().ok_or(SessionError::EventsUnavailable)?;
        let (tx, _) = broadcast::channel(config.event_capacity.max(1));

        let inner = Arc::new(Inner {
            scanner: tokio::sync::Mutex::new(ScanController::new(config.scan.clone())),
            platform,
            config,
            state: RwLock::new(CoreState {
                registry: DeviceRegistry::new(),
                sessions: SessionSlot::new(),
                cancelled_links: HashSet::new(),
            }),
            events: tx,
            closed: AtomicBool::new(false),
        });

        match inner.platform.adapter_state().await {
            Ok(state) => inner.on_adapter_state(state).await,
            Err(e) => warn!("Could not read adapter state: {e}"),
        }

        let dispatcher = tokio::spawn(dispatch(Arc::clone(&inner), events));
        info!("Session manager started");

        Ok(Self {
            inner,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Subscribe to manager events.
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    /// Current registry contents.
    pub fn devices(&self) -> RegistrySnapshot {
        self.inner.read().registry.snapshot()
    }

    /// Device with a subscribed session, if any.
    pub fn active_device(&self) -> Option<DeviceId> {
        self.inner
            .read()
            .sessions
            .current()
            .filter(|s| s.state() == SessionState::Subscribed)
            .map(|s| s.device_id().clone())
    }

    /// Connect to a discovered device and subscribe to its pH readings.
    ///
    /// Discovery is stopped first. Resolves once notifications are enabled.
    ///
    /// # Errors
    ///
    /// - [`SessionError::UnknownDevice`]: id never discovered, nothing changes
    /// - [`SessionError::SessionActive`]: another session holds the slot
    /// - [`SessionError::Aborted`]: disconnected before the connect finished
    /// - connect, discovery or subscription failures; the link is cancelled
    pub async fn connect(&self, id: &DeviceId) -> SessionResult<()> {
        self.ensure_open()?;
        let generation = {
            let mut state = self.inner.write();
            if !state.registry.contains(id) {
                warn!("Connect requested for unknown device {id}");
                return Err(SessionError::UnknownDevice(id.clone()));
            }
            state.sessions.begin(id).inspect_err(|e| warn!("Connect to {id} refused: {e}"))?
        };
        let mut pending = PendingConnect {
            inner: Arc::clone(&self.inner),
            id: id.clone(),
            generation,
            armed: true,
        };

        {
            let mut scanner = self.inner.scanner.lock().await;
            if let Err(e) = scanner.stop_active(self.inner.platform.as_ref()).await {
                warn!("Could not stop scan before connecting: {e}");
            }
        }

        let inner = self.inner.as_ref();
        let result = Connector::new(inner.platform.as_ref(), &inner.config)
            .open(id, |step| inner.advance(generation, id, step))
            .await;

        pending.armed = false;

        match &result {
            Ok(()) => info!("Connected to {id}"),
            Err(e) => {
                inner.abandon(generation, id);
                // The connector cancelled the link; its disconnect event may follow
                inner.write().cancelled_links.insert(id.clone());
                warn!("Connect to {id} failed: {e}");
            }
        }
        result
    }

    /// Disconnect from `id`.
    ///
    /// Observers see the device as disconnected before the platform is
    /// asked to drop the link. Disconnecting a device without a session is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// Returns the platform failure or timeout. The session is gone either
    /// way.
    pub async fn disconnect(&self, id: &DeviceId) -> SessionResult<()> {
        self.ensure_open()?;
        self.inner.disconnect(id).await
    }

    /// Write calibration coefficients to the subscribed device `id`.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotConnected`] without a subscribed session for `id`;
    /// otherwise the encode or write failure. A failed write leaves the
    /// connection untouched.
    pub async fn send_calibration(&self, id: &DeviceId, coefficients: &CalibrationCoefficients) -> SessionResult<()> {
        self.ensure_open()?;
        let subscribed = self.inner.read().sessions.is_subscribed(id);
        if !subscribed {
            warn!("Calibration for {id} dropped: not connected");
            return Err(SessionError::NotConnected(id.clone()));
        }

        let payload = encode_calibration(coefficients)?;
        info!(
            "Sending calibration to {id}: m={} b={}",
            coefficients.slope(),
            coefficients.intercept()
        );

        let inner = &self.inner;
        bounded(
            "calibration write",
            inner.config.write_timeout,
            inner.platform.write(id, CALIBRATION_CHAR_UUID, &payload),
        )
        .await
        .inspect_err(|e| warn!("Calibration write to {id} failed: {e}"))
    }

    /// Fit coefficients from the user's buffer voltages and send them to
    /// the active device. Returns the coefficients that were written.
    ///
    /// # Errors
    ///
    /// [`SessionError::Calibration`] for bad input (checked first),
    /// [`SessionError::NoActiveDevice`] without a subscribed session, or
    /// the write failure.
    pub async fn calibrate_active(&self, input: &CalibrationInput) -> SessionResult<CalibrationCoefficients> {
        let coefficients = input.coefficients()?;
        let id = self.active_device().ok_or(SessionError::NoActiveDevice)?;
        self.send_calibration(&id, &coefficients).await?;
        Ok(coefficients)
    }

    /// Start a new discovery pass.
    ///
    /// # Errors
    ///
    /// Returns the platform error if discovery cannot start.
    pub async fn rescan(&self) -> SessionResult<()> {
        self.ensure_open()?;
        let mut scanner = self.inner.scanner.lock().await;
        scanner.start(self.inner.platform.as_ref()).await.map(|_| ())
    }

    /// Stop the running discovery pass.
    ///
    /// # Errors
    ///
    /// Returns the platform error.
    pub async fn stop_scan(&self) -> SessionResult<()> {
        self.ensure_open()?;
        let mut scanner = self.inner.scanner.lock().await;
        scanner.stop_active(self.inner.platform.as_ref()).await
    }

    /// Whether a discovery pass is running.
    pub async fn is_scanning(&self) -> bool {
        self.inner.scanner.lock().await.is_scanning()
    }

    /// Disconnect, stop discovery, stop dispatching and release the
    /// platform. Later calls return [`SessionError::ShutDown`].
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let active = self.inner.read().sessions.current().map(|s| s.device_id().clone());
        if let Some(id) = active {
            if let Err(e) = self.inner.disconnect(&id).await {
                warn!("Disconnect during shutdown failed: {e}");
            }
        }

        {
            let mut scanner = self.inner.scanner.lock().await;
            if let Err(e) = scanner.stop_active(self.inner.platform.as_ref()).await {
                debug!("Stop scan during shutdown failed: {e}");
            }
        }

        if let Some(dispatcher) = self.take_dispatcher() {
            dispatcher.abort();
        }
        self.inner.platform.shutdown().await;
        info!("Session manager shut down");
    }

    fn ensure_open(&self) -> SessionResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(SessionError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn take_dispatcher(&self) -> Option<JoinHandle<()>> {
        self.dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.take_dispatcher() {
            dispatcher.abort();
        }
    }
}

/// Undoes a connect whose future was dropped before it finished.
struct PendingConnect {
    inner: Arc<Inner>,
    id: DeviceId,
    generation: u64,
    armed: bool,
}

impl Drop for PendingConnect {
    fn drop(&mut self) {
        if !self.armed || !self.inner.abandon(self.generation, &self.id) {
            return;
        }
        warn!("Connect to {} cancelled by caller", self.id);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let id = self.id.clone();
        runtime.spawn(async move {
            // A newer session for the same device owns the link now
            let reused = inner.read().sessions.current().is_some_and(|s| s.device_id() == &id);
            if reused {
                return;
            }
            inner.write().cancelled_links.insert(id.clone());
            if let Err(e) = bounded(
                "disconnect",
                inner.config.disconnect_timeout,
                inner.platform.disconnect(&id),
            )
            .await
            {
                debug!("Link cancel for {id} failed: {e}");
            }
        });
    }
}

// ============================================================================
// Shared State
// ============================================================================

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, CoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: ManagerEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn publish_snapshot(&self, state: &CoreState) {
        self.publish(ManagerEvent::Snapshot(state.registry.snapshot()));
    }

    /// Step the session created by `generation`; marks the device connected
    /// when it reaches [`SessionState::Subscribed`].
    fn advance(&self, generation: u64, id: &DeviceId, step: SessionState) -> SessionResult<()> {
        let mut state = self.write();
        state.sessions.advance(generation, id, step)?;
        if step == SessionState::Subscribed {
            state.cancelled_links.remove(id);
            state.registry.set_connected(id, true);
            self.publish_snapshot(&state);
            self.publish(ManagerEvent::Connected(id.clone()));
        }
        Ok(())
    }

    /// Drop the session created by `generation` if it is still in the slot.
    /// Returns whether there was one.
    fn abandon(&self, generation: u64, id: &DeviceId) -> bool {
        let mut state = self.write();
        let Some((_, previous)) = state.sessions.take_generation(generation) else {
            return false;
        };
        debug!("Abandoning connect to {id} from {previous:?}");
        if state.registry.set_connected(id, false) {
            self.publish_snapshot(&state);
            self.publish(ManagerEvent::Disconnected {
                device_id: id.clone(),
                unsolicited: false,
            });
        }
        true
    }

    async fn disconnect(&self, id: &DeviceId) -> SessionResult<()> {
        {
            let mut state = self.write();
            let Some((_, previous)) = state.sessions.take(id) else {
                debug!("No session for {id}, nothing to disconnect");
                return Ok(());
            };
            debug!("Tearing down session for {id} from {previous:?}");
            state.cancelled_links.insert(id.clone());
            if state.registry.set_connected(id, false) {
                self.publish_snapshot(&state);
                self.publish(ManagerEvent::Disconnected {
                    device_id: id.clone(),
                    unsolicited: false,
                });
            }
        }

        info!("Disconnecting from {id}");
        bounded(
            "disconnect",
            self.config.disconnect_timeout,
            self.platform.disconnect(id),
        )
        .await
    }

    async fn on_adapter_state(&self, adapter: AdapterState) {
        info!("Adapter state: {adapter:?}");
        let mut scanner = self.scanner.lock().await;
        if let Err(e) = scanner.on_adapter_state(self.platform.as_ref(), adapter).await {
            self.publish(ManagerEvent::ScanError(e.to_string()));
        }
    }

    async fn handle(&self, event: PlatformEvent) {
        match event {
            PlatformEvent::StateChanged(adapter) => self.on_adapter_state(adapter).await,
            PlatformEvent::Discovered(advertisement) => {
                let mut state = self.write();
                if record_advertisement(&mut state.registry, &self.config.scan, &advertisement).is_change() {
                    self.publish_snapshot(&state);
                }
            }
            PlatformEvent::Disconnected(id) => self.on_link_lost(&id).await,
            PlatformEvent::Notification {
                device_id,
                characteristic,
                value,
            } => {
                if characteristic != PH_READING_CHAR_UUID {
                    debug!("Ignoring notification on {characteristic} from {device_id}");
                    return;
                }
                self.on_reading(device_id, &value);
            }
            PlatformEvent::ScanFailed(reason) => {
                self.scanner.lock().await.on_scan_failed(&reason);
                self.publish(ManagerEvent::ScanError(reason));
            }
        }
    }

    /// Apply a link loss reported by the platform.
    ///
    /// The event may belong to a link that an earlier session cancelled.
    /// Before the new link is up that is told by the cancelled-link marker;
    /// afterwards by asking the platform whether the link is still there.
    async fn on_link_lost(&self, id: &DeviceId) {
        let (generation, link_requested) = {
            let mut state = self.write();
            let cancelled_earlier = state.cancelled_links.remove(id);
            let Some(session) = state.sessions.current().filter(|s| s.device_id() == id) else {
                debug!("Link to {id} closed with no session");
                return;
            };
            let link_requested = session.state() != SessionState::Connecting;
            if cancelled_earlier && !link_requested {
                debug!("Ignoring disconnect of an earlier link to {id}");
                return;
            }
            (session.generation(), link_requested)
        };

        if link_requested {
            let still_up = bounded(
                "link check",
                self.config.disconnect_timeout,
                self.platform.is_connected(id),
            )
            .await;
            if matches!(still_up, Ok(true)) {
                debug!("Link to {id} is still up, ignoring stale disconnect");
                return;
            }
        }

        let mut state = self.write();
        let Some((_, previous)) = state.sessions.take_generation(generation) else {
            debug!("Session for {id} already gone");
            return;
        };
        warn!("Device {id} disconnected while {previous:?}");
        if state.registry.set_connected(id, false) {
            self.publish_snapshot(&state);
            self.publish(ManagerEvent::Disconnected {
                device_id: id.clone(),
                unsolicited: true,
            });
        }
    }

    fn on_reading(&self, id: DeviceId, raw: &[u8]) {
        let mut state = self.write();
        if !state.sessions.is_subscribed(&id) {
            trace!("Dropping notification from {id} with no subscribed session");
            return;
        }

        let value = self.config.sample_format.decode(raw);
        state.registry.set_last_value(&id, value);
        self.publish_snapshot(&state);
        self.publish(ManagerEvent::Sample(Sample::now(id, value)));
    }
}

async fn dispatch(inner: Arc<Inner>, mut events: mpsc::Receiver<PlatformEvent>) {
    while let Some(event) = events.recv().await {
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        inner.handle(event).await;
    }
    debug!("Platform event dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bridge::platform::Advertisement;
    use crate::bridge::simulated::{SimulatedConfig, SimulatedPlatform, VirtualSensor};

    fn p1() -> DeviceId {
        DeviceId::new("p1")
    }

    fn platform() -> Arc<SimulatedPlatform> {
        Arc::new(SimulatedPlatform::new(SimulatedConfig {
            sensors: vec![
                VirtualSensor::ph_probe("p1", Some("pH-1"), 1.0),
                VirtualSensor::ph_probe("p2", Some("pH-2"), 1.2),
                VirtualSensor::other("o1", Some("Other")),
            ],
            advertise_repeats: 3,
            ..SimulatedConfig::default()
        }))
    }

    fn config() -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_secs(1),
            discovery_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
            disconnect_timeout: Duration::from_secs(1),
            ..SessionConfig::default()
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn next_matching<F>(rx: &mut broadcast::Receiver<ManagerEvent>, pred: F) -> ManagerEvent
    where
        F: Fn(&ManagerEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    async fn started(platform: &Arc<SimulatedPlatform>) -> SessionManager {
        let manager = SessionManager::start(platform.clone(), config()).await.unwrap();
        wait_for(|| manager.devices().len() == 3).await;
        manager
    }

    #[tokio::test]
    async fn test_discovery_deduplicates() {
        let platform = platform();
        let manager = started(&platform).await;
        assert!(manager.is_scanning().await);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(manager.devices().len(), 3);
        assert_eq!(manager.devices().sorted_for_display()[0].display_name(), "Other");
    }

    #[tokio::test]
    async fn test_events_stream_taken_once() {
        let platform = platform();
        let _manager = SessionManager::start(platform.clone(), config()).await.unwrap();
        let err = SessionManager::start(platform, config()).await.err().unwrap();
        assert!(matches!(err, SessionError::EventsUnavailable));
    }

    #[tokio::test]
    async fn test_connect_subscribes_and_stops_scan() {
        let platform = platform();
        let manager = started(&platform).await;
        let mut rx = manager.subscribe();

        manager.connect(&p1()).await.unwrap();
        assert_eq!(manager.active_device(), Some(p1()));
        assert!(!platform.is_scanning());
        assert!(manager.devices().get(&p1()).unwrap().connected);
        next_matching(&mut rx, |e| matches!(e, ManagerEvent::Connected(id) if *id == p1())).await;

        platform.notify(&p1(), 6.5);
        let event = next_matching(&mut rx, |e| matches!(e, ManagerEvent::Sample(_))).await;
        let ManagerEvent::Sample(sample) = event else {
            unreachable!()
        };
        assert_eq!(sample.device_id, p1());
        assert_eq!(sample.value, 6.5);
        assert_eq!(manager.devices().get(&p1()).unwrap().last_value, 6.5);
    }

    #[tokio::test]
    async fn test_second_connect_rejected() {
        let platform = platform();
        let manager = started(&platform).await;
        manager.connect(&p1()).await.unwrap();

        let err = manager.connect(&DeviceId::new("p2")).await.unwrap_err();
        assert!(matches!(err, SessionError::SessionActive(id) if id == p1()));
        assert_eq!(manager.active_device(), Some(p1()));
        assert!(!platform.is_linked(&DeviceId::new("p2")));
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let platform = platform();
        let manager = started(&platform).await;
        let before = manager.devices();

        let err = manager.connect(&DeviceId::new("ghost")).await.unwrap_err();
        assert!(matches!(err, SessionError::UnknownDevice(_)));
        assert!(manager.active_device().is_none());
        assert_eq!(manager.devices(), before);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let platform = platform();
        let manager = started(&platform).await;
        manager.connect(&p1()).await.unwrap();
        let mut rx = manager.subscribe();

        manager.disconnect(&p1()).await.unwrap();
        manager.disconnect(&p1()).await.unwrap();
        assert!(manager.active_device().is_none());
        assert!(!manager.devices().get(&p1()).unwrap().connected);
        assert!(!platform.is_linked(&p1()));

        let mut disconnects = 0;
        while let Ok(event) = rx.try_recv() {
            if let ManagerEvent::Disconnected { unsolicited, .. } = event {
                assert!(!unsolicited);
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 1);
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect() {
        let platform = platform();
        let manager = started(&platform).await;
        manager.connect(&p1()).await.unwrap();
        manager.disconnect(&p1()).await.unwrap();
        manager.connect(&p1()).await.unwrap();

        // Let the dispatcher drain the first link's disconnect event
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.active_device(), Some(p1()));
        assert!(manager.devices().get(&p1()).unwrap().connected);
        assert!(platform.is_linked(&p1()));

        // A real link loss on the new session still counts
        platform.drop_link(&p1());
        wait_for(|| manager.active_device().is_none()).await;
        assert!(!manager.devices().get(&p1()).unwrap().connected);
    }

    #[tokio::test]
    async fn test_old_disconnect_does_not_abort_pending_reconnect() {
        let platform = platform();
        let manager = started(&platform).await;
        manager.connect(&p1()).await.unwrap();
        manager.disconnect(&p1()).await.unwrap();

        platform.set_connect_delay(Duration::from_millis(50));
        manager.connect(&p1()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.active_device(), Some(p1()));
        assert!(platform.is_linked(&p1()));
    }

    #[tokio::test]
    async fn test_cancelled_connect_releases_slot() {
        let platform = platform();
        let manager = started(&platform).await;
        platform.set_connect_delay(Duration::from_millis(100));
        let id = p1();

        let cancelled = tokio::time::timeout(Duration::from_millis(10), manager.connect(&id)).await;
        assert!(cancelled.is_err());
        assert!(manager.active_device().is_none());
        assert!(!manager.devices().get(&p1()).unwrap().connected);

        platform.set_connect_delay(Duration::ZERO);
        let p2 = DeviceId::new("p2");
        manager.connect(&p2).await.unwrap();
        assert_eq!(manager.active_device(), Some(p2));
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting_is_quiet() {
        let platform = platform();
        let manager = started(&platform).await;
        platform.set_connect_delay(Duration::from_millis(100));
        let mut rx = manager.subscribe();
        let id = p1();

        let (result, ()) = tokio::join!(manager.connect(&id), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            manager.disconnect(&id).await.unwrap();
        });
        assert!(matches!(result, Err(SessionError::Aborted(_))));
        assert!(!manager.devices().get(&p1()).unwrap().connected);

        while let Ok(event) = rx.try_recv() {
            assert!(
                !matches!(event, ManagerEvent::Disconnected { .. } | ManagerEvent::Snapshot(_)),
                "unexpected {event:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_late_notification_discarded() {
        let platform = platform();
        let manager = started(&platform).await;
        manager.connect(&p1()).await.unwrap();
        manager.disconnect(&p1()).await.unwrap();

        platform.notify(&p1(), 9.9);
        platform.inject(PlatformEvent::Discovered(Advertisement::new(
            DeviceId::new("marker"),
            None,
            None,
        )));
        wait_for(|| manager.devices().get(&DeviceId::new("marker")).is_some()).await;

        assert_eq!(manager.devices().get(&p1()).unwrap().last_value, 0.0);
    }

    #[tokio::test]
    async fn test_peripheral_drop_during_connect() {
        let platform = platform();
        let manager = started(&platform).await;
        platform.set_connect_delay(Duration::from_millis(100));
        let id = p1();

        let (result, ()) = tokio::join!(manager.connect(&id), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            platform.drop_link(&id);
        });

        assert!(matches!(result, Err(SessionError::Aborted(_))));
        assert!(manager.active_device().is_none());
        assert!(!manager.devices().get(&p1()).unwrap().connected);
        assert!(!platform.is_linked(&p1()));

        platform.set_connect_delay(Duration::ZERO);
        manager.connect(&p1()).await.unwrap();
    }

    #[tokio::test]
    async fn test_unsolicited_disconnect() {
        let platform = platform();
        let manager = started(&platform).await;
        manager.connect(&p1()).await.unwrap();
        let mut rx = manager.subscribe();

        platform.drop_link(&p1());
        let event = next_matching(&mut rx, |e| matches!(e, ManagerEvent::Disconnected { .. })).await;
        assert!(matches!(event, ManagerEvent::Disconnected { unsolicited: true, .. }));
        assert!(manager.active_device().is_none());
    }

    #[tokio::test]
    async fn test_missing_service_fails_connect() {
        let platform = platform();
        let manager = started(&platform).await;
        let other = DeviceId::new("o1");

        let err = manager.connect(&other).await.unwrap_err();
        assert!(matches!(err, SessionError::MissingCharacteristic(_)));
        assert!(!platform.is_linked(&other));
        assert!(!manager.devices().get(&other).unwrap().connected);

        manager.connect(&p1()).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_releases_slot() {
        let platform = platform();
        let manager = started(&platform).await;
        platform.fail_next_connect("refused");

        let err = manager.connect(&p1()).await.unwrap_err();
        assert!(matches!(err, SessionError::ConnectionFailed { .. }));
        assert!(manager.active_device().is_none());

        manager.connect(&p1()).await.unwrap();
        assert_eq!(manager.active_device(), Some(p1()));
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let platform = platform();
        let manager = started(&platform).await;
        platform.set_connect_delay(Duration::from_secs(5));

        let err = manager.connect(&p1()).await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout { operation: "connect", .. }));
        assert!(manager.active_device().is_none());
    }

    #[tokio::test]
    async fn test_calibration_written_to_active_device() {
        let platform = platform();
        let manager = started(&platform).await;
        manager.connect(&p1()).await.unwrap();

        let input = CalibrationInput::new("2.0", "1.0", "");
        let coefficients = manager.calibrate_active(&input).await.unwrap();
        assert_eq!(coefficients.slope(), -3.0);
        assert_eq!(coefficients.intercept(), 10.0);
        assert_eq!(platform.calibration_for(&p1()), Some(coefficients));

        let writes = platform.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].1, CALIBRATION_CHAR_UUID);
        assert_eq!(writes[0].2, b"eyJtIjotMy4wLCJiIjoxMC4wfQ==".to_vec());
    }

    #[tokio::test]
    async fn test_calibration_preconditions() {
        let platform = platform();
        let manager = started(&platform).await;

        let bad = CalibrationInput::new("", "1.0", "");
        assert!(matches!(
            manager.calibrate_active(&bad).await,
            Err(SessionError::Calibration(_))
        ));

        let good = CalibrationInput::new("2.0", "1.0", "");
        assert!(matches!(
            manager.calibrate_active(&good).await,
            Err(SessionError::NoActiveDevice)
        ));

        let coefficients = good.coefficients().unwrap();
        assert!(matches!(
            manager.send_calibration(&p1(), &coefficients).await,
            Err(SessionError::NotConnected(_))
        ));
        assert!(platform.writes().is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_keeps_connection() {
        let platform = platform();
        let manager = started(&platform).await;
        manager.connect(&p1()).await.unwrap();
        platform.fail_next_write("gatt error");

        let input = CalibrationInput::new("2.0", "1.0", "0.0");
        let err = manager.calibrate_active(&input).await.unwrap_err();
        assert!(matches!(err, SessionError::Platform(_)));
        assert_eq!(manager.active_device(), Some(p1()));
        assert!(manager.calibrate_active(&input).await.is_ok());
    }

    #[tokio::test]
    async fn test_scan_failure_reported() {
        let platform = platform();
        let manager = started(&platform).await;
        let mut rx = manager.subscribe();

        platform.inject(PlatformEvent::ScanFailed("radio reset".into()));
        let event = next_matching(&mut rx, |e| matches!(e, ManagerEvent::ScanError(_))).await;
        assert!(matches!(event, ManagerEvent::ScanError(reason) if reason == "radio reset"));
        assert!(!manager.is_scanning().await);

        manager.rescan().await.unwrap();
        assert!(manager.is_scanning().await);
    }

    #[tokio::test]
    async fn test_scan_waits_for_power_on() {
        let platform = Arc::new(SimulatedPlatform::new(SimulatedConfig {
            sensors: vec![VirtualSensor::ph_probe("p1", Some("pH-1"), 1.0)],
            initial_state: AdapterState::PoweredOff,
            ..SimulatedConfig::default()
        }));
        let manager = SessionManager::start(platform.clone(), config()).await.unwrap();
        assert!(!manager.is_scanning().await);

        platform.set_adapter_state(AdapterState::PoweredOn);
        wait_for(|| manager.devices().len() == 1).await;
        assert!(platform.is_scanning());
    }

    #[tokio::test]
    async fn test_shutdown() {
        let platform = platform();
        let manager = started(&platform).await;
        manager.connect(&p1()).await.unwrap();

        manager.shutdown().await;
        manager.shutdown().await;
        assert!(!platform.is_linked(&p1()));
        assert!(matches!(manager.connect(&p1()).await, Err(SessionError::ShutDown)));
        assert!(matches!(manager.rescan().await, Err(SessionError::ShutDown)));
    }
}
