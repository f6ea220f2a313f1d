//! Scan controller.
//!
//! Starts discovery once the adapter first reports ready, records sightings
//! into the registry without duplicates, and stops discovery before a
//! connection attempt.

use phsense_core::types::DeviceId;
use tracing::{debug, info, warn};

use super::config::ScanFilterConfig;
use super::error::SessionResult;
use super::platform::{AdapterState, Advertisement, BlePlatform};
use super::registry::{DeviceRegistry, RegistryChange};

/// Token for one scan pass.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ScanHandle {
    generation: u64,
}

/// Drives peripheral discovery.
#[derive(Debug)]
pub struct ScanController {
    filter: ScanFilterConfig,
    started_on_ready: bool,
    active: Option<ScanHandle>,
    next_generation: u64,
}

impl ScanController {
    /// Create a controller with the given filter.
    #[must_use]
    pub fn new(filter: ScanFilterConfig) -> Self {
        Self {
            filter,
            started_on_ready: false,
            active: None,
            next_generation: 0,
        }
    }

    /// Whether a scan pass is running.
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.active.is_some()
    }

    /// The running scan pass, if any.
    #[must_use]
    pub fn active_handle(&self) -> Option<ScanHandle> {
        self.active
    }

    /// React to an adapter state report.
    ///
    /// The first report of [`AdapterState::PoweredOn`] starts a scan. Every
    /// later ready report is ignored; restarts go through [`Self::start`].
    ///
    /// # Errors
    ///
    /// Propagates the platform error if the automatic start fails. The
    /// automatic start is still considered spent.
    pub async fn on_adapter_state(
        &mut self,
        platform: &dyn BlePlatform,
        state: AdapterState,
    ) -> SessionResult<Option<ScanHandle>> {
        if !state.is_ready() {
            debug!("Adapter state {state:?}, not scanning");
            if state == AdapterState::PoweredOff {
                self.active = None;
            }
            return Ok(None);
        }
        if self.started_on_ready {
            debug!("Adapter ready again, automatic scan already started once");
            return Ok(None);
        }

        self.started_on_ready = true;
        self.start(platform).await.map(Some)
    }

    /// Start a scan pass.
    ///
    /// If a pass is already running its handle is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns the platform error; the controller stays restartable.
    pub async fn start(&mut self, platform: &dyn BlePlatform) -> SessionResult<ScanHandle> {
        if let Some(handle) = self.active {
            return Ok(handle);
        }

        if let Err(e) = platform.start_scan(self.filter.services()).await {
            warn!("Failed to start scan: {e}");
            return Err(e.into());
        }

        self.next_generation += 1;
        let handle = ScanHandle {
            generation: self.next_generation,
        };
        self.active = Some(handle);
        info!("Scanning for pH sensors (pass {})", handle.generation);
        Ok(handle)
    }

    /// Stop the scan pass identified by `handle`.
    ///
    /// A stale handle, or no running pass, is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the platform error. The pass is considered stopped anyway.
    pub async fn stop(&mut self, platform: &dyn BlePlatform, handle: ScanHandle) -> SessionResult<()> {
        if self.active != Some(handle) {
            debug!("Ignoring stop for stale scan pass {}", handle.generation);
            return Ok(());
        }

        self.active = None;
        platform.stop_scan().await?;
        info!("Scan pass {} stopped", handle.generation);
        Ok(())
    }

    /// Stop whatever pass is running.
    ///
    /// # Errors
    ///
    /// Same as [`Self::stop`].
    pub async fn stop_active(&mut self, platform: &dyn BlePlatform) -> SessionResult<()> {
        match self.active {
            Some(handle) => self.stop(platform, handle).await,
            None => Ok(()),
        }
    }

    /// The platform reported that discovery died.
    pub fn on_scan_failed(&mut self, reason: &str) {
        warn!("Scan failed: {reason}");
        self.active = None;
    }

    /// Record an advertisement into `registry`.
    pub fn handle_advertisement(
        &self,
        registry: &mut DeviceRegistry,
        advertisement: &Advertisement,
    ) -> RegistryChange {
        record_advertisement(registry, &self.filter, advertisement)
    }
}

/// Apply the filter and the insert-if-absent rule for one advertisement.
pub fn record_advertisement(
    registry: &mut DeviceRegistry,
    filter: &ScanFilterConfig,
    advertisement: &Advertisement,
) -> RegistryChange {
    let name = advertisement.name.as_deref();
    if !filter.accepts_name(name) && !registry.contains(&advertisement.id) {
        return RegistryChange::Unchanged;
    }

    let change = registry.record_sighting(&advertisement.id, name, advertisement.rssi);
    if change == RegistryChange::Inserted {
        log_discovery(&advertisement.id, name, advertisement.rssi);
    }
    change
}

fn log_discovery(id: &DeviceId, name: Option<&str>, rssi: Option<i16>) {
    match rssi {
        Some(rssi) => info!("Discovered {id} ({}) at {rssi} dBm", name.unwrap_or("unnamed")),
        None => info!("Discovered {id} ({})", name.unwrap_or("unnamed")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::simulated::{SimulatedConfig, SimulatedPlatform};

    fn advert(id: &str, name: Option<&str>) -> Advertisement {
        Advertisement::new(DeviceId::new(id), name.map(str::to_string), Some(-55))
    }

    #[test]
    fn test_duplicate_advertisement_single_record() {
        let scanner = ScanController::new(ScanFilterConfig::default());
        let mut registry = DeviceRegistry::new();

        assert_eq!(
            scanner.handle_advertisement(&mut registry, &advert("a", Some("pH-A"))),
            RegistryChange::Inserted
        );
        assert_eq!(
            scanner.handle_advertisement(&mut registry, &advert("a", Some("pH-A"))),
            RegistryChange::Unchanged
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_name_filter() {
        let scanner = ScanController::new(ScanFilterConfig {
            name_prefix: Some("pH".into()),
            require_service: false,
        });
        let mut registry = DeviceRegistry::new();

        scanner.handle_advertisement(&mut registry, &advert("tv", Some("Television")));
        scanner.handle_advertisement(&mut registry, &advert("anon", None));
        scanner.handle_advertisement(&mut registry, &advert("probe", Some("pH-Probe")));

        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&DeviceId::new("probe")));
    }

    #[tokio::test]
    async fn test_scan_starts_once_on_ready() {
        let platform = SimulatedPlatform::new(SimulatedConfig::default());
        let mut scanner = ScanController::new(ScanFilterConfig::default());

        let none = scanner
            .on_adapter_state(&platform, AdapterState::PoweredOff)
            .await
            .unwrap();
        assert!(none.is_none());
        assert!(!platform.is_scanning());

        let first = scanner
            .on_adapter_state(&platform, AdapterState::PoweredOn)
            .await
            .unwrap();
        assert!(first.is_some());
        assert!(platform.is_scanning());

        scanner.stop_active(&platform).await.unwrap();
        assert!(!platform.is_scanning());

        // A second ready report does not restart discovery
        let second = scanner
            .on_adapter_state(&platform, AdapterState::PoweredOn)
            .await
            .unwrap();
        assert!(second.is_none());
        assert!(!platform.is_scanning());
    }

    #[tokio::test]
    async fn test_stale_handle_is_ignored() {
        let platform = SimulatedPlatform::new(SimulatedConfig::default());
        let mut scanner = ScanController::new(ScanFilterConfig::default());

        let first = scanner.start(&platform).await.unwrap();
        scanner.stop(&platform, first).await.unwrap();
        let second = scanner.start(&platform).await.unwrap();
        assert_ne!(first, second);

        scanner.stop(&platform, first).await.unwrap();
        assert!(scanner.is_scanning());
        assert!(platform.is_scanning());
    }

    #[tokio::test]
    async fn test_scan_error_is_restartable() {
        let platform = SimulatedPlatform::new(SimulatedConfig {
            initial_state: AdapterState::PoweredOff,
            ..SimulatedConfig::default()
        });
        let mut scanner = ScanController::new(ScanFilterConfig::default());

        assert!(scanner.start(&platform).await.is_err());
        assert!(!scanner.is_scanning());

        platform.set_adapter_state(AdapterState::PoweredOn);
        assert!(scanner.start(&platform).await.is_ok());
        assert!(scanner.is_scanning());
    }
}
