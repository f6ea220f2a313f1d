//! Platform seam.
//!
//! A BLE stack reaches the session layer through two paths:
//! - Commands: the async methods of [`BlePlatform`], each resolving when the
//!   stack acknowledges or fails the request
//! - Events: a single [`PlatformEvent`] stream (adapter state, discovery,
//!   disconnection, notification), consumed in arrival order by the
//!   manager's dispatcher
//!
//! Implementations: [`super::ble::BtleplugPlatform`] for real radios and
//! [`super::simulated::SimulatedPlatform`] for virtual sensors.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use phsense_core::types::DeviceId;

// ============================================================================
// Events
// ============================================================================

/// Power state of the local Bluetooth adapter.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AdapterState {
    /// Not yet reported by the stack
    Unknown,
    /// Radio off or unavailable
    PoweredOff,
    /// Ready for scanning and connections
    PoweredOn,
}

impl AdapterState {
    /// Whether scanning may start.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

/// An advertisement sighting.
#[derive(Clone, Debug, PartialEq)]
pub struct Advertisement {
    /// Peripheral identity
    pub id: DeviceId,
    /// Advertised local name
    pub name: Option<String>,
    /// Signal strength (dBm)
    pub rssi: Option<i16>,
    /// Advertised service UUIDs
    pub services: Vec<Uuid>,
}

impl Advertisement {
    /// Create an advertisement with no services listed.
    #[must_use]
    pub fn new(id: DeviceId, name: Option<String>, rssi: Option<i16>) -> Self {
        Self {
            id,
            name,
            rssi,
            services: Vec::new(),
        }
    }
}

/// Events delivered by the platform.
#[derive(Clone, Debug)]
pub enum PlatformEvent {
    /// Adapter power state changed
    StateChanged(AdapterState),
    /// A peripheral advertised (possibly again)
    Discovered(Advertisement),
    /// A link went down, whether requested or not
    Disconnected(DeviceId),
    /// A subscribed characteristic pushed a value
    Notification {
        /// Source peripheral
        device_id: DeviceId,
        /// Characteristic that notified
        characteristic: Uuid,
        /// Raw payload
        value: Vec<u8>,
    },
    /// Discovery stopped because of a stack error
    ScanFailed(String),
}

/// A characteristic found during service discovery.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DiscoveredCharacteristic {
    /// Owning service
    pub service: Uuid,
    /// Characteristic UUID
    pub uuid: Uuid,
}

// ============================================================================
// Errors
// ============================================================================

/// Errors reported by a platform implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    /// No usable adapter, or the adapter is powered off
    #[error("Bluetooth unavailable: {0}")]
    Unavailable(String),

    /// The stack does not know this peripheral
    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(DeviceId),

    /// No link to this peripheral
    #[error("Peripheral not connected: {0}")]
    NotConnected(DeviceId),

    /// The characteristic was not found on the peripheral
    #[error("Characteristic not found: {0}")]
    MissingCharacteristic(Uuid),

    /// Any other stack failure (connect refused, write rejected, ...)
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type for platform operations.
pub type PlatformResult<T> = Result<T, PlatformError>;

// ============================================================================
// Platform Trait
// ============================================================================

/// Commands a BLE stack must support for one sensor session.
#[async_trait]
pub trait BlePlatform: Send + Sync + 'static {
    /// Current adapter state.
    async fn adapter_state(&self) -> PlatformResult<AdapterState>;

    /// Start discovery, optionally restricted to peripherals advertising
    /// one of `services`.
    async fn start_scan(&self, services: Vec<Uuid>) -> PlatformResult<()>;

    /// Stop discovery.
    async fn stop_scan(&self) -> PlatformResult<()>;

    /// Open a transport-level link.
    async fn connect(&self, id: &DeviceId) -> PlatformResult<()>;

    /// Discover all services and characteristics of a linked peripheral.
    async fn discover_services(&self, id: &DeviceId) -> PlatformResult<Vec<DiscoveredCharacteristic>>;

    /// Enable notifications on a characteristic. Values arrive as
    /// [`PlatformEvent::Notification`].
    async fn subscribe(&self, id: &DeviceId, characteristic: Uuid) -> PlatformResult<()>;

    /// Write with response.
    async fn write(&self, id: &DeviceId, characteristic: Uuid, payload: &[u8]) -> PlatformResult<()>;

    /// Cancel the link and any subscriptions on it.
    async fn disconnect(&self, id: &DeviceId) -> PlatformResult<()>;

    /// Whether a transport link to `id` is currently up.
    async fn is_connected(&self, id: &DeviceId) -> PlatformResult<bool>;

    /// Hand over the event stream. Returns `None` after the first call.
    fn take_events(&self) -> Option<mpsc::Receiver<PlatformEvent>>;

    /// Release radio resources. Called once by the manager on shutdown.
    async fn shutdown(&self) {}
}
