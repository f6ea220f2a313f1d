//! Bridge between a BLE stack and the pH sensor session
//!
//! This module provides:
//! - [`platform`]: The seam to a BLE stack (commands + event stream)
//! - [`ble`]: btleplug implementation of that seam (requires `ble` feature)
//! - [`simulated`]: Virtual sensors behind the same seam
//! - [`registry`]: Discovered devices keyed by id
//! - [`scanner`]: Discovery and de-duplication
//! - [`session`]: Connection state machine
//! - [`manager`]: Facade composing all of the above
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use phsense_native::bridge::{ManagerEvent, SessionConfig, SessionManager, SimulatedPlatform};
//!
//! let platform = Arc::new(SimulatedPlatform::demo());
//! let manager = SessionManager::start(platform, SessionConfig::default()).await?;
//! let mut events = manager.subscribe();
//!
//! while let Ok(event) = events.recv().await {
//!     match event {
//!         ManagerEvent::Snapshot(devices) => { ... }
//!         ManagerEvent::Sample(sample) => { ... }
//!         _ => {}
//!     }
//! }
//! ```

#[cfg(feature = "ble")]
pub mod ble;

pub mod config;
pub mod error;
pub mod manager;
pub mod platform;
pub mod registry;
pub mod scanner;
pub mod session;
pub mod simulated;

// Re-export key types
pub use config::{ScanFilterConfig, SessionConfig};
pub use error::{SessionError, SessionResult};
pub use manager::{ManagerEvent, SessionManager};
pub use platform::{
    AdapterState, Advertisement, BlePlatform, DiscoveredCharacteristic, PlatformError,
    PlatformEvent, PlatformResult,
};
pub use registry::{DeviceRegistry, RegistryChange, RegistrySnapshot};
pub use scanner::{ScanController, ScanHandle};
pub use session::{SessionSlot, SessionState};
pub use simulated::{SimulatedConfig, SimulatedPlatform, VirtualSensor};

#[cfg(feature = "ble")]
pub use ble::BtleplugPlatform;
