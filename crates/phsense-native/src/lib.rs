//! phsense Native - host-side BLE session management for pH sensors
//!
//! This crate drives a pH sensor peripheral from a host with a Bluetooth
//! radio:
//! - Discovery with de-duplication into a device registry
//! - A single-connection session state machine (connect, discover,
//!   subscribe, disconnect)
//! - Live decoding of pH notifications
//! - Calibration writes
//! - A history store for decoded readings
//!
//! # Modules
//!
//! - [`bridge`]: Platform seam, registry, scanner, session and manager
//! - [`history`]: Reading history collaborator (memory and SQLite)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod bridge;
pub mod history;

// Re-export key types
pub use bridge::{
    BlePlatform, ManagerEvent, PlatformEvent, SessionConfig, SessionError, SessionManager,
    SessionResult, SimulatedConfig, SimulatedPlatform,
};
pub use history::{HistoryRecorder, HistoryStore, MemoryHistory, TimeWindow};

#[cfg(feature = "ble")]
pub use bridge::BtleplugPlatform;

#[cfg(feature = "database")]
pub use history::SqliteHistory;
