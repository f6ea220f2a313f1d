//! Core types shared by the host tiers
//!
//! - [`DeviceId`]: opaque peripheral identity assigned by the BLE stack
//! - [`DeviceRecord`]: what the host knows about one discovered sensor
//! - [`Sample`]: a decoded reading stamped for the history store

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::protocol::SAMPLE_SENTINEL;

/// Placeholder shown for peripherals that never advertised a name.
pub const UNKNOWN_NAME: &str = "Unknown";

// ============================================================================
// Device Identity
// ============================================================================

/// Opaque peripheral identifier.
///
/// The value is whatever the platform stack hands out (a MAC address on
/// Linux, a UUID on macOS/iOS). It is stable for one OS session and is only
/// ever compared, never interpreted.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap a platform identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ============================================================================
// Device Record
// ============================================================================

/// Observed state of one discovered sensor.
///
/// Records are created on the first advertisement sighting and are then only
/// updated in place; the `id` never changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Peripheral identity, unique within the registry
    pub id: DeviceId,
    /// Advertised name, if any was seen
    pub name: Option<String>,
    /// True only while a connection with an active subscription exists
    pub connected: bool,
    /// Last decoded pH sample (sentinel `0.0` until the first notification)
    pub last_value: f32,
    /// Signal strength at first sighting (dBm)
    pub rssi: Option<i16>,
}

impl DeviceRecord {
    /// Create a record for a freshly discovered peripheral.
    #[must_use]
    pub fn discovered(id: DeviceId, name: Option<String>, rssi: Option<i16>) -> Self {
        Self {
            id,
            name,
            connected: false,
            last_value: SAMPLE_SENTINEL,
            rssi,
        }
    }

    /// Name for display, falling back to [`UNKNOWN_NAME`].
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNKNOWN_NAME)
    }

    /// Textual form of the last sample (`"0.0"` before any notification).
    #[must_use]
    pub fn last_value_text(&self) -> String {
        format!("{:?}", self.last_value)
    }

    /// Whether the peripheral advertised a usable name.
    #[must_use]
    pub fn is_named(&self) -> bool {
        matches!(self.name.as_deref(), Some(name) if !name.is_empty() && name != UNKNOWN_NAME)
    }
}

/// Presentation ordering: named devices only, sorted by name.
///
/// The registry itself keeps insertion order; this is for device pickers.
#[must_use]
pub fn sorted_for_display(records: &[DeviceRecord]) -> Vec<DeviceRecord> {
    let mut named: Vec<DeviceRecord> = records.iter().filter(|r| r.is_named()).cloned().collect();
    named.sort_by(|a, b| a.display_name().cmp(b.display_name()));
    named
}

// ============================================================================
// Samples
// ============================================================================

/// A decoded pH reading with its arrival time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Device that produced the reading
    pub device_id: DeviceId,
    /// pH value
    pub value: f32,
    /// Arrival time, milliseconds since the Unix epoch
    pub timestamp_ms: u64,
}

impl Sample {
    /// Create a sample with an explicit timestamp.
    #[must_use]
    pub fn new(device_id: DeviceId, value: f32, timestamp_ms: u64) -> Self {
        Self {
            device_id,
            value,
            timestamp_ms,
        }
    }

    /// Create a sample stamped with the current wall clock.
    #[must_use]
    pub fn now(device_id: DeviceId, value: f32) -> Self {
        Self::new(device_id, value, unix_millis(SystemTime::now()))
    }
}

/// Milliseconds since the Unix epoch, saturating at zero for earlier times.
#[must_use]
pub fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
