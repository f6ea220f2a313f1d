//! Session configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use phsense_core::protocol::{SampleFormat, PH_SERVICE_UUID};
use uuid::Uuid;

/// Which advertisements the scanner accepts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFilterConfig {
    /// Only record peripherals whose advertised name starts with this prefix
    pub name_prefix: Option<String>,

    /// Ask the stack to report only peripherals advertising the pH service
    pub require_service: bool,
}

impl ScanFilterConfig {
    /// Whether an advertised name passes the prefix filter.
    #[must_use]
    pub fn accepts_name(&self, name: Option<&str>) -> bool {
        match (&self.name_prefix, name) {
            (None, _) => true,
            (Some(prefix), Some(name)) => name.starts_with(prefix.as_str()),
            (Some(_), None) => false,
        }
    }

    /// Service UUIDs to hand to the platform scan.
    #[must_use]
    pub fn services(&self) -> Vec<Uuid> {
        if self.require_service {
            vec![PH_SERVICE_UUID]
        } else {
            Vec::new()
        }
    }
}

/// Configuration for the session manager.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Limit for the transport-level connect
    pub connect_timeout: Duration,

    /// Limit for service/characteristic discovery
    pub discovery_timeout: Duration,

    /// Limit for a calibration write acknowledgement
    pub write_timeout: Duration,

    /// Limit for disconnect confirmation
    pub disconnect_timeout: Duration,

    /// Depth of the observer broadcast channel
    pub event_capacity: usize,

    /// Encoding of pH notifications
    pub sample_format: SampleFormat,

    /// Scan filter
    pub scan: ScanFilterConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(5),
            disconnect_timeout: Duration::from_secs(5),
            event_capacity: 256,
            sample_format: SampleFormat::Float32Le,
            scan: ScanFilterConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.sample_format, SampleFormat::Float32Le);
        assert!(config.scan.services().is_empty());
    }

    #[test]
    fn test_name_prefix_filter() {
        let filter = ScanFilterConfig {
            name_prefix: Some("pH".to_string()),
            require_service: true,
        };
        assert!(filter.accepts_name(Some("pH-Probe-01")));
        assert!(!filter.accepts_name(Some("Speaker")));
        assert!(!filter.accepts_name(None));
        assert_eq!(filter.services(), vec![PH_SERVICE_UUID]);

        assert!(ScanFilterConfig::default().accepts_name(None));
    }
}
