//! phsense Core - shared types, wire protocol and calibration math
//!
//! This crate holds everything about the pH sensor that does not depend on
//! a Bluetooth stack: the device records the host tracks, the GATT contract
//! exposed by the peripheral, the codec for its payloads and the linear
//! calibration that maps probe voltage to pH.
//!
//! # Modules
//!
//! - [`types`]: Device records, identifiers and timestamped samples
//! - [`protocol`]: GATT UUIDs, sample decoding and calibration encoding
//! - [`calibration`]: Two/three-point buffer calibration
//! - [`error`]: Error types for the protocol and calibration layers
//!
//! # Example
//!
//! ```rust
//! use phsense_core::calibration::CalibrationCoefficients;
//! use phsense_core::protocol::{decode_sample, encode_calibration};
//!
//! let ph = decode_sample(&7.0_f32.to_le_bytes());
//! assert_eq!(ph, 7.0);
//!
//! let coeffs = CalibrationCoefficients::from_buffers(2.0, 1.0, Some(0.0)).unwrap();
//! let wire = encode_calibration(&coeffs).unwrap();
//! assert!(!wire.is_empty());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod calibration;
pub mod error;
pub mod protocol;
pub mod types;

// Re-export commonly used types at crate root
pub use calibration::{CalibrationCoefficients, CalibrationInput, CalibrationPoint};
pub use error::{CalibrationError, ProtocolError};
pub use protocol::{SampleFormat, CALIBRATION_CHAR_UUID, PH_READING_CHAR_UUID, PH_SERVICE_UUID};
pub use types::{DeviceId, DeviceRecord, Sample};
