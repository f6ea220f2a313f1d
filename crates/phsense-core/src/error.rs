//! Error types for the phsense core
//!
//! Decoding a sample never fails (malformed payloads collapse to a sentinel),
//! so the only fallible paths here are calibration input handling and the
//! calibration command codec.

use thiserror::Error;

// ============================================================================
// Calibration Errors
// ============================================================================

/// Errors raised while turning buffer voltages into coefficients.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    /// A voltage field could not be parsed as a finite number
    #[error("Invalid voltage for pH {buffer_ph} buffer: {input:?}")]
    InvalidVoltage {
        /// Nominal pH of the buffer solution the field belongs to
        buffer_ph: f64,
        /// The raw text that was rejected
        input: String,
    },

    /// Two buffers were measured at the same voltage, so no slope exists
    #[error("Buffers pH {low_ph} and pH {high_ph} share voltage {voltage}")]
    CoincidentVoltages {
        /// Lower buffer pH
        low_ph: f64,
        /// Higher buffer pH
        high_ph: f64,
        /// The shared voltage reading
        voltage: f64,
    },

    /// Slope or intercept is NaN or infinite
    #[error("Non-finite calibration coefficients: m={slope}, b={intercept}")]
    NonFinite {
        /// Offending slope
        slope: f64,
        /// Offending intercept
        intercept: f64,
    },
}

/// Result type for calibration operations.
pub type CalibrationResult<T> = Result<T, CalibrationError>;

// ============================================================================
// Protocol Errors
// ============================================================================

/// Errors from the calibration command codec.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON serialization or parsing failed
    #[error("Calibration JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload was not valid base64 text
    #[error("Calibration payload is not base64: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The payload decoded to unusable coefficients
    #[error("Calibration payload rejected: {0}")]
    InvalidCalibration(#[from] CalibrationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_voltage_message() {
        let err = CalibrationError::InvalidVoltage {
            buffer_ph: 4.0,
            input: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid voltage for pH 4 buffer: \"abc\"");
    }

    #[test]
    fn test_protocol_error_wraps_calibration() {
        let err: ProtocolError = CalibrationError::NonFinite {
            slope: f64::NAN,
            intercept: 0.0,
        }
        .into();
        assert!(matches!(err, ProtocolError::InvalidCalibration(_)));
    }
}
