//! Wire protocol for the pH sensor peripheral
//!
//! The sensor exposes a single custom GATT service with two characteristics:
//!
//! | Characteristic | UUID | Direction | Payload |
//! |----------------|------|-----------|---------|
//! | pH reading | `70ceca29-8ff7-49af-8896-790d7bb30967` | notify | 4 bytes, little-endian `f32` |
//! | Calibration | `8a1f9b2e-1234-5678-9abc-def012345678` | write with response | base64 text of `{"m":..,"b":..}` |
//!
//! Sample decoding runs on every notification, so it never fails: anything
//! too short to hold a float collapses to [`SAMPLE_SENTINEL`].

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::calibration::CalibrationCoefficients;
use crate::error::ProtocolError;

// ============================================================================
// GATT Contract
// ============================================================================

/// pH sensor service UUID
pub const PH_SERVICE_UUID: Uuid = Uuid::from_u128(0xb197db85_f1d2_4023_a9f1_ceda630dd39b);

/// pH reading characteristic UUID (notify)
pub const PH_READING_CHAR_UUID: Uuid = Uuid::from_u128(0x70ceca29_8ff7_49af_8896_790d7bb30967);

/// Calibration characteristic UUID (write with response)
pub const CALIBRATION_CHAR_UUID: Uuid = Uuid::from_u128(0x8a1f9b2e_1234_5678_9abc_def012345678);

/// Size of a binary sample payload in bytes.
pub const SAMPLE_LEN: usize = 4;

/// Value reported for absent or truncated payloads.
pub const SAMPLE_SENTINEL: f32 = 0.0;

// ============================================================================
// Sample Decoding
// ============================================================================

/// Decode a binary pH notification.
///
/// Reads a little-endian IEEE-754 `f32` at offset 0. Trailing bytes are
/// ignored; payloads shorter than [`SAMPLE_LEN`] yield [`SAMPLE_SENTINEL`].
#[must_use]
pub fn decode_sample(raw: &[u8]) -> f32 {
    raw.get(..SAMPLE_LEN)
        .and_then(|bytes| <[u8; SAMPLE_LEN]>::try_from(bytes).ok())
        .map_or(SAMPLE_SENTINEL, f32::from_le_bytes)
}

/// Decode a text pH notification (early firmware sent the value as UTF-8).
#[must_use]
pub fn decode_text_sample(raw: &[u8]) -> f32 {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|text| text.trim().trim_end_matches('\0').parse::<f32>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(SAMPLE_SENTINEL)
}

/// Encoding used by the peripheral for pH notifications.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    /// 4-byte little-endian `f32` (current firmware)
    #[default]
    Float32Le,
    /// UTF-8 decimal text (early firmware)
    Utf8Text,
}

impl SampleFormat {
    /// Decode a notification payload in this format.
    #[must_use]
    pub fn decode(self, raw: &[u8]) -> f32 {
        match self {
            Self::Float32Le => decode_sample(raw),
            Self::Utf8Text => decode_text_sample(raw),
        }
    }
}

// ============================================================================
// Calibration Command
// ============================================================================

/// JSON body of the calibration command.
#[derive(Debug, Serialize, Deserialize)]
struct CalibrationBody {
    m: f64,
    b: f64,
}

/// Encode coefficients for the calibration characteristic.
///
/// The body is `{"m": slope, "b": intercept}` serialized as JSON, and the
/// UTF-8 bytes of that JSON are base64 encoded. The returned bytes are the
/// ASCII base64 text; the peripheral rejects raw JSON.
///
/// # Errors
///
/// Returns [`ProtocolError::Json`] if serialization fails.
pub fn encode_calibration(coeffs: &CalibrationCoefficients) -> Result<Vec<u8>, ProtocolError> {
    let body = CalibrationBody {
        m: coeffs.slope(),
        b: coeffs.intercept(),
    };
    let json = serde_json::to_vec(&body)?;
    Ok(STANDARD.encode(json).into_bytes())
}

/// Decode a calibration command back into coefficients.
///
/// # Errors
///
/// Fails if the payload is not base64, not the expected JSON object, or
/// carries non-finite values.
pub fn decode_calibration(payload: &[u8]) -> Result<CalibrationCoefficients, ProtocolError> {
    let json = STANDARD.decode(payload)?;
    let body: CalibrationBody = serde_json::from_slice(&json)?;
    Ok(CalibrationCoefficients::new(body.m, body.b)?)
}
