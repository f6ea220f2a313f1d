//! Buffer calibration
//!
//! The probe is dipped in pH 4.0 and pH 7.0 buffers (optionally pH 10.0)
//! and the voltage is noted for each. The peripheral then maps voltage to pH
//! with `pH = m * voltage + b`.
//!
//! With two points the slope is taken from the 4/7 pair. With three points
//! the 4/7 and 7/10 slopes are averaged. The intercept is anchored at the
//! pH 4.0 point in both cases.

use serde::{Deserialize, Serialize};

use crate::error::{CalibrationError, CalibrationResult};

/// Nominal pH of the acidic buffer.
pub const BUFFER_PH_4: f64 = 4.0;
/// Nominal pH of the neutral buffer.
pub const BUFFER_PH_7: f64 = 7.0;
/// Nominal pH of the alkaline buffer.
pub const BUFFER_PH_10: f64 = 10.0;

/// One measured buffer: probe voltage and the buffer's known pH.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    /// Probe voltage in the buffer
    pub voltage: f64,
    /// Known pH of the buffer
    pub ph: f64,
}

impl CalibrationPoint {
    /// Create a calibration point.
    #[must_use]
    pub const fn new(voltage: f64, ph: f64) -> Self {
        Self { voltage, ph }
    }
}

/// Linear voltage-to-pH mapping sent to the peripheral.
///
/// Fields are private so a value, once built, is always finite and never
/// changes.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationCoefficients {
    slope: f64,
    intercept: f64,
}

impl CalibrationCoefficients {
    /// Build coefficients from an explicit slope and intercept.
    ///
    /// # Errors
    ///
    /// Returns [`CalibrationError::NonFinite`] for NaN or infinite values.
    pub fn new(slope: f64, intercept: f64) -> CalibrationResult<Self> {
        if !slope.is_finite() || !intercept.is_finite() {
            return Err(CalibrationError::NonFinite { slope, intercept });
        }
        Ok(Self { slope, intercept })
    }

    /// Fit coefficients from two or three buffer points.
    ///
    /// `low` anchors the intercept. `high`, when present, contributes a
    /// second slope that is averaged with the `low`/`mid` slope.
    ///
    /// # Errors
    ///
    /// Fails when two consecutive points share a voltage.
    pub fn from_points(
        low: CalibrationPoint,
        mid: CalibrationPoint,
        high: Option<CalibrationPoint>,
    ) -> CalibrationResult<Self> {
        let slope_low = slope_between(low, mid)?;
        let slope = match high {
            Some(high) => (slope_low + slope_between(mid, high)?) / 2.0,
            None => slope_low,
        };
        let intercept = low.ph - slope * low.voltage;
        Self::new(slope, intercept)
    }

    /// Fit coefficients from voltages measured in the standard buffers.
    ///
    /// # Errors
    ///
    /// Same as [`Self::from_points`].
    pub fn from_buffers(v4: f64, v7: f64, v10: Option<f64>) -> CalibrationResult<Self> {
        Self::from_points(
            CalibrationPoint::new(v4, BUFFER_PH_4),
            CalibrationPoint::new(v7, BUFFER_PH_7),
            v10.map(|v| CalibrationPoint::new(v, BUFFER_PH_10)),
        )
    }

    /// Slope `m`.
    #[must_use]
    pub const fn slope(&self) -> f64 {
        self.slope
    }

    /// Intercept `b`.
    #[must_use]
    pub const fn intercept(&self) -> f64 {
        self.intercept
    }

    /// Map a probe voltage to pH.
    #[must_use]
    pub fn apply(&self, voltage: f64) -> f64 {
        self.slope * voltage + self.intercept
    }
}

fn slope_between(a: CalibrationPoint, b: CalibrationPoint) -> CalibrationResult<f64> {
    let dv = b.voltage - a.voltage;
    if dv == 0.0 {
        return Err(CalibrationError::CoincidentVoltages {
            low_ph: a.ph,
            high_ph: b.ph,
            voltage: a.voltage,
        });
    }
    Ok((b.ph - a.ph) / dv)
}

// ============================================================================
// Text Input
// ============================================================================

/// Voltages as typed by the user, one field per buffer.
///
/// The pH 4.0 and pH 7.0 fields are required; the pH 10.0 field may be left
/// blank. Parsing happens before anything is encoded or sent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationInput {
    /// Voltage measured in pH 4.0 buffer
    pub ph4: String,
    /// Voltage measured in pH 7.0 buffer
    pub ph7: String,
    /// Voltage measured in pH 10.0 buffer (optional)
    pub ph10: String,
}

impl CalibrationInput {
    /// Create input from the three text fields.
    #[must_use]
    pub fn new(ph4: impl Into<String>, ph7: impl Into<String>, ph10: impl Into<String>) -> Self {
        Self {
            ph4: ph4.into(),
            ph7: ph7.into(),
            ph10: ph10.into(),
        }
    }

    /// Parse the fields and fit coefficients.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::InvalidVoltage`] if a required field is blank or
    /// non-numeric, or if the optional field is filled with something that
    /// is not a number. Coincident voltages are reported as for
    /// [`CalibrationCoefficients::from_points`].
    pub fn coefficients(&self) -> CalibrationResult<CalibrationCoefficients> {
        let v4 = parse_voltage(&self.ph4, BUFFER_PH_4)?;
        let v7 = parse_voltage(&self.ph7, BUFFER_PH_7)?;
        let v10 = if self.ph10.trim().is_empty() {
            None
        } else {
            Some(parse_voltage(&self.ph10, BUFFER_PH_10)?)
        };
        CalibrationCoefficients::from_buffers(v4, v7, v10)
    }
}

fn parse_voltage(input: &str, buffer_ph: f64) -> CalibrationResult<f64> {
    input
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| CalibrationError::InvalidVoltage {
            buffer_ph,
            input: input.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_point_exact_arithmetic() {
        let coeffs = CalibrationCoefficients::from_buffers(2.0, 1.0, Some(0.0)).unwrap();
        assert_eq!(coeffs.slope(), -3.0);
        assert_eq!(coeffs.intercept(), 10.0);
        assert_eq!(coeffs.apply(2.0), 4.0);
        assert_eq!(coeffs.apply(1.0), 7.0);
        assert_eq!(coeffs.apply(0.0), 10.0);
    }

    #[test]
    fn test_two_point_uses_low_slope() {
        let coeffs = CalibrationCoefficients::from_buffers(2.5, 2.0, None).unwrap();
        // (7 - 4) / (2.0 - 2.5) = -6
        assert_eq!(coeffs.slope(), -6.0);
        assert_eq!(coeffs.intercept(), 19.0);
    }

    #[test]
    fn test_three_point_averages_slopes() {
        // slopes -3 and -6 -> -4.5, b = 4 + 4.5 * 2 = 13
        let coeffs = CalibrationCoefficients::from_buffers(2.0, 1.0, Some(0.5)).unwrap();
        assert_eq!(coeffs.slope(), -4.5);
        assert_eq!(coeffs.intercept(), 13.0);
    }

    #[test]
    fn test_coincident_voltages_rejected() {
        let err = CalibrationCoefficients::from_buffers(1.0, 1.0, None).unwrap_err();
        assert!(matches!(err, CalibrationError::CoincidentVoltages { .. }));

        let err = CalibrationCoefficients::from_buffers(2.0, 1.0, Some(1.0)).unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::CoincidentVoltages { low_ph, high_ph, .. } if low_ph == 7.0 && high_ph == 10.0
        ));
    }

    #[test]
    fn test_non_finite_rejected() {
        assert!(CalibrationCoefficients::new(f64::NAN, 1.0).is_err());
        assert!(CalibrationCoefficients::new(1.0, f64::INFINITY).is_err());
    }

    #[test]
    fn test_input_parses_fields() {
        let input = CalibrationInput::new(" 2.0", "1.0 ", "0");
        let coeffs = input.coefficients().unwrap();
        assert_eq!(coeffs.slope(), -3.0);
        assert_eq!(coeffs.intercept(), 10.0);
    }

    #[test]
    fn test_input_optional_third_point() {
        let input = CalibrationInput::new("2.5", "2.0", "");
        assert_eq!(input.coefficients().unwrap().slope(), -6.0);
    }

    #[test]
    fn test_input_rejects_non_numeric_required() {
        let err = CalibrationInput::new("abc", "1.0", "").coefficients().unwrap_err();
        assert_eq!(
            err,
            CalibrationError::InvalidVoltage {
                buffer_ph: 4.0,
                input: "abc".to_string()
            }
        );

        let err = CalibrationInput::new("2.0", "", "").coefficients().unwrap_err();
        assert!(matches!(err, CalibrationError::InvalidVoltage { buffer_ph, .. } if buffer_ph == 7.0));
    }

    #[test]
    fn test_input_rejects_bad_optional_and_non_finite() {
        let err = CalibrationInput::new("2.0", "1.0", "x").coefficients().unwrap_err();
        assert!(matches!(err, CalibrationError::InvalidVoltage { buffer_ph, .. } if buffer_ph == 10.0));

        let err = CalibrationInput::new("inf", "1.0", "").coefficients().unwrap_err();
        assert!(matches!(err, CalibrationError::InvalidVoltage { .. }));
    }
}
