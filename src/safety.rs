//! Vibration safety classification.

use serde::{Deserialize, Serialize};

use crate::traits::LedColor;

/// Fraction of the limit at which the warning band starts.
pub const WARNING_RATIO: f32 = 0.8;

/// Safety classification of the last vibration window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyLevel {
    /// Below the warning band.
    #[default]
    Safe,
    /// Between 80% of the limit and the limit (inclusive).
    Warning,
    /// Strictly above the limit.
    Unsafe,
}

impl SafetyLevel {
    /// Classify a peak vibration magnitude against `limit`.
    ///
    /// ```rust
    /// use turbine_sync::safety::SafetyLevel;
    ///
    /// assert_eq!(SafetyLevel::evaluate(5.0, 5.0), SafetyLevel::Warning);
    /// assert_eq!(SafetyLevel::evaluate(5.1, 5.0), SafetyLevel::Unsafe);
    /// assert_eq!(SafetyLevel::evaluate(1.0, 5.0), SafetyLevel::Safe);
    /// ```
    pub fn evaluate(peak: f32, limit: f32) -> Self {
        if peak > limit {
            SafetyLevel::Unsafe
        } else if peak >= limit * WARNING_RATIO {
            SafetyLevel::Warning
        } else {
            SafetyLevel::Safe
        }
    }

    /// Status LED colour for this level.
    pub fn indicator(self) -> LedColor {
        match self {
            SafetyLevel::Safe => LedColor::Green,
            SafetyLevel::Warning => LedColor::Magenta,
            SafetyLevel::Unsafe => LedColor::Red,
        }
    }

    /// Lowercase name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            SafetyLevel::Safe => "safe",
            SafetyLevel::Warning => "warning",
            SafetyLevel::Unsafe => "unsafe",
        }
    }
}

impl core::fmt::Display for SafetyLevel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_limit_is_not_unsafe() {
        assert_ne!(SafetyLevel::evaluate(5.0, 5.0), SafetyLevel::Unsafe);
    }

    #[test]
    fn above_limit_is_unsafe() {
        assert_eq!(SafetyLevel::evaluate(5.0001, 5.0), SafetyLevel::Unsafe);
    }

    #[test]
    fn warning_band_starts_at_eighty_percent() {
        let limit = 5.0;
        assert_eq!(SafetyLevel::evaluate(0.8 * limit, limit), SafetyLevel::Warning);
        assert_eq!(
            SafetyLevel::evaluate(0.8 * limit - 1e-3, limit),
            SafetyLevel::Safe
        );
    }

    #[test]
    fn works_with_other_limits() {
        assert_eq!(SafetyLevel::evaluate(9.0, 10.0), SafetyLevel::Warning);
        assert_eq!(SafetyLevel::evaluate(7.9, 10.0), SafetyLevel::Safe);
        assert_eq!(SafetyLevel::evaluate(10.5, 10.0), SafetyLevel::Unsafe);
    }

    #[test]
    fn zero_vibration_is_safe() {
        assert_eq!(SafetyLevel::evaluate(0.0, 5.0), SafetyLevel::Safe);
    }

    #[test]
    fn indicator_colours() {
        assert_eq!(SafetyLevel::Safe.indicator(), LedColor::Green);
        assert_eq!(SafetyLevel::Warning.indicator(), LedColor::Magenta);
        assert_eq!(SafetyLevel::Unsafe.indicator(), LedColor::Red);
    }

    #[test]
    fn serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&SafetyLevel::Unsafe).unwrap(),
            "\"unsafe\""
        );
    }
}
