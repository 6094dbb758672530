//! Trend categories and glucose range conditions

use serde::{Deserialize, Serialize};

/// Lowest glucose value the sensor reports as a number, in mg/dL
pub const GLUCOSE_RANGE_FLOOR: u16 = 40;

/// Highest glucose value the sensor reports as a number, in mg/dL
pub const GLUCOSE_RANGE_CEILING: u16 = 400;

/// Discrete trend arrow derived from a rate of change in mg/dL/min
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendType {
    /// Falling faster than 3 mg/dL/min
    DownDownDown,
    /// Falling 2 to 3 mg/dL/min
    DownDown,
    /// Falling 1 to 2 mg/dL/min
    Down,
    /// Steady
    Flat,
    /// Rising 1 to 2 mg/dL/min
    Up,
    /// Rising 2 to 3 mg/dL/min
    UpUp,
    /// Rising faster than 3 mg/dL/min
    UpUpUp,
}

impl TrendType {
    /// Categorise a rate of change
    pub fn from_rate(rate: f64) -> Self {
        if rate <= -3.0 {
            TrendType::DownDownDown
        } else if rate <= -2.0 {
            TrendType::DownDown
        } else if rate <= -1.0 {
            TrendType::Down
        } else if rate < 1.0 {
            TrendType::Flat
        } else if rate < 2.0 {
            TrendType::Up
        } else if rate < 3.0 {
            TrendType::UpUp
        } else {
            TrendType::UpUpUp
        }
    }

    /// Arrow glyph used in log output
    pub fn arrow(&self) -> &'static str {
        match self {
            TrendType::DownDownDown => "⇊⇊",
            TrendType::DownDown => "⇊",
            TrendType::Down => "↓",
            TrendType::Flat => "→",
            TrendType::Up => "↑",
            TrendType::UpUp => "⇈",
            TrendType::UpUpUp => "⇈⇈",
        }
    }
}

/// Reading outside the numeric range of the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlucoseCondition {
    /// Below [`GLUCOSE_RANGE_FLOOR`]
    BelowRange,
    /// Above [`GLUCOSE_RANGE_CEILING`]
    AboveRange,
}

impl GlucoseCondition {
    /// Range condition for a glucose value; the bounds themselves are in range
    pub fn for_glucose(glucose: u16) -> Option<Self> {
        if glucose < GLUCOSE_RANGE_FLOOR {
            Some(GlucoseCondition::BelowRange)
        } else if glucose > GLUCOSE_RANGE_CEILING {
            Some(GlucoseCondition::AboveRange)
        } else {
            None
        }
    }
}

/// Decode a signed trend byte; `0x7F` means no trend
pub(crate) fn decode_trend(byte: u8) -> Option<f64> {
    if byte == 0x7F {
        None
    } else {
        Some(f64::from(byte as i8) / 10.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trend_thresholds() {
        let rates = [-4.0, -2.5, -1.5, 0.0, 1.5, 2.5, 4.0];
        let expected = [
            TrendType::DownDownDown,
            TrendType::DownDown,
            TrendType::Down,
            TrendType::Flat,
            TrendType::Up,
            TrendType::UpUp,
            TrendType::UpUpUp,
        ];
        for (rate, trend) in rates.iter().zip(expected.iter()) {
            assert_eq!(TrendType::from_rate(*rate), *trend, "rate {}", rate);
        }
    }

    #[test]
    fn test_trend_boundaries() {
        assert_eq!(TrendType::from_rate(-3.0), TrendType::DownDownDown);
        assert_eq!(TrendType::from_rate(-2.0), TrendType::DownDown);
        assert_eq!(TrendType::from_rate(-1.0), TrendType::Down);
        assert_eq!(TrendType::from_rate(-0.9), TrendType::Flat);
        assert_eq!(TrendType::from_rate(1.0), TrendType::Up);
        assert_eq!(TrendType::from_rate(2.0), TrendType::UpUp);
        assert_eq!(TrendType::from_rate(3.0), TrendType::UpUpUp);
    }

    #[test]
    fn test_range_condition() {
        assert_eq!(
            GlucoseCondition::for_glucose(39),
            Some(GlucoseCondition::BelowRange)
        );
        assert_eq!(GlucoseCondition::for_glucose(40), None);
        assert_eq!(GlucoseCondition::for_glucose(120), None);
        assert_eq!(GlucoseCondition::for_glucose(400), None);
        assert_eq!(
            GlucoseCondition::for_glucose(401),
            Some(GlucoseCondition::AboveRange)
        );
    }

    #[test]
    fn test_trend_sentinel() {
        assert_eq!(decode_trend(0x7F), None);
        assert_eq!(decode_trend(0x03), Some(0.3));
        assert_eq!(decode_trend(0xFE), Some(-0.2));
        assert_eq!(decode_trend(0x80), Some(-12.8));
    }
}
