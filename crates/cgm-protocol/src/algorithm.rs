//! Sensor algorithm state byte
//!
//! Every glucose and backfill frame carries one byte describing the state of
//! the on-sensor algorithm. The raw value is kept so unrecognised states from
//! newer firmware survive a round trip, and a small capability bitmask is
//! derived from it for callers that only care about reliability.

use serde::{Deserialize, Serialize};

/// Algorithm state reported by the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmState {
    /// Session stopped
    Stopped,
    /// Sensor warming up after insertion
    Warmup,
    /// Signal too noisy for a reading
    ExcessNoise,
    /// First of two calibration values needed
    FirstOfTwoBgsNeeded,
    /// Second of two calibration values needed
    SecondOfTwoBgsNeeded,
    /// Normal operation
    Ok,
    /// Calibration requested, readings still valid
    NeedsCalibration,
    /// Calibration rejected
    CalibrationError1,
    /// Calibration rejected
    CalibrationError2,
    /// Calibration fit failed
    CalibrationLinearityFitFailure,
    /// Failed: counts aberration
    SensorFailedCountsAberration,
    /// Failed: residual aberration
    SensorFailedResidualAberration,
    /// Out of calibration due to outlier
    OutOfCalibrationOutlier,
    /// Outlier calibration requested
    OutlierCalibrationRequest,
    /// Session expired
    SessionExpired,
    /// Failed: unrecoverable error
    SessionFailedUnrecoverable,
    /// Failed: transmitter error
    SessionFailedTransmitter,
    /// Temporary sensor issue, readings withheld
    TemporarySensorIssue,
    /// Failed: progressive decline
    SensorFailedProgressiveDecline,
    /// Failed: high counts aberration
    SensorFailedHighCounts,
    /// Failed: low counts aberration
    SensorFailedLowCounts,
    /// Failed: restart
    SensorFailedRestart,
    /// Sensor past its lifetime
    Expired,
    /// Sensor failed
    SensorFailed,
    /// Session ended
    SessionEnded,
    /// Value not known to this library
    Unknown(u8),
}

impl AlgorithmState {
    /// Decode the raw state byte
    pub fn from_byte(byte: u8) -> Self {
        use AlgorithmState::*;
        match byte {
            1 => Stopped,
            2 => Warmup,
            3 => ExcessNoise,
            4 => FirstOfTwoBgsNeeded,
            5 => SecondOfTwoBgsNeeded,
            6 => Ok,
            7 => NeedsCalibration,
            8 => CalibrationError1,
            9 => CalibrationError2,
            10 => CalibrationLinearityFitFailure,
            11 => SensorFailedCountsAberration,
            12 => SensorFailedResidualAberration,
            13 => OutOfCalibrationOutlier,
            14 => OutlierCalibrationRequest,
            15 => SessionExpired,
            16 => SessionFailedUnrecoverable,
            17 => SessionFailedTransmitter,
            18 => TemporarySensorIssue,
            19 => SensorFailedProgressiveDecline,
            20 => SensorFailedHighCounts,
            21 => SensorFailedLowCounts,
            22 => SensorFailedRestart,
            24 => Expired,
            25 => SensorFailed,
            26 => SessionEnded,
            other => Unknown(other),
        }
    }

    /// Raw state byte
    pub fn as_byte(&self) -> u8 {
        use AlgorithmState::*;
        match *self {
            Stopped => 1,
            Warmup => 2,
            ExcessNoise => 3,
            FirstOfTwoBgsNeeded => 4,
            SecondOfTwoBgsNeeded => 5,
            Ok => 6,
            NeedsCalibration => 7,
            CalibrationError1 => 8,
            CalibrationError2 => 9,
            CalibrationLinearityFitFailure => 10,
            SensorFailedCountsAberration => 11,
            SensorFailedResidualAberration => 12,
            OutOfCalibrationOutlier => 13,
            OutlierCalibrationRequest => 14,
            SessionExpired => 15,
            SessionFailedUnrecoverable => 16,
            SessionFailedTransmitter => 17,
            TemporarySensorIssue => 18,
            SensorFailedProgressiveDecline => 19,
            SensorFailedHighCounts => 20,
            SensorFailedLowCounts => 21,
            SensorFailedRestart => 22,
            Expired => 24,
            SensorFailed => 25,
            SessionEnded => 26,
            Unknown(raw) => raw,
        }
    }

    /// Capability bitmask derived from this state
    pub fn flags(&self) -> AlgorithmFlags {
        use AlgorithmState::*;
        let mut flags = AlgorithmFlags::empty();
        match self {
            Ok | NeedsCalibration => flags.insert(AlgorithmFlags::RELIABLE_GLUCOSE),
            Warmup => flags.insert(AlgorithmFlags::WARMUP),
            TemporarySensorIssue => flags.insert(AlgorithmFlags::TEMPORARY_ERROR),
            Expired | SessionExpired | SessionEnded => flags.insert(AlgorithmFlags::EXPIRED),
            SensorFailedCountsAberration
            | SensorFailedResidualAberration
            | SessionFailedUnrecoverable
            | SessionFailedTransmitter
            | SensorFailedProgressiveDecline
            | SensorFailedHighCounts
            | SensorFailedLowCounts
            | SensorFailedRestart
            | SensorFailed => flags.insert(AlgorithmFlags::SENSOR_FAILED),
            _ => {}
        }
        flags
    }

    /// Readings produced in this state can be used for treatment
    pub fn has_reliable_glucose(&self) -> bool {
        self.flags().contains(AlgorithmFlags::RELIABLE_GLUCOSE)
    }

    /// Sensor is still warming up
    pub fn is_in_warmup(&self) -> bool {
        self.flags().contains(AlgorithmFlags::WARMUP)
    }

    /// Sensor has failed and will not recover
    pub fn is_sensor_failed(&self) -> bool {
        self.flags().contains(AlgorithmFlags::SENSOR_FAILED)
    }

    /// Sensor session is over
    pub fn is_expired(&self) -> bool {
        self.flags().contains(AlgorithmFlags::EXPIRED)
    }
}

impl std::fmt::Display for AlgorithmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlgorithmState::Unknown(raw) => write!(f, "unknown({})", raw),
            known => write!(f, "{:?}({})", known, known.as_byte()),
        }
    }
}

/// Bitmask of algorithm capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AlgorithmFlags(u8);

impl AlgorithmFlags {
    /// Glucose value may be used for treatment
    pub const RELIABLE_GLUCOSE: Self = Self(1 << 0);
    /// Warm-up in progress
    pub const WARMUP: Self = Self(1 << 1);
    /// Transient issue, readings withheld
    pub const TEMPORARY_ERROR: Self = Self(1 << 2);
    /// Sensor failed permanently
    pub const SENSOR_FAILED: Self = Self(1 << 3);
    /// Session is over
    pub const EXPIRED: Self = Self(1 << 4);

    /// No flags set
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bits
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// True if every bit of `other` is set
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_states_round_trip_raw_value() {
        for raw in 0..=u8::MAX {
            assert_eq!(AlgorithmState::from_byte(raw).as_byte(), raw);
        }
    }

    #[test]
    fn test_reliable_glucose() {
        assert!(AlgorithmState::Ok.has_reliable_glucose());
        assert!(AlgorithmState::NeedsCalibration.has_reliable_glucose());
        assert!(!AlgorithmState::Warmup.has_reliable_glucose());
        assert!(!AlgorithmState::TemporarySensorIssue.has_reliable_glucose());
        assert!(!AlgorithmState::Unknown(0x23).has_reliable_glucose());
    }

    #[test]
    fn test_failure_and_warmup_flags() {
        assert!(AlgorithmState::from_byte(2).is_in_warmup());
        assert!(AlgorithmState::from_byte(25).is_sensor_failed());
        assert!(AlgorithmState::from_byte(19).is_sensor_failed());
        assert!(!AlgorithmState::from_byte(6).is_sensor_failed());
        assert!(AlgorithmState::Expired.flags().contains(AlgorithmFlags::EXPIRED));
        assert!(AlgorithmState::from_byte(15).is_expired());
        assert!(!AlgorithmState::Ok.is_expired());
    }

    #[test]
    fn test_display() {
        assert_eq!(AlgorithmState::Ok.to_string(), "Ok(6)");
        assert_eq!(AlgorithmState::Unknown(23).to_string(), "unknown(23)");
    }
}
