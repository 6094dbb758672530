//! Sensor lifetime arithmetic
//!
//! A sensor runs for ten days after activation, followed by a twelve hour
//! grace period. Readings carry timestamps relative to activation.

use chrono::{DateTime, Duration, Utc};
use cgm_protocol::AlgorithmState;
use serde::{Deserialize, Serialize};

/// Nominal sensor lifetime
pub const SENSOR_LIFETIME: std::time::Duration = std::time::Duration::from_secs(10 * 24 * 60 * 60);

/// Warm-up after activation
pub const WARMUP_DURATION: std::time::Duration = std::time::Duration::from_secs(25 * 60);

/// Grace period after the nominal lifetime
pub const GRACE_PERIOD: std::time::Duration = std::time::Duration::from_secs(12 * 60 * 60);

fn span(duration: std::time::Duration) -> Duration {
    Duration::seconds(duration.as_secs() as i64)
}

/// End of the nominal lifetime
pub fn expires_at(activated_at: DateTime<Utc>) -> DateTime<Utc> {
    activated_at + span(SENSOR_LIFETIME)
}

/// End of the grace period
pub fn ends_at(activated_at: DateTime<Utc>) -> DateTime<Utc> {
    activated_at + span(SENSOR_LIFETIME) + span(GRACE_PERIOD)
}

/// End of warm-up
pub fn finishes_warmup_at(activated_at: DateTime<Utc>) -> DateTime<Utc> {
    activated_at + span(WARMUP_DURATION)
}

/// Absolute time of a reading taken `timestamp` seconds after activation
pub fn reading_date(activated_at: DateTime<Utc>, timestamp: u32) -> DateTime<Utc> {
    activated_at + Duration::seconds(i64::from(timestamp))
}

/// Identifier that stays stable for one reading across backfills
///
/// Returns `"invalid"` until the sensor is pinned and its activation known.
pub fn sync_identifier(
    activated_at: Option<DateTime<Utc>>,
    sensor_id: Option<&str>,
    timestamp: u32,
) -> String {
    match (activated_at, sensor_id) {
        (Some(activated_at), Some(sensor_id)) => {
            let hours = activated_at.timestamp_millis() as f64 / 3_600_000.0;
            format!("{hours:?} {sensor_id} {timestamp}")
        }
        _ => "invalid".to_string(),
    }
}

/// Where a sensor is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorLifecycleState {
    /// No sensor pinned
    Searching,
    /// Warming up
    Warmup,
    /// Producing readings
    Ok,
    /// Sensor reported a failure
    Failed,
    /// Past its nominal lifetime
    GracePeriod,
    /// Past the grace period
    Expired,
}

/// Classify a sensor from its pin, activation and latest algorithm state
pub fn lifecycle_state(
    sensor_id: Option<&str>,
    activated_at: Option<DateTime<Utc>>,
    latest: Option<AlgorithmState>,
    now: DateTime<Utc>,
) -> SensorLifecycleState {
    if sensor_id.is_none() {
        return SensorLifecycleState::Searching;
    }
    if activated_at.map_or(false, |at| ends_at(at) < now) {
        return SensorLifecycleState::Expired;
    }
    if let Some(state) = latest {
        if state.is_in_warmup() {
            return SensorLifecycleState::Warmup;
        }
        if state.is_sensor_failed() {
            return SensorLifecycleState::Failed;
        }
        if state.is_expired() {
            return SensorLifecycleState::Expired;
        }
    }
    if activated_at.map_or(false, |at| expires_at(at) < now) {
        return SensorLifecycleState::GracePeriod;
    }
    SensorLifecycleState::Ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn activation() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_lifetime_boundaries() {
        let at = activation();
        assert_eq!(expires_at(at), Utc.with_ymd_and_hms(2024, 3, 11, 12, 0, 0).unwrap());
        assert_eq!(ends_at(at), Utc.with_ymd_and_hms(2024, 3, 12, 0, 0, 0).unwrap());
        assert_eq!(
            finishes_warmup_at(at),
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 25, 0).unwrap()
        );
        assert_eq!(
            reading_date(at, 3600),
            Utc.with_ymd_and_hms(2024, 3, 1, 13, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_lifecycle_state() {
        let at = activation();
        let day = Duration::days(1);

        assert_eq!(
            lifecycle_state(None, Some(at), None, at),
            SensorLifecycleState::Searching
        );
        assert_eq!(
            lifecycle_state(Some("DXCM01"), Some(at), Some(AlgorithmState::Warmup), at),
            SensorLifecycleState::Warmup
        );
        assert_eq!(
            lifecycle_state(Some("DXCM01"), Some(at), Some(AlgorithmState::Ok), at + day),
            SensorLifecycleState::Ok
        );
        assert_eq!(
            lifecycle_state(Some("DXCM01"), Some(at), Some(AlgorithmState::Ok), at + day * 10 + Duration::hours(1)),
            SensorLifecycleState::GracePeriod
        );
        assert_eq!(
            lifecycle_state(Some("DXCM01"), Some(at), Some(AlgorithmState::Warmup), at + day * 11),
            SensorLifecycleState::Expired
        );
        assert_eq!(
            lifecycle_state(Some("DXCM01"), Some(at), Some(AlgorithmState::SessionEnded), at + day),
            SensorLifecycleState::Expired
        );
        assert_eq!(
            lifecycle_state(Some("DXCM01"), None, None, at),
            SensorLifecycleState::Ok
        );
    }

    #[test]
    fn test_sync_identifier() {
        let at = Utc.timestamp_opt(1_800_000, 0).unwrap();
        assert_eq!(sync_identifier(Some(at), Some("DXCM01"), 40100), "500.0 DXCM01 40100");
        assert_eq!(sync_identifier(None, Some("DXCM01"), 40100), "invalid");
        assert_eq!(sync_identifier(Some(at), None, 40100), "invalid");
    }
}
