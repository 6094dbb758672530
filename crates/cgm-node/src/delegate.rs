//! Sensor delegate that logs every event
//!
//! Decisions that need the sensor itself (rescans, reading timestamps) are
//! forwarded to the main loop as [`NodeEvent`]s.

use cgm_ble::{BackfillFrame, GlucoseFrame, SensorDelegate, SensorError};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Work for the main loop
#[derive(Debug)]
pub enum NodeEvent {
    /// A glucose reading arrived
    Reading(GlucoseFrame),
    /// A backfill batch arrived
    Backfill(Vec<BackfillFrame>),
    /// The sensor likely ended its session; look for a replacement
    SessionEnded,
}

/// Logs sensor events and accepts the first sensor it is offered
pub struct LoggingDelegate {
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl LoggingDelegate {
    /// Create the delegate and the receiver for its [`NodeEvent`]s
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }

    fn forward(&self, event: NodeEvent) {
        if self.events.send(event).is_err() {
            debug!("Main loop stopped, dropping event");
        }
    }
}

impl SensorDelegate for LoggingDelegate {
    fn sensor_did_connect(&self, name: &str) {
        info!(sensor = %name, "Sensor connected");
    }

    fn sensor_disconnected(&self, suspected_end_of_session: bool) {
        info!(suspected_end_of_session, "Sensor disconnected");
        if suspected_end_of_session {
            self.forward(NodeEvent::SessionEnded);
        }
    }

    fn sensor_did_error(&self, error: &SensorError) {
        warn!(code = error.error_code(), %error, "Sensor error");
    }

    fn sensor_did_read(&self, reading: &GlucoseFrame) {
        self.forward(NodeEvent::Reading(reading.clone()));
    }

    fn sensor_did_read_backfill(&self, backfill: &[BackfillFrame]) {
        self.forward(NodeEvent::Backfill(backfill.to_vec()));
    }

    fn sensor_did_discover_new_sensor(&self, name: &str, activated_at: DateTime<Utc>) -> bool {
        info!(sensor = %name, %activated_at, "Accepting new sensor");
        true
    }

    fn sensor_connection_status_did_update(&self) {
        debug!("Connection status changed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suspected_end_of_session_requests_rescan() {
        let (delegate, mut rx) = LoggingDelegate::new();

        delegate.sensor_disconnected(false);
        assert!(rx.try_recv().is_err());

        delegate.sensor_disconnected(true);
        assert!(matches!(rx.try_recv(), Ok(NodeEvent::SessionEnded)));
    }

    #[test]
    fn test_accepts_new_sensor() {
        let (delegate, _rx) = LoggingDelegate::new();
        assert!(delegate.sensor_did_discover_new_sensor("DXCM01", Utc::now()));
    }
}
