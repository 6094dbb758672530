//! CGM BLE - Bluetooth LE client core for Dexcom G7 sensors
//!
//! This crate finds a G7 sensor, keeps a connection to it alive across the
//! sensor's routine disconnects, and turns its notifications into glucose
//! readings.
//!
//! # Overview
//!
//! The stack is layered bottom-up:
//!
//! - **Transport**: [`BleTransport`] wraps the platform BLE central; requests
//!   complete asynchronously as [`TransportEvent`]s
//! - **Session**: [`PeripheralSession`] serialises GATT commands against one
//!   peripheral and applies its notification configuration
//! - **Scanner**: [`CentralScanner`] owns scanning, reconnection and the
//!   active peripheral
//! - **Sensor**: [`G7Sensor`] implements the G7 protocol on top and reports
//!   to a [`SensorDelegate`]
//!
//! Frame decoding lives in the `cgm-protocol` crate.
//!
//! # Example
//!
//! ```rust,no_run
//! use cgm_ble::{BackfillFrame, CgmConfig, G7Sensor, GlucoseFrame, SensorDelegate, SensorError};
//! use cgm_ble::test_utils::MockTransport;
//! use chrono::{DateTime, Utc};
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! impl SensorDelegate for Printer {
//!     fn sensor_did_connect(&self, name: &str) { println!("connected to {name}"); }
//!     fn sensor_disconnected(&self, _: bool) {}
//!     fn sensor_did_error(&self, error: &SensorError) { eprintln!("{error}"); }
//!     fn sensor_did_read(&self, reading: &GlucoseFrame) { println!("{reading}"); }
//!     fn sensor_did_read_backfill(&self, _: &[BackfillFrame]) {}
//!     fn sensor_did_discover_new_sensor(&self, _: &str, _: DateTime<Utc>) -> bool { true }
//!     fn sensor_connection_status_did_update(&self) {}
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (transport, events) = MockTransport::new();
//!     let sensor = G7Sensor::new(transport, events, CgmConfig::default(), Arc::new(Printer))?;
//!
//!     sensor.resume_scanning().await?;
//!     tokio::signal::ctrl_c().await?;
//!     sensor.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod scanner;
pub mod sensor;
pub mod session;
pub mod test_utils;
pub mod transport;

// Re-exports
pub use config::{
    CgmConfig, CgmConfigBuilder, CharacteristicRole, GattProfile, ScannerConfig, SensorConfig,
    SessionConfig,
};
pub use error::{Result, SensorError, SessionError, TransportError};
pub use lifecycle::{lifecycle_state, sync_identifier, SensorLifecycleState};
pub use scanner::{CentralScanner, ConnectionDecision, ScannerDelegate, ScannerHandle};
pub use sensor::{G7Sensor, SensorDelegate};
pub use session::{
    ConfigurationState, PeripheralSession, SessionConfiguration, SessionHandle,
};
pub use transport::{
    BleTransport, CentralState, PeripheralEvent, PeripheralId, PeripheralInfo, PeripheralState,
    TransportEvent, WriteType,
};

#[cfg(feature = "ble")]
pub use transport::BtleplugTransport;

// Frame types used in the delegate API
pub use cgm_protocol::{AlgorithmState, BackfillFrame, GlucoseFrame, TrendType};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = CgmConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sensor.name_prefixes, vec!["DXCM", "DX02"]);
        assert_eq!(config.scanner.rescan_delay, std::time::Duration::from_secs(5));
    }

    #[test]
    fn test_gatt_roles() {
        let gatt = GattProfile::default();
        assert_eq!(gatt.role_of(&gatt.backfill), Some(CharacteristicRole::Backfill));
        assert_eq!(gatt.role_of(&gatt.cgm_service), None);
    }
}
