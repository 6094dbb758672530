//! Configuration types for the CGM BLE stack
//!
//! This module provides the configuration structures for sensor matching,
//! scanning behavior, per-command timeouts and the GATT layout the sensor
//! exposes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use crate::error::SensorError;
use crate::session::SessionConfiguration;

/// Service advertised by G7 sensors
pub const ADVERTISEMENT_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000FEBC_0000_1000_8000_00805F9B34FB);

/// Application service carrying the CGM characteristics
pub const CGM_SERVICE_UUID: Uuid = Uuid::from_u128(0xF8083532_849E_531C_C594_30F1F86A4EA5);

/// Communication characteristic
pub const COMMUNICATION_UUID: Uuid = Uuid::from_u128(0xF8083533_849E_531C_C594_30F1F86A4EA5);

/// Control characteristic (glucose and status frames)
pub const CONTROL_UUID: Uuid = Uuid::from_u128(0xF8083534_849E_531C_C594_30F1F86A4EA5);

/// Authentication characteristic
pub const AUTHENTICATION_UUID: Uuid = Uuid::from_u128(0xF8083535_849E_531C_C594_30F1F86A4EA5);

/// Backfill characteristic
pub const BACKFILL_UUID: Uuid = Uuid::from_u128(0xF8083536_849E_531C_C594_30F1F86A4EA5);

/// Default per-command timeout
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Default delay before rescanning after a disconnect
pub const DEFAULT_RESCAN_DELAY: Duration = Duration::from_secs(5);

/// Main configuration for the CGM BLE stack
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CgmConfig {
    /// Sensor matching
    #[serde(default)]
    pub sensor: SensorConfig,

    /// Scanner behavior
    #[serde(default)]
    pub scanner: ScannerConfig,

    /// Peripheral session timeouts
    #[serde(default)]
    pub session: SessionConfig,

    /// GATT layout of the sensor
    #[serde(default)]
    pub gatt: GattProfile,
}

impl CgmConfig {
    /// Check the configuration for values the stack cannot work with
    pub fn validate(&self) -> Result<(), SensorError> {
        if self.sensor.name_prefixes.is_empty() {
            return Err(SensorError::InvalidConfig(
                "at least one name prefix is required".to_string(),
            ));
        }
        if self.sensor.identity_suffix_len == 0 {
            return Err(SensorError::InvalidConfig(
                "identity_suffix_len must be positive".to_string(),
            ));
        }
        if self.session.command_timeout.is_zero() || self.session.discovery_timeout.is_zero() {
            return Err(SensorError::InvalidConfig(
                "session timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which peripherals count as sensors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Accepted advertised name prefixes
    #[serde(default = "default_name_prefixes")]
    pub name_prefixes: Vec<String>,

    /// Previously pinned sensor name
    #[serde(default)]
    pub sensor_id: Option<String>,

    /// Trailing name characters that identify one sensor
    #[serde(default = "default_identity_suffix_len")]
    pub identity_suffix_len: usize,
}

fn default_name_prefixes() -> Vec<String> {
    vec!["DXCM".to_string(), "DX02".to_string()]
}

fn default_identity_suffix_len() -> usize {
    2
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            name_prefixes: default_name_prefixes(),
            sensor_id: None,
            identity_suffix_len: default_identity_suffix_len(),
        }
    }
}

impl SensorConfig {
    /// Name starts with one of the accepted prefixes
    pub fn matches_prefix(&self, name: &str) -> bool {
        self.name_prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }

    /// Two names refer to the same sensor
    pub fn same_sensor(&self, a: &str, b: &str) -> bool {
        identity_suffix(a, self.identity_suffix_len) == identity_suffix(b, self.identity_suffix_len)
    }
}

/// Last `len` characters of a name
pub(crate) fn identity_suffix(name: &str, len: usize) -> &str {
    match name.char_indices().rev().nth(len.saturating_sub(1)) {
        Some((idx, _)) => &name[idx..],
        None => name,
    }
}

/// Scanner behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Delay before rescanning after a disconnect or failed connection
    #[serde(with = "humantime_serde", default = "default_rescan_delay")]
    pub rescan_delay: Duration,

    /// Ask the transport for peripherals it already knows on start-up
    #[serde(default = "default_restore")]
    pub restore_known_peripherals: bool,
}

fn default_rescan_delay() -> Duration {
    DEFAULT_RESCAN_DELAY
}

fn default_restore() -> bool {
    true
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            rescan_delay: DEFAULT_RESCAN_DELAY,
            restore_known_peripherals: true,
        }
    }
}

/// Peripheral session timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Timeout for a single command
    #[serde(with = "humantime_serde", default = "default_command_timeout")]
    pub command_timeout: Duration,

    /// Timeout for each discovery step while configuring
    #[serde(with = "humantime_serde", default = "default_command_timeout")]
    pub discovery_timeout: Duration,
}

fn default_command_timeout() -> Duration {
    DEFAULT_COMMAND_TIMEOUT
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            discovery_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

/// GATT services and characteristics of the sensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattProfile {
    /// Service used as the scan filter
    pub advertisement_service: Uuid,
    /// Application service
    pub cgm_service: Uuid,
    /// Communication characteristic
    pub communication: Uuid,
    /// Control characteristic
    pub control: Uuid,
    /// Authentication characteristic
    pub authentication: Uuid,
    /// Backfill characteristic
    pub backfill: Uuid,
}

impl Default for GattProfile {
    fn default() -> Self {
        Self {
            advertisement_service: ADVERTISEMENT_SERVICE_UUID,
            cgm_service: CGM_SERVICE_UUID,
            communication: COMMUNICATION_UUID,
            control: CONTROL_UUID,
            authentication: AUTHENTICATION_UUID,
            backfill: BACKFILL_UUID,
        }
    }
}

impl GattProfile {
    /// Services used for scanning and connection-event matching
    pub fn scan_services(&self) -> Vec<Uuid> {
        vec![self.advertisement_service]
    }

    /// Services used to recognise already-connected sensors
    pub fn known_services(&self) -> Vec<Uuid> {
        vec![self.advertisement_service, self.cgm_service]
    }

    /// Which characteristic a UUID refers to
    pub fn role_of(&self, characteristic: &Uuid) -> Option<CharacteristicRole> {
        if *characteristic == self.control {
            Some(CharacteristicRole::Control)
        } else if *characteristic == self.backfill {
            Some(CharacteristicRole::Backfill)
        } else if *characteristic == self.authentication {
            Some(CharacteristicRole::Authentication)
        } else if *characteristic == self.communication {
            Some(CharacteristicRole::Communication)
        } else {
            None
        }
    }

    /// Session configuration used for every sensor session
    ///
    /// All four characteristics are discovered up front. None of them is
    /// subscribed during configuration: the sensor protocol enables
    /// notifications step by step as authentication progresses.
    pub fn session_configuration(&self) -> SessionConfiguration {
        let mut service_characteristics = BTreeMap::new();
        service_characteristics.insert(
            self.cgm_service,
            vec![
                self.communication,
                self.authentication,
                self.control,
                self.backfill,
            ],
        );
        SessionConfiguration {
            service_characteristics,
            ..SessionConfiguration::default()
        }
    }
}

/// Role of a sensor characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicRole {
    /// Communication
    Communication,
    /// Control
    Control,
    /// Authentication
    Authentication,
    /// Backfill
    Backfill,
}

impl std::fmt::Display for CharacteristicRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CharacteristicRole::Communication => write!(f, "communication"),
            CharacteristicRole::Control => write!(f, "control"),
            CharacteristicRole::Authentication => write!(f, "authentication"),
            CharacteristicRole::Backfill => write!(f, "backfill"),
        }
    }
}

/// Builder for CgmConfig
#[derive(Debug, Default)]
pub struct CgmConfigBuilder {
    config: CgmConfig,
}

impl CgmConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a previously pinned sensor
    pub fn sensor_id(mut self, sensor_id: impl Into<String>) -> Self {
        self.config.sensor.sensor_id = Some(sensor_id.into());
        self
    }

    /// Replace the accepted name prefixes
    pub fn name_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.sensor.name_prefixes = prefixes.into_iter().map(Into::into).collect();
        self
    }

    /// Set the per-command timeout
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.session.command_timeout = timeout;
        self
    }

    /// Set the discovery timeout used while configuring a session
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.session.discovery_timeout = timeout;
        self
    }

    /// Set the delay before rescanning
    pub fn rescan_delay(mut self, delay: Duration) -> Self {
        self.config.scanner.rescan_delay = delay;
        self
    }

    /// Enable or disable restoring known peripherals at start-up
    pub fn restore_known_peripherals(mut self, enabled: bool) -> Self {
        self.config.scanner.restore_known_peripherals = enabled;
        self
    }

    /// Replace the GATT profile
    pub fn gatt(mut self, gatt: GattProfile) -> Self {
        self.config.gatt = gatt;
        self
    }

    /// Build the configuration
    pub fn build(self) -> CgmConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
