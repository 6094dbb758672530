//! Platform BLE transport abstraction
//!
//! The rest of the crate talks to the radio only through [`BleTransport`].
//! Requests are fire-and-forget: each one returns as soon as it has been
//! handed to the platform, and its completion arrives later as a
//! [`TransportEvent`] on the channel the transport was created with.
//!
//! - [`BtleplugTransport`] - desktop BLE via btleplug (requires `ble` feature)
//! - [`MockTransport`](crate::test_utils::MockTransport) - scripted in-memory transport for tests
//!
//! # Feature Requirements
//!
//! - `ble`: Requires BlueZ development files on Linux
//!   ```bash
//!   apt install libdbus-1-dev
//!   ```

#[cfg(feature = "ble")]
mod btle;
#[cfg(feature = "ble")]
pub use btle::BtleplugTransport;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransportError;

/// Stable identifier of a peripheral as reported by the platform
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeripheralId(pub String);

impl PeripheralId {
    /// Create an identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identity and advertised name of a peripheral
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralInfo {
    /// Platform identifier
    pub id: PeripheralId,
    /// Advertised name, if known
    pub name: Option<String>,
}

impl PeripheralInfo {
    /// Create peripheral info
    pub fn new(id: impl Into<String>, name: Option<&str>) -> Self {
        Self {
            id: PeripheralId::new(id),
            name: name.map(str::to_string),
        }
    }
}

/// Power state of the central adapter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CentralState {
    /// Not yet known
    #[default]
    Unknown,
    /// Restarting
    Resetting,
    /// No BLE hardware
    Unsupported,
    /// Permission denied
    Unauthorized,
    /// Radio off
    PoweredOff,
    /// Ready
    PoweredOn,
}

impl std::fmt::Display for CentralState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CentralState::Unknown => write!(f, "unknown"),
            CentralState::Resetting => write!(f, "resetting"),
            CentralState::Unsupported => write!(f, "unsupported"),
            CentralState::Unauthorized => write!(f, "unauthorized"),
            CentralState::PoweredOff => write!(f, "powered_off"),
            CentralState::PoweredOn => write!(f, "powered_on"),
        }
    }
}

/// Link state of a peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeripheralState {
    /// Not connected
    Disconnected,
    /// Connection in progress
    Connecting,
    /// Connected
    Connected,
    /// Disconnection in progress
    Disconnecting,
}

impl std::fmt::Display for PeripheralState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeripheralState::Disconnected => write!(f, "disconnected"),
            PeripheralState::Connecting => write!(f, "connecting"),
            PeripheralState::Connected => write!(f, "connected"),
            PeripheralState::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

/// GATT write mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    /// Acknowledged write
    WithResponse,
    /// Unacknowledged write
    WithoutResponse,
}

/// A discovered characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Notifications currently enabled
    pub is_notifying: bool,
    /// Last known value
    pub value: Option<Bytes>,
}

/// A discovered service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Service UUID
    pub uuid: Uuid,
    /// Characteristics, `None` until discovered
    pub characteristics: Option<Vec<CharacteristicInfo>>,
}

impl ServiceInfo {
    /// Find a discovered characteristic
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&CharacteristicInfo> {
        self.characteristics
            .as_ref()
            .and_then(|chars| chars.iter().find(|c| c.uuid == *uuid))
    }
}

/// Completion and notification callbacks from the transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Adapter power state changed
    StateChanged(CentralState),
    /// Peripheral seen while scanning
    Discovered(PeripheralInfo),
    /// Connection established
    Connected(PeripheralInfo),
    /// Connection closed; `error` is `None` for a locally requested disconnect
    Disconnected {
        /// Peripheral
        peripheral: PeripheralInfo,
        /// Cause reported by the platform
        error: Option<TransportError>,
    },
    /// Connection attempt failed
    FailedToConnect {
        /// Peripheral
        peripheral: PeripheralInfo,
        /// Cause reported by the platform
        error: Option<TransportError>,
    },
    /// Peripherals handed back by the platform after a relaunch
    RestoreState(Vec<PeripheralInfo>),
    /// A registered connection event fired
    ConnectionEventOccurred(PeripheralInfo),
    /// Per-peripheral callback
    Peripheral {
        /// Peripheral
        id: PeripheralId,
        /// Callback
        event: PeripheralEvent,
    },
}

/// Per-peripheral GATT callbacks
#[derive(Debug, Clone)]
pub enum PeripheralEvent {
    /// Service discovery finished
    ServicesDiscovered {
        /// Failure, if any
        error: Option<TransportError>,
    },
    /// Characteristic discovery for one service finished
    CharacteristicsDiscovered {
        /// Service
        service: Uuid,
        /// Failure, if any
        error: Option<TransportError>,
    },
    /// Notification state of a characteristic changed
    NotificationStateChanged {
        /// Characteristic
        characteristic: Uuid,
        /// New state
        enabled: bool,
        /// Failure, if any
        error: Option<TransportError>,
    },
    /// Acknowledged write finished
    ValueWritten {
        /// Characteristic
        characteristic: Uuid,
        /// Failure, if any
        error: Option<TransportError>,
    },
    /// Value read or notified
    ValueUpdated {
        /// Characteristic
        characteristic: Uuid,
        /// New value
        value: Bytes,
        /// Failure, if any
        error: Option<TransportError>,
    },
    /// RSSI read finished
    RssiRead {
        /// Signal strength in dBm
        rssi: i16,
        /// Failure, if any
        error: Option<TransportError>,
    },
    /// Peripheral name changed
    NameUpdated {
        /// New name
        name: Option<String>,
    },
}

/// Platform BLE central
///
/// Query methods return cached state synchronously. Request methods return
/// once the platform accepted the request; an `Err` means it was rejected
/// outright and no completion event will follow.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Current adapter power state
    fn central_state(&self) -> CentralState;

    /// Scan in progress
    fn is_scanning(&self) -> bool;

    /// Link state of a peripheral
    fn peripheral_state(&self, id: &PeripheralId) -> PeripheralState;

    /// Discovered services of a peripheral, `None` until discovery ran
    fn services(&self, id: &PeripheralId) -> Option<Vec<ServiceInfo>>;

    /// Start scanning for peripherals advertising any of `services`
    async fn start_scan(&self, services: &[Uuid]) -> Result<(), TransportError>;

    /// Stop scanning
    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Connect to a peripheral
    async fn connect(&self, id: &PeripheralId) -> Result<(), TransportError>;

    /// Cancel a connection or pending connection attempt
    async fn cancel_connection(&self, id: &PeripheralId) -> Result<(), TransportError>;

    /// Look up known peripherals by identifier
    async fn retrieve_peripherals(&self, ids: &[PeripheralId]) -> Vec<PeripheralInfo>;

    /// Peripherals connected to the system that expose any of `services`
    async fn retrieve_connected_peripherals(&self, services: &[Uuid]) -> Vec<PeripheralInfo>;

    /// Register for system connection events; `None` clears the registration
    async fn register_for_connection_events(
        &self,
        services: Option<&[Uuid]>,
    ) -> Result<(), TransportError>;

    /// Discover services
    async fn discover_services(
        &self,
        id: &PeripheralId,
        services: &[Uuid],
    ) -> Result<(), TransportError>;

    /// Discover characteristics of one service
    async fn discover_characteristics(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<(), TransportError>;

    /// Enable or disable notifications
    async fn set_notify(
        &self,
        id: &PeripheralId,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), TransportError>;

    /// Read a characteristic value
    async fn read_value(&self, id: &PeripheralId, characteristic: Uuid)
        -> Result<(), TransportError>;

    /// Write a characteristic value
    async fn write_value(
        &self,
        id: &PeripheralId,
        characteristic: Uuid,
        value: Bytes,
        write_type: WriteType,
    ) -> Result<(), TransportError>;

    /// Read the signal strength
    async fn read_rssi(&self, id: &PeripheralId) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(CentralState::PoweredOn.to_string(), "powered_on");
        assert_eq!(PeripheralState::Connected.to_string(), "connected");
    }

    #[test]
    fn test_service_characteristic_lookup() {
        let uuid = Uuid::from_u128(1);
        let service = ServiceInfo {
            uuid: Uuid::from_u128(2),
            characteristics: Some(vec![CharacteristicInfo {
                uuid,
                is_notifying: true,
                value: None,
            }]),
        };
        assert!(service.characteristic(&uuid).unwrap().is_notifying);
        assert!(service.characteristic(&Uuid::nil()).is_none());

        let undiscovered = ServiceInfo {
            uuid,
            characteristics: None,
        };
        assert!(undiscovered.characteristic(&uuid).is_none());
    }

    #[test]
    fn test_peripheral_id() {
        let id = PeripheralId::from("AA:BB");
        assert_eq!(id.to_string(), "AA:BB");
        assert_eq!(PeripheralInfo::new("AA:BB", Some("DXCM01")).id, id);
    }
}
