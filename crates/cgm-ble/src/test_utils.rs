//! Test utilities for driving the BLE stack without hardware
//!
//! [`MockTransport`] is an in-memory [`BleTransport`]: it records every
//! request, keeps a scripted GATT table per peripheral and, while
//! auto-respond is on, answers each request with the completion event a
//! real adapter would send. Tests inject everything else (discoveries,
//! notifications, disconnects) through its helper methods.
//!
//! [`RecordingDelegate`] captures [`SensorDelegate`] calls in order.
//!
//! # Example
//!
//! ```rust,ignore
//! let (transport, events) = MockTransport::new();
//! transport.add_sensor(PeripheralInfo::new("p1", Some("DXCM01")));
//!
//! let delegate = RecordingDelegate::new(true);
//! let sensor = G7Sensor::new(transport.clone(), events, CgmConfig::default(), delegate.clone())?;
//!
//! transport.power_on();
//! transport.discover(PeripheralInfo::new("p1", Some("DXCM01")));
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use cgm_protocol::{BackfillFrame, GlucoseFrame};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::GattProfile;
use crate::error::{SensorError, TransportError};
use crate::sensor::SensorDelegate;
use crate::session::PeripheralSession;
use crate::transport::{
    BleTransport, CentralState, CharacteristicInfo, PeripheralEvent, PeripheralId,
    PeripheralInfo, PeripheralState, ServiceInfo, TransportEvent, WriteType,
};

/// A request received by [`MockTransport`]
#[derive(Debug, Clone, PartialEq)]
pub enum MockRequest {
    /// Scan started
    StartScan(Vec<Uuid>),
    /// Scan stopped
    StopScan,
    /// Connect
    Connect(PeripheralId),
    /// Cancel connection
    CancelConnection(PeripheralId),
    /// Known-peripheral lookup
    RetrievePeripherals(Vec<PeripheralId>),
    /// Connected-peripheral lookup
    RetrieveConnectedPeripherals(Vec<Uuid>),
    /// Connection event registration
    RegisterForConnectionEvents(Option<Vec<Uuid>>),
    /// Service discovery
    DiscoverServices(PeripheralId, Vec<Uuid>),
    /// Characteristic discovery
    DiscoverCharacteristics(PeripheralId, Uuid, Vec<Uuid>),
    /// Notification change
    SetNotify(PeripheralId, Uuid, bool),
    /// Read
    ReadValue(PeripheralId, Uuid),
    /// Write
    WriteValue(PeripheralId, Uuid, Bytes, WriteType),
    /// RSSI read
    ReadRssi(PeripheralId),
}

#[derive(Debug)]
struct MockPeripheral {
    info: PeripheralInfo,
    state: PeripheralState,
    gatt: Vec<(Uuid, Vec<Uuid>)>,
    services: Option<Vec<ServiceInfo>>,
    values: HashMap<Uuid, Bytes>,
}

impl MockPeripheral {
    fn characteristic_mut(&mut self, uuid: &Uuid) -> Option<&mut CharacteristicInfo> {
        self.services
            .as_mut()?
            .iter_mut()
            .filter_map(|s| s.characteristics.as_mut())
            .flatten()
            .find(|c| c.uuid == *uuid)
    }
}

#[derive(Debug)]
struct MockState {
    central: CentralState,
    scanning: bool,
    auto_respond: bool,
    peripherals: BTreeMap<PeripheralId, MockPeripheral>,
    requests: Vec<MockRequest>,
}

/// Scripted in-memory transport
#[derive(Debug)]
pub struct MockTransport {
    state: Mutex<MockState>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MockTransport {
    /// Create a powered-on transport and its event channel
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            state: Mutex::new(MockState {
                central: CentralState::PoweredOn,
                scanning: false,
                auto_respond: true,
                peripherals: BTreeMap::new(),
                requests: Vec::new(),
            }),
            events,
        });
        (transport, rx)
    }

    /// Script a peripheral with its services and characteristics
    pub fn add_peripheral(&self, info: PeripheralInfo, gatt: Vec<(Uuid, Vec<Uuid>)>) {
        self.state.lock().peripherals.insert(
            info.id.clone(),
            MockPeripheral {
                info,
                state: PeripheralState::Disconnected,
                gatt,
                services: None,
                values: HashMap::new(),
            },
        );
    }

    /// Script a peripheral with the default sensor GATT layout
    pub fn add_sensor(&self, info: PeripheralInfo) {
        let gatt = GattProfile::default();
        self.add_peripheral(
            info,
            vec![(
                gatt.cgm_service,
                vec![gatt.communication, gatt.control, gatt.authentication, gatt.backfill],
            )],
        );
    }

    /// Answer requests with completion events (default on)
    pub fn set_auto_respond(&self, enabled: bool) {
        self.state.lock().auto_respond = enabled;
    }

    /// Change the adapter state without an event
    pub fn set_central_state(&self, state: CentralState) {
        self.state.lock().central = state;
    }

    /// Power the adapter on and report it
    pub fn power_on(&self) {
        self.set_central_state(CentralState::PoweredOn);
        self.emit(TransportEvent::StateChanged(CentralState::PoweredOn));
    }

    /// Power the adapter off and report it
    pub fn power_off(&self) {
        self.set_central_state(CentralState::PoweredOff);
        self.emit(TransportEvent::StateChanged(CentralState::PoweredOff));
    }

    /// Change a peripheral's link state without an event
    pub fn set_peripheral_state(&self, id: &PeripheralId, state: PeripheralState) {
        if let Some(p) = self.state.lock().peripherals.get_mut(id) {
            p.state = state;
        }
    }

    /// Value returned by reads of a characteristic
    pub fn set_value(&self, id: &PeripheralId, characteristic: Uuid, value: Bytes) {
        if let Some(p) = self.state.lock().peripherals.get_mut(id) {
            p.values.insert(characteristic, value);
        }
    }

    /// Notification state of a characteristic
    pub fn is_notifying(&self, id: &PeripheralId, characteristic: Uuid) -> bool {
        self.state
            .lock()
            .peripherals
            .get_mut(id)
            .and_then(|p| p.characteristic_mut(&characteristic).map(|c| c.is_notifying))
            .unwrap_or(false)
    }

    /// Every request received so far
    pub fn requests(&self) -> Vec<MockRequest> {
        self.state.lock().requests.clone()
    }

    /// Number of requests matching a predicate
    pub fn count(&self, predicate: impl Fn(&MockRequest) -> bool) -> usize {
        self.state.lock().requests.iter().filter(|r| predicate(r)).count()
    }

    /// Send an arbitrary event
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Report a peripheral seen while scanning
    pub fn discover(&self, info: PeripheralInfo) {
        self.emit(TransportEvent::Discovered(info));
    }

    /// Report peripherals restored after a relaunch
    pub fn restore(&self, peripherals: Vec<PeripheralInfo>) {
        self.emit(TransportEvent::RestoreState(peripherals));
    }

    /// Fire a registered connection event
    pub fn connection_event(&self, info: PeripheralInfo) {
        self.emit(TransportEvent::ConnectionEventOccurred(info));
    }

    /// Deliver a notification
    pub fn notify(&self, id: &PeripheralId, characteristic: Uuid, value: Bytes) {
        self.emit(TransportEvent::Peripheral {
            id: id.clone(),
            event: PeripheralEvent::ValueUpdated {
                characteristic,
                value,
                error: None,
            },
        });
    }

    /// Rename a peripheral and report it
    pub fn rename(&self, id: &PeripheralId, name: &str) {
        if let Some(p) = self.state.lock().peripherals.get_mut(id) {
            p.info.name = Some(name.to_string());
        }
        self.emit(TransportEvent::Peripheral {
            id: id.clone(),
            event: PeripheralEvent::NameUpdated {
                name: Some(name.to_string()),
            },
        });
    }

    /// The peripheral hangs up
    pub fn disconnect_remote(&self, id: &PeripheralId) {
        self.disconnect_with(id, Some(TransportError::PeripheralDisconnected));
    }

    /// Drop the link and report it with `error`
    pub fn disconnect_with(&self, id: &PeripheralId, error: Option<TransportError>) {
        let info = {
            let mut state = self.state.lock();
            let Some(p) = state.peripherals.get_mut(id) else {
                return;
            };
            p.state = PeripheralState::Disconnected;
            p.services = None;
            p.info.clone()
        };
        self.emit(TransportEvent::Disconnected {
            peripheral: info,
            error,
        });
    }

    fn record(&self, request: MockRequest) -> bool {
        let mut state = self.state.lock();
        state.requests.push(request);
        state.auto_respond
    }

    fn ensure_connected(&self, id: &PeripheralId) -> Result<(), TransportError> {
        match self.state.lock().peripherals.get(id) {
            Some(p) if p.state == PeripheralState::Connected => Ok(()),
            Some(_) => Err(TransportError::NotConnected),
            None => Err(TransportError::Unknown(id.to_string())),
        }
    }

    fn emit_peripheral(&self, id: &PeripheralId, event: PeripheralEvent) {
        self.emit(TransportEvent::Peripheral {
            id: id.clone(),
            event,
        });
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    fn central_state(&self) -> CentralState {
        self.state.lock().central
    }

    fn is_scanning(&self) -> bool {
        self.state.lock().scanning
    }

    fn peripheral_state(&self, id: &PeripheralId) -> PeripheralState {
        self.state
            .lock()
            .peripherals
            .get(id)
            .map_or(PeripheralState::Disconnected, |p| p.state)
    }

    fn services(&self, id: &PeripheralId) -> Option<Vec<ServiceInfo>> {
        self.state.lock().peripherals.get(id)?.services.clone()
    }

    async fn start_scan(&self, services: &[Uuid]) -> Result<(), TransportError> {
        self.record(MockRequest::StartScan(services.to_vec()));
        self.state.lock().scanning = true;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.record(MockRequest::StopScan);
        self.state.lock().scanning = false;
        Ok(())
    }

    async fn connect(&self, id: &PeripheralId) -> Result<(), TransportError> {
        let respond = self.record(MockRequest::Connect(id.clone()));
        let info = {
            let mut state = self.state.lock();
            let p = state
                .peripherals
                .get_mut(id)
                .ok_or_else(|| TransportError::Unknown(id.to_string()))?;
            if p.state == PeripheralState::Connected {
                return Ok(());
            }
            p.state = if respond {
                PeripheralState::Connected
            } else {
                PeripheralState::Connecting
            };
            p.info.clone()
        };
        if respond {
            self.emit(TransportEvent::Connected(info));
        }
        Ok(())
    }

    async fn cancel_connection(&self, id: &PeripheralId) -> Result<(), TransportError> {
        let respond = self.record(MockRequest::CancelConnection(id.clone()));
        let info = {
            let mut state = self.state.lock();
            match state.peripherals.get_mut(id) {
                Some(p) if p.state != PeripheralState::Disconnected => {
                    p.state = PeripheralState::Disconnected;
                    p.services = None;
                    p.info.clone()
                }
                _ => return Ok(()),
            }
        };
        if respond {
            self.emit(TransportEvent::Disconnected {
                peripheral: info,
                error: None,
            });
        }
        Ok(())
    }

    async fn retrieve_peripherals(&self, ids: &[PeripheralId]) -> Vec<PeripheralInfo> {
        self.record(MockRequest::RetrievePeripherals(ids.to_vec()));
        let state = self.state.lock();
        ids.iter()
            .filter_map(|id| state.peripherals.get(id).map(|p| p.info.clone()))
            .collect()
    }

    async fn retrieve_connected_peripherals(&self, services: &[Uuid]) -> Vec<PeripheralInfo> {
        self.record(MockRequest::RetrieveConnectedPeripherals(services.to_vec()));
        self.state
            .lock()
            .peripherals
            .values()
            .filter(|p| p.state == PeripheralState::Connected)
            .filter(|p| p.gatt.iter().any(|(service, _)| services.contains(service)))
            .map(|p| p.info.clone())
            .collect()
    }

    async fn register_for_connection_events(
        &self,
        services: Option<&[Uuid]>,
    ) -> Result<(), TransportError> {
        self.record(MockRequest::RegisterForConnectionEvents(
            services.map(<[Uuid]>::to_vec),
        ));
        Ok(())
    }

    async fn discover_services(
        &self,
        id: &PeripheralId,
        services: &[Uuid],
    ) -> Result<(), TransportError> {
        let respond = self.record(MockRequest::DiscoverServices(id.clone(), services.to_vec()));
        self.ensure_connected(id)?;
        if !respond {
            return Ok(());
        }

        {
            let mut state = self.state.lock();
            if let Some(p) = state.peripherals.get_mut(id) {
                let wanted: Vec<Uuid> = p
                    .gatt
                    .iter()
                    .map(|(service, _)| *service)
                    .filter(|service| services.is_empty() || services.contains(service))
                    .collect();
                let known = p.services.get_or_insert_with(Vec::new);
                for uuid in wanted {
                    if !known.iter().any(|s| s.uuid == uuid) {
                        known.push(ServiceInfo {
                            uuid,
                            characteristics: None,
                        });
                    }
                }
            }
        }
        self.emit_peripheral(id, PeripheralEvent::ServicesDiscovered { error: None });
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<(), TransportError> {
        let respond = self.record(MockRequest::DiscoverCharacteristics(
            id.clone(),
            service,
            characteristics.to_vec(),
        ));
        self.ensure_connected(id)?;
        if !respond {
            return Ok(());
        }

        {
            let mut state = self.state.lock();
            if let Some(p) = state.peripherals.get_mut(id) {
                let available: Vec<Uuid> = p
                    .gatt
                    .iter()
                    .find(|(uuid, _)| *uuid == service)
                    .map(|(_, chars)| chars.clone())
                    .unwrap_or_default();
                if let Some(info) = p
                    .services
                    .as_mut()
                    .and_then(|services| services.iter_mut().find(|s| s.uuid == service))
                {
                    let known = info.characteristics.get_or_insert_with(Vec::new);
                    for uuid in available {
                        let wanted = characteristics.is_empty() || characteristics.contains(&uuid);
                        if wanted && !known.iter().any(|c| c.uuid == uuid) {
                            known.push(CharacteristicInfo {
                                uuid,
                                is_notifying: false,
                                value: None,
                            });
                        }
                    }
                }
            }
        }
        self.emit_peripheral(
            id,
            PeripheralEvent::CharacteristicsDiscovered {
                service,
                error: None,
            },
        );
        Ok(())
    }

    async fn set_notify(
        &self,
        id: &PeripheralId,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), TransportError> {
        let respond = self.record(MockRequest::SetNotify(id.clone(), characteristic, enabled));
        self.ensure_connected(id)?;
        if !respond {
            return Ok(());
        }

        if let Some(c) = self
            .state
            .lock()
            .peripherals
            .get_mut(id)
            .and_then(|p| p.characteristic_mut(&characteristic))
        {
            c.is_notifying = enabled;
        }
        self.emit_peripheral(
            id,
            PeripheralEvent::NotificationStateChanged {
                characteristic,
                enabled,
                error: None,
            },
        );
        Ok(())
    }

    async fn read_value(
        &self,
        id: &PeripheralId,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        let respond = self.record(MockRequest::ReadValue(id.clone(), characteristic));
        self.ensure_connected(id)?;
        if !respond {
            return Ok(());
        }

        let value = self
            .state
            .lock()
            .peripherals
            .get(id)
            .and_then(|p| p.values.get(&characteristic).cloned())
            .unwrap_or_default();
        self.emit_peripheral(
            id,
            PeripheralEvent::ValueUpdated {
                characteristic,
                value,
                error: None,
            },
        );
        Ok(())
    }

    async fn write_value(
        &self,
        id: &PeripheralId,
        characteristic: Uuid,
        value: Bytes,
        write_type: WriteType,
    ) -> Result<(), TransportError> {
        let respond = self.record(MockRequest::WriteValue(
            id.clone(),
            characteristic,
            value,
            write_type,
        ));
        self.ensure_connected(id)?;
        if respond && write_type == WriteType::WithResponse {
            self.emit_peripheral(
                id,
                PeripheralEvent::ValueWritten {
                    characteristic,
                    error: None,
                },
            );
        }
        Ok(())
    }

    async fn read_rssi(&self, id: &PeripheralId) -> Result<(), TransportError> {
        let respond = self.record(MockRequest::ReadRssi(id.clone()));
        self.ensure_connected(id)?;
        if respond {
            self.emit_peripheral(
                id,
                PeripheralEvent::RssiRead {
                    rssi: -60,
                    error: None,
                },
            );
        }
        Ok(())
    }
}

/// Feed a transport's peripheral events straight into one session
///
/// Stands in for the scanner in tests that exercise a session alone.
pub fn pump_session_events(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    session: Arc<PeripheralSession>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let TransportEvent::Peripheral { event, .. } = event {
                session.handle_event(event);
            }
        }
    })
}

/// A [`SensorDelegate`] call
#[derive(Debug, Clone, PartialEq)]
pub enum DelegateEvent {
    /// `sensor_did_connect`
    Connected(String),
    /// `sensor_disconnected`
    Disconnected {
        /// Suspected end of session
        suspected_end_of_session: bool,
    },
    /// `sensor_did_error`, by error code
    Error(&'static str),
    /// `sensor_did_read`
    Read(GlucoseFrame),
    /// `sensor_did_read_backfill`
    ReadBackfill(Vec<BackfillFrame>),
    /// `sensor_did_discover_new_sensor`
    DiscoveredNewSensor {
        /// Sensor name
        name: String,
        /// Whether it was accepted
        accepted: bool,
    },
    /// `sensor_connection_status_did_update`
    ConnectionStatusChanged,
}

/// Delegate that records every call
#[derive(Debug)]
pub struct RecordingDelegate {
    events: Mutex<Vec<DelegateEvent>>,
    accept_new_sensors: AtomicBool,
    activations: Mutex<Vec<DateTime<Utc>>>,
    changed: watch::Sender<usize>,
}

impl RecordingDelegate {
    /// Create a delegate that accepts or rejects new sensors
    pub fn new(accept_new_sensors: bool) -> Arc<Self> {
        let (changed, _) = watch::channel(0);
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            accept_new_sensors: AtomicBool::new(accept_new_sensors),
            activations: Mutex::new(Vec::new()),
            changed,
        })
    }

    /// Change the answer to new sensors
    pub fn set_accept_new_sensors(&self, accept: bool) {
        self.accept_new_sensors.store(accept, Ordering::SeqCst);
    }

    /// Calls recorded so far
    pub fn events(&self) -> Vec<DelegateEvent> {
        self.events.lock().clone()
    }

    /// Activation dates offered with new sensors
    pub fn activations(&self) -> Vec<DateTime<Utc>> {
        self.activations.lock().clone()
    }

    /// Wait until the recorded calls satisfy `predicate`
    pub async fn wait_for(&self, predicate: impl Fn(&[DelegateEvent]) -> bool) {
        let mut changed = self.changed.subscribe();
        loop {
            if predicate(&self.events.lock()) {
                return;
            }
            if changed.changed().await.is_err() {
                return;
            }
        }
    }

    fn record(&self, event: DelegateEvent) {
        self.events.lock().push(event);
        self.changed.send_modify(|count| *count += 1);
    }
}

impl SensorDelegate for RecordingDelegate {
    fn sensor_did_connect(&self, name: &str) {
        self.record(DelegateEvent::Connected(name.to_string()));
    }

    fn sensor_disconnected(&self, suspected_end_of_session: bool) {
        self.record(DelegateEvent::Disconnected {
            suspected_end_of_session,
        });
    }

    fn sensor_did_error(&self, error: &SensorError) {
        self.record(DelegateEvent::Error(error.error_code()));
    }

    fn sensor_did_read(&self, reading: &GlucoseFrame) {
        self.record(DelegateEvent::Read(reading.clone()));
    }

    fn sensor_did_read_backfill(&self, backfill: &[BackfillFrame]) {
        self.record(DelegateEvent::ReadBackfill(backfill.to_vec()));
    }

    fn sensor_did_discover_new_sensor(&self, name: &str, activated_at: DateTime<Utc>) -> bool {
        let accepted = self.accept_new_sensors.load(Ordering::SeqCst);
        self.activations.lock().push(activated_at);
        self.record(DelegateEvent::DiscoveredNewSensor {
            name: name.to_string(),
            accepted,
        });
        accepted
    }

    fn sensor_connection_status_did_update(&self) {
        self.record(DelegateEvent::ConnectionStatusChanged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_discovery_fills_gatt_table() {
        let (transport, mut events) = MockTransport::new();
        let info = PeripheralInfo::new("p1", Some("DXCM01"));
        transport.add_sensor(info.clone());

        transport.connect(&info.id).await.unwrap();
        assert!(matches!(events.recv().await, Some(TransportEvent::Connected(_))));
        assert!(transport.services(&info.id).is_none());

        let gatt = GattProfile::default();
        transport.discover_services(&info.id, &[]).await.unwrap();
        transport
            .discover_characteristics(&info.id, gatt.cgm_service, &[gatt.control])
            .await
            .unwrap();

        let services = transport.services(&info.id).unwrap();
        let characteristics = services[0].characteristics.as_ref().unwrap();
        assert_eq!(characteristics.len(), 1);
        assert_eq!(characteristics[0].uuid, gatt.control);

        transport.set_notify(&info.id, gatt.control, true).await.unwrap();
        assert!(transport.is_notifying(&info.id, gatt.control));
    }

    #[tokio::test]
    async fn test_mock_rejects_requests_when_disconnected() {
        let (transport, _events) = MockTransport::new();
        let info = PeripheralInfo::new("p1", Some("DXCM01"));
        transport.add_sensor(info.clone());

        assert_eq!(
            transport.discover_services(&info.id, &[]).await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(transport.count(|r| matches!(r, MockRequest::DiscoverServices(..))), 1);
    }

    #[tokio::test]
    async fn test_recording_delegate_waits() {
        let delegate = RecordingDelegate::new(true);
        let waiter = {
            let delegate = delegate.clone();
            tokio::spawn(async move {
                delegate
                    .wait_for(|events| events.contains(&DelegateEvent::ConnectionStatusChanged))
                    .await
            })
        };

        delegate.sensor_connection_status_did_update();
        waiter.await.unwrap();
        assert!(delegate.sensor_did_discover_new_sensor("DXCM01", Utc::now()));
        assert_eq!(delegate.events().len(), 2);
    }
}
