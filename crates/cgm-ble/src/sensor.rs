//! G7 sensor protocol
//!
//! [`G7Sensor`] follows one sensor: it decides which peripherals to connect
//! to, pins a sensor by name once its owner accepts it, waits for the
//! sensor to authenticate with its companion app, and then streams glucose
//! and backfill readings to a [`SensorDelegate`].
//!
//! # Flow
//!
//! 1. A peripheral advertising a `DXCM`/`DX02` name is discovered. Unpinned
//!    sensors are connected as candidates, a pinned one is made active.
//! 2. Once connected, the authentication characteristic is subscribed and
//!    the session is marked as waiting for authentication.
//! 3. An authentication frame with `bonded && authenticated` enables the
//!    control characteristic.
//! 4. A glucose frame on the control characteristic anchors the activation
//!    date, subscribes the backfill characteristic and either asks the
//!    delegate to accept a new sensor or forwards the reading.
//! 5. Backfill frames are buffered until the sensor signals the end of the
//!    backfill, then delivered as one batch.
//!
//! A remote disconnect while still waiting for authentication suggests the
//! companion app ended the session.
//!
//! Delegate callbacks run in order on a dedicated task, never on the
//! scanner task.

use bytes::Bytes;
use cgm_protocol::{AuthResult, BackfillFrame, GlucoseFrame, Opcode};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::config::{CgmConfig, CharacteristicRole, GattProfile, SensorConfig};
use crate::error::{Result, SensorError, TransportError};
use crate::scanner::{CentralScanner, ConnectionDecision, ScannerDelegate, ScannerHandle};
use crate::session::SessionHandle;
use crate::transport::{BleTransport, PeripheralInfo, TransportEvent};

/// Receives sensor events
///
/// Calls are made one at a time, in the order the events happened.
pub trait SensorDelegate: Send + Sync {
    /// The pinned sensor connected
    fn sensor_did_connect(&self, name: &str);

    /// The pinned sensor disconnected
    fn sensor_disconnected(&self, suspected_end_of_session: bool);

    /// Something went wrong
    fn sensor_did_error(&self, error: &SensorError);

    /// A glucose reading arrived
    fn sensor_did_read(&self, reading: &GlucoseFrame);

    /// A batch of backfilled readings arrived
    fn sensor_did_read_backfill(&self, backfill: &[BackfillFrame]);

    /// A new sensor was seen; return true to follow it
    fn sensor_did_discover_new_sensor(&self, name: &str, activated_at: DateTime<Utc>) -> bool;

    /// Scanning or connection status changed
    fn sensor_connection_status_did_update(&self);
}

#[derive(Debug)]
enum DelegateCall {
    Connected(String),
    Disconnected { suspected_end_of_session: bool },
    Error(SensorError),
    Glucose(GlucoseFrame),
    Backfill(Vec<BackfillFrame>),
    NewSensor {
        name: String,
        activated_at: DateTime<Utc>,
        reading: GlucoseFrame,
    },
    StatusChanged,
}

#[derive(Debug, Default)]
struct SensorState {
    sensor_id: Option<String>,
    activation_date: Option<DateTime<Utc>>,
    /// Connected but not yet authenticated
    pending_auth: bool,
    backfill: Vec<BackfillFrame>,
    last_connect: Option<DateTime<Utc>>,
}

/// Protocol logic driven by the scanner
struct SensorProtocol {
    state: Arc<Mutex<SensorState>>,
    sensor_config: SensorConfig,
    gatt: GattProfile,
    command_timeout: Duration,
    delegate_tx: mpsc::UnboundedSender<DelegateCall>,
}

impl SensorProtocol {
    fn dispatch(&self, call: DelegateCall) {
        if self.delegate_tx.send(call).is_err() {
            trace!("Delegate dispatcher stopped");
        }
    }

    fn is_pinned_sensor(&self, state: &SensorState, name: Option<&str>) -> bool {
        match (state.sensor_id.as_deref(), name) {
            (Some(pinned), Some(name)) => self.sensor_config.same_sensor(name, pinned),
            _ => false,
        }
    }

    /// Enable notifications on a sensor characteristic as a session job
    fn listen(&self, session: &SessionHandle, role: CharacteristicRole) {
        let characteristic = match role {
            CharacteristicRole::Communication => self.gatt.communication,
            CharacteristicRole::Control => self.gatt.control,
            CharacteristicRole::Authentication => self.gatt.authentication,
            CharacteristicRole::Backfill => self.gatt.backfill,
        };
        let timeout = self.command_timeout;
        let state = self.state.clone();
        let delegate_tx = self.delegate_tx.clone();

        session.perform(move |peripheral| async move {
            debug!(peripheral = %peripheral.id(), %role, "Listening for responses");
            if let Err(source) = peripheral.set_notify(true, characteristic, timeout).await {
                error!(peripheral = %peripheral.id(), %role, error = %source, "Error enabling notifications");
                if role == CharacteristicRole::Authentication {
                    state.lock().pending_auth = false;
                }
                let call = DelegateCall::Error(SensorError::Control {
                    characteristic: role.to_string(),
                    source,
                });
                if delegate_tx.send(call).is_err() {
                    trace!("Delegate dispatcher stopped");
                }
            }
        });
    }

    fn handle_glucose(&self, session: &SessionHandle, reading: GlucoseFrame) {
        let activated_at =
            Utc::now() - chrono::Duration::seconds(i64::from(reading.glucose_timestamp()));
        self.listen(session, CharacteristicRole::Backfill);

        let name = session.name();
        let mut state = self.state.lock();
        state.activation_date = Some(activated_at);

        if state.sensor_id.is_none() {
            match name {
                Some(name) => self.dispatch(DelegateCall::NewSensor {
                    name,
                    activated_at,
                    reading,
                }),
                None => error!(%reading, "Dropping glucose message from unnamed peripheral"),
            }
        } else if self.is_pinned_sensor(&state, name.as_deref()) {
            self.dispatch(DelegateCall::Glucose(reading));
        } else {
            error!(%reading, name = ?name, "Dropping glucose message from unpinned sensor");
        }
    }
}

impl ScannerDelegate for SensorProtocol {
    fn should_connect(&self, peripheral: &PeripheralInfo) -> ConnectionDecision {
        let Some(name) = peripheral.name.as_deref() else {
            debug!(peripheral = %peripheral.id, "Not connecting to unnamed peripheral");
            return ConnectionDecision::Ignore;
        };

        // Sensors advertise "DXCMxx" and later report "Dexcomxx"
        if self.sensor_config.matches_prefix(name) {
            match self.state.lock().sensor_id.as_deref() {
                Some(pinned) if self.sensor_config.same_sensor(name, pinned) => {
                    return ConnectionDecision::PromoteToActive;
                }
                None => return ConnectionDecision::Connect,
                Some(_) => {}
            }
        }

        info!(name, "Not connecting to peripheral");
        ConnectionDecision::Ignore
    }

    fn readied(&self, session: &SessionHandle) -> bool {
        let name = session.name();
        let stop_scanning = {
            let mut state = self.state.lock();
            // Set before subscribing so an early auth frame is not overwritten
            state.pending_auth = true;
            if self.is_pinned_sensor(&state, name.as_deref()) {
                state.last_connect = Some(Utc::now());
                let pinned = state.sensor_id.clone().unwrap_or_default();
                self.dispatch(DelegateCall::Connected(pinned));
                true
            } else {
                false
            }
        };

        self.listen(session, CharacteristicRole::Authentication);
        stop_scanning
    }

    fn readying_failed(&self, session: &SessionHandle, error: TransportError) {
        warn!(peripheral = %session.id(), %error, "Readying failed");
        self.dispatch(DelegateCall::Error(SensorError::Transport(error)));
    }

    fn peripheral_did_disconnect(&self, session: &SessionHandle, was_remote: bool) {
        let name = session.name();
        let mut state = self.state.lock();
        let suspected_end_of_session = state.pending_auth && was_remote;
        let pinned = self.is_pinned_sensor(&state, name.as_deref());
        state.pending_auth = false;

        if pinned {
            info!(
                peripheral = %session.id(),
                suspected_end_of_session,
                "Sensor disconnected"
            );
            self.dispatch(DelegateCall::Disconnected {
                suspected_end_of_session,
            });
        }
    }

    fn control_response(&self, session: &SessionHandle, value: Bytes) {
        if value.is_empty() {
            return;
        }
        debug!(frame = %hex::encode(&value), "Received control response");

        match Opcode::of(&value) {
            Some(Opcode::GlucoseTx) => match GlucoseFrame::decode(&value) {
                Ok(reading) => self.handle_glucose(session, reading),
                Err(e) => {
                    warn!(error = %e, "Unable to decode glucose frame");
                    self.dispatch(DelegateCall::Error(SensorError::Observation(format!(
                        "Unable to handle glucose control response: {e}"
                    ))));
                }
            },
            Some(Opcode::BackfillFinished) => {
                let backfill = std::mem::take(&mut self.state.lock().backfill);
                if !backfill.is_empty() {
                    debug!(count = backfill.len(), "Backfill finished");
                    self.dispatch(DelegateCall::Backfill(backfill));
                }
            }
            other => trace!(opcode = ?other, "Ignoring control response"),
        }
    }

    fn backfill_response(&self, value: Bytes) {
        debug!(frame = %hex::encode(&value), "Received backfill response");
        match BackfillFrame::decode(&value) {
            Ok(entry) => self.state.lock().backfill.push(entry),
            Err(e) => trace!(error = %e, "Dropping backfill response"),
        }
    }

    fn authentication_response(&self, session: &SessionHandle, value: Bytes) {
        match AuthResult::decode(&value) {
            Ok(result) if result.is_ready() => {
                debug!(
                    peripheral = %session.id(),
                    "Observed authenticated session, enabling control notifications"
                );
                self.state.lock().pending_auth = false;
                self.listen(session, CharacteristicRole::Control);
            }
            _ => debug!(frame = %hex::encode(&value), "Ignoring authentication response"),
        }
    }

    fn scanning_status_changed(&self) {
        self.dispatch(DelegateCall::StatusChanged);
    }

    fn name_updated(&self, session: &SessionHandle) {
        debug!(peripheral = %session.id(), name = ?session.name(), "Peripheral name updated");
    }
}

/// Runs delegate callbacks in order, off the scanner task
async fn dispatch_calls(
    mut calls: mpsc::UnboundedReceiver<DelegateCall>,
    delegate: Arc<dyn SensorDelegate>,
    state: Arc<Mutex<SensorState>>,
    sensor_config: SensorConfig,
    scanner: ScannerHandle,
) {
    while let Some(call) = calls.recv().await {
        match call {
            DelegateCall::Connected(name) => delegate.sensor_did_connect(&name),
            DelegateCall::Disconnected {
                suspected_end_of_session,
            } => delegate.sensor_disconnected(suspected_end_of_session),
            DelegateCall::Error(error) => {
                debug!(code = error.error_code(), %error, "Sensor error");
                delegate.sensor_did_error(&error);
            }
            DelegateCall::Glucose(reading) => delegate.sensor_did_read(&reading),
            DelegateCall::Backfill(backfill) => delegate.sensor_did_read_backfill(&backfill),
            DelegateCall::NewSensor {
                name,
                activated_at,
                reading,
            } => {
                // An earlier candidate may have been accepted meanwhile
                let pinned = state.lock().sensor_id.clone();
                if let Some(pinned) = pinned {
                    if sensor_config.same_sensor(&name, &pinned) {
                        delegate.sensor_did_read(&reading);
                    } else {
                        debug!(%name, %pinned, "Ignoring candidate, another sensor is pinned");
                    }
                    continue;
                }

                if !delegate.sensor_did_discover_new_sensor(&name, activated_at) {
                    debug!(%name, "New sensor rejected");
                    continue;
                }

                {
                    let mut state = state.lock();
                    state.sensor_id = Some(name.clone());
                    state.activation_date = Some(activated_at);
                }
                info!(sensor = %name, %activated_at, "Following new sensor");
                delegate.sensor_did_read(&reading);

                if let Err(e) = scanner.stop_scanning().await {
                    warn!(error = %e, "Failed to stop scanning");
                }
            }
            DelegateCall::StatusChanged => delegate.sensor_connection_status_did_update(),
        }
    }
    trace!("Delegate dispatcher stopped");
}

/// Client for one Dexcom G7 sensor
///
/// Dropping the sensor stops its background tasks.
pub struct G7Sensor {
    scanner: ScannerHandle,
    state: Arc<Mutex<SensorState>>,
}

impl G7Sensor {
    /// Start following sensors over `transport`
    ///
    /// `events` must be the receiving end of the transport's event channel.
    /// Scanning starts when the transport reports the adapter powered on.
    pub fn new(
        transport: Arc<dyn BleTransport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        config: CgmConfig,
        delegate: Arc<dyn SensorDelegate>,
    ) -> Result<Self> {
        config.validate()?;

        let state = Arc::new(Mutex::new(SensorState {
            sensor_id: config.sensor.sensor_id.clone(),
            ..Default::default()
        }));
        let (delegate_tx, delegate_rx) = mpsc::unbounded_channel();

        let protocol = Arc::new(SensorProtocol {
            state: state.clone(),
            sensor_config: config.sensor.clone(),
            gatt: config.gatt.clone(),
            command_timeout: config.session.command_timeout,
            delegate_tx,
        });

        let (scanner, handle) = CentralScanner::new(transport, events, protocol, &config);
        tokio::spawn(async move {
            if let Err(e) = scanner.run().await {
                error!(error = %e, "Central scanner failed");
            }
        });
        tokio::spawn(dispatch_calls(
            delegate_rx,
            delegate,
            state.clone(),
            config.sensor.clone(),
            handle.clone(),
        ));

        Ok(Self {
            scanner: handle,
            state,
        })
    }

    /// Pin a sensor by name
    pub fn set_sensor_id(&self, sensor_id: impl Into<String>) {
        self.state.lock().sensor_id = Some(sensor_id.into());
    }

    /// Pinned sensor name
    pub fn sensor_id(&self) -> Option<String> {
        self.state.lock().sensor_id.clone()
    }

    /// Activation date derived from the latest glucose reading
    pub fn activation_date(&self) -> Option<DateTime<Utc>> {
        self.state.lock().activation_date
    }

    /// When the pinned sensor last connected
    pub fn last_connect(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_connect
    }

    /// Forget the current sensor and look for a new one
    pub async fn scan_for_new_sensor(&self, after_delay: bool) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.sensor_id = None;
            state.activation_date = None;
        }
        info!(after_delay, "Scanning for new sensor");

        self.scanner.disconnect().await?;
        self.scanner.forget_peripheral().await?;
        if after_delay {
            self.scanner.scan_after_delay().await
        } else {
            self.scanner.scan_for_peripheral().await
        }
    }

    /// Reconnect or scan for the pinned sensor
    pub async fn resume_scanning(&self) -> Result<()> {
        self.scanner.scan_for_peripheral().await
    }

    /// Stop scanning and disconnect
    pub async fn stop_scanning(&self) -> Result<()> {
        self.scanner.disconnect().await
    }

    /// Scan in progress
    pub async fn is_scanning(&self) -> Result<bool> {
        self.scanner.is_scanning().await
    }

    /// Pinned sensor is connected
    pub async fn is_connected(&self) -> Result<bool> {
        self.scanner.is_connected().await
    }

    /// Stop the background tasks
    pub async fn shutdown(&self) -> Result<()> {
        self.scanner.shutdown().await
    }
}

impl Drop for G7Sensor {
    fn drop(&mut self) {
        self.scanner.try_shutdown();
    }
}

impl std::fmt::Debug for G7Sensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("G7Sensor")
            .field("state", &*self.state.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AUTHENTICATION_UUID, BACKFILL_UUID, CONTROL_UUID};
    use crate::config::SessionConfig;
    use crate::error::SessionError;
    use crate::session::{ConfigurationState, PeripheralSession};
    use crate::test_utils::{pump_session_events, MockRequest, MockTransport};
    use crate::transport::PeripheralState;

    fn protocol(sensor_id: Option<&str>) -> (SensorProtocol, mpsc::UnboundedReceiver<DelegateCall>) {
        let (delegate_tx, rx) = mpsc::unbounded_channel();
        let protocol = SensorProtocol {
            state: Arc::new(Mutex::new(SensorState {
                sensor_id: sensor_id.map(str::to_string),
                ..Default::default()
            })),
            sensor_config: SensorConfig::default(),
            gatt: GattProfile::default(),
            command_timeout: Duration::from_secs(2),
            delegate_tx,
        };
        (protocol, rx)
    }

    fn session(name: &str) -> (Arc<MockTransport>, SessionHandle) {
        let (transport, events) = MockTransport::new();
        let info = PeripheralInfo::new("p1", Some(name));
        transport.add_sensor(info.clone());
        transport.set_peripheral_state(&info.id, PeripheralState::Connected);
        let handle = SessionHandle::spawn(PeripheralSession::new(
            info,
            transport.clone(),
            GattProfile::default().session_configuration(),
            SessionConfig::default(),
            Some(Arc::new(|_: &PeripheralSession| Ok(()))),
        ));
        pump_session_events(events, handle.session().clone());
        (transport, handle)
    }

    const GLUCOSE: [u8; 19] = [
        0x4e, 0x00, 0xa8, 0x9c, 0x00, 0x00, 0x88, 0x00, 0x00, 0x01, 0x04, 0x00, 0x8d, 0x00,
        0x06, 0x03, 0x8a, 0x00, 0x0f,
    ];

    #[test]
    fn test_should_connect_policy() {
        let (unpinned, _rx) = protocol(None);
        let decide = |p: &SensorProtocol, name: Option<&str>| {
            p.should_connect(&PeripheralInfo::new("p1", name))
        };

        assert_eq!(decide(&unpinned, None), ConnectionDecision::Ignore);
        assert_eq!(decide(&unpinned, Some("DXCM4Q")), ConnectionDecision::Connect);
        assert_eq!(decide(&unpinned, Some("DX02AB")), ConnectionDecision::Connect);
        assert_eq!(decide(&unpinned, Some("Polar H10")), ConnectionDecision::Ignore);

        let (pinned, _rx) = protocol(Some("DXCM4Q"));
        assert_eq!(
            decide(&pinned, Some("DXCM4Q")),
            ConnectionDecision::PromoteToActive
        );
        assert_eq!(decide(&pinned, Some("DXCM7Z")), ConnectionDecision::Ignore);
        assert_eq!(decide(&pinned, Some("DX024Q")), ConnectionDecision::PromoteToActive);
    }

    #[tokio::test]
    async fn test_unpinned_glucose_asks_delegate() {
        let (protocol, mut rx) = protocol(None);
        let (_transport, session) = session("DXCM01");

        protocol.control_response(&session, Bytes::from_static(&GLUCOSE));

        match rx.recv().await.unwrap() {
            DelegateCall::NewSensor { name, reading, .. } => {
                assert_eq!(name, "DXCM01");
                assert_eq!(reading.glucose, Some(141));
            }
            other => panic!("unexpected call: {other:?}"),
        }
        assert!(protocol.state.lock().activation_date.is_some());
        assert!(protocol.state.lock().sensor_id.is_none());
    }

    #[tokio::test]
    async fn test_pinned_glucose_is_forwarded() {
        let (protocol, mut rx) = protocol(Some("DXCM01"));
        let (_transport, session) = session("DXCM01");

        protocol.control_response(&session, Bytes::from_static(&GLUCOSE));
        assert!(matches!(rx.recv().await.unwrap(), DelegateCall::Glucose(_)));
    }

    #[tokio::test]
    async fn test_glucose_from_other_sensor_is_dropped() {
        let (protocol, mut rx) = protocol(Some("DXCM02"));
        let (_transport, session) = session("DXCM01");

        protocol.control_response(&session, Bytes::from_static(&GLUCOSE));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_glucose_is_reported() {
        let (protocol, mut rx) = protocol(Some("DXCM01"));
        let (_transport, session) = session("DXCM01");

        protocol.control_response(&session, Bytes::from_static(&[0x4e, 0x00, 0x01]));
        match rx.recv().await.unwrap() {
            DelegateCall::Error(SensorError::Observation(_)) => {}
            other => panic!("unexpected call: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_backfill_is_buffered_until_finished() {
        let (protocol, mut rx) = protocol(Some("DXCM01"));
        let (_transport, session) = session("DXCM01");

        protocol.backfill_response(Bytes::from_static(&[
            0xc5, 0x09, 0x00, 0x00, 0x6c, 0x00, 0x06, 0x0f, 0xfe,
        ]));
        // Wrong length
        protocol.backfill_response(Bytes::from_static(&[0xc5, 0x09]));
        protocol.backfill_response(Bytes::from_static(&[
            0xf1, 0x0a, 0x00, 0x00, 0x68, 0x00, 0x06, 0x0f, 0xfd,
        ]));
        assert!(rx.try_recv().is_err());

        protocol.control_response(&session, Bytes::from_static(&[0x59]));
        match rx.recv().await.unwrap() {
            DelegateCall::Backfill(entries) => {
                let timestamps: Vec<u32> = entries.iter().map(|e| e.timestamp).collect();
                assert_eq!(timestamps, vec![2501, 2801]);
            }
            other => panic!("unexpected call: {other:?}"),
        }
        assert!(protocol.state.lock().backfill.is_empty());

        // Nothing buffered, nothing delivered
        protocol.control_response(&session, Bytes::from_static(&[0x59]));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_authentication_enables_control() {
        let (protocol, _rx) = protocol(Some("DXCM01"));
        let (transport, session) = session("DXCM01");
        protocol.state.lock().pending_auth = true;

        // Not bonded
        protocol.authentication_response(&session, Bytes::from_static(&[0x05, 0x01, 0x02]));
        assert!(protocol.state.lock().pending_auth);

        protocol.authentication_response(&session, Bytes::from_static(&[0x05, 0x01, 0x01]));
        assert!(!protocol.state.lock().pending_auth);

        while !transport.requests().iter().any(|r| {
            matches!(r, MockRequest::SetNotify(_, c, true) if *c == CONTROL_UUID)
        }) {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_readied_subscribes_authentication() {
        let (protocol, mut rx) = protocol(Some("DXCM01"));
        let (transport, session) = session("DXCM01");

        assert!(protocol.readied(&session));
        assert!(protocol.state.lock().pending_auth);
        assert!(protocol.state.lock().last_connect.is_some());
        assert!(matches!(rx.recv().await.unwrap(), DelegateCall::Connected(name) if name == "DXCM01"));

        while !transport.requests().iter().any(|r| {
            matches!(r, MockRequest::SetNotify(_, c, true) if *c == AUTHENTICATION_UUID)
        }) {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_authentication_subscription_is_reported() {
        let (protocol, mut rx) = protocol(None);
        let (transport, session) = session("DXCM01");
        while session.configuration_state() != ConfigurationState::Ready {
            tokio::task::yield_now().await;
        }
        transport.set_auto_respond(false);

        protocol.readied(&session);
        match rx.recv().await.unwrap() {
            DelegateCall::Error(SensorError::Control {
                characteristic,
                source,
            }) => {
                assert_eq!(characteristic, "authentication");
                assert_eq!(source, SessionError::Timeout { duration_ms: 2000 });
            }
            _ => panic!("expected a control error"),
        }
        assert!(!protocol.state.lock().pending_auth);

        // A stopped dispatcher only drops the report
        drop(rx);
        protocol.state.lock().pending_auth = true;
        protocol.readied(&session);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!protocol.state.lock().pending_auth);
    }

    #[tokio::test]
    async fn test_readied_for_candidate_keeps_scanning() {
        let (protocol, mut rx) = protocol(None);
        let (_transport, session) = session("DXCM01");

        assert!(!protocol.readied(&session));
        assert!(protocol.state.lock().pending_auth);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_inference() {
        let (protocol, mut rx) = protocol(Some("DXCM01"));
        let (_transport, session) = session("DXCM01");

        protocol.state.lock().pending_auth = true;
        protocol.peripheral_did_disconnect(&session, true);
        assert!(matches!(
            rx.recv().await.unwrap(),
            DelegateCall::Disconnected { suspected_end_of_session: true }
        ));
        assert!(!protocol.state.lock().pending_auth);

        protocol.state.lock().pending_auth = true;
        protocol.peripheral_did_disconnect(&session, false);
        assert!(matches!(
            rx.recv().await.unwrap(),
            DelegateCall::Disconnected { suspected_end_of_session: false }
        ));

        protocol.peripheral_did_disconnect(&session, true);
        assert!(matches!(
            rx.recv().await.unwrap(),
            DelegateCall::Disconnected { suspected_end_of_session: false }
        ));
    }

    #[tokio::test]
    async fn test_disconnect_of_other_peripheral_is_silent() {
        let (protocol, mut rx) = protocol(Some("DXCM02"));
        let (_transport, session) = session("DXCM01");

        protocol.state.lock().pending_auth = true;
        protocol.peripheral_did_disconnect(&session, true);
        assert!(rx.try_recv().is_err());
        assert!(!protocol.state.lock().pending_auth);
    }

    #[tokio::test]
    async fn test_glucose_subscribes_backfill() {
        let (protocol, _rx) = protocol(Some("DXCM01"));
        let (transport, session) = session("DXCM01");

        protocol.control_response(&session, Bytes::from_static(&GLUCOSE));
        while !transport.requests().iter().any(|r| {
            matches!(r, MockRequest::SetNotify(_, c, true) if *c == BACKFILL_UUID)
        }) {
            tokio::task::yield_now().await;
        }
    }
}
