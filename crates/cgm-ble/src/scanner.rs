//! CentralScanner - owns the BLE central and the tracked sessions
//!
//! The scanner is a single task that consumes [`TransportEvent`]s and
//! [`ScannerCommand`]s. It applies the delegate's discovery policy to every
//! peripheral it sees, keeps one active session plus any candidate sessions,
//! and routes each peripheral callback to the session that owns it.
//!
//! ```text
//!                 ┌──────────────────────────────┐
//! TransportEvent ►│ CentralScanner::run()         │◄ ScannerHandle
//!                 │  sessions: id -> SessionHandle│
//!                 │  active:   SessionHandle      │
//!                 │  connection-event latch       │
//!                 └──────────────┬────────────────┘
//!                                │ ScannerDelegate
//!                                ▼
//!                       sensor protocol
//! ```
//!
//! Disconnects and failed connections always schedule a rescan after
//! [`ScannerConfig::rescan_delay`] so the host keeps scanning while the
//! sensor finishes shutting down its radio.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use crate::config::{CgmConfig, CharacteristicRole, GattProfile, ScannerConfig, SessionConfig};
use crate::error::{Result, SensorError, SessionError, TransportError};
use crate::session::{ConfigurationHook, EventOutcome, PeripheralSession, SessionHandle};
use crate::transport::{
    BleTransport, CentralState, PeripheralEvent, PeripheralId, PeripheralInfo, TransportEvent,
};

/// Outcome of the discovery policy for one peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDecision {
    /// Track a candidate session and connect, without making it active
    Connect,
    /// Make this peripheral the active one and connect
    PromoteToActive,
    /// Leave the peripheral alone
    Ignore,
}

/// Callbacks from the scanner into the protocol layer
///
/// All methods run on the scanner task and must not block.
pub trait ScannerDelegate: Send + Sync {
    /// Discovery policy
    fn should_connect(&self, peripheral: &PeripheralInfo) -> ConnectionDecision;

    /// A tracked peripheral connected; return true to stop scanning
    fn readied(&self, session: &SessionHandle) -> bool;

    /// Connecting or staying connected failed
    fn readying_failed(&self, session: &SessionHandle, error: TransportError);

    /// A tracked peripheral disconnected
    fn peripheral_did_disconnect(&self, session: &SessionHandle, was_remote: bool);

    /// Value on the control characteristic
    fn control_response(&self, session: &SessionHandle, value: Bytes);

    /// Value on the backfill characteristic
    fn backfill_response(&self, value: Bytes);

    /// Value on the authentication characteristic
    fn authentication_response(&self, session: &SessionHandle, value: Bytes);

    /// Scanning started or stopped
    fn scanning_status_changed(&self);

    /// Runs after a session finished its GATT configuration
    fn complete_configuration(&self, _session: &PeripheralSession) -> std::result::Result<(), SessionError> {
        Ok(())
    }

    /// RSSI read finished
    fn rssi_read(&self, _session: &SessionHandle, _rssi: std::result::Result<i16, TransportError>) {}

    /// Peripheral name changed
    fn name_updated(&self, _session: &SessionHandle) {}
}

/// Commands accepted by the scanner task
#[derive(Debug)]
pub enum ScannerCommand {
    /// Reconnect the active peripheral or start scanning
    ScanForPeripheral(oneshot::Sender<()>),
    /// Stop scanning
    StopScanning(oneshot::Sender<()>),
    /// Stop scanning and cancel the active connection
    Disconnect(oneshot::Sender<()>),
    /// Drop the active session
    ForgetPeripheral(oneshot::Sender<()>),
    /// Scan once the rescan delay elapsed
    ScanAfterDelay(oneshot::Sender<()>),
    /// Query scanning state
    IsScanning(oneshot::Sender<bool>),
    /// Query whether the active peripheral is connected
    IsConnected(oneshot::Sender<bool>),
    /// Query the active peripheral
    ActivePeripheral(oneshot::Sender<Option<PeripheralInfo>>),
    /// Tear down every session and stop the task
    Shutdown(oneshot::Sender<()>),
}

/// Handle for controlling a [`CentralScanner`]
#[derive(Debug, Clone)]
pub struct ScannerHandle {
    command_tx: mpsc::Sender<ScannerCommand>,
}

impl ScannerHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> ScannerCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(command(tx))
            .await
            .map_err(|_| SensorError::ChannelClosed)?;
        rx.await.map_err(|_| SensorError::ChannelClosed)
    }

    /// Reconnect the active peripheral, or scan if there is none
    pub async fn scan_for_peripheral(&self) -> Result<()> {
        self.request(ScannerCommand::ScanForPeripheral).await
    }

    /// Stop scanning
    pub async fn stop_scanning(&self) -> Result<()> {
        self.request(ScannerCommand::StopScanning).await
    }

    /// Stop scanning and cancel the active connection
    pub async fn disconnect(&self) -> Result<()> {
        self.request(ScannerCommand::Disconnect).await
    }

    /// Forget the active peripheral
    pub async fn forget_peripheral(&self) -> Result<()> {
        self.request(ScannerCommand::ForgetPeripheral).await
    }

    /// Schedule a scan after the rescan delay
    pub async fn scan_after_delay(&self) -> Result<()> {
        self.request(ScannerCommand::ScanAfterDelay).await
    }

    /// Scan in progress
    pub async fn is_scanning(&self) -> Result<bool> {
        self.request(ScannerCommand::IsScanning).await
    }

    /// Active peripheral is connected
    pub async fn is_connected(&self) -> Result<bool> {
        self.request(ScannerCommand::IsConnected).await
    }

    /// Active peripheral, if any
    pub async fn active_peripheral(&self) -> Result<Option<PeripheralInfo>> {
        self.request(ScannerCommand::ActivePeripheral).await
    }

    /// Stop the scanner task
    pub async fn shutdown(&self) -> Result<()> {
        self.request(ScannerCommand::Shutdown).await
    }

    /// Request shutdown without waiting, for use from `Drop`
    pub fn try_shutdown(&self) {
        let (tx, _rx) = oneshot::channel();
        let _ = self.command_tx.try_send(ScannerCommand::Shutdown(tx));
    }
}

/// Scanner service
pub struct CentralScanner {
    transport: Arc<dyn BleTransport>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    command_rx: mpsc::Receiver<ScannerCommand>,
    /// Weak so pending rescans do not keep the task alive
    command_tx: mpsc::WeakSender<ScannerCommand>,
    delegate: Arc<dyn ScannerDelegate>,
    gatt: GattProfile,
    scanner_config: ScannerConfig,
    session_config: SessionConfig,
    sessions: HashMap<PeripheralId, SessionHandle>,
    active: Option<SessionHandle>,
    event_registration_active: bool,
}

impl CentralScanner {
    /// Create a scanner over a transport and its event channel
    pub fn new(
        transport: Arc<dyn BleTransport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        delegate: Arc<dyn ScannerDelegate>,
        config: &CgmConfig,
    ) -> (Self, ScannerHandle) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let scanner = Self {
            transport,
            events,
            command_rx,
            command_tx: command_tx.downgrade(),
            delegate,
            gatt: config.gatt.clone(),
            scanner_config: config.scanner.clone(),
            session_config: config.session.clone(),
            sessions: HashMap::new(),
            active: None,
            event_registration_active: false,
        };
        (scanner, ScannerHandle { command_tx })
    }

    /// Run the scanner until shut down or until both channels close
    pub async fn run(mut self) -> Result<()> {
        info!("Starting central scanner");

        loop {
            tokio::select! {
                biased;

                Some(event) = self.events.recv() => {
                    self.handle_event(event).await;
                }

                Some(command) = self.command_rx.recv() => {
                    if !self.handle_command(command).await {
                        break;
                    }
                }

                else => break,
            }
        }

        for session in self.sessions.values() {
            session.teardown();
        }
        if let Some(active) = &self.active {
            active.teardown();
        }

        info!("Central scanner stopped");
        Ok(())
    }

    async fn handle_command(&mut self, command: ScannerCommand) -> bool {
        match command {
            ScannerCommand::ScanForPeripheral(reply) => {
                self.scan_for_peripheral().await;
                let _ = reply.send(());
            }
            ScannerCommand::StopScanning(reply) => {
                self.stop_scanning().await;
                let _ = reply.send(());
            }
            ScannerCommand::Disconnect(reply) => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            ScannerCommand::ForgetPeripheral(reply) => {
                if let Some(active) = self.active.take() {
                    debug!(peripheral = %active.id(), "Forgetting active peripheral");
                }
                let _ = reply.send(());
            }
            ScannerCommand::ScanAfterDelay(reply) => {
                self.scan_after_delay();
                let _ = reply.send(());
            }
            ScannerCommand::IsScanning(reply) => {
                let _ = reply.send(self.transport.is_scanning());
            }
            ScannerCommand::IsConnected(reply) => {
                let _ = reply.send(self.active.as_ref().map_or(false, |s| s.is_connected()));
            }
            ScannerCommand::ActivePeripheral(reply) => {
                let _ = reply.send(self.active.as_ref().map(|s| s.peripheral()));
            }
            ScannerCommand::Shutdown(reply) => {
                info!("Scanner shutdown requested");
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged(state) => self.central_state_changed(state).await,
            TransportEvent::Discovered(peripheral) => {
                debug!(peripheral = %peripheral.id, name = ?peripheral.name, "Discovered peripheral");
                self.handle_discovered(peripheral).await;
            }
            TransportEvent::Connected(peripheral) => self.did_connect(peripheral).await,
            TransportEvent::Disconnected { peripheral, error } => {
                self.did_disconnect(peripheral, error)
            }
            TransportEvent::FailedToConnect { peripheral, error } => {
                self.did_fail_to_connect(peripheral, error)
            }
            TransportEvent::RestoreState(peripherals) => {
                if !self.scanner_config.restore_known_peripherals {
                    debug!(count = peripherals.len(), "Ignoring restored peripherals");
                    return;
                }
                for peripheral in peripherals {
                    info!(peripheral = %peripheral.id, "Restoring peripheral from state");
                    self.handle_discovered(peripheral).await;
                }
            }
            TransportEvent::ConnectionEventOccurred(peripheral) => {
                debug!(peripheral = %peripheral.id, "Connection event");
                self.connection_event().await;
            }
            TransportEvent::Peripheral { id, event } => self.peripheral_event(id, event),
        }
    }

    // ===== Scanning =====

    async fn scan_for_peripheral(&mut self) {
        self.establish_active_peripheral().await;

        if self.active.is_some() {
            return;
        }

        if self.transport.is_scanning() {
            trace!("Already scanning");
        } else {
            debug!("Scanning for peripherals");
            match self.transport.start_scan(&self.gatt.scan_services()).await {
                Ok(()) => self.delegate.scanning_status_changed(),
                Err(e) => warn!(error = %e, "Failed to start scan"),
            }
        }

        if !self.event_registration_active {
            self.event_registration_active = true;
            let services = self.gatt.known_services();
            if let Err(e) = self.transport.register_for_connection_events(Some(&services)).await {
                warn!(error = %e, "Failed to register for connection events");
            }
        }
    }

    async fn establish_active_peripheral(&mut self) {
        if self.transport.central_state() != CentralState::PoweredOn {
            return;
        }

        if self.active.as_ref().map_or(false, |s| s.is_connected()) {
            self.event_registration_active = false;
            return;
        }

        let retrieved = match &self.active {
            Some(active) => self.transport.retrieve_peripherals(&[active.id()]).await,
            None => Vec::new(),
        };

        if let Some(peripheral) = retrieved.into_iter().next() {
            debug!(peripheral = %peripheral.id, "Retrieved peripheral");
            self.handle_discovered(peripheral).await;
        } else {
            let connected = self
                .transport
                .retrieve_connected_peripherals(&self.gatt.known_services())
                .await;
            for peripheral in connected {
                self.handle_discovered(peripheral).await;
            }
        }

        if self.active.is_some() {
            self.event_registration_active = false;
        }
    }

    async fn connection_event(&mut self) {
        if !self.event_registration_active {
            self.clear_connection_events().await;
            return;
        }

        self.establish_active_peripheral().await;

        if !self.event_registration_active {
            self.clear_connection_events().await;
        }
    }

    async fn clear_connection_events(&self) {
        if let Err(e) = self.transport.register_for_connection_events(None).await {
            warn!(error = %e, "Failed to clear connection event registration");
        }
    }

    async fn stop_scanning(&mut self) {
        if self.transport.is_scanning() {
            debug!("Stopping scan");
            if let Err(e) = self.transport.stop_scan().await {
                warn!(error = %e, "Failed to stop scan");
            }
            self.delegate.scanning_status_changed();
        }
    }

    async fn disconnect(&mut self) {
        if self.transport.is_scanning() {
            debug!("Stopping scan on disconnect");
            if let Err(e) = self.transport.stop_scan().await {
                warn!(error = %e, "Failed to stop scan");
            }
            self.delegate.scanning_status_changed();
        }

        if let Some(active) = &self.active {
            if let Err(e) = self.transport.cancel_connection(&active.id()).await {
                warn!(peripheral = %active.id(), error = %e, "Failed to cancel connection");
            }
        }
    }

    fn scan_after_delay(&self) {
        let command_tx = self.command_tx.clone();
        let delay = self.scanner_config.rescan_delay;
        debug!(delay = ?delay, "Scheduling rescan");

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = command_tx.upgrade() {
                let (reply, _rx) = oneshot::channel();
                let _ = tx.send(ScannerCommand::ScanForPeripheral(reply)).await;
            }
        });
    }

    // ===== Sessions =====

    fn new_session(&self, peripheral: PeripheralInfo) -> SessionHandle {
        let delegate = self.delegate.clone();
        let hook: ConfigurationHook = Arc::new(move |session: &PeripheralSession| delegate.complete_configuration(session));
        SessionHandle::spawn(PeripheralSession::new(
            peripheral,
            self.transport.clone(),
            self.gatt.session_configuration(),
            self.session_config.clone(),
            Some(hook),
        ))
    }

    fn is_active(&self, id: &PeripheralId) -> bool {
        self.active.as_ref().map_or(false, |s| s.id() == *id)
    }

    async fn handle_discovered(&mut self, peripheral: PeripheralInfo) {
        match self.delegate.should_connect(&peripheral) {
            ConnectionDecision::PromoteToActive => {
                debug!(peripheral = %peripheral.id, "Making peripheral active");
                let session = match &self.active {
                    Some(active) => {
                        active.set_peripheral(peripheral.clone());
                        active.clone()
                    }
                    None => {
                        let session = self.new_session(peripheral.clone());
                        self.active = Some(session.clone());
                        session
                    }
                };
                self.sessions.insert(peripheral.id.clone(), session);
                self.connect(&peripheral.id).await;
            }
            ConnectionDecision::Connect => {
                debug!(peripheral = %peripheral.id, "Connecting to peripheral");
                self.connect(&peripheral.id).await;
                let session = match self.sessions.get(&peripheral.id) {
                    Some(existing) => {
                        existing.set_peripheral(peripheral.clone());
                        existing.clone()
                    }
                    None => self.new_session(peripheral.clone()),
                };
                self.sessions.insert(peripheral.id, session);
            }
            ConnectionDecision::Ignore => {
                trace!(peripheral = %peripheral.id, "Ignoring peripheral");
            }
        }
    }

    async fn connect(&self, id: &PeripheralId) {
        if let Err(e) = self.transport.connect(id).await {
            warn!(peripheral = %id, error = %e, "Connect request rejected");
        }
    }

    async fn central_state_changed(&mut self, state: CentralState) {
        info!(state = %state, "Central state changed");
        if let Some(active) = &self.active {
            active.central_state_changed(state);
        }

        if state == CentralState::PoweredOn {
            self.scan_for_peripheral().await;
            return;
        }

        self.event_registration_active = false;
        if self.transport.is_scanning() {
            debug!("Stopping scan on central not powered on");
            if let Err(e) = self.transport.stop_scan().await {
                warn!(error = %e, "Failed to stop scan");
            }
            self.delegate.scanning_status_changed();
        }
    }

    async fn did_connect(&mut self, peripheral: PeripheralInfo) {
        info!(peripheral = %peripheral.id, name = ?peripheral.name, "Connected");
        let Some(session) = self.sessions.get(&peripheral.id).cloned() else {
            debug!(peripheral = %peripheral.id, "Connected peripheral is not tracked");
            return;
        };

        session.did_connect();
        if self.transport.central_state() == CentralState::PoweredOn
            && session.is_connected()
            && self.delegate.readied(&session)
        {
            self.stop_scanning().await;
        }
    }

    fn did_disconnect(&mut self, peripheral: PeripheralInfo, error: Option<TransportError>) {
        info!(peripheral = %peripheral.id, error = ?error, "Disconnected");
        let remote = error.as_ref().map_or(false, |e| e.is_remote_disconnect());

        if let Some(e) = error.filter(|e| !e.is_remote_disconnect()) {
            error!(peripheral = %peripheral.id, error = %e, "Unexpected disconnect");
            if let Some(active) = &self.active {
                self.delegate.readying_failed(active, e);
            }
        }

        if let Some(session) = self.sessions.get(&peripheral.id) {
            self.delegate.peripheral_did_disconnect(session, remote);
        }

        self.untrack_unless_active(&peripheral.id);
        self.scan_after_delay();
    }

    fn did_fail_to_connect(&mut self, peripheral: PeripheralInfo, error: Option<TransportError>) {
        error!(peripheral = %peripheral.id, error = ?error, "Failed to connect");
        if let (Some(e), Some(active)) = (error, &self.active) {
            self.delegate.readying_failed(active, e);
        }

        self.untrack_unless_active(&peripheral.id);
        self.scan_after_delay();
    }

    fn untrack_unless_active(&mut self, id: &PeripheralId) {
        if self.is_active(id) {
            return;
        }
        if let Some(session) = self.sessions.remove(id) {
            trace!(peripheral = %id, "Untracking peripheral");
            session.teardown();
        }
    }

    fn peripheral_event(&self, id: PeripheralId, event: PeripheralEvent) {
        let Some(session) = self.sessions.get(&id) else {
            trace!(peripheral = %id, ?event, "Event for untracked peripheral");
            return;
        };

        match session.handle_event(event) {
            EventOutcome::Unsolicited {
                characteristic,
                value,
            } => match self.gatt.role_of(&characteristic) {
                Some(CharacteristicRole::Control) => self.delegate.control_response(session, value),
                Some(CharacteristicRole::Backfill) => self.delegate.backfill_response(value),
                Some(CharacteristicRole::Authentication) => {
                    self.delegate.authentication_response(session, value)
                }
                Some(CharacteristicRole::Communication) | None => {
                    trace!(peripheral = %id, %characteristic, "Ignoring value update");
                }
            },
            EventOutcome::RssiRead(rssi) => self.delegate.rssi_read(session, rssi),
            EventOutcome::NameUpdated(_) => self.delegate.name_updated(session),
            EventOutcome::Resolved | EventOutcome::Claimed | EventOutcome::Ignored => {}
        }
    }
}
