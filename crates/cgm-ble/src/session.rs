//! PeripheralSession - serialized GATT commands for one peripheral
//!
//! A session owns one connection and turns the transport's fire-and-forget
//! requests plus completion events into awaitable commands with a timeout.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  perform(job)   ┌──────────────────────────────┐
//! │ SessionHandle│ ──────────────► │ worker task                  │
//! └──────────────┘                 │  configure_if_needed()       │
//!                                  │  job(session)                │
//!                                  │    run_command ──► transport │
//!                                  │        ▲                     │
//!                                  └────────┼─────────────────────┘
//!                                           │ oneshot
//! ┌──────────────┐  handle_event   ┌────────┴─────────────────────┐
//! │ CentralScanner│ ─────────────► │ request table                │
//! └──────────────┘                 │ (kind, target) -> completion │
//!                                  └──────────────────────────────┘
//! ```
//!
//! Jobs run one after another on the worker task. Before each job the
//! session makes sure the peripheral is configured (services discovered,
//! characteristics discovered, required notifications enabled). A failed
//! configuration is logged and retried before the next job.
//!
//! Completion events are delivered by the scanner through
//! [`PeripheralSession::handle_event`], which resolves the matching entry
//! of the request table. Value updates nobody waits for are either claimed
//! by a per-characteristic macro or handed back to the caller as
//! [`EventOutcome::Unsolicited`].

use bytes::Bytes;
use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{SessionError, TransportError};
use crate::transport::{
    BleTransport, CentralState, CharacteristicInfo, PeripheralEvent, PeripheralId,
    PeripheralInfo, PeripheralState, ServiceInfo, WriteType,
};

/// Predicate a value update must satisfy to resolve a pending read
pub type ValuePredicate = Arc<dyn Fn(&Bytes) -> bool + Send + Sync>;

/// Handler that claims every unsolicited update of one characteristic
pub type ValueUpdateMacro = Arc<dyn Fn(&PeripheralSession, &Bytes) + Send + Sync>;

/// Hook run after the GATT configuration succeeded
pub type ConfigurationHook =
    Arc<dyn Fn(&PeripheralSession) -> Result<(), SessionError> + Send + Sync>;

type Job = Box<dyn FnOnce(Arc<PeripheralSession>) -> BoxFuture<'static, ()> + Send>;

type Completion = Result<Option<Bytes>, TransportError>;

/// GATT layout a session establishes before running jobs
#[derive(Clone, Default)]
pub struct SessionConfiguration {
    /// Characteristics to discover, per service
    pub service_characteristics: BTreeMap<Uuid, Vec<Uuid>>,
    /// Characteristics that must be notifying, per service
    pub notifying_characteristics: BTreeMap<Uuid, Vec<Uuid>>,
    /// Handlers for unsolicited value updates
    pub value_update_macros: HashMap<Uuid, ValueUpdateMacro>,
}

impl std::fmt::Debug for SessionConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfiguration")
            .field("service_characteristics", &self.service_characteristics)
            .field("notifying_characteristics", &self.notifying_characteristics)
            .field(
                "value_update_macros",
                &self.value_update_macros.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Configuration progress of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationState {
    /// Configuration must run before the next job
    Unconfigured,
    /// Configuration in progress
    Configuring,
    /// Services and characteristics are in place
    Ready,
}

impl std::fmt::Display for ConfigurationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigurationState::Unconfigured => write!(f, "unconfigured"),
            ConfigurationState::Configuring => write!(f, "configuring"),
            ConfigurationState::Ready => write!(f, "ready"),
        }
    }
}

/// Completion a command waits for
#[derive(Clone)]
pub enum PendingCondition {
    /// Service discovery finished
    ServiceDiscovery,
    /// Characteristic discovery finished for a service
    CharacteristicDiscovery {
        /// Service
        service: Uuid,
    },
    /// Notification state reached the desired value
    NotificationState {
        /// Characteristic
        characteristic: Uuid,
        /// Desired state
        enabled: bool,
    },
    /// A value arrived, optionally matching a predicate
    ValueUpdate {
        /// Characteristic
        characteristic: Uuid,
        /// Only values accepted by this predicate resolve the condition
        matching: Option<ValuePredicate>,
    },
    /// An acknowledged write finished
    WriteAck {
        /// Characteristic
        characteristic: Uuid,
    },
}

impl PendingCondition {
    fn key(&self) -> RequestKey {
        match self {
            PendingCondition::ServiceDiscovery => RequestKey::ServiceDiscovery,
            PendingCondition::CharacteristicDiscovery { service } => {
                RequestKey::CharacteristicDiscovery(*service)
            }
            PendingCondition::NotificationState { characteristic, .. } => {
                RequestKey::NotificationState(*characteristic)
            }
            PendingCondition::ValueUpdate { characteristic, .. } => {
                RequestKey::ValueUpdate(*characteristic)
            }
            PendingCondition::WriteAck { characteristic } => RequestKey::WriteAck(*characteristic),
        }
    }

    fn into_pending(self, command: u64, completion: oneshot::Sender<Completion>) -> PendingRequest {
        let (enabled, matching) = match self {
            PendingCondition::NotificationState { enabled, .. } => (Some(enabled), None),
            PendingCondition::ValueUpdate { matching, .. } => (None, matching),
            _ => (None, None),
        };
        PendingRequest {
            command,
            enabled,
            matching,
            completion,
        }
    }
}

impl std::fmt::Debug for PendingCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PendingCondition::ValueUpdate {
                characteristic,
                matching,
            } => f
                .debug_struct("ValueUpdate")
                .field("characteristic", characteristic)
                .field("matching", &matching.is_some())
                .finish(),
            other => write!(f, "{:?}", other.key()),
        }
    }
}

/// Request table key: operation kind and target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKey {
    /// Service discovery
    ServiceDiscovery,
    /// Characteristic discovery for a service
    CharacteristicDiscovery(Uuid),
    /// Notification state of a characteristic
    NotificationState(Uuid),
    /// Value of a characteristic
    ValueUpdate(Uuid),
    /// Write acknowledgement for a characteristic
    WriteAck(Uuid),
}

struct PendingRequest {
    command: u64,
    enabled: Option<bool>,
    matching: Option<ValuePredicate>,
    completion: oneshot::Sender<Completion>,
}

/// Transport request issued by a command
#[derive(Debug, Clone)]
pub enum TransportRequest {
    /// Discover services
    DiscoverServices(Vec<Uuid>),
    /// Discover characteristics of a service
    DiscoverCharacteristics {
        /// Service
        service: Uuid,
        /// Characteristics
        characteristics: Vec<Uuid>,
    },
    /// Enable or disable notifications
    SetNotify {
        /// Characteristic
        characteristic: Uuid,
        /// Desired state
        enabled: bool,
    },
    /// Read a value
    ReadValue(Uuid),
    /// Write a value
    WriteValue {
        /// Characteristic
        characteristic: Uuid,
        /// Payload
        value: Bytes,
        /// Write mode
        write_type: WriteType,
    },
}

/// What a session did with a peripheral event
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    /// Completed a pending request
    Resolved,
    /// Consumed by a value update macro
    Claimed,
    /// Value update nobody was waiting for
    Unsolicited {
        /// Characteristic
        characteristic: Uuid,
        /// Value
        value: Bytes,
    },
    /// RSSI read finished
    RssiRead(Result<i16, TransportError>),
    /// Peripheral name changed
    NameUpdated(Option<String>),
    /// No effect
    Ignored,
}

/// Command context for one peripheral
pub struct PeripheralSession {
    peripheral: Mutex<PeripheralInfo>,
    transport: Arc<dyn BleTransport>,
    configuration: SessionConfiguration,
    config: SessionConfig,
    state: Mutex<ConfigurationState>,
    requests: Mutex<HashMap<RequestKey, PendingRequest>>,
    next_command: AtomicU64,
    hook: Option<ConfigurationHook>,
}

impl PeripheralSession {
    /// Create a session; use [`SessionHandle::spawn`] to run jobs on it
    pub fn new(
        peripheral: PeripheralInfo,
        transport: Arc<dyn BleTransport>,
        configuration: SessionConfiguration,
        config: SessionConfig,
        hook: Option<ConfigurationHook>,
    ) -> Self {
        Self {
            peripheral: Mutex::new(peripheral),
            transport,
            configuration,
            config,
            state: Mutex::new(ConfigurationState::Unconfigured),
            requests: Mutex::new(HashMap::new()),
            next_command: AtomicU64::new(0),
            hook,
        }
    }

    /// Peripheral identifier
    pub fn id(&self) -> PeripheralId {
        self.peripheral.lock().id.clone()
    }

    /// Peripheral name
    pub fn name(&self) -> Option<String> {
        self.peripheral.lock().name.clone()
    }

    /// Peripheral identity and name
    pub fn peripheral(&self) -> PeripheralInfo {
        self.peripheral.lock().clone()
    }

    /// Point the session at a new peripheral handle
    ///
    /// A different identifier forces reconfiguration before the next job.
    pub fn set_peripheral(&self, info: PeripheralInfo) {
        let mut current = self.peripheral.lock();
        if current.id != info.id {
            error!(from = %current.id, to = %info.id, "Replacing peripheral reference");
            *self.state.lock() = ConfigurationState::Unconfigured;
        }
        *current = info;
    }

    /// Current configuration state
    pub fn configuration_state(&self) -> ConfigurationState {
        *self.state.lock()
    }

    /// Force configuration before the next job
    pub fn invalidate_configuration(&self) {
        *self.state.lock() = ConfigurationState::Unconfigured;
    }

    /// Peripheral link state as reported by the transport
    pub fn peripheral_state(&self) -> PeripheralState {
        self.transport.peripheral_state(&self.id())
    }

    /// Peripheral is connected
    pub fn is_connected(&self) -> bool {
        self.peripheral_state() == PeripheralState::Connected
    }

    /// Default per-command timeout
    pub fn command_timeout(&self) -> Duration {
        self.config.command_timeout
    }

    /// Number of conditions the current command still waits for
    pub fn pending_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Discovered services
    pub fn services(&self) -> Option<Vec<ServiceInfo>> {
        self.transport.services(&self.id())
    }

    /// Find a discovered characteristic in any service
    pub fn characteristic(&self, uuid: &Uuid) -> Option<CharacteristicInfo> {
        self.services()?
            .iter()
            .find_map(|service| service.characteristic(uuid).cloned())
    }

    // ===== Commands =====

    /// Issue a request and wait until every condition is met
    ///
    /// Fails with [`SessionError::NotReady`] unless the adapter is powered
    /// on and the peripheral connected, and with
    /// [`SessionError::InvalidConfiguration`] while another command is
    /// pending. Returns the values delivered for each condition, in order.
    pub async fn run_command(
        &self,
        timeout: Duration,
        conditions: Vec<PendingCondition>,
        request: Option<TransportRequest>,
    ) -> Result<Vec<Option<Bytes>>, SessionError> {
        let id = self.id();
        let central = self.transport.central_state();
        let link = self.transport.peripheral_state(&id);
        if central != CentralState::PoweredOn || link != PeripheralState::Connected {
            debug!(
                peripheral = %id,
                central = %central,
                link = %link,
                "Unable to run command"
            );
            return Err(SessionError::NotReady);
        }

        let command = self.next_command.fetch_add(1, Ordering::Relaxed);
        let receivers = {
            let mut requests = self.requests.lock();
            if !requests.is_empty() {
                return Err(SessionError::InvalidConfiguration);
            }
            let mut receivers = Vec::with_capacity(conditions.len());
            for condition in conditions {
                let key = condition.key();
                if requests.contains_key(&key) {
                    requests.retain(|_, pending| pending.command != command);
                    return Err(SessionError::InvalidConfiguration);
                }
                let (tx, rx) = oneshot::channel();
                requests.insert(key, condition.into_pending(command, tx));
                receivers.push(rx);
            }
            receivers
        };

        let _guard = PendingGuard {
            requests: &self.requests,
            command,
            armed: !receivers.is_empty(),
        };

        if let Some(request) = request {
            self.issue(&id, request).await?;
        }

        if receivers.is_empty() {
            return Ok(Vec::new());
        }

        let results = tokio::time::timeout(timeout, join_all(receivers))
            .await
            .map_err(|_| SessionError::Timeout {
                duration_ms: timeout.as_millis() as u64,
            })?;

        let mut values = Vec::with_capacity(results.len());
        let mut failure = None;
        for result in results {
            match result {
                Ok(Ok(value)) => values.push(value),
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                    values.push(None);
                }
                Err(_) => {
                    failure.get_or_insert(TransportError::SessionClosed);
                    values.push(None);
                }
            }
        }

        match failure {
            Some(e) => Err(SessionError::Transport(e)),
            None => Ok(values),
        }
    }

    async fn issue(&self, id: &PeripheralId, request: TransportRequest) -> Result<(), TransportError> {
        trace!(peripheral = %id, ?request, "Issuing transport request");
        match request {
            TransportRequest::DiscoverServices(services) => {
                self.transport.discover_services(id, &services).await
            }
            TransportRequest::DiscoverCharacteristics {
                service,
                characteristics,
            } => {
                self.transport
                    .discover_characteristics(id, service, &characteristics)
                    .await
            }
            TransportRequest::SetNotify {
                characteristic,
                enabled,
            } => self.transport.set_notify(id, characteristic, enabled).await,
            TransportRequest::ReadValue(characteristic) => {
                self.transport.read_value(id, characteristic).await
            }
            TransportRequest::WriteValue {
                characteristic,
                value,
                write_type,
            } => {
                self.transport
                    .write_value(id, characteristic, value, write_type)
                    .await
            }
        }
    }

    /// Discover services that are not known yet
    pub async fn discover_services(
        &self,
        services: &[Uuid],
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let known: Vec<Uuid> = self
            .services()
            .unwrap_or_default()
            .iter()
            .map(|s| s.uuid)
            .collect();
        let missing: Vec<Uuid> = services
            .iter()
            .filter(|s| !known.contains(s))
            .copied()
            .collect();

        debug!(peripheral = %self.id(), ?missing, "Services to discover");
        if missing.is_empty() {
            return Ok(());
        }

        self.run_command(
            timeout,
            vec![PendingCondition::ServiceDiscovery],
            Some(TransportRequest::DiscoverServices(services.to_vec())),
        )
        .await
        .map(|_| ())
    }

    /// Discover characteristics of `service` that are not known yet
    pub async fn discover_characteristics(
        &self,
        characteristics: &[Uuid],
        service: Uuid,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let info = self
            .services()
            .and_then(|services| services.into_iter().find(|s| s.uuid == service))
            .ok_or(SessionError::UnknownCharacteristic(service))?;

        let known: Vec<Uuid> = info
            .characteristics
            .unwrap_or_default()
            .iter()
            .map(|c| c.uuid)
            .collect();
        let missing: Vec<Uuid> = characteristics
            .iter()
            .filter(|c| !known.contains(c))
            .copied()
            .collect();

        debug!(peripheral = %self.id(), %service, ?missing, "Characteristics to discover");
        if missing.is_empty() {
            return Ok(());
        }

        self.run_command(
            timeout,
            vec![PendingCondition::CharacteristicDiscovery { service }],
            Some(TransportRequest::DiscoverCharacteristics {
                service,
                characteristics: missing,
            }),
        )
        .await
        .map(|_| ())
    }

    /// Enable or disable notifications, skipping if already in that state
    pub async fn set_notify(
        &self,
        enabled: bool,
        characteristic: Uuid,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let info = self
            .characteristic(&characteristic)
            .ok_or(SessionError::UnknownCharacteristic(characteristic))?;
        if info.is_notifying == enabled {
            trace!(%characteristic, enabled, "Notification state already set");
            return Ok(());
        }

        debug!(peripheral = %self.id(), %characteristic, enabled, "Set notify");
        self.run_command(
            timeout,
            vec![PendingCondition::NotificationState {
                characteristic,
                enabled,
            }],
            Some(TransportRequest::SetNotify {
                characteristic,
                enabled,
            }),
        )
        .await
        .map(|_| ())
    }

    /// Read a characteristic value
    pub async fn read_value(
        &self,
        characteristic: Uuid,
        timeout: Duration,
    ) -> Result<Option<Bytes>, SessionError> {
        self.characteristic(&characteristic)
            .ok_or(SessionError::UnknownCharacteristic(characteristic))?;

        let values = self
            .run_command(
                timeout,
                vec![PendingCondition::ValueUpdate {
                    characteristic,
                    matching: None,
                }],
                Some(TransportRequest::ReadValue(characteristic)),
            )
            .await?;
        Ok(values.into_iter().next().flatten())
    }

    /// Wait for the next value of a characteristic without issuing a request
    pub async fn wait_for_value(
        &self,
        characteristic: Uuid,
        matching: Option<ValuePredicate>,
        timeout: Duration,
    ) -> Result<Bytes, SessionError> {
        self.characteristic(&characteristic)
            .ok_or(SessionError::UnknownCharacteristic(characteristic))?;

        let values = self
            .run_command(
                timeout,
                vec![PendingCondition::ValueUpdate {
                    characteristic,
                    matching,
                }],
                None,
            )
            .await?;
        values
            .into_iter()
            .next()
            .flatten()
            .ok_or(SessionError::Timeout {
                duration_ms: timeout.as_millis() as u64,
            })
    }

    /// Write a characteristic value; only acknowledged writes wait
    pub async fn write_value(
        &self,
        value: Bytes,
        characteristic: Uuid,
        write_type: WriteType,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        self.characteristic(&characteristic)
            .ok_or(SessionError::UnknownCharacteristic(characteristic))?;

        let conditions = match write_type {
            WriteType::WithResponse => vec![PendingCondition::WriteAck { characteristic }],
            WriteType::WithoutResponse => Vec::new(),
        };
        self.run_command(
            timeout,
            conditions,
            Some(TransportRequest::WriteValue {
                characteristic,
                value,
                write_type,
            }),
        )
        .await
        .map(|_| ())
    }

    /// Request an RSSI reading; the result arrives as an event
    pub async fn read_rssi(&self) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotReady);
        }
        self.transport.read_rssi(&self.id()).await?;
        Ok(())
    }

    // ===== Configuration =====

    async fn configure_if_needed(&self) {
        let services_missing = self.services().is_none();
        {
            let mut state = self.state.lock();
            match *state {
                ConfigurationState::Ready if !services_missing => return,
                ConfigurationState::Ready => {
                    error!(peripheral = %self.id(), "Configured peripheral has no services. Reconfiguring");
                }
                _ => {}
            }
            *state = ConfigurationState::Configuring;
        }

        let next = match self.apply_configuration().await {
            Ok(()) => {
                info!(peripheral = %self.id(), "Peripheral configuration completed");
                match &self.hook {
                    Some(hook) => match hook(self) {
                        Ok(()) => {
                            info!(peripheral = %self.id(), "Delegate configuration completed");
                            ConfigurationState::Ready
                        }
                        Err(e) => {
                            warn!(peripheral = %self.id(), error = %e, "Delegate configuration failed");
                            ConfigurationState::Unconfigured
                        }
                    },
                    None => {
                        error!(peripheral = %self.id(), "No configuration hook set");
                        ConfigurationState::Unconfigured
                    }
                }
            }
            Err(e) => {
                // Retried before the next job
                warn!(peripheral = %self.id(), error = %e, "Error applying peripheral configuration");
                ConfigurationState::Unconfigured
            }
        };

        let mut state = self.state.lock();
        if *state == ConfigurationState::Configuring {
            *state = next;
        }
    }

    async fn apply_configuration(&self) -> Result<(), SessionError> {
        let timeout = self.config.discovery_timeout;
        let services: Vec<Uuid> = self
            .configuration
            .service_characteristics
            .keys()
            .copied()
            .collect();
        self.discover_services(&services, timeout).await?;

        for service in self.services().unwrap_or_default() {
            // Not every discovered service has characteristics we care about
            let Some(characteristics) = self.configuration.service_characteristics.get(&service.uuid)
            else {
                continue;
            };
            self.discover_characteristics(characteristics, service.uuid, timeout)
                .await?;
        }

        for (service_uuid, characteristics) in &self.configuration.notifying_characteristics {
            let service = self
                .services()
                .and_then(|services| services.into_iter().find(|s| s.uuid == *service_uuid))
                .ok_or(SessionError::UnknownCharacteristic(*service_uuid))?;

            for characteristic in characteristics {
                let info = service
                    .characteristic(characteristic)
                    .ok_or(SessionError::UnknownCharacteristic(*characteristic))?;
                if info.is_notifying {
                    continue;
                }
                self.set_notify(true, *characteristic, timeout).await?;
            }
        }

        Ok(())
    }

    // ===== Event delivery =====

    /// Deliver a transport callback for this peripheral
    pub fn handle_event(&self, event: PeripheralEvent) -> EventOutcome {
        match event {
            PeripheralEvent::ServicesDiscovered { error } => {
                self.resolve(RequestKey::ServiceDiscovery, |_| true, error, None)
            }
            PeripheralEvent::CharacteristicsDiscovered { service, error } => self.resolve(
                RequestKey::CharacteristicDiscovery(service),
                |_| true,
                error,
                None,
            ),
            PeripheralEvent::NotificationStateChanged {
                characteristic,
                enabled,
                error,
            } => {
                let failed = error.is_some();
                self.resolve(
                    RequestKey::NotificationState(characteristic),
                    |pending| failed || pending.enabled == Some(enabled),
                    error,
                    None,
                )
            }
            PeripheralEvent::ValueWritten {
                characteristic,
                error,
            } => self.resolve(RequestKey::WriteAck(characteristic), |_| true, error, None),
            PeripheralEvent::ValueUpdated {
                characteristic,
                value,
                error,
            } => {
                let outcome = self.resolve(
                    RequestKey::ValueUpdate(characteristic),
                    |pending| pending.matching.as_ref().map_or(true, |m| m(&value)),
                    error.clone(),
                    Some(value.clone()),
                );
                if outcome == EventOutcome::Resolved {
                    return outcome;
                }
                if let Some(handler) = self.configuration.value_update_macros.get(&characteristic) {
                    handler(self, &value);
                    return EventOutcome::Claimed;
                }
                if let Some(error) = error {
                    warn!(peripheral = %self.id(), %characteristic, %error, "Dropping failed value update");
                    return EventOutcome::Ignored;
                }
                EventOutcome::Unsolicited {
                    characteristic,
                    value,
                }
            }
            PeripheralEvent::RssiRead { rssi, error } => EventOutcome::RssiRead(match error {
                Some(e) => Err(e),
                None => Ok(rssi),
            }),
            PeripheralEvent::NameUpdated { name } => {
                self.peripheral.lock().name = name.clone();
                EventOutcome::NameUpdated(name)
            }
        }
    }

    fn resolve(
        &self,
        key: RequestKey,
        matches: impl FnOnce(&PendingRequest) -> bool,
        error: Option<TransportError>,
        value: Option<Bytes>,
    ) -> EventOutcome {
        let mut requests = self.requests.lock();
        if !requests.get(&key).map_or(false, matches) {
            return EventOutcome::Ignored;
        }
        if let Some(pending) = requests.remove(&key) {
            let completion = match error {
                Some(e) => Err(e),
                None => Ok(value),
            };
            let _ = pending.completion.send(completion);
        }
        EventOutcome::Resolved
    }

    /// Fail every pending request
    pub fn teardown(&self) {
        let pending: Vec<PendingRequest> = self.requests.lock().drain().map(|(_, p)| p).collect();
        if !pending.is_empty() {
            debug!(peripheral = %self.id(), count = pending.len(), "Failing pending requests");
        }
        for request in pending {
            let _ = request.completion.send(Err(TransportError::SessionClosed));
        }
    }
}

impl std::fmt::Debug for PeripheralSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeripheralSession")
            .field("peripheral", &*self.peripheral.lock())
            .field("state", &*self.state.lock())
            .field("pending", &self.requests.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Removes a command's leftover entries when it ends, however it ends
///
/// Entries of a command accepted after this one resolved are left alone.
struct PendingGuard<'a> {
    requests: &'a Mutex<HashMap<RequestKey, PendingRequest>>,
    command: u64,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let command = self.command;
            self.requests
                .lock()
                .retain(|_, pending| pending.command != command);
        }
    }
}

/// Handle for queueing jobs on a session's worker task
///
/// The worker stops once every handle is dropped.
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<PeripheralSession>,
    jobs: mpsc::UnboundedSender<Job>,
}

impl SessionHandle {
    /// Start the worker task for a session and queue an initial configuration
    pub fn spawn(session: PeripheralSession) -> Self {
        let session = Arc::new(session);
        let (jobs, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_jobs(session.clone(), rx));

        let handle = Self { session, jobs };
        handle.assert_configuration();
        handle
    }

    /// Queue a job; configuration runs first when needed
    pub fn perform<F, Fut>(&self, job: F)
    where
        F: FnOnce(Arc<PeripheralSession>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let job: Job = Box::new(move |session| Box::pin(job(session)));
        if self.jobs.send(job).is_err() {
            warn!(peripheral = %self.session.id(), "Session worker stopped, dropping job");
        }
    }

    /// Queue an empty job so configuration runs if needed
    pub fn assert_configuration(&self) {
        trace!(peripheral = %self.session.id(), "Asserting configuration");
        self.perform(|_| async {});
    }

    /// Connection established for this session's peripheral
    pub fn did_connect(&self) {
        debug!(peripheral = %self.session.id(), "Session connected");
        if self.session.is_connected() {
            self.assert_configuration();
        }
    }

    /// Adapter power state changed
    pub fn central_state_changed(&self, state: CentralState) {
        if state == CentralState::PoweredOn {
            debug!(peripheral = %self.session.id(), "Central powered on");
            self.assert_configuration();
        }
    }

    /// Shared session
    pub fn session(&self) -> &Arc<PeripheralSession> {
        &self.session
    }

    /// Both handles drive the same session
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.session, &other.session)
    }
}

impl std::ops::Deref for SessionHandle {
    type Target = PeripheralSession;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SessionHandle").field(&self.session).finish()
    }
}

async fn run_jobs(session: Arc<PeripheralSession>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        session.configure_if_needed().await;
        job(session.clone()).await;
    }
    trace!(peripheral = %session.id(), "Session worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GattProfile, AUTHENTICATION_UUID, CGM_SERVICE_UUID, CONTROL_UUID};
    use crate::test_utils::{pump_session_events, MockTransport};
    use std::sync::atomic::AtomicUsize;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn sensor() -> PeripheralInfo {
        PeripheralInfo::new("peripheral-1", Some("DXCM01"))
    }

    /// Session over a connected mock sensor, with events pumped into it
    fn connected_session(
        hook: Option<ConfigurationHook>,
        configuration: SessionConfiguration,
    ) -> (Arc<MockTransport>, Arc<PeripheralSession>) {
        let (transport, events) = MockTransport::new();
        transport.add_sensor(sensor());
        transport.set_peripheral_state(&sensor().id, PeripheralState::Connected);

        let session = Arc::new(PeripheralSession::new(
            sensor(),
            transport.clone(),
            configuration,
            SessionConfig::default(),
            hook,
        ));

        pump_session_events(events, session.clone());
        (transport, session)
    }

    async fn discovered_session() -> (Arc<MockTransport>, Arc<PeripheralSession>) {
        let (transport, session) =
            connected_session(None, GattProfile::default().session_configuration());
        session.apply_configuration().await.unwrap();
        (transport, session)
    }

    async fn wait_until_pending(session: &PeripheralSession) {
        while session.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_not_ready_when_disconnected() {
        let (transport, session) = connected_session(None, SessionConfiguration::default());
        transport.set_peripheral_state(&sensor().id, PeripheralState::Disconnected);

        let result = session
            .run_command(TIMEOUT, vec![PendingCondition::ServiceDiscovery], None)
            .await;
        assert_eq!(result, Err(SessionError::NotReady));
    }

    #[tokio::test]
    async fn test_not_ready_when_powered_off() {
        let (transport, session) = connected_session(None, SessionConfiguration::default());
        transport.set_central_state(CentralState::PoweredOff);

        let result = session.run_command(TIMEOUT, Vec::new(), None).await;
        assert_eq!(result, Err(SessionError::NotReady));
    }

    #[tokio::test]
    async fn test_command_without_conditions_returns_immediately() {
        let (_transport, session) = connected_session(None, SessionConfiguration::default());
        let values = session.run_command(TIMEOUT, Vec::new(), None).await.unwrap();
        assert!(values.is_empty());
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_configuration_discovers_services_and_characteristics() {
        let (transport, session) = discovered_session().await;

        let services = session.services().unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].uuid, CGM_SERVICE_UUID);
        assert!(session.characteristic(&CONTROL_UUID).is_some());

        // A second pass has nothing left to discover
        let before = transport.requests().len();
        session.apply_configuration().await.unwrap();
        assert_eq!(transport.requests().len(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_next_command_runs() {
        let (transport, session) = discovered_session().await;
        transport.set_auto_respond(false);

        let start = tokio::time::Instant::now();
        let result = session.set_notify(true, AUTHENTICATION_UUID, TIMEOUT).await;
        assert_eq!(result, Err(SessionError::Timeout { duration_ms: 2000 }));
        assert!(start.elapsed() >= TIMEOUT);
        assert_eq!(session.pending_count(), 0);

        transport.set_auto_respond(true);
        session
            .set_notify(true, AUTHENTICATION_UUID, TIMEOUT)
            .await
            .unwrap();
        assert!(session.characteristic(&AUTHENTICATION_UUID).unwrap().is_notifying);
    }

    #[tokio::test]
    async fn test_concurrent_command_is_rejected() {
        let (transport, session) = discovered_session().await;
        transport.set_auto_respond(false);

        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.set_notify(true, CONTROL_UUID, TIMEOUT).await })
        };
        wait_until_pending(&session).await;

        let second = session
            .run_command(
                TIMEOUT,
                vec![PendingCondition::ServiceDiscovery],
                Some(TransportRequest::DiscoverServices(vec![CGM_SERVICE_UUID])),
            )
            .await;
        assert_eq!(second, Err(SessionError::InvalidConfiguration));
        assert_eq!(session.pending_count(), 1);

        let outcome = session.handle_event(PeripheralEvent::NotificationStateChanged {
            characteristic: CONTROL_UUID,
            enabled: true,
            error: None,
        });
        assert_eq!(outcome, EventOutcome::Resolved);
        assert_eq!(first.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_command_accepted_after_previous_resolved_is_kept() {
        let (transport, session) = discovered_session().await;
        transport.set_auto_respond(false);

        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.set_notify(true, CONTROL_UUID, TIMEOUT).await })
        };
        wait_until_pending(&session).await;

        // First command resolved but its task has not run again yet
        let outcome = session.handle_event(PeripheralEvent::NotificationStateChanged {
            characteristic: CONTROL_UUID,
            enabled: true,
            error: None,
        });
        assert_eq!(outcome, EventOutcome::Resolved);
        assert_eq!(session.pending_count(), 0);

        let mut second = Box::pin(session.run_command(
            TIMEOUT,
            vec![PendingCondition::ServiceDiscovery],
            None,
        ));
        assert!(futures::poll!(&mut second).is_pending());
        assert_eq!(session.pending_count(), 1);

        assert_eq!(first.await.unwrap(), Ok(()));
        assert_eq!(session.pending_count(), 1);

        let outcome = session.handle_event(PeripheralEvent::ServicesDiscovered { error: None });
        assert_eq!(outcome, EventOutcome::Resolved);
        assert_eq!(second.await, Ok(vec![None]));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_callback_error_is_wrapped() {
        let (transport, session) = discovered_session().await;
        transport.set_auto_respond(false);

        let command = {
            let session = session.clone();
            tokio::spawn(async move { session.set_notify(true, CONTROL_UUID, TIMEOUT).await })
        };
        wait_until_pending(&session).await;

        session.handle_event(PeripheralEvent::NotificationStateChanged {
            characteristic: CONTROL_UUID,
            enabled: false,
            error: Some(TransportError::Platform("insufficient encryption".into())),
        });
        assert_eq!(
            command.await.unwrap(),
            Err(SessionError::Transport(TransportError::Platform(
                "insufficient encryption".into()
            )))
        );
    }

    #[tokio::test]
    async fn test_wrong_notification_state_does_not_resolve() {
        let (transport, session) = discovered_session().await;
        transport.set_auto_respond(false);

        let command = {
            let session = session.clone();
            tokio::spawn(async move { session.set_notify(true, CONTROL_UUID, TIMEOUT).await })
        };
        wait_until_pending(&session).await;

        let outcome = session.handle_event(PeripheralEvent::NotificationStateChanged {
            characteristic: CONTROL_UUID,
            enabled: false,
            error: None,
        });
        assert_eq!(outcome, EventOutcome::Ignored);
        assert_eq!(session.pending_count(), 1);

        session.teardown();
        assert_eq!(
            command.await.unwrap(),
            Err(SessionError::Transport(TransportError::SessionClosed))
        );
    }

    #[tokio::test]
    async fn test_set_notify_skips_when_already_notifying() {
        let (transport, session) = discovered_session().await;
        session
            .set_notify(true, CONTROL_UUID, TIMEOUT)
            .await
            .unwrap();
        let before = transport.requests().len();

        session
            .set_notify(true, CONTROL_UUID, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(transport.requests().len(), before);
    }

    #[tokio::test]
    async fn test_unknown_characteristic() {
        let (_transport, session) = discovered_session().await;
        let missing = Uuid::from_u128(42);
        assert_eq!(
            session.set_notify(true, missing, TIMEOUT).await,
            Err(SessionError::UnknownCharacteristic(missing))
        );
    }

    #[tokio::test]
    async fn test_read_and_write() {
        let (transport, session) = discovered_session().await;
        transport.set_value(&sensor().id, CONTROL_UUID, Bytes::from_static(&[0x01, 0x02]));

        let value = session.read_value(CONTROL_UUID, TIMEOUT).await.unwrap();
        assert_eq!(value, Some(Bytes::from_static(&[0x01, 0x02])));

        session
            .write_value(
                Bytes::from_static(&[0x28]),
                CONTROL_UUID,
                WriteType::WithResponse,
                TIMEOUT,
            )
            .await
            .unwrap();

        // Unacknowledged writes never wait, even without callbacks
        transport.set_auto_respond(false);
        session
            .write_value(
                Bytes::from_static(&[0x28]),
                CONTROL_UUID,
                WriteType::WithoutResponse,
                TIMEOUT,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_matching_value() {
        let (_transport, session) = discovered_session().await;

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move {
                let matching: ValuePredicate = Arc::new(|value: &Bytes| value.first() == Some(&0x4E));
                session
                    .wait_for_value(CONTROL_UUID, Some(matching), TIMEOUT)
                    .await
            })
        };
        wait_until_pending(&session).await;

        let other = session.handle_event(PeripheralEvent::ValueUpdated {
            characteristic: CONTROL_UUID,
            value: Bytes::from_static(&[0x59]),
            error: None,
        });
        assert_eq!(
            other,
            EventOutcome::Unsolicited {
                characteristic: CONTROL_UUID,
                value: Bytes::from_static(&[0x59]),
            }
        );

        let matched = session.handle_event(PeripheralEvent::ValueUpdated {
            characteristic: CONTROL_UUID,
            value: Bytes::from_static(&[0x4E, 0x00]),
            error: None,
        });
        assert_eq!(matched, EventOutcome::Resolved);
        assert_eq!(
            waiter.await.unwrap(),
            Ok(Bytes::from_static(&[0x4E, 0x00]))
        );
    }

    #[tokio::test]
    async fn test_value_update_macro_claims_updates() {
        let claimed = Arc::new(AtomicUsize::new(0));
        let counter = claimed.clone();
        let mut configuration = GattProfile::default().session_configuration();
        configuration.value_update_macros.insert(
            CONTROL_UUID,
            Arc::new(move |_: &PeripheralSession, _: &Bytes| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let (_transport, session) = connected_session(None, configuration);

        let outcome = session.handle_event(PeripheralEvent::ValueUpdated {
            characteristic: CONTROL_UUID,
            value: Bytes::from_static(&[0x4E]),
            error: None,
        });
        assert_eq!(outcome, EventOutcome::Claimed);
        assert_eq!(claimed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configuration_failure_is_retried_on_next_job() {
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let calls = hook_calls.clone();
        let hook: ConfigurationHook = Arc::new(move |_: &PeripheralSession| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let (transport, session) =
            connected_session(Some(hook), GattProfile::default().session_configuration());
        transport.set_peripheral_state(&sensor().id, PeripheralState::Disconnected);

        session.configure_if_needed().await;
        assert_eq!(
            session.configuration_state(),
            ConfigurationState::Unconfigured
        );
        assert_eq!(hook_calls.load(Ordering::SeqCst), 0);

        transport.set_peripheral_state(&sensor().id, PeripheralState::Connected);
        session.configure_if_needed().await;
        assert_eq!(session.configuration_state(), ConfigurationState::Ready);
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);

        // Ready sessions skip configuration
        session.configure_if_needed().await;
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hook_failure_leaves_session_unconfigured() {
        let hook: ConfigurationHook = Arc::new(|_: &PeripheralSession| Err(SessionError::NotReady));
        let (_transport, session) =
            connected_session(Some(hook), GattProfile::default().session_configuration());

        session.configure_if_needed().await;
        assert_eq!(
            session.configuration_state(),
            ConfigurationState::Unconfigured
        );
    }

    #[tokio::test]
    async fn test_replacing_peripheral_forces_reconfiguration() {
        let hook: ConfigurationHook = Arc::new(|_: &PeripheralSession| Ok(()));
        let (_transport, session) =
            connected_session(Some(hook), GattProfile::default().session_configuration());
        session.configure_if_needed().await;
        assert_eq!(session.configuration_state(), ConfigurationState::Ready);

        session.set_peripheral(sensor());
        assert_eq!(session.configuration_state(), ConfigurationState::Ready);

        session.set_peripheral(PeripheralInfo::new("peripheral-2", Some("DXCM01")));
        assert_eq!(
            session.configuration_state(),
            ConfigurationState::Unconfigured
        );
    }

    #[tokio::test]
    async fn test_handle_runs_jobs_after_configuration() {
        let (transport, events) = MockTransport::new();
        transport.add_sensor(sensor());
        transport.set_peripheral_state(&sensor().id, PeripheralState::Connected);
        let hook: ConfigurationHook = Arc::new(|_: &PeripheralSession| Ok(()));
        let handle = SessionHandle::spawn(PeripheralSession::new(
            sensor(),
            transport.clone(),
            GattProfile::default().session_configuration(),
            SessionConfig::default(),
            Some(hook),
        ));
        pump_session_events(events, handle.session().clone());

        let (tx, rx) = oneshot::channel();
        handle.perform(move |peripheral| async move {
            let result = peripheral.set_notify(true, AUTHENTICATION_UUID, TIMEOUT).await;
            let _ = tx.send((peripheral.configuration_state(), result));
        });

        let (state, result) = rx.await.unwrap();
        assert_eq!(state, ConfigurationState::Ready);
        assert_eq!(result, Ok(()));
    }
}
