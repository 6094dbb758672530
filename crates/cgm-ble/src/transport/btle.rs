//! btleplug-backed transport
//!
//! btleplug exposes an async request/response API plus one adapter-wide
//! event stream. This module turns both into the fire-and-forget request
//! model of [`BleTransport`]: every request runs on its own task and posts
//! its completion as a [`TransportEvent`].
//!
//! Desktop stacks have no state restoration and no connection-event
//! registration. Peripherals already connected when the transport starts
//! are reported once as [`TransportEvent::RestoreState`], and connections
//! the transport did not initiate are reported as connection events when
//! they match the registered services.

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType as BtleWriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{
    BleTransport, CentralState, CharacteristicInfo, PeripheralEvent, PeripheralId,
    PeripheralInfo, PeripheralState, ServiceInfo, TransportEvent, WriteType,
};
use crate::error::TransportError;

fn platform_error(e: btleplug::Error) -> TransportError {
    match e {
        btleplug::Error::NotConnected => TransportError::NotConnected,
        btleplug::Error::DeviceNotFound => TransportError::Unknown("device".to_string()),
        other => TransportError::Platform(other.to_string()),
    }
}

/// Platform identifiers carry no stable `Display` across backends
fn peripheral_id(id: &btleplug::platform::PeripheralId) -> PeripheralId {
    PeripheralId::new(format!("{id:?}"))
}

#[derive(Default)]
struct BtleState {
    central: CentralState,
    scanning: bool,
    peripherals: HashMap<PeripheralId, Peripheral>,
    names: HashMap<PeripheralId, Option<String>>,
    links: HashMap<PeripheralId, PeripheralState>,
    services: HashMap<PeripheralId, Vec<ServiceInfo>>,
    notifying: HashSet<(PeripheralId, Uuid)>,
    pumps: HashMap<PeripheralId, JoinHandle<()>>,
    /// Connects requested but not yet reported
    connecting: HashSet<PeripheralId>,
    /// Disconnects requested locally
    cancelling: HashSet<PeripheralId>,
    connection_event_services: Option<Vec<Uuid>>,
}

struct Shared {
    state: Mutex<BtleState>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            trace!("Transport event receiver dropped");
        }
    }

    fn emit_peripheral(&self, id: &PeripheralId, event: PeripheralEvent) {
        self.emit(TransportEvent::Peripheral {
            id: id.clone(),
            event,
        });
    }

    fn info(&self, id: &PeripheralId) -> PeripheralInfo {
        let name = self.state.lock().names.get(id).cloned().flatten();
        PeripheralInfo {
            id: id.clone(),
            name,
        }
    }

    fn peripheral(&self, id: &PeripheralId) -> Result<Peripheral, TransportError> {
        self.state
            .lock()
            .peripherals
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::Unknown(id.to_string()))
    }

    fn characteristic(
        &self,
        peripheral: &Peripheral,
        uuid: Uuid,
    ) -> Result<Characteristic, TransportError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| TransportError::Unknown(uuid.to_string()))
    }

    /// Remember a platform peripheral and return its info
    async fn track(&self, peripheral: Peripheral) -> PeripheralInfo {
        let id = peripheral_id(&peripheral.id());
        let name = match peripheral.properties().await {
            Ok(Some(props)) => props.local_name,
            _ => None,
        };
        let mut state = self.state.lock();
        state.peripherals.insert(id.clone(), peripheral);
        state.names.insert(id.clone(), name.clone());
        PeripheralInfo { id, name }
    }

    /// Forward notifications of one peripheral until it disconnects
    fn start_pump(self: &Arc<Self>, id: &PeripheralId, peripheral: Peripheral) {
        let shared = self.clone();
        let pump_id = id.clone();
        let pump = tokio::spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(n) => n,
                Err(e) => {
                    warn!(peripheral = %pump_id, error = %e, "Could not open notification stream");
                    return;
                }
            };
            while let Some(notification) = notifications.next().await {
                shared.emit_peripheral(
                    &pump_id,
                    PeripheralEvent::ValueUpdated {
                        characteristic: notification.uuid,
                        value: Bytes::from(notification.value),
                        error: None,
                    },
                );
            }
            trace!(peripheral = %pump_id, "Notification stream ended");
        });
        if let Some(previous) = self.state.lock().pumps.insert(id.clone(), pump) {
            previous.abort();
        }
    }

    /// Report a finished connection exactly once
    fn connected(self: &Arc<Self>, id: &PeripheralId) {
        let (requested, peripheral, registered) = {
            let mut state = self.state.lock();
            if state.links.get(id) == Some(&PeripheralState::Connected) {
                return;
            }
            state.links.insert(id.clone(), PeripheralState::Connected);
            (
                state.connecting.remove(id),
                state.peripherals.get(id).cloned(),
                state.connection_event_services.clone(),
            )
        };
        if let Some(peripheral) = peripheral.clone() {
            self.start_pump(id, peripheral);
        }

        let info = self.info(id);
        if requested {
            info!(peripheral = %id, "Connected");
            self.emit(TransportEvent::Connected(info));
            return;
        }

        let Some(filter) = registered else {
            return;
        };
        let Some(peripheral) = peripheral else {
            return;
        };
        let shared = self.clone();
        tokio::spawn(async move {
            let advertised = match peripheral.properties().await {
                Ok(Some(props)) => props.services,
                _ => Vec::new(),
            };
            if filter.is_empty() || advertised.iter().any(|s| filter.contains(s)) {
                shared.emit(TransportEvent::ConnectionEventOccurred(info));
            }
        });
    }

    fn disconnected(&self, id: &PeripheralId) {
        let (was_connecting, was_cancelled) = {
            let mut state = self.state.lock();
            let previous = state.links.insert(id.clone(), PeripheralState::Disconnected);
            if matches!(previous, None | Some(PeripheralState::Disconnected)) {
                return;
            }
            state.services.remove(id);
            state.notifying.retain(|(p, _)| p != id);
            if let Some(pump) = state.pumps.remove(id) {
                pump.abort();
            }
            (state.connecting.remove(id), state.cancelling.remove(id))
        };

        let peripheral = self.info(id);
        if was_connecting {
            self.emit(TransportEvent::FailedToConnect {
                peripheral,
                error: Some(TransportError::ConnectionFailed("link dropped".to_string())),
            });
        } else {
            let error = (!was_cancelled).then_some(TransportError::PeripheralDisconnected);
            info!(peripheral = %id, remote = error.is_some(), "Disconnected");
            self.emit(TransportEvent::Disconnected { peripheral, error });
        }
    }

    /// Rebuild the service cache from the platform's discovered GATT table
    fn refresh_services(&self, id: &PeripheralId, peripheral: &Peripheral, wanted: &[Uuid]) {
        let mut state = self.state.lock();
        let notifying: HashSet<Uuid> = state
            .notifying
            .iter()
            .filter(|(p, _)| p == id)
            .map(|(_, c)| *c)
            .collect();
        let cache = state.services.entry(id.clone()).or_default();
        for service in peripheral.services() {
            if !wanted.is_empty() && !wanted.contains(&service.uuid) {
                continue;
            }
            if !cache.iter().any(|s| s.uuid == service.uuid) {
                cache.push(ServiceInfo {
                    uuid: service.uuid,
                    characteristics: None,
                });
            }
        }
        for info in cache.iter_mut() {
            if let Some(known) = info.characteristics.as_mut() {
                for c in known.iter_mut() {
                    c.is_notifying = notifying.contains(&c.uuid);
                }
            }
        }
    }

    fn fill_characteristics(
        &self,
        id: &PeripheralId,
        peripheral: &Peripheral,
        service: Uuid,
        wanted: &[Uuid],
    ) {
        let mut state = self.state.lock();
        let notifying: HashSet<Uuid> = state
            .notifying
            .iter()
            .filter(|(p, _)| p == id)
            .map(|(_, c)| *c)
            .collect();
        let Some(info) = state
            .services
            .get_mut(id)
            .and_then(|services| services.iter_mut().find(|s| s.uuid == service))
        else {
            return;
        };
        let known = info.characteristics.get_or_insert_with(Vec::new);
        for c in peripheral.characteristics() {
            if c.service_uuid != service {
                continue;
            }
            if !wanted.is_empty() && !wanted.contains(&c.uuid) {
                continue;
            }
            if !known.iter().any(|k| k.uuid == c.uuid) {
                known.push(CharacteristicInfo {
                    uuid: c.uuid,
                    is_notifying: notifying.contains(&c.uuid),
                    value: None,
                });
            }
        }
    }

    fn remember_value(&self, id: &PeripheralId, characteristic: Uuid, value: &Bytes) {
        let mut state = self.state.lock();
        if let Some(c) = state
            .services
            .get_mut(id)
            .into_iter()
            .flatten()
            .filter_map(|s| s.characteristics.as_mut())
            .flatten()
            .find(|c| c.uuid == characteristic)
        {
            c.value = Some(value.clone());
        }
    }
}

/// [`BleTransport`] over the first adapter btleplug finds
pub struct BtleplugTransport {
    adapter: Adapter,
    shared: Arc<Shared>,
    event_task: JoinHandle<()>,
}

impl BtleplugTransport {
    /// Open the first Bluetooth adapter and start listening to it
    pub async fn new(
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let manager = Manager::new().await.map_err(platform_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(platform_error)?
            .into_iter()
            .next()
            .ok_or(TransportError::PoweredOff)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(BtleState::default()),
            events: events_tx,
        });

        let central_events = adapter.events().await.map_err(platform_error)?;
        let event_task = tokio::spawn(run_central_events(
            adapter.clone(),
            shared.clone(),
            central_events,
        ));

        shared.state.lock().central = CentralState::PoweredOn;
        shared.emit(TransportEvent::StateChanged(CentralState::PoweredOn));

        let mut restored = Vec::new();
        for peripheral in adapter.peripherals().await.map_err(platform_error)? {
            if peripheral.is_connected().await.unwrap_or(false) {
                let info = shared.track(peripheral).await;
                shared
                    .state
                    .lock()
                    .links
                    .insert(info.id.clone(), PeripheralState::Connected);
                restored.push(info);
            }
        }
        if !restored.is_empty() {
            info!(count = restored.len(), "Restoring connected peripherals");
            for info in &restored {
                if let Ok(peripheral) = shared.peripheral(&info.id) {
                    shared.start_pump(&info.id, peripheral);
                }
            }
            shared.emit(TransportEvent::RestoreState(restored));
        }

        Ok((
            Arc::new(Self {
                adapter,
                shared,
                event_task,
            }),
            events_rx,
        ))
    }

    /// Run a request on its own task
    fn spawn_request<F>(&self, request: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(request);
    }

    fn connected_peripheral(&self, id: &PeripheralId) -> Result<Peripheral, TransportError> {
        if self.peripheral_state(id) != PeripheralState::Connected {
            return Err(TransportError::NotConnected);
        }
        self.shared.peripheral(id)
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.event_task.abort();
        for (_, pump) in self.shared.state.lock().pumps.drain() {
            pump.abort();
        }
    }
}

impl std::fmt::Debug for BtleplugTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("BtleplugTransport")
            .field("central", &state.central)
            .field("scanning", &state.scanning)
            .field("peripherals", &state.peripherals.len())
            .finish()
    }
}

async fn run_central_events(
    adapter: Adapter,
    shared: Arc<Shared>,
    mut events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
) {
    while let Some(event) = events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(platform_id) => {
                let Ok(peripheral) = adapter.peripheral(&platform_id).await else {
                    continue;
                };
                let info = shared.track(peripheral).await;
                debug!(peripheral = %info.id, name = ?info.name, "Discovered");
                if shared.state.lock().scanning {
                    shared.emit(TransportEvent::Discovered(info));
                }
            }
            CentralEvent::DeviceConnected(platform_id) => {
                let id = peripheral_id(&platform_id);
                if shared.peripheral(&id).is_err() {
                    if let Ok(peripheral) = adapter.peripheral(&platform_id).await {
                        shared.track(peripheral).await;
                    }
                }
                shared.connected(&id);
            }
            CentralEvent::DeviceDisconnected(platform_id) => {
                shared.disconnected(&peripheral_id(&platform_id));
            }
            other => trace!(event = ?other, "Ignoring central event"),
        }
    }
    warn!("Central event stream ended");
    shared.state.lock().central = CentralState::Unknown;
    shared.emit(TransportEvent::StateChanged(CentralState::Unknown));
}

#[async_trait::async_trait]
impl BleTransport for BtleplugTransport {
    fn central_state(&self) -> CentralState {
        self.shared.state.lock().central
    }

    fn is_scanning(&self) -> bool {
        self.shared.state.lock().scanning
    }

    fn peripheral_state(&self, id: &PeripheralId) -> PeripheralState {
        self.shared
            .state
            .lock()
            .links
            .get(id)
            .copied()
            .unwrap_or(PeripheralState::Disconnected)
    }

    fn services(&self, id: &PeripheralId) -> Option<Vec<ServiceInfo>> {
        self.shared.state.lock().services.get(id).cloned()
    }

    async fn start_scan(&self, services: &[Uuid]) -> Result<(), TransportError> {
        self.adapter
            .start_scan(ScanFilter {
                services: services.to_vec(),
            })
            .await
            .map_err(platform_error)?;
        self.shared.state.lock().scanning = true;
        debug!(services = ?services, "Scan started");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.shared.state.lock().scanning = false;
        self.adapter.stop_scan().await.map_err(platform_error)?;
        debug!("Scan stopped");
        Ok(())
    }

    async fn connect(&self, id: &PeripheralId) -> Result<(), TransportError> {
        let peripheral = self.shared.peripheral(id)?;
        {
            let mut state = self.shared.state.lock();
            if state.links.get(id) == Some(&PeripheralState::Connected) {
                return Ok(());
            }
            state.links.insert(id.clone(), PeripheralState::Connecting);
            state.connecting.insert(id.clone());
        }

        let shared = self.shared.clone();
        let id = id.clone();
        self.spawn_request(async move {
            match peripheral.connect().await {
                Ok(()) => shared.connected(&id),
                Err(e) => {
                    let pending = {
                        let mut state = shared.state.lock();
                        state.links.insert(id.clone(), PeripheralState::Disconnected);
                        state.connecting.remove(&id)
                    };
                    if pending {
                        warn!(peripheral = %id, error = %e, "Connect failed");
                        shared.emit(TransportEvent::FailedToConnect {
                            peripheral: shared.info(&id),
                            error: Some(TransportError::ConnectionFailed(e.to_string())),
                        });
                    }
                }
            }
        });
        Ok(())
    }

    async fn cancel_connection(&self, id: &PeripheralId) -> Result<(), TransportError> {
        let peripheral = self.shared.peripheral(id)?;
        {
            let mut state = self.shared.state.lock();
            if state.links.get(id).copied().unwrap_or(PeripheralState::Disconnected)
                == PeripheralState::Disconnected
            {
                return Ok(());
            }
            state.connecting.remove(id);
            state.cancelling.insert(id.clone());
            state.links.insert(id.clone(), PeripheralState::Disconnecting);
        }

        let shared = self.shared.clone();
        let id = id.clone();
        self.spawn_request(async move {
            if let Err(e) = peripheral.disconnect().await {
                warn!(peripheral = %id, error = %e, "Disconnect failed");
            }
            if shared.state.lock().cancelling.contains(&id) {
                shared.disconnected(&id);
            }
        });
        Ok(())
    }

    async fn retrieve_peripherals(&self, ids: &[PeripheralId]) -> Vec<PeripheralInfo> {
        ids.iter()
            .filter(|id| self.shared.peripheral(id).is_ok())
            .map(|id| self.shared.info(id))
            .collect()
    }

    async fn retrieve_connected_peripherals(&self, services: &[Uuid]) -> Vec<PeripheralInfo> {
        let peripherals = match self.adapter.peripherals().await {
            Ok(peripherals) => peripherals,
            Err(e) => {
                warn!(error = %e, "Failed to list peripherals");
                return Vec::new();
            }
        };

        let mut found = Vec::new();
        for peripheral in peripherals {
            if !peripheral.is_connected().await.unwrap_or(false) {
                continue;
            }
            let advertised = match peripheral.properties().await {
                Ok(Some(props)) => props.services,
                _ => Vec::new(),
            };
            let discovered = peripheral.services();
            let matches = advertised.iter().any(|s| services.contains(s))
                || discovered.iter().any(|s| services.contains(&s.uuid));
            if matches {
                found.push(self.shared.track(peripheral).await);
            }
        }
        found
    }

    async fn register_for_connection_events(
        &self,
        services: Option<&[Uuid]>,
    ) -> Result<(), TransportError> {
        self.shared.state.lock().connection_event_services = services.map(<[Uuid]>::to_vec);
        Ok(())
    }

    async fn discover_services(
        &self,
        id: &PeripheralId,
        services: &[Uuid],
    ) -> Result<(), TransportError> {
        let peripheral = self.connected_peripheral(id)?;
        let shared = self.shared.clone();
        let id = id.clone();
        let wanted = services.to_vec();
        self.spawn_request(async move {
            let error = match peripheral.discover_services().await {
                Ok(()) => {
                    shared.refresh_services(&id, &peripheral, &wanted);
                    None
                }
                Err(e) => Some(platform_error(e)),
            };
            shared.emit_peripheral(&id, PeripheralEvent::ServicesDiscovered { error });
        });
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<(), TransportError> {
        let peripheral = self.connected_peripheral(id)?;
        // btleplug discovers the whole GATT table with the services
        self.shared
            .fill_characteristics(id, &peripheral, service, characteristics);
        self.shared.emit_peripheral(
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
        let peripheral = self.connected_peripheral(id)?;
        let target = self.shared.characteristic(&peripheral, characteristic)?;
        let shared = self.shared.clone();
        let id = id.clone();
        self.spawn_request(async move {
            let result = if enabled {
                peripheral.subscribe(&target).await
            } else {
                peripheral.unsubscribe(&target).await
            };
            let error = match result {
                Ok(()) => {
                    let mut state = shared.state.lock();
                    if enabled {
                        state.notifying.insert((id.clone(), characteristic));
                    } else {
                        state.notifying.remove(&(id.clone(), characteristic));
                    }
                    if let Some(c) = state
                        .services
                        .get_mut(&id)
                        .into_iter()
                        .flatten()
                        .filter_map(|s| s.characteristics.as_mut())
                        .flatten()
                        .find(|c| c.uuid == characteristic)
                    {
                        c.is_notifying = enabled;
                    }
                    None
                }
                Err(e) => Some(platform_error(e)),
            };
            shared.emit_peripheral(
                &id,
                PeripheralEvent::NotificationStateChanged {
                    characteristic,
                    enabled,
                    error,
                },
            );
        });
        Ok(())
    }

    async fn read_value(
        &self,
        id: &PeripheralId,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        let peripheral = self.connected_peripheral(id)?;
        let target = self.shared.characteristic(&peripheral, characteristic)?;
        let shared = self.shared.clone();
        let id = id.clone();
        self.spawn_request(async move {
            let (value, error) = match peripheral.read(&target).await {
                Ok(value) => {
                    let value = Bytes::from(value);
                    shared.remember_value(&id, characteristic, &value);
                    (value, None)
                }
                Err(e) => (Bytes::new(), Some(platform_error(e))),
            };
            shared.emit_peripheral(
                &id,
                PeripheralEvent::ValueUpdated {
                    characteristic,
                    value,
                    error,
                },
            );
        });
        Ok(())
    }

    async fn write_value(
        &self,
        id: &PeripheralId,
        characteristic: Uuid,
        value: Bytes,
        write_type: WriteType,
    ) -> Result<(), TransportError> {
        let peripheral = self.connected_peripheral(id)?;
        let target = self.shared.characteristic(&peripheral, characteristic)?;
        let shared = self.shared.clone();
        let id = id.clone();
        self.spawn_request(async move {
            let mode = match write_type {
                WriteType::WithResponse => BtleWriteType::WithResponse,
                WriteType::WithoutResponse => BtleWriteType::WithoutResponse,
            };
            let result = peripheral.write(&target, &value, mode).await;
            match (write_type, result) {
                (WriteType::WithResponse, result) => shared.emit_peripheral(
                    &id,
                    PeripheralEvent::ValueWritten {
                        characteristic,
                        error: result.err().map(platform_error),
                    },
                ),
                (WriteType::WithoutResponse, Err(e)) => {
                    warn!(peripheral = %id, %characteristic, error = %e, "Unacknowledged write failed");
                }
                (WriteType::WithoutResponse, Ok(())) => {}
            }
        });
        Ok(())
    }

    async fn read_rssi(&self, id: &PeripheralId) -> Result<(), TransportError> {
        let peripheral = self.connected_peripheral(id)?;
        let shared = self.shared.clone();
        let id = id.clone();
        self.spawn_request(async move {
            let event = match peripheral.properties().await {
                Ok(Some(props)) => match props.rssi {
                    Some(rssi) => PeripheralEvent::RssiRead { rssi, error: None },
                    None => PeripheralEvent::RssiRead {
                        rssi: 0,
                        error: Some(TransportError::Platform("RSSI unavailable".to_string())),
                    },
                },
                Ok(None) => PeripheralEvent::RssiRead {
                    rssi: 0,
                    error: Some(TransportError::Unknown(id.to_string())),
                },
                Err(e) => PeripheralEvent::RssiRead {
                    rssi: 0,
                    error: Some(platform_error(e)),
                },
            };
            shared.emit_peripheral(&id, event);
        });
        Ok(())
    }
}
