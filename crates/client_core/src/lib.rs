use std::{
    future::Future,
    sync::{Arc, Weak},
};

use futures::StreamExt;
use peripheral::{LinkEvent, NotificationStream, PeripheralCapability, PeripheralLink};
use shared::{
    domain::{
        ConnectionState, CounterState, NotificationEvent, NotificationSource, PeripheralHandle,
        SessionSnapshot, SessionToken,
    },
    error::{ErrorKind, PeripheralError},
    protocol::{
        DiscoveryFilter, BATTERY_LEVEL, BATTERY_SERVICE, PRIMARY_CHARACTERISTIC, PRIMARY_SERVICE,
    },
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod decoder;

pub use decoder::{decode, Mutation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ConnectionStateChanged(SessionSnapshot),
    CounterChanged(i64),
    BatteryChanged(String),
    Error { kind: ErrorKind, message: String },
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("a device is already connected")]
    AlreadyConnected,
    #[error("a connection attempt is already in progress")]
    InProgress,
    #[error("connection attempt was superseded by a disconnect")]
    Superseded,
    #[error(transparent)]
    Peripheral(#[from] PeripheralError),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Subscribe to the standard battery service when the device offers it.
    pub track_battery: bool,
    pub name_prefix: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            track_battery: true,
            name_prefix: None,
        }
    }
}

/// Link resources owned by one connect attempt, live until disconnect or link loss.
struct LinkSlot {
    token: SessionToken,
    cancel: CancellationToken,
    link: Option<Arc<dyn PeripheralLink>>,
    tasks: Vec<JoinHandle<()>>,
}

impl LinkSlot {
    fn teardown(self) -> Option<Arc<dyn PeripheralLink>> {
        self.cancel.cancel();
        for task in self.tasks {
            task.abort();
        }
        self.link
    }
}

struct SessionState {
    connection: ConnectionState,
    peripheral: Option<PeripheralHandle>,
    next_token: SessionToken,
    slot: Option<LinkSlot>,
    counter: CounterState,
    battery_available: bool,
}

impl SessionState {
    fn is_current(&self, token: SessionToken) -> bool {
        self.slot.as_ref().is_some_and(|slot| slot.token == token)
    }

    fn reset(&mut self) -> Option<LinkSlot> {
        self.connection = ConnectionState::Disconnected;
        self.peripheral = None;
        self.battery_available = false;
        self.slot.take()
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection: self.connection,
            peripheral: self.peripheral.clone(),
            counter: self.counter.counter,
            battery_level: self.counter.battery_level.clone(),
            battery_available: self.battery_available,
        }
    }
}

/// Owns the device session: connection lifecycle, subscriptions, and the
/// counter state fed by notifications.
///
/// Every attempt gets a fresh [`SessionToken`]. Work belonging to a token
/// that is no longer current (a connect that finishes after a disconnect, a
/// notification from a torn-down link) is discarded.
pub struct SessionController {
    capability: Arc<dyn PeripheralCapability>,
    options: SessionOptions,
    inner: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionController {
    pub fn new(capability: Arc<dyn PeripheralCapability>) -> Arc<Self> {
        Self::with_options(capability, SessionOptions::default())
    }

    pub fn with_options(
        capability: Arc<dyn PeripheralCapability>,
        options: SessionOptions,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            capability,
            options,
            inner: Mutex::new(SessionState {
                connection: ConnectionState::Disconnected,
                peripheral: None,
                next_token: SessionToken(1),
                slot: None,
                counter: CounterState::default(),
                battery_available: false,
            }),
            events,
        })
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.inner.lock().await.snapshot()
    }

    pub async fn counter_state(&self) -> CounterState {
        self.inner.lock().await.counter.clone()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Available in every connection state.
    pub async fn manual_increment(&self) -> i64 {
        let mut state = self.inner.lock().await;
        let value = state.counter.adjust(1);
        self.emit(SessionEvent::CounterChanged(value));
        value
    }

    pub async fn connect(self: &Arc<Self>) -> Result<PeripheralHandle, ConnectError> {
        let (token, cancel) = {
            let mut state = self.inner.lock().await;
            match state.connection {
                ConnectionState::Connected => return Err(ConnectError::AlreadyConnected),
                ConnectionState::Scanning => return Err(ConnectError::InProgress),
                ConnectionState::Disconnected => {}
            }

            let token = state.next_token;
            state.next_token = token.next();
            let cancel = CancellationToken::new();
            state.slot = Some(LinkSlot {
                token,
                cancel: cancel.clone(),
                link: None,
                tasks: Vec::new(),
            });
            state.connection = ConnectionState::Scanning;
            state.battery_available = false;
            self.emit(SessionEvent::ConnectionStateChanged(state.snapshot()));
            (token, cancel)
        };
        info!(token = token.0, "session: scanning for device");

        match self.run_connect(token, &cancel).await {
            Ok(handle) => {
                info!(
                    token = token.0,
                    peripheral = %handle.id,
                    name = handle.display_name(),
                    "session: connected"
                );
                Ok(handle)
            }
            Err(ConnectError::Peripheral(err)) => {
                if self.abort_attempt(token, &err).await {
                    Err(ConnectError::Peripheral(err))
                } else {
                    debug!(token = token.0, %err, "session: stale attempt failed");
                    Err(ConnectError::Superseded)
                }
            }
            Err(err) => {
                debug!(token = token.0, %err, "session: attempt discarded");
                Err(err)
            }
        }
    }

    async fn run_connect(
        self: &Arc<Self>,
        token: SessionToken,
        cancel: &CancellationToken,
    ) -> Result<PeripheralHandle, ConnectError> {
        let filter = DiscoveryFilter::counter_device(self.options.track_battery)
            .with_name_prefix(self.options.name_prefix.clone());
        let handle = guarded(cancel, self.capability.discover(filter)).await?;
        debug!(token = token.0, peripheral = %handle.id, "session: device selected");

        let link = guarded(cancel, self.capability.connect(&handle)).await?;
        if !self.attach_link(token, Arc::clone(&link)).await {
            if let Err(err) = link.disconnect().await {
                warn!(token = token.0, %err, "session: failed to close stale link");
            }
            return Err(ConnectError::Superseded);
        }

        let watcher = self.spawn_link_watcher(token, link.subscribe_link_events());
        self.track_task(token, watcher).await?;
        // A link that closed before the watcher subscribed sent its only event to nobody.
        if !link.is_connected() {
            self.handle_link_lost(token).await;
            return Err(ConnectError::Superseded);
        }

        let service = guarded(cancel, link.service(PRIMARY_SERVICE)).await?;
        let characteristic = guarded(cancel, service.characteristic(PRIMARY_CHARACTERISTIC)).await?;
        let stream = guarded(cancel, characteristic.subscribe()).await?;
        let forwarder = self.spawn_forwarder(token, NotificationSource::Primary, stream);
        self.track_task(token, forwarder).await?;
        debug!(token = token.0, "session: primary notifications subscribed");

        let mut battery_available = false;
        if self.options.track_battery {
            match subscribe_battery(link.as_ref(), cancel).await {
                Ok(stream) => {
                    let forwarder = self.spawn_forwarder(token, NotificationSource::Battery, stream);
                    self.track_task(token, forwarder).await?;
                    battery_available = true;
                }
                Err(ConnectError::Superseded) => return Err(ConnectError::Superseded),
                Err(err) => {
                    info!(token = token.0, %err, "session: battery service not found, using default");
                }
            }
        }

        self.promote(token, handle.clone(), battery_available).await?;
        Ok(handle)
    }

    async fn attach_link(&self, token: SessionToken, link: Arc<dyn PeripheralLink>) -> bool {
        let mut state = self.inner.lock().await;
        match state.slot.as_mut() {
            Some(slot) if slot.token == token => {
                slot.link = Some(link);
                true
            }
            _ => false,
        }
    }

    async fn track_task(&self, token: SessionToken, task: JoinHandle<()>) -> Result<(), ConnectError> {
        let mut state = self.inner.lock().await;
        match state.slot.as_mut() {
            Some(slot) if slot.token == token => {
                slot.tasks.push(task);
                Ok(())
            }
            _ => {
                task.abort();
                Err(ConnectError::Superseded)
            }
        }
    }

    async fn promote(
        &self,
        token: SessionToken,
        handle: PeripheralHandle,
        battery_available: bool,
    ) -> Result<(), ConnectError> {
        let mut state = self.inner.lock().await;
        if !state.is_current(token) {
            return Err(ConnectError::Superseded);
        }
        state.connection = ConnectionState::Connected;
        state.peripheral = Some(handle);
        state.battery_available = battery_available;
        self.emit(SessionEvent::ConnectionStateChanged(state.snapshot()));
        Ok(())
    }

    /// Returns false when `token` was already superseded.
    async fn abort_attempt(&self, token: SessionToken, err: &PeripheralError) -> bool {
        let slot = {
            let mut state = self.inner.lock().await;
            if !state.is_current(token) {
                return false;
            }
            let slot = state.reset();
            self.emit(SessionEvent::ConnectionStateChanged(state.snapshot()));
            self.emit(SessionEvent::Error {
                kind: err.kind(),
                message: err.to_string(),
            });
            slot
        };
        warn!(token = token.0, kind = ?err.kind(), %err, "session: connect failed");

        if let Some(link) = slot.and_then(LinkSlot::teardown) {
            close_link(token, link.as_ref()).await;
        }
        true
    }

    /// Idempotent. Cancels an in-flight connect and closes any link it holds.
    pub async fn disconnect(&self) -> bool {
        let (slot, token) = {
            let mut state = self.inner.lock().await;
            if state.connection == ConnectionState::Disconnected && state.slot.is_none() {
                return false;
            }
            let token = state.slot.as_ref().map(|slot| slot.token);
            let slot = state.reset();
            self.emit(SessionEvent::ConnectionStateChanged(state.snapshot()));
            (slot, token)
        };

        if let (Some(link), Some(token)) = (slot.and_then(LinkSlot::teardown), token) {
            close_link(token, link.as_ref()).await;
        }
        info!(token = token.map(|t| t.0), "session: disconnected");
        true
    }

    async fn handle_link_lost(&self, token: SessionToken) {
        let slot = {
            let mut state = self.inner.lock().await;
            if !state.is_current(token) {
                return;
            }
            let slot = state.reset();
            self.emit(SessionEvent::ConnectionStateChanged(state.snapshot()));
            slot
        };
        warn!(token = token.0, "session: device disconnected");
        // The calling watcher is among these tasks; it stops at its next await.
        drop(slot.and_then(LinkSlot::teardown));
    }

    async fn apply_notification(&self, token: SessionToken, event: NotificationEvent) {
        let Some(mutation) = decoder::decode(&event) else {
            debug!(
                token = token.0,
                payload = %String::from_utf8_lossy(&event.payload),
                "session: ignoring unrecognized notification"
            );
            return;
        };

        let mut state = self.inner.lock().await;
        if !state.is_current(token) {
            return;
        }
        let change = decoder::apply(&mut state.counter, mutation);
        self.emit(change);
    }

    fn spawn_link_watcher(
        self: &Arc<Self>,
        token: SessionToken,
        mut events: broadcast::Receiver<LinkEvent>,
    ) -> JoinHandle<()> {
        let controller = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(LinkEvent::Disconnected) | Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(_)) => continue,
                }
            }
            if let Some(controller) = controller.upgrade() {
                controller.handle_link_lost(token).await;
            }
        })
    }

    fn spawn_forwarder(
        self: &Arc<Self>,
        token: SessionToken,
        source: NotificationSource,
        mut stream: NotificationStream,
    ) -> JoinHandle<()> {
        let controller: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(payload) = stream.next().await {
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                controller
                    .apply_notification(token, NotificationEvent::new(source, payload))
                    .await;
            }
            debug!(token = token.0, ?source, "session: notification stream ended");
        })
    }
}

async fn guarded<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = Result<T, PeripheralError>>,
) -> Result<T, ConnectError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ConnectError::Superseded),
        result = operation => result.map_err(ConnectError::from),
    }
}

async fn subscribe_battery(
    link: &dyn PeripheralLink,
    cancel: &CancellationToken,
) -> Result<NotificationStream, ConnectError> {
    let service = guarded(cancel, link.service(BATTERY_SERVICE)).await?;
    let characteristic = guarded(cancel, service.characteristic(BATTERY_LEVEL)).await?;
    guarded(cancel, characteristic.subscribe()).await
}

async fn close_link(token: SessionToken, link: &dyn PeripheralLink) {
    if !link.is_connected() {
        return;
    }
    if let Err(err) = link.disconnect().await {
        warn!(token = token.0, %err, "session: failed to close link");
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
