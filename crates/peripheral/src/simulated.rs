//! In-memory peripheral used by tests and by hardware-free runs of the app.
//!
//! [`SimulatedCapability`] implements the capability traits; the paired
//! [`SimulatedDevice`] plays the remote side: it pushes notifications, drops
//! the link, and can hold discovery or subscription open so callers can
//! observe a session that is suspended mid-handshake.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use shared::{
    domain::PeripheralHandle,
    error::PeripheralError,
    protocol::{
        CharacteristicId, DiscoveryFilter, ServiceId, BATTERY_LEVEL, BATTERY_SERVICE,
        PRIMARY_CHARACTERISTIC, PRIMARY_SERVICE,
    },
};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use crate::{
    GattCharacteristic, GattService, LinkEvent, NotificationStream, PeripheralCapability,
    PeripheralLink,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailStage {
    DiscoveryCancelled,
    DiscoveryUnavailable,
    Link,
    Subscribe(CharacteristicId),
}

#[derive(Debug, Clone)]
pub struct SimulatedProfile {
    pub handle: PeripheralHandle,
    pub advertised_services: Vec<ServiceId>,
    pub services: HashMap<ServiceId, Vec<CharacteristicId>>,
    pub fail_at: Option<FailStage>,
}

impl Default for SimulatedProfile {
    fn default() -> Self {
        Self {
            handle: PeripheralHandle::new("sim-esp32-0001", Some("ESP32_Counter".to_string())),
            advertised_services: vec![PRIMARY_SERVICE],
            services: HashMap::from([
                (PRIMARY_SERVICE, vec![PRIMARY_CHARACTERISTIC]),
                (BATTERY_SERVICE, vec![BATTERY_LEVEL]),
            ]),
            fail_at: None,
        }
    }
}

impl SimulatedProfile {
    pub fn counter_only() -> Self {
        Self::default().without_service(BATTERY_SERVICE)
    }

    pub fn without_service(mut self, service: ServiceId) -> Self {
        self.services.remove(&service);
        self
    }

    pub fn without_characteristic(
        mut self,
        service: ServiceId,
        characteristic: CharacteristicId,
    ) -> Self {
        if let Some(list) = self.services.get_mut(&service) {
            list.retain(|c| *c != characteristic);
        }
        self
    }

    pub fn failing_at(mut self, stage: FailStage) -> Self {
        self.fail_at = Some(stage);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatedStats {
    pub discover_calls: usize,
    pub connect_calls: usize,
    pub subscribe_calls: usize,
    pub disconnect_calls: usize,
}

struct SimShared {
    profile: Mutex<SimulatedProfile>,
    current_link: Mutex<Option<Arc<LinkInner>>>,
    discovery_open: watch::Sender<bool>,
    subscribe_open: watch::Sender<bool>,
    stats: watch::Sender<SimulatedStats>,
}

impl SimShared {
    fn bump(&self, update: impl FnOnce(&mut SimulatedStats)) {
        self.stats.send_modify(update);
    }

    async fn wait_open(gate: &watch::Sender<bool>) {
        let mut rx = gate.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

#[derive(Clone)]
pub struct SimulatedCapability {
    shared: Arc<SimShared>,
}

impl SimulatedCapability {
    pub fn new(profile: SimulatedProfile) -> Self {
        let (discovery_open, _) = watch::channel(true);
        let (subscribe_open, _) = watch::channel(true);
        let (stats, _) = watch::channel(SimulatedStats::default());
        Self {
            shared: Arc::new(SimShared {
                profile: Mutex::new(profile),
                current_link: Mutex::new(None),
                discovery_open,
                subscribe_open,
                stats,
            }),
        }
    }

    pub fn device(&self) -> SimulatedDevice {
        SimulatedDevice {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[async_trait]
impl PeripheralCapability for SimulatedCapability {
    async fn discover(&self, filter: DiscoveryFilter) -> Result<PeripheralHandle, PeripheralError> {
        self.shared.bump(|s| s.discover_calls += 1);
        SimShared::wait_open(&self.shared.discovery_open).await;

        let profile = self.shared.profile.lock().await.clone();
        match profile.fail_at {
            Some(FailStage::DiscoveryCancelled) => return Err(PeripheralError::DiscoveryCancelled),
            Some(FailStage::DiscoveryUnavailable) => {
                return Err(PeripheralError::Unavailable(
                    "simulated adapter is powered off".to_string(),
                ))
            }
            _ => {}
        }

        if !filter.matches(&profile.advertised_services, profile.handle.name.as_deref()) {
            return Err(PeripheralError::Discovery(
                "no simulated device matches the discovery filter".to_string(),
            ));
        }

        debug!(peripheral = %profile.handle.id, "simulated device selected");
        Ok(profile.handle)
    }

    async fn connect(
        &self,
        peripheral: &PeripheralHandle,
    ) -> Result<Arc<dyn PeripheralLink>, PeripheralError> {
        self.shared.bump(|s| s.connect_calls += 1);

        let profile = self.shared.profile.lock().await.clone();
        if profile.fail_at == Some(FailStage::Link) {
            return Err(PeripheralError::Link(
                "simulated GATT connect failure".to_string(),
            ));
        }
        if profile.handle.id != peripheral.id {
            return Err(PeripheralError::Link(format!(
                "unknown peripheral {}",
                peripheral.id
            )));
        }

        let (events, _) = broadcast::channel(8);
        let link = Arc::new(LinkInner {
            shared: Arc::clone(&self.shared),
            peripheral: peripheral.clone(),
            services: profile.services,
            fail_at: profile.fail_at,
            connected: AtomicBool::new(true),
            events,
            subscribers: Mutex::new(HashMap::new()),
        });

        let previous = self
            .shared
            .current_link
            .lock()
            .await
            .replace(Arc::clone(&link));
        if let Some(previous) = previous {
            previous.close().await;
        }

        info!(peripheral = %peripheral.id, "simulated link established");
        Ok(Arc::new(SimulatedLink(link)))
    }
}

struct LinkInner {
    shared: Arc<SimShared>,
    peripheral: PeripheralHandle,
    services: HashMap<ServiceId, Vec<CharacteristicId>>,
    fail_at: Option<FailStage>,
    connected: AtomicBool,
    events: broadcast::Sender<LinkEvent>,
    subscribers: Mutex<HashMap<CharacteristicId, Vec<mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl LinkInner {
    /// Returns false if the link was already closed.
    async fn close(&self) -> bool {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.subscribers.lock().await.clear();
        let _ = self.events.send(LinkEvent::Disconnected);
        true
    }

    async fn push(&self, characteristic: CharacteristicId, payload: &[u8]) -> usize {
        if !self.connected.load(Ordering::SeqCst) {
            return 0;
        }
        let mut subscribers = self.subscribers.lock().await;
        let Some(list) = subscribers.get_mut(&characteristic) else {
            return 0;
        };
        list.retain(|tx| tx.send(payload.to_vec()).is_ok());
        list.len()
    }
}

pub struct SimulatedLink(Arc<LinkInner>);

#[async_trait]
impl PeripheralLink for SimulatedLink {
    fn peripheral(&self) -> &PeripheralHandle {
        &self.0.peripheral
    }

    async fn service(&self, service: ServiceId) -> Result<Arc<dyn GattService>, PeripheralError> {
        if !self.is_connected() {
            return Err(PeripheralError::Link("GATT server is disconnected".to_string()));
        }
        if !self.0.services.contains_key(&service) {
            return Err(PeripheralError::service_not_found(service));
        }
        Ok(Arc::new(SimulatedService {
            link: Arc::clone(&self.0),
            id: service,
        }))
    }

    fn subscribe_link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.0.events.subscribe()
    }

    async fn disconnect(&self) -> Result<(), PeripheralError> {
        self.0.shared.bump(|s| s.disconnect_calls += 1);
        self.0.close().await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.0.connected.load(Ordering::SeqCst)
    }
}

struct SimulatedService {
    link: Arc<LinkInner>,
    id: ServiceId,
}

#[async_trait]
impl GattService for SimulatedService {
    fn id(&self) -> ServiceId {
        self.id
    }

    async fn characteristic(
        &self,
        characteristic: CharacteristicId,
    ) -> Result<Arc<dyn GattCharacteristic>, PeripheralError> {
        let present = self
            .link
            .services
            .get(&self.id)
            .is_some_and(|list| list.contains(&characteristic));
        if !present {
            return Err(PeripheralError::characteristic_not_found(characteristic));
        }
        Ok(Arc::new(SimulatedCharacteristic {
            link: Arc::clone(&self.link),
            id: characteristic,
        }))
    }
}

struct SimulatedCharacteristic {
    link: Arc<LinkInner>,
    id: CharacteristicId,
}

#[async_trait]
impl GattCharacteristic for SimulatedCharacteristic {
    fn id(&self) -> CharacteristicId {
        self.id
    }

    async fn subscribe(&self) -> Result<NotificationStream, PeripheralError> {
        self.link.shared.bump(|s| s.subscribe_calls += 1);
        SimShared::wait_open(&self.link.shared.subscribe_open).await;

        if self.link.fail_at == Some(FailStage::Subscribe(self.id)) {
            return Err(PeripheralError::subscribe(
                self.id,
                "simulated notification failure",
            ));
        }
        if !self.link.connected.load(Ordering::SeqCst) {
            return Err(PeripheralError::subscribe(
                self.id,
                "GATT server is disconnected",
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.link
            .subscribers
            .lock()
            .await
            .entry(self.id)
            .or_default()
            .push(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

/// Remote side of a [`SimulatedCapability`].
#[derive(Clone)]
pub struct SimulatedDevice {
    shared: Arc<SimShared>,
}

impl SimulatedDevice {
    /// Returns how many live subscriptions received the payload.
    pub async fn notify(&self, characteristic: CharacteristicId, payload: impl AsRef<[u8]>) -> usize {
        let link = self.shared.current_link.lock().await.clone();
        match link {
            Some(link) => link.push(characteristic, payload.as_ref()).await,
            None => 0,
        }
    }

    pub async fn notify_primary(&self, payload: impl AsRef<[u8]>) -> usize {
        self.notify(PRIMARY_CHARACTERISTIC, payload).await
    }

    pub async fn notify_battery(&self, payload: impl AsRef<[u8]>) -> usize {
        self.notify(BATTERY_LEVEL, payload).await
    }

    /// Simulates the remote device going away. Returns false if no link was up.
    pub async fn drop_link(&self) -> bool {
        let link = self.shared.current_link.lock().await.clone();
        match link {
            Some(link) => {
                let closed = link.close().await;
                if closed {
                    info!(peripheral = %link.peripheral.id, "simulated link lost");
                }
                closed
            }
            None => false,
        }
    }

    pub async fn is_linked(&self) -> bool {
        let link = self.shared.current_link.lock().await;
        link.as_ref()
            .is_some_and(|link| link.connected.load(Ordering::SeqCst))
    }

    pub fn hold_discovery(&self) {
        self.shared.discovery_open.send_replace(false);
    }

    pub fn release_discovery(&self) {
        self.shared.discovery_open.send_replace(true);
    }

    pub fn hold_subscribe(&self) {
        self.shared.subscribe_open.send_replace(false);
    }

    pub fn release_subscribe(&self) {
        self.shared.subscribe_open.send_replace(true);
    }

    pub async fn set_profile(&self, profile: SimulatedProfile) {
        *self.shared.profile.lock().await = profile;
    }

    pub fn stats(&self) -> SimulatedStats {
        *self.shared.stats.borrow()
    }

    pub async fn wait_for_stats(&self, predicate: impl Fn(&SimulatedStats) -> bool) {
        let mut rx = self.shared.stats.subscribe();
        let _ = rx.wait_for(|stats| predicate(stats)).await;
    }
}

#[cfg(test)]
#[path = "tests/simulated_tests.rs"]
mod tests;
