//! Wireless-peripheral capability backed by `btleplug`.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, Service,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::{future, future::BoxFuture, FutureExt, Stream, StreamExt};
use peripheral::{
    GattCharacteristic, GattService, LinkEvent, NotificationStream, PeripheralCapability,
    PeripheralLink,
};
use shared::{
    domain::PeripheralHandle,
    error::PeripheralError,
    protocol::{CharacteristicId, DiscoveryFilter, ServiceId},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub struct BtleplugCapability {
    _manager: Manager,
    adapter: Adapter,
    adapter_name: String,
    discovered: Mutex<HashMap<String, Peripheral>>,
}

impl BtleplugCapability {
    pub async fn new(adapter_index: usize) -> Result<Self, PeripheralError> {
        let manager = Manager::new()
            .await
            .map_err(|err| PeripheralError::Unavailable(err.to_string()))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|err| PeripheralError::Unavailable(err.to_string()))?;
        let adapter_count = adapters.len();
        let adapter = adapters.into_iter().nth(adapter_index).ok_or_else(|| {
            PeripheralError::Unavailable(format!(
                "no bluetooth adapter at index {adapter_index} ({adapter_count} found)"
            ))
        })?;
        let adapter_name = adapter
            .adapter_info()
            .await
            .unwrap_or_else(|_| format!("adapter-{adapter_index}"));
        info!(adapter = %adapter_name, "bluetooth adapter ready");

        Ok(Self {
            _manager: manager,
            adapter,
            adapter_name,
            discovered: Mutex::new(HashMap::new()),
        })
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    async fn match_peripheral(
        &self,
        peripheral: &Peripheral,
        filter: &DiscoveryFilter,
    ) -> Option<PeripheralHandle> {
        let properties = peripheral.properties().await.ok().flatten()?;
        let advertised: Vec<ServiceId> = properties.services.iter().copied().map(ServiceId).collect();
        if !filter.matches(&advertised, properties.local_name.as_deref()) {
            return None;
        }
        Some(PeripheralHandle::new(
            peripheral.id().to_string(),
            properties.local_name,
        ))
    }

    async fn scan_known(&self, filter: &DiscoveryFilter) -> Option<(PeripheralHandle, Peripheral)> {
        let peripherals = self.adapter.peripherals().await.ok()?;
        for peripheral in peripherals {
            if let Some(handle) = self.match_peripheral(&peripheral, filter).await {
                return Some((handle, peripheral));
            }
        }
        None
    }

    async fn wait_for_match(
        &self,
        filter: &DiscoveryFilter,
    ) -> Result<(PeripheralHandle, Peripheral), PeripheralError> {
        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|err| PeripheralError::Discovery(err.to_string()))?;
        self.adapter
            .start_scan(ScanFilter {
                services: filter.services.iter().map(|s| s.0).collect(),
            })
            .await
            .map_err(|err| PeripheralError::Discovery(err.to_string()))?;

        if let Some(found) = self.scan_known(filter).await {
            return Ok(found);
        }

        while let Some(event) = events.next().await {
            let id = match event {
                CentralEvent::DeviceDiscovered(id)
                | CentralEvent::DeviceUpdated(id)
                | CentralEvent::ServicesAdvertisement { id, .. } => id,
                _ => continue,
            };
            let Ok(peripheral) = self.adapter.peripheral(&id).await else {
                continue;
            };
            if let Some(handle) = self.match_peripheral(&peripheral, filter).await {
                return Ok((handle, peripheral));
            }
        }

        Err(PeripheralError::Discovery(
            "adapter event stream closed during scan".to_string(),
        ))
    }

    async fn lookup(&self, handle: &PeripheralHandle) -> Result<Peripheral, PeripheralError> {
        if let Some(peripheral) = self.discovered.lock().await.get(&handle.id) {
            return Ok(peripheral.clone());
        }
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|err| PeripheralError::Link(err.to_string()))?;
        peripherals
            .into_iter()
            .find(|p| p.id().to_string() == handle.id)
            .ok_or_else(|| PeripheralError::Link(format!("unknown peripheral {}", handle.id)))
    }
}

#[async_trait]
impl PeripheralCapability for BtleplugCapability {
    async fn discover(&self, filter: DiscoveryFilter) -> Result<PeripheralHandle, PeripheralError> {
        info!(adapter = %self.adapter_name, services = ?filter.services, "scanning for peripheral");
        let adapter = self.adapter.clone();
        let scan = ScanGuard::new(move || {
            async move {
                if let Err(err) = adapter.stop_scan().await {
                    debug!(?err, "failed to stop scan cleanly");
                }
            }
            .boxed()
        });
        let result = self.wait_for_match(&filter).await;
        scan.finish().await;

        let (handle, peripheral) = result?;
        info!(peripheral = %handle.id, name = ?handle.name, "peripheral selected");
        self.discovered
            .lock()
            .await
            .insert(handle.id.clone(), peripheral);
        Ok(handle)
    }

    async fn connect(
        &self,
        handle: &PeripheralHandle,
    ) -> Result<Arc<dyn PeripheralLink>, PeripheralError> {
        let peripheral = self.lookup(handle).await?;
        let central_events = self
            .adapter
            .events()
            .await
            .map_err(|err| PeripheralError::Link(err.to_string()))?;

        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral
                .connect()
                .await
                .map_err(|err| PeripheralError::Link(err.to_string()))?;
        }
        if let Err(err) = peripheral.discover_services().await {
            let _ = peripheral.disconnect().await;
            return Err(PeripheralError::Link(err.to_string()));
        }
        info!(peripheral = %handle.id, "connected to GATT server");

        let connected = Arc::new(AtomicBool::new(true));
        let (events, _) = broadcast::channel(8);
        let watcher = spawn_disconnect_watcher(
            central_events,
            peripheral.id(),
            Arc::clone(&connected),
            events.clone(),
        );

        Ok(Arc::new(BtleplugLink {
            peripheral,
            handle: handle.clone(),
            connected,
            events,
            watcher,
        }))
    }
}

/// Stops the scan when discovery completes or its future is dropped mid-scan.
struct ScanGuard<F: FnOnce() -> BoxFuture<'static, ()>> {
    stop: Option<F>,
}

impl<F: FnOnce() -> BoxFuture<'static, ()>> ScanGuard<F> {
    fn new(stop: F) -> Self {
        Self { stop: Some(stop) }
    }

    async fn finish(mut self) {
        if let Some(stop) = self.stop.take() {
            stop().await;
        }
    }
}

impl<F: FnOnce() -> BoxFuture<'static, ()>> Drop for ScanGuard<F> {
    fn drop(&mut self) {
        let Some(stop) = self.stop.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        debug!("discovery dropped mid-scan; stopping scan");
        runtime.spawn(stop());
    }
}

/// Clears the link flag and announces the loss once, whatever `disconnect` returns.
async fn close_link(
    connected: &AtomicBool,
    events: &broadcast::Sender<LinkEvent>,
    disconnect: impl Future<Output = Result<(), PeripheralError>>,
) -> Result<(), PeripheralError> {
    let result = disconnect.await;
    mark_closed(connected, events);
    result
}

fn mark_closed(connected: &AtomicBool, events: &broadcast::Sender<LinkEvent>) -> bool {
    if !connected.swap(false, Ordering::SeqCst) {
        return false;
    }
    let _ = events.send(LinkEvent::Disconnected);
    true
}

fn spawn_disconnect_watcher(
    mut central_events: Pin<Box<dyn Stream<Item = CentralEvent> + Send>>,
    peripheral_id: PeripheralId,
    connected: Arc<AtomicBool>,
    events: broadcast::Sender<LinkEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = central_events.next().await {
            if let CentralEvent::DeviceDisconnected(id) = event {
                if id == peripheral_id {
                    if mark_closed(&connected, &events) {
                        info!(peripheral = %id, "peripheral link lost");
                    }
                    break;
                }
            }
        }
    })
}

pub struct BtleplugLink {
    peripheral: Peripheral,
    handle: PeripheralHandle,
    connected: Arc<AtomicBool>,
    events: broadcast::Sender<LinkEvent>,
    watcher: JoinHandle<()>,
}

impl Drop for BtleplugLink {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

#[async_trait]
impl PeripheralLink for BtleplugLink {
    fn peripheral(&self) -> &PeripheralHandle {
        &self.handle
    }

    async fn service(&self, service: ServiceId) -> Result<Arc<dyn GattService>, PeripheralError> {
        let found = self
            .peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service.0)
            .ok_or_else(|| PeripheralError::service_not_found(service))?;
        Ok(Arc::new(BtleplugService {
            peripheral: self.peripheral.clone(),
            id: service,
            service: found,
        }))
    }

    fn subscribe_link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    async fn disconnect(&self) -> Result<(), PeripheralError> {
        close_link(&self.connected, &self.events, async {
            if self.peripheral.is_connected().await.unwrap_or(false) {
                self.peripheral
                    .disconnect()
                    .await
                    .map_err(|err| PeripheralError::Link(err.to_string()))?;
            }
            Ok::<(), PeripheralError>(())
        })
        .await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct BtleplugService {
    peripheral: Peripheral,
    id: ServiceId,
    service: Service,
}

#[async_trait]
impl GattService for BtleplugService {
    fn id(&self) -> ServiceId {
        self.id
    }

    async fn characteristic(
        &self,
        characteristic: CharacteristicId,
    ) -> Result<Arc<dyn GattCharacteristic>, PeripheralError> {
        let found = self
            .service
            .characteristics
            .iter()
            .find(|c| c.uuid == characteristic.0)
            .cloned()
            .ok_or_else(|| PeripheralError::characteristic_not_found(characteristic))?;
        Ok(Arc::new(BtleplugCharacteristic {
            peripheral: self.peripheral.clone(),
            id: characteristic,
            characteristic: found,
        }))
    }
}

struct BtleplugCharacteristic {
    peripheral: Peripheral,
    id: CharacteristicId,
    characteristic: Characteristic,
}

#[async_trait]
impl GattCharacteristic for BtleplugCharacteristic {
    fn id(&self) -> CharacteristicId {
        self.id
    }

    async fn subscribe(&self) -> Result<NotificationStream, PeripheralError> {
        let notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(|err| PeripheralError::subscribe(self.id, err.to_string()))?;
        self.peripheral
            .subscribe(&self.characteristic)
            .await
            .map_err(|err| PeripheralError::subscribe(self.id, err.to_string()))?;
        debug!(characteristic = %self.id, "notifications enabled");

        let uuid = self.characteristic.uuid;
        let values = notifications
            .filter_map(move |n| future::ready((n.uuid == uuid).then_some(n.value)));
        Ok(Box::pin(Subscription {
            inner: Box::pin(values),
            peripheral: self.peripheral.clone(),
            characteristic: self.characteristic.clone(),
        }))
    }
}

/// Turns notifications off on the device when the stream is dropped.
struct Subscription {
    inner: NotificationStream,
    peripheral: Peripheral,
    characteristic: Characteristic,
}

impl Stream for Subscription {
    type Item = Vec<u8>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let peripheral = self.peripheral.clone();
        let characteristic = self.characteristic.clone();
        runtime.spawn(async move {
            if !peripheral.is_connected().await.unwrap_or(false) {
                return;
            }
            if let Err(err) = peripheral.unsubscribe(&characteristic).await {
                warn!(?err, characteristic = %characteristic.uuid, "failed to disable notifications");
            }
        });
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
