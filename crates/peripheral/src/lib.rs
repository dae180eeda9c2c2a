//! Contract for the wireless-peripheral capability the session controller drives.
//!
//! A backend discovers one remote device, opens a link to it, resolves GATT
//! services and characteristics, and hands out notification streams. Dropping
//! a [`NotificationStream`] unsubscribes it.

use std::{pin::Pin, sync::Arc};

use async_trait::async_trait;
use futures::Stream;
use shared::{
    domain::PeripheralHandle,
    error::PeripheralError,
    protocol::{CharacteristicId, DiscoveryFilter, ServiceId},
};
use tokio::sync::broadcast;

pub mod simulated;

pub type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Sent once when the link goes down, whoever closed it.
    Disconnected,
}

#[async_trait]
pub trait PeripheralCapability: Send + Sync {
    /// Waits until a device matching `filter` is selected. There is no timeout.
    async fn discover(&self, filter: DiscoveryFilter) -> Result<PeripheralHandle, PeripheralError>;
    async fn connect(
        &self,
        peripheral: &PeripheralHandle,
    ) -> Result<Arc<dyn PeripheralLink>, PeripheralError>;
}

#[async_trait]
pub trait PeripheralLink: Send + Sync {
    fn peripheral(&self) -> &PeripheralHandle;
    async fn service(&self, service: ServiceId) -> Result<Arc<dyn GattService>, PeripheralError>;
    fn subscribe_link_events(&self) -> broadcast::Receiver<LinkEvent>;
    /// Safe to call on a link that is already closed.
    async fn disconnect(&self) -> Result<(), PeripheralError>;
    fn is_connected(&self) -> bool;
}

#[async_trait]
pub trait GattService: Send + Sync {
    fn id(&self) -> ServiceId;
    async fn characteristic(
        &self,
        characteristic: CharacteristicId,
    ) -> Result<Arc<dyn GattCharacteristic>, PeripheralError>;
}

#[async_trait]
pub trait GattCharacteristic: Send + Sync {
    fn id(&self) -> CharacteristicId;
    async fn subscribe(&self) -> Result<NotificationStream, PeripheralError>;
}

/// Stand-in used when no wireless stack could be initialized.
pub struct MissingPeripheralCapability {
    reason: String,
}

impl MissingPeripheralCapability {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl PeripheralCapability for MissingPeripheralCapability {
    async fn discover(
        &self,
        _filter: DiscoveryFilter,
    ) -> Result<PeripheralHandle, PeripheralError> {
        Err(PeripheralError::Unavailable(self.reason.clone()))
    }

    async fn connect(
        &self,
        _peripheral: &PeripheralHandle,
    ) -> Result<Arc<dyn PeripheralLink>, PeripheralError> {
        Err(PeripheralError::Unavailable(self.reason.clone()))
    }
}
