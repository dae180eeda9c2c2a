use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{CharacteristicId, ServiceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No usable Bluetooth stack or adapter on this host.
    Unavailable,
    Discovery,
    Link,
    NotFound,
    Subscribe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GattItem {
    Service,
    Characteristic,
}

impl fmt::Display for GattItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Service => f.write_str("service"),
            Self::Characteristic => f.write_str("characteristic"),
        }
    }
}

/// Failures reported by a wireless-peripheral backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeripheralError {
    #[error("device selection was cancelled")]
    DiscoveryCancelled,
    #[error("bluetooth is unavailable: {0}")]
    Unavailable(String),
    #[error("device discovery failed: {0}")]
    Discovery(String),
    #[error("failed to connect to GATT server: {0}")]
    Link(String),
    #[error("{item} {id} not found")]
    NotFound { item: GattItem, id: String },
    #[error("failed to subscribe to {characteristic}: {reason}")]
    Subscribe {
        characteristic: String,
        reason: String,
    },
}

impl PeripheralError {
    pub fn service_not_found(service: ServiceId) -> Self {
        Self::NotFound {
            item: GattItem::Service,
            id: service.to_string(),
        }
    }

    pub fn characteristic_not_found(characteristic: CharacteristicId) -> Self {
        Self::NotFound {
            item: GattItem::Characteristic,
            id: characteristic.to_string(),
        }
    }

    pub fn subscribe(characteristic: CharacteristicId, reason: impl Into<String>) -> Self {
        Self::Subscribe {
            characteristic: characteristic.to_string(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::DiscoveryCancelled | Self::Discovery(_) => ErrorKind::Discovery,
            Self::Link(_) => ErrorKind::Link,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Subscribe { .. } => ErrorKind::Subscribe,
        }
    }
}
