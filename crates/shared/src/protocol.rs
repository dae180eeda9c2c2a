use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceId(pub Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicId(pub Uuid);

pub const PRIMARY_SERVICE: ServiceId =
    ServiceId(Uuid::from_u128(0x12345678_1234_1234_1234_123456789abc));
pub const PRIMARY_CHARACTERISTIC: CharacteristicId =
    CharacteristicId(Uuid::from_u128(0x87654321_4321_4321_4321_cba987654321));
/// Bluetooth SIG `battery_service` (0x180F).
pub const BATTERY_SERVICE: ServiceId =
    ServiceId(Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb));
/// Bluetooth SIG `battery_level` (0x2A19).
pub const BATTERY_LEVEL: CharacteristicId =
    CharacteristicId(Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb));

impl ServiceId {
    pub fn alias(&self) -> Option<&'static str> {
        (*self == BATTERY_SERVICE).then_some("battery_service")
    }
}

impl CharacteristicId {
    pub fn alias(&self) -> Option<&'static str> {
        (*self == BATTERY_LEVEL).then_some("battery_level")
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.alias() {
            Some(alias) => f.write_str(alias),
            None => write!(f, "{}", self.0),
        }
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.alias() {
            Some(alias) => f.write_str(alias),
            None => write!(f, "{}", self.0),
        }
    }
}

/// Scope of a device discovery request.
///
/// A peripheral matches when it advertises every service in `services` and,
/// if set, its local name starts with `name_prefix`. `optional_services` are
/// the extra services the session may access after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiscoveryFilter {
    pub services: Vec<ServiceId>,
    pub optional_services: Vec<ServiceId>,
    pub name_prefix: Option<String>,
}

impl DiscoveryFilter {
    pub fn counter_device(track_battery: bool) -> Self {
        Self {
            services: vec![PRIMARY_SERVICE],
            optional_services: if track_battery {
                vec![BATTERY_SERVICE]
            } else {
                Vec::new()
            },
            name_prefix: None,
        }
    }

    pub fn with_name_prefix(mut self, prefix: Option<String>) -> Self {
        self.name_prefix = prefix.filter(|p| !p.is_empty());
        self
    }

    pub fn matches(&self, advertised: &[ServiceId], local_name: Option<&str>) -> bool {
        if let Some(prefix) = &self.name_prefix {
            if !local_name.is_some_and(|name| name.starts_with(prefix.as_str())) {
                return false;
            }
        }
        self.services.iter().all(|s| advertised.contains(s))
    }
}

/// Button gestures reported on the primary characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterToken {
    ButtonPressed,
    ShortPress,
    LongPress,
    DoublePress,
}

impl CounterToken {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "BUTTON_PRESSED" => Some(Self::ButtonPressed),
            "S" => Some(Self::ShortPress),
            "L" => Some(Self::LongPress),
            "D" => Some(Self::DoublePress),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ButtonPressed => "BUTTON_PRESSED",
            Self::ShortPress => "S",
            Self::LongPress => "L",
            Self::DoublePress => "D",
        }
    }

    pub fn delta(self) -> i64 {
        match self {
            Self::ButtonPressed | Self::ShortPress => 1,
            Self::LongPress => -1,
            Self::DoublePress => 2,
        }
    }
}
