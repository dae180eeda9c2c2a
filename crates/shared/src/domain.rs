use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u64);
    };
}

id_newtype!(SessionToken);

impl SessionToken {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

pub const INITIAL_COUNTER: i64 = 1;
pub const DEFAULT_BATTERY_LEVEL: &str = "100";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Scanning,
    Connected,
}

impl ConnectionState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Scanning => "Connecting...",
            Self::Connected => "Connected",
        }
    }
}

/// Identity of a discovered remote device. Only a connected session holds one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeripheralHandle {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl PeripheralHandle {
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationSource {
    Primary,
    Battery,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub source: NotificationSource,
    pub payload: Vec<u8>,
}

impl NotificationEvent {
    pub fn new(source: NotificationSource, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            source,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterState {
    pub counter: i64,
    pub battery_level: String,
}

impl Default for CounterState {
    fn default() -> Self {
        Self {
            counter: INITIAL_COUNTER,
            battery_level: DEFAULT_BATTERY_LEVEL.to_string(),
        }
    }
}

impl CounterState {
    /// Saturates at the `i64` bounds.
    pub fn adjust(&mut self, delta: i64) -> i64 {
        self.counter = self.counter.saturating_add(delta);
        self.counter
    }

    pub fn set_battery_level(&mut self, level: impl Into<String>) {
        self.battery_level = level.into();
    }

    pub fn display_label(&self, with_battery: bool) -> String {
        if with_battery {
            format!("{}-0-{}", self.battery_level, self.counter)
        } else {
            self.counter.to_string()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub connection: ConnectionState,
    pub peripheral: Option<PeripheralHandle>,
    pub counter: i64,
    pub battery_level: String,
    pub battery_available: bool,
}
