//! Text and JSON rendering of session state.

use client_core::SessionEvent;
use serde_json::{json, Value};
use shared::domain::{ConnectionState, CounterState, SessionSnapshot};

use crate::controller::events::{UiError, UiEvent};

pub fn counter_label(snapshot: &SessionSnapshot, track_battery: bool) -> String {
    CounterState {
        counter: snapshot.counter,
        battery_level: snapshot.battery_level.clone(),
    }
    .display_label(track_battery)
}

pub fn status_line(snapshot: &SessionSnapshot, track_battery: bool) -> String {
    let label = counter_label(snapshot, track_battery);
    match &snapshot.peripheral {
        Some(peripheral) => format!(
            "[{}] {}  {label}",
            snapshot.connection.label(),
            peripheral.display_name()
        ),
        None => format!("[{}]  {label}", snapshot.connection.label()),
    }
}

/// One-line notice for a connection transition, if it deserves one.
pub fn transition_notice(previous: ConnectionState, next: &SessionSnapshot) -> Option<String> {
    match (previous, next.connection) {
        (ConnectionState::Disconnected, ConnectionState::Scanning) => {
            Some(ConnectionState::Scanning.label().to_string())
        }
        (_, ConnectionState::Connected) => Some(match &next.peripheral {
            Some(peripheral) => format!("Connected to {}", peripheral.display_name()),
            None => ConnectionState::Connected.label().to_string(),
        }),
        (ConnectionState::Connected, ConnectionState::Disconnected) => {
            Some(ConnectionState::Disconnected.label().to_string())
        }
        _ => None,
    }
}

fn error_json(error: &UiError) -> Value {
    json!({
        "category": format!("{:?}", error.category()).to_ascii_lowercase(),
        "context": format!("{:?}", error.context()).to_ascii_lowercase(),
        "message": error.message(),
    })
}

pub fn json_event(event: &UiEvent) -> Value {
    match event {
        UiEvent::BackendReady { backend, simulated } => {
            json!({ "event": "backend_ready", "backend": backend, "simulated": simulated })
        }
        UiEvent::Info(message) => json!({ "event": "info", "message": message }),
        UiEvent::Error(error) => json!({ "event": "error", "error": error_json(error) }),
        UiEvent::Snapshot(snapshot) => json!({ "event": "snapshot", "session": snapshot }),
        UiEvent::Session(SessionEvent::ConnectionStateChanged(snapshot)) => {
            json!({ "event": "connection_state_changed", "session": snapshot })
        }
        UiEvent::Session(SessionEvent::CounterChanged(counter)) => {
            json!({ "event": "counter_changed", "counter": counter })
        }
        UiEvent::Session(SessionEvent::BatteryChanged(level)) => {
            json!({ "event": "battery_changed", "battery_level": level })
        }
        UiEvent::Session(SessionEvent::Error { kind, message }) => {
            json!({ "event": "session_error", "kind": kind, "message": message })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::domain::PeripheralHandle;

    fn snapshot(connection: ConnectionState, counter: i64) -> SessionSnapshot {
        SessionSnapshot {
            connection,
            peripheral: (connection == ConnectionState::Connected).then(|| {
                PeripheralHandle::new("sim-esp32-0001", Some("ESP32_Counter".to_string()))
            }),
            counter,
            battery_level: "87".to_string(),
            battery_available: true,
        }
    }

    #[test]
    fn status_line_shows_state_name_and_label() {
        assert_eq!(
            status_line(&snapshot(ConnectionState::Connected, 4), true),
            "[Connected] ESP32_Counter  87-0-4"
        );
        assert_eq!(
            status_line(&snapshot(ConnectionState::Scanning, 4), false),
            "[Connecting...]  4"
        );
    }

    #[test]
    fn notices_cover_connect_and_disconnect() {
        let connected = snapshot(ConnectionState::Connected, 1);
        assert_eq!(
            transition_notice(ConnectionState::Scanning, &connected).as_deref(),
            Some("Connected to ESP32_Counter")
        );
        let disconnected = snapshot(ConnectionState::Disconnected, 1);
        assert_eq!(
            transition_notice(ConnectionState::Connected, &disconnected).as_deref(),
            Some("Disconnected")
        );
        assert_eq!(transition_notice(ConnectionState::Scanning, &disconnected), None);
    }

    #[test]
    fn json_events_carry_snake_case_names() {
        let value = json_event(&UiEvent::Session(SessionEvent::CounterChanged(7)));
        assert_eq!(value, json!({ "event": "counter_changed", "counter": 7 }));

        let value = json_event(&UiEvent::Session(SessionEvent::ConnectionStateChanged(
            snapshot(ConnectionState::Connected, 2),
        )));
        assert_eq!(value["session"]["connection"], "connected");
        assert_eq!(value["session"]["peripheral"]["name"], "ESP32_Counter");
    }
}
