//! Maps raw notification payloads to counter and battery mutations.

use shared::{
    domain::{CounterState, NotificationEvent, NotificationSource},
    protocol::CounterToken,
};

use crate::SessionEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Counter(CounterToken),
    Battery(String),
}

/// Payloads are read as lossy UTF-8 and trimmed. Unknown primary tokens
/// decode to `None`; battery text is taken verbatim.
pub fn decode(event: &NotificationEvent) -> Option<Mutation> {
    let text = String::from_utf8_lossy(&event.payload);
    let token = text.trim();
    match event.source {
        NotificationSource::Primary => CounterToken::parse(token).map(Mutation::Counter),
        NotificationSource::Battery => Some(Mutation::Battery(token.to_string())),
    }
}

pub fn apply(state: &mut CounterState, mutation: Mutation) -> SessionEvent {
    match mutation {
        Mutation::Counter(token) => SessionEvent::CounterChanged(state.adjust(token.delta())),
        Mutation::Battery(level) => {
            state.set_battery_level(level.clone());
            SessionEvent::BatteryChanged(level)
        }
    }
}

pub fn decode_into(state: &mut CounterState, event: &NotificationEvent) -> Option<SessionEvent> {
    decode(event).map(|mutation| apply(state, mutation))
}
