//! Backend-to-UI events and error modeling for the terminal controller.

use client_core::SessionEvent;
use shared::{domain::SessionSnapshot, error::ErrorKind};

pub enum UiEvent {
    BackendReady { backend: String, simulated: bool },
    Info(String),
    Error(UiError),
    Session(SessionEvent),
    Snapshot(SessionSnapshot),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiErrorCategory {
    /// No usable Bluetooth stack or adapter on this host.
    Unavailable,
    Discovery,
    Link,
    Device,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiErrorContext {
    BackendStartup,
    Connect,
    Simulate,
    General,
}

#[derive(Debug, Clone)]
pub struct UiError {
    category: UiErrorCategory,
    context: UiErrorContext,
    message: String,
}

impl UiErrorCategory {
    pub fn from_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Unavailable => Self::Unavailable,
            ErrorKind::Discovery => Self::Discovery,
            ErrorKind::Link => Self::Link,
            ErrorKind::NotFound | ErrorKind::Subscribe => Self::Device,
        }
    }
}

impl UiError {
    /// Free-text errors raised by the front-end itself.
    pub fn from_message(context: UiErrorContext, message: impl Into<String>) -> Self {
        Self {
            category: UiErrorCategory::Unknown,
            context,
            message: message.into(),
        }
    }

    pub fn from_peripheral(
        context: UiErrorContext,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category: UiErrorCategory::from_kind(kind),
            context,
            message: message.into(),
        }
    }

    pub fn suggests_manual_increment(&self) -> bool {
        self.category == UiErrorCategory::Unavailable
    }

    pub fn category(&self) -> UiErrorCategory {
        self.category
    }

    pub fn context(&self) -> UiErrorContext {
        self.context
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Text shown to the user for this error.
    pub fn user_message(&self) -> String {
        let mut text = match self.context {
            UiErrorContext::Connect => format!("Connection Failed: {}", self.message),
            UiErrorContext::BackendStartup => format!("Bluetooth backend not ready: {}", self.message),
            UiErrorContext::Simulate | UiErrorContext::General => self.message.clone(),
        };
        if self.suggests_manual_increment() {
            text.push_str(". Bluetooth is not available here; use `inc` to count manually.");
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{error::PeripheralError, protocol::PRIMARY_SERVICE};

    fn connect_error(err: &PeripheralError) -> UiError {
        UiError::from_peripheral(UiErrorContext::Connect, err.kind(), err.to_string())
    }

    #[test]
    fn classifies_peripheral_errors_by_kind() {
        let cases = [
            (
                PeripheralError::Unavailable("no adapter".into()),
                UiErrorCategory::Unavailable,
            ),
            (PeripheralError::DiscoveryCancelled, UiErrorCategory::Discovery),
            (
                PeripheralError::Discovery("scan aborted".into()),
                UiErrorCategory::Discovery,
            ),
            (
                PeripheralError::Link("refused".into()),
                UiErrorCategory::Link,
            ),
            (
                PeripheralError::service_not_found(PRIMARY_SERVICE),
                UiErrorCategory::Device,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(connect_error(&err).category(), expected, "{err}");
        }
    }

    #[test]
    fn category_ignores_message_wording() {
        let err = UiError::from_peripheral(
            UiErrorContext::Connect,
            ErrorKind::Link,
            "adapter unavailable while scanning",
        );
        assert_eq!(err.category(), UiErrorCategory::Link);
        assert!(!err.suggests_manual_increment());

        let err = UiError::from_message(UiErrorContext::General, "bluetooth is unavailable");
        assert_eq!(err.category(), UiErrorCategory::Unknown);
    }

    #[test]
    fn connect_failures_are_prefixed_and_unavailable_suggests_manual_mode() {
        let err = connect_error(&PeripheralError::Unavailable(
            "this build has no bluetooth support".into(),
        ));
        assert!(err.suggests_manual_increment());
        let text = err.user_message();
        assert!(text.starts_with("Connection Failed: bluetooth is unavailable"));
        assert!(text.contains("use `inc`"));

        let err = connect_error(&PeripheralError::DiscoveryCancelled);
        assert_eq!(
            err.user_message(),
            "Connection Failed: device selection was cancelled"
        );
        assert_eq!(err.context(), UiErrorContext::Connect);
    }
}
