//! Command orchestration from typed input to the backend command queue.

use crossbeam_channel::{Sender, TrySendError};
use shared::domain::ConnectionState;

use crate::backend_bridge::commands::{BackendCommand, SimulateCommand};

pub const HELP_TEXT: &str = "\
commands:
  connect          scan for the keychain and subscribe to it
  disconnect       drop the current link
  inc              add one to the counter by hand
  status           show connection state and counter
  help             show this text
  quit             disconnect and exit
simulated backend only:
  press <token>    device sends a primary token (S, L, D, BUTTON_PRESSED)
  battery <text>   device reports a battery level
  drop             device goes out of range";

#[derive(Debug, PartialEq, Eq)]
pub enum InputCommand {
    Connect,
    Disconnect,
    Increment,
    Status,
    Help,
    Quit,
    Press(String),
    Battery(String),
    Drop,
}

pub fn parse_input(line: &str) -> Result<Option<InputCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "connect" | "c" => InputCommand::Connect,
        "disconnect" | "d" => InputCommand::Disconnect,
        "inc" | "+" => InputCommand::Increment,
        "status" | "s" => InputCommand::Status,
        "help" | "?" => InputCommand::Help,
        "quit" | "exit" | "q" => InputCommand::Quit,
        "press" if !rest.is_empty() => InputCommand::Press(rest.to_string()),
        "battery" if !rest.is_empty() => InputCommand::Battery(rest.to_string()),
        "press" | "battery" => return Err(format!("usage: {verb} <text>")),
        "drop" => InputCommand::Drop,
        other => return Err(format!("unknown command '{other}'; type `help`")),
    };
    Ok(Some(command))
}

pub fn backend_command_for(input: InputCommand) -> Option<BackendCommand> {
    match input {
        InputCommand::Connect => Some(BackendCommand::Connect),
        InputCommand::Disconnect => Some(BackendCommand::Disconnect),
        InputCommand::Increment => Some(BackendCommand::ManualIncrement),
        InputCommand::Status => Some(BackendCommand::Snapshot),
        InputCommand::Quit => Some(BackendCommand::Shutdown),
        InputCommand::Press(token) => Some(BackendCommand::Simulate(SimulateCommand::Press(token))),
        InputCommand::Battery(level) => {
            Some(BackendCommand::Simulate(SimulateCommand::Battery(level)))
        }
        InputCommand::Drop => Some(BackendCommand::Simulate(SimulateCommand::DropLink)),
        InputCommand::Help => None,
    }
}

/// Returns false when the command was not queued; `status` then says why.
pub fn dispatch_backend_command(
    cmd_tx: &Sender<BackendCommand>,
    cmd: BackendCommand,
    connection: ConnectionState,
    status: &mut String,
) -> bool {
    let cmd_name = cmd.name();
    if matches!(cmd, BackendCommand::Connect) && connection != ConnectionState::Disconnected {
        *status = match connection {
            ConnectionState::Connected => "Already connected; disconnect first".to_string(),
            _ => "A connection attempt is already in progress".to_string(),
        };
        tracing::debug!(command = cmd_name, ?connection, "refused ui->backend command");
        return false;
    }

    match cmd_tx.try_send(cmd) {
        Ok(()) => {
            tracing::debug!(command = cmd_name, "queued ui->backend command");
            true
        }
        Err(TrySendError::Full(_)) => {
            *status = "UI command queue is full; please retry".to_string();
            false
        }
        Err(TrySendError::Disconnected(_)) => {
            *status =
                "Backend command processor disconnected (possible startup/runtime failure)"
                    .to_string();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn parses_verbs_and_arguments() {
        assert_eq!(parse_input("  "), Ok(None));
        assert_eq!(parse_input("Connect"), Ok(Some(InputCommand::Connect)));
        assert_eq!(parse_input("inc"), Ok(Some(InputCommand::Increment)));
        assert_eq!(
            parse_input("press  BUTTON_PRESSED "),
            Ok(Some(InputCommand::Press("BUTTON_PRESSED".into())))
        );
        assert_eq!(
            parse_input("battery 87"),
            Ok(Some(InputCommand::Battery("87".into())))
        );
        assert!(parse_input("press").is_err());
        assert!(parse_input("reboot").is_err());
    }

    #[test]
    fn connect_is_refused_unless_disconnected() {
        let (tx, rx) = bounded(4);
        let mut status = String::new();

        assert!(!dispatch_backend_command(
            &tx,
            BackendCommand::Connect,
            ConnectionState::Scanning,
            &mut status
        ));
        assert!(status.contains("in progress"));
        assert!(!dispatch_backend_command(
            &tx,
            BackendCommand::Connect,
            ConnectionState::Connected,
            &mut status
        ));
        assert!(status.contains("Already connected"));
        assert!(rx.try_recv().is_err());

        assert!(dispatch_backend_command(
            &tx,
            BackendCommand::Connect,
            ConnectionState::Disconnected,
            &mut status
        ));
        assert!(dispatch_backend_command(
            &tx,
            BackendCommand::ManualIncrement,
            ConnectionState::Scanning,
            &mut status
        ));
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn reports_full_and_closed_queues() {
        let (tx, rx) = bounded(1);
        let mut status = String::new();
        assert!(dispatch_backend_command(
            &tx,
            BackendCommand::Snapshot,
            ConnectionState::Disconnected,
            &mut status
        ));
        assert!(!dispatch_backend_command(
            &tx,
            BackendCommand::Snapshot,
            ConnectionState::Disconnected,
            &mut status
        ));
        assert!(status.contains("queue is full"));

        drop(rx);
        assert!(!dispatch_backend_command(
            &tx,
            BackendCommand::Disconnect,
            ConnectionState::Connected,
            &mut status
        ));
        assert!(status.contains("disconnected"));
    }
}
