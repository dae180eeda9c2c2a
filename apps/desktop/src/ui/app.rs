//! Terminal app shell: turns input lines into backend commands and backend
//! events into printed lines.

use std::io::{self, Write};

use client_core::SessionEvent;
use crossbeam_channel::Sender;
use shared::domain::{ConnectionState, SessionSnapshot, DEFAULT_BATTERY_LEVEL, INITIAL_COUNTER};

use crate::backend_bridge::commands::BackendCommand;
use crate::controller::{
    events::{UiError, UiErrorContext, UiEvent},
    orchestration::{backend_command_for, dispatch_backend_command, parse_input, InputCommand, HELP_TEXT},
};
use crate::ui::render;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct TerminalApp<W: Write> {
    cmd_tx: Sender<BackendCommand>,
    out: W,
    snapshot: SessionSnapshot,
    track_battery: bool,
    json: bool,
    status: String,
}

impl<W: Write> TerminalApp<W> {
    pub fn new(cmd_tx: Sender<BackendCommand>, out: W, track_battery: bool, json: bool) -> Self {
        Self {
            cmd_tx,
            out,
            snapshot: SessionSnapshot {
                connection: ConnectionState::Disconnected,
                peripheral: None,
                counter: INITIAL_COUNTER,
                battery_level: DEFAULT_BATTERY_LEVEL.to_string(),
                battery_available: false,
            },
            track_battery,
            json,
            status: String::new(),
        }
    }

    pub fn snapshot(&self) -> &SessionSnapshot {
        &self.snapshot
    }

    pub fn handle_input(&mut self, line: &str) -> io::Result<Flow> {
        let input = match parse_input(line) {
            Ok(Some(input)) => input,
            Ok(None) => return Ok(Flow::Continue),
            Err(message) => {
                self.print_error(&UiError::from_message(UiErrorContext::General, message))?;
                return Ok(Flow::Continue);
            }
        };

        let quit = input == InputCommand::Quit;
        let Some(cmd) = backend_command_for(input) else {
            writeln!(self.out, "{HELP_TEXT}")?;
            return Ok(Flow::Continue);
        };

        if !dispatch_backend_command(&self.cmd_tx, cmd, self.snapshot.connection, &mut self.status)
        {
            let status = std::mem::take(&mut self.status);
            self.print_info(&status)?;
        }
        Ok(if quit { Flow::Quit } else { Flow::Continue })
    }

    pub fn handle_event(&mut self, event: UiEvent) -> io::Result<()> {
        if self.json {
            self.track(&event);
            writeln!(self.out, "{}", render::json_event(&event))?;
            return self.out.flush();
        }

        match event {
            UiEvent::BackendReady { backend, simulated } => {
                writeln!(self.out, "Backend ready: {backend}")?;
                if simulated {
                    writeln!(self.out, "Simulated device available: try `press S` once connected")?;
                }
                writeln!(self.out, "{}", render::status_line(&self.snapshot, self.track_battery))?;
            }
            UiEvent::Info(message) => self.print_info(&message)?,
            UiEvent::Error(error) => self.print_error(&error)?,
            UiEvent::Snapshot(snapshot) => {
                self.snapshot = snapshot;
                writeln!(self.out, "{}", render::status_line(&self.snapshot, self.track_battery))?;
            }
            UiEvent::Session(SessionEvent::ConnectionStateChanged(next)) => {
                let previous = self.snapshot.connection;
                if let Some(notice) = render::transition_notice(previous, &next) {
                    writeln!(self.out, "{notice}")?;
                }
                self.snapshot = next;
                writeln!(self.out, "{}", render::status_line(&self.snapshot, self.track_battery))?;
            }
            UiEvent::Session(SessionEvent::CounterChanged(counter)) => {
                self.snapshot.counter = counter;
                writeln!(self.out, "{}", render::counter_label(&self.snapshot, self.track_battery))?;
            }
            UiEvent::Session(SessionEvent::BatteryChanged(level)) => {
                self.snapshot.battery_level = level;
                writeln!(self.out, "{}", render::counter_label(&self.snapshot, self.track_battery))?;
            }
            UiEvent::Session(SessionEvent::Error { kind, message }) => {
                self.print_error(&UiError::from_peripheral(UiErrorContext::Connect, kind, message))?;
            }
        }
        self.out.flush()
    }

    fn track(&mut self, event: &UiEvent) {
        match event {
            UiEvent::Snapshot(snapshot)
            | UiEvent::Session(SessionEvent::ConnectionStateChanged(snapshot)) => {
                self.snapshot = snapshot.clone();
            }
            UiEvent::Session(SessionEvent::CounterChanged(counter)) => {
                self.snapshot.counter = *counter;
            }
            UiEvent::Session(SessionEvent::BatteryChanged(level)) => {
                self.snapshot.battery_level = level.clone();
            }
            _ => {}
        }
    }

    fn print_info(&mut self, message: &str) -> io::Result<()> {
        if self.json {
            writeln!(self.out, "{}", render::json_event(&UiEvent::Info(message.to_string())))
        } else {
            writeln!(self.out, "{message}")
        }
    }

    fn print_error(&mut self, error: &UiError) -> io::Result<()> {
        tracing::debug!(category = ?error.category(), "ui error: {}", error.message());
        if self.json {
            writeln!(self.out, "{}", render::json_event(&UiEvent::Error(error.clone())))
        } else {
            writeln!(self.out, "{}", error.user_message())
        }
    }
}
