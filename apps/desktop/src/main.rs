mod backend_bridge;
mod config;
mod controller;
mod ui;

use std::{
    io::{self, BufRead},
    thread,
};

use anyhow::{Context, Result};
use backend_bridge::commands::BackendCommand;
use clap::Parser;
use controller::events::UiEvent;
use crossbeam_channel::{bounded, select, Receiver};
use tracing_subscriber::EnvFilter;
use ui::{Flow, TerminalApp};

fn spawn_stdin_reader() -> Receiver<String> {
    let (line_tx, line_rx) = bounded::<String>(64);
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });
    line_rx
}

fn main() -> Result<()> {
    let args = config::Args::parse();
    let settings = config::load_settings(&args)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_filter))
        .with_context(|| format!("invalid log filter '{}'", settings.log_filter))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
    tracing::info!(
        backend = settings.backend.as_str(),
        adapter = settings.adapter_index,
        track_battery = settings.track_battery,
        "starting keychain"
    );

    let (cmd_tx, cmd_rx) = bounded::<BackendCommand>(256);
    let (ui_tx, ui_rx) = bounded::<UiEvent>(2048);
    let backend = backend_bridge::runtime::launch(settings.clone(), cmd_rx, ui_tx);
    let input = spawn_stdin_reader();

    let mut app = TerminalApp::new(
        cmd_tx.clone(),
        io::stdout(),
        settings.track_battery,
        settings.json_events,
    );

    loop {
        select! {
            recv(input) -> line => {
                let flow = match line {
                    Ok(line) => app.handle_input(&line)?,
                    Err(_) => {
                        let _ = cmd_tx.try_send(BackendCommand::Shutdown);
                        Flow::Quit
                    }
                };
                if flow == Flow::Quit {
                    break;
                }
            }
            recv(ui_rx) -> event => match event {
                Ok(event) => app.handle_event(event)?,
                Err(_) => break,
            },
        }
    }

    drop(cmd_tx);
    drop(app);
    if backend.join().is_err() {
        tracing::error!("backend worker panicked");
    }
    for event in ui_rx.try_iter() {
        tracing::debug!(
            event = %ui::render::json_event(&event),
            "dropped ui event after shutdown"
        );
    }
    Ok(())
}
