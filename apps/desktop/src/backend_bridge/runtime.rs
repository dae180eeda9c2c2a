//! Backend worker: owns the tokio runtime and the session controller.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use client_core::{ConnectError, SessionController, SessionOptions};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use peripheral::{
    simulated::{SimulatedCapability, SimulatedDevice, SimulatedProfile},
    MissingPeripheralCapability, PeripheralCapability,
};
use shared::error::PeripheralError;
use tokio::sync::broadcast::error::RecvError;

use crate::backend_bridge::commands::{BackendCommand, SimulateCommand};
use crate::config::{BackendKind, Settings};
use crate::controller::events::{UiError, UiErrorContext, UiEvent};

pub fn launch(
    settings: Settings,
    cmd_rx: Receiver<BackendCommand>,
    ui_tx: Sender<UiEvent>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                let _ = ui_tx.try_send(UiEvent::Error(UiError::from_message(
                    UiErrorContext::BackendStartup,
                    format!("backend worker startup failure: failed to build runtime: {err}"),
                )));
                tracing::error!("failed to build backend runtime: {err}");
                return;
            }
        };

        runtime.block_on(run_backend(settings, cmd_rx, ui_tx));
    })
}

struct Backend {
    capability: Arc<dyn PeripheralCapability>,
    device: Option<SimulatedDevice>,
    label: String,
}

async fn build_backend(settings: &Settings) -> Result<Backend, (String, PeripheralError)> {
    match settings.backend {
        BackendKind::Simulated => {
            let capability = SimulatedCapability::new(SimulatedProfile::default());
            let device = capability.device();
            Ok(Backend {
                capability: Arc::new(capability),
                device: Some(device),
                label: BackendKind::Simulated.as_str().to_string(),
            })
        }
        BackendKind::Btleplug => bluetooth_backend(settings.adapter_index).await,
    }
}

#[cfg(feature = "bluetooth")]
async fn bluetooth_backend(adapter_index: usize) -> Result<Backend, (String, PeripheralError)> {
    let label = format!("{} (adapter {adapter_index})", BackendKind::Btleplug.as_str());
    match btle_backend::BtleplugCapability::new(adapter_index).await {
        Ok(capability) => Ok(Backend {
            label: format!("{label}: {}", capability.adapter_name()),
            capability: Arc::new(capability),
            device: None,
        }),
        Err(err) => Err((label, err)),
    }
}

#[cfg(not(feature = "bluetooth"))]
async fn bluetooth_backend(_adapter_index: usize) -> Result<Backend, (String, PeripheralError)> {
    Err((
        BackendKind::Btleplug.as_str().to_string(),
        PeripheralError::Unavailable("this build has no bluetooth support".to_string()),
    ))
}

async fn run_backend(settings: Settings, cmd_rx: Receiver<BackendCommand>, ui_tx: Sender<UiEvent>) {
    let backend = match build_backend(&settings).await {
        Ok(backend) => backend,
        Err((label, err)) => {
            tracing::warn!(backend = %label, %err, "bluetooth backend unavailable");
            let _ = ui_tx.try_send(UiEvent::Error(UiError::from_peripheral(
                UiErrorContext::BackendStartup,
                err.kind(),
                err.to_string(),
            )));
            Backend {
                capability: Arc::new(MissingPeripheralCapability::new(match err {
                    PeripheralError::Unavailable(reason) => reason,
                    other => other.to_string(),
                })),
                device: None,
                label,
            }
        }
    };

    let controller = SessionController::with_options(
        Arc::clone(&backend.capability),
        SessionOptions {
            track_battery: settings.track_battery,
            name_prefix: settings.name_prefix.clone(),
        },
    );
    let event_task = spawn_event_forwarder(&controller, ui_tx.clone());
    tracing::info!(
        backend = %backend.label,
        track_battery = settings.track_battery,
        "backend worker ready"
    );
    let _ = ui_tx.try_send(UiEvent::BackendReady {
        backend: backend.label.clone(),
        simulated: backend.device.is_some(),
    });

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            BackendCommand::Connect => {
                let controller = Arc::clone(&controller);
                let ui_tx = ui_tx.clone();
                tokio::spawn(async move {
                    match controller.connect().await {
                        Ok(handle) => tracing::debug!(peripheral = %handle.id, "connect finished"),
                        // Surfaced to the UI as SessionEvent::Error.
                        Err(ConnectError::Peripheral(_)) => {}
                        Err(ConnectError::Superseded) => {
                            tracing::debug!("connect attempt superseded")
                        }
                        Err(err) => {
                            let _ = ui_tx.try_send(UiEvent::Info(err.to_string()));
                        }
                    }
                });
            }
            BackendCommand::Disconnect => {
                let controller = Arc::clone(&controller);
                let ui_tx = ui_tx.clone();
                tokio::spawn(async move {
                    if !controller.disconnect().await {
                        let _ = ui_tx.try_send(UiEvent::Info("Not connected".to_string()));
                    }
                });
            }
            BackendCommand::ManualIncrement => {
                let controller = Arc::clone(&controller);
                tokio::spawn(async move {
                    controller.manual_increment().await;
                });
            }
            BackendCommand::Snapshot => {
                let controller = Arc::clone(&controller);
                let ui_tx = ui_tx.clone();
                tokio::spawn(async move {
                    let _ = ui_tx.try_send(UiEvent::Snapshot(controller.snapshot().await));
                });
            }
            BackendCommand::Simulate(action) => match backend.device.clone() {
                Some(device) => {
                    let ui_tx = ui_tx.clone();
                    tokio::spawn(simulate(device, action, ui_tx));
                }
                None => {
                    let _ = ui_tx.try_send(UiEvent::Error(UiError::from_message(
                        UiErrorContext::Simulate,
                        "device simulation needs `--backend simulated`",
                    )));
                }
            },
            BackendCommand::Shutdown => break,
        }
    }

    controller.disconnect().await;
    event_task.abort();
    tracing::info!("backend worker stopped");
}

async fn simulate(device: SimulatedDevice, action: SimulateCommand, ui_tx: Sender<UiEvent>) {
    let message = match action {
        SimulateCommand::Press(token) => {
            let delivered = device.notify_primary(token.as_bytes()).await;
            delivery_message("press", &token, delivered)
        }
        SimulateCommand::Battery(level) => {
            let delivered = device.notify_battery(level.as_bytes()).await;
            delivery_message("battery", &level, delivered)
        }
        SimulateCommand::DropLink => {
            if device.drop_link().await {
                "Simulated device went out of range".to_string()
            } else {
                "Simulated device has no link to drop".to_string()
            }
        }
    };
    let _ = ui_tx.try_send(UiEvent::Info(message));
}

fn delivery_message(kind: &str, payload: &str, delivered: usize) -> String {
    if delivered == 0 {
        format!("{kind} '{payload}' not delivered: no live subscription")
    } else {
        format!("{kind} '{payload}' sent")
    }
}

fn spawn_event_forwarder(
    controller: &Arc<SessionController>,
    ui_tx: Sender<UiEvent>,
) -> tokio::task::JoinHandle<()> {
    let mut events = controller.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match ui_tx.try_send(UiEvent::Session(event)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!("ui event queue full; dropping session event")
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "ui lagged behind session events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
