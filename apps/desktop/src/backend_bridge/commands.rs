//! Backend commands queued from UI to backend worker.

pub enum BackendCommand {
    Connect,
    Disconnect,
    ManualIncrement,
    Snapshot,
    Simulate(SimulateCommand),
    Shutdown,
}

/// Remote-side actions, honoured only by the simulated backend.
pub enum SimulateCommand {
    Press(String),
    Battery(String),
    DropLink,
}

impl BackendCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::ManualIncrement => "manual_increment",
            Self::Snapshot => "snapshot",
            Self::Simulate(SimulateCommand::Press(_)) => "simulate_press",
            Self::Simulate(SimulateCommand::Battery(_)) => "simulate_battery",
            Self::Simulate(SimulateCommand::DropLink) => "simulate_drop",
            Self::Shutdown => "shutdown",
        }
    }
}
