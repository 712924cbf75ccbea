use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;

pub const SOFTWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Disconnect,
    SetFans(bool),
    Stop,
    ResetHome,
    SetPosition(i32),
    OffsetPosition(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Succeeded,
    Failed,
    Blocked,
    NotConnected,
    NotDisconnected,
    InvalidControlIp,
}

/// A command paired with the channel its result travels back on.
#[derive(Debug)]
pub struct CommandEnvelope {
    pub command: Command,
    pub reply: oneshot::Sender<CommandStatus>,
}

/// Snapshot of the focuser as of the worker's last hardware exchange.
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub as_of: DateTime<Utc>,
    pub connected: bool,
    pub moving: bool,
    pub current_steps: i32,
    pub target_steps: i32,
    pub primary_temperature: Option<f64>,
    pub ambient_temperature: Option<f64>,
    pub fans_enabled: bool,
}

impl DeviceState {
    pub fn disconnected() -> Self {
        Self {
            as_of: Utc::now(),
            connected: false,
            moving: false,
            current_steps: 0,
            target_steps: 0,
            primary_temperature: None,
            ambient_temperature: None,
            fans_enabled: false,
        }
    }

    pub fn report(&self) -> StatusReport {
        let status = if !self.connected {
            FocuserState::Disabled
        } else if self.moving {
            FocuserState::Moving
        } else {
            FocuserState::Idle
        };
        let telemetry = self.connected.then(|| Telemetry {
            target_steps: self.target_steps,
            current_steps: self.current_steps,
            primary_temperature: self.primary_temperature,
            ambient_temperature: self.ambient_temperature,
            fans_enabled: self.fans_enabled,
        });
        StatusReport {
            timestamp: self.as_of,
            software_version: SOFTWARE_VERSION,
            status,
            telemetry,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FocuserState {
    Disabled,
    Idle,
    Moving,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub timestamp: DateTime<Utc>,
    pub software_version: &'static str,
    pub status: FocuserState,
    // Telemetry fields sit at the top level of the record and disappear
    // entirely while no session is open.
    #[serde(flatten)]
    pub telemetry: Option<Telemetry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Telemetry {
    pub target_steps: i32,
    pub current_steps: i32,
    pub primary_temperature: Option<f64>,
    pub ambient_temperature: Option<f64>,
    pub fans_enabled: bool,
}
