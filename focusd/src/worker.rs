use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use efa::{FocuserPort, TemperatureProbe, ACK};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::models::{Command, CommandEnvelope, CommandStatus, DeviceState};

/// How many times a position read may return no data before the session is
/// treated as dead. The source condition is a transient that clears within a
/// read or two; a long streak means the controller is gone.
const POSITION_READ_ATTEMPTS: u32 = 10;
const POSITION_RETRY_DELAY: Duration = Duration::from_millis(50);

pub type PortOpener = Box<dyn FnMut() -> io::Result<Box<dyn FocuserPort + Send>> + Send>;

/// How long the worker sits in `recv_timeout` between telemetry refreshes.
/// Kept short while a move is active so the cache tracks the motion closely.
#[derive(Debug, Clone, Copy)]
pub struct PollDelays {
    pub idle: Duration,
    pub moving: Duration,
}

/// Handles shared with the rest of the daemon. The worker itself runs on a
/// blocking thread and exits once every command sender has been dropped.
pub struct WorkerHandle {
    pub commands: Sender<CommandEnvelope>,
    pub state: Arc<Mutex<DeviceState>>,
    pub move_done: Arc<Notify>,
    pub task: tokio::task::JoinHandle<()>,
}

/// Owns the serial session. Every hardware exchange in the daemon happens on
/// this worker's thread, so the controller only ever sees one conversation.
pub struct FocusWorker {
    delays: PollDelays,
    open_port: PortOpener,
    commands: Receiver<CommandEnvelope>,
    state: Arc<Mutex<DeviceState>>,
    move_done: Arc<Notify>,
    port: Option<Box<dyn FocuserPort + Send>>,
    target_steps: i32,
    was_moving: bool,
}

impl FocusWorker {
    pub fn spawn(delays: PollDelays, open_port: PortOpener) -> WorkerHandle {
        let (commands_tx, commands_rx) = mpsc::channel();
        let state = Arc::new(Mutex::new(DeviceState::disconnected()));
        let move_done = Arc::new(Notify::new());
        let worker = FocusWorker {
            delays,
            open_port,
            commands: commands_rx,
            state: state.clone(),
            move_done: move_done.clone(),
            port: None,
            target_steps: 0,
            was_moving: false,
        };
        let task = tokio::task::spawn_blocking(move || worker.run());
        WorkerHandle {
            commands: commands_tx,
            state,
            move_done,
            task,
        }
    }

    fn run(mut self) {
        info!("focus worker started");
        loop {
            let wait = if self.was_moving {
                self.delays.moving
            } else {
                self.delays.idle
            };
            match self.commands.recv_timeout(wait) {
                Ok(CommandEnvelope { command, reply }) => {
                    let mut status = self.execute(command);
                    // Refresh before replying so the cache already reflects
                    // the command when the caller wakes up.
                    if !self.refresh() && status == CommandStatus::Succeeded {
                        status = CommandStatus::Failed;
                    }
                    if reply.send(status).is_err() {
                        debug!("caller gave up before its {:?} result arrived", command);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.refresh();
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("focus worker stopped");
    }

    fn execute(&mut self, command: Command) -> CommandStatus {
        match command {
            Command::Connect => self.connect(),
            Command::Disconnect => self.disconnect(),
            command => {
                if self.port.is_none() {
                    return CommandStatus::NotConnected;
                }
                if self.was_moving && !matches!(command, Command::Stop | Command::SetFans(_)) {
                    debug!("{:?} refused while a move is in progress", command);
                    return CommandStatus::Blocked;
                }
                match self.dispatch(command) {
                    Ok(status) => status,
                    Err(e) => {
                        warn!("{:?} failed: {}, dropping the serial session", command, e);
                        self.port = None;
                        CommandStatus::Failed
                    }
                }
            }
        }
    }

    fn connect(&mut self) -> CommandStatus {
        if self.port.is_some() {
            return CommandStatus::NotDisconnected;
        }
        let mut port = match (self.open_port)() {
            Ok(port) => port,
            Err(e) => {
                warn!("failed to open the focuser port: {}", e);
                return CommandStatus::Failed;
            }
        };
        // Seed the move target from wherever the drive currently sits.
        match read_position(port.as_mut()) {
            Ok(steps) => {
                info!("connected to the focuser at {} steps", steps);
                self.target_steps = steps;
                self.port = Some(port);
                CommandStatus::Succeeded
            }
            Err(e) => {
                warn!("position read after connect failed: {}", e);
                CommandStatus::Failed
            }
        }
    }

    fn disconnect(&mut self) -> CommandStatus {
        let Some(port) = self.port.take() else {
            return CommandStatus::NotConnected;
        };
        match port.close() {
            Ok(()) => {
                info!("focuser session closed");
                CommandStatus::Succeeded
            }
            Err(e) => {
                warn!("focuser session closed uncleanly: {}", e);
                CommandStatus::Failed
            }
        }
    }

    fn dispatch(&mut self, command: Command) -> io::Result<CommandStatus> {
        let Some(port) = self.port.as_mut() else {
            return Ok(CommandStatus::NotConnected);
        };
        let code = match command {
            Command::SetFans(enabled) => port.set_fans(enabled)?,
            Command::Stop => {
                let code = port.track(0)?;
                // The drive halts wherever it is, so that becomes the target.
                self.target_steps = read_position(port.as_mut())?;
                code
            }
            Command::ResetHome => {
                let code = port.zero_encoder()?;
                if code == ACK {
                    self.target_steps = 0;
                }
                code
            }
            Command::SetPosition(steps) => {
                let code = port.goto(steps)?;
                if code == ACK {
                    self.target_steps = steps;
                }
                code
            }
            Command::OffsetPosition(delta) => {
                // Offsets from the wire can push the target past the step
                // range; clamp rather than wrap.
                let target = self.target_steps.saturating_add(delta);
                let code = port.goto(target)?;
                if code == ACK {
                    self.target_steps = target;
                }
                code
            }
            Command::Connect | Command::Disconnect => {
                unreachable!("session commands are handled before dispatch")
            }
        };
        Ok(if code == ACK {
            CommandStatus::Succeeded
        } else {
            warn!("{:?} refused by the controller (code {})", command, code);
            CommandStatus::Failed
        })
    }

    /// Re-read the device and publish a fresh snapshot. Returns false when the
    /// read failed and the session was torn down.
    fn refresh(&mut self) -> bool {
        let (snapshot, ok) = match self.port.as_mut() {
            Some(port) => match read_telemetry(port.as_mut(), self.target_steps) {
                Ok(snapshot) => (snapshot, true),
                Err(e) => {
                    warn!("telemetry refresh failed: {}, dropping the serial session", e);
                    self.port = None;
                    (DeviceState::disconnected(), false)
                }
            },
            None => (DeviceState::disconnected(), true),
        };
        let move_finished = self.was_moving && !snapshot.moving;
        self.was_moving = snapshot.moving;
        *self.state.lock().unwrap() = snapshot;
        if move_finished {
            debug!("move finished, waking waiters");
            self.move_done.notify_waiters();
        }
        ok
    }
}

fn read_telemetry(port: &mut dyn FocuserPort, target_steps: i32) -> io::Result<DeviceState> {
    let current_steps = read_position(port)?;
    let moving = port.goto_active()?;
    let primary_temperature = port.temperature(TemperatureProbe::Primary)?;
    let ambient_temperature = port.temperature(TemperatureProbe::Ambient)?;
    let fans_enabled = port.fans()?;
    Ok(DeviceState {
        as_of: Utc::now(),
        connected: true,
        moving,
        current_steps,
        target_steps,
        primary_temperature,
        ambient_temperature,
        fans_enabled,
    })
}

fn read_position(port: &mut dyn FocuserPort) -> io::Result<i32> {
    for attempt in 1..=POSITION_READ_ATTEMPTS {
        match port.motor_position()? {
            Some(steps) => return Ok(steps),
            None => {
                debug!("no position data (attempt {}), retrying", attempt);
                thread::sleep(POSITION_RETRY_DELAY);
            }
        }
    }
    Err(io::Error::new(
        io::ErrorKind::TimedOut,
        "controller returned no position data",
    ))
}
