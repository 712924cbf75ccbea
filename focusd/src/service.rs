use std::net::IpAddr;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex as AsyncMutex, Notify};
use tracing::{instrument, warn};

use crate::models::{Command, CommandEnvelope, CommandStatus, DeviceState, StatusReport};
use crate::worker::WorkerHandle;

/// Longest stretch a move waiter sleeps before re-checking the cache, so a
/// missed wakeup costs bounded time rather than the whole timeout.
const MOVE_WAIT_GRACE: Duration = Duration::from_secs(1);

/// The daemon's API surface. Mutating calls are funnelled to the worker one
/// at a time; status reads go straight to the cache.
pub struct FocusService {
    commands: AsyncMutex<Sender<CommandEnvelope>>,
    state: Arc<Mutex<DeviceState>>,
    move_done: Arc<Notify>,
    control_ips: Vec<IpAddr>,
    move_timeout: Duration,
}

impl FocusService {
    pub fn new(worker: &WorkerHandle, control_ips: Vec<IpAddr>, move_timeout: Duration) -> Self {
        Self {
            commands: AsyncMutex::new(worker.commands.clone()),
            state: worker.state.clone(),
            move_done: worker.move_done.clone(),
            control_ips,
            move_timeout,
        }
    }

    fn origin_allowed(&self, origin: IpAddr) -> bool {
        self.control_ips.contains(&origin)
    }

    /// Submit one command and wait for its result. The sender lock is held
    /// until the worker replies, so commands reach the hardware strictly one
    /// at a time, in submission order.
    async fn request(&self, command: Command) -> CommandStatus {
        let commands = self.commands.lock().await;
        let (reply, result) = oneshot::channel();
        if commands.send(CommandEnvelope { command, reply }).is_err() {
            warn!("the focus worker is gone, failing {:?}", command);
            return CommandStatus::Failed;
        }
        result.await.unwrap_or(CommandStatus::Failed)
    }

    pub async fn initialize(&self, origin: IpAddr) -> CommandStatus {
        if !self.origin_allowed(origin) {
            return CommandStatus::InvalidControlIp;
        }
        self.request(Command::Connect).await
    }

    pub async fn shutdown(&self, origin: IpAddr) -> CommandStatus {
        if !self.origin_allowed(origin) {
            return CommandStatus::InvalidControlIp;
        }
        self.request(Command::Disconnect).await
    }

    /// Start a move and stay on the line until it finishes, fails, or times
    /// out. A timeout does not cancel the motion, it only releases the caller.
    #[instrument(skip(self))]
    pub async fn set_focus(&self, origin: IpAddr, steps: i32, offset: bool) -> CommandStatus {
        if !self.origin_allowed(origin) {
            return CommandStatus::InvalidControlIp;
        }
        let deadline = Instant::now() + self.move_timeout;
        let command = if offset {
            Command::OffsetPosition(steps)
        } else {
            Command::SetPosition(steps)
        };
        let status = self.request(command).await;
        if status != CommandStatus::Succeeded {
            return status;
        }
        self.wait_for_move_end(deadline).await
    }

    async fn wait_for_move_end(&self, deadline: Instant) -> CommandStatus {
        loop {
            {
                let state = self.state.lock().unwrap();
                if !state.connected {
                    return CommandStatus::Failed;
                }
                if !state.moving {
                    return CommandStatus::Succeeded;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("move still active at the timeout, releasing the caller");
                return CommandStatus::Failed;
            }
            let wait = MOVE_WAIT_GRACE.min(deadline.duration_since(now));
            let _ = tokio::time::timeout(wait, self.move_done.notified()).await;
        }
    }

    pub async fn reset_home_position(&self, origin: IpAddr) -> CommandStatus {
        if !self.origin_allowed(origin) {
            return CommandStatus::InvalidControlIp;
        }
        self.request(Command::ResetHome).await
    }

    pub async fn enable_fans(&self, origin: IpAddr, enabled: bool) -> CommandStatus {
        if !self.origin_allowed(origin) {
            return CommandStatus::InvalidControlIp;
        }
        self.request(Command::SetFans(enabled)).await
    }

    pub async fn stop(&self, origin: IpAddr) -> CommandStatus {
        if !self.origin_allowed(origin) {
            return CommandStatus::InvalidControlIp;
        }
        self.request(Command::Stop).await
    }

    /// Snapshot of the cache, shaped for clients. Never talks to hardware.
    pub fn report_status(&self) -> StatusReport {
        self.state.lock().unwrap().report()
    }
}
