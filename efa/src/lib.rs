use std::io::{self, ErrorKind};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Response code returned by the controller when a command is accepted.
pub const ACK: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemperatureProbe {
    Primary,
    Ambient,
}

/// One open session with the focuser electronics. All calls are blocking and
/// must stay on a single thread of control.
pub trait FocuserPort: Send {
    /// Current encoder position. `Ok(None)` means the controller had no
    /// position data ready, which happens intermittently while a move settles.
    fn motor_position(&mut self) -> io::Result<Option<i32>>;

    /// Whether a goto is still being executed by the drive.
    fn goto_active(&mut self) -> io::Result<bool>;

    /// Start an absolute move. Returns the controller response code.
    fn goto(&mut self, target_steps: i32) -> io::Result<i32>;

    /// Command a constant tracking rate. Rate 0 halts the drive.
    fn track(&mut self, rate: i32) -> io::Result<i32>;

    /// Declare the current position to be step 0.
    fn zero_encoder(&mut self) -> io::Result<i32>;

    fn set_fans(&mut self, enabled: bool) -> io::Result<i32>;

    fn fans(&mut self) -> io::Result<bool>;

    /// `Ok(None)` when the probe is not reporting.
    fn temperature(&mut self, probe: TemperatureProbe) -> io::Result<Option<f64>>;

    /// Release the session. The handle is consumed whether or not the
    /// controller acknowledged the shutdown.
    fn close(self: Box<Self>) -> io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub initial_steps: i32,
    /// Drive speed for goto moves. 0 simulates a stalled drive that reports
    /// an active goto forever without changing position.
    pub steps_per_second: i32,
    pub primary_temperature: Option<f64>,
    pub ambient_temperature: Option<f64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            initial_steps: 0,
            steps_per_second: 2000,
            primary_temperature: Some(9.4),
            ambient_temperature: Some(8.1),
        }
    }
}

/// Software stand-in for the focuser hardware. Clones share one device, so a
/// test can keep a handle for fault injection while the session under test
/// talks to the same state.
#[derive(Clone)]
pub struct SimulatedFocuser {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    // While a motion is active `position` holds the origin of that motion and
    // the live value is derived from the elapsed time.
    position: i32,
    target: i32,
    moving: bool,
    started: Instant,
    rate: i32,
    goto_rate: i32,
    fans: bool,
    primary: Option<f64>,
    ambient: Option<f64>,
    link_up: bool,
    empty_position_reads: u32,
    fail_next_close: bool,
}

impl Inner {
    fn ensure_link(&self) -> io::Result<()> {
        if self.link_up {
            Ok(())
        } else {
            Err(io::Error::new(
                ErrorKind::BrokenPipe,
                "simulated serial link is down",
            ))
        }
    }

    fn current_steps(&self) -> i32 {
        if !self.moving {
            return self.position;
        }
        let span = self.target as i64 - self.position as i64;
        let travelled = (self.rate as f64 * self.started.elapsed().as_secs_f64()) as i64;
        if travelled >= span.abs() {
            self.target
        } else if span > 0 {
            (self.position as i64 + travelled) as i32
        } else {
            (self.position as i64 - travelled) as i32
        }
    }

    fn settle(&mut self) {
        if self.moving && self.rate > 0 && self.current_steps() == self.target {
            self.position = self.target;
            self.moving = false;
        }
    }
}

impl SimulatedFocuser {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                position: config.initial_steps,
                target: config.initial_steps,
                moving: false,
                started: Instant::now(),
                rate: config.steps_per_second,
                goto_rate: config.steps_per_second,
                fans: false,
                primary: config.primary_temperature,
                ambient: config.ambient_temperature,
                link_up: true,
                empty_position_reads: 0,
                fail_next_close: false,
            })),
        }
    }

    /// Open a session against the simulated device, as a serial backend would
    /// open its port. Fails while the link is down.
    pub fn open(&self) -> io::Result<Box<dyn FocuserPort + Send>> {
        self.inner.lock().unwrap().ensure_link()?;
        Ok(Box::new(self.clone()))
    }

    /// Bring the link up or down. While down every session call fails with an
    /// I/O error, as an unplugged cable would.
    pub fn set_link_up(&self, up: bool) {
        self.inner.lock().unwrap().link_up = up;
    }

    /// Make the next `close` report an error. One-shot.
    pub fn fail_next_close(&self) {
        self.inner.lock().unwrap().fail_next_close = true;
    }

    /// Queue `count` position reads that return no data before real values
    /// resume.
    pub fn queue_empty_position_reads(&self, count: u32) {
        self.inner.lock().unwrap().empty_position_reads = count;
    }

    pub fn set_temperatures(&self, primary: Option<f64>, ambient: Option<f64>) {
        let mut inner = self.inner.lock().unwrap();
        inner.primary = primary;
        inner.ambient = ambient;
    }

    pub fn position(&self) -> i32 {
        self.inner.lock().unwrap().current_steps()
    }

    pub fn is_moving(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.settle();
        inner.moving
    }

    pub fn fans_on(&self) -> bool {
        self.inner.lock().unwrap().fans
    }
}

impl Default for SimulatedFocuser {
    fn default() -> Self {
        Self::new(SimulatorConfig::default())
    }
}

impl FocuserPort for SimulatedFocuser {
    fn motor_position(&mut self) -> io::Result<Option<i32>> {
        let mut inner = self.inner.lock().unwrap();
        inner.ensure_link()?;
        if inner.empty_position_reads > 0 {
            inner.empty_position_reads -= 1;
            return Ok(None);
        }
        inner.settle();
        Ok(Some(inner.current_steps()))
    }

    fn goto_active(&mut self) -> io::Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.ensure_link()?;
        inner.settle();
        Ok(inner.moving)
    }

    fn goto(&mut self, target_steps: i32) -> io::Result<i32> {
        let mut inner = self.inner.lock().unwrap();
        inner.ensure_link()?;
        inner.position = inner.current_steps();
        inner.target = target_steps;
        inner.rate = inner.goto_rate;
        if target_steps == inner.position {
            inner.moving = false;
        } else {
            inner.moving = true;
            inner.started = Instant::now();
        }
        Ok(ACK)
    }

    fn track(&mut self, rate: i32) -> io::Result<i32> {
        let mut inner = self.inner.lock().unwrap();
        inner.ensure_link()?;
        inner.position = inner.current_steps();
        if rate == 0 {
            inner.target = inner.position;
            inner.moving = false;
        } else {
            inner.target = if rate > 0 { i32::MAX } else { i32::MIN };
            inner.rate = rate.abs();
            inner.moving = true;
            inner.started = Instant::now();
        }
        Ok(ACK)
    }

    fn zero_encoder(&mut self) -> io::Result<i32> {
        let mut inner = self.inner.lock().unwrap();
        inner.ensure_link()?;
        inner.position = 0;
        inner.target = 0;
        inner.moving = false;
        Ok(ACK)
    }

    fn set_fans(&mut self, enabled: bool) -> io::Result<i32> {
        let mut inner = self.inner.lock().unwrap();
        inner.ensure_link()?;
        inner.fans = enabled;
        Ok(ACK)
    }

    fn fans(&mut self) -> io::Result<bool> {
        let inner = self.inner.lock().unwrap();
        inner.ensure_link()?;
        Ok(inner.fans)
    }

    fn temperature(&mut self, probe: TemperatureProbe) -> io::Result<Option<f64>> {
        let inner = self.inner.lock().unwrap();
        inner.ensure_link()?;
        Ok(match probe {
            TemperatureProbe::Primary => inner.primary,
            TemperatureProbe::Ambient => inner.ambient,
        })
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_next_close {
            inner.fail_next_close = false;
            return Err(io::Error::new(
                ErrorKind::Other,
                "simulated close failure",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    fn fast() -> SimulatedFocuser {
        SimulatedFocuser::new(SimulatorConfig {
            steps_per_second: 1_000_000,
            ..Default::default()
        })
    }

    #[test]
    fn goto_reaches_target() {
        let sim = fast();
        let mut port = sim.open().unwrap();
        assert_eq!(port.goto(500).unwrap(), ACK);
        sleep(Duration::from_millis(50));
        assert!(!port.goto_active().unwrap());
        assert_eq!(port.motor_position().unwrap(), Some(500));
    }

    #[test]
    fn stalled_drive_never_arrives() {
        let sim = SimulatedFocuser::new(SimulatorConfig {
            steps_per_second: 0,
            ..Default::default()
        });
        let mut port = sim.open().unwrap();
        port.goto(500).unwrap();
        sleep(Duration::from_millis(50));
        assert!(port.goto_active().unwrap());
        assert_eq!(port.motor_position().unwrap(), Some(0));
    }

    #[test]
    fn track_zero_halts_partway() {
        let sim = SimulatedFocuser::new(SimulatorConfig {
            steps_per_second: 1000,
            ..Default::default()
        });
        let mut port = sim.open().unwrap();
        port.goto(10_000).unwrap();
        sleep(Duration::from_millis(100));
        assert_eq!(port.track(0).unwrap(), ACK);
        assert!(!port.goto_active().unwrap());
        let halted = port.motor_position().unwrap().unwrap();
        assert!(halted > 0 && halted < 10_000, "halted at {halted}");
    }

    #[test]
    fn zero_encoder_rebases_position() {
        let sim = fast();
        let mut port = sim.open().unwrap();
        port.goto(1200).unwrap();
        sleep(Duration::from_millis(50));
        assert_eq!(port.zero_encoder().unwrap(), ACK);
        assert_eq!(port.motor_position().unwrap(), Some(0));
    }

    #[test]
    fn link_down_fails_every_call() {
        let sim = fast();
        let mut port = sim.open().unwrap();
        sim.set_link_up(false);
        assert!(port.motor_position().is_err());
        assert!(port.goto(10).is_err());
        assert!(port.fans().is_err());
        assert!(sim.open().is_err());
        sim.set_link_up(true);
        assert!(port.motor_position().is_ok());
    }

    #[test]
    fn empty_position_reads_are_consumed() {
        let sim = fast();
        let mut port = sim.open().unwrap();
        sim.queue_empty_position_reads(2);
        assert_eq!(port.motor_position().unwrap(), None);
        assert_eq!(port.motor_position().unwrap(), None);
        assert_eq!(port.motor_position().unwrap(), Some(0));
    }

    #[test]
    fn close_failure_is_one_shot() {
        let sim = fast();
        sim.fail_next_close();
        assert!(sim.open().unwrap().close().is_err());
        assert!(sim.open().unwrap().close().is_ok());
    }

    #[test]
    fn fans_and_temperatures_report_device_state() {
        let sim = fast();
        let mut port = sim.open().unwrap();
        assert!(!port.fans().unwrap());
        assert_eq!(port.set_fans(true).unwrap(), ACK);
        assert!(port.fans().unwrap());
        assert!(sim.fans_on());
        assert_eq!(
            port.temperature(TemperatureProbe::Primary).unwrap(),
            Some(9.4)
        );
        sim.set_temperatures(None, Some(3.0));
        assert_eq!(port.temperature(TemperatureProbe::Primary).unwrap(), None);
        assert_eq!(
            port.temperature(TemperatureProbe::Ambient).unwrap(),
            Some(3.0)
        );
    }
}
