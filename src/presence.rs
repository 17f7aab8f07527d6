use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::CaptureConfig;
use crate::console::{Command, CommandSource};
use crate::error::ProtocolError;

/// Source of time for every wait loop
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Single "is a finger on the glass right now" check
pub trait PresenceProbe {
    fn finger_present(&mut self) -> Result<bool, ProtocolError>;

    /// Called after a probe failed, before the next probe is issued
    fn resync(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    Absent,
    Present,
    /// Absent continuously for at least the quiet interval
    StableAbsent,
}

/// Debounces raw probe results into a `PresenceState`
#[derive(Debug)]
pub struct PresenceTracker {
    quiet: Duration,
    absent_since: Option<Instant>,
}

impl PresenceTracker {
    pub fn new(quiet: Duration) -> Self {
        PresenceTracker {
            quiet,
            absent_since: None,
        }
    }

    pub fn observe(&mut self, present: bool, now: Instant) -> PresenceState {
        if present {
            self.absent_since = None;
            return PresenceState::Present;
        }

        let since = *self.absent_since.get_or_insert(now);
        if now.duration_since(since) >= self.quiet {
            PresenceState::StableAbsent
        } else {
            PresenceState::Absent
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FingerWait {
    Ready,
    Aborted(Command),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiftOutcome {
    Lifted,
    /// Gave up waiting; the finger may still be on the sensor
    TimedOut,
}

#[derive(Debug, Clone, Copy)]
pub struct PresenceTiming {
    pub quiet: Duration,
    pub finger_poll: Duration,
    pub idle_poll: Duration,
    pub busy_poll: Duration,
    pub lift_poll: Duration,
    pub lift_timeout: Duration,
}

impl From<&CaptureConfig> for PresenceTiming {
    fn from(config: &CaptureConfig) -> Self {
        PresenceTiming {
            quiet: Duration::from_millis(config.quiet_ms),
            finger_poll: Duration::from_millis(config.finger_poll_ms),
            idle_poll: Duration::from_millis(config.idle_poll_ms),
            busy_poll: Duration::from_millis(config.busy_poll_ms),
            lift_poll: Duration::from_millis(config.lift_poll_ms),
            lift_timeout: Duration::from_millis(config.lift_timeout_ms),
        }
    }
}

/// Polls a presence probe to detect finger placement and removal
pub struct PresenceMonitor<C> {
    timing: PresenceTiming,
    clock: C,
}

impl<C: Clock> PresenceMonitor<C> {
    pub fn new(timing: PresenceTiming, clock: C) -> Self {
        PresenceMonitor { timing, clock }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Wait for the sensor to go quiet, then for a finger to land.
    ///
    /// The command source is sampled once per poll in both phases.
    pub fn wait_for_finger<P>(&self, probe: &mut P, commands: &mut dyn CommandSource) -> FingerWait
    where
        P: PresenceProbe + ?Sized,
    {
        info!("Place finger...");

        if let Some(command) = self.wait_for_idle(probe, commands) {
            return FingerWait::Aborted(command);
        }

        loop {
            if self.probe(probe) {
                info!("Captured");
                return FingerWait::Ready;
            }
            if let Some(command) = commands.poll_abort() {
                return FingerWait::Aborted(command);
            }
            self.clock.sleep(self.timing.finger_poll);
        }
    }

    /// Block until the sensor reports STABLE_ABSENT
    pub fn wait_for_idle<P>(&self, probe: &mut P, commands: &mut dyn CommandSource) -> Option<Command>
    where
        P: PresenceProbe + ?Sized,
    {
        let mut tracker = PresenceTracker::new(self.timing.quiet);

        loop {
            let present = self.probe(probe);
            match tracker.observe(present, self.clock.now()) {
                PresenceState::StableAbsent => return None,
                PresenceState::Absent => {
                    if let Some(command) = commands.poll_abort() {
                        return Some(command);
                    }
                    self.clock.sleep(self.timing.idle_poll);
                }
                PresenceState::Present => {
                    if let Some(command) = commands.poll_abort() {
                        return Some(command);
                    }
                    self.clock.sleep(self.timing.busy_poll);
                }
            }
        }
    }

    /// Wait for the finger to leave. A timeout is not an error.
    pub fn wait_for_lift<P>(&self, probe: &mut P) -> LiftOutcome
    where
        P: PresenceProbe + ?Sized,
    {
        info!("Remove finger...");
        let start = self.clock.now();

        loop {
            if !self.probe(probe) {
                info!("Finger removed");
                return LiftOutcome::Lifted;
            }
            if self.clock.now().duration_since(start) > self.timing.lift_timeout {
                warn!(
                    "Finger still present after {}ms, continuing anyway",
                    self.timing.lift_timeout.as_millis()
                );
                return LiftOutcome::TimedOut;
            }
            self.clock.sleep(self.timing.lift_poll);
        }
    }

    // A failed probe reads as "no finger" after resynchronising the link
    fn probe<P: PresenceProbe + ?Sized>(&self, probe: &mut P) -> bool {
        match probe.finger_present() {
            Ok(present) => present,
            Err(e) => {
                debug!("presence probe failed: {}", e);
                probe.resync();
                false
            }
        }
    }
}
