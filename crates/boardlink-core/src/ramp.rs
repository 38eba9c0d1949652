//! Ramp-limited velocity controller.
//!
//! The controller tracks a requested `target` and walks `current` toward it
//! at a bounded rate, one step per control tick.  It is deliberately
//! hardware-agnostic: the caller supplies the elapsed time and turns the
//! returned [`DriveCommand`] into wire frames.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use boardlink_core::ramp::{DriveCommand, RampController};
//! use boardlink_types::Settings;
//!
//! let mut ramp = RampController::new(&Settings::default());
//! ramp.set_target(5000.0);
//!
//! // 100 ms at 5000 ERPM/s moves 500 ERPM.
//! let cmd = ramp.advance(Duration::from_millis(100));
//! assert_eq!(cmd, DriveCommand::Rpm(500));
//! ```

use std::time::Duration;

use boardlink_types::Settings;

/// What the motor should be told this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveCommand {
    /// Explicit zero-current stop; issued inside the rest deadband so the
    /// motor is never chattered with near-zero velocities.
    Stop,
    /// Drive at the given electrical RPM.
    Rpm(i32),
}

/// Velocity state plus the rate limits that govern how fast it may change.
///
/// `set_target` and `target` are the only external mutator/accessor pair
/// besides [`advance`](RampController::advance); all of them are cheap,
/// non-blocking, and safe behind a shared mutex.
#[derive(Debug, Clone)]
pub struct RampController {
    current: f64,
    target: f64,
    accel_limit: f64,
    decel_limit: f64,
    max_target: f64,
    deadband: f64,
}

impl RampController {
    pub fn new(settings: &Settings) -> Self {
        Self {
            current: 0.0,
            target: 0.0,
            accel_limit: settings.accel_erpm_per_s,
            decel_limit: settings.decel_erpm_per_s,
            max_target: settings.max_erpm,
            deadband: settings.deadband_erpm,
        }
    }

    /// Move `current` one bounded step toward `target` and report the
    /// command for the new state.
    ///
    /// The step is `min(elapsed * rate, |target - current|)`, accelerating
    /// while the magnitude is still below the target's and decelerating
    /// otherwise, so `current` approaches monotonically and never
    /// overshoots.  A non-positive `elapsed` leaves the state untouched.
    pub fn advance(&mut self, elapsed: Duration) -> DriveCommand {
        let dt = elapsed.as_secs_f64();
        if dt > 0.0 {
            let delta = self.target - self.current;
            let rate = if self.current.abs() < self.target.abs() {
                self.accel_limit
            } else {
                self.decel_limit
            };
            let step = (dt * rate).min(delta.abs());
            self.current += step.copysign(delta);
        }
        self.command()
    }

    /// The command matching the present `current`, without advancing.
    pub fn command(&self) -> DriveCommand {
        if self.current.abs() < self.deadband {
            DriveCommand::Stop
        } else {
            DriveCommand::Rpm(self.current.trunc() as i32)
        }
    }

    /// Request a new target, clamped to the configured maximum magnitude.
    /// Non-finite input is treated as a request to stop.
    pub fn set_target(&mut self, value: f64) {
        let value = if value.is_finite() { value } else { 0.0 };
        self.target = value.clamp(-self.max_target, self.max_target);
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    /// Zero the target so the next ticks ramp the motor down.
    pub fn reset_target(&mut self) {
        self.target = 0.0;
    }

    /// Zero both target and current; the next command is an explicit stop.
    pub fn force_stop(&mut self) {
        self.target = 0.0;
        self.current = 0.0;
    }

    /// Adopt new rate limits, re-clamping the target against the new
    /// maximum.
    pub fn apply_limits(&mut self, settings: &Settings) {
        self.accel_limit = settings.accel_erpm_per_s;
        self.decel_limit = settings.decel_erpm_per_s;
        self.max_target = settings.max_erpm;
        self.deadband = settings.deadband_erpm;
        self.target = self.target.clamp(-self.max_target, self.max_target);
    }
}
