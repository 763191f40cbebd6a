//! Brake actuator control.
//!
//! The brake is a hobby servo pressing a pad against the rotor. It has two
//! stable states, applied (`ON`) and released (`OFF`), each reached by driving
//! the servo to a calibrated duty cycle, waiting for it to settle, and then
//! cutting the drive signal (duty 0) so the servo does not chatter or heat up.
//!
//! Remote commands may also move the brake to an arbitrary position for a
//! bounded time ([`BrakeController::request_timed_move`]). Those moves never
//! change the stable state and are never reported to the shadow.
//!
//! # Example
//!
//! ```rust
//! use turbine_sync::brake::{BrakeAction, BrakeController, BrakePosition, BrakeState};
//! use turbine_sync::config::Config;
//! use turbine_sync::hal::{MockDelay, MockServo};
//! use turbine_sync::shadow::RecordingReporter;
//!
//! let mut brake = BrakeController::new(
//!     MockServo::new(),
//!     MockDelay::new(),
//!     Config::default().brake_settings(),
//! );
//! let mut reporter = RecordingReporter::default();
//!
//! assert_eq!(brake.transition(BrakeAction::Off, &mut reporter), BrakeState::Off);
//! // Already off: nothing moves, nothing is reported.
//! assert_eq!(brake.transition(BrakeAction::Off, &mut reporter), BrakeState::Off);
//! assert_eq!(reporter.reports().len(), 1);
//!
//! // Half-way for two seconds, then back to off.
//! brake.request_timed_move(BrakePosition::Percent(50.0), 2.0, true).unwrap();
//! assert_eq!(brake.servo().writes(), vec![7.5, 0.0, 7.0, 7.5, 0.0]);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::messages::ShadowTarget;
use crate::shadow::ShadowReporter;
use crate::traits::{BrakeServo, Delay};

/// Shadow parameter carrying the stable brake state.
pub const BRAKE_STATUS_PARAM: &str = "brake_status";

/// Errors from driving the brake servo.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BrakeError {
    /// The servo rejected a duty-cycle write.
    #[error("brake servo write failed: {0}")]
    Servo(String),
    /// A calibration value fell outside the servo's duty bounds.
    #[error("duty cycle {value} outside {min}..={max}")]
    OutOfBounds {
        /// Rejected value.
        value: f32,
        /// Lower bound.
        min: f32,
        /// Upper bound.
        max: f32,
    },
}

// ============================================================================
// States and actions
// ============================================================================

/// Last confirmed stable brake position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrakeState {
    /// Not driven since start-up.
    #[default]
    Unknown,
    /// Applied.
    On,
    /// Released.
    Off,
}

impl BrakeState {
    /// Shadow string (`"ON"`, `"OFF"`, `"UNKNOWN"`).
    pub fn as_str(self) -> &'static str {
        match self {
            BrakeState::Unknown => "UNKNOWN",
            BrakeState::On => "ON",
            BrakeState::Off => "OFF",
        }
    }
}

/// A requested stable brake state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrakeAction {
    /// Apply the brake.
    On,
    /// Release the brake.
    Off,
}

impl BrakeAction {
    /// Parse `"ON"` / `"OFF"` (case-insensitive).
    pub fn from_text(text: &str) -> Option<Self> {
        match text.trim().to_ascii_uppercase().as_str() {
            "ON" => Some(BrakeAction::On),
            "OFF" => Some(BrakeAction::Off),
            _ => None,
        }
    }

    /// Shadow string.
    pub fn as_str(self) -> &'static str {
        match self {
            BrakeAction::On => "ON",
            BrakeAction::Off => "OFF",
        }
    }

    /// State reached once the action completes.
    pub fn target_state(self) -> BrakeState {
        match self {
            BrakeAction::On => BrakeState::On,
            BrakeAction::Off => BrakeState::Off,
        }
    }
}

/// Target of a timed move.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BrakePosition {
    /// Raw duty cycle (`pwm_value`).
    Duty(f32),
    /// Percentage between off (0) and on (100) (`brake_pct`).
    Percent(f32),
}

// ============================================================================
// Settings
// ============================================================================

/// Duty cycles of the two stable positions.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BrakeCalibration {
    /// Applied position.
    pub on_position: f32,
    /// Released position.
    pub off_position: f32,
}

impl BrakeCalibration {
    /// Map a percentage (0 = off, 100 = on) onto a duty cycle.
    ///
    /// `pwm = off - (off - on) * pct / 100`, with `pct` clamped to `0..=100`.
    /// A non-finite percentage or on-position yields the off-position.
    pub fn position_from_percent(&self, percent: f32) -> f32 {
        if !percent.is_finite() || !self.on_position.is_finite() {
            return self.off_position;
        }
        let pct = percent.clamp(0.0, 100.0);
        self.off_position - (self.off_position - self.on_position) * (pct / 100.0)
    }
}

/// Duty-cycle range the servo accepts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DutyBounds {
    /// Lowest duty cycle.
    pub min: f32,
    /// Highest duty cycle.
    pub max: f32,
}

impl DutyBounds {
    /// Whether `duty` lies within the bounds.
    pub fn contains(&self, duty: f32) -> bool {
        duty.is_finite() && duty >= self.min && duty <= self.max
    }

    /// Clamp `duty` into the bounds.
    pub fn clamp(&self, duty: f32) -> f32 {
        duty.clamp(self.min, self.max)
    }
}

/// Settle times after each kind of move.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BrakeTiming {
    /// After moving to the on-position.
    pub on_settle_ms: u64,
    /// After moving to the off-position.
    pub off_settle_ms: u64,
    /// After a timed move returns to off.
    pub return_settle_ms: u64,
}

/// Everything the controller needs to know about the servo.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BrakeSettings {
    /// Stable positions.
    pub calibration: BrakeCalibration,
    /// Accepted duty range.
    pub bounds: DutyBounds,
    /// Settle times.
    pub timing: BrakeTiming,
}

// ============================================================================
// Controller
// ============================================================================

/// Drives the brake servo and tracks its stable state.
pub struct BrakeController<S: BrakeServo, D: Delay> {
    servo: S,
    delay: D,
    settings: BrakeSettings,
    state: BrakeState,
    position: f32,
}

impl<S: BrakeServo, D: Delay> BrakeController<S, D> {
    /// Create a controller. The brake state starts as [`BrakeState::Unknown`].
    pub fn new(servo: S, delay: D, settings: BrakeSettings) -> Self {
        Self {
            servo,
            delay,
            position: settings.calibration.off_position,
            settings,
            state: BrakeState::Unknown,
        }
    }

    /// Last confirmed stable state.
    pub fn state(&self) -> BrakeState {
        self.state
    }

    /// Last commanded duty cycle.
    pub fn position(&self) -> f32 {
        self.position
    }

    /// Current settings.
    pub fn settings(&self) -> &BrakeSettings {
        &self.settings
    }

    /// The underlying servo.
    pub fn servo(&self) -> &S {
        &self.servo
    }

    /// Mutable access to the underlying servo.
    pub fn servo_mut(&mut self) -> &mut S {
        &mut self.servo
    }

    /// Drive the brake to a stable state and report it.
    ///
    /// Does nothing if the brake is already in that state. On a servo failure
    /// the error is logged and the state is left unchanged. On success
    /// `reported.brake_status` is published through `reporter`.
    pub fn transition<R: ShadowReporter + ?Sized>(
        &mut self,
        action: BrakeAction,
        reporter: &mut R,
    ) -> BrakeState {
        let target_state = action.target_state();
        if self.state == target_state {
            debug!(brake = action.as_str(), "brake already in requested state");
            return self.state;
        }

        let (duty, settle_ms) = match action {
            BrakeAction::On => (
                self.settings.calibration.on_position,
                self.settings.timing.on_settle_ms,
            ),
            BrakeAction::Off => (
                self.settings.calibration.off_position,
                self.settings.timing.off_settle_ms,
            ),
        };

        if let Err(e) = self.drive(duty, settle_ms) {
            error!(brake = action.as_str(), error = %e, "brake transition failed");
            return self.state;
        }

        self.state = target_state;
        self.position = duty;
        info!(brake = action.as_str(), duty, "brake transition complete");

        reporter.report_local_change(
            BRAKE_STATUS_PARAM,
            json!(action.as_str()),
            ShadowTarget::Reported,
        );
        self.state
    }

    /// Move to an arbitrary position, hold for `duration_secs`, then either
    /// return to the off-position or release the drive.
    ///
    /// The stable state is not changed and nothing is reported.
    pub fn request_timed_move(
        &mut self,
        position: BrakePosition,
        duration_secs: f32,
        return_to_off: bool,
    ) -> Result<(), BrakeError> {
        let duty = self.resolve(position);
        let hold_ms = (duration_secs.max(0.0) * 1000.0).round() as u64;

        info!(duty, hold_ms, return_to_off, "timed brake move");
        self.write(duty)?;
        self.position = duty;
        self.delay.delay_ms(hold_ms);

        if return_to_off {
            let off = self.settings.calibration.off_position;
            self.write(off)?;
            self.position = off;
            self.delay.delay_ms(self.settings.timing.return_settle_ms);
        }
        self.write(0.0)
    }

    /// Duty cycle a timed move to `position` would use.
    pub fn resolve(&self, position: BrakePosition) -> f32 {
        let calibration = &self.settings.calibration;
        match position {
            BrakePosition::Percent(pct) => self
                .settings
                .bounds
                .clamp(calibration.position_from_percent(pct)),
            BrakePosition::Duty(duty) if duty.is_finite() => self.settings.bounds.clamp(duty),
            BrakePosition::Duty(_) => calibration.off_position,
        }
    }

    /// Check a calibration value before applying it.
    pub fn check_duty(&self, duty: f32) -> Result<(), BrakeError> {
        let bounds = self.settings.bounds;
        if bounds.contains(duty) {
            Ok(())
        } else {
            Err(BrakeError::OutOfBounds {
                value: duty,
                min: bounds.min,
                max: bounds.max,
            })
        }
    }

    /// Recalibrate the applied position.
    pub fn set_on_position(&mut self, duty: f32) -> Result<(), BrakeError> {
        self.check_duty(duty)?;
        self.settings.calibration.on_position = duty;
        Ok(())
    }

    /// Recalibrate the released position.
    pub fn set_off_position(&mut self, duty: f32) -> Result<(), BrakeError> {
        self.check_duty(duty)?;
        self.settings.calibration.off_position = duty;
        Ok(())
    }

    fn drive(&mut self, duty: f32, settle_ms: u64) -> Result<(), BrakeError> {
        self.write(duty)?;
        self.delay.delay_ms(settle_ms);
        self.write(0.0)
    }

    fn write(&mut self, duty: f32) -> Result<(), BrakeError> {
        self.servo
            .set_duty_cycle(duty)
            .map_err(|e| BrakeError::Servo(format!("{e:?}")))
    }
}
