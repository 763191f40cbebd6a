//! Hardware abstraction traits for the brake servo, sensors, and indicators.
//!
//! These traits are the seams between the monitoring core and the board
//! drivers. The core never touches GPIO directly; it only talks to these
//! traits, so the whole control loop runs on desktop with the mocks from
//! [`crate::hal::mock`].
//!
//! # Key Traits
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`BrakeServo`] | PWM duty-cycle output driving the brake servo |
//! | [`Accelerometer`] | 3-axis acceleration for vibration sampling |
//! | [`VoltageAdc`] | ADC channel reads for generator voltage |
//! | [`StatusLed`] | RGB status indicator |
//! | [`ButtonPanel`] | Manual reset / brake buttons |
//! | [`Delay`] | Blocking sleep used by settle times and backoff |
//! | [`Clock`] | Wall-clock timestamps for telemetry |
//!
//! # Example
//!
//! ```rust
//! use turbine_sync::traits::BrakeServo;
//! use turbine_sync::hal::MockServo;
//!
//! let mut servo = MockServo::new();
//! servo.set_duty_cycle(7.5).unwrap();
//! servo.set_duty_cycle(0.0).unwrap();
//!
//! assert_eq!(servo.writes(), vec![7.5, 0.0]);
//! ```

use core::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A 3-axis reading in m/s².
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Vector3 {
    /// X axis.
    pub x: f32,
    /// Y axis.
    pub y: f32,
    /// Z axis.
    pub z: f32,
}

impl Vector3 {
    /// Creates a vector from its components.
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Euclidean magnitude `sqrt(x² + y² + z²)`.
    pub fn magnitude(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

impl core::ops::Sub for Vector3 {
    type Output = Vector3;

    fn sub(self, rhs: Vector3) -> Vector3 {
        Vector3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

/// Brake servo driven by a PWM duty cycle.
///
/// A duty cycle of `0.0` releases the drive signal entirely, which is how the
/// brake avoids chatter and heating once it has settled.
pub trait BrakeServo {
    /// Error type for servo writes.
    type Error: fmt::Debug;

    /// Set the PWM duty cycle (percent of signal high-time per period).
    fn set_duty_cycle(&mut self, duty: f32) -> Result<(), Self::Error>;
}

/// 3-axis accelerometer used for vibration sampling.
pub trait Accelerometer {
    /// Error type for sensor reads.
    type Error: fmt::Debug;

    /// Read the current acceleration on all three axes.
    fn read_acceleration(&mut self) -> Result<Vector3, Self::Error>;
}

/// Analog-to-digital converter with numbered channels (10-bit).
pub trait VoltageAdc {
    /// Error type for ADC reads.
    type Error: fmt::Debug;

    /// Read the raw value (0-1023) of `channel`.
    fn read_channel(&mut self, channel: u8) -> Result<u16, Self::Error>;
}

/// Colours the RGB status LED can show.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LedColor {
    /// Unsafe vibration.
    Red,
    /// Safe operation.
    Green,
    /// Starting up.
    Blue,
    /// Vibration warning band.
    Magenta,
    /// All channels on.
    White,
}

/// RGB status indicator.
pub trait StatusLed {
    /// Show `color`, or switch all channels off with `None`.
    fn show(&mut self, color: Option<LedColor>);
}

/// Panel buttons wired to the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Button {
    /// S1: manual brake reset.
    Reset,
    /// S2: apply the brake.
    BrakeOn,
    /// S3: unassigned.
    Aux,
}

/// Momentary push buttons, sampled by level.
pub trait ButtonPanel {
    /// Returns `true` while `button` is held down.
    fn is_pressed(&mut self, button: Button) -> bool;
}

/// Blocking delay.
///
/// Settle times, retry spacing, and idle backoff all go through this trait
/// so tests can record them instead of sleeping.
pub trait Delay {
    /// Block the calling thread for `ms` milliseconds.
    fn delay_ms(&mut self, ms: u64);
}

/// Wall-clock time source.
pub trait Clock {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// [`Delay`] backed by [`std::thread::sleep`].
#[derive(Clone, Copy, Debug, Default)]
pub struct StdDelay;

impl Delay for StdDelay {
    fn delay_ms(&mut self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// [`Clock`] backed by [`SystemTime`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_magnitude_pythagorean() {
        assert_eq!(Vector3::new(3.0, 4.0, 0.0).magnitude(), 5.0);
    }

    #[test]
    fn vector_magnitude_zero() {
        assert_eq!(Vector3::default().magnitude(), 0.0);
    }

    #[test]
    fn vector_subtraction() {
        let v = Vector3::new(1.0, 2.0, 3.0) - Vector3::new(0.5, 0.5, 0.5);
        assert_eq!(v, Vector3::new(0.5, 1.5, 2.5));
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.now_ms() > 1_577_836_800_000);
    }
}
