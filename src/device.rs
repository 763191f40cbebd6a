//! Device state shared between the main loop and the shadow dispatcher.
//!
//! `SharedDevice` wraps the single [`DeviceState`] and the single
//! [`BrakeController`] in mutexes so the telemetry loop (main thread) and the
//! transport callbacks (shadow-dispatch thread) see the same values.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use turbine_sync::brake::{BrakeAction, BrakeController, BrakeState};
//! use turbine_sync::config::Config;
//! use turbine_sync::device::{PublishMode, SharedDevice};
//! use turbine_sync::hal::{MockDelay, MockServo};
//! use turbine_sync::shadow::RecordingReporter;
//!
//! let config = Config::default();
//! let brake = BrakeController::new(MockServo::new(), MockDelay::new(), config.brake_settings());
//! let device = Arc::new(SharedDevice::new(brake, &config));
//!
//! device.with_state(|state| state.publish_mode = PublishMode::Faster);
//! device.with_brake(|brake| brake.transition(BrakeAction::On, &mut RecordingReporter::default()));
//!
//! let snapshot = device.snapshot();
//! assert_eq!(snapshot.publish_mode, PublishMode::Faster);
//! assert_eq!(snapshot.brake_state, BrakeState::On);
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::brake::{BrakeAction, BrakeController};
use crate::config::Config;
use crate::shadow::{RecordingReporter, ShadowReporter};
use crate::traits::{BrakeServo, Delay};

pub use crate::brake::BrakeState;
pub use crate::safety::SafetyLevel;

// ============================================================================
// Enums
// ============================================================================

/// Broker connection status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// No transport session.
    #[default]
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// Session established.
    Connected,
}

/// Where telemetry is published (`data_path` in the shadow).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    /// Device telemetry topic.
    #[default]
    Normal,
    /// `/faster` topic, sampling window follows `data_fast_interval`.
    Faster,
    /// Rule-ingestion topic.
    Cheaper,
}

impl PublishMode {
    /// Parse a `data_path` value (case-insensitive).
    pub fn from_text(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "normal" => Some(PublishMode::Normal),
            "faster" => Some(PublishMode::Faster),
            "cheaper" => Some(PublishMode::Cheaper),
            _ => None,
        }
    }

    /// `data_path` value.
    pub fn as_str(self) -> &'static str {
        match self {
            PublishMode::Normal => "normal",
            PublishMode::Faster => "faster",
            PublishMode::Cheaper => "cheaper",
        }
    }
}

// ============================================================================
// Device State
// ============================================================================

/// Process-wide device state.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceState {
    /// Broker connection status.
    pub connection_status: ConnectionStatus,
    /// Last confirmed brake state.
    pub brake_state: BrakeState,
    /// Last commanded brake duty cycle.
    pub brake_position: f32,
    /// Result of the last vibration evaluation.
    pub safety_state: SafetyLevel,
    /// Telemetry routing.
    pub publish_mode: PublishMode,
    /// `data_fast_interval` in seconds.
    pub publish_interval_secs: u32,
    /// `vibe_limit`.
    pub vibration_limit: f32,
}

impl DeviceState {
    /// Initial state from configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            connection_status: ConnectionStatus::Disconnected,
            brake_state: BrakeState::Unknown,
            brake_position: config.settings.brake_servo.off_position,
            safety_state: SafetyLevel::Safe,
            publish_mode: PublishMode::Normal,
            publish_interval_secs: config.runtime.telemetry.publish_interval_sec,
            vibration_limit: config.settings.vibration.limit,
        }
    }
}

// ============================================================================
// Shared Device
// ============================================================================

/// Thread-safe handle to the device state and the brake.
///
/// Lock order is always brake first, then state. The state lock is never
/// held while the brake moves, so telemetry snapshots stay responsive during
/// settle times.
pub struct SharedDevice<S: BrakeServo, D: Delay> {
    state: Mutex<DeviceState>,
    brake: Mutex<BrakeController<S, D>>,
}

impl<S: BrakeServo, D: Delay> SharedDevice<S, D> {
    /// Wrap a brake controller with state initialised from `config`.
    pub fn new(brake: BrakeController<S, D>, config: &Config) -> Self {
        let mut state = DeviceState::from_config(config);
        state.brake_state = brake.state();
        state.brake_position = brake.position();
        Self {
            state: Mutex::new(state),
            brake: Mutex::new(brake),
        }
    }

    /// Access the device state with a mutable lock.
    pub fn with_state<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut DeviceState) -> R,
    {
        f(&mut lock(&self.state))
    }

    /// Access the brake with a mutable lock.
    ///
    /// The brake's state and position are copied into [`DeviceState`] after
    /// the closure returns.
    pub fn with_brake<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut BrakeController<S, D>) -> R,
    {
        let mut brake = lock(&self.brake);
        let result = f(&mut brake);
        let (brake_state, position) = (brake.state(), brake.position());
        let mut state = lock(&self.state);
        state.brake_state = brake_state;
        state.brake_position = position;
        result
    }

    /// Drive the brake to a stable state.
    ///
    /// The shadow report produced by the transition is held in the returned
    /// [`BrakeTransition`] and only goes out once the caller forwards it,
    /// after the brake lock has been released.
    pub fn transition_brake(&self, action: BrakeAction) -> BrakeTransition {
        let mut pending = RecordingReporter::default();
        let (before, after) = self.with_brake(|brake| {
            let before = brake.state();
            (before, brake.transition(action, &mut pending))
        });
        BrakeTransition {
            before,
            after,
            pending,
        }
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> DeviceState {
        lock(&self.state).clone()
    }

    /// Update the connection status.
    pub fn set_connection_status(&self, status: ConnectionStatus) {
        lock(&self.state).connection_status = status;
    }

    /// Record the latest safety evaluation.
    pub fn set_safety_state(&self, level: SafetyLevel) {
        lock(&self.state).safety_state = level;
    }
}

/// A finished brake transition whose report has not been sent yet.
#[derive(Debug)]
#[must_use = "the brake report is lost unless forwarded"]
pub struct BrakeTransition {
    /// State before the transition.
    pub before: BrakeState,
    /// State after the transition.
    pub after: BrakeState,
    pending: RecordingReporter,
}

impl BrakeTransition {
    /// Send the pending report through `reporter` and return the new state.
    pub fn report_to<R: ShadowReporter + ?Sized>(self, reporter: &mut R) -> BrakeState {
        self.pending.forward(reporter);
        self.after
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brake::BrakeAction;
    use crate::hal::{MockDelay, MockServo};
    use crate::shadow::RecordingReporter;
    use std::sync::Arc;

    fn device() -> SharedDevice<MockServo, MockDelay> {
        let config = Config::default();
        let brake = BrakeController::new(MockServo::new(), MockDelay::new(), config.brake_settings());
        SharedDevice::new(brake, &config)
    }

    #[test]
    fn initial_state_from_config() {
        let state = device().snapshot();
        assert_eq!(state.connection_status, ConnectionStatus::Disconnected);
        assert_eq!(state.brake_state, BrakeState::Unknown);
        assert_eq!(state.brake_position, 7.5);
        assert_eq!(state.publish_mode, PublishMode::Normal);
        assert_eq!(state.publish_interval_secs, 5);
        assert_eq!(state.vibration_limit, 5.0);
    }

    #[test]
    fn brake_changes_flow_into_state() {
        let device = device();
        device.with_brake(|b| b.transition(BrakeAction::On, &mut RecordingReporter::default()));
        let state = device.snapshot();
        assert_eq!(state.brake_state, BrakeState::On);
        assert_eq!(state.brake_position, 6.5);
    }

    /// Records whether the brake lock was free each time a report went out.
    struct LockWatcher<'a> {
        device: &'a SharedDevice<MockServo, MockDelay>,
        lock_free: Vec<bool>,
    }

    impl ShadowReporter for LockWatcher<'_> {
        fn report_local_change(
            &mut self,
            _param: &str,
            value: serde_json::Value,
            _target: crate::messages::ShadowTarget,
        ) -> serde_json::Value {
            self.lock_free.push(self.device.brake.try_lock().is_ok());
            value
        }
    }

    #[test]
    fn brake_report_sent_after_lock_released() {
        let device = device();
        let mut reporter = LockWatcher {
            device: &device,
            lock_free: Vec::new(),
        };

        let moved = device.transition_brake(BrakeAction::On);
        assert_eq!(moved.before, BrakeState::Unknown);
        assert_eq!(moved.report_to(&mut reporter), BrakeState::On);

        assert_eq!(reporter.lock_free, vec![true]);
        assert_eq!(device.snapshot().brake_state, BrakeState::On);
    }

    #[test]
    fn repeated_transition_has_nothing_to_report() {
        let device = device();
        let mut first = RecordingReporter::default();
        device.transition_brake(BrakeAction::Off).report_to(&mut first);

        let mut second = RecordingReporter::default();
        let moved = device.transition_brake(BrakeAction::Off);
        assert_eq!(moved.before, BrakeState::Off);
        moved.report_to(&mut second);

        assert_eq!(first.reports().len(), 1);
        assert!(second.reports().is_empty());
    }

    #[test]
    fn state_shared_across_threads() {
        let device = Arc::new(device());
        let remote = Arc::clone(&device);
        std::thread::spawn(move || {
            remote.with_state(|s| s.vibration_limit = 8.0);
            remote.set_connection_status(ConnectionStatus::Connected);
        })
        .join()
        .unwrap();

        let state = device.snapshot();
        assert_eq!(state.vibration_limit, 8.0);
        assert_eq!(state.connection_status, ConnectionStatus::Connected);
    }

    #[test]
    fn survives_poisoned_lock() {
        let device = Arc::new(device());
        let remote = Arc::clone(&device);
        let _ = std::thread::spawn(move || {
            remote.with_state(|_| panic!("poison"));
        })
        .join();

        device.set_safety_state(SafetyLevel::Warning);
        assert_eq!(device.snapshot().safety_state, SafetyLevel::Warning);
    }

    #[test]
    fn publish_mode_text() {
        assert_eq!(PublishMode::from_text("Faster"), Some(PublishMode::Faster));
        assert_eq!(PublishMode::from_text("cheaper"), Some(PublishMode::Cheaper));
        assert_eq!(PublishMode::from_text("slower"), None);
        assert_eq!(PublishMode::Normal.as_str(), "normal");
    }
}
