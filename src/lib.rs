//! # turbine-sync
//!
//! Wind turbine monitor core: samples rotor speed, vibration, and generator
//! voltage, drives a servo brake, and keeps a device shadow in sync with the
//! cloud over MQTT.
//!
//! ## Features
//!
//! - **Shadow synchronisation**: local changes are reported with bounded
//!   retries; remote deltas are decoded fail-closed and acknowledged
//! - **Brake control**: idempotent ON/OFF transitions plus timed positional
//!   moves from remote commands
//! - **Safety escalation**: vibration windows are classified Safe / Warning /
//!   Unsafe and can apply the brake locally
//! - **Telemetry**: one report per loop on a mode-selected topic, with idle
//!   throttling while the rotor is stationary
//!
//! ## Architecture
//!
//! The crate is structured to allow testing on desktop without hardware:
//!
//! - `traits` - Hardware and network abstractions
//! - `device` - Shared device state behind a mutex
//! - `brake`, `safety`, `sensors` - Actuator, evaluator, sampler
//! - `shadow` - Shadow updates and inbound message handling
//! - `telemetry`, `monitor` - Reports and the main loop
//! - `hal` - Mock implementations for tests and the desktop binary
//! - `services` - rumqttc transport and Greengrass discovery (feature `mqtt`)
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use turbine_sync::{
//!     BrakeController, Config, RotationCounter, SensorSampler, SharedDevice, TurbineMonitor,
//!     hal::{MockAccelerometer, MockAdc, MockDelay, MockMqtt, MockServo},
//! };
//!
//! let config = Config::default().with_thing_name("turbine-1");
//! let brake = BrakeController::new(MockServo::new(), MockDelay::new(), config.brake_settings());
//! let device = Arc::new(SharedDevice::new(brake, &config));
//! let sampler = SensorSampler::new(
//!     Arc::new(RotationCounter::new()),
//!     MockAccelerometer::new(),
//!     MockAdc::with_raw(512),
//! );
//!
//! let mqtt = MockMqtt::new();
//! let mut monitor = TurbineMonitor::new(device, sampler, mqtt.clone(), MockDelay::new(), &config);
//! monitor.start();
//! let outcome = monitor.tick();
//!
//! assert_eq!(outcome.report.loop_count(), 1);
//! assert_eq!(mqtt.published_to("dt/windfarm/turbine/turbine-1").len(), 1);
//! ```

#![warn(missing_docs)]

/// Brake actuator control.
pub mod brake;
/// Device configuration (serde JSON).
pub mod config;
/// Shared device state.
pub mod device;
/// Hardware abstraction layer with mock implementations for testing.
pub mod hal;
/// Shadow documents and inbound payload decoding.
pub mod messages;
/// The monitoring loop.
pub mod monitor;
/// Vibration safety classification.
pub mod safety;
/// Rotation, vibration, and voltage sampling.
pub mod sensors;
/// Shadow updates and the inbound sync engine.
pub mod shadow;
/// Telemetry reports, publishing, and idle backoff.
pub mod telemetry;
/// MQTT topic naming.
pub mod topics;
/// Core traits for hardware and network abstraction.
pub mod traits;

/// Broker transport and Greengrass discovery (feature-gated).
#[cfg(feature = "mqtt")]
pub mod services;

// Re-exports for convenience
pub use brake::{BrakeAction, BrakeController, BrakePosition, BrakeState};
pub use config::{Config, ConfigError};
pub use device::{ConnectionStatus, DeviceState, PublishMode, SharedDevice};
pub use messages::{BrakeCommand, DeltaChange, PayloadError, ShadowTarget};
pub use monitor::{MonitorSettings, TickOutcome, TurbineMonitor};
pub use safety::SafetyLevel;
pub use sensors::{RotationCounter, SensorError, SensorSampler, VibrationStats};
pub use shadow::{RetryPolicy, ShadowReporter, ShadowSyncEngine, ShadowUpdater};
pub use telemetry::{IdleBackoff, TelemetryError, TelemetryPublisher, TelemetryReport};
pub use topics::{DeviceIdentity, Topics};
pub use traits::{
    // Hardware
    Accelerometer,
    BrakeServo,
    Button,
    ButtonPanel,
    Clock,
    Delay,
    LedColor,
    StatusLed,
    Vector3,
    VoltageAdc,
    // Network
    MqttClient,
    MqttMessage,
    QosLevel,
};
