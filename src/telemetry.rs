//! Telemetry reports and idle throttling.
//!
//! One [`TelemetryReport`] is built and published per loop iteration. When the
//! rotor is stationary, [`IdleBackoff`] slows the loop down: it polls the speed
//! every few seconds and hands control back as soon as the rotor turns again.
//!
//! # Example
//!
//! ```rust
//! use turbine_sync::config::Config;
//! use turbine_sync::device::PublishMode;
//! use turbine_sync::hal::MockMqtt;
//! use turbine_sync::sensors::VibrationStats;
//! use turbine_sync::telemetry::{TelemetryPublisher, TelemetryReport};
//! use turbine_sync::topics::Topics;
//! use turbine_sync::traits::Vector3;
//!
//! let identity = Config::default().with_thing_name("t1").identity();
//! let report = TelemetryReport::new(&identity, 1_700_000_000_000, 1)
//!     .with_speed(120.0, 42)
//!     .with_voltage(Some(1.65))
//!     .with_vibration(&VibrationStats::from_samples(&[Vector3::new(3.0, 4.0, 0.0)]))
//!     .with_brake_position(7.5);
//!
//! let mqtt = MockMqtt::new();
//! let mut publisher = TelemetryPublisher::new(mqtt.clone(), Topics::new(&identity));
//! publisher.publish(&report, PublishMode::Faster).unwrap();
//!
//! let sent = mqtt.published_to("dt/windfarm/turbine/t1/faster");
//! assert_eq!(sent[0].json()["turbine_vibe_peak"], 5.0);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::device::PublishMode;
use crate::sensors::VibrationStats;
use crate::topics::{DeviceIdentity, Topics};
use crate::traits::{Delay, MqttClient, QosLevel};

/// Telemetry publish failures.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The report could not be serialised.
    #[error("cannot serialise telemetry: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The transport refused the publish.
    #[error("telemetry publish failed: {0}")]
    Transport(String),
}

// ============================================================================
// Report
// ============================================================================

/// One telemetry sample, as published.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TelemetryReport {
    thing_name: String,
    #[serde(rename = "deviceID")]
    device_id: String,
    timestamp: u64,
    loop_count: u64,
    turbine_speed: f32,
    turbine_rev_cnt: u64,
    turbine_voltage: Option<f32>,
    turbine_vibe_x: f32,
    turbine_vibe_y: f32,
    turbine_vibe_z: f32,
    turbine_vibe_peak: f32,
    turbine_vibe_avg: f32,
    turbine_sample_cnt: u32,
    pwm_value: f32,
}

impl TelemetryReport {
    /// Start a report for `identity` at `timestamp_ms`.
    pub fn new(identity: &DeviceIdentity, timestamp_ms: u64, loop_count: u64) -> Self {
        Self {
            thing_name: identity.thing_name.clone(),
            device_id: identity.device_id.clone(),
            timestamp: timestamp_ms,
            loop_count,
            turbine_speed: 0.0,
            turbine_rev_cnt: 0,
            turbine_voltage: None,
            turbine_vibe_x: 0.0,
            turbine_vibe_y: 0.0,
            turbine_vibe_z: 0.0,
            turbine_vibe_peak: 0.0,
            turbine_vibe_avg: 0.0,
            turbine_sample_cnt: 0,
            pwm_value: 0.0,
        }
    }

    /// Set rotor speed and total revolutions.
    pub fn with_speed(mut self, rpm: f32, revolutions: u64) -> Self {
        self.turbine_speed = rpm;
        self.turbine_rev_cnt = revolutions;
        self
    }

    /// Set generator voltage (`None` if the ADC did not answer).
    pub fn with_voltage(mut self, volts: Option<f32>) -> Self {
        self.turbine_voltage = volts;
        self
    }

    /// Set the vibration window aggregates.
    pub fn with_vibration(mut self, stats: &VibrationStats) -> Self {
        self.turbine_vibe_x = stats.peak_x;
        self.turbine_vibe_y = stats.peak_y;
        self.turbine_vibe_z = stats.peak_z;
        self.turbine_vibe_peak = stats.peak;
        self.turbine_vibe_avg = stats.average;
        self.turbine_sample_cnt = stats.sample_count;
        self
    }

    /// Set the last commanded brake duty cycle.
    pub fn with_brake_position(mut self, duty: f32) -> Self {
        self.pwm_value = duty;
        self
    }

    /// Milliseconds since the Unix epoch.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Loop iteration that produced this report.
    pub fn loop_count(&self) -> u64 {
        self.loop_count
    }

    /// Rotor speed in RPM.
    pub fn speed(&self) -> f32 {
        self.turbine_speed
    }

    /// Peak vibration magnitude.
    pub fn vibe_peak(&self) -> f32 {
        self.turbine_vibe_peak
    }

    /// Samples in the vibration window.
    pub fn sample_count(&self) -> u32 {
        self.turbine_sample_cnt
    }

    /// Brake duty cycle.
    pub fn brake_position(&self) -> f32 {
        self.pwm_value
    }
}

impl core::fmt::Display for TelemetryReport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Speed:{:.0}-RPM ", self.turbine_speed)?;
        match self.turbine_voltage {
            Some(v) => write!(f, "Voltage:{v:.3} ")?,
            None => write!(f, "Voltage:n/a ")?,
        }
        write!(
            f,
            "Rotations:{} Peak-Vibe:{:.3} Avg-Vibe:{:.3} Brake-PWM:{} LoopCnt:{}",
            self.turbine_rev_cnt,
            self.turbine_vibe_peak,
            self.turbine_vibe_avg,
            self.pwm_value,
            self.loop_count
        )
    }
}

// ============================================================================
// Publisher
// ============================================================================

/// Publishes reports on the topic selected by the publish mode.
pub struct TelemetryPublisher<C: MqttClient> {
    client: C,
    topics: Topics,
}

impl<C: MqttClient> TelemetryPublisher<C> {
    /// Create a publisher.
    pub fn new(client: C, topics: Topics) -> Self {
        Self { client, topics }
    }

    /// The underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Publish one report at QoS 0.
    pub fn publish(&mut self, report: &TelemetryReport, mode: PublishMode) -> Result<(), TelemetryError> {
        let topic = self.topics.telemetry(mode);
        let payload = serde_json::to_vec(report)?;
        self.client
            .publish(topic, &payload, QosLevel::AtMostOnce)
            .map_err(|e| TelemetryError::Transport(format!("{e:?}")))?;
        debug!(topic, bytes = payload.len(), "telemetry published");
        Ok(())
    }
}

// ============================================================================
// Idle Backoff
// ============================================================================

/// Slow polling while the rotor is stationary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdleBackoff {
    /// Pause before each speed poll.
    pub poll_interval_ms: u64,
    /// Maximum polls before returning to the main loop.
    pub max_polls: u32,
}

impl Default for IdleBackoff {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
            max_polls: 12,
        }
    }
}

/// How an idle period ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdleOutcome {
    /// Speed polls performed.
    pub polls: u32,
    /// The rotor started turning again.
    pub resumed: bool,
}

impl IdleBackoff {
    /// Wait, then poll `sample_speed`, up to `max_polls` times.
    ///
    /// Returns early on the first nonzero speed or when `shutdown` is set.
    pub fn wait<D, F>(&self, delay: &mut D, mut sample_speed: F, shutdown: &AtomicBool) -> IdleOutcome
    where
        D: Delay + ?Sized,
        F: FnMut() -> f32,
    {
        info!(
            max_secs = self.poll_interval_ms * u64::from(self.max_polls) / 1000,
            "turbine is idle, slowing down"
        );
        let mut polls = 0;
        while polls < self.max_polls {
            if shutdown.load(Ordering::Acquire) {
                break;
            }
            delay.delay_ms(self.poll_interval_ms);
            polls += 1;
            if sample_speed() > 0.0 {
                info!(polls, "turbine is spinning again");
                return IdleOutcome {
                    polls,
                    resumed: true,
                };
            }
        }
        IdleOutcome {
            polls,
            resumed: false,
        }
    }
}
