//! The turbine monitoring loop.
//!
//! Each [`tick`](TurbineMonitor::tick) does one pass of
//! speed → vibration window → safety evaluation → (maybe) brake → publish,
//! and drops into [`IdleBackoff`] when the rotor is not turning.
//!
//! The loop owns its own [`ShadowUpdater`] for local intents (buttons,
//! auto-brake, start-up and shutdown reports). Remote changes arrive through
//! the [`ShadowSyncEngine`](crate::shadow::ShadowSyncEngine) on another
//! thread; both sides meet in the [`SharedDevice`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::brake::{BrakeAction, BrakeState, BRAKE_STATUS_PARAM};
use crate::config::Config;
use crate::device::{PublishMode, SharedDevice};
use crate::messages::ShadowTarget;
use crate::safety::SafetyLevel;
use crate::sensors::{CalibrationPlan, SensorSampler, VibrationStats};
use crate::shadow::{ShadowReporter, ShadowUpdater};
use crate::telemetry::{IdleBackoff, IdleOutcome, TelemetryPublisher, TelemetryReport};
use crate::topics::{DeviceIdentity, Topics};
use crate::traits::{
    Accelerometer, BrakeServo, Button, ButtonPanel, Clock, Delay, LedColor, MqttClient, StatusLed,
    SystemClock, VoltageAdc,
};

/// Shadow parameter carrying the connection flag.
pub const CONNECTED_PARAM: &str = "connected";

/// Loop timing and behaviour.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MonitorSettings {
    /// Vibration samples per window in Normal and Cheaper mode.
    pub sample_count: u32,
    /// Pause after each vibration sample.
    pub sample_spacing_ms: u64,
    /// Apply the brake locally when vibration is unsafe.
    pub auto_brake: bool,
    /// Start-up calibration.
    pub calibration: CalibrationPlan,
    /// Idle throttling.
    pub idle: IdleBackoff,
    /// LED off-time after each publish.
    pub flash_ms: u64,
}

impl MonitorSettings {
    /// Settings from configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            sample_count: config.settings.vibration.data_sample_cnt,
            sample_spacing_ms: config.runtime.telemetry.sample_spacing_ms,
            auto_brake: config.settings.vibration.auto_brake,
            calibration: CalibrationPlan {
                samples: config.settings.vibration.calibration_samples,
                sample_spacing_ms: 100,
                settle_check_ms: 3000,
            },
            idle: config.idle_backoff(),
            flash_ms: 80,
        }
    }

    /// Samples in the next vibration window.
    ///
    /// Faster mode stretches the window over `interval_secs`.
    pub fn window_samples(&self, mode: PublishMode, interval_secs: u32) -> u32 {
        match mode {
            PublishMode::Faster => {
                let spacing = self.sample_spacing_ms.max(1);
                let samples = (u64::from(interval_secs) * 1000 / spacing).max(1);
                u32::try_from(samples).unwrap_or(u32::MAX)
            }
            PublishMode::Normal | PublishMode::Cheaper => self.sample_count,
        }
    }
}

/// Result of one loop iteration.
#[derive(Clone, Debug, PartialEq)]
pub struct TickOutcome {
    /// The report that was built (and published if the transport allowed).
    pub report: TelemetryReport,
    /// Safety evaluation, or `None` if the vibration sensor was unavailable.
    pub safety: Option<SafetyLevel>,
    /// Whether the telemetry publish went through.
    pub published: bool,
    /// Idle period that followed, if the rotor was stationary.
    pub idle: Option<IdleOutcome>,
}

/// The main monitoring loop.
pub struct TurbineMonitor<S, D, A, V, C, W>
where
    S: BrakeServo,
    D: Delay,
    A: Accelerometer,
    V: VoltageAdc,
    C: MqttClient,
    W: Delay,
{
    device: Arc<SharedDevice<S, D>>,
    sampler: SensorSampler<A, V>,
    reporter: ShadowUpdater<C, W>,
    publisher: TelemetryPublisher<C>,
    delay: W,
    clock: Box<dyn Clock + Send>,
    led: Option<Box<dyn StatusLed + Send>>,
    led_color: Option<LedColor>,
    buttons: Option<Box<dyn ButtonPanel + Send>>,
    identity: DeviceIdentity,
    settings: MonitorSettings,
    shutdown: Arc<AtomicBool>,
    loop_count: u64,
}

impl<S, D, A, V, C, W> TurbineMonitor<S, D, A, V, C, W>
where
    S: BrakeServo,
    D: Delay,
    A: Accelerometer,
    V: VoltageAdc,
    C: MqttClient + Clone,
    W: Delay + Clone,
{
    /// Create a monitor. `client` is cloned for shadow reports and telemetry.
    pub fn new(
        device: Arc<SharedDevice<S, D>>,
        sampler: SensorSampler<A, V>,
        client: C,
        delay: W,
        config: &Config,
    ) -> Self {
        let identity = config.identity();
        let topics = Topics::new(&identity);
        Self {
            device,
            sampler,
            reporter: ShadowUpdater::new(client.clone(), delay.clone(), &topics, config.retry_policy()),
            publisher: TelemetryPublisher::new(client, topics),
            delay,
            clock: Box::new(SystemClock),
            led: None,
            led_color: None,
            buttons: None,
            identity,
            settings: MonitorSettings::from_config(config),
            shutdown: Arc::new(AtomicBool::new(false)),
            loop_count: 0,
        }
    }
}

impl<S, D, A, V, C, W> TurbineMonitor<S, D, A, V, C, W>
where
    S: BrakeServo,
    D: Delay,
    A: Accelerometer,
    V: VoltageAdc,
    C: MqttClient,
    W: Delay,
{
    /// Attach a status LED.
    pub fn with_led(mut self, led: impl StatusLed + Send + 'static) -> Self {
        self.led = Some(Box::new(led));
        self
    }

    /// Attach the button panel.
    pub fn with_buttons(mut self, buttons: impl ButtonPanel + Send + 'static) -> Self {
        self.buttons = Some(Box::new(buttons));
        self
    }

    /// Replace the wall clock.
    pub fn with_clock(mut self, clock: impl Clock + Send + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Share a shutdown flag with a signal handler.
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    /// Override loop settings.
    pub fn with_settings(mut self, settings: MonitorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// The shutdown flag.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Shared device handle.
    pub fn device(&self) -> &Arc<SharedDevice<S, D>> {
        &self.device
    }

    /// Sensor sampler.
    pub fn sampler_mut(&mut self) -> &mut SensorSampler<A, V> {
        &mut self.sampler
    }

    /// Iterations completed so far.
    pub fn loop_count(&self) -> u64 {
        self.loop_count
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Start-up: calibrate, reset the brake, and announce the connection.
    pub fn start(&mut self) {
        info!(
            thing = %self.identity.thing_name,
            device_id = %self.identity.device_id,
            "turbine monitor starting"
        );
        self.show_led(Some(LedColor::Blue));

        if let Err(e) = self
            .sampler
            .calibrate(&mut self.delay, self.settings.calibration, &self.shutdown)
        {
            warn!(error = %e, "vibration calibration skipped");
        }

        self.request_brake(BrakeAction::Off);
        info!("turbine brake reset");

        self.reporter
            .report_local_change(CONNECTED_PARAM, json!(true), ShadowTarget::Reported);
        info!("starting turbine monitoring");
    }

    /// Run ticks until the shutdown flag is set, then shut down.
    pub fn run(&mut self) {
        self.start();
        while !self.is_shutting_down() {
            self.tick();
        }
        self.shutdown();
    }

    /// Best-effort shutdown: LED off, brake released, connection flag cleared.
    pub fn shutdown(&mut self) {
        info!("turbine monitor shutting down");
        self.show_led(None);
        self.device
            .transition_brake(BrakeAction::Off)
            .report_to(&mut self.reporter);
        self.reporter
            .report_local_change(CONNECTED_PARAM, json!(false), ShadowTarget::Reported);
    }

    // ------------------------------------------------------------------------
    // Loop
    // ------------------------------------------------------------------------

    /// One monitoring pass.
    pub fn tick(&mut self) -> TickOutcome {
        self.loop_count += 1;
        let speed = self.sampler.calculate_speed();
        let (stats, safety) = self.sample_vibration();

        let voltage = match self.sampler.read_voltage() {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, "voltage unavailable");
                None
            }
        };

        let state = self.device.snapshot();
        let report = TelemetryReport::new(&self.identity, self.clock.now_ms(), self.loop_count)
            .with_speed(speed, self.sampler.rotation_count())
            .with_voltage(voltage)
            .with_vibration(&stats)
            .with_brake_position(state.brake_position);
        info!("{report}");

        let published = match self.publisher.publish(&report, state.publish_mode) {
            Ok(()) => {
                self.flash_led();
                true
            }
            Err(e) => {
                warn!(error = %e, "telemetry dropped");
                false
            }
        };

        let idle = if speed == 0.0 && !self.is_shutting_down() {
            let sampler = &mut self.sampler;
            Some(self.settings.idle.wait(
                &mut self.delay,
                || sampler.calculate_speed(),
                &self.shutdown,
            ))
        } else {
            None
        };

        TickOutcome {
            report,
            safety,
            published,
            idle,
        }
    }

    fn sample_vibration(&mut self) -> (VibrationStats, Option<SafetyLevel>) {
        let mut stats = VibrationStats::default();
        if !self.sampler.is_vibration_sensor_available() {
            warn!("the turbine appears to be disconnected, please check the connection");
            return (stats, None);
        }

        let state = self.device.snapshot();
        let window = self
            .settings
            .window_samples(state.publish_mode, state.publish_interval_secs);
        for _ in 0..window {
            if self.is_shutting_down() {
                break;
            }
            match self.sampler.read_vibration() {
                Ok(sample) => stats.push(sample),
                Err(e) => warn!(error = %e, "vibration sample lost"),
            }
            self.check_buttons();
            self.delay.delay_ms(self.settings.sample_spacing_ms);
        }

        if stats.sample_count == 0 {
            return (stats, None);
        }

        let limit = self.device.snapshot().vibration_limit;
        let level = SafetyLevel::evaluate(stats.peak, limit);
        self.device.set_safety_state(level);
        self.show_led(Some(level.indicator()));

        if level == SafetyLevel::Unsafe
            && self.settings.auto_brake
            && self.device.snapshot().brake_state != BrakeState::On
        {
            warn!(peak = stats.peak, limit, "unsafe vibration, applying brake");
            self.request_brake(BrakeAction::On);
        }
        (stats, Some(level))
    }

    /// Poll the panel buttons once.
    pub fn check_buttons(&mut self) {
        let (reset, brake_on, aux) = match self.buttons.as_mut() {
            Some(buttons) => (
                buttons.is_pressed(Button::Reset),
                buttons.is_pressed(Button::BrakeOn),
                buttons.is_pressed(Button::Aux),
            ),
            None => return,
        };

        if reset {
            info!("manual brake reset event");
            self.request_brake(BrakeAction::Off);
        }
        if brake_on {
            info!("set brake on event");
            if self.device.snapshot().brake_state != BrakeState::On {
                self.request_brake(BrakeAction::On);
            }
        }
        if aux {
            info!("auxiliary button pressed");
        }
    }

    /// Drive the brake locally, then publish the intent to `desired`
    /// followed by the confirmed state.
    ///
    /// The servo moves before any shadow publish, so a failing transport
    /// cannot delay the brake.
    fn request_brake(&mut self, action: BrakeAction) {
        let moved = self.device.transition_brake(action);
        self.reporter.report_local_change(
            BRAKE_STATUS_PARAM,
            json!(action.as_str()),
            ShadowTarget::Desired,
        );
        moved.report_to(&mut self.reporter);
    }

    // ------------------------------------------------------------------------
    // LED
    // ------------------------------------------------------------------------

    fn show_led(&mut self, color: Option<LedColor>) {
        self.led_color = color;
        if let Some(led) = self.led.as_mut() {
            led.show(color);
        }
    }

    fn flash_led(&mut self) {
        if let Some(led) = self.led.as_mut() {
            led.show(None);
            self.delay.delay_ms(self.settings.flash_ms);
            led.show(self.led_color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_follows_mode() {
        let settings = MonitorSettings::from_config(&Config::default());
        assert_eq!(settings.window_samples(PublishMode::Normal, 5), 50);
        assert_eq!(settings.window_samples(PublishMode::Cheaper, 1), 50);
        assert_eq!(settings.window_samples(PublishMode::Faster, 2), 20);
        assert_eq!(settings.window_samples(PublishMode::Faster, 0), 1);
    }

    #[test]
    fn huge_fast_interval_saturates_window() {
        let settings = MonitorSettings::from_config(&Config::default());
        assert_eq!(settings.sample_spacing_ms, 100);
        assert_eq!(
            settings.window_samples(PublishMode::Faster, 429_496_730),
            u32::MAX
        );
        assert_eq!(
            settings.window_samples(PublishMode::Faster, u32::MAX),
            u32::MAX
        );
    }

    #[test]
    fn settings_from_config() {
        let config = Config::default().with_sample_count(10).with_auto_brake(false);
        let settings = MonitorSettings::from_config(&config);
        assert_eq!(settings.sample_count, 10);
        assert!(!settings.auto_brake);
        assert_eq!(settings.calibration.samples, 20);
        assert_eq!(settings.idle.max_polls, 12);
    }
}
