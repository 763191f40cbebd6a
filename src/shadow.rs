//! Device shadow synchronisation.
//!
//! Two halves:
//!
//! - [`ShadowUpdater`] publishes local changes into the shadow document,
//!   retrying failed publishes a bounded number of times. After the last
//!   retry it gives up; local state is never rolled back.
//! - [`ShadowSyncEngine`] consumes inbound messages (deltas, commands,
//!   update responses) and applies them to the shared device.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use turbine_sync::brake::{BrakeController, BrakeState};
//! use turbine_sync::config::Config;
//! use turbine_sync::device::SharedDevice;
//! use turbine_sync::hal::{MockDelay, MockMqtt, MockServo};
//! use turbine_sync::shadow::{ShadowSyncEngine, ShadowUpdater};
//! use turbine_sync::topics::Topics;
//!
//! let config = Config::default().with_thing_name("t1");
//! let topics = Topics::new(&config.identity());
//! let brake = BrakeController::new(MockServo::new(), MockDelay::new(), config.brake_settings());
//! let device = Arc::new(SharedDevice::new(brake, &config));
//!
//! let mqtt = MockMqtt::new();
//! let updater = ShadowUpdater::new(mqtt.clone(), MockDelay::new(), &topics, config.retry_policy());
//! let mut engine = ShadowSyncEngine::new(Arc::clone(&device), updater, topics.clone());
//!
//! engine.on_remote_delta(br#"{"state": {"brake_status": "ON"}}"#).unwrap();
//!
//! assert_eq!(device.snapshot().brake_state, BrakeState::On);
//! let reports = mqtt.published_to(topics.shadow_update());
//! assert_eq!(reports.len(), 1);
//! assert_eq!(reports[0].json()["state"]["reported"]["brake_status"], "ON");
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::brake::BRAKE_STATUS_PARAM;
use crate::device::SharedDevice;
use crate::messages::{
    parse_brake_command, parse_delta, shadow_update_payload, DeltaChange, PayloadError,
    RejectedResponse, ShadowTarget,
};
use crate::topics::{InboundTopic, Topics};
use crate::traits::{BrakeServo, Delay, MqttClient, MqttMessage, QosLevel};

/// Anything that can push a local change into the shadow document.
pub trait ShadowReporter {
    /// Publish `{"state": {target: {param: value}}}` and return `value`.
    ///
    /// Never fails from the caller's point of view: transport errors are
    /// retried and then dropped.
    fn report_local_change(&mut self, param: &str, value: Value, target: ShadowTarget) -> Value;
}

/// Reporter that keeps every change in memory instead of publishing it.
#[derive(Debug, Default, Clone)]
pub struct RecordingReporter {
    reports: Vec<(String, Value, ShadowTarget)>,
}

impl RecordingReporter {
    /// Every change reported so far.
    pub fn reports(&self) -> &[(String, Value, ShadowTarget)] {
        &self.reports
    }

    /// Replay every recorded change, in order, through `reporter`.
    pub fn forward<R: ShadowReporter + ?Sized>(self, reporter: &mut R) {
        for (param, value, target) in self.reports {
            reporter.report_local_change(&param, value, target);
        }
    }
}

impl ShadowReporter for RecordingReporter {
    fn report_local_change(&mut self, param: &str, value: Value, target: ShadowTarget) -> Value {
        self.reports.push((param.to_string(), value.clone(), target));
        value
    }
}

// ============================================================================
// Shadow Updater
// ============================================================================

/// Retry ceiling for shadow updates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Pause between attempts.
    pub retry_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_delay_ms: 1000,
        }
    }
}

/// Publishes shadow updates with bounded retries.
pub struct ShadowUpdater<C: MqttClient, W: Delay> {
    client: C,
    delay: W,
    topic: String,
    policy: RetryPolicy,
}

impl<C: MqttClient, W: Delay> ShadowUpdater<C, W> {
    /// Create an updater publishing to the device's shadow update topic.
    pub fn new(client: C, delay: W, topics: &Topics, policy: RetryPolicy) -> Self {
        Self {
            client,
            delay,
            topic: topics.shadow_update().to_string(),
            policy,
        }
    }

    /// The underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Mutable access to the underlying client.
    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    /// Active retry policy.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Publish one update, retrying on failure.
    ///
    /// Returns `true` if the broker accepted the publish.
    pub fn publish_update(&mut self, param: &str, value: &Value, target: ShadowTarget) -> bool {
        let payload = shadow_update_payload(param, value.clone(), target).to_string();
        let mut attempt: u32 = 0;
        loop {
            match self
                .client
                .publish(&self.topic, payload.as_bytes(), QosLevel::AtLeastOnce)
            {
                Ok(()) => {
                    debug!(param, target = target.as_str(), %value, "shadow update sent");
                    return true;
                }
                Err(e) => {
                    attempt += 1;
                    warn!(param, attempt, error = ?e, "shadow update failed");
                    if attempt > self.policy.max_retries {
                        error!(param, attempts = attempt, "shadow update abandoned");
                        return false;
                    }
                    self.delay.delay_ms(self.policy.retry_delay_ms);
                }
            }
        }
    }
}

impl<C: MqttClient, W: Delay> ShadowReporter for ShadowUpdater<C, W> {
    fn report_local_change(&mut self, param: &str, value: Value, target: ShadowTarget) -> Value {
        self.publish_update(param, &value, target);
        value
    }
}

// ============================================================================
// Shadow Sync Engine
// ============================================================================

/// Applies inbound shadow deltas and commands to the shared device.
///
/// This is the only writer of device fields that originate remotely.
pub struct ShadowSyncEngine<S, D, C, W>
where
    S: BrakeServo,
    D: Delay,
    C: MqttClient,
    W: Delay,
{
    device: Arc<SharedDevice<S, D>>,
    updater: ShadowUpdater<C, W>,
    topics: Topics,
}

impl<S, D, C, W> ShadowSyncEngine<S, D, C, W>
where
    S: BrakeServo,
    D: Delay,
    C: MqttClient,
    W: Delay,
{
    /// Create an engine.
    pub fn new(
        device: Arc<SharedDevice<S, D>>,
        updater: ShadowUpdater<C, W>,
        topics: Topics,
    ) -> Self {
        Self {
            device,
            updater,
            topics,
        }
    }

    /// Shared device handle.
    pub fn device(&self) -> &Arc<SharedDevice<S, D>> {
        &self.device
    }

    /// Updater used for acknowledgements.
    pub fn updater_mut(&mut self) -> &mut ShadowUpdater<C, W> {
        &mut self.updater
    }

    /// Subscribe to every inbound topic through the updater's client.
    pub fn subscribe(&mut self) -> Result<(), C::Error> {
        for topic in self.topics.subscriptions() {
            self.updater.client_mut().subscribe(topic)?;
        }
        Ok(())
    }

    /// Drain and handle every message waiting on the client.
    ///
    /// Returns the number of messages handled.
    pub fn poll(&mut self) -> usize {
        let mut handled = 0;
        while let Some(message) = self.updater.client_mut().try_recv() {
            self.on_message(&message);
            handled += 1;
        }
        handled
    }

    /// Poll until `shutdown` is set, pausing `idle_ms` whenever the inbox is empty.
    pub fn run<I: Delay + ?Sized>(&mut self, shutdown: &AtomicBool, idle: &mut I, idle_ms: u64) {
        info!("shadow dispatcher started");
        while !shutdown.load(Ordering::Acquire) {
            if self.poll() == 0 {
                idle.delay_ms(idle_ms);
            }
        }
        info!("shadow dispatcher stopped");
    }

    /// Route one inbound message by topic.
    pub fn on_message(&mut self, message: &MqttMessage) {
        match self.topics.classify(&message.topic) {
            InboundTopic::ShadowDelta => {
                if let Ok(changes) = self.on_remote_delta(&message.payload) {
                    debug!(applied = changes.len(), "shadow delta handled");
                }
            }
            InboundTopic::ShadowAccepted => {
                info!("shadow update accepted");
            }
            InboundTopic::ShadowRejected => {
                let response: RejectedResponse =
                    serde_json::from_slice(&message.payload).unwrap_or_default();
                error!(
                    code = ?response.code,
                    reason = response.message.as_deref().unwrap_or(""),
                    "shadow update rejected"
                );
            }
            InboundTopic::Command(suffix) => {
                if self.on_command(&suffix, &message.payload).is_ok() {
                    debug!(command = %suffix, "command handled");
                }
            }
            InboundTopic::Unknown => {
                debug!(topic = %message.topic, "ignoring message on unexpected topic");
            }
        }
    }

    /// Apply a shadow delta.
    ///
    /// The payload is fully decoded and checked before anything is applied.
    /// Each change is then applied in order and acknowledged into `reported`.
    pub fn on_remote_delta(&mut self, payload: &[u8]) -> Result<Vec<DeltaChange>, PayloadError> {
        let changes = parse_delta(payload)
            .and_then(|changes| self.check_calibration(changes))
            .map_err(|e| {
                let text = String::from_utf8_lossy(payload);
                error!(error = %e, payload = %text, "discarding shadow delta");
                e
            })?;

        info!(count = changes.len(), "applying shadow delta");
        for change in &changes {
            self.apply(*change);
        }
        Ok(changes)
    }

    /// Handle a command published under the device's command prefix.
    pub fn on_command(&mut self, suffix: &str, payload: &[u8]) -> Result<(), PayloadError> {
        if suffix != "brake" {
            let e = PayloadError::UnknownCommand(suffix.to_string());
            warn!(error = %e, "discarding command");
            return Err(e);
        }

        let command = parse_brake_command(payload).map_err(|e| {
            let text = String::from_utf8_lossy(payload);
            error!(error = %e, payload = %text, "discarding brake command");
            e
        })?;

        info!(
            position = ?command.position,
            duration_secs = command.duration_secs,
            return_to_off = command.return_to_off,
            "brake command"
        );
        let result = self.device.with_brake(|brake| {
            brake.request_timed_move(command.position, command.duration_secs, command.return_to_off)
        });
        if let Err(e) = result {
            error!(error = %e, "brake command failed");
        }
        Ok(())
    }

    fn check_calibration(&self, changes: Vec<DeltaChange>) -> Result<Vec<DeltaChange>, PayloadError> {
        for change in &changes {
            if let DeltaChange::BrakeOnPwm(duty) | DeltaChange::BrakeOffPwm(duty) = *change {
                self.device
                    .with_brake(|brake| brake.check_duty(duty))
                    .map_err(|e| PayloadError::InvalidValue {
                        field: change.param(),
                        value: e.to_string(),
                    })?;
            }
        }
        Ok(changes)
    }

    fn apply(&mut self, change: DeltaChange) {
        match change {
            DeltaChange::BrakeStatus(action) => {
                let moved = self.device.transition_brake(action);
                let (before, after) = (moved.before, moved.after);
                moved.report_to(&mut self.updater);
                if after != action.target_state() {
                    warn!(brake = action.as_str(), "brake did not reach requested state");
                } else if before == after {
                    // Already there, so transition() reported nothing.
                    self.updater.report_local_change(
                        BRAKE_STATUS_PARAM,
                        change.reported_value(),
                        ShadowTarget::Reported,
                    );
                }
                return;
            }
            DeltaChange::DataPath(mode) => {
                self.device.with_state(|s| s.publish_mode = mode);
                info!(mode = mode.as_str(), "publish mode changed");
            }
            DeltaChange::DataFastInterval(secs) => {
                self.device.with_state(|s| s.publish_interval_secs = secs);
                info!(secs, "publish interval changed");
            }
            DeltaChange::VibeLimit(limit) => {
                self.device.with_state(|s| s.vibration_limit = limit);
                info!(limit, "vibration limit changed");
            }
            DeltaChange::BrakeOnPwm(duty) => {
                if let Err(e) = self.device.with_brake(|b| b.set_on_position(duty)) {
                    error!(error = %e, "brake on-position rejected");
                    return;
                }
            }
            DeltaChange::BrakeOffPwm(duty) => {
                if let Err(e) = self.device.with_brake(|b| b.set_off_position(duty)) {
                    error!(error = %e, "brake off-position rejected");
                    return;
                }
            }
        }
        self.updater
            .report_local_change(change.param(), change.reported_value(), ShadowTarget::Reported);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{MockDelay, MockMqtt};
    use serde_json::json;

    fn updater(mqtt: &MockMqtt, delay: &MockDelay, retries: u32) -> ShadowUpdater<MockMqtt, MockDelay> {
        let topics = Topics::new(&crate::config::Config::default().with_thing_name("t1").identity());
        ShadowUpdater::new(
            mqtt.clone(),
            delay.clone(),
            &topics,
            RetryPolicy {
                max_retries: retries,
                retry_delay_ms: 1000,
            },
        )
    }

    #[test]
    fn update_payload_and_qos() {
        let mqtt = MockMqtt::new();
        let mut up = updater(&mqtt, &MockDelay::new(), 10);

        let v = up.report_local_change("vibe_limit", json!(4.0), ShadowTarget::Reported);
        assert_eq!(v, json!(4.0));

        let sent = mqtt.published_to("$aws/things/t1/shadow/update");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].qos, QosLevel::AtLeastOnce);
        assert_eq!(sent[0].json(), json!({"state": {"reported": {"vibe_limit": 4.0}}}));
    }

    #[test]
    fn transient_failure_is_retried() {
        let mqtt = MockMqtt::new();
        let delay = MockDelay::new();
        let mut up = updater(&mqtt, &delay, 10);
        mqtt.fail_next(2);

        assert!(up.publish_update("connected", &json!(true), ShadowTarget::Reported));
        assert_eq!(mqtt.attempts(), 3);
        assert_eq!(mqtt.published().len(), 1);
        assert_eq!(delay.history(), vec![1000, 1000]);
    }

    #[test]
    fn gives_up_after_retry_ceiling() {
        let mqtt = MockMqtt::new();
        let delay = MockDelay::new();
        let mut up = updater(&mqtt, &delay, 10);
        mqtt.set_failing(true);

        let v = up.report_local_change("brake_status", json!("ON"), ShadowTarget::Desired);
        assert_eq!(v, json!("ON"));
        assert_eq!(mqtt.attempts(), 11);
        assert_eq!(delay.history().len(), 10);
        assert!(mqtt.published().is_empty());
    }

    #[test]
    fn zero_retries_means_single_attempt() {
        let mqtt = MockMqtt::new();
        let delay = MockDelay::new();
        let mut up = updater(&mqtt, &delay, 0);
        mqtt.set_failing(true);

        assert!(!up.publish_update("x", &json!(1), ShadowTarget::Reported));
        assert_eq!(mqtt.attempts(), 1);
        assert!(delay.history().is_empty());
    }

    #[test]
    fn recording_reporter_forwards_in_order() {
        let mqtt = MockMqtt::new();
        let mut up = updater(&mqtt, &MockDelay::new(), 0);
        let mut r = RecordingReporter::default();
        r.report_local_change("a", json!(1), ShadowTarget::Desired);
        r.report_local_change("b", json!(2), ShadowTarget::Reported);

        r.forward(&mut up);

        let sent: Vec<_> = mqtt.published().iter().map(|m| m.json()["state"].clone()).collect();
        assert_eq!(sent, vec![json!({"desired": {"a": 1}}), json!({"reported": {"b": 2}})]);
    }

    #[test]
    fn recording_reporter_keeps_order() {
        let mut r = RecordingReporter::default();
        r.report_local_change("a", json!(1), ShadowTarget::Desired);
        r.report_local_change("b", json!(2), ShadowTarget::Reported);
        assert_eq!(r.reports()[0].0, "a");
        assert_eq!(r.reports()[1].2, ShadowTarget::Reported);
    }
}
