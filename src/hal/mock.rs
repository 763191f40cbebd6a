//! Mock implementations for testing without hardware.
//!
//! This module provides test doubles for all hardware and network traits,
//! enabling development and testing on desktop without a Raspberry Pi.
//!
//! # Available Mocks
//!
//! | Mock | Trait | Purpose |
//! |------|-------|---------|
//! | [`MockServo`] | [`BrakeServo`] | Records every duty-cycle write |
//! | [`MockAccelerometer`] | [`Accelerometer`] | Queued readings, can go offline |
//! | [`MockAdc`] | [`VoltageAdc`] | Fixed raw value per read |
//! | [`MockLed`] | [`StatusLed`] | Records every colour shown |
//! | [`MockButtons`] | [`ButtonPanel`] | Held or one-shot presses |
//! | [`MockDelay`] | [`Delay`] | Records delays instead of sleeping |
//! | [`MockClock`] | [`Clock`] | Controllable time source |
//! | [`MockMqtt`] | [`MqttClient`] | Captures publishes, injectable failures |
//!
//! `MockDelay` and `MockMqtt` are cheap handles over shared state: clone one,
//! hand the clone to the code under test, and inspect the original.
//!
//! # Example
//!
//! ```rust
//! use turbine_sync::brake::{BrakeAction, BrakeController};
//! use turbine_sync::config::Config;
//! use turbine_sync::hal::{MockDelay, MockServo};
//! use turbine_sync::shadow::RecordingReporter;
//!
//! let config = Config::default();
//! let delay = MockDelay::new();
//! let mut brake = BrakeController::new(MockServo::new(), delay.clone(), config.brake_settings());
//! let mut reporter = RecordingReporter::default();
//!
//! brake.transition(BrakeAction::On, &mut reporter);
//! assert_eq!(brake.servo().writes(), vec![6.5, 0.0]);
//! assert_eq!(delay.history(), vec![3000]);
//! ```
//!
//! [`BrakeServo`]: crate::traits::BrakeServo
//! [`Accelerometer`]: crate::traits::Accelerometer
//! [`VoltageAdc`]: crate::traits::VoltageAdc
//! [`StatusLed`]: crate::traits::StatusLed
//! [`ButtonPanel`]: crate::traits::ButtonPanel
//! [`Delay`]: crate::traits::Delay
//! [`Clock`]: crate::traits::Clock
//! [`MqttClient`]: crate::traits::MqttClient

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::traits::{
    Accelerometer, BrakeServo, Button, ButtonPanel, Clock, Delay, LedColor, MqttClient,
    MqttMessage, QosLevel, StatusLed, Vector3, VoltageAdc,
};

/// Error returned by mocks configured to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MockError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Hardware Mocks
// ============================================================================

/// Mock brake servo.
///
/// Records every duty-cycle write. Set `offline` to make writes fail, which
/// simulates a disconnected actuation primitive.
#[derive(Debug, Default)]
pub struct MockServo {
    writes: Vec<f32>,
    /// When true, every write fails with [`MockError`].
    pub offline: bool,
}

impl MockServo {
    /// Creates a servo that accepts writes.
    pub fn new() -> Self {
        Self::default()
    }

    /// All duty cycles written so far, in order.
    pub fn writes(&self) -> Vec<f32> {
        self.writes.clone()
    }

    /// Number of writes that actually moved the servo (non-zero duty).
    pub fn movement_count(&self) -> usize {
        self.writes.iter().filter(|d| **d != 0.0).count()
    }

    /// Last written duty cycle.
    pub fn last_duty(&self) -> Option<f32> {
        self.writes.last().copied()
    }
}

impl BrakeServo for MockServo {
    type Error = MockError;

    fn set_duty_cycle(&mut self, duty: f32) -> Result<(), MockError> {
        if self.offline {
            return Err(MockError);
        }
        self.writes.push(duty);
        Ok(())
    }
}

/// Mock accelerometer.
///
/// Queued readings are returned first (FIFO); after that every read returns
/// the resting value. Set `offline` to simulate an unplugged sensor.
#[derive(Debug, Default)]
pub struct MockAccelerometer {
    queue: VecDeque<Vector3>,
    resting: Vector3,
    /// When true, every read fails with [`MockError`].
    pub offline: bool,
    reads: usize,
}

impl MockAccelerometer {
    /// Creates a sensor resting at zero on all axes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sensor that reports `resting` whenever the queue is empty.
    pub fn resting_at(resting: Vector3) -> Self {
        Self {
            resting,
            ..Self::default()
        }
    }

    /// Queue a reading to be returned before the resting value.
    pub fn queue(&mut self, reading: Vector3) {
        self.queue.push_back(reading);
    }

    /// Number of successful reads.
    pub fn reads(&self) -> usize {
        self.reads
    }
}

impl Accelerometer for MockAccelerometer {
    type Error = MockError;

    fn read_acceleration(&mut self) -> Result<Vector3, MockError> {
        if self.offline {
            return Err(MockError);
        }
        self.reads += 1;
        Ok(self.queue.pop_front().unwrap_or(self.resting))
    }
}

/// Mock ADC returning the same raw value on every channel.
#[derive(Debug, Default)]
pub struct MockAdc {
    /// Raw reading returned by every channel.
    pub raw: u16,
    /// When true, every read fails with [`MockError`].
    pub offline: bool,
}

impl MockAdc {
    /// Creates an ADC reporting `raw`.
    pub fn with_raw(raw: u16) -> Self {
        Self { raw, offline: false }
    }
}

impl VoltageAdc for MockAdc {
    type Error = MockError;

    fn read_channel(&mut self, _channel: u8) -> Result<u16, MockError> {
        if self.offline {
            Err(MockError)
        } else {
            Ok(self.raw)
        }
    }
}

/// Mock status LED. Clones share the same history.
#[derive(Clone, Debug, Default)]
pub struct MockLed {
    history: Arc<Mutex<Vec<Option<LedColor>>>>,
}

impl MockLed {
    /// Creates an LED with an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every colour shown so far (`None` = off).
    pub fn history(&self) -> Vec<Option<LedColor>> {
        lock(&self.history).clone()
    }

    /// The colour currently shown.
    pub fn current(&self) -> Option<LedColor> {
        lock(&self.history).last().copied().flatten()
    }
}

impl StatusLed for MockLed {
    fn show(&mut self, color: Option<LedColor>) {
        lock(&self.history).push(color);
    }
}

/// Mock button panel. Clones share the same state.
///
/// Held buttons read as pressed on every poll; one-shot presses read as
/// pressed exactly once.
#[derive(Clone, Debug, Default)]
pub struct MockButtons {
    held: Arc<Mutex<Vec<Button>>>,
    once: Arc<Mutex<Vec<Button>>>,
}

impl MockButtons {
    /// Creates a panel with nothing pressed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `button` down until [`release`](Self::release).
    pub fn hold(&self, button: Button) {
        lock(&self.held).push(button);
    }

    /// Release a held button.
    pub fn release(&self, button: Button) {
        lock(&self.held).retain(|b| *b != button);
    }

    /// Press `button` for a single poll.
    pub fn press_once(&self, button: Button) {
        lock(&self.once).push(button);
    }
}

impl ButtonPanel for MockButtons {
    fn is_pressed(&mut self, button: Button) -> bool {
        let mut once = lock(&self.once);
        if let Some(index) = once.iter().position(|b| *b == button) {
            once.remove(index);
            return true;
        }
        lock(&self.held).contains(&button)
    }
}

type DelayHook = Box<dyn FnMut(u64) + Send>;

/// Mock delay that records instead of sleeping. Clones share the history.
///
/// An optional hook runs on every delay, which lets a test change the world
/// "while time passes" (e.g. pulse the rotation sensor during idle backoff).
#[derive(Clone, Default)]
pub struct MockDelay {
    history: Arc<Mutex<Vec<u64>>>,
    hook: Arc<Mutex<Option<DelayHook>>>,
}

impl core::fmt::Debug for MockDelay {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MockDelay")
            .field("history", &self.history())
            .finish_non_exhaustive()
    }
}

impl MockDelay {
    /// Creates a delay with an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// All delays requested so far, in milliseconds.
    pub fn history(&self) -> Vec<u64> {
        lock(&self.history).clone()
    }

    /// Sum of all delays requested so far.
    pub fn total_ms(&self) -> u64 {
        lock(&self.history).iter().sum()
    }

    /// Forget recorded delays.
    pub fn clear(&self) {
        lock(&self.history).clear();
    }

    /// Run `hook` with the requested duration on every delay.
    pub fn on_delay(&self, hook: impl FnMut(u64) + Send + 'static) {
        *lock(&self.hook) = Some(Box::new(hook));
    }
}

impl Delay for MockDelay {
    fn delay_ms(&mut self, ms: u64) {
        lock(&self.history).push(ms);
        if let Some(hook) = lock(&self.hook).as_mut() {
            hook(ms);
        }
    }
}

/// Mock clock.
#[derive(Debug, Default)]
pub struct MockClock {
    current_ms: u64,
}

impl MockClock {
    /// Creates a clock at `ms`.
    pub fn at(ms: u64) -> Self {
        Self { current_ms: ms }
    }

    /// Set the current time.
    pub fn set(&mut self, ms: u64) {
        self.current_ms = ms;
    }

    /// Advance time by `ms`.
    pub fn advance(&mut self, ms: u64) {
        self.current_ms += ms;
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.current_ms
    }
}

// ============================================================================
// Network Mocks
// ============================================================================

/// A message captured by [`MockMqtt`].
#[derive(Clone, Debug, PartialEq)]
pub struct PublishedMessage {
    /// Destination topic.
    pub topic: String,
    /// Raw payload.
    pub payload: Vec<u8>,
    /// Requested delivery guarantee.
    pub qos: QosLevel,
}

impl PublishedMessage {
    /// Payload parsed as JSON (`Value::Null` if it is not JSON).
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Default)]
struct MockMqttInner {
    published: Vec<PublishedMessage>,
    subscriptions: Vec<String>,
    incoming: VecDeque<MqttMessage>,
    connected: bool,
    fail_remaining: u32,
    always_fail: bool,
    attempts: u32,
}

/// Mock MQTT client. Clones share the same broker view.
#[derive(Clone, Debug)]
pub struct MockMqtt {
    inner: Arc<Mutex<MockMqttInner>>,
}

impl Default for MockMqtt {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMqtt {
    /// Creates a connected client.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockMqttInner {
                connected: true,
                ..Default::default()
            })),
        }
    }

    /// Make the next `n` publishes fail.
    pub fn fail_next(&self, n: u32) {
        lock(&self.inner).fail_remaining = n;
    }

    /// Make every publish fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        lock(&self.inner).always_fail = failing;
    }

    /// Set the reported connection state.
    pub fn set_connected(&self, connected: bool) {
        lock(&self.inner).connected = connected;
    }

    /// Queue an inbound message for `try_recv`.
    pub fn queue_message(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) {
        lock(&self.inner)
            .incoming
            .push_back(MqttMessage::new(topic, payload));
    }

    /// Every successful publish, in order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.inner).published.clone()
    }

    /// Successful publishes to `topic`.
    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        lock(&self.inner)
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Publish attempts, including failed ones.
    pub fn attempts(&self) -> u32 {
        lock(&self.inner).attempts
    }

    /// Forget captured publishes and attempts.
    pub fn clear(&self) {
        let mut inner = lock(&self.inner);
        inner.published.clear();
        inner.attempts = 0;
    }

    /// Whether `topic` was subscribed.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        lock(&self.inner).subscriptions.iter().any(|t| t == topic)
    }
}

impl MqttClient for MockMqtt {
    type Error = MockError;

    fn publish(&mut self, topic: &str, payload: &[u8], qos: QosLevel) -> Result<(), MockError> {
        let mut inner = lock(&self.inner);
        inner.attempts += 1;
        if inner.always_fail {
            return Err(MockError);
        }
        if inner.fail_remaining > 0 {
            inner.fail_remaining -= 1;
            return Err(MockError);
        }
        inner.published.push(PublishedMessage {
            topic: topic.into(),
            payload: payload.to_vec(),
            qos,
        });
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), MockError> {
        lock(&self.inner).subscriptions.push(topic.into());
        Ok(())
    }

    fn try_recv(&mut self) -> Option<MqttMessage> {
        lock(&self.inner).incoming.pop_front()
    }

    fn is_connected(&self) -> bool {
        lock(&self.inner).connected
    }
}
