//! Network abstraction trait for the MQTT broker connection.
//!
//! The shadow engine and the telemetry publisher only need to publish,
//! subscribe, and check liveness. Everything broker-specific (TLS, reconnect
//! backoff, offline queueing) lives behind this trait in
//! `services::mqtt`.
//!
//! # Topics
//!
//! ```text
//! $aws/things/<thing>/shadow/update          - shadow updates (outbound)
//! $aws/things/<thing>/shadow/update/delta    - desired/reported deltas
//! cmd/<group>/<class>/<thing>/#              - direct commands
//! dt/<group>/<class>/<thing>[/faster]        - telemetry (outbound)
//! ```

/// MQTT delivery guarantee for an outbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QosLevel {
    /// Fire and forget (telemetry).
    AtMostOnce,
    /// Acknowledged delivery (shadow updates).
    AtLeastOnce,
}

/// MQTT client trait for pub/sub messaging.
///
/// This trait uses a **sync-first design**: the control loop blocks on
/// settle times and shadow retries anyway, so the client is driven from
/// plain threads. Desktop implementations wrap an async client and hand
/// messages across a channel.
///
/// # Implementation Notes
///
/// - `publish` must not block on the network; it may queue while offline
/// - A failed `publish` is treated as transient and retried by the caller
/// - `try_recv` is non-blocking for polling patterns
///
/// # Example
///
/// ```rust
/// use turbine_sync::traits::{MqttClient, QosLevel};
/// use turbine_sync::hal::MockMqtt;
///
/// let mut client = MockMqtt::new();
/// client.publish("dt/windfarm/turbine/t1", b"{}", QosLevel::AtMostOnce).unwrap();
/// assert_eq!(client.published_to("dt/windfarm/turbine/t1").len(), 1);
/// ```
pub trait MqttClient {
    /// Error type for MQTT operations.
    type Error: core::fmt::Debug;

    /// Publish a message to a topic.
    fn publish(&mut self, topic: &str, payload: &[u8], qos: QosLevel) -> Result<(), Self::Error>;

    /// Subscribe to a topic. Supports wildcards: `cmd/windfarm/turbine/t1/#`.
    fn subscribe(&mut self, topic: &str) -> Result<(), Self::Error>;

    /// Try to receive the next message (non-blocking).
    fn try_recv(&mut self) -> Option<MqttMessage>;

    /// Check if connected to broker.
    fn is_connected(&self) -> bool;
}

/// An MQTT message received from a subscription.
#[derive(Clone, Debug, PartialEq)]
pub struct MqttMessage {
    /// Topic the message was published to.
    pub topic: String,
    /// Message payload as raw bytes.
    pub payload: Vec<u8>,
}

impl MqttMessage {
    /// Create a new MQTT message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Returns the payload as a UTF-8 string, if valid.
    pub fn payload_str(&self) -> Option<&str> {
        core::str::from_utf8(&self.payload).ok()
    }
}
