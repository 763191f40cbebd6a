//! MQTT transport for the device, built on `rumqttc` over mutual TLS.
//!
//! [`connect`] opens the session and returns an [`IotClient`], a cheap
//! cloneable handle that implements the sync [`MqttClient`] trait so the
//! monitoring loop and the shadow dispatcher can use it from plain threads.
//!
//! **Subscribe Topics** (queued before the CONNACK is awaited):
//! - `$aws/things/<thing>/shadow/update/delta`
//! - `$aws/things/<thing>/shadow/update/accepted`
//! - `$aws/things/<thing>/shadow/update/rejected`
//! - `cmd/<group>/<class>/<thing>/#`
//!
//! # Background tasks
//!
//! - **Forwarder**: drains an unbounded queue into `AsyncClient::publish`.
//!   Publishes made while the broker is unreachable wait in that queue.
//! - **Event loop**: polls `rumqttc`, forwards inbound publishes to the
//!   handle's inbox, reconnects with exponential backoff, and resubscribes
//!   after every reconnect.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, PoisonError};
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    Transport,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::device::ConnectionStatus;
use crate::topics::Topics;
use crate::traits::{MqttClient, MqttMessage, QosLevel};

/// Callback invoked on every connection status change.
pub type StatusListener = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// Errors while establishing the broker session.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// A certificate or key file could not be read.
    #[error("cannot read {path}: {source}")]
    Credentials {
        /// File that failed.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The client request queue rejected a subscription.
    #[error("client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),
    /// Every attempt failed or timed out.
    #[error("no connection after {attempts} attempt(s)")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
    },
}

/// Errors from the sync [`MqttClient`] handle.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The background tasks have stopped.
    #[error("transport closed")]
    Closed,
    /// The subscription could not be queued.
    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

// ============================================================================
// Configuration
// ============================================================================

/// Exponential reconnect backoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectBackoff {
    /// First delay.
    pub initial: Duration,
    /// Delay ceiling.
    pub max: Duration,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(20),
        }
    }
}

impl ReconnectBackoff {
    /// Fresh delay sequence.
    pub fn start(&self) -> BackoffState {
        BackoffState {
            policy: *self,
            next: self.initial,
        }
    }
}

/// Position in a [`ReconnectBackoff`] sequence.
#[derive(Clone, Copy, Debug)]
pub struct BackoffState {
    policy: ReconnectBackoff,
    next: Duration,
}

impl BackoffState {
    /// Delay before the next reconnect; doubles up to the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.policy.max);
        delay
    }

    /// Back to the initial delay after a successful connect.
    pub fn reset(&mut self) {
        self.next = self.policy.initial;
    }
}

/// Broker host and port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// Hostname or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

/// Everything needed to open one broker session.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// MQTT client ID (the thing name).
    pub client_id: String,
    /// Broker endpoint.
    pub endpoint: Endpoint,
    /// PEM root CA.
    pub ca: Vec<u8>,
    /// PEM device certificate.
    pub cert: Vec<u8>,
    /// PEM device private key.
    pub key: Vec<u8>,
    /// MQTT keep-alive.
    pub keep_alive: Duration,
    /// Per-attempt connect timeout.
    pub timeout: Duration,
    /// Attempts per [`connect`] call.
    pub retry_limit: u32,
    /// Reconnect backoff after the session is up.
    pub backoff: ReconnectBackoff,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("client_id", &self.client_id)
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .field("retry_limit", &self.retry_limit)
            .finish_non_exhaustive()
    }
}

impl ConnectionConfig {
    /// Read credentials and connection settings for the cloud endpoint.
    pub async fn load(config: &Config) -> Result<Self, ConnectError> {
        let conn = &config.runtime.connection;
        Ok(Self {
            client_id: config.identity().thing_name,
            endpoint: Endpoint {
                host: config.device_thing.end_point.clone(),
                port: config.device_thing.mqtt_port,
            },
            ca: read_credential(&config.ca_file()).await?,
            cert: read_credential(&config.cert_file()).await?,
            key: read_credential(&config.key_file()).await?,
            keep_alive: Duration::from_secs(conn.keep_alive_sec),
            timeout: Duration::from_secs(conn.timeout_sec),
            retry_limit: conn.retry_limit.max(1),
            backoff: ReconnectBackoff {
                initial: Duration::from_secs(conn.reconnect_initial_sec),
                max: Duration::from_secs(conn.reconnect_max_sec),
            },
        })
    }

    /// Same credentials, different endpoint and CA (Greengrass core).
    pub fn for_core(&self, endpoint: Endpoint, ca: Vec<u8>) -> Self {
        Self {
            endpoint,
            ca,
            retry_limit: 1,
            ..self.clone()
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options =
            MqttOptions::new(&self.client_id, &self.endpoint.host, self.endpoint.port);
        options.set_keep_alive(self.keep_alive);
        options.set_transport(Transport::tls(
            self.ca.clone(),
            Some((self.cert.clone(), self.key.clone())),
            None,
        ));
        options
    }
}

async fn read_credential(path: &Path) -> Result<Vec<u8>, ConnectError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| ConnectError::Credentials {
            path: path.display().to_string(),
            source,
        })
}

// ============================================================================
// Client handle
// ============================================================================

enum Outbound {
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
    },
    Disconnect,
}

/// Cloneable sync handle to the broker session.
#[derive(Clone)]
pub struct IotClient {
    client: AsyncClient,
    outbound: mpsc::UnboundedSender<Outbound>,
    inbox: Arc<Mutex<std_mpsc::Receiver<MqttMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    connected: Arc<AtomicBool>,
}

impl IotClient {
    /// Wrap a connected `AsyncClient` and start the forwarder task.
    fn spawn(
        client: AsyncClient,
        inbox: std_mpsc::Receiver<MqttMessage>,
        subscriptions: Vec<String>,
        connected: Arc<AtomicBool>,
    ) -> Self {
        let (outbound, mut queue) = mpsc::unbounded_channel::<Outbound>();
        let forwarder = client.clone();
        tokio::spawn(async move {
            while let Some(item) = queue.recv().await {
                match item {
                    Outbound::Publish {
                        topic,
                        payload,
                        qos,
                    } => {
                        if let Err(e) = forwarder.publish(topic, qos, false, payload).await {
                            error!(error = %e, "publish dropped, event loop gone");
                            break;
                        }
                    }
                    Outbound::Disconnect => {
                        let _ = forwarder.disconnect().await;
                        break;
                    }
                }
            }
            debug!("publish forwarder stopped");
        });

        Self {
            client,
            outbound,
            inbox: Arc::new(Mutex::new(inbox)),
            subscriptions: Arc::new(Mutex::new(subscriptions)),
            connected,
        }
    }

    /// Flush queued publishes, close the session, and wait up to `grace`.
    pub async fn disconnect(&self, grace: Duration) {
        if self.outbound.send(Outbound::Disconnect).is_err() {
            return;
        }
        let connected = Arc::clone(&self.connected);
        let closed = tokio::time::timeout(grace, async move {
            while connected.load(Ordering::Acquire) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        match closed {
            Ok(()) => info!("disconnected from broker"),
            Err(_) => warn!("broker disconnect timed out"),
        }
    }
}

impl MqttClient for IotClient {
    type Error = TransportError;

    fn publish(&mut self, topic: &str, payload: &[u8], qos: QosLevel) -> Result<(), TransportError> {
        self.outbound
            .send(Outbound::Publish {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                qos: to_qos(qos),
            })
            .map_err(|_| TransportError::Closed)
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client
            .try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(topic.to_string());
        Ok(())
    }

    fn try_recv(&mut self) -> Option<MqttMessage> {
        self.inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_recv()
            .ok()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

fn to_qos(qos: QosLevel) -> QoS {
    match qos {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
    }
}

// ============================================================================
// Connect
// ============================================================================

/// Open a session, retrying up to `settings.retry_limit` times.
///
/// Subscriptions for `topics` are queued before the CONNACK is awaited so no
/// delta published right after the connect is missed.
pub async fn connect(
    settings: &ConnectionConfig,
    topics: &Topics,
    status: StatusListener,
) -> Result<IotClient, ConnectError> {
    let subscriptions: Vec<String> = topics.subscriptions().iter().map(|t| t.to_string()).collect();

    for attempt in 1..=settings.retry_limit {
        status(ConnectionStatus::Connecting);
        info!(
            host = %settings.endpoint.host,
            port = settings.endpoint.port,
            attempt,
            "connecting to broker"
        );

        let (client, mut eventloop) = AsyncClient::new(settings.options(), 64);
        for topic in &subscriptions {
            client.subscribe(topic.as_str(), QoS::AtLeastOnce).await?;
        }

        match tokio::time::timeout(settings.timeout, wait_for_connack(&mut eventloop)).await {
            Ok(Ok(())) => {
                info!(topics = ?subscriptions, "broker connected");
                let connected = Arc::new(AtomicBool::new(true));
                let (inbox_tx, inbox_rx) = std_mpsc::channel();
                let handle =
                    IotClient::spawn(client, inbox_rx, subscriptions, Arc::clone(&connected));
                status(ConnectionStatus::Connected);
                tokio::spawn(drive_event_loop(
                    eventloop,
                    handle.clone(),
                    inbox_tx,
                    settings.backoff,
                    status,
                ));
                return Ok(handle);
            }
            Ok(Err(e)) => warn!(attempt, error = %e, "connect attempt failed"),
            Err(_) => warn!(attempt, timeout = ?settings.timeout, "connect attempt timed out"),
        }
        status(ConnectionStatus::Disconnected);
    }

    Err(ConnectError::Exhausted {
        attempts: settings.retry_limit,
    })
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), rumqttc::ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(ack)) = eventloop.poll().await? {
            if ack.code == ConnectReturnCode::Success {
                return Ok(());
            }
            return Err(rumqttc::ConnectionError::ConnectionRefused(ack.code));
        }
    }
}

/// Something that yields transport events, normally the `rumqttc` event loop.
trait EventSource {
    async fn next_event(&mut self) -> Result<Event, rumqttc::ConnectionError>;
}

impl EventSource for EventLoop {
    async fn next_event(&mut self) -> Result<Event, rumqttc::ConnectionError> {
        self.poll().await
    }
}

async fn drive_event_loop<E: EventSource>(
    mut eventloop: E,
    handle: IotClient,
    inbox: std_mpsc::Sender<MqttMessage>,
    backoff: ReconnectBackoff,
    status: StatusListener,
) {
    let mut backoff = backoff.start();
    loop {
        match eventloop.next_event().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = MqttMessage::new(publish.topic.clone(), publish.payload.to_vec());
                if inbox.send(message).is_err() {
                    debug!(topic = %publish.topic, "inbox closed, dropping message");
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                backoff.reset();
                handle.connected.store(true, Ordering::Release);
                status(ConnectionStatus::Connected);
                let topics = handle
                    .subscriptions
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                for topic in topics {
                    if let Err(e) = handle.client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                        warn!(%topic, error = %e, "resubscribe failed");
                    }
                }
                info!("broker reconnected");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                handle.connected.store(false, Ordering::Release);
                status(ConnectionStatus::Disconnected);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if handle.connected.swap(false, Ordering::AcqRel) {
                    status(ConnectionStatus::Disconnected);
                }
                let delay = backoff.next_delay();
                warn!(error = %e, retry_in = ?delay, "broker connection lost");
                tokio::time::sleep(delay).await;
                status(ConnectionStatus::Connecting);
            }
        }
    }
    debug!("event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::Mutex as StdMutex;

    // ========================================================================
    // Backoff
    // ========================================================================

    #[test]
    fn test_backoff_doubles_to_ceiling() {
        let mut state = ReconnectBackoff::default().start();
        let secs: Vec<u64> = (0..7).map(|_| state.next_delay().as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 20, 20]);
    }

    #[test]
    fn test_backoff_reset() {
        let mut state = ReconnectBackoff::default().start();
        state.next_delay();
        state.next_delay();
        state.reset();
        assert_eq!(state.next_delay(), Duration::from_secs(1));
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    fn write_credentials(dir: &Path) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("root.ca.pem"), b"ca").unwrap();
        std::fs::write(dir.join("certificate.pem.crt"), b"cert").unwrap();
        std::fs::write(dir.join("private.pem.key"), b"key").unwrap();
    }

    #[tokio::test]
    async fn test_load_reads_credentials() {
        let dir = std::env::temp_dir().join(format!("turbine-sync-mqtt-{}", std::process::id()));
        write_credentials(&dir);
        let config = Config::default().with_thing_name("t1").with_certs_path(&dir);

        let settings = ConnectionConfig::load(&config).await.unwrap();
        assert_eq!(settings.client_id, "t1");
        assert_eq!(settings.endpoint.port, 8883);
        assert_eq!(settings.ca, b"ca");
        assert_eq!(settings.key, b"key");
        assert_eq!(settings.timeout, Duration::from_secs(10));
        assert_eq!(settings.retry_limit, 3);

        let core = settings.for_core(
            Endpoint {
                host: "192.168.1.20".into(),
                port: 8883,
            },
            b"group-ca".to_vec(),
        );
        assert_eq!(core.retry_limit, 1);
        assert_eq!(core.ca, b"group-ca");
        assert_eq!(core.cert, b"cert");
    }

    #[tokio::test]
    async fn test_load_missing_credentials() {
        let config = Config::default().with_certs_path("/definitely/not/here");
        assert!(matches!(
            ConnectionConfig::load(&config).await,
            Err(ConnectError::Credentials { .. })
        ));
    }

    // ========================================================================
    // Connect
    // ========================================================================

    #[tokio::test]
    async fn test_connect_gives_up_after_retry_limit() {
        let settings = ConnectionConfig {
            client_id: "t1".into(),
            endpoint: Endpoint {
                host: "127.0.0.1".into(),
                port: 1,
            },
            ca: Vec::new(),
            cert: Vec::new(),
            key: Vec::new(),
            keep_alive: Duration::from_secs(30),
            timeout: Duration::from_millis(500),
            retry_limit: 2,
            backoff: ReconnectBackoff::default(),
        };
        let topics = Topics::new(&Config::default().with_thing_name("t1").identity());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let status: StatusListener = Arc::new(move |s| sink.lock().unwrap().push(s));

        let result = connect(&settings, &topics, status).await;
        assert!(matches!(result, Err(ConnectError::Exhausted { attempts: 2 })));

        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.iter()
                .filter(|s| **s == ConnectionStatus::Connecting)
                .count(),
            2
        );
        assert_eq!(seen.last(), Some(&ConnectionStatus::Disconnected));
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    struct ScriptedEvents(std::collections::VecDeque<Result<Event, rumqttc::ConnectionError>>);

    impl EventSource for ScriptedEvents {
        async fn next_event(&mut self) -> Result<Event, rumqttc::ConnectionError> {
            self.0
                .pop_front()
                .unwrap_or(Ok(Event::Outgoing(Outgoing::Disconnect)))
        }
    }

    #[tokio::test]
    async fn test_dropped_session_reports_status_and_reconnects() {
        let (client, _requests) = AsyncClient::new(MqttOptions::new("t1", "localhost", 8883), 16);
        let (inbox_tx, inbox_rx) = std_mpsc::channel();
        let connected = Arc::new(AtomicBool::new(true));
        let mut handle = IotClient::spawn(
            client,
            inbox_rx,
            vec!["$aws/things/t1/shadow/update/delta".into()],
            Arc::clone(&connected),
        );
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let status: StatusListener = Arc::new(move |s| sink.lock().unwrap().push(s));

        let events = ScriptedEvents(
            vec![
                Err(rumqttc::ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "reset by peer",
                ))),
                Ok(Event::Incoming(Packet::ConnAck(rumqttc::ConnAck::new(
                    ConnectReturnCode::Success,
                    false,
                )))),
                Ok(Event::Incoming(Packet::Publish(rumqttc::Publish::new(
                    "$aws/things/t1/shadow/update/delta",
                    QoS::AtLeastOnce,
                    br#"{"state":{}}"#.to_vec(),
                )))),
            ]
            .into(),
        );
        let backoff = ReconnectBackoff {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(1),
        };

        drive_event_loop(events, handle.clone(), inbox_tx, backoff, status).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ConnectionStatus::Disconnected,
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
                ConnectionStatus::Disconnected,
            ]
        );
        let message = handle.try_recv().unwrap();
        assert_eq!(message.topic, "$aws/things/t1/shadow/update/delta");
        assert!(!handle.is_connected());
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(to_qos(QosLevel::AtMostOnce), QoS::AtMostOnce);
        assert_eq!(to_qos(QosLevel::AtLeastOnce), QoS::AtLeastOnce);
    }
}
