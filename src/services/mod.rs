//! Network services: the broker transport and Greengrass discovery.
//!
//! Everything here is async (`rumqttc` on `tokio`). The rest of the crate only
//! sees [`IotClient`] through the sync [`MqttClient`](crate::traits::MqttClient)
//! trait, so the monitoring loop and the shadow dispatcher stay on plain
//! threads.

pub mod discovery;
pub mod mqtt;

pub use discovery::{
    connect_via_discovery, discover_with_retry, CachedHost, Candidate, DiscoveryClient,
    DiscoveryError, DiscoveryPolicy, DiscoveryResponse, FileHostCache, HostCache,
    HttpsDiscoveryClient,
};
pub use mqtt::{
    connect, ConnectError, ConnectionConfig, Endpoint, IotClient, ReconnectBackoff,
    StatusListener, TransportError,
};
