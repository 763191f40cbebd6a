//! Greengrass core discovery and the last-known-host cache.
//!
//! When `useGreengrass` is set the device does not talk to the cloud
//! endpoint directly. It asks the discovery service which cores serve its
//! group, then connects to the first reachable one:
//!
//! 1. The host cached from the previous run is tried first.
//! 2. Otherwise discovery runs (bounded attempts), the group CA is written
//!    to disk, and each non-loopback candidate is tried in order.
//! 3. The winner is persisted to the cache. No reachable core is fatal.
//!
//! ```text
//! GET https://<ggHost>:8443/greengrass/discover/thing/<thingName>
//! ```

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::mqtt::{ConnectionConfig, Endpoint};

/// Discovery service port.
pub const DISCOVERY_PORT: u16 = 8443;

/// Discovery and cache failures.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Socket or file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Client setup or the HTTPS request failed.
    #[error("discovery request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The service answered with a non-success status.
    #[error("discovery returned HTTP {status}")]
    Status {
        /// Status code.
        status: u16,
    },
    /// The body was not a discovery document.
    #[error("invalid discovery document: {0}")]
    Json(#[from] serde_json::Error),
    /// The request did not complete in time.
    #[error("discovery request timed out")]
    Timeout,
    /// Every discovery attempt failed.
    #[error("discovery failed after {attempts} attempt(s)")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
    },
    /// Discovery succeeded but no candidate accepted a connection.
    #[error("no reachable Greengrass core")]
    NoReachableCore,
}

// ============================================================================
// Discovery document
// ============================================================================

/// Discovery service response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    /// Groups the thing belongs to.
    #[serde(rename = "GGGroups", default)]
    pub groups: Vec<GroupInfo>,
}

/// One Greengrass group.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupInfo {
    /// Group ID.
    #[serde(rename = "GGGroupId", default)]
    pub group_id: String,
    /// Cores serving the group.
    #[serde(rename = "Cores", default)]
    pub cores: Vec<CoreInfo>,
    /// PEM group CAs.
    #[serde(rename = "CAs", default)]
    pub cas: Vec<String>,
}

/// One core and its advertised addresses.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreInfo {
    /// Core thing ARN.
    #[serde(rename = "thingArn", default)]
    pub thing_arn: String,
    /// Addresses in preference order.
    #[serde(rename = "Connectivity", default)]
    pub connectivity: Vec<ConnectivityInfo>,
}

/// One advertised address.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectivityInfo {
    /// Address ID.
    #[serde(default)]
    pub id: String,
    /// Host or IP.
    pub host_address: String,
    /// MQTT port.
    pub port_number: u16,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: String,
}

/// A core address to try, with the CA that signs its certificate.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    /// Broker endpoint.
    pub endpoint: Endpoint,
    /// PEM group CA.
    pub ca: String,
}

impl DiscoveryResponse {
    /// Non-loopback addresses in document order.
    pub fn candidates(&self) -> Vec<Candidate> {
        let mut out = Vec::new();
        for group in &self.groups {
            let ca = group.cas.join("\n");
            for core in &group.cores {
                for conn in &core.connectivity {
                    if is_loopback(&conn.host_address) {
                        debug!(host = %conn.host_address, "skipping loopback candidate");
                        continue;
                    }
                    out.push(Candidate {
                        endpoint: Endpoint {
                            host: conn.host_address.clone(),
                            port: conn.port_number,
                        },
                        ca: ca.clone(),
                    });
                }
            }
        }
        out
    }

    /// CA of the first group, used when reconnecting to a cached host.
    pub fn group_ca(&self) -> Option<String> {
        self.groups
            .first()
            .filter(|g| !g.cas.is_empty())
            .map(|g| g.cas.join("\n"))
    }
}

fn is_loopback(host: &str) -> bool {
    matches!(host, "127.0.0.1" | "::1" | "localhost")
}

// ============================================================================
// Host cache
// ============================================================================

/// Persisted discovery result plus the host that worked last time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedHost {
    /// Full discovery response.
    #[serde(flatten)]
    pub response: DiscoveryResponse,
    /// Host that accepted the connection.
    #[serde(rename = "LAST_HostAddress")]
    pub host: String,
    /// Its port.
    #[serde(rename = "LAST_PortNumber")]
    pub port: u16,
    /// Unix time of the successful connect, in milliseconds.
    pub timestamp: u64,
}

impl CachedHost {
    fn candidate(&self) -> Option<Candidate> {
        Some(Candidate {
            endpoint: Endpoint {
                host: self.host.clone(),
                port: self.port,
            },
            ca: self.response.group_ca()?,
        })
    }
}

/// Storage for the last working host and the group CA.
pub trait HostCache {
    /// Previously stored host, if any and readable.
    fn load(&self) -> Option<CachedHost>;

    /// Persist the winning host.
    fn store(&self, host: &CachedHost) -> Result<(), DiscoveryError>;

    /// Persist the group CA returned by discovery.
    fn store_group_ca(&self, pem: &str) -> Result<(), DiscoveryError>;
}

/// JSON file cache under the certificates directory.
#[derive(Clone, Debug)]
pub struct FileHostCache {
    host_path: PathBuf,
    ca_path: PathBuf,
}

impl FileHostCache {
    /// Cache at `host_path`, group CA at `ca_path`.
    pub fn new(host_path: impl Into<PathBuf>, ca_path: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host_path.into(),
            ca_path: ca_path.into(),
        }
    }

    /// Path of the host cache file.
    pub fn host_path(&self) -> &Path {
        &self.host_path
    }
}

impl HostCache for FileHostCache {
    fn load(&self) -> Option<CachedHost> {
        let text = std::fs::read_to_string(&self.host_path).ok()?;
        match serde_json::from_str(&text) {
            Ok(host) => Some(host),
            Err(e) => {
                warn!(path = %self.host_path.display(), error = %e, "ignoring unreadable host cache");
                None
            }
        }
    }

    fn store(&self, host: &CachedHost) -> Result<(), DiscoveryError> {
        let json = serde_json::to_string_pretty(host)?;
        std::fs::write(&self.host_path, json)?;
        Ok(())
    }

    fn store_group_ca(&self, pem: &str) -> Result<(), DiscoveryError> {
        std::fs::write(&self.ca_path, pem)?;
        Ok(())
    }
}

// ============================================================================
// Discovery client
// ============================================================================

/// Source of discovery documents.
#[allow(async_fn_in_trait)]
pub trait DiscoveryClient {
    /// Run one discovery request.
    async fn discover(&self) -> Result<DiscoveryResponse, DiscoveryError>;
}

/// Discovery over HTTPS with the device certificate.
#[derive(Clone, Debug)]
pub struct HttpsDiscoveryClient {
    url: String,
    http: reqwest::Client,
}

impl HttpsDiscoveryClient {
    /// Client for `gg_host` using the credentials in `settings`.
    ///
    /// Only the configured root CA is trusted.
    pub fn new(gg_host: &str, settings: &ConnectionConfig) -> Result<Self, DiscoveryError> {
        let mut identity = settings.cert.clone();
        identity.push(b'\n');
        identity.extend_from_slice(&settings.key);

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .identity(reqwest::Identity::from_pem(&identity)?)
            .timeout(settings.timeout);
        for ca in reqwest::Certificate::from_pem_bundle(&settings.ca)? {
            builder = builder.add_root_certificate(ca);
        }

        Ok(Self {
            url: discovery_url(gg_host, &settings.client_id),
            http: builder.build()?,
        })
    }

    /// Discovery URL for this thing.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl DiscoveryClient for HttpsDiscoveryClient {
    async fn discover(&self) -> Result<DiscoveryResponse, DiscoveryError> {
        debug!(url = %self.url, "requesting discovery document");
        let response = self.http.get(&self.url).send().await.map_err(request_error)?;
        check_status(response.status())?;
        let body = response.bytes().await.map_err(request_error)?;
        Ok(serde_json::from_slice(&body)?)
    }
}

fn discovery_url(gg_host: &str, thing_name: &str) -> String {
    format!("https://{gg_host}:{DISCOVERY_PORT}/greengrass/discover/thing/{thing_name}")
}

fn check_status(status: StatusCode) -> Result<(), DiscoveryError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(DiscoveryError::Status {
            status: status.as_u16(),
        })
    }
}

fn request_error(e: reqwest::Error) -> DiscoveryError {
    if e.is_timeout() {
        DiscoveryError::Timeout
    } else {
        DiscoveryError::Request(e)
    }
}

// ============================================================================
// Connect via discovery
// ============================================================================

/// Discovery retry bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiscoveryPolicy {
    /// Discovery requests before giving up.
    pub attempts: u32,
    /// Delay after the first failure; doubles each time.
    pub retry_delay: Duration,
}

impl Default for DiscoveryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Discover with bounded retries.
pub async fn discover_with_retry<D: DiscoveryClient>(
    client: &D,
    policy: DiscoveryPolicy,
) -> Result<DiscoveryResponse, DiscoveryError> {
    let attempts = policy.attempts.max(1);
    let mut delay = policy.retry_delay;
    for attempt in 1..=attempts {
        match client.discover().await {
            Ok(response) => {
                info!(attempt, groups = response.groups.len(), "discovery succeeded");
                return Ok(response);
            }
            Err(e) => warn!(attempt, error = %e, "discovery attempt failed"),
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }
    Err(DiscoveryError::Exhausted { attempts })
}

/// Connect to a Greengrass core, preferring the cached host.
///
/// `try_connect` is called once per candidate and returns the session on
/// success. The winning host is written back to `cache`.
pub async fn connect_via_discovery<D, H, F, Fut, T, E>(
    client: &D,
    cache: &H,
    policy: DiscoveryPolicy,
    mut try_connect: F,
) -> Result<T, DiscoveryError>
where
    D: DiscoveryClient,
    H: HostCache,
    F: FnMut(Candidate) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    if let Some(cached) = cache.load() {
        if let Some(candidate) = cached.candidate() {
            info!(host = %candidate.endpoint.host, "trying cached Greengrass core");
            match try_connect(candidate).await {
                Ok(session) => {
                    remember(cache, cached.response, &cached.host, cached.port);
                    return Ok(session);
                }
                Err(e) => warn!(host = %cached.host, error = %e, "cached core unreachable"),
            }
        }
    }

    let response = discover_with_retry(client, policy).await?;
    if let Some(ca) = response.group_ca() {
        cache.store_group_ca(&ca)?;
    }

    for candidate in response.candidates() {
        let endpoint = candidate.endpoint.clone();
        info!(host = %endpoint.host, port = endpoint.port, "trying Greengrass core");
        match try_connect(candidate).await {
            Ok(session) => {
                remember(cache, response, &endpoint.host, endpoint.port);
                return Ok(session);
            }
            Err(e) => warn!(host = %endpoint.host, error = %e, "core unreachable"),
        }
    }

    Err(DiscoveryError::NoReachableCore)
}

fn remember<H: HostCache>(cache: &H, response: DiscoveryResponse, host: &str, port: u16) {
    let entry = CachedHost {
        response,
        host: host.to_string(),
        port,
        timestamp: epoch_ms(),
    };
    if let Err(e) = cache.store(&entry) {
        warn!(error = %e, "could not persist Greengrass host");
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
