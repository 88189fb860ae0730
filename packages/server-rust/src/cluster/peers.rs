//! Peer fallback: ask sibling instances' hot caches on a local miss.
//!
//! The instance list is refreshed off the request path and published through
//! an [`ArcSwap`], so lookups never wait on the registry.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use idmap_core::Direction;
use thiserror::Error;
use tracing::{debug, info};

/// Peer discovery or query failure.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("invalid peer address {0:?}, expected host:port")]
    BadAddress(String),
    #[error("registry lookup failed: {0}")]
    Registry(String),
    #[error("peer request failed: {0}")]
    Transport(String),
    #[error("peer answered with status {0}")]
    Status(u16),
}

impl From<reqwest::Error> for PeerError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::Status(status.as_u16()),
            None => Self::Transport(err.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// PeerInstance
// ---------------------------------------------------------------------------

/// Network address of one sibling instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerInstance {
    pub host: String,
    pub port: u16,
}

impl PeerInstance {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerInstance {
    type Err = PeerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || PeerError::BadAddress(s.to_string());
        let (host, port) = s.trim().rsplit_once(':').ok_or_else(bad)?;
        if host.is_empty() {
            return Err(bad());
        }
        let port = port.parse().map_err(|_| bad())?;
        Ok(Self::new(host, port))
    }
}

// ---------------------------------------------------------------------------
// InstanceRegistry
// ---------------------------------------------------------------------------

/// Lists the instances of a logical service.
#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    async fn instances(&self, service: &str) -> Result<Vec<PeerInstance>, PeerError>;
}

/// Registry backed by a fixed list.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    instances: Vec<PeerInstance>,
}

impl StaticRegistry {
    #[must_use]
    pub fn new(instances: Vec<PeerInstance>) -> Self {
        Self { instances }
    }

    /// Parses a comma-separated `host:port` list; blank entries are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::BadAddress`] for the first invalid entry.
    pub fn parse(list: &str) -> Result<Self, PeerError> {
        let instances = list
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(str::parse)
            .collect::<Result<_, _>>()?;
        Ok(Self { instances })
    }
}

#[async_trait]
impl InstanceRegistry for StaticRegistry {
    async fn instances(&self, _service: &str) -> Result<Vec<PeerInstance>, PeerError> {
        Ok(self.instances.clone())
    }
}

// ---------------------------------------------------------------------------
// PeerClient
// ---------------------------------------------------------------------------

/// Sends one hot-cache-only lookup to a peer.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Returns the raw response body; empty means the peer has no mapping.
    async fn query(
        &self,
        peer: &PeerInstance,
        direction: Direction,
        id: &str,
    ) -> Result<String, PeerError>;
}

/// [`PeerClient`] over HTTP, calling the peer's `*FromMem` endpoints.
#[derive(Debug, Clone)]
pub struct HttpPeerClient {
    client: reqwest::Client,
}

impl HttpPeerClient {
    /// Builds a client whose requests give up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Transport`] if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, PeerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PeerError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    /// Endpoint path and query parameter for `direction`.
    #[must_use]
    pub fn endpoint(direction: Direction) -> (&'static str, &'static str) {
        match direction {
            Direction::Forward => ("/idMapping/getToIdFromMem", "fromId"),
            Direction::Reverse => ("/idMapping/getFromIdFromMem", "toId"),
        }
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn query(
        &self,
        peer: &PeerInstance,
        direction: Direction,
        id: &str,
    ) -> Result<String, PeerError> {
        let (path, param) = Self::endpoint(direction);
        let url = reqwest::Url::parse_with_params(&format!("http://{peer}{path}"), &[(param, id)])
            .map_err(|_| PeerError::BadAddress(peer.to_string()))?;
        let body = self
            .client
            .post(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body)
    }
}

// ---------------------------------------------------------------------------
// PeerResolver
// ---------------------------------------------------------------------------

/// Queries peers in order and accepts the first plausible answer.
pub struct PeerResolver {
    service: String,
    registry: Arc<dyn InstanceRegistry>,
    client: Arc<dyn PeerClient>,
    peers: ArcSwap<Vec<PeerInstance>>,
    self_addr: Option<PeerInstance>,
    max_len: usize,
}

impl PeerResolver {
    /// `self_addr`, when known, is never queried. Answers of `max_len`
    /// characters or more are rejected.
    #[must_use]
    pub fn new(
        service: impl Into<String>,
        registry: Arc<dyn InstanceRegistry>,
        client: Arc<dyn PeerClient>,
        self_addr: Option<PeerInstance>,
        max_len: usize,
    ) -> Self {
        Self {
            service: service.into(),
            registry,
            client,
            peers: ArcSwap::from_pointee(Vec::new()),
            self_addr,
            max_len,
        }
    }

    /// Current instance list.
    #[must_use]
    pub fn peers(&self) -> Arc<Vec<PeerInstance>> {
        self.peers.load_full()
    }

    /// Reloads the instance list from the registry.
    ///
    /// On failure the previous list stays in place.
    ///
    /// # Errors
    ///
    /// Returns the registry's error.
    pub async fn refresh(&self) -> Result<usize, PeerError> {
        let mut instances = self.registry.instances(&self.service).await?;
        if let Some(me) = &self.self_addr {
            instances.retain(|peer| peer != me);
        }
        let count = instances.len();
        let changed = **self.peers.load() != instances;
        self.peers.store(Arc::new(instances));
        if changed {
            info!(service = %self.service, peers = count, "peer list refreshed");
        }
        Ok(count)
    }

    /// Whether `answer` looks like an id rather than an error page.
    fn accepts(&self, answer: &str) -> bool {
        !answer.is_empty() && answer.chars().count() < self.max_len
    }

    /// Asks each peer in order; returns the first acceptable answer.
    ///
    /// A failing peer counts as a miss.
    pub async fn resolve(&self, direction: Direction, id: &str) -> Option<String> {
        let peers = self.peers.load_full();
        for peer in peers.iter() {
            match self.client.query(peer, direction, id).await {
                Ok(answer) if self.accepts(&answer) => {
                    debug!(%peer, ?direction, id, "peer resolved id");
                    metrics::counter!("idmap_peer_hits_total").increment(1);
                    return Some(answer);
                }
                Ok(_) => {}
                Err(err) => debug!(%peer, error = %err, "peer query failed"),
            }
        }
        None
    }
}
