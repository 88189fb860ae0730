//! HTTP listener configuration.

use std::time::Duration;

/// Bind address and request limits for the HTTP surface.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Allowed CORS origins; `"*"` allows any.
    pub cors_origins: Vec<String>,
    /// Maximum time to wait for a request to complete.
    pub request_timeout: Duration,
    /// Upper bound on waiting for in-flight requests at shutdown.
    pub drain_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
        }
    }
}
