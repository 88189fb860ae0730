//! HTTP handlers and the state they share.

pub mod health;
pub mod mapping;

pub use health::{health_handler, liveness_handler, readiness_handler};

use std::sync::Arc;
use std::time::Instant;

use super::ShutdownController;
use crate::service::IdMappingService;

/// Shared state handed to every handler; cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub service: IdMappingService,
    pub shutdown: Arc<ShutdownController>,
    /// Process start, for uptime.
    pub start_time: Instant,
}

impl AppState {
    #[must_use]
    pub fn new(service: IdMappingService, shutdown: Arc<ShutdownController>) -> Self {
        Self {
            service,
            shutdown,
            start_time: Instant::now(),
        }
    }
}
