//! Health state and in-flight request tracking for graceful shutdown.
//!
//! The state lives in an `ArcSwap` read lock-free by the probes. The
//! in-flight count is an atomic decremented by RAII guards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

/// Server health state.
///
/// Starting -> Ready -> Draining -> Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Not yet serving.
    Starting,
    /// Accepting mapping requests.
    Ready,
    /// Refusing new requests while in-flight ones finish.
    Draining,
    /// Every in-flight request has completed.
    Stopped,
}

impl HealthState {
    /// Lowercase name reported by the health endpoints.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

/// Shared between the router (health probes, in-flight middleware) and the
/// serve loop.
#[derive(Debug)]
pub struct ShutdownController {
    in_flight: Arc<AtomicU64>,
    health_state: ArcSwap<HealthState>,
}

impl ShutdownController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(AtomicU64::new(0)),
            health_state: ArcSwap::from_pointee(HealthState::Starting),
        }
    }

    /// Moves to `Ready`; readiness probes pass from here on.
    pub fn set_ready(&self) {
        self.health_state.store(Arc::new(HealthState::Ready));
    }

    /// Moves to `Draining`; new requests are refused from here on.
    pub fn begin_drain(&self) {
        self.health_state.store(Arc::new(HealthState::Draining));
    }

    /// Current state.
    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.health_state.load()
    }

    /// `true` once draining has started, including after `Stopped`.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        matches!(
            self.health_state(),
            HealthState::Draining | HealthState::Stopped
        )
    }

    /// Counts one request until the guard drops.
    ///
    /// The count is released even if the handler panics.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Requests currently holding a guard.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits until no request is in flight, polling every 10ms.
    ///
    /// Returns `true` and moves to `Stopped` on success; `false` if
    /// `timeout` expired first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.in_flight_count() == 0 {
                self.health_state.store(Arc::new(HealthState::Stopped));
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
