//! HTTP surface: configuration, routes, middleware, and shutdown control.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod shutdown;

pub use config::NetworkConfig;
pub use handlers::AppState;
pub use module::NetworkModule;
pub use shutdown::{HealthState, InFlightGuard, ShutdownController};
