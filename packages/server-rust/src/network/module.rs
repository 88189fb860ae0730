//! HTTP server lifecycle.
//!
//! `new()` allocates shared state, `start()` binds the listener, and
//! `serve()` accepts connections until the shutdown future resolves. The
//! split lets the binary replay the binlog and start the scheduler between
//! binding and serving.

use std::future::Future;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::handlers::mapping::{
    batch_mapping_handler, delete_from_id_handler, delete_to_id_handler,
    get_from_id_from_mem_handler, get_from_id_handler, get_to_id_from_mem_handler,
    get_to_id_handler, mapping_handler, mem_size_handler,
};
use super::handlers::{health_handler, liveness_handler, readiness_handler, AppState};
use super::middleware::{build_http_layers, track_in_flight};
use super::shutdown::ShutdownController;
use crate::service::IdMappingService;

pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    service: IdMappingService,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    #[must_use]
    pub fn new(config: NetworkConfig, service: IdMappingService) -> Self {
        Self {
            config,
            listener: None,
            service,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Assembles every route with the middleware stack.
    ///
    /// - `GET /health`, `/health/live`, `/health/ready`
    /// - `POST /idMapping/*`
    pub fn build_router(&self) -> Router {
        let state = AppState::new(self.service.clone(), Arc::clone(&self.shutdown));

        let id_mapping = Router::new()
            .route("/mapping", post(mapping_handler))
            .route("/batchMapping", post(batch_mapping_handler))
            .route("/getToId", post(get_to_id_handler))
            .route("/getFromId", post(get_from_id_handler))
            .route("/getToIdFromMem", post(get_to_id_from_mem_handler))
            .route("/getFromIdFromMem", post(get_from_id_from_mem_handler))
            .route("/deleteToId", post(delete_to_id_handler))
            .route("/deleteFromId", post(delete_from_id_handler))
            .route("/getMemSize", post(mem_size_handler).get(mem_size_handler))
            .route_layer(axum::middleware::from_fn_with_state(
                state.clone(),
                track_in_flight,
            ));

        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .nest("/idMapping", id_mapping)
            .layer(build_http_layers(&self.config))
            .with_state(state)
    }

    /// Binds the listener and returns the bound port.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        info!(host = %self.config.host, port, "HTTP listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then waits for in-flight requests.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called or the server fails.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let router = self.build_router();
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let controller = Arc::clone(&self.shutdown);
        let drain_timeout = self.config.drain_timeout;

        controller.set_ready();
        let draining = Arc::clone(&controller);
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.await;
                draining.begin_drain();
                info!("shutdown signalled, draining requests");
            })
            .await?;

        if controller.wait_for_drain(drain_timeout).await {
            info!("all requests drained");
        } else {
            warn!(
                in_flight = controller.in_flight_count(),
                "drain timeout expired with requests in flight"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::{harness, small_config};

    async fn module() -> NetworkModule {
        let h = harness(small_config()).await;
        NetworkModule::new(
            NetworkConfig::default(),
            IdMappingService::new(h.engine, None),
        )
    }

    #[tokio::test]
    async fn router_builds() {
        let _router = module().await.build_router();
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let mut module = module().await;
        let port = module.start().await.unwrap();
        assert!(port > 0);
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let module = module().await;
        let result = module.serve(std::future::ready(())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn serve_stops_on_signal() {
        let mut module = module().await;
        module.start().await.unwrap();
        let controller = module.shutdown_controller();
        module.serve(std::future::ready(())).await.unwrap();
        assert_eq!(controller.health_state(), crate::network::HealthState::Stopped);
    }
}
