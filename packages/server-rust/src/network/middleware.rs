//! HTTP middleware stack.
//!
//! The first layer listed is the outermost: it sees the request first and
//! the response last.

use axum::extract::{Request, State};
use axum::http::header::HeaderName;
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::config::NetworkConfig;
use super::handlers::AppState;

/// The composed layer type returned by [`build_http_layers`].
///
/// Each layer wraps the next in a `Stack`, outermost first.
type HttpLayers = tower::layer::util::Stack<
    PropagateRequestIdLayer,
    tower::layer::util::Stack<
        TimeoutLayer,
        tower::layer::util::Stack<
            CorsLayer,
            tower::layer::util::Stack<
                CompressionLayer,
                tower::layer::util::Stack<
                    TraceLayer<
                        tower_http::classify::SharedClassifier<
                            tower_http::classify::ServerErrorsAsFailures,
                        >,
                    >,
                    tower::layer::util::Stack<
                        SetRequestIdLayer<MakeRequestUuid>,
                        tower::layer::util::Identity,
                    >,
                >,
            >,
        >,
    >,
>;

/// Builds the transport-level layers.
///
/// Order, outermost first:
/// 1. `SetRequestId` assigns an `X-Request-Id` to every request
/// 2. `Trace` opens a span per request
/// 3. `Compression` gzips responses
/// 4. `CORS` from the configured origins
/// 5. `Timeout` answers 408 past `request_timeout`
/// 6. `PropagateRequestId` copies `X-Request-Id` onto the response
///
/// The in-flight tracker is not part of this stack; it is a route layer on
/// the mapping routes only.
#[must_use]
pub fn build_http_layers(config: &NetworkConfig) -> HttpLayers {
    let x_request_id = HeaderName::from_static("x-request-id");

    ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(build_cors_layer(&config.cors_origins))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .layer(PropagateRequestIdLayer::new(x_request_id))
        .into_inner()
}

/// Builds the CORS layer from the configured origins.
///
/// A `"*"` entry allows any origin; otherwise unparsable origins are
/// dropped from the allowlist.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}

/// Counts the request as in flight and rejects it once draining started.
///
/// Draining requests get `503 Service Unavailable` without reaching the
/// handler.
pub async fn track_in_flight(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if state.shutdown.is_draining() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    let _guard = state.shutdown.in_flight_guard();
    Ok(next.run(request).await)
}
