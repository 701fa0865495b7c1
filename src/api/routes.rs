//! API routing

use super::{handlers, handlers::AppState, middleware, ws};
use axum::{middleware as axum_middleware, routing::get, Router};
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// OpenAPI documentation.
#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health,
        handlers::get_state,
        handlers::get_config,
    ),
    components(
        schemas(
            handlers::ErrorResponse,
            handlers::HealthResponse,
            crate::config::DsmeConfig,
            crate::config::BucketThreshold,
            crate::engine::StateSnapshot,
            crate::engine::State,
            crate::engine::Runlevel,
            crate::engine::ConditionBits,
            crate::engine::ChargerState,
            crate::engine::ThermalStatus,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoint"),
        (name = "state", description = "Device state introspection"),
        (name = "config", description = "Effective configuration"),
    ),
    info(
        title = "Device State Manager",
        version = "0.1.0",
        description = "Observability surface for the device state manager daemon",
    )
)]
pub struct ApiDoc;

/// Build the axum router.
pub fn create_router(state: AppState) -> Router {
    let openapi = ApiDoc::openapi();

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/state", get(handlers::get_state))
        .route("/api/v1/config", get(handlers::get_config))
        .route("/events", get(ws::events_handler))
        .with_state(state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi))
        .layer(axum_middleware::from_fn(middleware::request_id_middleware))
        .layer(CorsLayer::permissive())
}
