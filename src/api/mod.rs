//! REST API and WebSocket observability surface

pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod ws;

pub use handlers::AppState;
pub use routes::{create_router, ApiDoc};
