use axum::{Router, routing::get};

pub mod example;
pub mod system;

pub fn router() -> Router {
    Router::new()
        .route("/", get(system::root))
        .route("/health", get(system::health))
        .route("/health/ready", get(system::ready))
        .nest("/example", example::router())
        .nest("/redis-test", redis_test::router())
}
