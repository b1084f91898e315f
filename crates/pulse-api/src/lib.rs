pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::{ApiState, DeliveredResponse};

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/status", get(handlers::handle_status))
        .route("/query", post(handlers::handle_query))
        .route("/response", post(handlers::handle_response))
        .route("/report", post(handlers::handle_report))
        .route("/heartbeat", post(handlers::handle_heartbeat))
        .route("/responses", get(handlers::handle_responses))
        .route("/scheduler/start", post(handlers::handle_scheduler_start))
        .route("/scheduler/stop", post(handlers::handle_scheduler_stop))
        .route("/reset", post(handlers::handle_reset))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(cors)
}

pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "API listening on 127.0.0.1");
    axum::serve(listener, app).await?;
    Ok(())
}
