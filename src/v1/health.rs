use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct HealthResponse {
    pub message: String,
}

/// Liveness only. Models are loaded before the listener is bound, so a
/// responding server has them.
pub async fn health_check() -> impl IntoResponse {
    let response = HealthResponse {
        message: "Server is running and models are loaded.".to_string(),
    };

    (StatusCode::OK, Json(response))
}
