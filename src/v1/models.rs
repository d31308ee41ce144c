use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::registry::ModelSummary;
use crate::AppState;

#[derive(Serialize)]
pub struct ModelListResponse {
    pub models: Vec<ModelSummary>,
}

pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let models = state.registry.summaries();

    (StatusCode::OK, Json(ModelListResponse { models }))
}
