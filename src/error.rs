use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::BackendError;
use crate::vision::ImageError;

/// JSON body of every error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid model choice. Available options: {0}")]
    InvalidModelChoice(String),

    #[error("Missing required form field '{0}'")]
    MissingField(&'static str),

    #[error("{}", multipart_detail(.0))]
    Multipart(#[from] MultipartError),

    #[error("Inference failed: {0}")]
    Image(#[from] ImageError),

    #[error("Inference failed: {0}")]
    Backend(#[from] BackendError),

    #[error("Inference failed: {0}")]
    Internal(String),

    #[error("Server busy: too many concurrent generations")]
    Busy,
}

fn multipart_detail(err: &MultipartError) -> String {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        "Upload exceeds the maximum request size".to_string()
    } else {
        format!("Malformed multipart body: {}", err)
    }
}

impl ApiError {
    pub fn invalid_model_choice(available: &[&str]) -> Self {
        let options = available
            .iter()
            .map(|key| format!("'{}'", key))
            .collect::<Vec<_>>()
            .join(", ");
        ApiError::InvalidModelChoice(options)
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidModelChoice(_) => StatusCode::BAD_REQUEST,
            ApiError::MissingField(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Multipart(e) => e.status(),
            ApiError::Image(_) | ApiError::Backend(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Busy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{}", self);
        } else {
            tracing::warn!("{}", self);
        }
        (status, Json(ErrorBody { detail: self.to_string() })).into_response()
    }
}
