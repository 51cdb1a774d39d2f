use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Message returned for every internal failure. Details stay in the logs.
pub const UNAVAILABLE_MESSAGE: &str = "temporarily unavailable, retry";

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Rejected ({code}): {message}")]
    Rejected { code: &'static str, message: String },

    #[error("Conflict ({code}): {message}")]
    Conflict { code: &'static str, message: String },

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Rejected { code, .. } | AppError::Conflict { code, .. } => *code,
            AppError::Unavailable(_) => "TEMPORARILY_UNAVAILABLE",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) | AppError::Rejected { .. } => StatusCode::BAD_REQUEST,
            AppError::Conflict { .. } => StatusCode::CONFLICT,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        let message = match &self {
            AppError::NotFound(msg) | AppError::BadRequest(msg) => msg.clone(),
            AppError::Rejected { message, .. } | AppError::Conflict { message, .. } => message.clone(),
            AppError::Unavailable(detail) | AppError::Internal(detail) => {
                tracing::error!("Error: {}: {}", status, detail);
                UNAVAILABLE_MESSAGE.to_string()
            }
        };

        if status.is_client_error() {
            tracing::warn!("Request rejected: {} {}: {}", status, code, message);
        }

        let body = Json(json!({
            "error": message,
            "code": code,
        }));

        (status, body).into_response()
    }
}
