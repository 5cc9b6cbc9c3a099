// src/errors.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("MongoDB error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("Gateway authentication failed: {0}")]
    GatewayAuth(String),

    #[error("Gateway request timed out")]
    GatewayTimeout,

    #[error("Gateway rejected request [{code}]: {message}")]
    GatewayRejected { code: String, message: String },

    #[error("External API error: {0}")]
    ExternalApi(String),

    #[error("Invalid phone number: {0}")]
    InvalidPhone(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Document not found")]
    NotFound,

    #[error("Invalid ObjectId: {0}")]
    InvalidObjectId(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string()),
            AppError::GatewayAuth(_) => (StatusCode::BAD_GATEWAY, "Gateway authentication failed".to_string()),
            AppError::GatewayTimeout => (StatusCode::GATEWAY_TIMEOUT, "Gateway request timed out".to_string()),
            AppError::GatewayRejected { message, .. } => (StatusCode::BAD_GATEWAY, message.clone()),
            AppError::ExternalApi(_) => (StatusCode::BAD_GATEWAY, "External API error".to_string()),
            AppError::InvalidPhone(_) => (StatusCode::BAD_REQUEST, "Invalid phone number".to_string()),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "Validation failed".to_string()),
            AppError::NotFound => (StatusCode::NOT_FOUND, "Document not found".to_string()),
            AppError::InvalidObjectId(_) => (StatusCode::BAD_REQUEST, "Invalid ID format".to_string()),
        };

        let body = Json(json!({
            "error": error_message,
            "message": self.to_string(),
            "success": false,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));

        (status, body).into_response()
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // A timeout gives no certainty about whether the push went out.
            AppError::GatewayTimeout
        } else {
            AppError::ExternalApi(format!("HTTP request failed: {}", err))
        }
    }
}

impl From<mongodb::bson::oid::Error> for AppError {
    fn from(err: mongodb::bson::oid::Error) -> Self {
        AppError::InvalidObjectId(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Validation(format!("JSON parsing error: {}", err))
    }
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation(msg.into())
    }

    pub fn external_api(msg: impl Into<String>) -> Self {
        AppError::ExternalApi(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
