//! HTTP error responses
//!
//! Every error the HTTP surface returns has the body `{"message": "<reason>"}`.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::error::ChatRelayError;

/// Message returned when a non-streaming upstream call fails
pub const UPSTREAM_FAILURE_MESSAGE: &str = "Upstream provider error";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("Conversation not found")]
    ConversationNotFound,

    #[error("{UPSTREAM_FAILURE_MESSAGE}")]
    Upstream,

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::ConversationNotFound => StatusCode::NOT_FOUND,
            ApiError::Upstream => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ChatRelayError> for ApiError {
    fn from(e: ChatRelayError) -> Self {
        match e {
            ChatRelayError::Validation(message) => ApiError::Validation(message),
            ChatRelayError::Upstream(_) => ApiError::Upstream,
            other => {
                tracing::error!(error_message = %other, "Request failed");
                ApiError::Internal(other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "message": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}
