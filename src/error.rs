//! Error types for the gateway.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::translate::openai_types::ErrorEnvelope;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    /// Malformed or incomplete request. Never reaches a backend.
    #[error("Invalid request: {message}")]
    Validation {
        message: String,
        param: Option<String>,
    },

    #[error("Request body too large: {message}")]
    PayloadTooLarge { message: String },

    #[error("Unauthorized: {message}")]
    Auth { message: String },

    /// Every eligible backend failed at the transport level.
    #[error("No backend available: {message}")]
    BackendUnavailable { message: String, timed_out: bool },

    /// A backend answered, but with an error of its own.
    #[error("Backend returned status {status}: {}", envelope.message)]
    BackendApplication { status: u16, envelope: ErrorEnvelope },

    #[error("Stream interrupted: {message}")]
    StreamInterrupted { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl GatewayError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            param: None,
        }
    }

    pub fn invalid_param(param: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            param: Some(param.into()),
        }
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth {
            message: msg.into(),
        }
    }

    pub fn unavailable(msg: impl Into<String>, timed_out: bool) -> Self {
        Self::BackendUnavailable {
            message: msg.into(),
            timed_out,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Auth { .. } => StatusCode::UNAUTHORIZED,
            Self::BackendUnavailable { timed_out: true, .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::BackendUnavailable { .. } | Self::StreamInterrupted { .. } => {
                StatusCode::BAD_GATEWAY
            }
            Self::BackendApplication { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The client-facing error shape for this failure.
    pub fn envelope(&self) -> ErrorEnvelope {
        match self {
            Self::Validation { message, param } => {
                let env = ErrorEnvelope::invalid_request(message.clone());
                match param {
                    Some(p) => env.with_param(p.clone()),
                    None => env,
                }
            }
            Self::PayloadTooLarge { message } => {
                ErrorEnvelope::invalid_request(message.clone()).with_code("request_too_large")
            }
            Self::Auth { message } => ErrorEnvelope::authentication(message.clone()),
            Self::BackendUnavailable { message, timed_out } => {
                let env = ErrorEnvelope::backend_unavailable(message.clone());
                if *timed_out {
                    env.with_code("backend_timeout")
                } else {
                    env
                }
            }
            Self::BackendApplication { envelope, .. } => envelope.clone(),
            Self::StreamInterrupted { message } => ErrorEnvelope::stream_interrupted(message.clone()),
            other => ErrorEnvelope::internal(other.to_string()),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (status, Json(self.envelope().into_response_body())).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(GatewayError::validation("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(GatewayError::auth("x").status(), StatusCode::UNAUTHORIZED);
        assert_eq!(GatewayError::unavailable("x", false).status(), StatusCode::BAD_GATEWAY);
        assert_eq!(GatewayError::unavailable("x", true).status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            GatewayError::config("x").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_application_error_keeps_backend_status_and_body() {
        let err = GatewayError::BackendApplication {
            status: 404,
            envelope: ErrorEnvelope::new("not_found_error", "model not found"),
        };
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.envelope().message, "model not found");
        assert_eq!(err.envelope().error_type, "not_found_error");
    }

    #[test]
    fn test_auth_response_has_challenge_header() {
        let resp = GatewayError::auth("missing bearer token").into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers()[header::WWW_AUTHENTICATE], "Bearer");
    }

    #[test]
    fn test_payload_too_large_is_an_envelope() {
        let err = GatewayError::PayloadTooLarge {
            message: "length limit exceeded".to_string(),
        };
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let env = err.envelope();
        assert_eq!(env.error_type, "invalid_request_error");
        assert_eq!(env.code, Some(serde_json::json!("request_too_large")));
    }

    #[test]
    fn test_validation_envelope_carries_param() {
        let env = GatewayError::invalid_param("messages", "messages is required").envelope();
        assert_eq!(env.param.as_deref(), Some("messages"));
        assert_eq!(env.error_type, "invalid_request_error");
    }
}
