//! Wire types for the parts of the OpenAI dialect the gateway inspects.
//!
//! Request and response bodies are otherwise handled as raw
//! [`serde_json::Value`]s so that fields the gateway does not know about
//! reach the backend (and the client) untouched.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error shape
// ---------------------------------------------------------------------------

/// The normalized error shape returned to clients for every failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub message: String,
    #[serde(rename = "type")]
    #[serde(default)]
    pub error_type: String,
    #[serde(default)]
    pub code: Option<serde_json::Value>,
    #[serde(default)]
    pub param: Option<String>,
}

/// `{"error": {...}}` wrapper, as both emitted by the gateway and reported by
/// well-behaved backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorEnvelope,
}

impl ErrorEnvelope {
    pub fn new(error_type: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: error_type.to_string(),
            code: None,
            param: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(serde_json::Value::String(code.into()));
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::new("invalid_request_error", msg)
    }

    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::new("authentication_error", msg).with_code("invalid_api_key")
    }

    pub fn backend_unavailable(msg: impl Into<String>) -> Self {
        Self::new("backend_unavailable", msg)
    }

    pub fn backend_error(msg: impl Into<String>) -> Self {
        Self::new("backend_error", msg)
    }

    pub fn stream_interrupted(msg: impl Into<String>) -> Self {
        Self::new("stream_interrupted", msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new("internal_error", msg)
    }

    pub fn into_response_body(self) -> ErrorResponse {
        ErrorResponse { error: self }
    }
}

// ---------------------------------------------------------------------------
// Model listing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelObject {
    pub id: String,
    #[serde(default = "default_model_object")]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub owned_by: Option<String>,
}

fn default_model_object() -> String {
    "model".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelList {
    #[serde(default = "default_list_object")]
    pub object: String,
    pub data: Vec<ModelObject>,
}

fn default_list_object() -> String {
    "list".to_string()
}
