use serde_json::Value;

use super::openai_types::{ErrorEnvelope, ErrorResponse};
use super::request::Endpoint;
use crate::mapping::ModelMapping;

/// Rewrite a successful backend body for the client.
///
/// The model id is reverse-mapped; `object` and `created` are filled in when
/// the backend left them out. `choices`, `usage` and everything else pass
/// through untouched. Returns `None` if the body is not a JSON object, in
/// which case the caller forwards the raw bytes.
pub fn normalize_success(
    body: &[u8],
    endpoint: Endpoint,
    mapping: &ModelMapping,
    now_unix: i64,
) -> Option<Value> {
    let Ok(Value::Object(mut obj)) = serde_json::from_slice::<Value>(body) else {
        return None;
    };

    if let Some(Value::String(model)) = obj.get("model") {
        let external = mapping.map_reverse(model).to_string();
        obj.insert("model".to_string(), Value::String(external));
    }

    if !obj.contains_key("object")
        && (obj.contains_key("choices") || endpoint == Endpoint::Embeddings)
    {
        obj.insert(
            "object".to_string(),
            Value::String(endpoint.response_object().to_string()),
        );
    }

    if !obj.contains_key("created") && endpoint != Endpoint::Embeddings {
        obj.insert("created".to_string(), Value::from(now_unix));
    }

    Some(Value::Object(obj))
}

/// Add a rough `usage` block to a completion that arrived without one.
///
/// Completion tokens are approximated by whitespace-separated words of the
/// first choice; prompt tokens are unknown and reported as 0. A `usage` the
/// backend sent is never touched. Returns whether an estimate was added.
pub fn fill_missing_usage(body: &mut Value) -> bool {
    let Value::Object(obj) = body else {
        return false;
    };
    if obj.contains_key("usage") {
        return false;
    }
    let Some(first) = obj
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
    else {
        return false;
    };

    let content = first
        .get("message")
        .and_then(|m| m.get("content"))
        .or_else(|| first.get("text"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let tokens = content.split_whitespace().count();

    obj.insert(
        "usage".to_string(),
        serde_json::json!({
            "prompt_tokens": 0,
            "completion_tokens": tokens,
            "total_tokens": tokens,
        }),
    );
    true
}

/// Turn a failed backend response into the client-facing error shape.
///
/// Bodies in the known `{"error": {...}}` shape are re-emitted with the
/// backend's own message and type; anything else becomes a generic backend
/// error carrying the status and raw text.
pub fn normalize_error(status: u16, body: &[u8]) -> ErrorEnvelope {
    if let Ok(parsed) = serde_json::from_slice::<ErrorResponse>(body) {
        let mut envelope = parsed.error;
        if envelope.error_type.is_empty() {
            envelope.error_type = "backend_error".to_string();
        }
        return envelope;
    }

    // Some backends (llama.cpp, older Ollama) report `{"error": "text"}`.
    if let Ok(Value::Object(obj)) = serde_json::from_slice::<Value>(body) {
        if let Some(Value::String(message)) = obj.get("error") {
            return ErrorEnvelope::backend_error(message.clone()).with_code(status.to_string());
        }
    }

    let text = String::from_utf8_lossy(body);
    ErrorEnvelope::backend_error(format!(
        "Backend returned status {}: {}",
        status,
        truncate(text.trim(), 500)
    ))
    .with_code(status.to_string())
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
