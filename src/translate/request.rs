//! Validate inbound OpenAI-dialect request bodies and rewrite them for a backend.
//!
//! Only the fields the gateway owns are touched: `model` is forward-mapped and
//! `stream` is forced on for streaming calls. Everything else, including
//! out-of-range sampling parameters, is forwarded as-is for the backend to judge.

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::mapping::ModelMapping;

/// The endpoints whose bodies the gateway understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    ChatCompletions,
    Completions,
    Embeddings,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Endpoint::ChatCompletions => "/v1/chat/completions",
            Endpoint::Completions => "/v1/completions",
            Endpoint::Embeddings => "/v1/embeddings",
        }
    }

    /// The body field carrying the conversation or input for this endpoint.
    pub fn input_field(self) -> &'static str {
        match self {
            Endpoint::ChatCompletions => "messages",
            Endpoint::Completions => "prompt",
            Endpoint::Embeddings => "input",
        }
    }

    /// `object` value a well-formed success response carries.
    pub fn response_object(self) -> &'static str {
        match self {
            Endpoint::ChatCompletions => "chat.completion",
            Endpoint::Completions => "text_completion",
            Endpoint::Embeddings => "list",
        }
    }

    pub fn supports_streaming(self) -> bool {
        !matches!(self, Endpoint::Embeddings)
    }
}

/// Per-call context. Built fresh for every inbound request and never shared.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub request_id: String,
    pub endpoint: Endpoint,
    /// The body to send to the backend, already rewritten.
    pub payload: Value,
    pub external_model: String,
    pub internal_model: String,
    pub stream: bool,
}

impl ProxyRequest {
    pub fn body_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.payload)?)
    }
}

pub fn new_request_id() -> String {
    format!("req_{}", Uuid::new_v4().simple())
}

/// Validate `body` for `endpoint` and produce the backend-bound request.
pub fn translate_request(
    endpoint: Endpoint,
    body: &[u8],
    mapping: &ModelMapping,
    default_model: &str,
    request_id: String,
) -> Result<ProxyRequest> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| GatewayError::validation(format!("Invalid JSON in request body: {e}")))?;
    let Value::Object(mut obj) = value else {
        return Err(GatewayError::validation("Request body must be a JSON object"));
    };

    check_input(endpoint, &obj)?;

    let external_model = match obj.get("model") {
        None | Some(Value::Null) => default_model.to_string(),
        Some(Value::String(m)) if m.trim().is_empty() => default_model.to_string(),
        Some(Value::String(m)) => m.clone(),
        Some(_) => {
            return Err(GatewayError::invalid_param(
                "model",
                "'model' must be a string",
            ))
        }
    };

    let stream = match obj.get("stream") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => {
            return Err(GatewayError::invalid_param(
                "stream",
                "'stream' must be a boolean",
            ))
        }
    };
    if stream && !endpoint.supports_streaming() {
        return Err(GatewayError::invalid_param(
            "stream",
            format!("{} does not support streaming", endpoint.path()),
        ));
    }

    for warning in advisory_warnings(&obj) {
        tracing::debug!(request_id = %request_id, "{}", warning);
    }

    let internal_model = mapping.map_forward(&external_model).to_string();
    obj.insert("model".to_string(), Value::String(internal_model.clone()));
    if stream {
        obj.insert("stream".to_string(), Value::Bool(true));
    }

    Ok(ProxyRequest {
        request_id,
        endpoint,
        payload: Value::Object(obj),
        external_model,
        internal_model,
        stream,
    })
}

fn check_input(endpoint: Endpoint, obj: &Map<String, Value>) -> Result<()> {
    let field = endpoint.input_field();
    let present = match obj.get(field) {
        None | Some(Value::Null) => false,
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::String(s)) => endpoint != Endpoint::ChatCompletions && !s.is_empty(),
        Some(_) => endpoint != Endpoint::ChatCompletions,
    };
    if present {
        Ok(())
    } else if endpoint == Endpoint::ChatCompletions {
        Err(GatewayError::invalid_param(
            field,
            "'messages' must be a non-empty array",
        ))
    } else {
        Err(GatewayError::invalid_param(
            field,
            format!("'{field}' is required and must not be empty"),
        ))
    }
}

/// Sampling-parameter sanity notes. Never blocks a request.
pub fn advisory_warnings(obj: &Map<String, Value>) -> Vec<String> {
    let mut warnings = Vec::new();
    let mut check_range = |key: &str, lo: f64, hi: f64| match obj.get(key) {
        None | Some(Value::Null) => {}
        Some(Value::Number(n)) => {
            if let Some(v) = n.as_f64() {
                if v < lo || v > hi {
                    warnings.push(format!("'{key}'={v} is outside [{lo}, {hi}]"));
                }
            }
        }
        Some(other) => warnings.push(format!("'{key}' is not a number: {other}")),
    };
    check_range("temperature", 0.0, 2.0);
    check_range("top_p", 0.0, 1.0);

    match obj.get("max_tokens") {
        None | Some(Value::Null) => {}
        Some(Value::Number(n)) if n.as_u64().is_some_and(|v| v > 0) => {}
        Some(other) => warnings.push(format!("'max_tokens' is not a positive integer: {other}")),
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapping() -> ModelMapping {
        ModelMapping::from_pairs([("gpt-3.5-turbo", "llama-3.1-instruct-13b")]).unwrap()
    }

    fn translate(endpoint: Endpoint, body: Value) -> Result<ProxyRequest> {
        translate_request(
            endpoint,
            &serde_json::to_vec(&body).unwrap(),
            &mapping(),
            "gpt-3.5-turbo",
            "req_test".to_string(),
        )
    }

    #[test]
    fn test_chat_request_is_forward_mapped() {
        let req = translate(
            Endpoint::ChatCompletions,
            json!({
                "model": "gpt-3.5-turbo",
                "messages": [{"role": "user", "content": "Hello"}],
                "temperature": 0.7,
                "frequency_penalty": 0.0
            }),
        )
        .unwrap();

        assert_eq!(req.external_model, "gpt-3.5-turbo");
        assert_eq!(req.internal_model, "llama-3.1-instruct-13b");
        assert_eq!(req.payload["model"], "llama-3.1-instruct-13b");
        assert_eq!(req.payload["temperature"], 0.7);
        assert_eq!(req.payload["frequency_penalty"], 0.0);
        assert!(!req.stream);
        assert!(req.payload.get("stream").is_none());
    }

    #[test]
    fn test_missing_model_uses_default() {
        let req = translate(
            Endpoint::ChatCompletions,
            json!({"messages": [{"role": "user", "content": "Hi"}]}),
        )
        .unwrap();
        assert_eq!(req.external_model, "gpt-3.5-turbo");
        assert_eq!(req.internal_model, "llama-3.1-instruct-13b");
    }

    #[test]
    fn test_unknown_model_passes_through() {
        let req = translate(
            Endpoint::ChatCompletions,
            json!({"model": "mistral-7b", "messages": [{"role": "user", "content": "Hi"}]}),
        )
        .unwrap();
        assert_eq!(req.internal_model, "mistral-7b");
    }

    #[test]
    fn test_missing_or_empty_messages_rejected() {
        for body in [
            json!({"model": "gpt-3.5-turbo"}),
            json!({"model": "gpt-3.5-turbo", "messages": []}),
            json!({"model": "gpt-3.5-turbo", "messages": "hello"}),
        ] {
            match translate(Endpoint::ChatCompletions, body) {
                Err(GatewayError::Validation { param, .. }) => {
                    assert_eq!(param.as_deref(), Some("messages"));
                }
                other => panic!("expected validation error, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_completion_prompt_forms() {
        assert!(translate(Endpoint::Completions, json!({"prompt": "Once upon"})).is_ok());
        assert!(translate(Endpoint::Completions, json!({"prompt": ["a", "b"]})).is_ok());
        assert!(translate(Endpoint::Completions, json!({"prompt": ""})).is_err());
        assert!(translate(Endpoint::Completions, json!({})).is_err());
    }

    #[test]
    fn test_embeddings_require_input_and_reject_stream() {
        assert!(translate(Endpoint::Embeddings, json!({"input": "text"})).is_ok());
        assert!(translate(Endpoint::Embeddings, json!({"input": []})).is_err());
        assert!(translate(
            Endpoint::Embeddings,
            json!({"input": "text", "stream": true})
        )
        .is_err());
    }

    #[test]
    fn test_streaming_flag_is_forced_true() {
        let req = translate(
            Endpoint::ChatCompletions,
            json!({"messages": [{"role": "user", "content": "Hi"}], "stream": true}),
        )
        .unwrap();
        assert!(req.stream);
        assert_eq!(req.payload["stream"], true);
    }

    #[test]
    fn test_invalid_json_and_non_object_rejected() {
        let err = translate_request(
            Endpoint::ChatCompletions,
            b"{not json",
            &mapping(),
            "gpt-3.5-turbo",
            "req_test".to_string(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("Invalid JSON"));

        assert!(translate(Endpoint::ChatCompletions, json!([1, 2, 3])).is_err());
    }

    #[test]
    fn test_out_of_range_sampling_is_advisory_only() {
        let req = translate(
            Endpoint::ChatCompletions,
            json!({
                "messages": [{"role": "user", "content": "Hi"}],
                "temperature": 9.5,
                "top_p": "high",
                "max_tokens": -3
            }),
        )
        .unwrap();
        assert_eq!(req.payload["temperature"], 9.5);
        assert_eq!(req.payload["top_p"], "high");
        assert_eq!(req.payload["max_tokens"], -3);

        let Value::Object(obj) = req.payload else { unreachable!() };
        assert_eq!(advisory_warnings(&obj).len(), 3);
    }
}
