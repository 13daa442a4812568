//! Bearer-token gate in front of every API route except `/health`.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::config::AuthConfig;
use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Default)]
pub struct AuthGate {
    enabled: bool,
    keys: HashSet<String>,
}

impl AuthGate {
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            enabled: config.enabled,
            keys: config
                .valid_api_keys
                .iter()
                .filter(|k| !k.is_empty())
                .cloned()
                .collect(),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn check(&self, headers: &HeaderMap) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let Some(value) = headers.get(header::AUTHORIZATION) else {
            return Err(GatewayError::auth("Missing bearer token"));
        };
        let token = value
            .to_str()
            .ok()
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim);

        match token {
            Some(t) if self.keys.contains(t) => Ok(()),
            Some(_) => Err(GatewayError::auth("Invalid API key")),
            None => Err(GatewayError::auth(
                "Authorization header must use the Bearer scheme",
            )),
        }
    }
}

/// Middleware: reject before any body parsing or backend contact.
pub async fn require_bearer(
    State(gate): State<Arc<AuthGate>>,
    req: Request,
    next: Next,
) -> Response {
    match gate.check(req.headers()) {
        Ok(()) => next.run(req).await,
        Err(err) => {
            tracing::warn!(
                method = %req.method(),
                path = %req.uri().path(),
                error = %err,
                "Rejected unauthenticated request"
            );
            err.into_response()
        }
    }
}
