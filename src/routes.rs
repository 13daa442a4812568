//! The route table.
//!
//! Recognized routes are listed explicitly; anything else is
//! [`Route::Passthrough`] and is forwarded verbatim to a backend.

use axum::http::Method;

use crate::translate::request::Endpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Health,
    Models,
    ChatCompletions,
    Completions,
    Embeddings,
    Passthrough,
}

impl Route {
    pub const KNOWN: [Route; 5] = [
        Route::Health,
        Route::Models,
        Route::ChatCompletions,
        Route::Completions,
        Route::Embeddings,
    ];

    pub fn path(self) -> Option<&'static str> {
        match self {
            Route::Health => Some("/health"),
            Route::Models => Some(crate::models::MODELS_PATH),
            Route::Passthrough => None,
            other => other.endpoint().map(Endpoint::path),
        }
    }

    pub fn method(self) -> Option<Method> {
        match self {
            Route::Health | Route::Models => Some(Method::GET),
            Route::ChatCompletions | Route::Completions | Route::Embeddings => Some(Method::POST),
            Route::Passthrough => None,
        }
    }

    pub fn endpoint(self) -> Option<Endpoint> {
        match self {
            Route::ChatCompletions => Some(Endpoint::ChatCompletions),
            Route::Completions => Some(Endpoint::Completions),
            Route::Embeddings => Some(Endpoint::Embeddings),
            _ => None,
        }
    }

    pub fn requires_auth(self) -> bool {
        self != Route::Health
    }

    /// Which route serves `method path`.
    pub fn classify(method: &Method, path: &str) -> Route {
        Route::KNOWN
            .into_iter()
            .find(|r| r.path() == Some(path) && r.method().as_ref() == Some(method))
            .unwrap_or(Route::Passthrough)
    }
}
