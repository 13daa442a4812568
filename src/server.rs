use crate::auth::{require_bearer, AuthGate};
use crate::config::GatewayConfig;
use crate::dispatch::{should_forward_header, Dispatcher, OpenResponse};
use crate::error::{GatewayError, Result};
use crate::health::HealthReporter;
use crate::logging::{LogLevel, SharedLogger};
use crate::mapping::ModelMapping;
use crate::models;
use crate::registry::BackendRegistry;
use crate::relay::{relay_body, spawn_relay, RelayContext};
use crate::routes::Route;
use crate::translate::request::{new_request_id, translate_request, Endpoint, ProxyRequest};
use crate::translate::response::{fill_missing_usage, normalize_error, normalize_success};

use axum::body::Body;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, on, MethodFilter, MethodRouter};
use axum::{Json, Router};
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

const REQUEST_ID_HEADER: &str = "x-request-id";

pub struct AppState {
    pub config: GatewayConfig,
    pub mapping: Arc<ModelMapping>,
    pub dispatcher: Dispatcher,
    pub auth: Arc<AuthGate>,
    pub health: HealthReporter,
    pub logger: SharedLogger,
}

impl AppState {
    pub fn from_config(
        config: GatewayConfig,
        client: reqwest::Client,
        logger: SharedLogger,
    ) -> Result<Self> {
        let registry = Arc::new(BackendRegistry::from_config(&config)?);
        Ok(Self {
            mapping: Arc::new(config.model_mapping.clone()),
            dispatcher: Dispatcher::new(client, Arc::clone(&registry), logger.clone()),
            auth: Arc::new(AuthGate::from_config(&config.authentication)),
            health: HealthReporter::new(registry),
            logger,
            config,
        })
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let mut api = Router::new();
    for route in Route::KNOWN.into_iter().filter(|r| r.requires_auth()) {
        if let Some(path) = route.path() {
            api = api.route(path, known_route(route).fallback(handle_passthrough));
        }
    }

    let mut router = api
        .fallback(handle_passthrough)
        .layer(from_fn_with_state(Arc::clone(&state.auth), require_bearer))
        .route(
            Route::Health.path().unwrap_or("/health"),
            known_route(Route::Health),
        );

    if state.config.server.cors_enabled {
        router = router.layer(cors_layer(&state.config.server.cors_origins));
    }

    let body_limit = match state.config.server.max_body_bytes {
        Some(limit) => DefaultBodyLimit::max(limit),
        None => DefaultBodyLimit::disable(),
    };

    router
        .layer(body_limit)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn known_route(route: Route) -> MethodRouter<Arc<AppState>> {
    let filter = route
        .method()
        .and_then(|m| MethodFilter::try_from(m).ok())
        .unwrap_or(MethodFilter::POST);
    match route {
        Route::Health => on(filter, handle_health),
        Route::Models => on(filter, handle_models),
        Route::ChatCompletions => on(filter, handle_chat_completions),
        Route::Completions => on(filter, handle_completions),
        Route::Embeddings => on(filter, handle_embeddings),
        Route::Passthrough => any(handle_passthrough),
    }
}

fn read_body(body: std::result::Result<Bytes, BytesRejection>) -> Result<Bytes> {
    body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            GatewayError::PayloadTooLarge {
                message: rejection.body_text(),
            }
        } else {
            GatewayError::validation(format!(
                "Failed to read request body: {}",
                rejection.body_text()
            ))
        }
    })
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([header::HeaderName::from_static(REQUEST_ID_HEADER)]);

    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

async fn handle_chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Response {
    handle_translated(state, Endpoint::ChatCompletions, headers, body).await
}

async fn handle_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Response {
    handle_translated(state, Endpoint::Completions, headers, body).await
}

async fn handle_embeddings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Response {
    handle_translated(state, Endpoint::Embeddings, headers, body).await
}

async fn handle_translated(
    state: Arc<AppState>,
    endpoint: Endpoint,
    headers: HeaderMap,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Response {
    let request_id = new_request_id();
    let started = Instant::now();

    let translated = read_body(body).and_then(|body| {
        translate_request(
            endpoint,
            &body,
            &state.mapping,
            &state.config.default_model,
            request_id.clone(),
        )
    });

    let result = match translated {
        Ok(req) => {
            state.logger.request(
                LogLevel::Info,
                "server",
                &request_id,
                format!(
                    "{} model={} -> {} stream={}",
                    endpoint.path(),
                    req.external_model,
                    req.internal_model,
                    req.stream
                ),
            );
            if state.config.logging.include_request_body {
                state.logger.request_with_context(
                    LogLevel::Debug,
                    "server",
                    &request_id,
                    "Request body",
                    req.payload.clone(),
                );
            }

            if req.stream {
                stream_completion(&state, &req, &headers).await
            } else {
                complete(&state, &req, &headers).await
            }
        }
        Err(e) => Err(e),
    };

    let mut response = match result {
        Ok(response) => response,
        Err(err) => {
            let status = err.status();
            let level = if status.is_server_error() {
                LogLevel::Error
            } else {
                LogLevel::Warn
            };
            state
                .logger
                .request(level, "server", &request_id, format!("{} failed: {}", endpoint.path(), err));
            err.into_response()
        }
    };

    tracing::info!(
        request_id = %request_id,
        path = endpoint.path(),
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Request handled"
    );
    attach_request_id(&mut response, &request_id);
    response
}

async fn complete(state: &AppState, req: &ProxyRequest, headers: &HeaderMap) -> Result<Response> {
    let reply = state.dispatcher.send(req, headers).await?;

    if !reply.is_success() {
        return Err(GatewayError::BackendApplication {
            status: reply.status,
            envelope: normalize_error(reply.status, &reply.body),
        });
    }

    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::OK);
    match normalize_success(&reply.body, req.endpoint, &state.mapping, Utc::now().timestamp()) {
        Some(mut value) => {
            if state.config.response.add_usage_stats && fill_missing_usage(&mut value) {
                tracing::debug!(request_id = %req.request_id, "Estimated missing usage");
            }
            if state.config.logging.include_response_body {
                state.logger.request_with_context(
                    LogLevel::Debug,
                    "server",
                    &req.request_id,
                    "Response body",
                    value.clone(),
                );
            }
            Ok((status, Json(value)).into_response())
        }
        None => {
            tracing::warn!(
                request_id = %req.request_id,
                backend = %reply.candidate.backend.name,
                "Backend reply is not a JSON object, forwarding as-is"
            );
            let content_type = reply
                .content_type()
                .cloned()
                .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
            Ok(Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, content_type)
                .body(Body::from(reply.body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
        }
    }
}

async fn stream_completion(
    state: &AppState,
    req: &ProxyRequest,
    headers: &HeaderMap,
) -> Result<Response> {
    let OpenResponse {
        candidate,
        response,
    } = state.dispatcher.open_stream(req, headers).await?;

    let status = response.status().as_u16();
    if !response.status().is_success() {
        let body = match tokio::time::timeout(candidate.backend.timeout, response.bytes()).await {
            Ok(Ok(body)) => body,
            _ => Bytes::new(),
        };
        return Err(GatewayError::BackendApplication {
            status,
            envelope: normalize_error(status, &body),
        });
    }

    let ctx = RelayContext {
        request_id: req.request_id.clone(),
        backend_name: candidate.backend.name.clone(),
        mapping: Arc::clone(&state.mapping),
        idle_timeout: candidate.backend.timeout,
        channel_capacity: state.config.relay.channel_capacity,
        health: Some((Arc::clone(state.dispatcher.registry()), candidate.slot)),
        logger: state.logger.clone(),
    };
    let (rx, _relay) = spawn_relay(response.bytes_stream(), ctx);

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no")
        .body(relay_body(rx))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

/// Forward anything the gateway does not translate, unchanged, to the first reachable backend.
async fn handle_passthrough(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Response {
    let request_id = new_request_id();
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path())
        .to_string();
    let body = match read_body(body) {
        Ok(body) => (!body.is_empty()).then_some(body),
        Err(err) => {
            let mut response = err.into_response();
            attach_request_id(&mut response, &request_id);
            return response;
        }
    };

    state.logger.request(
        LogLevel::Info,
        "passthrough",
        &request_id,
        format!("{method} {path_and_query}"),
    );

    let mut response = match state
        .dispatcher
        .open(&request_id, method, &path_and_query, &headers, body)
        .await
    {
        Ok(OpenResponse { response, .. }) => {
            let status =
                StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut builder = Response::builder().status(status);
            for (name, value) in response.headers() {
                if should_forward_header(name.as_str()) {
                    builder = builder.header(name, value);
                }
            }
            builder
                .body(Body::from_stream(response.bytes_stream()))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(err) => {
            state.logger.request(
                LogLevel::Error,
                "passthrough",
                &request_id,
                format!("{path_and_query} failed: {err}"),
            );
            err.into_response()
        }
    };

    attach_request_id(&mut response, &request_id);
    response
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Response {
    Json(state.health.report()).into_response()
}

async fn handle_models(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let request_id = new_request_id();
    let list = models::list_models(
        &state.dispatcher,
        &state.mapping,
        &request_id,
        &headers,
        &state.logger,
    )
    .await;
    let mut response = Json(list).into_response();
    attach_request_id(&mut response, &request_id);
    response
}

fn attach_request_id(response: &mut Response, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
}
