//! The externally visible model list.
//!
//! Ids from the mapping table come first, in table order, followed by whatever
//! the serving backend reports (reverse-mapped, duplicates dropped).

use std::collections::HashSet;

use axum::http::{HeaderMap, Method};
use chrono::Utc;

use crate::dispatch::Dispatcher;
use crate::logging::{LogLevel, SharedLogger};
use crate::mapping::ModelMapping;
use crate::translate::openai_types::{ModelList, ModelObject};

pub const MODELS_PATH: &str = "/v1/models";
const LOCAL_OWNER: &str = "local";

/// Fetch the model ids the serving backend reports, as internal ids.
///
/// Returns `None` if no backend could be asked or the answer was unusable.
pub async fn fetch_backend_models(
    dispatcher: &Dispatcher,
    request_id: &str,
    headers: &HeaderMap,
    logger: &SharedLogger,
) -> Option<(String, Vec<ModelObject>)> {
    let reply = match dispatcher
        .fetch(request_id, Method::GET, MODELS_PATH, headers, None)
        .await
    {
        Ok(reply) => reply,
        Err(e) => {
            logger.request(
                LogLevel::Warn,
                "models",
                request_id,
                format!("No backend could list models: {e}"),
            );
            return None;
        }
    };

    if !reply.is_success() {
        logger.request(
            LogLevel::Warn,
            "models",
            request_id,
            format!(
                "{} returned status {} when listing models",
                reply.candidate.backend.name, reply.status
            ),
        );
        return None;
    }

    match serde_json::from_slice::<ModelList>(&reply.body) {
        Ok(list) => Some((reply.candidate.backend.name.clone(), list.data)),
        Err(e) => {
            tracing::warn!(
                request_id,
                backend = %reply.candidate.backend.name,
                error = %e,
                "Unparseable model list"
            );
            None
        }
    }
}

/// Merge mapping-table ids with backend-reported ids.
pub fn merge_model_list(
    mapping: &ModelMapping,
    backend: Option<(String, Vec<ModelObject>)>,
    now_unix: i64,
) -> ModelList {
    let mut seen = HashSet::new();
    let mut data = Vec::new();

    for id in mapping.external_ids() {
        if seen.insert(id.to_string()) {
            data.push(ModelObject {
                id: id.to_string(),
                object: "model".to_string(),
                created: now_unix,
                owned_by: Some(LOCAL_OWNER.to_string()),
            });
        }
    }

    if let Some((backend_name, models)) = backend {
        for model in models {
            let id = mapping.map_reverse(&model.id).to_string();
            if seen.insert(id.clone()) {
                data.push(ModelObject {
                    id,
                    object: "model".to_string(),
                    created: if model.created > 0 { model.created } else { now_unix },
                    owned_by: model.owned_by.or_else(|| Some(backend_name.clone())),
                });
            }
        }
    }

    ModelList {
        object: "list".to_string(),
        data,
    }
}

pub async fn list_models(
    dispatcher: &Dispatcher,
    mapping: &ModelMapping,
    request_id: &str,
    headers: &HeaderMap,
    logger: &SharedLogger,
) -> ModelList {
    let backend = fetch_backend_models(dispatcher, request_id, headers, logger).await;
    merge_model_list(mapping, backend, Utc::now().timestamp())
}
