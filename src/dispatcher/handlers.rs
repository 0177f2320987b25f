//! Route handlers implementing the Dispatcher's public contract (§4.3).

use std::sync::Arc;

use actix_web::web::{Data, Payload};
use actix_web::{HttpRequest, HttpResponse};
use bytes::Bytes;

use crate::config::ConfigSnapshot;
use crate::dispatcher::body;
use crate::error::ProxyError;
use crate::registry::Registry;

pub struct AppState {
    pub registry: Arc<Registry>,
    pub config: ConfigSnapshot,
}

/// Resolves `group_id`/`canonical_id` to a live member and forwards `body`,
/// holding the cross-group exclusivity permit (if any) only across
/// activation (§4.5) — never across the forwarded request/response, which
/// every one of the three dispatch pipelines below must honor identically.
async fn activate_and_forward(
    state: &Data<AppState>,
    group_id: &str,
    canonical_id: &str,
    req: &HttpRequest,
    body: Bytes,
) -> Result<HttpResponse, ProxyError> {
    let group = state
        .registry
        .group(group_id)
        .await
        .ok_or_else(|| ProxyError::NotFound { model_name: canonical_id.to_string() })?;

    let process = {
        let _exclusivity_permit = match state.registry.exclusivity_gate_for(group_id).await {
            Some(tag) => Some(state.registry.acquire_exclusivity(&tag).await),
            None => None,
        };
        group.activate_member(canonical_id).await?
    };

    process.forward(req, body).await
}

/// The shared pipeline behind every OpenAI-shaped JSON endpoint: cap the
/// body, extract the model name, resolve it, rewrite on alias, strip
/// sensitive headers, and forward.
pub async fn dispatch_json(
    state: &Data<AppState>,
    req: &HttpRequest,
    payload: Payload,
) -> Result<HttpResponse, ProxyError> {
    let raw_body = body::read_capped_body(payload, state.config.body_cap_bytes).await?;
    let model_name = body::extract_model_name_json(&raw_body)?;

    let resolution = state.registry.resolve(&model_name).await?;

    let body_to_forward = match &resolution.rewrite_to {
        Some(rewrite) => body::rewrite_model_name_json(&raw_body, rewrite)?,
        None => raw_body,
    };

    activate_and_forward(state, &resolution.group_id, &resolution.canonical_id, req, body_to_forward).await
}

/// Multipart endpoints (audio family): the model name comes from a form
/// field rather than a JSON key; the rest of the pipeline is identical.
pub async fn dispatch_multipart(
    state: &Data<AppState>,
    req: &HttpRequest,
    payload: Payload,
) -> Result<HttpResponse, ProxyError> {
    let raw_body = body::read_capped_body(payload, state.config.body_cap_bytes).await?;
    let boundary = body::multipart_boundary(req)
        .ok_or_else(|| ProxyError::BadRequest("missing multipart boundary".to_string()))?;
    let model_name = body::extract_model_name_multipart(&raw_body, &boundary, state.config.multipart_memory_cap_bytes)
        .await?
        .ok_or_else(|| ProxyError::BadRequest("request body is missing the 'model' field".to_string()))?;

    let resolution = state.registry.resolve(&model_name).await?;

    activate_and_forward(state, &resolution.group_id, &resolution.canonical_id, req, raw_body).await
}

pub async fn chat_completions(state: Data<AppState>, req: HttpRequest, payload: Payload) -> Result<HttpResponse, ProxyError> {
    dispatch_json(&state, &req, payload).await
}

pub async fn completions(state: Data<AppState>, req: HttpRequest, payload: Payload) -> Result<HttpResponse, ProxyError> {
    dispatch_json(&state, &req, payload).await
}

pub async fn embeddings(state: Data<AppState>, req: HttpRequest, payload: Payload) -> Result<HttpResponse, ProxyError> {
    dispatch_json(&state, &req, payload).await
}

pub async fn images(state: Data<AppState>, req: HttpRequest, payload: Payload) -> Result<HttpResponse, ProxyError> {
    dispatch_json(&state, &req, payload).await
}

pub async fn audio(state: Data<AppState>, req: HttpRequest, payload: Payload) -> Result<HttpResponse, ProxyError> {
    dispatch_multipart(&state, &req, payload).await
}

/// `GET /v1/models`: a snapshot of all configured, non-`unlisted` models.
pub async fn list_models(state: Data<AppState>) -> HttpResponse {
    let mut data = Vec::new();
    for group_id in state.registry.iter_group_ids().await {
        let Some(group) = state.registry.group(&group_id).await else { continue };
        for model_id in group.member_ids() {
            if let Some(model) = state.config.models.get(model_id) {
                if !model.unlisted {
                    data.push(serde_json::json!({ "id": model_id, "object": "model" }));
                }
            }
        }
    }
    HttpResponse::Ok().json(serde_json::json!({ "object": "list", "data": data }))
}

/// `ANY /upstream/{modelId}/{tail:.*}`: raw passthrough, model id taken from
/// the path rather than the body; no body rewrite is applied.
pub async fn upstream_passthrough(
    state: Data<AppState>,
    req: HttpRequest,
    payload: Payload,
    path: actix_web::web::Path<(String, String)>,
) -> Result<HttpResponse, ProxyError> {
    let (model_id, _tail) = path.into_inner();
    let raw_body = body::read_capped_body(payload, state.config.body_cap_bytes).await?;

    let resolution = state.registry.resolve(&model_id).await?;

    activate_and_forward(&state, &resolution.group_id, &resolution.canonical_id, &req, raw_body).await
}

