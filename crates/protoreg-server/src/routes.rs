//! HTTP surface (§4.9, §6.1): `.well-known`, `/health`, and the `/v1/*`
//! registry endpoints, each a thin adapter over [`AppState`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::extract::{ConnectInfo, DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderMap, Request};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use protoreg_graph::MissingTargetPolicy;
use protoreg_types::{Manifest, RegistryError};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::ApiError;
use crate::provenance::{self, DsseEnvelope};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/registry/{urn}", get(get_registry).put(put_registry))
        .route("/resolve", get(resolve))
        .route("/query", post(query))
        .layer(DefaultBodyLimit::max(state.config.json_limit))
        .layer(middleware::from_fn_with_state(state.clone(), guard));

    Router::new()
        .route("/.well-known/{service}", get(well_known))
        .route("/health", get(health))
        .nest("/v1", v1)
        .with_state(state)
}

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);

/// API-key check then rate-limit check, in that order (§4.9, §6.1): an
/// unauthenticated caller never gets to consume rate-limit budget. Every
/// request is assigned a monotonic id and logged with its outcome.
async fn guard(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let request_id = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let presented = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    let expected = state.config.api_key.as_deref().unwrap_or_default();
    if presented != Some(expected) {
        tracing::warn!(request_id, %method, %path, client = %addr.ip(), "rejected: bad api key");
        return ApiError(RegistryError::Unauthorized).into_response();
    }
    if !state.rate_limiter.check(addr.ip()) {
        tracing::warn!(request_id, %method, %path, client = %addr.ip(), "rejected: rate limited");
        return ApiError(RegistryError::RateLimited).into_response();
    }

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert("cache-control", "no-store".parse().unwrap());

    tracing::info!(
        request_id,
        %method,
        %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
        "request completed"
    );
    response
}

async fn well_known(Path(service): Path<String>) -> impl IntoResponse {
    Json(json!({
        "service": service,
        "version": env!("CARGO_PKG_VERSION"),
        "links": {
            "registry": "/v1/registry/{urn}",
            "resolve": "/v1/resolve",
            "query": "/v1/query",
        },
        "auth": "x-api-key",
    }))
}

async fn health(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state
        .db
        .health()
        .map_err(|e| ApiError(RegistryError::Internal { reason: e.to_string() }))?;
    Ok(Json(json!({
        "status": "ok",
        "registry": {
            "driver": snapshot.driver,
            "wal": snapshot.wal,
            "schema_version": snapshot.schema_version,
            "records": snapshot.records,
        },
        "rateLimit": {
            "windowMs": state.config.rate_limit.window_ms,
            "max": state.config.rate_limit.max,
        },
    })))
}

async fn get_registry(
    Path(urn): Path<String>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .db
        .get_manifest(&urn)
        .map_err(|e| ApiError(RegistryError::Internal { reason: e.to_string() }))?
        .ok_or_else(|| ApiError(RegistryError::NotFound { what: format!("urn {urn}") }))?;
    let provenance = state
        .db
        .get_provenance(&urn)
        .map_err(|e| ApiError(RegistryError::Internal { reason: e.to_string() }))?;

    Ok(Json(json!({
        "manifest": record.manifest,
        "digest": record.digest,
        "issuer": record.issuer,
        "signature": record.signature,
        "provenance": provenance,
    })))
}

#[derive(Debug, Deserialize)]
struct PutRegistryRequest {
    manifest: Manifest,
    #[serde(default)]
    issuer: Option<String>,
    #[serde(default)]
    signature: Option<serde_json::Value>,
    #[serde(default)]
    provenance: Option<DsseEnvelope>,
}

async fn put_registry(
    Path(urn): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<PutRegistryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.manifest.urn.as_str() != urn {
        return Err(ApiError(RegistryError::Validation {
            reason: format!("path urn {urn} does not match manifest urn {}", body.manifest.urn),
        }));
    }

    let provenance_summary = match &body.provenance {
        Some(envelope) => {
            let summary = provenance::verify(&state.config.provenance_keys, envelope)?;
            let envelope_json = serde_json::to_value(envelope)
                .map_err(|e| ApiError(RegistryError::Internal { reason: e.to_string() }))?;
            let digest = body
                .manifest
                .digest()
                .map_err(ApiError)?;
            state
                .db
                .insert_provenance(
                    &urn,
                    &envelope_json,
                    &envelope.payload_type,
                    &digest,
                    body.issuer.as_deref(),
                    summary.timestamp.as_deref(),
                )
                .map_err(|e| ApiError(RegistryError::Internal { reason: e.to_string() }))?;
            Some(summary)
        }
        None if state.config.require_provenance => {
            return Err(ApiError(RegistryError::ProvenanceInvalid {
                reason: "provenance is required but none was supplied".to_string(),
            }));
        }
        None => None,
    };

    let digest = body.manifest.digest().map_err(ApiError)?;
    state
        .db
        .upsert_manifest(&body.manifest, &digest, body.issuer.as_deref(), body.signature.as_ref())
        .map_err(|e| ApiError(RegistryError::Internal { reason: e.to_string() }))?;

    sync_in_memory_indexes(&state, &body.manifest);

    Ok(Json(json!({
        "status": "ok",
        "urn": urn,
        "digest": digest,
        "provenance": provenance_summary,
    })))
}

/// Keeps the process-lifetime catalog/graph consistent with the durable
/// store so `/v1/resolve` and agent-discovery queries reflect the latest
/// PUT without waiting for a full lifecycle registration (§4.8 is the
/// governed path; this is the network surface's simpler upsert contract).
fn sync_in_memory_indexes(state: &AppState, manifest: &Manifest) {
    let catalog = state.service.catalog();
    if catalog.contains(&manifest.urn) {
        let _ = catalog.remove(&manifest.urn);
    }
    if let Err(e) = catalog.add(manifest.clone()) {
        tracing::warn!(urn = %manifest.urn, error = %e, "failed to sync catalog after PUT");
    }

    let graph = state.service.graph();
    graph.add_node(manifest.urn.clone(), manifest.manifest_type);
    for dep in &manifest.dependencies {
        let _ = graph.add_edge(manifest.urn.clone(), dep.clone(), MissingTargetPolicy::InsertPlaceholder);
    }
}

#[derive(Debug, Deserialize)]
struct ResolveQuery {
    urn: String,
}

async fn resolve(
    Query(params): Query<ResolveQuery>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .db
        .get_manifest(&params.urn)
        .map_err(|e| ApiError(RegistryError::Internal { reason: e.to_string() }))?
        .ok_or_else(|| ApiError(RegistryError::NotFound { what: format!("urn {}", params.urn) }))?;
    let capabilities = provenance::extract_capabilities(&record.manifest);
    Ok(Json(json!({
        "manifest": record.manifest,
        "capabilities": capabilities,
    })))
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    capability: String,
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    capability: String,
    urns: Vec<String>,
}

async fn query(
    State(state): State<AppState>,
    Json(body): Json<QueryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let urns = state
        .db
        .find_by_capability(&body.capability)
        .map_err(|e| ApiError(RegistryError::Internal { reason: e.to_string() }))?;
    Ok(Json(QueryResponse {
        capability: body.capability,
        urns,
    }))
}

