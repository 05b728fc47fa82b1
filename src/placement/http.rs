//! HTTP API of a placement driver node

use crate::common::Error;
use crate::consensus::{GroupId, ReplicaId};
use crate::placement::driver::PlacementDriver;
use axum::extract::{Form, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct PdState {
    pub driver: Arc<PlacementDriver>,
}

/// Form and query parameters. Values stay strings so a bad one gets a
/// readable 400 instead of an extractor rejection.
#[derive(Debug, Default, Deserialize)]
struct Params {
    nid: Option<String>,
    addr: Option<String>,
    rid: Option<String>,
    key: Option<String>,
}

impl Params {
    fn number(value: &Option<String>, name: &str) -> Result<u64, Response> {
        value
            .as_deref()
            .and_then(|v| v.trim().parse().ok())
            .filter(|v| *v != 0)
            .ok_or_else(|| bad_request(format!("Param {} isn't a valid value", name)))
    }

    fn nid(&self) -> Result<u64, Response> {
        Self::number(&self.nid, "nid")
    }

    fn rid(&self) -> Result<GroupId, Response> {
        Self::number(&self.rid, "rid")
    }

    fn addr(&self) -> Result<String, Response> {
        match self.addr.as_deref().map(str::trim) {
            Some(addr) if !addr.is_empty() => Ok(addr.to_string()),
            _ => Err(bad_request("Param addr isn't a valid value".to_string())),
        }
    }
}

fn bad_request(msg: String) -> Response {
    (StatusCode::BAD_REQUEST, msg).into_response()
}

fn failure(status: StatusCode, err: Error) -> Response {
    tracing::warn!("Request failed ({}): {}", status, err);
    (status, err.to_string()).into_response()
}

pub fn create_router(state: PdState) -> Router {
    Router::new()
        .route("/pd/join", axum::routing::post(pd_join))
        .route("/pd/leave", axum::routing::post(pd_leave))
        .route("/region/create", axum::routing::post(region_create))
        .route("/region/start", axum::routing::post(region_start))
        .route("/region/members", axum::routing::get(region_members))
        .route("/region/list", axum::routing::get(region_list))
        .route("/key/locate", axum::routing::get(key_locate))
        .route("/health", axum::routing::get(health))
        .route("/metrics", axum::routing::get(metrics))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn pd_join(State(state): State<PdState>, Form(params): Form<Params>) -> Response {
    let (nid, addr) = match (params.nid(), params.addr()) {
        (Ok(nid), Ok(addr)) => (nid, addr),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };
    match state.driver.join_metadata_group(nid, &addr).await {
        Ok(()) => (StatusCode::OK, "join success").into_response(),
        Err(e) => failure(StatusCode::BAD_REQUEST, e),
    }
}

async fn pd_leave(State(state): State<PdState>, Form(params): Form<Params>) -> Response {
    let nid = match params.nid() {
        Ok(nid) => nid,
        Err(resp) => return resp,
    };
    match state.driver.leave_metadata_group(nid).await {
        Ok(()) => (StatusCode::OK, "leave success").into_response(),
        Err(e) => failure(StatusCode::BAD_REQUEST, e),
    }
}

async fn region_create(State(state): State<PdState>) -> Response {
    let rf = state.driver.config().replication_factor;
    match state.driver.create_region(rf).await {
        Ok(id) => (StatusCode::OK, id.to_string()).into_response(),
        Err(e) => failure(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

async fn region_start(State(state): State<PdState>, Form(params): Form<Params>) -> Response {
    let (rid, nid): (GroupId, ReplicaId) = match (params.rid(), params.nid()) {
        (Ok(rid), Ok(nid)) => (rid, nid),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };
    match state.driver.start_region(rid, nid, None).await {
        Ok(()) => (
            StatusCode::OK,
            format!("success start region {} replica {}", rid, nid),
        )
            .into_response(),
        Err(e) => failure(StatusCode::BAD_REQUEST, e),
    }
}

async fn region_members(State(state): State<PdState>, Query(params): Query<Params>) -> Response {
    let rid = match params.rid() {
        Ok(rid) => rid,
        Err(resp) => return resp,
    };
    match state.driver.get_membership(rid).await {
        Ok(membership) => axum::Json(membership).into_response(),
        Err(e) => failure(StatusCode::BAD_REQUEST, e),
    }
}

async fn region_list(State(state): State<PdState>) -> Response {
    match state.driver.list_regions().await {
        Ok(regions) => axum::Json(regions).into_response(),
        Err(e) => failure(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

async fn key_locate(State(state): State<PdState>, Query(params): Query<Params>) -> Response {
    let key = params.key.unwrap_or_default();
    match state.driver.locate_region_by_key(&key).await {
        Ok(id) => axum::Json(id).into_response(),
        Err(e) => failure(StatusCode::BAD_REQUEST, e),
    }
}

async fn health(State(state): State<PdState>) -> impl IntoResponse {
    let alerts = state.driver.alerts();
    axum::Json(json!({
        "status": if alerts.is_empty() { "healthy" } else { "degraded" },
        "node_id": state.driver.node_id(),
        "raft_addr": state.driver.raft_addr(),
        "hosted_regions": state.driver.hosted_regions(),
        "alerts": alerts,
        "uptime_seconds": state.driver.metrics().uptime_seconds(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics(State(state): State<PdState>) -> impl IntoResponse {
    (StatusCode::OK, state.driver.metrics().to_prometheus())
}
