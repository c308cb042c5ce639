use std::sync::Arc;

use axum::extract::{Path, RawQuery, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use gridproxy_types::{
    ContractFilter, FarmFilter, Limit, Node, NodeFilter, NodeInfo, NodeStatus, QueryParams,
    StatsFilter, TwinFilter, Version,
};
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use super::{AppState, HttpError};
use crate::refresher::{refresh_node, FetchRequest};

type AppResult<T> = Result<T, HttpError>;

const COUNT: HeaderName = HeaderName::from_static("count");
const SIZE: HeaderName = HeaderName::from_static("size");
const PAGES: HeaderName = HeaderName::from_static("pages");

const INDEX: &str = "Welcome to the grid proxy.

Endpoints:
  /farms /twins /contracts /stats
  /nodes /nodes/{id} /nodes/{id}/status
  /gateways /gateways/{id} /gateways/{id}/status
  /version /ping

The same set is served with nested node capacity under /api/v2.
";

/// One route set, parameterised on how a node is projected.
pub(super) fn routes<N>() -> Router<Arc<AppState>>
where
    N: From<Node> + Serialize + Send + 'static,
{
    Router::new()
        .route("/", get(index))
        .route("/ping", get(ping))
        .route("/version", get(version))
        .route("/farms", get(farms))
        .route("/twins", get(twins))
        .route("/contracts", get(contracts))
        .route("/stats", get(stats))
        .route("/nodes", get(nodes::<N>))
        .route("/gateways", get(gateways::<N>))
        .route("/nodes/:node_id", get(node::<N>))
        .route("/gateways/:node_id", get(node::<N>))
        .route("/nodes/:node_id/status", get(node_status))
        .route("/gateways/:node_id/status", get(node_status))
}

async fn index() -> &'static str {
    INDEX
}

async fn ping() -> Json<serde_json::Value> {
    Json(json!({ "ping": "pong" }))
}

async fn version(State(state): State<Arc<AppState>>) -> Json<Version> {
    Json(Version {
        version: state.version.clone(),
    })
}

async fn nodes<N>(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
) -> AppResult<Response>
where
    N: From<Node> + Serialize + Send + 'static,
{
    let query = query.unwrap_or_default();
    let filter = NodeFilter::from_query_string(&query)?;
    list_nodes::<N>(&state, filter, &query).await
}

async fn gateways<N>(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
) -> AppResult<Response>
where
    N: From<Node> + Serialize + Send + 'static,
{
    let query = query.unwrap_or_default();
    let filter = NodeFilter {
        domain: Some(true),
        ipv4: Some(true),
        ..NodeFilter::from_query_string(&query)?
    };
    list_nodes::<N>(&state, filter, &query).await
}

async fn list_nodes<N>(state: &AppState, filter: NodeFilter, query: &str) -> AppResult<Response>
where
    N: From<Node> + Serialize + Send + 'static,
{
    filter.validate()?;
    // Node listings always report their total.
    let limit = Limit::from_query_string(query)?.with_count();
    let (nodes, count) = state.db.nodes(&filter, &limit).await?;
    let nodes: Vec<N> = nodes.into_iter().map(N::from).collect();
    Ok(listing(nodes, &limit, count))
}

async fn node<N>(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> AppResult<Json<NodeInfo<N>>>
where
    N: From<Node> + Serialize + Send + 'static,
{
    let node_id = parse_node_id(&node_id)?;
    let node = state.db.node(node_id).await?;
    let (hypervisor, zos_version) = node_telemetry(&state, &node).await?;
    Ok(Json(NodeInfo {
        node: N::from(node),
        hypervisor,
        zos_version,
    }))
}

/// Hypervisor and zos version from the last successful fetch, or fetched now
/// when nothing is cached and a bus is configured.
async fn node_telemetry(state: &AppState, node: &Node) -> AppResult<(String, String)> {
    let cached = state
        .db
        .telemetry(node.node_id)
        .await?
        .filter(|t| t.last_fetch_success.is_some());
    if let Some(telemetry) = cached {
        return Ok((telemetry.report.hypervisor, telemetry.report.zos_version));
    }
    let Some(client) = &state.nodes else {
        return Ok((String::new(), String::new()));
    };

    debug!(node_id = node.node_id, "no cached telemetry, asking the node");
    let request = FetchRequest {
        node_id: node.node_id,
        twin_id: node.twin_id,
    };
    let report = refresh_node(state.db.as_ref(), client, request, state.rpc_timeout).await?;
    Ok((report.hypervisor, report.zos_version))
}

async fn node_status(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> AppResult<Json<NodeStatus>> {
    let node_id = parse_node_id(&node_id)?;
    let node = state.db.node(node_id).await?;
    Ok(Json(NodeStatus {
        status: node.status,
    }))
}

async fn farms(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
) -> AppResult<Response> {
    let query = query.unwrap_or_default();
    let filter = FarmFilter::from_query_string(&query)?;
    let limit = Limit::from_query_string(&query)?;
    let (farms, count) = state.db.farms(&filter, &limit).await?;
    Ok(listing(farms, &limit, count))
}

async fn twins(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
) -> AppResult<Response> {
    let query = query.unwrap_or_default();
    let filter = TwinFilter::from_query_string(&query)?;
    let limit = Limit::from_query_string(&query)?;
    let (twins, count) = state.db.twins(&filter, &limit).await?;
    Ok(listing(twins, &limit, count))
}

async fn contracts(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
) -> AppResult<Response> {
    let query = query.unwrap_or_default();
    let filter = ContractFilter::from_query_string(&query)?;
    filter.validate()?;
    let limit = Limit::from_query_string(&query)?;
    let (contracts, count) = state.db.contracts(&filter, &limit).await?;
    Ok(listing(contracts, &limit, count))
}

async fn stats(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
) -> AppResult<Response> {
    let filter = StatsFilter::from_query_string(query.as_deref().unwrap_or_default())?;
    filter.status()?;
    let counters = state.db.counters(&filter).await?;
    Ok(Json(counters).into_response())
}

fn parse_node_id(raw: &str) -> AppResult<u32> {
    raw.parse()
        .map_err(|_| HttpError::BadRequest(format!("invalid node id: {raw}")))
}

/// JSON array plus the `count`/`size`/`pages` headers when a total was asked for.
fn listing<T: Serialize>(items: Vec<T>, limit: &Limit, count: u64) -> Response {
    let mut response = Json(items).into_response();
    if limit.ret_count {
        let headers = response.headers_mut();
        headers.insert(COUNT, HeaderValue::from(count));
        headers.insert(SIZE, HeaderValue::from(limit.size));
        headers.insert(PAGES, HeaderValue::from(limit.pages(count)));
    }
    response
}
