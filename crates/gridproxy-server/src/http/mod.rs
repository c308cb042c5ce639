//! The HTTP query surface: v1 routes at the root, v2 (nested capacity)
//! under `/api/v2`.

mod error;
mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use gridproxy_types::{Node, NodeWithNestedCapacity};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::bus::NodeClient;
use crate::store::Database;

pub use error::HttpError;

pub const V2_PREFIX: &str = "/api/v2";

/// Shared by every handler.
pub struct AppState {
    pub db: Arc<dyn Database>,
    /// Used for on-demand telemetry of a single node when nothing is cached.
    pub nodes: Option<NodeClient>,
    pub rpc_timeout: Duration,
    pub version: String,
}

impl AppState {
    pub fn new(db: Arc<dyn Database>, version: impl Into<String>) -> Self {
        Self {
            db,
            nodes: None,
            rpc_timeout: Duration::from_secs(30),
            version: version.into(),
        }
    }

    pub fn with_node_client(mut self, client: NodeClient, rpc_timeout: Duration) -> Self {
        self.nodes = Some(client);
        self.rpc_timeout = rpc_timeout;
        self
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    Router::new()
        .merge(handlers::routes::<Node>())
        .nest(V2_PREFIX, handlers::routes::<NodeWithNestedCapacity>())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serves until `shutdown` is cancelled, then drains in-flight requests.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "grid proxy listening");

    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
