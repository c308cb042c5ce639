//! Grid proxy server: a read-only HTTP gateway over the indexer's Postgres
//! tables, plus the background refresher that keeps node telemetry current.

pub mod bus;
pub mod cli;
pub mod config;
pub mod error;
pub mod http;
pub mod refresher;
pub mod store;

pub use config::ServerConfig;
pub use error::StoreError;
pub use http::{router, serve, AppState, HttpError};
pub use refresher::{NodeManager, RefresherConfig};
pub use store::{Database, PostgresDatabase, TelemetryStore};

/// Crate version, suffixed with the commit when `GIT_COMMIT` is set at build
/// time.
pub fn build_version() -> String {
    match option_env!("GIT_COMMIT") {
        Some(commit) if !commit.is_empty() => format!("{}-{}", env!("CARGO_PKG_VERSION"), commit),
        _ => env!("CARGO_PKG_VERSION").to_string(),
    }
}
