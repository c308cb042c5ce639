//! Typed read access to the indexed entities plus the gateway's own
//! telemetry records.

pub mod postgres;
pub mod schema;
pub mod sql;

use async_trait::async_trait;
use gridproxy_types::{
    Capacity, Contract, ContractFilter, Counters, Farm, FarmFilter, Limit, Node, NodeFilter,
    StatsFilter, Status, Twin, TwinFilter,
};

pub use crate::error::{Result, StoreError};
pub use postgres::PostgresDatabase;

/// Read side used by the HTTP surface. Listings return the page and the
/// total number of matches (0 unless `limit.ret_count` is set).
#[async_trait]
pub trait Database: TelemetryStore {
    async fn nodes(&self, filter: &NodeFilter, limit: &Limit) -> Result<(Vec<Node>, u64)>;

    /// Fails with [`StoreError::NodeNotFound`] for unknown ids.
    async fn node(&self, node_id: u32) -> Result<Node>;

    async fn farms(&self, filter: &FarmFilter, limit: &Limit) -> Result<(Vec<Farm>, u64)>;

    async fn farm(&self, farm_id: u32) -> Result<Farm>;

    async fn twins(&self, filter: &TwinFilter, limit: &Limit) -> Result<(Vec<Twin>, u64)>;

    async fn contracts(
        &self,
        filter: &ContractFilter,
        limit: &Limit,
    ) -> Result<(Vec<Contract>, u64)>;

    async fn counters(&self, filter: &StatsFilter) -> Result<Counters>;
}

/// A node as seen by the telemetry refresher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTarget {
    pub node_id: u32,
    pub twin_id: u32,
    pub retries: u32,
    /// Unix seconds; `None` until the first attempt.
    pub last_fetch_attempt: Option<u64>,
}

/// What a successful fetch learned from a node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetryReport {
    pub total: Capacity,
    pub used: Capacity,
    pub used_ipv4u: u64,
    pub hypervisor: String,
    pub zos_version: String,
}

/// Stored telemetry of one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeTelemetry {
    pub report: TelemetryReport,
    pub status: Status,
    pub retries: u32,
    pub last_error: Option<String>,
    pub last_fetch_attempt: Option<u64>,
    pub last_fetch_success: Option<u64>,
}

/// The only write path of the gateway.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// A page of nodes in `node_id` order with their retry bookkeeping.
    async fn fetch_targets(&self, offset: u64, limit: u64) -> Result<Vec<FetchTarget>>;

    async fn telemetry(&self, node_id: u32) -> Result<Option<NodeTelemetry>>;

    /// Stores a successful fetch: status up, retries reset.
    async fn record_telemetry(&self, node_id: u32, report: &TelemetryReport, at: u64)
        -> Result<()>;

    /// Stores a failed fetch: status down, retries incremented.
    async fn record_failure(&self, node_id: u32, error: &str, at: u64) -> Result<()>;
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}
