//! RPC over the message bus to the nodes themselves.

pub mod relay;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gridproxy_types::Capacity;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::store::TelemetryReport;

pub use relay::RelayBus;

pub const CMD_STATISTICS: &str = "zos.statistics.get";
pub const CMD_HYPERVISOR: &str = "zos.system.hypervisor";
pub const CMD_VERSION: &str = "zos.system.version";

#[derive(Debug, Error)]
pub enum BusError {
    #[error("relay request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("relay answered HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("twin {twin_id} replied with an error: {message}")]
    Remote { twin_id: u32, message: String },

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("malformed reply to {cmd}: {reason}")]
    Decode { cmd: String, reason: String },
}

/// Request/reply call addressed to a twin.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn call(&self, twin_id: u32, cmd: &str, payload: Value) -> Result<Value, BusError>;
}

/// Per-resource counters as reported by a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NodeResources {
    pub cru: u64,
    pub sru: u64,
    pub hru: u64,
    pub mru: u64,
    pub ipv4u: u64,
}

impl From<NodeResources> for Capacity {
    fn from(r: NodeResources) -> Self {
        Capacity {
            cru: r.cru,
            sru: r.sru,
            hru: r.hru,
            mru: r.mru,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NodeStatistics {
    pub total: NodeResources,
    pub used: NodeResources,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ZosVersion {
    pub zos: String,
    pub zinit: String,
}

/// Typed calls against a node's twin.
#[derive(Clone)]
pub struct NodeClient {
    bus: Arc<dyn Bus>,
}

impl NodeClient {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }

    pub async fn statistics(&self, twin_id: u32) -> Result<NodeStatistics, BusError> {
        self.typed(twin_id, CMD_STATISTICS).await
    }

    pub async fn hypervisor(&self, twin_id: u32) -> Result<String, BusError> {
        self.typed(twin_id, CMD_HYPERVISOR).await
    }

    pub async fn version(&self, twin_id: u32) -> Result<ZosVersion, BusError> {
        self.typed(twin_id, CMD_VERSION).await
    }

    /// Statistics, hypervisor and version under one shared deadline.
    pub async fn telemetry(
        &self,
        twin_id: u32,
        timeout: Duration,
    ) -> Result<TelemetryReport, BusError> {
        let fetch = async {
            let stats = self.statistics(twin_id).await?;
            let hypervisor = self.hypervisor(twin_id).await?;
            let version = self.version(twin_id).await?;
            Ok(TelemetryReport {
                total: stats.total.into(),
                used: stats.used.into(),
                used_ipv4u: stats.used.ipv4u,
                hypervisor,
                zos_version: version.zos,
            })
        };
        tokio::time::timeout(timeout, fetch)
            .await
            .map_err(|_| BusError::Timeout(timeout))?
    }

    async fn typed<T: DeserializeOwned>(&self, twin_id: u32, cmd: &str) -> Result<T, BusError> {
        let reply = self.bus.call(twin_id, cmd, Value::Null).await?;
        serde_json::from_value(reply).map_err(|e| BusError::Decode {
            cmd: cmd.to_string(),
            reason: e.to_string(),
        })
    }
}

impl std::fmt::Debug for NodeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeClient").finish_non_exhaustive()
    }
}
