//! Exponential backoff around any [`GridProxyClient`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use gridproxy_types::{
    Contract, ContractFilter, Counters, Farm, FarmFilter, Limit, Node, NodeFilter, NodeInfo,
    NodeStatus, StatsFilter, Twin, TwinFilter, Version,
};
use rand::Rng;
use tokio::time::Instant;
use tracing::warn;

use crate::client::GridProxyClient;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Delay after the first failure (default: 500ms).
    pub initial_interval: Duration,
    /// Growth factor between attempts (default: 1.5).
    pub multiplier: f64,
    /// Each delay is drawn from `delay * [1 - r, 1 + r]` (default: 0.5).
    pub randomization_factor: f64,
    /// Upper bound of a single delay before jitter (default: 60s).
    pub max_interval: Duration,
    /// Give up once this much time has passed since the first attempt
    /// (default: 2 minutes).
    pub max_elapsed: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            randomization_factor: 0.5,
            max_interval: Duration::from_secs(60),
            max_elapsed: Duration::from_secs(120),
        }
    }
}

impl RetryConfig {
    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.initial_interval.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_interval.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    fn jittered(&self, base: Duration) -> Duration {
        let r = self.randomization_factor.clamp(0.0, 1.0);
        if r == 0.0 {
            return base;
        }
        let base_ms = base.as_millis() as f64;
        let ms = rand::thread_rng().gen_range(base_ms * (1.0 - r)..=base_ms * (1.0 + r));
        Duration::from_millis(ms as u64)
    }
}

/// Retries every call of the wrapped client on transport errors and 5xx
/// answers. Client errors (4xx) come back on the first attempt.
#[derive(Debug, Clone)]
pub struct RetryingClient<C> {
    inner: C,
    config: RetryConfig,
}

impl<C: GridProxyClient> RetryingClient<C> {
    pub fn new(inner: C) -> Self {
        Self::with_config(inner, RetryConfig::default())
    }

    pub fn with_config(inner: C, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    async fn retry<T, F, Fut>(&self, command: &'static str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let mut attempt = 0u32;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };
            let delay = self.config.jittered(self.config.backoff(attempt));
            if start.elapsed() + delay > self.config.max_elapsed {
                return Err(err);
            }
            warn!(
                command,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "grid proxy call failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl<C: GridProxyClient> GridProxyClient for RetryingClient<C> {
    async fn ping(&self) -> Result<()> {
        self.retry("ping", || self.inner.ping()).await
    }

    async fn version(&self) -> Result<Version> {
        self.retry("version", || self.inner.version()).await
    }

    async fn nodes(&self, filter: &NodeFilter, limit: &Limit) -> Result<(Vec<Node>, u64)> {
        self.retry("nodes", || self.inner.nodes(filter, limit)).await
    }

    async fn gateways(&self, filter: &NodeFilter, limit: &Limit) -> Result<(Vec<Node>, u64)> {
        self.retry("gateways", || self.inner.gateways(filter, limit))
            .await
    }

    async fn node(&self, node_id: u32) -> Result<NodeInfo<Node>> {
        self.retry("node", || self.inner.node(node_id)).await
    }

    async fn gateway(&self, node_id: u32) -> Result<NodeInfo<Node>> {
        self.retry("gateway", || self.inner.gateway(node_id)).await
    }

    async fn node_status(&self, node_id: u32) -> Result<NodeStatus> {
        self.retry("node_status", || self.inner.node_status(node_id))
            .await
    }

    async fn farms(&self, filter: &FarmFilter, limit: &Limit) -> Result<(Vec<Farm>, u64)> {
        self.retry("farms", || self.inner.farms(filter, limit)).await
    }

    async fn twins(&self, filter: &TwinFilter, limit: &Limit) -> Result<(Vec<Twin>, u64)> {
        self.retry("twins", || self.inner.twins(filter, limit)).await
    }

    async fn contracts(
        &self,
        filter: &ContractFilter,
        limit: &Limit,
    ) -> Result<(Vec<Contract>, u64)> {
        self.retry("contracts", || self.inner.contracts(filter, limit))
            .await
    }

    async fn counters(&self, filter: &StatsFilter) -> Result<Counters> {
        self.retry("counters", || self.inner.counters(filter)).await
    }
}
