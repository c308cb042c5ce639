//! Periodic node telemetry refresh.
//!
//! One supervisor pages through the nodes and hands the ones that are due to
//! a fixed pool of workers over a capacity-one channel, so enumeration
//! stalls while every worker is busy. Nodes that keep failing are retried
//! with an exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{BusError, NodeClient};
use crate::store::{unix_now, FetchTarget, TelemetryReport, TelemetryStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefresherConfig {
    pub workers: usize,
    pub period_secs: u64,
    pub page_size: u64,
    pub rpc_timeout_secs: u64,
}

impl Default for RefresherConfig {
    fn default() -> Self {
        Self {
            workers: 30,
            period_secs: 60,
            page_size: 20,
            rpc_timeout_secs: 30,
        }
    }
}

impl RefresherConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}

/// Wait before retrying a node that failed `retries` times in a row:
/// `2^clamp(retries - 3, 0, 5)` minutes.
pub fn backoff_wait(retries: u32) -> Duration {
    let power = retries.saturating_sub(3).min(5);
    Duration::from_secs(60 << power)
}

/// Whether `target` is due at `now` (unix seconds).
pub fn should_fetch(target: &FetchTarget, now: u64) -> bool {
    match target.last_fetch_attempt {
        None => true,
        Some(last) => now.saturating_sub(last) >= backoff_wait(target.retries).as_secs(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    pub node_id: u32,
    pub twin_id: u32,
}

/// Fetches one node and records the outcome either way.
pub async fn refresh_node<S: TelemetryStore + ?Sized>(
    store: &S,
    client: &NodeClient,
    request: FetchRequest,
    timeout: Duration,
) -> Result<TelemetryReport, BusError> {
    let FetchRequest { node_id, twin_id } = request;
    match client.telemetry(twin_id, timeout).await {
        Ok(report) => {
            match store.record_telemetry(node_id, &report, unix_now()).await {
                Ok(()) => debug!(node_id, twin_id, "node telemetry fetched"),
                Err(e) => error!(node_id, twin_id, error = %e, "couldn't store node telemetry"),
            }
            Ok(report)
        }
        Err(err) => {
            info!(node_id, twin_id, error = %err, "couldn't fetch node telemetry");
            if let Err(e) = store
                .record_failure(node_id, &err.to_string(), unix_now())
                .await
            {
                error!(node_id, twin_id, error = %e, "couldn't record node fetch failure");
            }
            Err(err)
        }
    }
}

pub struct NodeManager {
    store: Arc<dyn TelemetryStore>,
    client: NodeClient,
    config: RefresherConfig,
}

impl NodeManager {
    pub fn new(store: Arc<dyn TelemetryStore>, client: NodeClient, config: RefresherConfig) -> Self {
        Self {
            store,
            client,
            config,
        }
    }

    /// Runs until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let manager = Arc::new(self);
        let (tx, rx) = mpsc::channel::<FetchRequest>(1);
        let rx = Arc::new(Mutex::new(rx));

        let workers: Vec<JoinHandle<()>> = (0..manager.config.workers.max(1))
            .map(|_| tokio::spawn(manager.clone().worker(rx.clone(), shutdown.clone())))
            .collect();
        info!(workers = workers.len(), "node refresher started");

        let mut ticker = tokio::time::interval(Duration::from_secs(manager.config.period_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let queued = manager.enqueue_due(&tx, &shutdown).await;
                    debug!(queued, "refresh round dispatched");
                }
            }
        }

        drop(tx);
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "refresh worker ended abnormally");
            }
        }
        info!("node refresher stopped");
    }

    /// Pages through all nodes and queues the due ones. Returns how many
    /// were queued.
    async fn enqueue_due(
        &self,
        tx: &mpsc::Sender<FetchRequest>,
        shutdown: &CancellationToken,
    ) -> usize {
        let page_size = self.config.page_size.max(1);
        let mut offset = 0;
        let mut queued = 0;
        loop {
            let targets = match self.store.fetch_targets(offset, page_size).await {
                Ok(targets) => targets,
                Err(e) => {
                    error!(error = %e, "couldn't list nodes for refresh");
                    return queued;
                }
            };
            if targets.is_empty() {
                return queued;
            }
            offset += targets.len() as u64;

            let now = unix_now();
            for target in targets.iter().filter(|t| should_fetch(t, now)) {
                let request = FetchRequest {
                    node_id: target.node_id,
                    twin_id: target.twin_id,
                };
                tokio::select! {
                    _ = shutdown.cancelled() => return queued,
                    sent = tx.send(request) => {
                        if sent.is_err() {
                            return queued;
                        }
                        queued += 1;
                    }
                }
            }
        }
    }

    async fn worker(
        self: Arc<Self>,
        rx: Arc<Mutex<mpsc::Receiver<FetchRequest>>>,
        shutdown: CancellationToken,
    ) {
        loop {
            let next = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    _ = shutdown.cancelled() => None,
                    request = rx.recv() => request,
                }
            };
            let Some(request) = next else { break };
            // Failures are recorded by refresh_node.
            let _ = refresh_node(
                self.store.as_ref(),
                &self.client,
                request,
                self.config.rpc_timeout(),
            )
            .await;
        }
    }
}
