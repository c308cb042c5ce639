//! [`Bus`] implementation over a relay's HTTP API.
//!
//! A call posts an envelope to `/twin/{dst}`, which answers with the
//! identifier of a return queue, then polls `/twin/{dst}/{retqueue}` until
//! the reply shows up or the deadline passes.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use super::{Bus, BusError};

/// Message envelope understood by the relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Envelope {
    pub ver: u32,
    pub uid: String,
    pub cmd: String,
    pub exp: u64,
    #[serde(rename = "try")]
    pub retry: u32,
    pub dat: String,
    pub src: u32,
    pub dst: Vec<u32>,
    pub ret: String,
    pub shm: String,
    pub now: u64,
    pub err: String,
}

#[derive(Debug, Deserialize)]
struct MessageIdentifier {
    retqueue: String,
}

#[derive(Debug, Clone)]
pub struct RelayBus {
    http: reqwest::Client,
    base_url: String,
    source_twin: u32,
    expiration: Duration,
    poll_interval: Duration,
}

impl RelayBus {
    pub fn new(base_url: &str, source_twin: u32, expiration: Duration) -> Result<Self, BusError> {
        let http = reqwest::Client::builder().timeout(expiration).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            source_twin,
            expiration,
            poll_interval: Duration::from_millis(250),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn envelope(&self, twin_id: u32, cmd: &str, payload: &Value) -> Result<Envelope, BusError> {
        let data = serde_json::to_vec(payload).map_err(|e| BusError::Decode {
            cmd: cmd.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Envelope {
            ver: 1,
            uid: uuid::Uuid::new_v4().to_string(),
            cmd: cmd.to_string(),
            exp: self.expiration.as_secs(),
            retry: 1,
            dat: STANDARD.encode(data),
            src: self.source_twin,
            dst: vec![twin_id],
            now: crate::store::unix_now(),
            ..Envelope::default()
        })
    }

    async fn submit(&self, twin_id: u32, envelope: &Envelope) -> Result<String, BusError> {
        let response = self
            .http
            .post(format!("{}/twin/{}", self.base_url, twin_id))
            .json(envelope)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BusError::Http {
                status: status.as_u16(),
                body,
            });
        }
        let id: MessageIdentifier = response.json().await?;
        Ok(id.retqueue)
    }

    async fn poll(&self, twin_id: u32, retqueue: &str) -> Result<Option<Envelope>, BusError> {
        let response = self
            .http
            .get(format!("{}/twin/{}/{}", self.base_url, twin_id, retqueue))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BusError::Http {
                status: status.as_u16(),
                body,
            });
        }
        let mut replies: Vec<Envelope> = response.json().await?;
        Ok(if replies.is_empty() {
            None
        } else {
            Some(replies.swap_remove(0))
        })
    }
}

/// Extracts the JSON payload of a reply.
fn decode_reply(twin_id: u32, cmd: &str, reply: Envelope) -> Result<Value, BusError> {
    if !reply.err.is_empty() {
        return Err(BusError::Remote {
            twin_id,
            message: reply.err,
        });
    }
    let decode_err = |reason: String| BusError::Decode {
        cmd: cmd.to_string(),
        reason,
    };
    let raw = STANDARD
        .decode(reply.dat.as_bytes())
        .map_err(|e| decode_err(e.to_string()))?;
    if raw.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&raw).map_err(|e| decode_err(e.to_string()))
}

#[async_trait]
impl Bus for RelayBus {
    async fn call(&self, twin_id: u32, cmd: &str, payload: Value) -> Result<Value, BusError> {
        let envelope = self.envelope(twin_id, cmd, &payload)?;
        let deadline = Instant::now() + self.expiration;
        let retqueue = self.submit(twin_id, &envelope).await?;
        debug!(twin_id, cmd, %retqueue, "message submitted to relay");

        loop {
            if let Some(reply) = self.poll(twin_id, &retqueue).await? {
                return decode_reply(twin_id, cmd, reply);
            }
            if Instant::now() + self.poll_interval > deadline {
                return Err(BusError::Timeout(self.expiration));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
