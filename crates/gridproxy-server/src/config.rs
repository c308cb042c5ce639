use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::refresher::RefresherConfig;
use crate::store::postgres::PostgresConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub postgres: PostgresConfig,
    /// `host:port`, or `:port` for every interface.
    pub address: String,
    pub log_level: String,
    /// TLS is terminated in front of the gateway; the flag only silences the
    /// startup warning.
    pub no_cert: bool,
    /// Base URL of the message-bus relay. Without it node telemetry is not
    /// refreshed.
    pub relay_url: Option<String>,
    /// Twin the gateway sends bus messages as.
    pub bus_twin_id: u32,
    pub refresher: RefresherConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            postgres: PostgresConfig::default(),
            address: String::from(":443"),
            log_level: String::from("info"),
            no_cert: false,
            relay_url: None,
            bus_twin_id: 0,
            refresher: RefresherConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        parse_listen_addr(&self.address)
    }
}

/// Accepts `host:port` and the `:port` shorthand for all interfaces.
pub fn parse_listen_addr(raw: &str) -> anyhow::Result<SocketAddr> {
    if let Some(port) = raw.strip_prefix(':') {
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid port in address {raw:?}"))?;
        return Ok(SocketAddr::from(([0, 0, 0, 0], port)));
    }
    if let Ok(addr) = raw.parse() {
        return Ok(addr);
    }
    raw.to_socket_addrs()
        .with_context(|| format!("invalid listen address {raw:?}"))?
        .next()
        .with_context(|| format!("{raw:?} did not resolve to any address"))
}
