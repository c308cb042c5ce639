//! Entities as they appear on the wire.
//!
//! A node is held in a single internal shape ([`Node`]) and projected to the
//! nested-capacity shape ([`NodeWithNestedCapacity`]) at the edge.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Nominal interval between two node reports, in seconds.
pub const REPORT_INTERVAL_SECS: u64 = 3600;

/// Number of missed reports after which a node is considered down.
pub const NODE_STATE_FACTOR: u64 = 3;

/// Oldest `updated_at` (seconds) that still counts as alive at `now`.
pub fn up_threshold(now: u64) -> u64 {
    now.saturating_sub(NODE_STATE_FACTOR * REPORT_INTERVAL_SECS)
}

/// Liveness of a node derived from its last report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Up,
    #[default]
    Down,
}

impl Status {
    pub fn at(updated_at: u64, now: u64) -> Self {
        if updated_at >= up_threshold(now) {
            Status::Up
        } else {
            Status::Down
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Up => "up",
            Status::Down => "down",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "up" => Some(Status::Up),
            "down" => Some(Status::Down),
            _ => None,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource amounts: cores for cru, bytes for the rest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capacity {
    pub cru: u64,
    pub sru: u64,
    pub hru: u64,
    pub mru: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Location {
    pub country: String,
    pub city: String,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
}

/// Public network configuration of a node. Empty strings mean unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublicConfig {
    pub domain: String,
    pub gw4: String,
    pub gw6: String,
    pub ipv4: String,
    pub ipv6: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Node {
    pub node_id: u32,
    pub farm_id: u32,
    pub twin_id: u32,
    pub country: String,
    pub city: String,
    pub uptime: u64,
    pub created: u64,
    pub farming_policy_id: u32,
    pub updated_at: u64,
    #[serde(rename = "total_resources")]
    pub total_resources: Capacity,
    #[serde(rename = "used_resources")]
    pub used_resources: Capacity,
    pub location: Location,
    pub public_config: PublicConfig,
    pub status: Status,
    pub certification_type: String,
    pub dedicated: bool,
    pub secure: bool,
    pub virtualized: bool,
    pub rent_contract_id: u64,
    pub rented_by_twin_id: u32,
    pub serial_number: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityResult {
    #[serde(rename = "total_resources")]
    pub total: Capacity,
    #[serde(rename = "used_resources")]
    pub used: Capacity,
}

/// Node with its capacity wrapped under `capacity`, served by the v2 routes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeWithNestedCapacity {
    pub node_id: u32,
    pub farm_id: u32,
    pub twin_id: u32,
    pub country: String,
    pub city: String,
    pub uptime: u64,
    pub created: u64,
    pub farming_policy_id: u32,
    pub updated_at: u64,
    pub capacity: CapacityResult,
    pub location: Location,
    pub public_config: PublicConfig,
    pub status: Status,
    pub certification_type: String,
    pub dedicated: bool,
    pub secure: bool,
    pub virtualized: bool,
    pub rent_contract_id: u64,
    pub rented_by_twin_id: u32,
    pub serial_number: String,
}

impl From<Node> for NodeWithNestedCapacity {
    fn from(node: Node) -> Self {
        Self {
            node_id: node.node_id,
            farm_id: node.farm_id,
            twin_id: node.twin_id,
            country: node.country,
            city: node.city,
            uptime: node.uptime,
            created: node.created,
            farming_policy_id: node.farming_policy_id,
            updated_at: node.updated_at,
            capacity: CapacityResult {
                total: node.total_resources,
                used: node.used_resources,
            },
            location: node.location,
            public_config: node.public_config,
            status: node.status,
            certification_type: node.certification_type,
            dedicated: node.dedicated,
            secure: node.secure,
            virtualized: node.virtualized,
            rent_contract_id: node.rent_contract_id,
            rented_by_twin_id: node.rented_by_twin_id,
            serial_number: node.serial_number,
        }
    }
}

impl From<NodeWithNestedCapacity> for Node {
    fn from(node: NodeWithNestedCapacity) -> Self {
        Self {
            node_id: node.node_id,
            farm_id: node.farm_id,
            twin_id: node.twin_id,
            country: node.country,
            city: node.city,
            uptime: node.uptime,
            created: node.created,
            farming_policy_id: node.farming_policy_id,
            updated_at: node.updated_at,
            total_resources: node.capacity.total,
            used_resources: node.capacity.used,
            location: node.location,
            public_config: node.public_config,
            status: node.status,
            certification_type: node.certification_type,
            dedicated: node.dedicated,
            secure: node.secure,
            virtualized: node.virtualized,
            rent_contract_id: node.rent_contract_id,
            rented_by_twin_id: node.rented_by_twin_id,
            serial_number: node.serial_number,
        }
    }
}

/// A node projection enriched with the telemetry pulled from the node itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo<N> {
    #[serde(flatten)]
    pub node: N,
    #[serde(default)]
    pub hypervisor: String,
    #[serde(default, rename = "zosVersion")]
    pub zos_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub status: Status,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PublicIp {
    pub id: String,
    pub ip: String,
    pub contract_id: u64,
    pub gateway: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Farm {
    pub name: String,
    pub farm_id: u32,
    pub twin_id: u32,
    pub pricing_policy_id: u32,
    pub certification_type: String,
    pub stellar_address: String,
    pub dedicated: bool,
    pub public_ips: Vec<PublicIp>,
}

impl Farm {
    pub fn free_ips(&self) -> usize {
        self.public_ips.iter().filter(|ip| ip.contract_id == 0).count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Twin {
    pub twin_id: u32,
    pub account_id: String,
    pub relay: Option<String>,
    pub public_key: Option<String>,
}

/// Aggregate figures served by `/stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Counters {
    pub nodes: u64,
    pub farms: u64,
    pub countries: u64,
    pub total_cru: u64,
    pub total_sru: u64,
    pub total_mru: u64,
    pub total_hru: u64,
    pub public_ips: u64,
    pub access_nodes: u64,
    pub gateways: u64,
    pub twins: u64,
    pub contracts: u64,
    pub nodes_distribution: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub version: String,
}
