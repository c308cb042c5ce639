//! In-memory grid used by the HTTP scenario tests. It derives free capacity,
//! rentability and liveness the same way the Postgres views and predicates
//! do, so requests can run end to end without a database.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gridproxy_server::store::schema::{reserved_mru, ACTIVE_STATES, RESERVED_SRU};
use gridproxy_server::store::{
    unix_now, Database, FetchTarget, NodeTelemetry, Result, StoreError, TelemetryReport,
    TelemetryStore,
};
use gridproxy_server::{router, AppState};
use gridproxy_types::{
    Capacity, Contract, ContractDetails, ContractFilter, Counters, Farm, FarmFilter, Limit,
    Location, NameContractDetails, Node, NodeContractDetails, NodeFilter, PublicConfig, PublicIp,
    RentContractDetails, StatsFilter, Status, Twin, TwinFilter,
};

pub const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct NodeRecord {
    pub node_id: u32,
    pub farm_id: u32,
    pub twin_id: u32,
    pub country: String,
    pub city: String,
    pub updated_at: u64,
    pub total: Capacity,
    pub public_config: PublicConfig,
    pub certification: String,
}

impl NodeRecord {
    pub fn new(node_id: u32, farm_id: u32) -> Self {
        Self {
            node_id,
            farm_id,
            twin_id: 1000 + node_id,
            updated_at: unix_now(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FarmRecord {
    pub farm_id: u32,
    pub name: String,
    pub twin_id: u32,
    pub dedicated: bool,
    pub public_ips: Vec<PublicIp>,
}

#[derive(Debug, Clone)]
pub struct NodeContractRecord {
    pub contract_id: u64,
    pub twin_id: u32,
    pub node_id: u32,
    pub state: String,
    pub resources: Capacity,
}

#[derive(Debug, Clone)]
pub struct RentContractRecord {
    pub contract_id: u64,
    pub twin_id: u32,
    pub node_id: u32,
    pub state: String,
}

#[derive(Debug, Clone)]
pub struct NameContractRecord {
    pub contract_id: u64,
    pub twin_id: u32,
    pub name: String,
    pub state: String,
}

/// What the resources view holds for one node.
#[derive(Debug, Clone, Copy, Default)]
struct Derived {
    used: Capacity,
    free_mru: u64,
    free_hru: u64,
    free_sru: u64,
    states: usize,
}

#[derive(Default)]
pub struct MemoryGrid {
    pub nodes: Vec<NodeRecord>,
    pub farms: Vec<FarmRecord>,
    pub twins: Vec<Twin>,
    pub node_contracts: Vec<NodeContractRecord>,
    pub rent_contracts: Vec<RentContractRecord>,
    pub name_contracts: Vec<NameContractRecord>,
    pub telemetry: Mutex<BTreeMap<u32, NodeTelemetry>>,
}

fn active(state: &str) -> bool {
    ACTIVE_STATES.contains(&state)
}

fn eq_ci(value: &str, wanted: &Option<String>) -> bool {
    wanted
        .as_ref()
        .map_or(true, |w| value.to_lowercase() == w.to_lowercase())
}

fn contains_ci(value: &str, wanted: &Option<String>) -> bool {
    wanted
        .as_ref()
        .map_or(true, |w| value.to_lowercase().contains(&w.to_lowercase()))
}

fn at_least(value: u64, min: Option<u64>) -> bool {
    min.map_or(true, |min| value >= min)
}

fn equals<T: PartialEq>(value: T, wanted: Option<T>) -> bool {
    wanted.map_or(true, |w| value == w)
}

fn flag(set: bool, wanted: Option<bool>) -> bool {
    wanted.map_or(true, |w| set == w)
}

fn page<T>(items: Vec<T>, limit: &Limit) -> (Vec<T>, u64) {
    let total = items.len() as u64;
    let rows = items
        .into_iter()
        .skip(limit.offset() as usize)
        .take(limit.size as usize)
        .collect();
    (rows, if limit.ret_count { total } else { 0 })
}

impl MemoryGrid {
    pub fn into_router(self) -> axum::Router {
        let grid: Arc<dyn Database> = Arc::new(self);
        router(Arc::new(AppState::new(grid, "test")))
    }

    fn farm_of(&self, farm_id: u32) -> Option<&FarmRecord> {
        self.farms.iter().find(|f| f.farm_id == farm_id)
    }

    fn rent_of(&self, node_id: u32) -> Option<&RentContractRecord> {
        self.rent_contracts
            .iter()
            .find(|r| r.node_id == node_id && active(&r.state))
    }

    fn derive(&self, node: &NodeRecord) -> Derived {
        let contracts: Vec<&NodeContractRecord> = self
            .node_contracts
            .iter()
            .filter(|c| c.node_id == node.node_id && active(&c.state))
            .collect();
        let sum = |f: fn(&Capacity) -> u64| contracts.iter().map(|c| f(&c.resources)).sum::<u64>();
        let (cru, mru, hru, sru) = (sum(|c| c.cru), sum(|c| c.mru), sum(|c| c.hru), sum(|c| c.sru));
        let reserved = reserved_mru(node.total.mru);
        let states: BTreeSet<&str> = contracts.iter().map(|c| c.state.as_str()).collect();
        Derived {
            used: Capacity {
                cru,
                mru: mru + reserved,
                hru,
                sru: sru + RESERVED_SRU,
            },
            free_mru: node.total.mru.saturating_sub(mru + reserved),
            free_hru: node.total.hru.saturating_sub(hru),
            free_sru: node.total.sru.saturating_sub(sru + RESERVED_SRU),
            states: states.len(),
        }
    }

    fn project(&self, node: &NodeRecord, now: u64) -> Node {
        let derived = self.derive(node);
        let rent = self.rent_of(node.node_id);
        Node {
            node_id: node.node_id,
            farm_id: node.farm_id,
            twin_id: node.twin_id,
            country: node.country.clone(),
            city: node.city.clone(),
            updated_at: node.updated_at,
            total_resources: node.total,
            used_resources: derived.used,
            location: Location {
                country: node.country.clone(),
                city: node.city.clone(),
                ..Location::default()
            },
            public_config: node.public_config.clone(),
            status: Status::at(node.updated_at, now),
            certification_type: node.certification.clone(),
            dedicated: self.farm_of(node.farm_id).is_some_and(|f| f.dedicated),
            rent_contract_id: rent.map_or(0, |r| r.contract_id),
            rented_by_twin_id: rent.map_or(0, |r| r.twin_id),
            ..Node::default()
        }
    }

    fn matches(&self, node: &NodeRecord, filter: &NodeFilter, now: u64) -> Result<bool> {
        let derived = self.derive(node);
        let farm = self.farm_of(node.farm_id);
        let dedicated = farm.is_some_and(|f| f.dedicated);
        let farm_name = farm.map_or("", |f| f.name.as_str());
        let free_ips = farm.map_or(0, |f| f.public_ips.iter().filter(|ip| ip.contract_id == 0).count());
        let rent = self.rent_of(node.node_id);
        let rent_twin = rent.map(|r| r.twin_id);
        let rent_id = rent.map_or(0, |r| r.contract_id);
        let pc = &node.public_config;

        Ok(equals(Status::at(node.updated_at, now), filter.status()?)
            && at_least(derived.free_mru, filter.free_mru)
            && at_least(derived.free_hru, filter.free_hru)
            && at_least(derived.free_sru, filter.free_sru)
            && at_least(node.total.cru, filter.total_cru)
            && at_least(node.total.mru, filter.total_mru)
            && at_least(node.total.hru, filter.total_hru)
            && at_least(node.total.sru, filter.total_sru)
            && eq_ci(&node.country, &filter.country)
            && contains_ci(&node.country, &filter.country_contains)
            && eq_ci(&node.city, &filter.city)
            && contains_ci(&node.city, &filter.city_contains)
            && equals(u64::from(node.node_id), filter.node_id)
            && equals(u64::from(node.twin_id), filter.twin_id)
            && (filter.farm_ids.is_empty() || filter.farm_ids.contains(&u64::from(node.farm_id)))
            && eq_ci(farm_name, &filter.farm_name)
            && contains_ci(farm_name, &filter.farm_name_contains)
            && at_least(free_ips as u64, filter.free_ips)
            && flag(!pc.ipv4.is_empty(), filter.ipv4)
            && flag(!pc.ipv6.is_empty(), filter.ipv6)
            && flag(!pc.domain.is_empty(), filter.domain)
            && equals(dedicated, filter.dedicated)
            && equals((dedicated || derived.states == 0) && rent_id == 0, filter.rentable)
            && equals(rent_id != 0, filter.rented)
            && equals(u64::from(rent_twin.unwrap_or(0)), filter.rented_by)
            && filter.available_for.map_or(true, |t| match rent_twin {
                Some(twin) => u64::from(twin) == t,
                None => !dedicated,
            })
            && eq_ci(&node.certification, &filter.certification_type))
    }

    fn farm(&self, record: &FarmRecord) -> Farm {
        Farm {
            name: record.name.clone(),
            farm_id: record.farm_id,
            twin_id: record.twin_id,
            dedicated: record.dedicated,
            public_ips: record.public_ips.clone(),
            ..Farm::default()
        }
    }

    fn all_contracts(&self) -> Vec<Contract> {
        let node = self.node_contracts.iter().map(|c| Contract {
            contract_id: c.contract_id,
            twin_id: c.twin_id,
            state: c.state.clone(),
            created_at: 0,
            details: ContractDetails::Node(NodeContractDetails {
                node_id: c.node_id,
                ..NodeContractDetails::default()
            }),
            billing: Vec::new(),
        });
        let rent = self.rent_contracts.iter().map(|c| Contract {
            contract_id: c.contract_id,
            twin_id: c.twin_id,
            state: c.state.clone(),
            created_at: 0,
            details: ContractDetails::Rent(RentContractDetails { node_id: c.node_id }),
            billing: Vec::new(),
        });
        let name = self.name_contracts.iter().map(|c| Contract {
            contract_id: c.contract_id,
            twin_id: c.twin_id,
            state: c.state.clone(),
            created_at: 0,
            details: ContractDetails::Name(NameContractDetails {
                name: c.name.clone(),
            }),
            billing: Vec::new(),
        });
        node.chain(rent).chain(name).collect()
    }
}

#[async_trait]
impl Database for MemoryGrid {
    async fn nodes(&self, filter: &NodeFilter, limit: &Limit) -> Result<(Vec<Node>, u64)> {
        let now = unix_now();
        let mut matching = Vec::new();
        for node in &self.nodes {
            if self.matches(node, filter, now)? {
                matching.push(self.project(node, now));
            }
        }
        matching.sort_by_key(|n| {
            let preferred = filter
                .available_for
                .is_some_and(|t| u64::from(n.rented_by_twin_id) == t);
            (!preferred, n.node_id)
        });
        Ok(page(matching, limit))
    }

    async fn node(&self, node_id: u32) -> Result<Node> {
        self.nodes
            .iter()
            .find(|n| n.node_id == node_id)
            .map(|n| self.project(n, unix_now()))
            .ok_or(StoreError::NodeNotFound)
    }

    async fn farms(&self, filter: &FarmFilter, limit: &Limit) -> Result<(Vec<Farm>, u64)> {
        let mut farms: Vec<Farm> = self
            .farms
            .iter()
            .map(|f| self.farm(f))
            .filter(|f| {
                at_least(f.free_ips() as u64, filter.free_ips)
                    && at_least(f.public_ips.len() as u64, filter.total_ips)
                    && equals(u64::from(f.farm_id), filter.farm_id)
                    && equals(u64::from(f.twin_id), filter.twin_id)
                    && eq_ci(&f.name, &filter.name)
                    && contains_ci(&f.name, &filter.name_contains)
                    && equals(f.dedicated, filter.dedicated)
            })
            .collect();
        farms.sort_by_key(|f| f.farm_id);
        Ok(page(farms, limit))
    }

    async fn farm(&self, farm_id: u32) -> Result<Farm> {
        self.farm_of(farm_id)
            .map(|f| self.farm(f))
            .ok_or(StoreError::FarmNotFound)
    }

    async fn twins(&self, filter: &TwinFilter, limit: &Limit) -> Result<(Vec<Twin>, u64)> {
        let mut twins: Vec<Twin> = self
            .twins
            .iter()
            .filter(|t| {
                equals(u64::from(t.twin_id), filter.twin_id)
                    && equals(t.account_id.as_str(), filter.account_id.as_deref())
            })
            .cloned()
            .collect();
        twins.sort_by_key(|t| t.twin_id);
        Ok(page(twins, limit))
    }

    async fn contracts(
        &self,
        filter: &ContractFilter,
        limit: &Limit,
    ) -> Result<(Vec<Contract>, u64)> {
        let state = filter.state()?;
        let kind = filter.kind()?;
        let mut contracts: Vec<Contract> = self
            .all_contracts()
            .into_iter()
            .filter(|c| {
                equals(c.contract_id, filter.contract_id)
                    && equals(u64::from(c.twin_id), filter.twin_id)
                    && equals(c.details.kind(), kind)
                    && state.map_or(true, |s| c.state.eq_ignore_ascii_case(s))
            })
            .collect();
        contracts.sort_by_key(|c| c.contract_id);
        Ok(page(contracts, limit))
    }

    async fn counters(&self, filter: &StatsFilter) -> Result<Counters> {
        let now = unix_now();
        let status = filter.status()?;
        let nodes: Vec<&NodeRecord> = self
            .nodes
            .iter()
            .filter(|n| equals(Status::at(n.updated_at, now), status))
            .collect();
        let access = |n: &&&NodeRecord| {
            !n.public_config.ipv4.is_empty() || !n.public_config.ipv6.is_empty()
        };

        let mut counters = Counters {
            twins: self.twins.len() as u64,
            public_ips: self.farms.iter().map(|f| f.public_ips.len() as u64).sum(),
            contracts: (self.node_contracts.len()
                + self.rent_contracts.len()
                + self.name_contracts.len()) as u64,
            nodes: nodes.len() as u64,
            farms: nodes.iter().map(|n| n.farm_id).collect::<BTreeSet<_>>().len() as u64,
            countries: nodes.iter().map(|n| n.country.as_str()).collect::<BTreeSet<_>>().len()
                as u64,
            access_nodes: nodes.iter().filter(access).count() as u64,
            gateways: nodes
                .iter()
                .filter(access)
                .filter(|n| !n.public_config.domain.is_empty())
                .count() as u64,
            ..Counters::default()
        };
        for node in &nodes {
            counters.total_cru += node.total.cru;
            counters.total_sru += node.total.sru;
            counters.total_hru += node.total.hru;
            counters.total_mru += node.total.mru;
            *counters
                .nodes_distribution
                .entry(node.country.clone())
                .or_default() += 1;
        }
        Ok(counters)
    }
}

#[async_trait]
impl TelemetryStore for MemoryGrid {
    async fn fetch_targets(&self, offset: u64, limit: u64) -> Result<Vec<FetchTarget>> {
        let telemetry = self.telemetry.lock().unwrap();
        Ok(self
            .nodes
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .map(|n| {
                let record = telemetry.get(&n.node_id);
                FetchTarget {
                    node_id: n.node_id,
                    twin_id: n.twin_id,
                    retries: record.map_or(0, |r| r.retries),
                    last_fetch_attempt: record.and_then(|r| r.last_fetch_attempt),
                }
            })
            .collect())
    }

    async fn telemetry(&self, node_id: u32) -> Result<Option<NodeTelemetry>> {
        Ok(self.telemetry.lock().unwrap().get(&node_id).cloned())
    }

    async fn record_telemetry(&self, node_id: u32, report: &TelemetryReport, at: u64) -> Result<()> {
        let mut telemetry = self.telemetry.lock().unwrap();
        let record = telemetry.entry(node_id).or_default();
        record.report = report.clone();
        record.status = Status::Up;
        record.retries = 0;
        record.last_error = None;
        record.last_fetch_attempt = Some(at);
        record.last_fetch_success = Some(at);
        Ok(())
    }

    async fn record_failure(&self, node_id: u32, error: &str, at: u64) -> Result<()> {
        let mut telemetry = self.telemetry.lock().unwrap();
        let record = telemetry.entry(node_id).or_default();
        record.status = Status::Down;
        record.retries += 1;
        record.last_error = Some(error.to_string());
        record.last_fetch_attempt = Some(at);
        Ok(())
    }
}
