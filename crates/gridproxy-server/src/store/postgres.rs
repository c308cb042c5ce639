//! Queries against the indexer database.
//!
//! Column names and units follow the layout described in [`super::schema`]:
//! `certification`, `dedicated` and `number_of_public_ips` columns, and
//! `node.updated_at` in unix seconds.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use gridproxy_types::model::up_threshold;
use gridproxy_types::{
    Capacity, Contract, ContractBilling, ContractDetails, ContractFilter, Counters, Farm,
    FarmFilter, Limit, Location, NameContractDetails, Node, NodeContractDetails, NodeFilter,
    PublicConfig, PublicIp, RentContractDetails, StatsFilter, Status, Twin, TwinFilter,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::{debug, info, warn};

use super::schema::{self, SETUP};
use super::sql::{int, ints, narrow, unsigned, Builder, Cmp, Predicates};
use super::{
    unix_now, Database, FetchTarget, NodeTelemetry, Result, StoreError, TelemetryReport,
    TelemetryStore,
};

/// Connection settings for the indexer's database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub db: String,
    pub user: String,
    pub password: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            port: 5432,
            db: String::from("tfgrid-graphql"),
            user: String::from("postgres"),
            password: String::new(),
            max_connections: 16,
            connect_timeout_secs: 10,
        }
    }
}

const NODE_COLUMNS: &str = "
    node.node_id::bigint AS node_id,
    COALESCE(node.farm_id, 0)::bigint AS farm_id,
    COALESCE(node.twin_id, 0)::bigint AS twin_id,
    COALESCE(node.country, '') AS country,
    COALESCE(node.city, '') AS city,
    COALESCE(node.uptime, 0)::bigint AS uptime,
    COALESCE(node.created, 0)::bigint AS created,
    COALESCE(node.farming_policy_id, 0)::bigint AS farming_policy_id,
    COALESCE(node.updated_at, 0)::bigint AS updated_at,
    COALESCE(nodes_resources_view.total_cru, 0)::bigint AS total_cru,
    COALESCE(nodes_resources_view.total_sru, 0)::bigint AS total_sru,
    COALESCE(nodes_resources_view.total_hru, 0)::bigint AS total_hru,
    COALESCE(nodes_resources_view.total_mru, 0)::bigint AS total_mru,
    COALESCE(nodes_resources_view.used_cru, 0)::bigint AS used_cru,
    COALESCE(nodes_resources_view.used_sru, 0)::bigint AS used_sru,
    COALESCE(nodes_resources_view.used_hru, 0)::bigint AS used_hru,
    COALESCE(nodes_resources_view.used_mru, 0)::bigint AS used_mru,
    COALESCE(public_config.domain, '') AS domain,
    COALESCE(public_config.gw4, '') AS gw4,
    COALESCE(public_config.gw6, '') AS gw6,
    COALESCE(public_config.ipv4, '') AS ipv4,
    COALESCE(public_config.ipv6, '') AS ipv6,
    COALESCE(node.certification, '') AS certification,
    COALESCE(farm.dedicated, false) AS dedicated,
    COALESCE(node.secure, false) AS secure,
    COALESCE(node.virtualized, false) AS virtualized,
    COALESCE(node.serial_number, '') AS serial_number,
    COALESCE(rent_contract.contract_id, 0)::bigint AS rent_contract_id,
    COALESCE(rent_contract.twin_id, 0)::bigint AS rented_by_twin_id,
    convert_to_decimal(location.longitude)::float8 AS longitude,
    convert_to_decimal(location.latitude)::float8 AS latitude";

const NODE_JOINS: &str = "
    LEFT JOIN public_config ON node.id = public_config.node_id
    LEFT JOIN rent_contract ON rent_contract.node_id = node.node_id
        AND rent_contract.state IN ('Created', 'GracePeriod')
    LEFT JOIN farm ON node.farm_id = farm.farm_id
    LEFT JOIN location ON node.location_id = location.id";

const FARM_COLUMNS: &str = "
    farm.farm_id::bigint AS farm_id,
    COALESCE(farm.name, '') AS name,
    COALESCE(farm.twin_id, 0)::bigint AS twin_id,
    COALESCE(farm.pricing_policy_id, 0)::bigint AS pricing_policy_id,
    COALESCE(farm.certification, '') AS certification,
    COALESCE(farm.stellar_address, '') AS stellar_address,
    COALESCE(farm.dedicated, false) AS dedicated,
    (
        SELECT COALESCE(json_agg(json_build_object(
            'id', public_ip.id,
            'ip', public_ip.ip,
            'contractId', public_ip.contract_id,
            'gateway', public_ip.gateway
        ) ORDER BY public_ip.id), '[]'::json)
        FROM public_ip
        WHERE public_ip.farm_id = farm.id
    ) AS public_ips";

const FREE_IPS: &str =
    "(SELECT count(id) FROM public_ip WHERE public_ip.farm_id = farm.id AND public_ip.contract_id = 0) >= ?";

const TOTAL_IPS: &str = "(SELECT count(id) FROM public_ip WHERE public_ip.farm_id = farm.id) >= ?";

const TWIN_COLUMNS: &str = "
    twin.twin_id::bigint AS twin_id,
    COALESCE(twin.account_id, '') AS account_id,
    twin.relay AS relay,
    twin.public_key AS public_key";

const CONTRACT_COLUMNS: &str = "
    contracts.contract_id::bigint AS contract_id,
    contracts.twin_id::bigint AS twin_id,
    contracts.state AS state,
    contracts.created_at::bigint AS created_at,
    contracts.name AS name,
    contracts.node_id::bigint AS node_id,
    contracts.deployment_data AS deployment_data,
    contracts.deployment_hash AS deployment_hash,
    contracts.number_of_public_ips::bigint AS number_of_public_ips,
    contracts.type AS type,
    COALESCE(contract_billing.billings, '[]'::json) AS billings";

const CONTRACT_SOURCE: &str = "
    FROM (
        SELECT contract_id, twin_id, state, created_at, '' AS name, node_id,
            COALESCE(deployment_data, '') AS deployment_data,
            COALESCE(deployment_hash, '') AS deployment_hash,
            COALESCE(number_of_public_ips, 0) AS number_of_public_ips, 'node' AS type
        FROM node_contract
        UNION ALL
        SELECT contract_id, twin_id, state, created_at, '', node_id, '', '', 0, 'rent'
        FROM rent_contract
        UNION ALL
        SELECT contract_id, twin_id, state, created_at, name, 0, '', '', 0, 'name'
        FROM name_contract
    ) contracts
    LEFT JOIN (
        SELECT
            contract_bill_report.contract_id,
            json_agg(json_build_object(
                'amountBilled', COALESCE(amount_billed, 0),
                'discountReceived', COALESCE(discount_received, ''),
                'timestamp', COALESCE(timestamp, 0)
            ) ORDER BY timestamp) AS billings
        FROM contract_bill_report
        GROUP BY contract_id
    ) contract_billing ON contracts.contract_id = contract_billing.contract_id";

#[derive(Debug, FromRow)]
struct NodeRow {
    node_id: i64,
    farm_id: i64,
    twin_id: i64,
    country: String,
    city: String,
    uptime: i64,
    created: i64,
    farming_policy_id: i64,
    updated_at: i64,
    total_cru: i64,
    total_sru: i64,
    total_hru: i64,
    total_mru: i64,
    used_cru: i64,
    used_sru: i64,
    used_hru: i64,
    used_mru: i64,
    domain: String,
    gw4: String,
    gw6: String,
    ipv4: String,
    ipv6: String,
    certification: String,
    dedicated: bool,
    secure: bool,
    virtualized: bool,
    serial_number: String,
    rent_contract_id: i64,
    rented_by_twin_id: i64,
    longitude: Option<f64>,
    latitude: Option<f64>,
}

impl NodeRow {
    fn into_node(self, now: u64) -> Node {
        let updated_at = unsigned(self.updated_at);
        Node {
            node_id: narrow(self.node_id),
            farm_id: narrow(self.farm_id),
            twin_id: narrow(self.twin_id),
            location: Location {
                country: self.country.clone(),
                city: self.city.clone(),
                longitude: self.longitude,
                latitude: self.latitude,
            },
            country: self.country,
            city: self.city,
            uptime: unsigned(self.uptime),
            created: unsigned(self.created),
            farming_policy_id: narrow(self.farming_policy_id),
            updated_at,
            total_resources: Capacity {
                cru: unsigned(self.total_cru),
                sru: unsigned(self.total_sru),
                hru: unsigned(self.total_hru),
                mru: unsigned(self.total_mru),
            },
            used_resources: Capacity {
                cru: unsigned(self.used_cru),
                sru: unsigned(self.used_sru),
                hru: unsigned(self.used_hru),
                mru: unsigned(self.used_mru),
            },
            public_config: PublicConfig {
                domain: self.domain,
                gw4: self.gw4,
                gw6: self.gw6,
                ipv4: self.ipv4,
                ipv6: self.ipv6,
            },
            status: Status::at(updated_at, now),
            certification_type: self.certification,
            dedicated: self.dedicated,
            secure: self.secure,
            virtualized: self.virtualized,
            rent_contract_id: unsigned(self.rent_contract_id),
            rented_by_twin_id: narrow(self.rented_by_twin_id),
            serial_number: self.serial_number,
        }
    }
}

#[derive(Debug, FromRow)]
struct FarmRow {
    farm_id: i64,
    name: String,
    twin_id: i64,
    pricing_policy_id: i64,
    certification: String,
    stellar_address: String,
    dedicated: bool,
    public_ips: Json<Vec<PublicIp>>,
}

impl From<FarmRow> for Farm {
    fn from(row: FarmRow) -> Self {
        Farm {
            name: row.name,
            farm_id: narrow(row.farm_id),
            twin_id: narrow(row.twin_id),
            pricing_policy_id: narrow(row.pricing_policy_id),
            certification_type: row.certification,
            stellar_address: row.stellar_address,
            dedicated: row.dedicated,
            public_ips: row.public_ips.0,
        }
    }
}

#[derive(Debug, FromRow)]
struct TwinRow {
    twin_id: i64,
    account_id: String,
    relay: Option<String>,
    public_key: Option<String>,
}

#[derive(Debug, FromRow)]
struct ContractRow {
    contract_id: i64,
    twin_id: i64,
    state: String,
    created_at: i64,
    name: String,
    node_id: i64,
    deployment_data: String,
    deployment_hash: String,
    number_of_public_ips: i64,
    #[sqlx(rename = "type")]
    kind: String,
    billings: Json<Vec<ContractBilling>>,
}

impl TryFrom<ContractRow> for Contract {
    type Error = StoreError;

    fn try_from(row: ContractRow) -> Result<Self> {
        let details = match row.kind.as_str() {
            "node" => ContractDetails::Node(NodeContractDetails {
                node_id: narrow(row.node_id),
                deployment_data: row.deployment_data,
                deployment_hash: row.deployment_hash,
                number_of_public_ips: narrow(row.number_of_public_ips),
            }),
            "rent" => ContractDetails::Rent(RentContractDetails {
                node_id: narrow(row.node_id),
            }),
            "name" => ContractDetails::Name(NameContractDetails { name: row.name }),
            other => {
                return Err(StoreError::Decode {
                    what: "contract type",
                    reason: other.to_string(),
                })
            }
        };
        Ok(Contract {
            contract_id: unsigned(row.contract_id),
            twin_id: narrow(row.twin_id),
            state: row.state,
            created_at: unsigned(row.created_at),
            details,
            billing: row.billings.0,
        })
    }
}

#[derive(Debug, FromRow)]
struct CountersRow {
    twins: i64,
    public_ips: i64,
    contracts: i64,
    nodes: i64,
    farms: i64,
    countries: i64,
    access_nodes: i64,
    gateways: i64,
    total_cru: i64,
    total_sru: i64,
    total_hru: i64,
    total_mru: i64,
}

#[derive(Debug, FromRow)]
struct DistributionRow {
    country: String,
    nodes: i64,
}

#[derive(Debug, FromRow)]
struct TargetRow {
    node_id: i64,
    twin_id: i64,
    retries: i64,
    last_fetch_attempt: Option<i64>,
}

#[derive(Debug, FromRow)]
struct TelemetryRow {
    total_cru: i64,
    total_sru: i64,
    total_hru: i64,
    total_mru: i64,
    used_cru: i64,
    used_sru: i64,
    used_hru: i64,
    used_mru: i64,
    used_ipv4u: i64,
    status: String,
    hypervisor: String,
    zos_version: String,
    retries: i32,
    last_error: Option<String>,
    last_fetch_attempt: Option<i64>,
    last_fetch_success: Option<i64>,
}

impl From<TelemetryRow> for NodeTelemetry {
    fn from(row: TelemetryRow) -> Self {
        NodeTelemetry {
            report: TelemetryReport {
                total: Capacity {
                    cru: unsigned(row.total_cru),
                    sru: unsigned(row.total_sru),
                    hru: unsigned(row.total_hru),
                    mru: unsigned(row.total_mru),
                },
                used: Capacity {
                    cru: unsigned(row.used_cru),
                    sru: unsigned(row.used_sru),
                    hru: unsigned(row.used_hru),
                    mru: unsigned(row.used_mru),
                },
                used_ipv4u: unsigned(row.used_ipv4u),
                hypervisor: row.hypervisor,
                zos_version: row.zos_version,
            },
            status: Status::parse(&row.status).unwrap_or_default(),
            retries: u32::try_from(row.retries).unwrap_or(0),
            last_error: row.last_error,
            last_fetch_attempt: row.last_fetch_attempt.map(unsigned),
            last_fetch_success: row.last_fetch_success.map(unsigned),
        }
    }
}

/// Where the per-node resource columns come from.
#[derive(Debug, Clone, Copy)]
enum Resources {
    /// The `nodes_resources_view` view, for listings.
    View,
    /// `node_resources(id)`, which only aggregates the one node.
    Single(u32),
}

fn status_clause(status: Status) -> &'static str {
    match status {
        Status::Up => "node.updated_at >= ?",
        Status::Down => "(node.updated_at < ? OR node.updated_at IS NULL)",
    }
}

/// Base node query: projection, joins and every filter predicate.
fn node_query(
    projection: &str,
    resources: Resources,
    filter: &NodeFilter,
    now: u64,
) -> Result<Builder> {
    let status = filter.status()?;
    let mut qb = Builder::new("SELECT ");
    qb.push(projection).push(" FROM node");
    match resources {
        Resources::View => {
            qb.push(" LEFT JOIN nodes_resources_view ON node.node_id = nodes_resources_view.node_id");
        }
        Resources::Single(node_id) => {
            qb.push(" LEFT JOIN node_resources(")
                .push_bind(i32::try_from(node_id).unwrap_or(i32::MAX))
                .push(") AS nodes_resources_view ON node.node_id = nodes_resources_view.node_id");
        }
    }
    qb.push(NODE_JOINS);

    let threshold = i64::try_from(up_threshold(now)).unwrap_or(i64::MAX);
    let mut preds = Predicates::open(&mut qb);
    if let Some(status) = status {
        preds.template(status_clause(status), Some(threshold));
    }
    preds
        .cmp("nodes_resources_view.free_mru", Cmp::Ge, int(filter.free_mru))
        .cmp("nodes_resources_view.free_hru", Cmp::Ge, int(filter.free_hru))
        .cmp("nodes_resources_view.free_sru", Cmp::Ge, int(filter.free_sru))
        .cmp("nodes_resources_view.total_cru", Cmp::Ge, int(filter.total_cru))
        .cmp("nodes_resources_view.total_mru", Cmp::Ge, int(filter.total_mru))
        .cmp("nodes_resources_view.total_hru", Cmp::Ge, int(filter.total_hru))
        .cmp("nodes_resources_view.total_sru", Cmp::Ge, int(filter.total_sru))
        .eq_ci("node.country", filter.country.as_deref())
        .contains("node.country", filter.country_contains.as_deref())
        .eq_ci("node.city", filter.city.as_deref())
        .contains("node.city", filter.city_contains.as_deref())
        .cmp("node.node_id", Cmp::Eq, int(filter.node_id))
        .cmp("node.twin_id", Cmp::Eq, int(filter.twin_id))
        .any_of("node.farm_id", &ints(&filter.farm_ids))
        .eq_ci("farm.name", filter.farm_name.as_deref())
        .contains("farm.name", filter.farm_name_contains.as_deref())
        .template(FREE_IPS, int(filter.free_ips))
        .flag(
            filter.ipv4,
            "COALESCE(public_config.ipv4, '') != ''",
            "COALESCE(public_config.ipv4, '') = ''",
        )
        .flag(
            filter.ipv6,
            "COALESCE(public_config.ipv6, '') != ''",
            "COALESCE(public_config.ipv6, '') = ''",
        )
        .flag(
            filter.domain,
            "COALESCE(public_config.domain, '') != ''",
            "COALESCE(public_config.domain, '') = ''",
        )
        .cmp("COALESCE(farm.dedicated, false)", Cmp::Eq, filter.dedicated)
        .template(
            "? = ((COALESCE(farm.dedicated, false) OR COALESCE(nodes_resources_view.states, 0) = 0) \
             AND COALESCE(rent_contract.contract_id, 0) = 0)",
            filter.rentable,
        )
        .template(
            "? = (COALESCE(rent_contract.contract_id, 0) != 0)",
            filter.rented,
        )
        .cmp("COALESCE(rent_contract.twin_id, 0)", Cmp::Eq, int(filter.rented_by))
        .template(
            "(rent_contract.twin_id = ? OR (rent_contract.twin_id IS NULL \
             AND NOT COALESCE(farm.dedicated, false)))",
            int(filter.available_for),
        )
        .eq_ci("node.certification", filter.certification_type.as_deref());
    Ok(qb)
}

fn push_node_order(qb: &mut Builder, filter: &NodeFilter) {
    match int(filter.available_for) {
        Some(twin) => {
            qb.push(" ORDER BY CASE WHEN COALESCE(rent_contract.twin_id, 0) = ")
                .push_bind(twin)
                .push(" THEN 0 ELSE 1 END, node.node_id");
        }
        None => {
            qb.push(" ORDER BY node.node_id");
        }
    }
}

fn push_page(qb: &mut Builder, size: u64, offset: u64) {
    qb.push(" LIMIT ")
        .push_bind(int(Some(size)).unwrap_or(i64::MAX))
        .push(" OFFSET ")
        .push_bind(int(Some(offset)).unwrap_or(i64::MAX));
}

fn farm_query(projection: &str, filter: &FarmFilter) -> Builder {
    let mut qb = Builder::new("SELECT ");
    qb.push(projection).push(" FROM farm");
    Predicates::open(&mut qb)
        .template(FREE_IPS, int(filter.free_ips))
        .template(TOTAL_IPS, int(filter.total_ips))
        .cmp("farm.stellar_address", Cmp::Eq, filter.stellar_address.clone())
        .cmp("farm.pricing_policy_id", Cmp::Eq, int(filter.pricing_policy_id))
        .cmp("farm.farm_id", Cmp::Eq, int(filter.farm_id))
        .cmp("farm.twin_id", Cmp::Eq, int(filter.twin_id))
        .eq_ci("farm.name", filter.name.as_deref())
        .contains("farm.name", filter.name_contains.as_deref())
        .eq_ci("farm.certification", filter.certification_type.as_deref())
        .cmp("COALESCE(farm.dedicated, false)", Cmp::Eq, filter.dedicated);
    qb
}

fn twin_query(projection: &str, filter: &TwinFilter) -> Builder {
    let mut qb = Builder::new("SELECT ");
    qb.push(projection).push(" FROM twin");
    Predicates::open(&mut qb)
        .cmp("twin.twin_id", Cmp::Eq, int(filter.twin_id))
        .cmp("twin.account_id", Cmp::Eq, filter.account_id.clone())
        .cmp("twin.relay", Cmp::Eq, filter.relay.clone())
        .cmp("twin.public_key", Cmp::Eq, filter.public_key.clone());
    qb
}

fn contract_query(projection: &str, filter: &ContractFilter) -> Result<Builder> {
    let state = filter.state()?;
    let kind = filter.kind()?;
    let mut qb = Builder::new("SELECT ");
    qb.push(projection).push(CONTRACT_SOURCE);
    Predicates::open(&mut qb)
        .cmp("contracts.contract_id", Cmp::Eq, int(filter.contract_id))
        .cmp("contracts.twin_id", Cmp::Eq, int(filter.twin_id))
        .cmp("contracts.node_id", Cmp::Eq, int(filter.node_id))
        .cmp("contracts.type", Cmp::Eq, kind)
        .eq_ci("contracts.state", state)
        .cmp("contracts.name", Cmp::Eq, filter.name.clone())
        .cmp(
            "contracts.number_of_public_ips",
            Cmp::Ge,
            int(filter.number_of_public_ips),
        )
        .cmp("contracts.deployment_data", Cmp::Eq, filter.deployment_data.clone())
        .cmp("contracts.deployment_hash", Cmp::Eq, filter.deployment_hash.clone());
    Ok(qb)
}

/// Pushes ` AND <status predicate>` for the counters subqueries.
fn push_stats_status(qb: &mut Builder, status: Option<Status>, threshold: i64) {
    if let Some(status) = status {
        qb.push(" AND ");
        let mut parts = status_clause(status).split('?');
        if let Some(first) = parts.next() {
            qb.push(first);
        }
        for part in parts {
            qb.push_bind(threshold).push(part);
        }
    }
}

fn counters_query(status: Option<Status>, now: u64) -> Builder {
    let threshold = i64::try_from(up_threshold(now)).unwrap_or(i64::MAX);
    let mut qb = Builder::new(
        "SELECT \
         (SELECT count(*) FROM twin) AS twins, \
         (SELECT count(*) FROM public_ip) AS public_ips, \
         ((SELECT count(*) FROM node_contract) + (SELECT count(*) FROM rent_contract) \
           + (SELECT count(*) FROM name_contract)) AS contracts, \
         (SELECT count(*) FROM node WHERE TRUE",
    );
    push_stats_status(&mut qb, status, threshold);
    qb.push(") AS nodes, (SELECT count(DISTINCT node.farm_id) FROM node WHERE TRUE");
    push_stats_status(&mut qb, status, threshold);
    qb.push(") AS farms, (SELECT count(DISTINCT node.country) FROM node WHERE TRUE");
    push_stats_status(&mut qb, status, threshold);
    qb.push(
        ") AS countries, (SELECT count(*) FROM node \
         JOIN public_config ON node.id = public_config.node_id \
         WHERE (COALESCE(public_config.ipv4, '') != '' OR COALESCE(public_config.ipv6, '') != '')",
    );
    push_stats_status(&mut qb, status, threshold);
    qb.push(
        ") AS access_nodes, (SELECT count(*) FROM node \
         JOIN public_config ON node.id = public_config.node_id \
         WHERE (COALESCE(public_config.ipv4, '') != '' OR COALESCE(public_config.ipv6, '') != '') \
         AND COALESCE(public_config.domain, '') != ''",
    );
    push_stats_status(&mut qb, status, threshold);
    qb.push(") AS gateways, totals.total_cru, totals.total_sru, totals.total_hru, totals.total_mru FROM (SELECT \
         COALESCE(sum(node_resources_total.cru), 0)::bigint AS total_cru, \
         COALESCE(sum(node_resources_total.sru), 0)::bigint AS total_sru, \
         COALESCE(sum(node_resources_total.hru), 0)::bigint AS total_hru, \
         COALESCE(sum(node_resources_total.mru), 0)::bigint AS total_mru \
         FROM node JOIN node_resources_total ON node_resources_total.node_id = node.id WHERE TRUE");
    push_stats_status(&mut qb, status, threshold);
    qb.push(") totals");
    qb
}

fn distribution_query(status: Option<Status>, now: u64) -> Builder {
    let threshold = i64::try_from(up_threshold(now)).unwrap_or(i64::MAX);
    let mut qb = Builder::new(
        "SELECT COALESCE(node.country, '') AS country, count(*) AS nodes FROM node WHERE TRUE",
    );
    push_stats_status(&mut qb, status, threshold);
    qb.push(" GROUP BY COALESCE(node.country, '')");
    qb
}

/// Offset for a page, drawn at random when the limit asks for it.
fn page_offset(limit: &Limit, total: u64) -> u64 {
    if limit.randomize {
        let max = total.saturating_sub(limit.size);
        rand::thread_rng().gen_range(0..=max)
    } else {
        limit.offset()
    }
}

fn view_missing(err: &StoreError) -> bool {
    matches!(err, StoreError::Database(err) if schema::is_view_missing(err))
}

/// Runs `op`. When it fails with an error `missing` recognises, runs `setup`
/// and tries exactly once more. If setup or the second attempt fails, the
/// first error is returned.
async fn retry_after_setup<T, E, Op, OpFut, Setup, SetupFut, SetupErr>(
    op: Op,
    setup: Setup,
    missing: impl Fn(&E) -> bool,
) -> std::result::Result<T, E>
where
    E: std::fmt::Display,
    Op: Fn() -> OpFut,
    OpFut: Future<Output = std::result::Result<T, E>>,
    Setup: FnOnce() -> SetupFut,
    SetupFut: Future<Output = std::result::Result<(), SetupErr>>,
    SetupErr: std::fmt::Display,
{
    let err = match op().await {
        Err(err) if missing(&err) => err,
        other => return other,
    };
    warn!(error = %err, "derived views missing, running setup");
    if let Err(setup_err) = setup().await {
        warn!(error = %setup_err, "setup failed");
        return Err(err);
    }
    match op().await {
        Ok(value) => Ok(value),
        Err(retry_err) => {
            warn!(error = %retry_err, "retry after setup failed");
            Err(err)
        }
    }
}

/// PostgreSQL-backed store.
#[derive(Debug, Clone)]
pub struct PostgresDatabase {
    pool: PgPool,
}

impl PostgresDatabase {
    /// Connects and makes sure the derived objects exist.
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.db);
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect_with(options)
            .await?;
        info!(host = %config.host, port = config.port, db = %config.db, "connected to postgres");

        let db = Self { pool };
        db.setup().await?;
        Ok(db)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// (Re)creates the derived view, functions and the telemetry table.
    pub async fn setup(&self) -> Result<()> {
        sqlx::raw_sql(SETUP).execute(&self.pool).await?;
        debug!("derived views are in place");
        Ok(())
    }

    /// Runs `op`, and once more after setup if it failed on a missing view.
    async fn with_views<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> std::result::Result<Fut, StoreError>,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let op = &op;
        retry_after_setup(
            move || async move { Ok::<T, StoreError>(op()?.await?) },
            move || self.setup(),
            view_missing,
        )
        .await
    }

    async fn count(&self, build: impl Fn() -> Result<Builder>) -> Result<u64> {
        let pool = &self.pool;
        let total = self
            .with_views(|| {
                let mut qb = build()?;
                Ok(async move { qb.build_query_scalar::<i64>().fetch_one(pool).await })
            })
            .await?;
        Ok(unsigned(total))
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    async fn nodes(&self, filter: &NodeFilter, limit: &Limit) -> Result<(Vec<Node>, u64)> {
        let now = unix_now();
        let total = if limit.ret_count || limit.randomize {
            self.count(|| node_query("count(*)", Resources::View, filter, now))
                .await?
        } else {
            0
        };
        let offset = page_offset(limit, total);
        let pool = &self.pool;
        let rows = self
            .with_views(|| {
                let mut qb = node_query(NODE_COLUMNS, Resources::View, filter, now)?;
                push_node_order(&mut qb, filter);
                push_page(&mut qb, limit.size, offset);
                Ok(async move { qb.build_query_as::<NodeRow>().fetch_all(pool).await })
            })
            .await?;
        let nodes = rows.into_iter().map(|row| row.into_node(now)).collect();
        Ok((nodes, if limit.ret_count { total } else { 0 }))
    }

    async fn node(&self, node_id: u32) -> Result<Node> {
        let now = unix_now();
        let filter = NodeFilter {
            node_id: Some(u64::from(node_id)),
            ..NodeFilter::default()
        };
        let pool = &self.pool;
        let row = self
            .with_views(|| {
                let mut qb = node_query(NODE_COLUMNS, Resources::Single(node_id), &filter, now)?;
                Ok(async move { qb.build_query_as::<NodeRow>().fetch_optional(pool).await })
            })
            .await?;
        row.map(|row| row.into_node(now))
            .ok_or(StoreError::NodeNotFound)
    }

    async fn farms(&self, filter: &FarmFilter, limit: &Limit) -> Result<(Vec<Farm>, u64)> {
        let total = if limit.ret_count || limit.randomize {
            self.count(|| Ok(farm_query("count(*)", filter))).await?
        } else {
            0
        };
        let offset = page_offset(limit, total);
        let pool = &self.pool;
        let rows = self
            .with_views(|| {
                let mut qb = farm_query(FARM_COLUMNS, filter);
                qb.push(" ORDER BY farm.farm_id");
                push_page(&mut qb, limit.size, offset);
                Ok(async move { qb.build_query_as::<FarmRow>().fetch_all(pool).await })
            })
            .await?;
        Ok((
            rows.into_iter().map(Farm::from).collect(),
            if limit.ret_count { total } else { 0 },
        ))
    }

    async fn farm(&self, farm_id: u32) -> Result<Farm> {
        let filter = FarmFilter {
            farm_id: Some(u64::from(farm_id)),
            ..FarmFilter::default()
        };
        let pool = &self.pool;
        let row = self
            .with_views(|| {
                let mut qb = farm_query(FARM_COLUMNS, &filter);
                Ok(async move { qb.build_query_as::<FarmRow>().fetch_optional(pool).await })
            })
            .await?;
        row.map(Farm::from).ok_or(StoreError::FarmNotFound)
    }

    async fn twins(&self, filter: &TwinFilter, limit: &Limit) -> Result<(Vec<Twin>, u64)> {
        let total = if limit.ret_count || limit.randomize {
            self.count(|| Ok(twin_query("count(*)", filter))).await?
        } else {
            0
        };
        let offset = page_offset(limit, total);
        let pool = &self.pool;
        let rows = self
            .with_views(|| {
                let mut qb = twin_query(TWIN_COLUMNS, filter);
                qb.push(" ORDER BY twin.twin_id");
                push_page(&mut qb, limit.size, offset);
                Ok(async move { qb.build_query_as::<TwinRow>().fetch_all(pool).await })
            })
            .await?;
        let twins = rows
            .into_iter()
            .map(|row| Twin {
                twin_id: narrow(row.twin_id),
                account_id: row.account_id,
                relay: row.relay,
                public_key: row.public_key,
            })
            .collect();
        Ok((twins, if limit.ret_count { total } else { 0 }))
    }

    async fn contracts(
        &self,
        filter: &ContractFilter,
        limit: &Limit,
    ) -> Result<(Vec<Contract>, u64)> {
        let total = if limit.ret_count || limit.randomize {
            self.count(|| contract_query("count(*)", filter)).await?
        } else {
            0
        };
        let offset = page_offset(limit, total);
        let pool = &self.pool;
        let rows = self
            .with_views(|| {
                let mut qb = contract_query(CONTRACT_COLUMNS, filter)?;
                qb.push(" ORDER BY contracts.contract_id");
                push_page(&mut qb, limit.size, offset);
                Ok(async move { qb.build_query_as::<ContractRow>().fetch_all(pool).await })
            })
            .await?;
        let contracts = rows
            .into_iter()
            .map(Contract::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok((contracts, if limit.ret_count { total } else { 0 }))
    }

    async fn counters(&self, filter: &StatsFilter) -> Result<Counters> {
        let status = filter.status()?;
        let now = unix_now();
        let pool = &self.pool;
        let row = self
            .with_views(|| {
                let mut qb = counters_query(status, now);
                Ok(async move { qb.build_query_as::<CountersRow>().fetch_one(pool).await })
            })
            .await?;
        let distribution = self
            .with_views(|| {
                let mut qb = distribution_query(status, now);
                Ok(async move { qb.build_query_as::<DistributionRow>().fetch_all(pool).await })
            })
            .await?;

        Ok(Counters {
            nodes: unsigned(row.nodes),
            farms: unsigned(row.farms),
            countries: unsigned(row.countries),
            total_cru: unsigned(row.total_cru),
            total_sru: unsigned(row.total_sru),
            total_mru: unsigned(row.total_mru),
            total_hru: unsigned(row.total_hru),
            public_ips: unsigned(row.public_ips),
            access_nodes: unsigned(row.access_nodes),
            gateways: unsigned(row.gateways),
            twins: unsigned(row.twins),
            contracts: unsigned(row.contracts),
            nodes_distribution: distribution
                .into_iter()
                .map(|d| (d.country, unsigned(d.nodes)))
                .collect(),
        })
    }
}

#[async_trait]
impl TelemetryStore for PostgresDatabase {
    async fn fetch_targets(&self, offset: u64, limit: u64) -> Result<Vec<FetchTarget>> {
        let pool = &self.pool;
        let rows = self
            .with_views(|| {
                let mut qb = Builder::new(
                    "SELECT node.node_id::bigint AS node_id, \
                     COALESCE(node.twin_id, 0)::bigint AS twin_id, \
                     COALESCE(node_telemetry.retries, 0)::bigint AS retries, \
                     node_telemetry.last_fetch_attempt AS last_fetch_attempt \
                     FROM node LEFT JOIN node_telemetry ON node_telemetry.node_id = node.node_id \
                     ORDER BY node.node_id",
                );
                push_page(&mut qb, limit, offset);
                Ok(async move { qb.build_query_as::<TargetRow>().fetch_all(pool).await })
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| FetchTarget {
                node_id: narrow(row.node_id),
                twin_id: narrow(row.twin_id),
                retries: u32::try_from(row.retries).unwrap_or(u32::MAX),
                last_fetch_attempt: row.last_fetch_attempt.map(unsigned),
            })
            .collect())
    }

    async fn telemetry(&self, node_id: u32) -> Result<Option<NodeTelemetry>> {
        let pool = &self.pool;
        let row = self
            .with_views(|| {
                let mut qb = Builder::new(
                    "SELECT total_cru, total_sru, total_hru, total_mru, \
                     used_cru, used_sru, used_hru, used_mru, used_ipv4u, \
                     status, hypervisor, zos_version, retries, last_error, \
                     last_fetch_attempt, last_fetch_success \
                     FROM node_telemetry WHERE node_id = ",
                );
                qb.push_bind(i64::from(node_id));
                Ok(async move { qb.build_query_as::<TelemetryRow>().fetch_optional(pool).await })
            })
            .await?;
        Ok(row.map(NodeTelemetry::from))
    }

    async fn record_telemetry(
        &self,
        node_id: u32,
        report: &TelemetryReport,
        at: u64,
    ) -> Result<()> {
        let pool = &self.pool;
        self.with_views(|| {
            let mut qb = Builder::new(
                "INSERT INTO node_telemetry (node_id, total_cru, total_sru, total_hru, total_mru, \
                 used_cru, used_sru, used_hru, used_mru, used_ipv4u, status, hypervisor, \
                 zos_version, retries, last_error, last_fetch_attempt, last_fetch_success) ",
            );
            qb.push_values(std::iter::once(report), |mut row, report| {
                row.push_bind(i64::from(node_id))
                    .push_bind(int(Some(report.total.cru)))
                    .push_bind(int(Some(report.total.sru)))
                    .push_bind(int(Some(report.total.hru)))
                    .push_bind(int(Some(report.total.mru)))
                    .push_bind(int(Some(report.used.cru)))
                    .push_bind(int(Some(report.used.sru)))
                    .push_bind(int(Some(report.used.hru)))
                    .push_bind(int(Some(report.used.mru)))
                    .push_bind(int(Some(report.used_ipv4u)))
                    .push_bind(Status::Up.as_str())
                    .push_bind(report.hypervisor.clone())
                    .push_bind(report.zos_version.clone())
                    .push_bind(0_i32)
                    .push_bind(Option::<String>::None)
                    .push_bind(int(Some(at)))
                    .push_bind(int(Some(at)));
            });
            qb.push(
                " ON CONFLICT (node_id) DO UPDATE SET \
                 total_cru = EXCLUDED.total_cru, total_sru = EXCLUDED.total_sru, \
                 total_hru = EXCLUDED.total_hru, total_mru = EXCLUDED.total_mru, \
                 used_cru = EXCLUDED.used_cru, used_sru = EXCLUDED.used_sru, \
                 used_hru = EXCLUDED.used_hru, used_mru = EXCLUDED.used_mru, \
                 used_ipv4u = EXCLUDED.used_ipv4u, status = EXCLUDED.status, \
                 hypervisor = EXCLUDED.hypervisor, zos_version = EXCLUDED.zos_version, \
                 retries = 0, last_error = NULL, \
                 last_fetch_attempt = EXCLUDED.last_fetch_attempt, \
                 last_fetch_success = EXCLUDED.last_fetch_success",
            );
            Ok(async move { qb.build().execute(pool).await })
        })
        .await?;
        Ok(())
    }

    async fn record_failure(&self, node_id: u32, error: &str, at: u64) -> Result<()> {
        let pool = &self.pool;
        self.with_views(|| {
            let mut qb = Builder::new(
                "INSERT INTO node_telemetry (node_id, status, retries, last_error, last_fetch_attempt) VALUES (",
            );
            qb.push_bind(i64::from(node_id))
                .push(", ")
                .push_bind(Status::Down.as_str())
                .push(", 1, ")
                .push_bind(error.to_string())
                .push(", ")
                .push_bind(int(Some(at)))
                .push(
                    ") ON CONFLICT (node_id) DO UPDATE SET \
                     status = EXCLUDED.status, \
                     retries = node_telemetry.retries + 1, \
                     last_error = EXCLUDED.last_error, \
                     last_fetch_attempt = EXCLUDED.last_fetch_attempt",
                );
            Ok(async move { qb.build().execute(pool).await })
        })
        .await?;
        Ok(())
    }
}
