use std::time::Duration;

use async_trait::async_trait;
use gridproxy_types::filter::encode_pairs;
use gridproxy_types::{
    Contract, ContractFilter, Counters, Farm, FarmFilter, Limit, Node, NodeFilter, NodeInfo,
    NodeStatus, QueryParams, StatsFilter, Twin, TwinFilter, Version,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ClientError, Result};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Every grid proxy endpoint as a typed call. Listings return the page and
/// the `count` header (0 when the server did not send one).
#[async_trait]
pub trait GridProxyClient: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn version(&self) -> Result<Version>;

    async fn nodes(&self, filter: &NodeFilter, limit: &Limit) -> Result<(Vec<Node>, u64)>;

    async fn gateways(&self, filter: &NodeFilter, limit: &Limit) -> Result<(Vec<Node>, u64)>;

    async fn node(&self, node_id: u32) -> Result<NodeInfo<Node>>;

    async fn gateway(&self, node_id: u32) -> Result<NodeInfo<Node>>;

    async fn node_status(&self, node_id: u32) -> Result<NodeStatus>;

    async fn farms(&self, filter: &FarmFilter, limit: &Limit) -> Result<(Vec<Farm>, u64)>;

    async fn twins(&self, filter: &TwinFilter, limit: &Limit) -> Result<(Vec<Twin>, u64)>;

    async fn contracts(
        &self,
        filter: &ContractFilter,
        limit: &Limit,
    ) -> Result<(Vec<Contract>, u64)>;

    async fn counters(&self, filter: &StatsFilter) -> Result<Counters>;
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Deserialize)]
struct Pong {
    ping: String,
}

/// Talks to one grid proxy over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpClient {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn query<F: QueryParams>(filter: &F, limit: Option<&Limit>) -> String {
        let mut pairs = filter.pairs();
        if let Some(limit) = limit {
            pairs.extend(limit.pairs());
        }
        encode_pairs(&pairs)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &str) -> Result<(T, u64)> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        let response = self.http.get(url).send().await?;
        let status = response.status();
        let count = response
            .headers()
            .get("count")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(error_from_body(status, &body));
        }
        let value = serde_json::from_slice(&body).map_err(|e| ClientError::Decode(e.to_string()))?;
        Ok((value, count))
    }
}

/// `{"error": "..."}` when the server produced one, the raw text otherwise.
fn error_from_body(status: StatusCode, body: &[u8]) -> ClientError {
    let message = match serde_json::from_slice::<ErrorBody>(body) {
        Ok(parsed) => parsed.error,
        Err(_) => String::from_utf8_lossy(body).trim().to_string(),
    };
    ClientError::Status {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl GridProxyClient for HttpClient {
    async fn ping(&self) -> Result<()> {
        let (pong, _): (Pong, u64) = self.get("/ping", "").await?;
        if pong.ping != "pong" {
            return Err(ClientError::Decode(format!("unexpected ping reply {:?}", pong.ping)));
        }
        Ok(())
    }

    async fn version(&self) -> Result<Version> {
        Ok(self.get("/version", "").await?.0)
    }

    async fn nodes(&self, filter: &NodeFilter, limit: &Limit) -> Result<(Vec<Node>, u64)> {
        self.get("/nodes", &Self::query(filter, Some(limit))).await
    }

    async fn gateways(&self, filter: &NodeFilter, limit: &Limit) -> Result<(Vec<Node>, u64)> {
        self.get("/gateways", &Self::query(filter, Some(limit))).await
    }

    async fn node(&self, node_id: u32) -> Result<NodeInfo<Node>> {
        Ok(self.get(&format!("/nodes/{node_id}"), "").await?.0)
    }

    async fn gateway(&self, node_id: u32) -> Result<NodeInfo<Node>> {
        Ok(self.get(&format!("/gateways/{node_id}"), "").await?.0)
    }

    async fn node_status(&self, node_id: u32) -> Result<NodeStatus> {
        Ok(self.get(&format!("/nodes/{node_id}/status"), "").await?.0)
    }

    async fn farms(&self, filter: &FarmFilter, limit: &Limit) -> Result<(Vec<Farm>, u64)> {
        self.get("/farms", &Self::query(filter, Some(limit))).await
    }

    async fn twins(&self, filter: &TwinFilter, limit: &Limit) -> Result<(Vec<Twin>, u64)> {
        self.get("/twins", &Self::query(filter, Some(limit))).await
    }

    async fn contracts(
        &self,
        filter: &ContractFilter,
        limit: &Limit,
    ) -> Result<(Vec<Contract>, u64)> {
        self.get("/contracts", &Self::query(filter, Some(limit))).await
    }

    async fn counters(&self, filter: &StatsFilter) -> Result<Counters> {
        Ok(self.get("/stats", &Self::query(filter, None)).await?.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridproxy_types::{ContractDetails, Status};
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_nodes_sends_filter_and_reads_count() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nodes"))
            .and(query_param("status", "up"))
            .and(query_param("farm_ids", "1,2"))
            .and(query_param("country", "United States"))
            .and(query_param("page", "2"))
            .and(query_param("size", "10"))
            .and(query_param("ret_count", "true"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("count", "11")
                    .set_body_json(json!([{"nodeId": 7, "twinId": 70, "status": "up"}])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpClient::new(&format!("{}/", server.uri())).unwrap();
        let filter = NodeFilter {
            status: Some("up".into()),
            farm_ids: vec![1, 2],
            country: Some("United States".into()),
            ..NodeFilter::default()
        };
        let (nodes, count) = client
            .nodes(&filter, &Limit::new(2, 10).with_count())
            .await
            .unwrap();
        assert_eq!(count, 11);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].node_id, 7);
        assert_eq!(nodes[0].status, Status::Up);
    }

    #[tokio::test]
    async fn test_missing_count_header_is_zero() {
        let server = MockServer::start().await;
        Mock::given(path("/farms"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let client = HttpClient::new(&server.uri()).unwrap();
        let (farms, count) = client
            .farms(&FarmFilter::default(), &Limit::default())
            .await
            .unwrap();
        assert!(farms.is_empty());
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_error_body_is_parsed() {
        let server = MockServer::start().await;
        Mock::given(path("/nodes/9/status"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(json!({"error": "node not found"})),
            )
            .mount(&server)
            .await;
        Mock::given(path("/version"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway\n"))
            .mount(&server)
            .await;

        let client = HttpClient::new(&server.uri()).unwrap();
        match client.node_status(9).await.unwrap_err() {
            ClientError::Status { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message, "node not found");
            }
            other => panic!("unexpected error: {other}"),
        }
        match client.version().await.unwrap_err() {
            ClientError::Status { status, message } => {
                assert_eq!(status, 502);
                assert_eq!(message, "bad gateway");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_contract_details_are_typed() {
        let server = MockServer::start().await;
        Mock::given(path("/contracts"))
            .and(query_param("type", "node"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "contractId": 10,
                "twinId": 3,
                "state": "Created",
                "created_at": 1700000000,
                "type": "node",
                "details": {
                    "nodeId": 4,
                    "deployment_data": "{}",
                    "deployment_hash": "abc",
                    "number_of_public_ips": 1
                },
                "billing": [{"amountBilled": 12, "discountReceived": "gold", "timestamp": 5}]
            }])))
            .mount(&server)
            .await;

        let client = HttpClient::new(&server.uri()).unwrap();
        let filter = ContractFilter {
            contract_type: Some("node".into()),
            ..ContractFilter::default()
        };
        let (contracts, _) = client.contracts(&filter, &Limit::default()).await.unwrap();
        match &contracts[0].details {
            ContractDetails::Node(details) => {
                assert_eq!(details.node_id, 4);
                assert_eq!(details.number_of_public_ips, 1);
            }
            other => panic!("unexpected details: {other:?}"),
        }
        assert_eq!(contracts[0].billing[0].amount_billed, 12);
    }

    #[tokio::test]
    async fn test_ping_and_node_detail() {
        let server = MockServer::start().await;
        Mock::given(path("/ping"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ping": "pong"})))
            .mount(&server)
            .await;
        Mock::given(path("/gateways/3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "nodeId": 3,
                "hypervisor": "kvm",
                "zosVersion": "3.6.1"
            })))
            .mount(&server)
            .await;

        let client = HttpClient::new(&server.uri()).unwrap();
        client.ping().await.unwrap();
        let info = client.gateway(3).await.unwrap();
        assert_eq!(info.node.node_id, 3);
        assert_eq!(info.hypervisor, "kvm");
        assert_eq!(info.zos_version, "3.6.1");
    }

    #[tokio::test]
    async fn test_stats_only_sends_status() {
        let server = MockServer::start().await;
        Mock::given(path("/stats"))
            .and(query_param("status", "down"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"nodes": 4})))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpClient::new(&server.uri()).unwrap();
        let filter = StatsFilter {
            status: Some("down".into()),
        };
        let counters = client.counters(&filter).await.unwrap();
        assert_eq!(counters.nodes, 4);
    }
}
