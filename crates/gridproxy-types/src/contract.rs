use serde::{Deserialize, Deserializer, Serialize};

/// One bill report. Missing or null fields read as their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContractBilling {
    #[serde(deserialize_with = "null_as_default")]
    pub amount_billed: u64,
    #[serde(deserialize_with = "null_as_default")]
    pub discount_received: String,
    #[serde(deserialize_with = "null_as_default")]
    pub timestamp: u64,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeContractDetails {
    #[serde(rename = "nodeId")]
    pub node_id: u32,
    pub deployment_data: String,
    pub deployment_hash: String,
    pub number_of_public_ips: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameContractDetails {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RentContractDetails {
    #[serde(rename = "nodeId")]
    pub node_id: u32,
}

/// Type-specific part of a contract. On the wire the variant is named by the
/// sibling `type` field and the payload sits under `details`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractDetails {
    Node(NodeContractDetails),
    Name(NameContractDetails),
    Rent(RentContractDetails),
}

impl ContractDetails {
    pub const KINDS: &'static [&'static str] = &["node", "name", "rent"];

    pub fn kind(&self) -> &'static str {
        match self {
            ContractDetails::Node(_) => "node",
            ContractDetails::Name(_) => "name",
            ContractDetails::Rent(_) => "rent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ContractWire", into = "ContractWire")]
pub struct Contract {
    pub contract_id: u64,
    pub twin_id: u32,
    pub state: String,
    pub created_at: u64,
    pub details: ContractDetails,
    pub billing: Vec<ContractBilling>,
}

impl Contract {
    pub fn kind(&self) -> &'static str {
        self.details.kind()
    }
}

#[derive(Serialize, Deserialize)]
struct ContractWire {
    #[serde(rename = "contractId")]
    contract_id: u64,
    #[serde(rename = "twinId")]
    twin_id: u32,
    state: String,
    created_at: u64,
    #[serde(rename = "type")]
    kind: String,
    details: serde_json::Value,
    #[serde(default)]
    billing: Vec<ContractBilling>,
}

impl TryFrom<ContractWire> for Contract {
    type Error = String;

    fn try_from(wire: ContractWire) -> Result<Self, Self::Error> {
        let details = match wire.kind.as_str() {
            "node" => serde_json::from_value(wire.details).map(ContractDetails::Node),
            "name" => serde_json::from_value(wire.details).map(ContractDetails::Name),
            "rent" => serde_json::from_value(wire.details).map(ContractDetails::Rent),
            other => return Err(format!("unknown contract type {other:?}")),
        }
        .map_err(|e| format!("invalid {} contract details: {e}", wire.kind))?;

        Ok(Contract {
            contract_id: wire.contract_id,
            twin_id: wire.twin_id,
            state: wire.state,
            created_at: wire.created_at,
            details,
            billing: wire.billing,
        })
    }
}

impl From<Contract> for ContractWire {
    fn from(contract: Contract) -> Self {
        let kind = contract.kind().to_string();
        let details = match contract.details {
            ContractDetails::Node(d) => serde_json::to_value(d),
            ContractDetails::Name(d) => serde_json::to_value(d),
            ContractDetails::Rent(d) => serde_json::to_value(d),
        }
        .unwrap_or(serde_json::Value::Null);

        ContractWire {
            contract_id: contract.contract_id,
            twin_id: contract.twin_id,
            state: contract.state,
            created_at: contract.created_at,
            kind,
            details,
            billing: contract.billing,
        }
    }
}
