//! Shared types for the grid proxy: the entities served over HTTP, the
//! filter structs accepted by each listing, and the query-string codec that
//! both the server and the client use.

pub mod contract;
pub mod error;
pub mod filter;
pub mod model;

pub use contract::{
    Contract, ContractBilling, ContractDetails, NameContractDetails, NodeContractDetails,
    RentContractDetails,
};
pub use error::ParseError;
pub use filter::{
    ContractFilter, FarmFilter, Limit, NodeFilter, QueryParams, QueryValue, StatsFilter,
    TwinFilter,
};
pub use model::{
    Capacity, CapacityResult, Counters, Farm, Location, Node, NodeInfo, NodeStatus,
    NodeWithNestedCapacity, PublicConfig, PublicIp, Status, Twin, Version,
};
