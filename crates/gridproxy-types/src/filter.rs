//! Filters and pagination accepted by the listing endpoints, together with
//! their query-string mapping.
//!
//! Each filter struct is declared through [`query_filter!`], which ties every
//! field to its query parameter name and a typed slot. Decoding and encoding
//! are generated from the same table, so the client and the server cannot
//! drift apart.

use crate::error::{ParseError, Result};
use crate::model::Status;

/// A typed slot that can be filled from, and rendered to, a raw query value.
pub trait QueryValue: Sized {
    /// Decode `raw` for the parameter `key`. Returning `None` where the slot
    /// is optional leaves the filter unset.
    fn parse_query(key: &'static str, raw: &str) -> Result<Self>;

    /// Encode the slot, `None` when it should be omitted from the query.
    fn render_query(&self) -> Option<String>;
}

impl QueryValue for Option<u64> {
    fn parse_query(key: &'static str, raw: &str) -> Result<Self> {
        parse_u64(key, raw).map(Some)
    }

    fn render_query(&self) -> Option<String> {
        self.map(|v| v.to_string())
    }
}

impl QueryValue for Option<String> {
    fn parse_query(_key: &'static str, raw: &str) -> Result<Self> {
        Ok(Some(raw.to_string()))
    }

    fn render_query(&self) -> Option<String> {
        self.clone()
    }
}

/// Only the literals `true` and `false` are understood; anything else leaves
/// the slot unset.
impl QueryValue for Option<bool> {
    fn parse_query(_key: &'static str, raw: &str) -> Result<Self> {
        Ok(match raw {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        })
    }

    fn render_query(&self) -> Option<String> {
        self.map(|v| v.to_string())
    }
}

/// Comma separated list; the empty string is an empty list.
impl QueryValue for Vec<u64> {
    fn parse_query(key: &'static str, raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        raw.split(',').map(|item| parse_u64(key, item.trim())).collect()
    }

    fn render_query(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let items: Vec<String> = self.iter().map(|v| v.to_string()).collect();
        Some(items.join(","))
    }
}

fn parse_u64(key: &'static str, raw: &str) -> Result<u64> {
    raw.parse::<u64>().map_err(|_| ParseError::InvalidInteger {
        key,
        value: raw.to_string(),
    })
}

/// Types decodable from a list of query pairs.
pub trait QueryParams: Default {
    /// Apply one pair. Returns `Ok(false)` for keys this type does not own.
    fn set(&mut self, key: &str, raw: &str) -> Result<bool>;

    /// The pairs needed to reproduce `self`, in declaration order.
    fn pairs(&self) -> Vec<(&'static str, String)>;

    /// Build from decoded pairs. Unknown keys are ignored, the last value of
    /// a repeated key wins.
    fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut out = Self::default();
        for (key, raw) in pairs {
            out.set(key, raw)?;
        }
        Ok(out)
    }

    /// Decode a raw (percent-encoded) query string, with or without a
    /// leading `?`.
    fn from_query_string(query: &str) -> Result<Self> {
        let decoded = decode_query(query);
        Self::from_pairs(decoded.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    /// Encode as `k=v&k=v`, percent-encoding the values.
    fn to_query_string(&self) -> String {
        encode_pairs(&self.pairs())
    }
}

/// Split and percent-decode a query string into owned pairs.
pub fn decode_query(query: &str) -> Vec<(String, String)> {
    query
        .trim_start_matches('?')
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (key, value) = part.split_once('=').unwrap_or((part, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

/// Join pairs into a percent-encoded query string (no leading `?`).
pub fn encode_pairs(pairs: &[(&'static str, String)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| format!("{}={}", key, urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

macro_rules! query_filter {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $(
                $(#[$fmeta:meta])*
                $field:ident : $ty:ty => $key:literal
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct $name {
            $(
                $(#[$fmeta])*
                pub $field: $ty,
            )*
        }

        impl $name {
            /// Query parameter names understood by this filter.
            pub const KEYS: &'static [&'static str] = &[$($key),*];
        }

        impl QueryParams for $name {
            fn set(&mut self, key: &str, raw: &str) -> Result<bool> {
                match key {
                    $(
                        $key => {
                            self.$field = QueryValue::parse_query($key, raw)?;
                            Ok(true)
                        }
                    )*
                    _ => Ok(false),
                }
            }

            fn pairs(&self) -> Vec<(&'static str, String)> {
                let mut out = Vec::new();
                $(
                    if let Some(value) = QueryValue::render_query(&self.$field) {
                        out.push(($key, value));
                    }
                )*
                out
            }
        }
    };
}

query_filter! {
    /// Node listing filter. `None` and empty lists mean "no constraint".
    pub struct NodeFilter {
        /// `up` or `down`.
        status: Option<String> => "status",
        free_mru: Option<u64> => "free_mru",
        free_hru: Option<u64> => "free_hru",
        free_sru: Option<u64> => "free_sru",
        total_mru: Option<u64> => "total_mru",
        total_hru: Option<u64> => "total_hru",
        total_sru: Option<u64> => "total_sru",
        total_cru: Option<u64> => "total_cru",
        country: Option<String> => "country",
        country_contains: Option<String> => "country_contains",
        city: Option<String> => "city",
        city_contains: Option<String> => "city_contains",
        farm_name: Option<String> => "farm_name",
        farm_name_contains: Option<String> => "farm_name_contains",
        farm_ids: Vec<u64> => "farm_ids",
        free_ips: Option<u64> => "free_ips",
        ipv4: Option<bool> => "ipv4",
        ipv6: Option<bool> => "ipv6",
        domain: Option<bool> => "domain",
        dedicated: Option<bool> => "dedicated",
        rentable: Option<bool> => "rentable",
        rented: Option<bool> => "rented",
        rented_by: Option<u64> => "rented_by",
        available_for: Option<u64> => "available_for",
        node_id: Option<u64> => "node_id",
        twin_id: Option<u64> => "twin_id",
        certification_type: Option<String> => "certification_type",
    }
}

query_filter! {
    pub struct FarmFilter {
        free_ips: Option<u64> => "free_ips",
        total_ips: Option<u64> => "total_ips",
        stellar_address: Option<String> => "stellar_address",
        pricing_policy_id: Option<u64> => "pricing_policy_id",
        farm_id: Option<u64> => "farm_id",
        twin_id: Option<u64> => "twin_id",
        name: Option<String> => "name",
        name_contains: Option<String> => "name_contains",
        certification_type: Option<String> => "certification_type",
        dedicated: Option<bool> => "dedicated",
    }
}

query_filter! {
    pub struct TwinFilter {
        twin_id: Option<u64> => "twin_id",
        account_id: Option<String> => "account_id",
        relay: Option<String> => "relay",
        public_key: Option<String> => "public_key",
    }
}

query_filter! {
    pub struct ContractFilter {
        contract_id: Option<u64> => "contract_id",
        twin_id: Option<u64> => "twin_id",
        node_id: Option<u64> => "node_id",
        /// `node`, `name` or `rent`.
        contract_type: Option<String> => "type",
        /// Matched case-insensitively.
        state: Option<String> => "state",
        name: Option<String> => "name",
        number_of_public_ips: Option<u64> => "number_of_public_ips",
        deployment_data: Option<String> => "deployment_data",
        deployment_hash: Option<String> => "deployment_hash",
    }
}

query_filter! {
    /// `/stats` only honours the liveness filter.
    pub struct StatsFilter {
        status: Option<String> => "status",
    }
}

const CONTRACT_STATES: &[&str] = &["Created", "GracePeriod", "Deleted"];

fn validate_status(status: Option<&str>) -> Result<Option<Status>> {
    match status {
        None => Ok(None),
        Some(raw) => Status::parse(raw).map(Some).ok_or(ParseError::InvalidChoice {
            key: "status",
            value: raw.to_string(),
            expected: "up, down",
        }),
    }
}

impl NodeFilter {
    /// The requested liveness, rejecting anything but `up` and `down`.
    pub fn status(&self) -> Result<Option<Status>> {
        validate_status(self.status.as_deref())
    }

    pub fn validate(&self) -> Result<()> {
        self.status().map(|_| ())
    }
}

impl StatsFilter {
    pub fn status(&self) -> Result<Option<Status>> {
        validate_status(self.status.as_deref())
    }
}

impl ContractFilter {
    /// Canonical spelling of the requested state, if any.
    pub fn state(&self) -> Result<Option<&'static str>> {
        match self.state.as_deref() {
            None => Ok(None),
            Some(raw) => CONTRACT_STATES
                .iter()
                .find(|s| s.eq_ignore_ascii_case(raw))
                .copied()
                .map(Some)
                .ok_or(ParseError::InvalidChoice {
                    key: "state",
                    value: raw.to_string(),
                    expected: "Created, GracePeriod, Deleted",
                }),
        }
    }

    pub fn kind(&self) -> Result<Option<&'static str>> {
        match self.contract_type.as_deref() {
            None => Ok(None),
            Some(raw) => crate::contract::ContractDetails::KINDS
                .iter()
                .find(|k| k.eq_ignore_ascii_case(raw))
                .copied()
                .map(Some)
                .ok_or(ParseError::InvalidChoice {
                    key: "type",
                    value: raw.to_string(),
                    expected: "node, name, rent",
                }),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.state()?;
        self.kind()?;
        Ok(())
    }
}

pub const DEFAULT_PAGE: u64 = 1;
pub const DEFAULT_PAGE_SIZE: u64 = 50;

/// Pagination for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    /// One-based page index.
    pub page: u64,
    pub size: u64,
    /// Compute the total number of matches.
    pub ret_count: bool,
    /// Pick a random window instead of the ordered one.
    pub randomize: bool,
}

impl Default for Limit {
    fn default() -> Self {
        Self {
            page: DEFAULT_PAGE,
            size: DEFAULT_PAGE_SIZE,
            ret_count: false,
            randomize: false,
        }
    }
}

impl Limit {
    pub fn new(page: u64, size: u64) -> Self {
        Self {
            page,
            size,
            ..Self::default()
        }
    }

    pub fn with_count(mut self) -> Self {
        self.ret_count = true;
        self
    }

    pub fn offset(&self) -> u64 {
        self.page.saturating_sub(1).saturating_mul(self.size)
    }

    /// Number of pages needed to hold `count` rows, `⌈count/size⌉`.
    pub fn pages(&self, count: u64) -> u64 {
        if self.size == 0 {
            return 0;
        }
        count.div_ceil(self.size)
    }
}

impl QueryParams for Limit {
    fn set(&mut self, key: &str, raw: &str) -> Result<bool> {
        match key {
            "page" => {
                self.page = positive("page", raw)?;
                Ok(true)
            }
            "size" => {
                self.size = positive("size", raw)?;
                Ok(true)
            }
            "ret_count" => {
                if let Some(v) = <Option<bool>>::parse_query("ret_count", raw)? {
                    self.ret_count = v;
                }
                Ok(true)
            }
            "randomize" => {
                if let Some(v) = <Option<bool>>::parse_query("randomize", raw)? {
                    self.randomize = v;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![("page", self.page.to_string()), ("size", self.size.to_string())];
        if self.ret_count {
            out.push(("ret_count", "true".to_string()));
        }
        if self.randomize {
            out.push(("randomize", "true".to_string()));
        }
        out
    }
}

fn positive(key: &'static str, raw: &str) -> Result<u64> {
    match parse_u64(key, raw)? {
        0 => Err(ParseError::ZeroLimit { key }),
        v => Ok(v),
    }
}
