//! Client for the grid proxy HTTP API.
//!
//! [`HttpClient`] maps every endpoint to a typed call; [`RetryingClient`]
//! wraps any [`GridProxyClient`] and retries transport failures and 5xx
//! answers with exponential backoff.

pub mod client;
pub mod error;
pub mod retrying;

pub use client::{GridProxyClient, HttpClient};
pub use error::{ClientError, Result};
pub use retrying::{RetryConfig, RetryingClient};
