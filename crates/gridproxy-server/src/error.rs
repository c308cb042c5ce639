use gridproxy_types::ParseError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("node not found")]
    NodeNotFound,

    #[error("farm not found")]
    FarmNotFound,

    #[error(transparent)]
    InvalidFilter(#[from] ParseError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("malformed {what} in database row: {reason}")]
    Decode { what: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;
