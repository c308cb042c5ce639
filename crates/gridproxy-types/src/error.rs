use thiserror::Error;

/// Rejections raised while decoding query parameters into filters.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The value of an integer slot did not parse as an unsigned integer.
    #[error("invalid value {value:?} for {key}: expected an unsigned integer")]
    InvalidInteger { key: &'static str, value: String },

    /// Pagination values start at one.
    #[error("{key} must be greater than zero")]
    ZeroLimit { key: &'static str },

    /// A closed-set value (status, contract type or state) was not recognized.
    #[error("invalid {key} {value:?}, expected one of {expected}")]
    InvalidChoice {
        key: &'static str,
        value: String,
        expected: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, ParseError>;
