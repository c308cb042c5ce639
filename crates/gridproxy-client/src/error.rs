use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("grid proxy answered {status}: {message}")]
    Status { status: u16, message: String },

    #[error("couldn't decode response: {0}")]
    Decode(String),
}

impl ClientError {
    /// Transport failures and server-side (5xx) errors are worth another try.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(e) => !e.is_builder(),
            ClientError::Status { status, .. } => *status >= 500,
            ClientError::Decode(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
