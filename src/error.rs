use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("no available channel")]
    NoChannel,
    #[error("upstream error: {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("translation error: {0}")]
    Translation(String),
    #[error("request canceled")]
    Canceled,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Whether the relay may advance to the next group item after this error.
    /// Only meaningful before the first byte has been written to the client.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RelayError::Upstream { .. }
                | RelayError::Translation(_)
                | RelayError::Http(_)
                | RelayError::NoChannel
        )
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
