//! Error taxonomy for the MoE tracking engine.

use moe_state::StoreError;

/// Engine-level errors.
#[derive(Debug, thiserror::Error)]
pub enum MoeError {
    #[error("invalid EMA alpha {0}: must lie strictly between 0 and 1")]
    InvalidAlpha(f64),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("engine is not running")]
    EngineClosed,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, MoeError>;

/// Failures of the remote collaborators (authoritative results, thresholds).
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The authoritative value does not exist yet (server has not caught up).
    #[error("authoritative result not ready yet")]
    NotReady,

    #[error("transient provider failure: {0}")]
    Transient(String),

    /// The value will never become available for this request.
    #[error("authoritative result unavailable: {0}")]
    Unavailable(String),

    #[error("API error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

impl ProviderError {
    /// Whether another attempt for the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::NotReady | ProviderError::Transient(_) | ProviderError::Http(_)
        )
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Http(err.to_string())
    }
}
