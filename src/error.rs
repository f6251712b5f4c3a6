//! Error types for transaction construction, data-source access and wallet sessions
//!
//! Every public operation returns either a complete value or exactly one
//! [`LaserError`]. Half-built transactions are never handed back.

use thiserror::Error;

/// Core error type
///
/// Local arithmetic and selection failures (`InsufficientFunds`,
/// `InsufficientAssetBalance`, `MissingRequiredParameters`) surface
/// immediately. Source failures are retried across the fallback chain but
/// never against the same source twice.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaserError {
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Insufficient asset balance: {0}")]
    InsufficientAssetBalance(String),

    #[error("No UTXOs found: {0}")]
    NoUtxosFound(String),

    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("Unsupported by wallet provider {provider}: {method}")]
    UnsupportedByProvider { provider: String, method: String },

    #[error("Unsupported by data source: {0}")]
    UnsupportedByDataSource(String),

    #[error("User rejected the request")]
    UserRejected,

    #[error("Invalid transaction format: {0}")]
    InvalidTransactionFormat(String),

    #[error("All data sources failed: {}", .0.join("; "))]
    AllSourcesFailed(Vec<String>),

    #[error("Missing required parameters: {0}")]
    MissingRequiredParameters(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Wallet provider not registered: {0}")]
    ProviderNotFound(String),

    #[error("Wallet not connected")]
    NotConnected,

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl LaserError {
    /// The user declined a signer prompt. Callers surface this without error logging.
    pub fn is_user_rejection(&self) -> bool {
        matches!(self, Self::UserRejected)
    }

    /// Whether the fallback chain may move on to the next source after this error
    pub fn is_retryable_across_sources(&self) -> bool {
        matches!(
            self,
            Self::Http(_)
                | Self::Rpc(_)
                | Self::Parse(_)
                | Self::Timeout(_)
                | Self::UnsupportedNetwork(_)
                | Self::UnsupportedByDataSource(_)
                | Self::NoUtxosFound(_)
        )
    }

    pub(crate) fn unsupported_by_provider(provider: &str, method: &str) -> Self {
        Self::UnsupportedByProvider {
            provider: provider.to_string(),
            method: method.to_string(),
        }
    }
}

impl From<reqwest::Error> for LaserError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::Http(err.to_string())
        }
    }
}

impl From<serde_json::Error> for LaserError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<hex::FromHexError> for LaserError {
    fn from(err: hex::FromHexError) -> Self {
        Self::Parse(format!("hex: {}", err))
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, LaserError>;
