//! Error taxonomy for WhaleGuard

use thiserror::Error;

/// Failure of a call to an external collaborator (ranking, chain logs, pricing, notifications).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl SourceError {
    pub fn is_quota(&self) -> bool {
        matches!(self, SourceError::QuotaExhausted(_))
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            SourceError::Malformed(e.to_string())
        } else {
            SourceError::Transient(e.to_string())
        }
    }
}

/// A raw log that cannot be turned into a transfer event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("log was removed by a reorg")]
    Removed,

    #[error("expected 3 topics, got {0}")]
    TopicCount(usize),

    #[error("topic0 is not the Transfer signature: {0}")]
    NotTransfer(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// Reasons an event could not be valued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnrichError {
    #[error("price unavailable: {0}")]
    PriceUnavailable(SourceError),

    #[error("amount {raw} does not fit a decimal value")]
    AmountOverflow { raw: String },
}

/// Startup configuration problems. Always fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("{key}: invalid address {value}")]
    InvalidAddress { key: &'static str, value: String },

    #[error("{key}: invalid value {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("unsupported chain {0}")]
    UnsupportedChain(String),
}
