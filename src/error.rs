use std::sync::Arc;

use thiserror::Error;

/// Failures surfaced by the cache, auth and publish operations.
///
/// "Not found" and "not modified" are ordinary lookup results, not errors.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Transport failure, timeout, open circuit or an unexpected upstream status.
    /// Never cached: the next request goes upstream again.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    /// Bad credentials or an unknown/expired token. Deliberately carries no
    /// detail about which part was wrong.
    #[error("invalid credentials")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl ProxyError {
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }
}

/// Turns an outcome shared between coalesced callers back into an owned error.
impl From<Arc<ProxyError>> for ProxyError {
    fn from(shared: Arc<ProxyError>) -> Self {
        Arc::try_unwrap(shared).unwrap_or_else(|shared| match &*shared {
            Self::UpstreamUnavailable(message) => Self::UpstreamUnavailable(message.clone()),
            Self::Unauthorized => Self::Unauthorized,
            Self::BadRequest(message) => Self::BadRequest(message.clone()),
            Self::Storage(err) => Self::Storage(anyhow::anyhow!("{err:#}")),
        })
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
