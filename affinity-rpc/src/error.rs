use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by routing, registry and dispatch operations.
///
/// A routed call reports at most one of these. Absence in the [`KeyRing`]
/// is an `Option`, not an error.
///
/// [`KeyRing`]: crate::ring::KeyRing
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid address, TTL, replica count or other construction input.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Empty node set or unreachable registry.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Missing routing key or unknown policy name.
    #[error("routing failed: {0}")]
    Routing(String),

    /// Watch setup or call deadline exceeded.
    #[error("{what} timed out after {after:?}")]
    Timeout { what: &'static str, after: Duration },

    /// A watch stream hiccup; callers retry after a fixed delay.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A job panicked while executing; the worker survived.
    #[error("job for key '{key}' panicked: {message}")]
    RecoveredPanic { key: String, message: String },

    /// The owning component was shut down.
    #[error("operation canceled")]
    Canceled,

    #[error("registry record codec: {0}")]
    Codec(#[from] serde_json::Error),

    /// The registry backend rejected or failed an operation.
    #[error("registry store: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}
