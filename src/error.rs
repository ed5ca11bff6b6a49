//! Error taxonomy.
//!
//! Most plumbing returns [`anyhow::Result`]. The variants here exist where a
//! caller has to tell failure classes apart: the binary maps
//! [`Error::Configuration`] to its own exit code, the embedding client stops
//! retrying on non-retryable [`Error::Provider`] failures, and the query layer
//! renders [`Error::Validation`] as a plain diagnostic.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Fatal, pre-flight. Raised before any backend connection is opened.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Embedding, storage or network failure.
    #[error("provider error: {message}")]
    Provider { message: String, retryable: bool },

    /// Missing or insufficient caller input at the query boundary.
    #[error("{0}")]
    Validation(String),

    /// An index written by an older schema lacks a column.
    #[error("schema compatibility: {0}")]
    SchemaCompatibility(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn retryable(msg: impl Into<String>) -> Self {
        Error::Provider {
            message: msg.into(),
            retryable: true,
        }
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Error::Provider {
            message: msg.into(),
            retryable: false,
        }
    }

    /// Whether an [`anyhow::Error`] may be retried. Anything not tagged as a
    /// non-retryable provider error counts as transient.
    pub fn is_retryable(err: &anyhow::Error) -> bool {
        !matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Provider {
                retryable: false,
                ..
            }) | Some(Error::Configuration(_))
                | Some(Error::Validation(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_errors_are_retryable() {
        let err = anyhow::anyhow!("connection reset");
        assert!(Error::is_retryable(&err));
        assert!(Error::is_retryable(&Error::retryable("429").into()));
    }

    #[test]
    fn test_client_errors_are_not_retryable() {
        assert!(!Error::is_retryable(&Error::fatal("400 bad request").into()));
        assert!(!Error::is_retryable(&Error::config("missing model").into()));
    }
}
