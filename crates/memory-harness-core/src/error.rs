//! Error taxonomy for the memory subsystem.
//!
//! Most plumbing returns `anyhow::Result`; the variants here are the ones a
//! caller has to tell apart. Indexing and retrieval degrade on
//! [`MemoryError::ProviderUnavailable`], [`MemoryError::InvalidEmbedding`]
//! and [`MemoryError::ChunkUnreadable`]; the store recovers from
//! [`MemoryError::StoreCorrupt`]; only [`MemoryError::LogWriteFailure`] is
//! escalated to the operator.
//!
//! Use [`MemoryError::find`] to pull a typed error back out of an
//! `anyhow::Error` chain.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    /// The embedding or inference backend could not be reached.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The backend answered, but with something that is not a usable vector.
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),

    /// The on-disk vector store failed its integrity check at open time.
    #[error("vector store corrupt at {path}: {reason}")]
    StoreCorrupt { path: String, reason: String },

    /// A source file is binary or not valid UTF-8.
    #[error("unreadable file {path}: {reason}")]
    ChunkUnreadable { path: String, reason: String },

    /// A turn could not be durably appended to the episodic log.
    #[error("episodic log write failed: {0}")]
    LogWriteFailure(#[source] std::io::Error),
}

impl MemoryError {
    /// Find a `MemoryError` anywhere in an `anyhow` error chain.
    pub fn find(err: &anyhow::Error) -> Option<&MemoryError> {
        err.chain().find_map(|e| e.downcast_ref::<MemoryError>())
    }

    /// True for failures that mean "skip this operation and keep going".
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            MemoryError::ProviderUnavailable(_)
                | MemoryError::InvalidEmbedding(_)
                | MemoryError::ChunkUnreadable { .. }
        )
    }
}

/// True if `err` carries a degraded-mode [`MemoryError`].
pub fn is_degraded(err: &anyhow::Error) -> bool {
    MemoryError::find(err).is_some_and(MemoryError::is_degraded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn find_through_context() {
        let err: anyhow::Result<()> =
            Err(MemoryError::ProviderUnavailable("connection refused".into()))
                .context("embedding batch");
        let err = err.unwrap_err();
        assert!(matches!(
            MemoryError::find(&err),
            Some(MemoryError::ProviderUnavailable(_))
        ));
        assert!(is_degraded(&err));
    }

    #[test]
    fn log_failure_is_not_degraded() {
        let err = anyhow::Error::new(MemoryError::LogWriteFailure(std::io::Error::other(
            "disk full",
        )));
        assert!(!is_degraded(&err));
    }

    #[test]
    fn plain_errors_are_not_memory_errors() {
        let err = anyhow::anyhow!("something else");
        assert!(MemoryError::find(&err).is_none());
        assert!(!is_degraded(&err));
    }
}
