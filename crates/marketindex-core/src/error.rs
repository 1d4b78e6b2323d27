//! Error types for the marketindex pipeline.

use thiserror::Error;

/// Errors produced while decoding a single raw log.
///
/// A decode failure is never fatal to the pipeline: the offending log is
/// skipped and reported.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown event signature {topic0}")]
    UnknownSignature { topic0: String },

    #[error("malformed log: {reason}")]
    MalformedLog { reason: String },
}

impl DecodeError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedLog {
            reason: reason.into(),
        }
    }
}

/// Errors that can occur during indexing.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// Network failure, timeout or rate limit on the log source. Retried.
    #[error("transient log source error: {0}")]
    TransientSource(String),

    /// The log source rejected the request for a non-retryable reason.
    #[error("log source error: {0}")]
    Source(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Reorg detected at block {block_number}: expected hash {expected}, got {actual}")]
    ReorgDetected {
        block_number: u64,
        expected: String,
        actual: String,
    },

    /// A durable write failed. The batch is abandoned and the cursor stays put.
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl IndexerError {
    /// Returns `true` if the error is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientSource(_))
    }

    /// Returns `true` if the error is a reorg (recoverable).
    pub fn is_reorg(&self) -> bool {
        matches!(self, Self::ReorgDetected { .. })
    }

    /// Returns `true` if the pipeline must halt and surface the error.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::TransientSource(_) | Self::Decode(_) | Self::ReorgDetected { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(IndexerError::TransientSource("timeout".into()).is_transient());
        assert!(!IndexerError::Source("bad params".into()).is_transient());
        assert!(IndexerError::Persistence("disk full".into()).is_fatal());

        let decode: IndexerError = DecodeError::malformed("short data").into();
        assert!(!decode.is_fatal());

        let reorg = IndexerError::ReorgDetected {
            block_number: 100,
            expected: "0xa".into(),
            actual: "0xb".into(),
        };
        assert!(reorg.is_reorg());
        assert!(!reorg.is_fatal());
    }
}
