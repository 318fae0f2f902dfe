use crate::types::{DataType, Key};

pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors surfaced by the aggregation core.
///
/// None of these are recovered locally: every peer shares a step counter,
/// so silently dropping a reduction would desynchronize training. The
/// embedding process is expected to log the error and exit, letting the
/// orchestrator restart it.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("unrecognized request command 0x{cmd:x}")]
    UnknownRequestType { cmd: u32 },

    #[error("row-sparse push/pull is not implemented (key {key})")]
    RowSparseUnsupported { key: Key },

    #[error("request carries {keys} keys and {lens} lens, expected exactly one of each")]
    PairArity { keys: usize, lens: usize },

    #[error("payload is {actual} bytes but lens[0] declares {declared}")]
    PayloadLength { declared: usize, actual: usize },

    #[error("push for key {key} carries {got} bytes, store was initialized with {expected}")]
    LengthMismatch {
        key: Key,
        expected: usize,
        got: usize,
    },

    #[error("key {key} has no initialized store; init-push must precede {op}")]
    StoreNotInitialized { key: Key, op: &'static str },

    #[error("merged buffer for key {key} was never produced")]
    MergedNotReady { key: Key },

    #[error("unsupported data type {dtype} for {op}")]
    UnsupportedDType { dtype: DataType, op: &'static str },

    #[error("aligned allocation of {bytes} bytes failed")]
    Allocation { bytes: usize },

    #[error("failed to spawn engine thread: {0}")]
    EngineSpawn(#[source] std::io::Error),

    #[error("unknown compressor '{name}'")]
    UnknownCompressor { name: String },

    #[error("hyper-parameter '{name}' is missing")]
    MissingHyperParam { name: &'static str },

    #[error("hyper-parameter '{name}' has invalid value '{value}'")]
    InvalidHyperParam { name: &'static str, value: String },

    #[error("compressed payload malformed: {0}")]
    CompressedPayload(String),

    #[error("{op} is not supported by this compressor")]
    CompressorUnsupportedOp { op: &'static str },

    #[error("learning-rate channel: {message}")]
    LrChannel {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

impl ServerError {
    /// Create an `LrChannel` error with just a message.
    pub fn lr_channel(msg: impl Into<String>) -> Self {
        Self::LrChannel {
            message: msg.into(),
            source: None,
        }
    }

    /// Create an `LrChannel` error with a message and the I/O cause.
    pub fn lr_channel_with_source(msg: impl Into<String>, source: std::io::Error) -> Self {
        Self::LrChannel {
            message: msg.into(),
            source: Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = ServerError::LengthMismatch {
            key: 9,
            expected: 16,
            got: 12,
        };
        assert_eq!(
            e.to_string(),
            "push for key 9 carries 12 bytes, store was initialized with 16"
        );
    }

    #[test]
    fn test_lr_channel_source_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no lr.s");
        let e = ServerError::lr_channel_with_source("open failed", io);
        assert!(e.to_string().contains("open failed"));
        assert!(std::error::Error::source(&e).is_some());
    }

    #[test]
    fn test_all_variants_display() {
        let errors: Vec<ServerError> = vec![
            ServerError::UnknownRequestType { cmd: 0xff },
            ServerError::RowSparseUnsupported { key: 1 },
            ServerError::PairArity { keys: 2, lens: 1 },
            ServerError::PayloadLength {
                declared: 8,
                actual: 4,
            },
            ServerError::LengthMismatch {
                key: 0,
                expected: 8,
                got: 4,
            },
            ServerError::StoreNotInitialized { key: 7, op: "pull" },
            ServerError::MergedNotReady { key: 7 },
            ServerError::UnsupportedDType {
                dtype: DataType::I64,
                op: "sparse_sum",
            },
            ServerError::Allocation { bytes: 1 << 20 },
            ServerError::EngineSpawn(std::io::Error::new(
                std::io::ErrorKind::Other,
                "resource exhausted",
            )),
            ServerError::UnknownCompressor {
                name: "gzip".into(),
            },
            ServerError::MissingHyperParam {
                name: "compressor_k",
            },
            ServerError::InvalidHyperParam {
                name: "momentum_mu",
                value: "nan".into(),
            },
            ServerError::CompressedPayload("truncated header".into()),
            ServerError::CompressorUnsupportedOp {
                op: "fused_compress",
            },
            ServerError::lr_channel("mmap failed"),
        ];
        for e in &errors {
            assert!(!e.to_string().is_empty(), "empty display for {e:?}");
        }
    }
}
