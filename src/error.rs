//! Error taxonomy for cache operations

use std::path::PathBuf;

use thiserror::Error;
use tonic::{Code, Status};

pub type Result<T, E = KvError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum KvError {
    /// The remote does not hold the requested key.
    #[error("cache entry not found")]
    CacheNotFound,

    /// The remote rejected our credentials. Never retried.
    #[error("unauthenticated: {0}")]
    CacheUnauthenticated(String),

    #[error("file exists and is not writable: {}", .0.display())]
    FileExistsAndNotWritable(PathBuf),

    #[error("integrity mismatch: expected sha256 {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline of {0:?} exceeded")]
    Timeout(std::time::Duration),

    /// A file no longer matches the hash it was listed under.
    #[error("{} changed since it was hashed: expected {expected}, now {actual}", .path.display())]
    ContentChanged {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("short write: committed {committed} bytes, expected {expected}")]
    ShortWrite { committed: i64, expected: i64 },

    #[error("rpc failed: {0}")]
    Rpc(Status),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid endpoint '{0}': expected grpc://host:port or grpcs://host:port")]
    InvalidEndpoint(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Aggregate failure of a file-group transfer.
    #[error("{failed} file(s) failed, {missing} file(s) missing")]
    Group { failed: usize, missing: usize },
}

impl KvError {
    /// Classify a gRPC status into the cache error taxonomy.
    pub fn from_status(status: Status) -> Self {
        match status.code() {
            Code::NotFound => KvError::CacheNotFound,
            Code::Unauthenticated => KvError::CacheUnauthenticated(status.message().to_string()),
            _ => KvError::Rpc(status),
        }
    }

    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            KvError::CacheNotFound
                | KvError::CacheUnauthenticated(_)
                | KvError::FileExistsAndNotWritable(_)
                | KvError::ContentChanged { .. }
                | KvError::Cancelled
                | KvError::InvalidEndpoint(_)
                | KvError::InvalidArgument(_)
                | KvError::Config(_)
        )
    }

    /// The gRPC code carried by an `Rpc` error, if any.
    pub fn code(&self) -> Option<Code> {
        match self {
            KvError::Rpc(status) => Some(status.code()),
            KvError::CacheNotFound => Some(Code::NotFound),
            KvError::CacheUnauthenticated(_) => Some(Code::Unauthenticated),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, KvError::CacheNotFound)
    }
}

impl From<Status> for KvError {
    fn from(status: Status) -> Self {
        KvError::from_status(status)
    }
}
