//! Error types for the CloudRAID engine

use thiserror::Error;

/// Result type alias using the crate's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the engine, its configuration layer and the CLI
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{missing} shard sources are missing, at most one can be reconstructed")]
    TooManyMissingSources { missing: usize },

    #[error("Range {start}+{len} lies outside a file of {filesize} bytes")]
    InvalidRange { start: u64, len: u64, filesize: u64 },

    #[error("Request failed: {0}")]
    Request(#[from] Failure),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Terminal failure of a single retrieval request.
///
/// Once a request records a failure every later read returns it again,
/// so the type is cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Failure {
    #[error("only {usable} shard sources remain usable, {required} are required")]
    SourcesExhausted { usable: usize, required: usize },

    #[error("no data received for {idle_secs}s")]
    FeedTimedOut { idle_secs: u64, had_data: bool },

    #[error("shard {part} reported a permanent transport failure: {reason}")]
    PermanentTransport { part: usize, reason: String },

    #[error("request was removed")]
    Removed,
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            Error::Request(Failure::FeedTimedOut { .. }) => {
                std::io::Error::new(std::io::ErrorKind::TimedOut, err)
            }
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}
