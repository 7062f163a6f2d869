use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for lipc operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Stage of a client call at which a transport failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStage {
    Connecting,
    Sending,
    AwaitingResponse,
}

impl fmt::Display for CallStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            CallStage::Connecting => "connecting",
            CallStage::Sending => "sending request",
            CallStage::AwaitingResponse => "awaiting response",
        };
        f.write_str(stage)
    }
}

/// Errors that can occur while hosting or calling endpoints
#[derive(Debug, Error)]
pub enum Error {
    /// The name is not in the local directory snapshot; no connection was attempted
    #[error("function '{0}' not found in available sockets")]
    NotFound(String),

    /// The address is known but nothing is listening on it
    #[error("endpoint '{name}' unavailable at {}: {source}", .address.display())]
    Unavailable {
        name: String,
        address: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid protocol: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// The server rejected the arguments before running the function
    #[error("invalid arguments: {0}")]
    Validation(String),

    /// The function failed; carries the server's stringified cause
    #[error("function failed: {0}")]
    Execution(String),

    /// Every worker was busy and the pending queue was full
    #[error("{0}")]
    Busy(String),

    #[error("transport failure while {stage}: {source}")]
    Transport {
        stage: CallStage,
        #[source]
        source: io::Error,
    },

    #[error("invalid endpoint name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("invalid signature for '{name}': {reason}")]
    InvalidSignature { name: String, reason: String },

    #[error("endpoint '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("function '{0}' is not declared deterministic and cannot be cached")]
    NotCacheable(String),

    #[error("address {} already has a live listener", .0.display())]
    AddressInUse(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
