use std::io;

use thiserror::Error;

/// Crate-wide error type. Every fallible public operation in this crate
/// returns `Result<T, RaftError>` so callers can match on failure kind
/// instead of string-sniffing.
#[derive(Error, Debug)]
pub enum RaftError {
    #[error("commit log I/O failure: {0}")]
    CommitLogIo(#[from] io::Error),

    #[error("malformed wire message: {0}")]
    MalformedMessage(String),

    #[error("malformed log slice: {0}")]
    MalformedLogSlice(#[from] serde_json::Error),

    #[error("peer RPC failed: {0}")]
    PeerUnreachable(String),

    #[error("unknown replica endpoint: {0}:{1}")]
    UnknownEndpoint(String, u16),

    #[error("invalid partition table: {0}")]
    InvalidPartitionTable(String),
}

pub type Result<T> = std::result::Result<T, RaftError>;
