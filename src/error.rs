use thiserror::Error;

use crate::transport::Rank;

#[derive(Error, Debug)]
pub enum DlmlError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Link to rank {0} is closed")]
    PeerDisconnected(Rank),

    #[error("Rank {rank} is outside a group of {size}")]
    InvalidRank { rank: Rank, size: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Malformed frame: {0}")]
    Frame(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Protocol engine stopped before answering")]
    EngineStopped,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DlmlError>;
