use thiserror::Error;

use crate::network::connection::TransportError;
use crate::network::rpc::RpcError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Network error: {0}")]
    Network(#[from] TransportError),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to open {name} database: {source}")]
    DatabaseOpen {
        name: String,
        #[source]
        source: sled::Error,
    },

    #[error("Database operation failed: {0}")]
    DatabaseOp(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<sled::Error> for StorageError {
    fn from(e: sled::Error) -> Self {
        StorageError::DatabaseOp(e.to_string())
    }
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Failures of a single discovery attempt (reconnect, gossip, bootstrap)
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Dial failed: {0}")]
    Dial(#[from] TransportError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("{method} got no reply within {secs}s")]
    NoReply { method: &'static str, secs: u64 },

    /// A failed dial whose peer-state update also failed
    #[error("Dial failed: {dial}; peer state update also failed: {storage}")]
    Bookkeeping {
        #[source]
        dial: TransportError,
        storage: StorageError,
    },
}
