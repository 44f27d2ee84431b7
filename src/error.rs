//! Error types for the lease engine and its broker.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.

use std::net::Ipv4Addr;

/// Errors that can occur while allocating, persisting or brokering leases.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or socket I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config, lease file or IPC body).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid engine configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate) and while
    /// loading the lease file. Always surfaced at setup, never per request.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The caller asked for a block size other than four addresses.
    #[error("Only /30 (255.255.255.252) blocks are supported, got mask {0}")]
    UnsupportedBlockSize(Ipv4Addr),

    /// Every four-address block in the pool is assigned.
    ///
    /// Leases are never reclaimed, so this persists until the pool is widened.
    #[error("No free address block left in pool")]
    PoolExhausted,

    /// The lease table could not be written to disk.
    ///
    /// The in-memory table is left untouched when this is returned.
    #[error("Failed to persist lease for {key}: {source}")]
    Persistence {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// Malformed or invalid IPC request payload.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The request arrived on the interface configured as upstream.
    #[error("Requests from upstream interface {0} are refused")]
    UpstreamInterface(String),

    /// The broker could not be reached or the exchange broke off.
    #[error("Broker transport error: {0}")]
    Transport(String),

    /// The broker answered with a non-success status.
    #[error("Broker returned {status}: {message}")]
    Broker { status: u16, message: String },
}

/// A specialized Result type for lease operations.
pub type Result<T> = std::result::Result<T, Error>;
