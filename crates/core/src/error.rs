//! Error types shared across the relay crates

use thiserror::Error;

/// Core error
#[derive(Error, Debug)]
pub enum Error {
    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    #[error("Tenant inactive: {0}")]
    TenantInactive(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport closed")]
    Closed,

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
