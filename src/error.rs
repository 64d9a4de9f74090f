//! Typed error taxonomy for the RALE/DStore core library.
//!
//! Mirrors the error-code families of the original C library
//! (configuration, network, consensus, storage, resource, validation,
//! threading) but surfaces them as a normal `Result<T, RaleError>`
//! instead of a thread-local last-error record.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RaleError>;

#[derive(Debug, Error)]
pub enum RaleError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("consensus error: {0}")]
    Consensus(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("resource limit exceeded: {0}")]
    Resource(String),

    #[error("invalid parameter: {0}")]
    Validation(String),

    #[error("concurrency error: {0}")]
    Threading(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RaleError {
    pub fn is_config_error(&self) -> bool {
        matches!(self, RaleError::Configuration(_))
    }

    pub fn is_network_error(&self) -> bool {
        matches!(self, RaleError::Network(_) | RaleError::Io(_))
    }

    pub fn is_consensus_error(&self) -> bool {
        matches!(self, RaleError::Consensus(_))
    }

    pub fn is_storage_error(&self) -> bool {
        matches!(self, RaleError::Storage(_))
    }

    /// Resource and threading errors are treated as fatal outside of
    /// startup configuration validation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RaleError::Resource(_) | RaleError::Threading(_))
    }
}
