//! Error types for the DHCP/TFTP supervisor.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.

/// Exit code asking the process manager to start the daemon again.
pub const RESTART_EXIT_CODE: i32 = 5;

/// Errors that can occur while validating, building or supervising the
/// DHCP/TFTP service configuration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or socket I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (settings, store or lease files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A proposed configuration write was rejected.
    ///
    /// The message names the offending field or value and is shown to the
    /// operator unchanged, so it carries no prefix.
    #[error("{0}")]
    Validation(String),

    /// The external service could not be started.
    ///
    /// Either the OS refused to spawn it or it wrote to its error stream
    /// before startup was confirmed.
    #[error("Service failed to start: {0}")]
    ProcessSpawn(String),

    /// The configuration store cannot be reached.
    #[error("Configuration store unavailable: {0}")]
    StoreUnavailable(String),

    /// Control endpoint failure (bind, connect or protocol error).
    #[error("Control endpoint error: {0}")]
    Control(String),

    /// Invalid daemon settings.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Builds a [`Error::Validation`] from anything printable.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Returns true for errors that must stop the daemon when they happen
    /// before the steady-state loop is reached.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

/// A specialized Result type for supervisor operations.
pub type Result<T> = std::result::Result<T, Error>;
