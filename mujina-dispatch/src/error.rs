//! Common error types for mujina-dispatch.
//!
//! This module provides a centralized Error enum using thiserror. Modules with
//! their own failure vocabulary (job decoding, for instance) define local error
//! types that convert into this one.

use thiserror::Error;

use crate::work::WorkError;

/// Main error type for mujina-dispatch operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors (missing URL/username, bad file, duplicate IDs)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Pool session errors
    #[error("Pool error: {0}")]
    Pool(String),

    /// Pool provider errors
    #[error("Pool provider error: {0}")]
    Provider(String),

    /// Malformed job or share data from a pool
    #[error("Protocol error: {0}")]
    Protocol(#[from] WorkError),

    /// Scheduler setup errors
    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
