//! Error types for the reconciliation service boundary
//!
//! Library internals return `anyhow::Result`; callers of `ReconcileService`
//! get a typed error so they can tell "busy" apart from a broken store.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Another preview or apply is outstanding
    #[error("{0} already in progress")]
    InFlight(&'static str),

    /// Configuration could not be read or is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Directory or staging store failure
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type ReconcileResult<T> = std::result::Result<T, ReconcileError>;
