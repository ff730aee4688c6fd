//! Error types for the jobflow engine.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A failure reported by a step handler. Carries the handler's
    /// message verbatim.
    #[error("{0}")]
    Step(String),

    /// A phase timer elapsed before the handler signalled its completer.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The job was aborted from outside.
    #[error("aborted: {0}")]
    Aborted(String),

    /// Every run attempt failed without a handler-supplied error.
    #[error("max retries reached")]
    RetriesExhausted,

    /// An operation was requested in a state that forbids it. Surfaces
    /// to the immediate caller only; job state is left untouched.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
}

impl Error {
    /// Shorthand for a handler-supplied failure.
    pub fn step(message: impl Into<String>) -> Self {
        Error::Step(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
