//! Core types and traits for the jobflow orchestration engine.
//!
//! This crate contains:
//! - Job identifiers and the engine's error taxonomy
//! - The `Step` trait and its one-shot `Completer` capability
//! - The shared context record threaded through step handlers

pub mod completer;
pub mod context;
pub mod error;
pub mod id;
pub mod step;

pub use completer::Completer;
pub use context::SharedContext;
pub use error::{Error, Result};
pub use id::JobId;
pub use step::Step;
