//! A terminal chat client for OpenAI-compatible models.
//!
//! The crate includes the `apai` CLI. The pieces it is assembled from, the
//! configuration environment, the session factory, the command parser and
//! the terminal renderer, are exposed here so they can be reused and tested
//! on their own.

#![deny(missing_docs)]

#[macro_use]
extern crate tracing;

pub mod command;
pub mod environment;
pub mod render;
mod session;

pub use session::{Session, SessionError};

/// Re-exports of [`apai_core`] crate.
pub mod core {
    pub use apai_core::*;
}
