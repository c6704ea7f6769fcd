//! An abstraction layer for chat-completion providers.
//!
//! This crate establishes an unified protocol for the chat client to talk
//! to any supported LLM backend, so that the user can switch between
//! providers and models at runtime without touching the conversation logic.
//!
//! Types in this crate don't define any behavior, instead they are the
//! constraints that the implementors should adhere to.

#![deny(missing_docs)]

mod error;
mod provider;
mod request;
mod response;

pub use error::*;
pub use provider::*;
pub use request::*;
pub use response::*;
