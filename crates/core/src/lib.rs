//! Core logic of the chat client: the conversation window, the on-disk
//! transcript and save-state stores, and the agent that drives one turn
//! from user input to a committed reply.

#![deny(missing_docs)]

#[macro_use]
extern crate tracing;

mod agent;
pub mod conversation;
mod error;
mod model_client;
pub mod store;

pub use agent::{Agent, AgentBuilder, AgentInfo, ContextUsage};
pub use error::AgentError;
pub use model_client::StreamFragment;
