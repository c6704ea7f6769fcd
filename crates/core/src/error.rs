use apai_model::{ErrorKind, ModelProviderError};

use crate::conversation::InvalidRole;
use crate::store::StoreError;

/// Errors returned by [`Agent`](crate::Agent) operations.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// `retry` or `undo` was called before anything was said.
    #[error("no dialog to operate on")]
    EmptyHistory,
    /// The provider failed, either before or during streaming.
    #[error("{kind}: {message}")]
    ProviderStream {
        /// What kind of failure it was.
        kind: ErrorKind,
        /// The provider's error message.
        message: String,
    },
    /// A dialog was added with the system role.
    #[error(transparent)]
    InvalidRole(#[from] InvalidRole),
    /// A session file could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AgentError {
    pub(crate) fn provider(err: Box<dyn ModelProviderError>) -> Self {
        AgentError::ProviderStream {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
