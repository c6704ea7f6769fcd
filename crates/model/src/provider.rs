use std::error::Error;

use crate::error::ErrorKind;
use crate::request::ModelRequest;
use crate::response::ModelResponse;

/// The error type for a model provider.
pub trait ModelProviderError: Error + Send + Sync + 'static {
    /// Returns the kind of this error.
    fn kind(&self) -> ErrorKind;
}

/// A chat-completion backend.
///
/// A provider is bound to one model and one set of credentials. It should
/// behave like a stateless object: the chat client rebuilds it whenever the
/// user switches models, and drops the old one without notice.
pub trait ModelProvider: Send + Sync {
    /// The error type that may be returned by the provider.
    type Error: ModelProviderError;

    /// The streamed response type for this provider.
    type Response: ModelResponse<Error = Self::Error>;

    /// Starts one streaming completion for the given messages.
    fn send_request(
        &self,
        req: &ModelRequest,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>> + Send + 'static;
}
