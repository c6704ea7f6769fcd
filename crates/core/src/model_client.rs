use std::future::poll_fn;
use std::pin::{Pin, pin};
use std::sync::Arc;

use apai_model::{
    ModelFinishReason, ModelProvider, ModelProviderError, ModelRequest,
    ModelResponse, ModelResponseEvent,
};
use tracing::Instrument;

type SendRequestResult =
    Result<ModelClientResponse, Box<dyn ModelProviderError>>;
type BoxedSendRequestFuture =
    Pin<Box<dyn Future<Output = SendRequestResult> + Send>>;
type FragmentFn = Box<dyn FnMut(StreamFragment) + Send + 'static>;
#[rustfmt::skip]
type HandlerFn = Arc<
    dyn Fn(ModelRequest, FragmentFn) -> BoxedSendRequestFuture + Send + Sync
>;

/// A piece of a streamed reply, delivered as soon as it arrives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamFragment {
    /// Part of the model's reasoning. It is shown but never stored.
    Reasoning(String),
    /// Part of the answer.
    Content(String),
}

/// A wrapper around a model provider that provides a type-erased
/// interface for the other modules.
#[derive(Clone)]
pub struct ModelClient {
    handler_fn: HandlerFn,
}

impl ModelClient {
    #[inline]
    pub fn new<P: ModelProvider + 'static>(provider: P) -> Self {
        // Erase `P`, so the agent doesn't need a generic parameter and the
        // provider can be swapped when the model changes.
        let handler_fn: HandlerFn = Arc::new(move |req, on_fragment| {
            let fut = provider.send_request(&req);
            Box::pin(
                async move {
                    trace!("got a request: {:?}", req);
                    let resp_or_err = fut.await;
                    handle_response::<P>(resp_or_err, on_fragment).await
                }
                .instrument(trace_span!("model client req")),
            )
        });
        Self { handler_fn }
    }

    /// Sends a request and collects the whole response, reporting each
    /// fragment through `on_fragment` along the way.
    ///
    /// # Cancel safety
    ///
    /// This method is cancel safe. The response stops streaming further
    /// events when this operation is cancelled.
    #[inline]
    pub async fn send_request(
        &self,
        req: ModelRequest,
        on_fragment: impl FnMut(StreamFragment) + Send + 'static,
    ) -> SendRequestResult {
        (self.handler_fn)(req, Box::new(on_fragment)).await
    }
}

/// A completely received response from the model client.
#[derive(Clone, Debug, Default)]
pub struct ModelClientResponse {
    /// The answer text.
    pub content: String,
    /// The reasoning text, empty for models that don't reason.
    pub reasoning: String,
    /// The reason the model finished generating.
    pub finish_reason: Option<ModelFinishReason>,
}

async fn handle_response<P: ModelProvider + 'static>(
    resp_or_err: Result<P::Response, P::Error>,
    mut on_fragment: FragmentFn,
) -> SendRequestResult {
    let resp = match resp_or_err {
        Ok(resp) => resp,
        Err(err) => {
            error!("got an error: {err:?}");
            return Err(Box::new(err));
        }
    };

    let mut collected = ModelClientResponse::default();

    trace!("start receiving events");

    let mut pinned_resp = pin!(resp);
    loop {
        let event_or_err =
            poll_fn(|cx| pinned_resp.as_mut().poll_next_event(cx)).await;
        let event = match event_or_err {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(err) => {
                error!("got an error: {err:?}");
                return Err(Box::new(err));
            }
        };
        trace!("got an event: {event:?}");

        match event {
            ModelResponseEvent::ReasoningDelta(text) => {
                collected.reasoning.push_str(&text);
                on_fragment(StreamFragment::Reasoning(text));
            }
            ModelResponseEvent::MessageDelta(text) => {
                collected.content.push_str(&text);
                on_fragment(StreamFragment::Content(text));
            }
            ModelResponseEvent::Completed(reason) => {
                collected.finish_reason = Some(reason);
            }
        }
    }

    trace!("finished a request");
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use apai_model::{ErrorKind, ModelMessage};
    use apai_test_model::{PresetEvent, PresetResponse, TestModelProvider};

    use super::*;

    fn request() -> ModelRequest {
        ModelRequest {
            messages: vec![ModelMessage::User("Hi".to_owned())],
        }
    }

    #[tokio::test]
    async fn test_send_request() {
        let model_provider = TestModelProvider::default();
        model_provider.add_response(PresetResponse::with_events([
            PresetEvent::ReasoningDelta("Be polite.".to_owned()),
            PresetEvent::MessageDelta("How ".to_owned()),
            PresetEvent::MessageDelta("are ".to_owned()),
            PresetEvent::MessageDelta("you?".to_owned()),
        ]));

        let model_client = ModelClient::new(model_provider);
        let fragments = Arc::new(Mutex::new(Vec::new()));
        let resp = model_client
            .send_request(request(), {
                let fragments = Arc::clone(&fragments);
                move |fragment| fragments.lock().unwrap().push(fragment)
            })
            .await
            .unwrap();

        assert_eq!(resp.content, "How are you?");
        assert_eq!(resp.reasoning, "Be polite.");
        assert_eq!(resp.finish_reason, Some(ModelFinishReason::Stop));
        let fragments = fragments.lock().unwrap();
        assert_eq!(fragments.len(), 4);
        assert_eq!(
            fragments[0],
            StreamFragment::Reasoning("Be polite.".to_owned())
        );
        assert_eq!(fragments[3], StreamFragment::Content("you?".to_owned()));
    }

    #[tokio::test]
    async fn test_error_handling() {
        let model_provider = TestModelProvider::default();
        let model_client = ModelClient::new(model_provider);
        let err = model_client
            .send_request(request(), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimitExceeded);
    }

    #[tokio::test]
    async fn test_broken_stream() {
        let model_provider = TestModelProvider::default();
        model_provider.add_response(
            PresetResponse::with_text("Never finished").with_failures(0),
        );
        let model_client = ModelClient::new(model_provider);

        let err = model_client
            .send_request(request(), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
    }
}
