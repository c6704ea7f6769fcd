use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use apai_model::{
    ErrorKind, ModelFinishReason, ModelResponse, ModelResponseEvent,
};
use pin_project_lite::pin_project;

use crate::Error;
use crate::io::{ChunksError, Sse, SseError};
use crate::proto::ChatCompletionChunk;

struct PartialState {
    sse: Sse,
    id: Option<String>,
    // One chunk may carry both reasoning and content, so decoded events are
    // queued and handed out one at a time.
    pending_events: VecDeque<ModelResponseEvent>,
    done: bool,
}

type PinnedFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type NextEvent = Result<(Option<ModelResponseEvent>, PartialState), Error>;

pin_project! {
    pub struct OpenAIResponse {
        next_event_fut: Option<PinnedFuture<NextEvent>>,
    }
}

impl OpenAIResponse {
    #[inline]
    pub fn from_sse(sse: Sse) -> Self {
        let partial_state = PartialState {
            sse,
            id: None,
            pending_events: Default::default(),
            done: false,
        };
        let next_event_fut = async move { next_event(partial_state).await };
        Self {
            next_event_fut: Some(Box::pin(next_event_fut)),
        }
    }
}

impl ModelResponse for OpenAIResponse {
    type Error = crate::Error;

    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>> {
        let this = self.project();
        let Some(next_event_fut) = this.next_event_fut else {
            return Poll::Ready(Ok(None));
        };
        let (event, partial_state) =
            match ready!(next_event_fut.as_mut().poll(cx)) {
                Ok((Some(event), partial_state)) => (event, partial_state),
                Ok((None, _)) => {
                    *this.next_event_fut = None;
                    return Poll::Ready(Ok(None));
                }
                Err(err) => {
                    *this.next_event_fut = None;
                    return Poll::Ready(Err(err));
                }
            };

        // The stream may still have more data to pull, create a new future for
        // the next event.
        let next_event_fut = async move { next_event(partial_state).await };
        *this.next_event_fut = Some(Box::pin(next_event_fut));

        Poll::Ready(Ok(Some(event)))
    }
}

async fn next_event(
    mut partial_state: PartialState,
) -> Result<(Option<ModelResponseEvent>, PartialState), Error> {
    while partial_state.pending_events.is_empty() && !partial_state.done {
        let sse_event = match partial_state.sse.next_event().await {
            Ok(Some(event)) => event,
            Ok(None) => {
                partial_state.done = true;
                break;
            }
            Err(SseError::ChunksError(ChunksError::TimedOut)) => {
                return Err(Error::new(
                    "timed out while streaming",
                    ErrorKind::Timeout,
                ));
            }
            Err(err) => {
                return Err(Error::new(format!("{err:?}"), ErrorKind::Other));
            }
        };
        trace!("got sse event: {sse_event}");
        if sse_event == "[DONE]" {
            partial_state.done = true;
            break;
        }

        let chunk = serde_json::from_str::<ChatCompletionChunk>(&sse_event)
            .map_err(|err| Error::new(format!("{err}"), ErrorKind::Other))?;
        if partial_state.id.get_or_insert_with(|| chunk.id.clone()) != &chunk.id
        {
            return Err(Error::new("chunk id mismatch", ErrorKind::Other));
        };

        // Usage chunks have no choices.
        for choice in chunk.choices {
            let mut delta = choice.delta;
            if let Some(reasoning) = delta.take_reasoning() {
                partial_state
                    .pending_events
                    .push_back(ModelResponseEvent::ReasoningDelta(reasoning));
            }
            if let Some(content) = delta.content.filter(|s| !s.is_empty()) {
                partial_state
                    .pending_events
                    .push_back(ModelResponseEvent::MessageDelta(content));
            }
            if let Some(finish_reason) = choice.finish_reason {
                let finish_reason = match finish_reason.as_str() {
                    "length" => ModelFinishReason::Length,
                    "content_filter" => ModelFinishReason::ContentFilter,
                    _ => ModelFinishReason::Stop,
                };
                partial_state
                    .pending_events
                    .push_back(ModelResponseEvent::Completed(finish_reason));
            }
        }
    }

    let event = partial_state.pending_events.pop_front();
    Ok((event, partial_state))
}
