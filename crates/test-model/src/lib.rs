//! A local fake model for testing purpose.

mod preset;

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::fmt::{self, Debug, Display, Formatter};
use std::future::ready;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use apai_model::{
    ErrorKind, ModelFinishReason, ModelProvider, ModelProviderError,
    ModelRequest, ModelResponse, ModelResponseEvent,
};
use tokio::time::{Sleep, sleep};

pub use preset::*;

#[derive(Debug)]
pub struct Error {
    message: &'static str,
    kind: ErrorKind,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.message)
    }
}

impl StdError for Error {}

impl ModelProviderError for Error {
    #[inline]
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

pub struct TestModelResponse {
    events: Vec<PresetEvent>,
    // Index of the event at which the stream breaks, if it does.
    break_at: Option<usize>,
    event_idx: usize,
    delay: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl ModelResponse for TestModelResponse {
    type Error = crate::Error;

    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>> {
        let this = self.get_mut();
        let delay = this.delay;
        let sleep = this.sleep.get_or_insert_with(|| Box::pin(sleep(delay)));
        ready!(sleep.as_mut().poll(cx));
        this.sleep = None;

        if this.break_at == Some(this.event_idx) {
            // Never yield anything after the break.
            this.event_idx = usize::MAX;
            return Poll::Ready(Err(Error {
                message: "stream interrupted",
                kind: ErrorKind::Other,
            }));
        }

        let idx = this.event_idx;
        if idx < this.events.len() {
            this.event_idx += 1;
            let event = match &this.events[idx] {
                PresetEvent::ReasoningDelta(text) => {
                    ModelResponseEvent::ReasoningDelta(text.clone())
                }
                PresetEvent::MessageDelta(text) => {
                    ModelResponseEvent::MessageDelta(text.clone())
                }
            };
            Poll::Ready(Ok(Some(event)))
        } else if idx == this.events.len() {
            this.event_idx += 1;
            Poll::Ready(Ok(Some(ModelResponseEvent::Completed(
                ModelFinishReason::Stop,
            ))))
        } else {
            // In case this method is called after completion.
            Poll::Ready(Ok(None))
        }
    }
}

#[derive(Default)]
struct Script {
    responses: VecDeque<PresetResponse>,
    requests: Vec<ModelRequest>,
}

/// A local fake model for testing purpose.
///
/// Before sending requests, you need to queue the responses the model should
/// answer with. Each request consumes the front response, unless that
/// response is scripted to fail, in which case it stays queued until its
/// failures are used up. Requesting with an empty queue is an error.
///
/// Every request is recorded, so tests can check exactly which context was
/// sent to the model.
///
/// Cloned providers share the same script.
#[derive(Clone, Default)]
pub struct TestModelProvider {
    script: Arc<Mutex<Script>>,
    delay: Option<Duration>,
}

impl TestModelProvider {
    #[inline]
    pub fn add_response(&self, preset: PresetResponse) {
        self.lock().responses.push_back(preset);
    }

    #[inline]
    pub fn add_text_response(&self, text: impl Into<String>) {
        self.add_response(PresetResponse::with_text(text));
    }

    #[inline]
    pub fn set_delay(&mut self, duration: Duration) {
        self.delay = Some(duration);
    }

    /// Returns all requests received so far, oldest first.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.lock().requests.clone()
    }

    /// Returns the number of queued responses that are not consumed yet.
    pub fn pending_responses(&self) -> usize {
        self.lock().responses.len()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().expect("test script lock is poisoned")
    }
}

impl ModelProvider for TestModelProvider {
    type Error = crate::Error;
    type Response = TestModelResponse;

    fn send_request(
        &self,
        req: &ModelRequest,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>> + Send + 'static
    {
        let mut script = self.lock();
        script.requests.push(req.clone());

        let delay = self.delay.unwrap_or(Duration::from_millis(1));
        let result = match script.responses.front_mut() {
            None => Err(Error {
                message: "no response left in the script",
                kind: ErrorKind::RateLimitExceeded,
            }),
            Some(preset) => {
                let failing = match preset.failures {
                    None => false,
                    Some(0) => true,
                    Some(1) => {
                        preset.failures = None;
                        true
                    }
                    Some(n) => {
                        preset.failures = Some(n - 1);
                        true
                    }
                };
                let events = preset.events.clone();
                if !failing {
                    script.responses.pop_front();
                }
                Ok(TestModelResponse {
                    break_at: failing.then_some(events.len().min(1)),
                    events,
                    event_idx: 0,
                    delay,
                    sleep: None,
                })
            }
        };
        ready(result)
    }
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;
    use std::pin::pin;

    use apai_model::ModelMessage;

    use super::*;

    async fn collect_response(
        resp: TestModelResponse,
    ) -> Result<(String, String), Error> {
        let mut resp = pin!(resp);
        let mut reasoning = String::new();
        let mut msg = String::new();
        loop {
            let event = poll_fn(|cx| resp.as_mut().poll_next_event(cx)).await?;
            match event {
                None | Some(ModelResponseEvent::Completed(_)) => break,
                Some(ModelResponseEvent::ReasoningDelta(delta)) => {
                    reasoning.push_str(&delta);
                }
                Some(ModelResponseEvent::MessageDelta(delta)) => {
                    msg.push_str(&delta);
                }
            }
        }
        Ok((reasoning, msg))
    }

    fn request(text: &str) -> ModelRequest {
        ModelRequest {
            messages: vec![ModelMessage::User(text.to_owned())],
        }
    }

    #[tokio::test]
    async fn test_send_request() {
        let provider = TestModelProvider::default();
        provider.add_response(PresetResponse::with_events([
            PresetEvent::ReasoningDelta("A greeting.".to_owned()),
            PresetEvent::MessageDelta("Hello, ".to_owned()),
            PresetEvent::MessageDelta("world!".to_owned()),
        ]));
        provider.add_text_response("Sure.");

        let resp = provider.send_request(&request("Hi")).await.unwrap();
        let (reasoning, msg) = collect_response(resp).await.unwrap();
        assert_eq!(reasoning, "A greeting.");
        assert_eq!(msg, "Hello, world!");

        let resp = provider.send_request(&request("Again")).await.unwrap();
        let (_, msg) = collect_response(resp).await.unwrap();
        assert_eq!(msg, "Sure.");

        assert_eq!(provider.pending_responses(), 0);
        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1], request("Again"));
    }

    #[tokio::test]
    async fn test_failures_then_success() {
        let provider = TestModelProvider::default();
        provider.add_response(
            PresetResponse::with_events([
                PresetEvent::MessageDelta("Half ".to_owned()),
                PresetEvent::MessageDelta("answer".to_owned()),
            ])
            .with_failures(2),
        );

        for _ in 0..2 {
            let resp = provider.send_request(&request("Hi")).await.unwrap();
            let err = collect_response(resp).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Other);
        }
        let resp = provider.send_request(&request("Hi")).await.unwrap();
        let (_, msg) = collect_response(resp).await.unwrap();
        assert_eq!(msg, "Half answer");
    }

    #[tokio::test]
    async fn test_exhausted_script() {
        let provider = TestModelProvider::default();
        let err = provider.send_request(&request("Hi")).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::RateLimitExceeded);
        assert_eq!(provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_delay() {
        let mut provider = TestModelProvider::default();
        provider.set_delay(Duration::from_millis(20));
        provider.add_text_response("Slow.");

        let start = std::time::Instant::now();
        let resp = provider.send_request(&request("Hi")).await.unwrap();
        let (_, msg) = collect_response(resp).await.unwrap();
        assert_eq!(msg, "Slow.");
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
