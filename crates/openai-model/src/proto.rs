use apai_model::{ModelMessage, ModelRequest};
use serde::{Deserialize, Serialize};

use crate::OpenAIConfig;

// ------------------------------
// Types received from the server
// ------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
pub struct Delta {
    pub content: Option<String>,
    pub reasoning_content: Option<String>,
    // Some gateways name the field `reasoning`, others send both.
    pub reasoning: Option<String>,
}

impl Delta {
    /// Takes the reasoning text, preferring `reasoning_content`.
    #[inline]
    pub fn take_reasoning(&mut self) -> Option<String> {
        let reasoning = self.reasoning.take().filter(|s| !s.is_empty());
        self.reasoning_content
            .take()
            .filter(|s| !s.is_empty())
            .or(reasoning)
    }
}

// ------------------------
// Types sent to the server
// ------------------------

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    System { content: String },
    User { content: String },
    Assistant { content: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    stream: bool,
}

// -----------
// Conversions
// -----------

#[inline]
pub fn create_request(
    req: &ModelRequest,
    config: &OpenAIConfig,
) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: config.model.clone(),
        messages: req.messages.iter().map(create_message).collect(),
        stream: true,
    }
}

#[inline]
fn create_message(msg: &ModelMessage) -> Message {
    let content = msg.content().to_owned();
    match msg {
        ModelMessage::System(_) => Message::System { content },
        ModelMessage::User(_) => Message::User { content },
        ModelMessage::Assistant(_) => Message::Assistant { content },
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::OpenAIConfigBuilder;

    #[test]
    fn test_create_request() {
        let request = ModelRequest {
            messages: vec![
                ModelMessage::System("You are a helpful assistant.".to_owned()),
                ModelMessage::User("Hello".to_owned()),
                ModelMessage::Assistant("Hi".to_owned()),
            ],
        };
        let config = OpenAIConfigBuilder::with_api_key("xxx")
            .with_model("custom")
            .build();
        let payload =
            serde_json::to_value(create_request(&request, &config)).unwrap();
        assert_eq!(
            payload,
            json!({
                "model": "custom",
                "messages": [
                    { "role": "system", "content": "You are a helpful assistant." },
                    { "role": "user", "content": "Hello" },
                    { "role": "assistant", "content": "Hi" }
                ],
                "stream": true
            })
        );
    }

    #[test]
    fn test_parse_chunks() {
        let chunk: ChatCompletionChunk = serde_json::from_str(
            r#"{"id":"a","choices":[{"index":0,"delta":{"role":"assistant","reasoning":"hmm"},"finish_reason":null}]}"#,
        )
        .unwrap();
        let mut delta = chunk.choices[0].delta.clone();
        assert_eq!(delta.take_reasoning().as_deref(), Some("hmm"));

        let chunk: ChatCompletionChunk = serde_json::from_str(
            r#"{"id":"a","choices":[{"index":0,"delta":{"reasoning_content":"hmm","reasoning":"hmm"},"finish_reason":null}]}"#,
        )
        .unwrap();
        let mut delta = chunk.choices[0].delta.clone();
        assert_eq!(delta.take_reasoning().as_deref(), Some("hmm"));
        assert_eq!(delta.take_reasoning(), None);

        // Usage-only chunk at the end of a stream.
        let chunk: ChatCompletionChunk = serde_json::from_str(
            r#"{"id":"a","choices":[],"usage":{"total_tokens":3}}"#,
        )
        .unwrap();
        assert!(chunk.choices.is_empty());
    }
}
