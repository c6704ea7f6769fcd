use std::fmt::Debug;
use std::time::Duration;

/// Reasoning models may think for minutes before the first token.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1800);

/// Builder for [`OpenAIConfig`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct OpenAIConfigBuilder {
    api_key: String,
    model: Option<String>,
    base_url: Option<String>,
    timeout: Option<Duration>,
}

impl OpenAIConfigBuilder {
    /// Creates a builder with the given API key.
    #[inline]
    pub fn with_api_key<S: Into<String>>(api_key: S) -> Self {
        Self {
            api_key: api_key.into(),
            model: None,
            base_url: None,
            timeout: None,
        }
    }

    /// Sets the model to use.
    #[inline]
    pub fn with_model<S: Into<String>>(mut self, model: S) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets a custom base URL.
    #[inline]
    pub fn with_base_url<S: Into<String>>(mut self, base_url: S) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Sets the overall timeout of one request, including the whole
    /// streamed body.
    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builds the configuration.
    #[inline]
    pub fn build(self) -> OpenAIConfig {
        let base_url = self
            .base_url
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        OpenAIConfig {
            api_key: self.api_key,
            model: self.model.unwrap_or_else(|| "gpt-4o-mini".to_string()),
            base_url: base_url.trim_end_matches('/').to_owned(),
            timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT),
        }
    }
}

impl Debug for OpenAIConfigBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIConfigBuilder")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Configuration for the OpenAI-compatible provider.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct OpenAIConfig {
    pub(crate) api_key: String,
    pub(crate) model: String,
    pub(crate) base_url: String,
    pub(crate) timeout: Duration,
}

impl OpenAIConfig {
    /// Returns the model name sent with every request.
    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Returns the base URL without a trailing slash.
    #[inline]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl Debug for OpenAIConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIConfig")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OpenAIConfigBuilder::with_api_key("sk-secret").build();
        assert_eq!(config.base_url(), "https://api.openai.com/v1");
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_trailing_slash_and_redaction() {
        let config = OpenAIConfigBuilder::with_api_key("sk-secret")
            .with_base_url("https://api.deepseek.com/")
            .with_model("deepseek-reasoner")
            .build();
        assert_eq!(config.base_url(), "https://api.deepseek.com");
        assert_eq!(config.model(), "deepseek-reasoner");
        assert!(!format!("{config:?}").contains("sk-secret"));
    }
}
