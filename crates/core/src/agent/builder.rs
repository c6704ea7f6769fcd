use std::path::PathBuf;

use apai_model::ModelProvider;

use super::Agent;
use crate::conversation::Conversation;
use crate::error::AgentError;
use crate::model_client::ModelClient;
use crate::store::{SaveFile, SessionLog};

const DEFAULT_CONTEXT_LEN: usize = 3;

/// [`Agent`] builder.
pub struct AgentBuilder {
    model_client: ModelClient,
    provider_name: String,
    model_id: String,
    instr_key: String,
    instruction: String,
    context_len: usize,
    log_dir: PathBuf,
    restored: Option<(SaveFile, PathBuf)>,
}

impl AgentBuilder {
    /// Creates a new builder with the specified model provider.
    #[inline]
    pub fn with_model_provider<P: ModelProvider + 'static>(
        provider: P,
    ) -> Self {
        Self {
            model_client: ModelClient::new(provider),
            provider_name: String::new(),
            model_id: "default".to_owned(),
            instr_key: "default".to_owned(),
            instruction: String::new(),
            context_len: DEFAULT_CONTEXT_LEN,
            log_dir: PathBuf::from("log"),
            restored: None,
        }
    }

    /// Sets the provider name shown in [`Agent::info`].
    #[inline]
    pub fn with_provider_name<S: Into<String>>(mut self, name: S) -> Self {
        self.provider_name = name.into();
        self
    }

    /// Sets the model id, which also names the session files.
    #[inline]
    pub fn with_model_id<S: Into<String>>(mut self, model_id: S) -> Self {
        self.model_id = model_id.into();
        self
    }

    /// Sets the instruction and the key it is known by.
    #[inline]
    pub fn with_instruction<S1, S2>(mut self, key: S1, instruction: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        self.instr_key = key.into();
        self.instruction = instruction.into();
        self
    }

    /// Sets the number of exchanges sent as context. Must be at least 1.
    #[inline]
    pub fn with_context_len(mut self, context_len: usize) -> Self {
        self.context_len = context_len;
        self
    }

    /// Sets the directory of the transcript and working save file.
    #[inline]
    pub fn with_log_dir<P: Into<PathBuf>>(mut self, log_dir: P) -> Self {
        self.log_dir = log_dir.into();
        self
    }

    /// Starts the agent from a save file instead of an empty
    /// conversation. Later turns are appended to `path`.
    #[inline]
    pub fn with_restored<P: Into<PathBuf>>(
        mut self,
        save: SaveFile,
        path: P,
    ) -> Self {
        self.restored = Some((save, path.into()));
        self
    }

    /// Builds the agent, creating its session files.
    pub fn build(self) -> Result<Agent, AgentError> {
        let Self {
            model_client,
            provider_name,
            model_id,
            instr_key,
            instruction,
            context_len,
            log_dir,
            restored,
        } = self;
        debug_assert!(context_len > 0, "context length must be at least 1");

        let (log, conversation) = match restored {
            Some((save, path)) => (
                SessionLog::attach(
                    &log_dir,
                    &path,
                    &save,
                    &model_id,
                    &instr_key,
                )?,
                Conversation::with_turns(instruction, save.into_turns()),
            ),
            None => (
                SessionLog::create(&log_dir, &model_id, &instr_key)?,
                Conversation::new(instruction),
            ),
        };
        debug!("built agent for {model_id} with instruction {instr_key}");

        Ok(Agent {
            model_client,
            provider_name,
            model_id,
            instr_key,
            context_len,
            log_dir,
            conversation,
            log,
        })
    }
}
