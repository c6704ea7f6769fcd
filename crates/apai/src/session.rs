use std::path::PathBuf;

use apai_core::store::{SaveFile, StoreError, read_save};
use apai_core::{Agent, AgentBuilder, AgentError};
use apai_model::ModelProvider;
use apai_openai_model::{OpenAIConfigBuilder, OpenAIProvider};

use crate::environment::{EnvError, Environment};

/// Errors from building, saving or loading a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The configuration is incomplete or could not be changed.
    #[error(transparent)]
    Env(#[from] EnvError),
    /// The agent could not be built or its files written.
    #[error(transparent)]
    Agent(#[from] AgentError),
    /// A save file is missing or malformed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The HTTP client could not be created.
    #[error("cannot create the provider: {0}")]
    Provider(#[from] apai_openai_model::Error),
    /// No save of that name exists.
    #[error("save file {} does not exist", .0.display())]
    SaveNotFound(PathBuf),
}

/// A chat session: one agent built from the current configuration.
///
/// Changing the model, instruction or context length always builds a new
/// session with [`Session::reinitialize`] rather than patching the agent.
pub struct Session {
    agent: Agent,
}

impl Session {
    /// Builds a fresh session from the current configuration.
    pub fn reinitialize(env: &Environment) -> Result<Self, SessionError> {
        Self::build(env, openai_provider(env)?, None)
    }

    /// Replaces this session with the named save.
    ///
    /// The configuration switches to the model and instruction recorded in
    /// the save. If the save is missing, malformed, or names an unknown
    /// model or instruction, neither the session nor the configuration
    /// changes.
    pub fn load(
        &mut self,
        env: &mut Environment,
        name: &str,
    ) -> Result<(), SessionError> {
        let path = env.save_path(name);
        if !path.exists() {
            return Err(SessionError::SaveNotFound(path));
        }
        let save = read_save(&path)?;

        let mut next_env = env.clone();
        next_env.apply_save_header(&save.model_id, &save.instr_key)?;
        let provider = openai_provider(&next_env)?;
        let session = Self::build(&next_env, provider, Some((save, path)))?;
        next_env.persist()?;
        *self = session;
        *env = next_env;
        Ok(())
    }

    /// Copies the current save file to the named save and keeps writing
    /// there. Returns the path of the save.
    pub fn save(
        &mut self,
        env: &Environment,
        name: &str,
    ) -> Result<PathBuf, SessionError> {
        let path = env.save_path(name);
        self.agent.save_as(&path)?;
        Ok(path)
    }

    /// Returns the agent.
    #[inline]
    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Returns the agent for chatting.
    #[inline]
    pub fn agent_mut(&mut self) -> &mut Agent {
        &mut self.agent
    }

    fn build<P: ModelProvider + 'static>(
        env: &Environment,
        provider: P,
        restored: Option<(SaveFile, PathBuf)>,
    ) -> Result<Self, SessionError> {
        let config = env.config();
        let mut builder = AgentBuilder::with_model_provider(provider)
            .with_provider_name(&config.provider)
            .with_model_id(&config.model_id)
            .with_instruction(&config.instr_key, env.instruction()?)
            .with_context_len(config.context_len.max(1))
            .with_log_dir(env.log_dir());
        if let Some((save, path)) = restored {
            builder = builder.with_restored(save, path);
        }
        let agent = builder.build()?;
        info!("session ready: {} / {}", config.model_id, config.instr_key);
        Ok(Self { agent })
    }
}

fn openai_provider(env: &Environment) -> Result<OpenAIProvider, SessionError> {
    let config = env.config();
    let openai_config = OpenAIConfigBuilder::with_api_key(&config.api)
        .with_base_url(&config.url)
        .with_model(&config.model_id)
        .build();
    Ok(OpenAIProvider::new(openai_config)?)
}
