mod builder;
#[cfg(test)]
mod tests;

use std::path::{Path, PathBuf};

use apai_model::ModelFinishReason;

use crate::conversation::{Conversation, Role, Turn};
use crate::error::AgentError;
use crate::model_client::{ModelClient, StreamFragment};
use crate::store::{SaveFile, SessionLog};
pub use builder::AgentBuilder;

/// What an agent is currently talking to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentInfo {
    /// Name of the provider entry the model comes from.
    pub provider: String,
    /// The model id sent with every request.
    pub model_id: String,
    /// Key of the instruction in use.
    pub instr_key: String,
    /// Number of exchanges sent as context.
    pub context_len: usize,
}

/// How much of the conversation still fits in the context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextUsage {
    /// Exchanges sent with the next request.
    pub used: usize,
    /// The configured context length.
    pub len: usize,
    /// Exchanges no longer sent to the model.
    pub expired: usize,
}

impl ContextUsage {
    /// Computes the usage of `count` exchanges under context length `len`.
    #[inline]
    pub fn new(count: usize, len: usize) -> Self {
        Self {
            used: count.min(len),
            len,
            expired: count.saturating_sub(len),
        }
    }
}

/// A chat session with one model and one instruction.
///
/// The agent owns the in-memory conversation and the session files and keeps
/// them in step: every turn is written to disk before it enters the window,
/// and every turn taken back from the window is dropped from the save file.
///
/// A failed request leaves the user turn in place as a *pending* turn. The
/// next [`Agent::chat`] replaces it, while [`Agent::retry`] sends it again.
pub struct Agent {
    model_client: ModelClient,
    provider_name: String,
    model_id: String,
    instr_key: String,
    context_len: usize,
    log_dir: PathBuf,
    conversation: Conversation,
    log: SessionLog,
}

impl Agent {
    /// Sends a question and streams the reply through `on_fragment`.
    ///
    /// When `file` is given, its content is put in front of the question.
    /// Returns the complete answer once the stream is exhausted.
    pub async fn chat(
        &mut self,
        question: &str,
        file: Option<&str>,
        on_fragment: impl FnMut(StreamFragment) + Send + 'static,
    ) -> Result<&str, AgentError> {
        if self.conversation.has_pending() {
            self.log.drop_blocks(1)?;
            self.conversation.pop();
            debug!("discarded the pending user turn");
        }

        let content = match file {
            Some(file) => format!("{}\n{question}", file.trim_end()),
            None => question.to_owned(),
        };
        self.log.write_dialog(Role::User, &content)?;
        self.conversation.add_dialog(Role::User, content)?;
        self.dispatch(on_fragment).await
    }

    /// Asks the model to answer the newest question again.
    ///
    /// The previous reply is discarded. If the newest question never got a
    /// reply, it is simply sent again.
    pub async fn retry(
        &mut self,
        on_fragment: impl FnMut(StreamFragment) + Send + 'static,
    ) -> Result<&str, AgentError> {
        if self.conversation.dialog_count() == 0 {
            return Err(AgentError::EmptyHistory);
        }
        if !self.conversation.has_pending() {
            self.log.drop_blocks(1)?;
            self.conversation.pop();
        }
        self.log.mark_retry()?;
        self.dispatch(on_fragment).await
    }

    /// Takes back the newest exchange.
    pub fn undo(&mut self) -> Result<(), AgentError> {
        if self.conversation.dialog_count() == 0 {
            return Err(AgentError::EmptyHistory);
        }
        let blocks = if self.conversation.has_pending() { 1 } else { 2 };
        self.log.drop_blocks(blocks)?;
        for _ in 0..blocks {
            self.conversation.pop();
        }
        info!("undid the newest exchange, {blocks} turn(s) removed");
        Ok(self.log.mark_undo()?)
    }

    /// Starts over with an empty conversation.
    ///
    /// The save file is recreated. The transcript is kept and a new header
    /// is written to it with the next turn.
    pub fn reset(&mut self) -> Result<(), AgentError> {
        self.log =
            SessionLog::create(&self.log_dir, &self.model_id, &self.instr_key)?;
        self.conversation =
            Conversation::new(self.conversation.instruction().content.clone());
        info!("conversation reset");
        Ok(())
    }

    /// Replaces the conversation with the turns of a save file and keeps
    /// writing to that file.
    pub fn restore(
        &mut self,
        save: SaveFile,
        path: &Path,
    ) -> Result<(), AgentError> {
        self.log = SessionLog::attach(
            &self.log_dir,
            path,
            &save,
            &self.model_id,
            &self.instr_key,
        )?;
        self.conversation = Conversation::with_turns(
            self.conversation.instruction().content.clone(),
            save.into_turns(),
        );
        info!(
            "restored {} turn(s) from {}",
            self.conversation.turns().len(),
            path.display()
        );
        Ok(())
    }

    /// Copies the save file to `path` and keeps writing there.
    #[inline]
    pub fn save_as(&mut self, path: &Path) -> Result<(), AgentError> {
        Ok(self.log.save_as(path)?)
    }

    /// Deletes the transcript.
    #[inline]
    pub fn clean_log(&mut self) -> Result<(), AgentError> {
        Ok(self.log.clean()?)
    }

    async fn dispatch(
        &mut self,
        on_fragment: impl FnMut(StreamFragment) + Send + 'static,
    ) -> Result<&str, AgentError> {
        let req = self.conversation.to_request(self.context_len);
        debug!(
            "sending {} message(s) to {}",
            req.messages.len(),
            self.model_id
        );
        let resp = self
            .model_client
            .send_request(req, on_fragment)
            .await
            .map_err(AgentError::provider)?;

        match resp.finish_reason {
            Some(ModelFinishReason::Stop) => {}
            Some(reason) => warn!("reply finished early: {reason:?}"),
            None => warn!("stream ended without a finish reason"),
        }
        self.log.write_dialog(Role::Assistant, &resp.content)?;
        self.conversation.add_dialog(Role::Assistant, resp.content)?;
        Ok(self.last_answer())
    }
}

impl Agent {
    /// Returns the model, instruction and context settings.
    pub fn info(&self) -> AgentInfo {
        AgentInfo {
            provider: self.provider_name.clone(),
            model_id: self.model_id.clone(),
            instr_key: self.instr_key.clone(),
            context_len: self.context_len,
        }
    }

    /// Returns how many exchanges are in and out of the context.
    pub fn context_usage(&self) -> ContextUsage {
        ContextUsage::new(self.dialog_count(), self.context_len)
    }

    /// Returns the number of exchanges, counting a pending question.
    #[inline]
    pub fn dialog_count(&self) -> usize {
        self.conversation.dialog_count()
    }

    /// Returns the newest answer, or an empty string if there is none.
    #[inline]
    pub fn last_answer(&self) -> &str {
        self.conversation.last_answer().unwrap_or_default()
    }

    /// Returns the newest complete exchange.
    #[inline]
    pub fn last_exchange(&self) -> Option<(&Turn, &Turn)> {
        self.conversation.last_exchange()
    }

    /// Returns the conversation.
    #[inline]
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Returns the path of the transcript.
    #[inline]
    pub fn log_path(&self) -> &Path {
        self.log.transcript().path()
    }

    /// Returns the path of the save file currently written to.
    #[inline]
    pub fn save_path(&self) -> &Path {
        self.log.save_state().path()
    }
}
