//! Conversation-related types.

use std::fmt::{self, Display};
use std::str::FromStr;

use apai_model::{ModelMessage, ModelRequest};
use chrono::{DateTime, Local};

/// The author of a [`Turn`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// The fixed instruction at the head of every request.
    System,
    /// The person typing at the prompt.
    User,
    /// The model.
    Assistant,
}

impl Role {
    /// Returns the lowercase name used in files and on the wire.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown role name.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown role `{0}`")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => Err(UnknownRole(s.to_owned())),
        }
    }
}

/// Error returned when a dialog is added with the system role, which is
/// reserved for the instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("the system role is reserved for the instruction")]
pub struct InvalidRole;

/// One message in the conversation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Turn {
    /// Who wrote it.
    pub role: Role,
    /// The message text.
    pub content: String,
    /// When it was written. Turns restored from a save file have no
    /// timestamp, since the save format doesn't record one.
    pub timestamp: Option<DateTime<Local>>,
}

impl Turn {
    /// Creates a turn stamped with the current local time.
    #[inline]
    pub fn new<S: Into<String>>(role: Role, content: S) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Some(Local::now()),
        }
    }

    /// Creates a turn without a timestamp.
    #[inline]
    pub fn restored<S: Into<String>>(role: Role, content: S) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: None,
        }
    }

    fn to_model_message(&self) -> ModelMessage {
        let content = self.content.clone();
        match self.role {
            Role::System => ModelMessage::System(content),
            Role::User => ModelMessage::User(content),
            Role::Assistant => ModelMessage::Assistant(content),
        }
    }
}

/// The in-memory dialog list plus the fixed instruction.
///
/// Turns are kept in chronological order and alternate between user and
/// assistant. The only exception is a trailing user turn without a reply,
/// which is called *pending*: it is left behind by a failed request, or by
/// a save file written before the reply arrived.
#[derive(Clone, Debug)]
pub struct Conversation {
    instruction: Turn,
    turns: Vec<Turn>,
}

impl Conversation {
    /// Creates an empty conversation with the given instruction.
    pub fn new<S: Into<String>>(instruction: S) -> Self {
        Self {
            instruction: Turn::new(Role::System, instruction),
            turns: Vec::new(),
        }
    }

    /// Creates a conversation from previously saved turns.
    pub fn with_turns<S: Into<String>>(instruction: S, turns: Vec<Turn>) -> Self {
        Self {
            instruction: Turn::new(Role::System, instruction),
            turns,
        }
    }

    /// Appends a turn.
    pub fn add_dialog<S: Into<String>>(
        &mut self,
        role: Role,
        content: S,
    ) -> Result<(), InvalidRole> {
        if role == Role::System {
            return Err(InvalidRole);
        }
        self.turns.push(Turn::new(role, content));
        Ok(())
    }

    /// Removes and returns the newest turn.
    #[inline]
    pub fn pop(&mut self) -> Option<Turn> {
        self.turns.pop()
    }

    /// Returns the instruction turn.
    #[inline]
    pub fn instruction(&self) -> &Turn {
        &self.instruction
    }

    /// Returns all turns except the instruction, oldest first.
    #[inline]
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Returns the newest turn.
    #[inline]
    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Returns the number of exchanges, counting a pending user turn as one.
    pub fn dialog_count(&self) -> usize {
        self.turns.iter().filter(|t| t.role == Role::User).count()
    }

    /// Returns `true` if the newest turn is a user turn without a reply.
    #[inline]
    pub fn has_pending(&self) -> bool {
        self.last().is_some_and(|t| t.role == Role::User)
    }

    /// Returns the content of the newest assistant turn.
    pub fn last_answer(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::Assistant)
            .map(|t| t.content.as_str())
    }

    /// Returns the newest complete exchange as `(user, assistant)`.
    pub fn last_exchange(&self) -> Option<(&Turn, &Turn)> {
        match self.turns.as_slice() {
            [.., user, assistant]
                if user.role == Role::User && assistant.role == Role::Assistant =>
            {
                Some((user, assistant))
            }
            _ => None,
        }
    }

    /// Returns the turns sent to the model: the instruction followed by the
    /// newest `context_len` exchanges.
    ///
    /// Context length counts exchanges, so up to `2 * context_len` turns are
    /// taken. The slice never begins with an assistant turn, which keeps
    /// every exchange whole. A pending user turn counts as the newest
    /// exchange.
    pub fn generate_messages(&self, context_len: usize) -> Vec<&Turn> {
        let len = self.turns.len();
        let mut start = len - context_len.saturating_mul(2).min(len);
        if self
            .turns
            .get(start)
            .is_some_and(|t| t.role == Role::Assistant)
        {
            start += 1;
        }

        let mut messages = Vec::with_capacity(len - start + 1);
        messages.push(&self.instruction);
        messages.extend(&self.turns[start..]);
        messages
    }

    /// Builds a model request from [`Self::generate_messages`].
    pub fn to_request(&self, context_len: usize) -> ModelRequest {
        ModelRequest {
            messages: self
                .generate_messages(context_len)
                .into_iter()
                .map(Turn::to_model_message)
                .collect(),
        }
    }
}
