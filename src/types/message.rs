//! Message types
//!
//! Defines chat roles, messages and the per-request transcript.

use serde::{Deserialize, Serialize};

/// Role of a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt
    System,
    /// Message from the user
    User,
    /// Message from the AI assistant
    Assistant,
}

impl Role {
    /// Lowercase role name as understood by chat templates
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Label used when no chat template is available
    pub fn label(&self) -> &'static str {
        match self {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The role of the message sender
    pub role: Role,
    /// The content of the message
    pub content: String,
}

impl Message {
    /// Create a new message
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Conversation state for exactly one request.
///
/// Built fresh for every generation call from the configured system prompt and
/// the caller's prompt, then dropped when the call ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    system: Option<Message>,
    user: Message,
}

impl Transcript {
    /// Creates a transcript. A blank system prompt is left out entirely.
    pub fn new(system_prompt: &str, prompt: impl Into<String>) -> Self {
        let system = if system_prompt.trim().is_empty() {
            None
        } else {
            Some(Message::new(Role::System, system_prompt))
        };

        Self {
            system,
            user: Message::new(Role::User, prompt),
        }
    }

    /// The system message, if one is configured
    pub fn system(&self) -> Option<&Message> {
        self.system.as_ref()
    }

    /// The pending user message
    pub fn user(&self) -> &Message {
        &self.user
    }

    /// Messages in conversation order
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.system.iter().chain(std::iter::once(&self.user))
    }

    /// Renders the transcript as plain `Role: content` lines followed by an open
    /// assistant turn. Used when the model ships without a chat template.
    pub fn to_plain_prompt(&self) -> String {
        let mut out = String::new();
        for message in self.messages() {
            out.push_str(message.role.label());
            out.push_str(": ");
            out.push_str(&message.content);
            out.push('\n');
        }
        out.push_str(Role::Assistant.label());
        out.push(':');
        out
    }
}
