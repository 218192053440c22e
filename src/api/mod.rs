//! Request and response payloads.
//!
//! The types at this level are provider-neutral; each submodule holds the wire
//! shapes of one API dialect and the conversions into and out of them.

pub mod anthropic;
pub mod google;
pub mod openai;

use serde::{Deserialize, Serialize};

use crate::core::message::Role;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Generation knobs sent with every request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sampling {
    /// Tokens reserved for the response.
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            max_tokens: 150,
            temperature: 0.7,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }
}

/// Provider-neutral chat request. `messages` is already budgeted and
/// formatted; adapters only translate it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub sampling: Sampling,
    /// Provider-specific fields merged into the request body verbatim.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ChatRequest {
    /// Concatenated system messages, for dialects that carry the persona
    /// outside the message list.
    pub fn system_prompt(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .messages
            .iter()
            .filter(|message| message.role.is_system())
            .map(|message| message.content.as_str())
            .filter(|content| !content.is_empty())
            .collect();
        (!parts.is_empty()).then(|| parts.join("\n\n"))
    }

    /// Non-system turns with consecutive same-role turns merged and leading
    /// assistant turns dropped, as required by APIs that insist on strictly
    /// alternating user-first conversations.
    pub fn alternating_turns(&self) -> Vec<ChatMessage> {
        let mut turns: Vec<ChatMessage> = Vec::new();
        for message in self.messages.iter().filter(|m| !m.role.is_system()) {
            if turns.is_empty() && message.role.is_assistant() {
                continue;
            }
            match turns.last_mut() {
                Some(last) if last.role == message.role => {
                    last.content.push_str("\n\n");
                    last.content.push_str(&message.content);
                }
                _ => turns.push(message.clone()),
            }
        }
        turns
    }
}

/// A complete, non-streamed reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChatResponse {
    pub content: String,
    pub finish_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(messages: Vec<ChatMessage>) -> ChatRequest {
        ChatRequest {
            model: "m".into(),
            messages,
            sampling: Sampling::default(),
            extra: Default::default(),
        }
    }

    #[test]
    fn sampling_defaults() {
        let sampling = Sampling::default();
        assert_eq!(sampling.max_tokens, 150);
        assert_eq!(sampling.temperature, 0.7);
        assert_eq!(sampling.top_p, 1.0);
    }

    #[test]
    fn system_prompt_joins_system_messages() {
        let req = request(vec![
            ChatMessage::new(Role::System, "You are Aria."),
            ChatMessage::new(Role::User, "hi"),
        ]);
        assert_eq!(req.system_prompt().as_deref(), Some("You are Aria."));
        assert_eq!(request(vec![]).system_prompt(), None);
    }

    #[test]
    fn alternating_turns_merge_and_start_with_user() {
        let req = request(vec![
            ChatMessage::new(Role::System, "persona"),
            ChatMessage::new(Role::Assistant, "greeting"),
            ChatMessage::new(Role::User, "a"),
            ChatMessage::new(Role::User, "b"),
            ChatMessage::new(Role::Assistant, "c"),
        ]);
        assert_eq!(
            req.alternating_turns(),
            vec![
                ChatMessage::new(Role::User, "a\n\nb"),
                ChatMessage::new(Role::Assistant, "c"),
            ]
        );
    }
}
