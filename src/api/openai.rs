//! OpenAI chat-completions dialect, shared by DeepSeek, Groq, and
//! self-hosted compatible servers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{ChatRequest, ChatResponse};

#[derive(Serialize)]
pub struct WireMessage<'a> {
    pub role: &'static str,
    pub content: &'a str,
}

#[derive(Serialize)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<WireMessage<'a>>,
    pub stream: bool,
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub frequency_penalty: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub presence_penalty: f64,
    #[serde(flatten)]
    pub extra: &'a Map<String, Value>,
}

fn is_zero(value: &f64) -> bool {
    *value == 0.0
}

impl<'a> CompletionRequest<'a> {
    pub fn new(request: &'a ChatRequest, stream: bool) -> Self {
        Self {
            model: &request.model,
            messages: request
                .messages
                .iter()
                .map(|message| WireMessage {
                    role: message.role.as_str(),
                    content: &message.content,
                })
                .collect(),
            stream,
            max_tokens: request.sampling.max_tokens,
            temperature: request.sampling.temperature,
            top_p: request.sampling.top_p,
            frequency_penalty: request.sampling.frequency_penalty,
            presence_penalty: request.sampling.presence_penalty,
            extra: &request.extra,
        }
    }
}

#[derive(Deserialize)]
pub struct CompletionMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Deserialize)]
pub struct CompletionChoice {
    pub message: CompletionMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Deserialize)]
pub struct CompletionResponse {
    pub choices: Vec<CompletionChoice>,
}

impl CompletionResponse {
    pub fn into_response(self) -> Option<ChatResponse> {
        let choice = self.choices.into_iter().next()?;
        Some(ChatResponse {
            content: choice.message.content.unwrap_or_default(),
            finish_reason: choice.finish_reason,
        })
    }
}

#[derive(Deserialize)]
pub struct ChunkDelta {
    pub content: Option<String>,
}

#[derive(Deserialize)]
pub struct ChunkChoice {
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// One `chat.completion.chunk` event.
#[derive(Deserialize)]
pub struct CompletionChunk {
    pub choices: Vec<ChunkChoice>,
}

impl CompletionChunk {
    pub fn text(&self) -> &str {
        self.choices
            .first()
            .and_then(|choice| choice.delta.content.as_deref())
            .unwrap_or_default()
    }
}
