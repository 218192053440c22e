//! Anthropic messages dialect.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{ChatRequest, ChatResponse};

pub const API_VERSION: &str = "2023-06-01";

#[derive(Serialize)]
pub struct WireMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Serialize)]
pub struct MessagesRequest<'a> {
    pub model: &'a str,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<WireMessage>,
    pub stream: bool,
    pub temperature: f64,
    pub top_p: f64,
    #[serde(flatten)]
    pub extra: &'a Map<String, Value>,
}

impl<'a> MessagesRequest<'a> {
    pub fn new(request: &'a ChatRequest, stream: bool) -> Self {
        Self {
            model: &request.model,
            max_tokens: request.sampling.max_tokens,
            system: request.system_prompt(),
            messages: request
                .alternating_turns()
                .into_iter()
                .map(|message| WireMessage {
                    role: message.role.as_str(),
                    content: message.content,
                })
                .collect(),
            stream,
            temperature: request.sampling.temperature,
            top_p: request.sampling.top_p,
            extra: &request.extra,
        }
    }
}

#[derive(Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Deserialize)]
pub struct MessagesResponse {
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

impl MessagesResponse {
    pub fn into_response(self) -> ChatResponse {
        let content = self
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect::<String>();
        ChatResponse {
            content,
            finish_reason: self.stop_reason,
        }
    }
}

#[derive(Deserialize)]
pub struct StreamDelta {
    #[serde(default)]
    pub text: Option<String>,
}

/// One typed server-sent event of a streamed message.
#[derive(Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub delta: Option<StreamDelta>,
}
