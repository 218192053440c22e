//! Gemini `generateContent` dialect.

use serde::{Deserialize, Serialize};

use super::{ChatRequest, ChatResponse};
use crate::core::message::Role;

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct Part {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    fn text(role: Option<&str>, text: String) -> Self {
        Self {
            role: role.map(str::to_string),
            parts: vec![Part { text: Some(text) }],
        }
    }

    fn joined_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| part.text.as_deref())
            .collect()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub max_output_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    pub generation_config: GenerationConfig,
}

impl GenerateContentRequest {
    pub fn new(request: &ChatRequest) -> Self {
        let contents = request
            .alternating_turns()
            .into_iter()
            .map(|message| {
                let role = match message.role {
                    Role::Assistant => "model",
                    _ => "user",
                };
                Content::text(Some(role), message.content)
            })
            .collect();

        Self {
            contents,
            system_instruction: request
                .system_prompt()
                .map(|prompt| Content::text(None, prompt)),
            generation_config: GenerationConfig {
                max_output_tokens: request.sampling.max_tokens,
                temperature: request.sampling.temperature,
                top_p: request.sampling.top_p,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Full reply, and also the shape of every streamed event.
#[derive(Debug, Deserialize)]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

impl GenerateContentResponse {
    pub fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|candidate| candidate.content.as_ref())
            .map(Content::joined_text)
            .unwrap_or_default()
    }

    pub fn into_response(self) -> ChatResponse {
        let content = self.text();
        ChatResponse {
            content,
            finish_reason: self
                .candidates
                .into_iter()
                .next()
                .and_then(|candidate| candidate.finish_reason),
        }
    }
}
