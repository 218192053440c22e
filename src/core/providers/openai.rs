use async_trait::async_trait;
use tracing::debug;

use super::http::{error_payload, execute, parse_json, read_json, Reply};
use super::sse::{sse_increments, SseEvent};
use super::{IncrementStream, ProviderAdapter, ProviderConfig, ProviderError};
use crate::api::openai::{CompletionChunk, CompletionRequest, CompletionResponse};
use crate::api::{ChatRequest, ChatResponse};
use crate::core::error::{Error, Result};
use crate::utils::auth::add_auth_headers;
use crate::utils::url::construct_api_url;

/// Chat-completions adapter for OpenAI and the APIs that mirror it.
pub struct OpenAiAdapter {
    config: ProviderConfig,
    client: reqwest::Client,
    url: String,
}

impl OpenAiAdapter {
    pub fn new(config: ProviderConfig, client: reqwest::Client) -> Result<Self> {
        let base_url = config.endpoint().ok_or_else(|| {
            Error::InvalidConfig(format!("{}: no base_url configured", config.id))
        })?;
        Ok(Self {
            url: construct_api_url(&base_url, "chat/completions"),
            config,
            client,
        })
    }

    fn request(
        &self,
        body: &CompletionRequest<'_>,
    ) -> Result<reqwest::RequestBuilder, ProviderError> {
        let key = self.config.credential.resolve()?;
        let request = self.client.post(&self.url).json(body);
        Ok(add_auth_headers(request, self.config.kind, key.as_deref()))
    }
}

fn parse_chunk(payload: &str) -> Result<SseEvent, ProviderError> {
    if payload == "[DONE]" {
        return Ok(SseEvent::Done);
    }
    if let Some(error) = error_payload(payload) {
        return Err(error);
    }
    let chunk: CompletionChunk = parse_json(payload)?;
    Ok(SseEvent::Delta(chunk.text().to_string()))
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        debug!(provider = %self.config.id, model = %request.model, "requesting full completion");
        let body = CompletionRequest::new(request, false);
        let timeout = self.config.timeout();
        match execute(self.request(&body)?, timeout).await? {
            Reply::Success(response) => {
                let response: CompletionResponse = read_json(response, timeout).await?;
                response
                    .into_response()
                    .ok_or_else(|| ProviderError::Malformed("response had no choices".into()))
            }
            Reply::Failure(failure) => Err(failure.into_error()),
        }
    }

    async fn open_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<Option<IncrementStream>, ProviderError> {
        debug!(provider = %self.config.id, model = %request.model, "opening completion stream");
        let body = CompletionRequest::new(request, true);
        let timeout = self.config.timeout();
        match execute(self.request(&body)?, timeout).await? {
            Reply::Success(response) => Ok(Some(sse_increments(
                response.bytes_stream(),
                timeout,
                parse_chunk,
            ))),
            Reply::Failure(failure) if failure.rejects_streaming() => {
                debug!(status = %failure.status, "streaming rejected");
                Ok(None)
            }
            Reply::Failure(failure) => Err(failure.into_error()),
        }
    }
}
