use async_trait::async_trait;
use tracing::debug;

use super::http::{error_payload, execute, parse_json, read_json, Reply};
use super::sse::{sse_increments, SseEvent};
use super::{IncrementStream, ProviderAdapter, ProviderConfig, ProviderError};
use crate::api::anthropic::{MessagesRequest, MessagesResponse, StreamEvent};
use crate::api::{ChatRequest, ChatResponse};
use crate::core::error::{Error, Result};
use crate::utils::auth::add_auth_headers;
use crate::utils::url::construct_api_url;

/// Adapter for the Anthropic messages API. The persona travels in the
/// top-level `system` field.
pub struct AnthropicAdapter {
    config: ProviderConfig,
    client: reqwest::Client,
    url: String,
}

impl AnthropicAdapter {
    pub fn new(config: ProviderConfig, client: reqwest::Client) -> Result<Self> {
        let base_url = config.endpoint().ok_or_else(|| {
            Error::InvalidConfig(format!("{}: no base_url configured", config.id))
        })?;
        Ok(Self {
            url: construct_api_url(&base_url, "messages"),
            config,
            client,
        })
    }

    fn request(
        &self,
        body: &MessagesRequest<'_>,
    ) -> Result<reqwest::RequestBuilder, ProviderError> {
        let key = self.config.credential.resolve()?;
        let request = self.client.post(&self.url).json(body);
        Ok(add_auth_headers(request, self.config.kind, key.as_deref()))
    }
}

fn parse_event(payload: &str) -> Result<SseEvent, ProviderError> {
    if let Some(error) = error_payload(payload) {
        return Err(error);
    }
    let event: StreamEvent = parse_json(payload)?;
    Ok(match event.kind.as_str() {
        "content_block_delta" => SseEvent::Delta(
            event
                .delta
                .and_then(|delta| delta.text)
                .unwrap_or_default(),
        ),
        "message_stop" => SseEvent::Done,
        _ => SseEvent::Ignore,
    })
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        debug!(provider = %self.config.id, model = %request.model, "requesting full message");
        let body = MessagesRequest::new(request, false);
        let timeout = self.config.timeout();
        match execute(self.request(&body)?, timeout).await? {
            Reply::Success(response) => {
                let response: MessagesResponse = read_json(response, timeout).await?;
                Ok(response.into_response())
            }
            Reply::Failure(failure) => Err(failure.into_error()),
        }
    }

    async fn open_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<Option<IncrementStream>, ProviderError> {
        debug!(provider = %self.config.id, model = %request.model, "opening message stream");
        let body = MessagesRequest::new(request, true);
        let timeout = self.config.timeout();
        match execute(self.request(&body)?, timeout).await? {
            Reply::Success(response) => Ok(Some(sse_increments(
                response.bytes_stream(),
                timeout,
                parse_event,
            ))),
            Reply::Failure(failure) if failure.rejects_streaming() => Ok(None),
            Reply::Failure(failure) => Err(failure.into_error()),
        }
    }
}
