use async_trait::async_trait;
use tracing::debug;

use super::http::{error_payload, execute, parse_json, read_json, Reply};
use super::sse::{sse_increments, SseEvent};
use super::{IncrementStream, ProviderAdapter, ProviderConfig, ProviderError};
use crate::api::google::{GenerateContentRequest, GenerateContentResponse};
use crate::api::{ChatRequest, ChatResponse};
use crate::core::error::{Error, Result};
use crate::utils::auth::add_auth_headers;
use crate::utils::url::{construct_api_url, strip_model_prefix};

/// Adapter for the Gemini `generateContent` API.
pub struct GoogleAdapter {
    config: ProviderConfig,
    client: reqwest::Client,
    base_url: String,
}

impl GoogleAdapter {
    pub fn new(config: ProviderConfig, client: reqwest::Client) -> Result<Self> {
        let base_url = config.endpoint().ok_or_else(|| {
            Error::InvalidConfig(format!("{}: no base_url configured", config.id))
        })?;
        Ok(Self {
            base_url,
            config,
            client,
        })
    }

    fn url(&self, model: &str, streaming: bool) -> String {
        let model = strip_model_prefix(model);
        let endpoint = if streaming {
            format!("v1beta/models/{model}:streamGenerateContent?alt=sse")
        } else {
            format!("v1beta/models/{model}:generateContent")
        };
        construct_api_url(&self.base_url, &endpoint)
    }

    fn request(
        &self,
        model: &str,
        streaming: bool,
        body: &GenerateContentRequest,
    ) -> Result<reqwest::RequestBuilder, ProviderError> {
        let key = self.config.credential.resolve()?;
        let request = self.client.post(self.url(model, streaming)).json(body);
        Ok(add_auth_headers(request, self.config.kind, key.as_deref()))
    }
}

fn parse_event(payload: &str) -> Result<SseEvent, ProviderError> {
    if let Some(error) = error_payload(payload) {
        return Err(error);
    }
    let event: GenerateContentResponse = parse_json(payload)?;
    Ok(SseEvent::Delta(event.text()))
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        debug!(provider = %self.config.id, model = %request.model, "requesting full content");
        let body = GenerateContentRequest::new(request);
        let timeout = self.config.timeout();
        match execute(self.request(&request.model, false, &body)?, timeout).await? {
            Reply::Success(response) => {
                let response: GenerateContentResponse = read_json(response, timeout).await?;
                Ok(response.into_response())
            }
            Reply::Failure(failure) => Err(failure.into_error()),
        }
    }

    async fn open_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<Option<IncrementStream>, ProviderError> {
        debug!(provider = %self.config.id, model = %request.model, "opening content stream");
        let body = GenerateContentRequest::new(request);
        let timeout = self.config.timeout();
        match execute(self.request(&request.model, true, &body)?, timeout).await? {
            // Gemini has no completion marker; the stream ends with the body.
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
