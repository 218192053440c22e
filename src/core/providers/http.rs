//! Request execution shared by the HTTP adapters.

use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::error::{parse_retry_after, rejects_streaming};
use super::ProviderError;

/// Outcome of a request that reached the provider.
pub(crate) enum Reply {
    Success(reqwest::Response),
    Failure(HttpFailure),
}

#[derive(Debug)]
pub(crate) struct HttpFailure {
    pub status: StatusCode,
    pub retry_after: Option<Duration>,
    pub body: String,
}

impl HttpFailure {
    pub fn rejects_streaming(&self) -> bool {
        rejects_streaming(self.status, &self.body)
    }

    pub fn into_error(self) -> ProviderError {
        ProviderError::from_status(self.status, self.retry_after, &self.body)
    }
}

/// Send `request`, waiting at most `timeout` for the response head. Error
/// bodies are read in full so they can be classified.
pub(crate) async fn execute(
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<Reply, ProviderError> {
    let response = tokio::time::timeout(timeout, request.send())
        .await
        .map_err(|_| ProviderError::timed_out(timeout))?
        .map_err(|err| ProviderError::from_transport(&err))?;

    let status = response.status();
    if status.is_success() {
        return Ok(Reply::Success(response));
    }

    let retry_after = parse_retry_after(response.headers());
    let body = match tokio::time::timeout(timeout, response.text()).await {
        Ok(Ok(body)) => body,
        Ok(Err(err)) => {
            debug!(error = %err, "failed to read error body");
            String::new()
        }
        Err(_) => String::new(),
    };
    debug!(%status, "provider returned an error status");
    Ok(Reply::Failure(HttpFailure {
        status,
        retry_after,
        body,
    }))
}

/// Read and decode a complete JSON body.
pub(crate) async fn read_json<T: DeserializeOwned>(
    response: reqwest::Response,
    timeout: Duration,
) -> Result<T, ProviderError> {
    let body = tokio::time::timeout(timeout, response.text())
        .await
        .map_err(|_| ProviderError::timed_out(timeout))?
        .map_err(|err| ProviderError::from_transport(&err))?;
    parse_json(&body)
}

pub(crate) fn parse_json<T: DeserializeOwned>(payload: &str) -> Result<T, ProviderError> {
    serde_json::from_str(payload).map_err(|err| {
        let preview: String = payload.chars().take(120).collect();
        ProviderError::Malformed(format!("{err} in {preview:?}"))
    })
}

/// Payloads that are JSON error objects rather than content.
pub(crate) fn error_payload(payload: &str) -> Option<ProviderError> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    let is_error = value.get("error").is_some()
        || value.get("type").and_then(|kind| kind.as_str()) == Some("error");
    is_error.then(|| ProviderError::from_payload(&value))
}
