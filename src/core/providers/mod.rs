//! Provider configurations and the adapters that talk to each API.

mod anthropic;
mod error;
mod google;
mod http;
pub mod models;
mod openai;
mod registry;
pub mod sse;

use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, Stream};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::{ChatRequest, ChatResponse, Sampling};
use crate::core::builtin_providers::find_builtin_provider;
use crate::core::error::{Error, Result};
use crate::core::message::ProviderMeta;
use crate::core::prompt_format::InstructionFormat;

pub use anthropic::AnthropicAdapter;
pub use error::{parse_retry_after, rejects_streaming, ProviderError};
pub use google::GoogleAdapter;
pub use openai::OpenAiAdapter;
pub use registry::ProviderRegistry;

/// API family a provider config speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Google,
    DeepSeek,
    Groq,
    Custom,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 6] = [
        ProviderKind::OpenAi,
        ProviderKind::Anthropic,
        ProviderKind::Google,
        ProviderKind::DeepSeek,
        ProviderKind::Groq,
        ProviderKind::Custom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Google => "google",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::Groq => "groq",
            ProviderKind::Custom => "custom",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        ProviderKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "unknown provider kind '{value}' (expected one of: openai, anthropic, google, deepseek, groq, custom)"
                ))
            })
    }
}

/// Where an API key comes from. Keys are looked up only when a request is
/// about to be sent and never appear in debug output.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Credential {
    /// No key, for local servers that do not authenticate.
    #[default]
    None,
    /// Name of an environment variable holding the key.
    Env(String),
    /// The key itself.
    Value(String),
}

impl Credential {
    pub(crate) fn resolve(&self) -> Result<Option<String>, ProviderError> {
        match self {
            Credential::None => Ok(None),
            Credential::Env(var) => std::env::var(var).map(Some).map_err(|_| {
                ProviderError::Auth(format!("environment variable {var} is not set"))
            }),
            Credential::Value(value) => Ok(Some(value.clone())),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::None => f.write_str("None"),
            Credential::Env(var) => f.debug_tuple("Env").field(var).finish(),
            Credential::Value(_) => f.write_str("Value(<redacted>)"),
        }
    }
}

fn default_true() -> bool {
    true
}

/// One configured provider endpoint and model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Context window in tokens. Defaults to the known size of `model`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_size: Option<usize>,
    #[serde(default = "default_true")]
    pub supports_streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub credential: Credential,
    #[serde(default)]
    pub sampling: Sampling,
    #[serde(default)]
    pub instruction_format: InstructionFormat,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ProviderConfig {
    pub fn new(id: impl Into<String>, kind: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            model: model.into(),
            base_url: None,
            context_size: None,
            supports_streaming: true,
            timeout_secs: None,
            credential: Credential::None,
            sampling: Sampling::default(),
            instruction_format: InstructionFormat::Default,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = credential;
        self
    }

    pub fn with_context_size(mut self, context_size: usize) -> Self {
        self.context_size = Some(context_size);
        self
    }

    /// Configured endpoint, or the built-in one for this kind.
    pub fn endpoint(&self) -> Option<String> {
        self.base_url
            .clone()
            .or_else(|| find_builtin_provider(self.kind).and_then(|p| p.base_url.clone()))
    }

    pub fn context_size(&self) -> usize {
        self.context_size
            .unwrap_or_else(|| models::default_context_size(&self.model))
    }

    /// Tokens left for history once the response reservation is taken out.
    pub fn context_budget(&self) -> usize {
        self.context_size()
            .saturating_sub(self.sampling.max_tokens as usize)
    }

    pub fn timeout(&self) -> Duration {
        let secs = self
            .timeout_secs
            .or_else(|| find_builtin_provider(self.kind).map(|p| p.timeout_secs))
            .unwrap_or(30);
        Duration::from_secs(secs)
    }

    pub fn meta(&self) -> ProviderMeta {
        ProviderMeta::new(self.id.clone(), self.model.clone())
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(Error::InvalidConfig(format!("{}: {reason}", self.id)));

        if self.id.trim().is_empty() {
            return Err(Error::InvalidConfig("provider id must not be empty".into()));
        }
        if self.model.trim().is_empty() {
            return invalid("model must not be empty".into());
        }
        match self.endpoint() {
            None => return invalid(format!("{} providers need a base_url", self.kind)),
            Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
                return invalid(format!("base_url '{url}' must be an http(s) URL"));
            }
            Some(_) => {}
        }
        if self.context_size == Some(0) {
            return invalid("context_size must be positive".into());
        }
        if self.timeout_secs == Some(0) {
            return invalid("timeout_secs must be positive".into());
        }

        let sampling = &self.sampling;
        if sampling.max_tokens == 0 {
            return invalid("max_tokens must be positive".into());
        }
        if sampling.max_tokens as usize >= self.context_size() {
            return invalid(format!(
                "max_tokens ({}) must be less than the context size ({})",
                sampling.max_tokens,
                self.context_size()
            ));
        }
        if !(0.0..=2.0).contains(&sampling.temperature) {
            return invalid(format!("temperature {} is outside 0..=2", sampling.temperature));
        }
        if !(0.0..=1.0).contains(&sampling.top_p) {
            return invalid(format!("top_p {} is outside 0..=1", sampling.top_p));
        }
        Ok(())
    }
}

/// A piece of generated text. `terminal` marks the last increment of a
/// response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Increment {
    pub delta: String,
    pub terminal: bool,
}

impl Increment {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta: text.into(),
            terminal: false,
        }
    }

    pub fn terminal(text: impl Into<String>) -> Self {
        Self {
            delta: text.into(),
            terminal: true,
        }
    }
}

pub type IncrementStream = Pin<Box<dyn Stream<Item = Result<Increment, ProviderError>> + Send>>;

/// A whole response delivered as one terminal increment.
pub fn single_increment(text: String) -> IncrementStream {
    Box::pin(stream::once(async move { Ok(Increment::terminal(text)) }))
}

/// Translates normalized requests to one provider API and its replies back
/// into increments.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn config(&self) -> &ProviderConfig;

    /// Request a complete response in one round trip.
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Open a streamed response. `Ok(None)` means the provider refused to
    /// stream this request and a full response should be requested instead.
    async fn open_stream(
        &self,
        _request: &ChatRequest,
    ) -> Result<Option<IncrementStream>, ProviderError> {
        Ok(None)
    }

    /// Stream when the config allows it and the provider agrees, otherwise
    /// deliver the complete response as a single increment.
    async fn send(&self, request: &ChatRequest) -> Result<IncrementStream, ProviderError> {
        if self.config().supports_streaming {
            if let Some(stream) = self.open_stream(request).await? {
                return Ok(stream);
            }
            debug!(
                provider = %self.config().id,
                "provider declined streaming, requesting a full response"
            );
        }
        let response = self.complete(request).await?;
        Ok(single_increment(response.content))
    }
}

/// Build the adapter matching `config.kind`.
pub fn adapter_for(
    config: ProviderConfig,
    client: reqwest::Client,
) -> Result<Arc<dyn ProviderAdapter>> {
    config.validate()?;
    let adapter: Arc<dyn ProviderAdapter> = match config.kind {
        ProviderKind::OpenAi
        | ProviderKind::DeepSeek
        | ProviderKind::Groq
        | ProviderKind::Custom => Arc::new(OpenAiAdapter::new(config, client)?),
        ProviderKind::Anthropic => Arc::new(AnthropicAdapter::new(config, client)?),
        ProviderKind::Google => Arc::new(GoogleAdapter::new(config, client)?),
    };
    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_parse_case_insensitively() {
        assert_eq!("OpenAI".parse::<ProviderKind>().ok(), Some(ProviderKind::OpenAi));
        assert_eq!("deepseek".parse::<ProviderKind>().ok(), Some(ProviderKind::DeepSeek));
        assert!("mistral".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn config_reads_from_toml_with_defaults() {
        let config: ProviderConfig = toml::from_str(
            r#"
id = "work"
kind = "anthropic"
model = "claude-3-5-sonnet-20241022"
credential = { env = "ANTHROPIC_API_KEY" }

[sampling]
max_tokens = 512
"#,
        )
        .expect("config parses");

        assert_eq!(config.kind, ProviderKind::Anthropic);
        assert_eq!(config.credential, Credential::Env("ANTHROPIC_API_KEY".into()));
        assert!(config.supports_streaming);
        assert_eq!(config.sampling.max_tokens, 512);
        assert_eq!(config.sampling.temperature, 0.7);
        assert_eq!(config.context_size(), 200_000);
        assert_eq!(config.context_budget(), 200_000 - 512);
        assert_eq!(config.timeout(), Duration::from_secs(60));
        assert_eq!(
            config.endpoint().as_deref(),
            Some("https://api.anthropic.com/v1")
        );
        config.validate().expect("valid");
    }

    #[test]
    fn credential_debug_is_redacted() {
        let secret = Credential::Value("sk-very-secret".into());
        assert_eq!(format!("{secret:?}"), "Value(<redacted>)");
        let config = ProviderConfig::new("p", ProviderKind::OpenAi, "gpt-4o").with_credential(secret);
        assert!(!format!("{config:?}").contains("sk-very-secret"));
    }

    #[test]
    fn missing_env_credential_is_an_auth_failure() {
        let credential = Credential::Env("PARLEY_TEST_SURELY_UNSET_KEY".into());
        assert!(matches!(credential.resolve(), Err(ProviderError::Auth(_))));
        assert_eq!(Credential::None.resolve(), Ok(None));
    }

    #[test]
    fn validation_rejects_bad_configs() {
        let custom = ProviderConfig::new("local", ProviderKind::Custom, "llama");
        assert!(matches!(custom.validate(), Err(Error::InvalidConfig(_))));
        let custom = custom.with_base_url("http://localhost:8080/v1");
        custom.validate().expect("custom with url is valid");

        let mut greedy = ProviderConfig::new("g", ProviderKind::OpenAi, "gpt-4").with_context_size(100);
        greedy.sampling.max_tokens = 100;
        assert!(matches!(greedy.validate(), Err(Error::InvalidConfig(_))));

        let mut hot = ProviderConfig::new("h", ProviderKind::OpenAi, "gpt-4");
        hot.sampling.temperature = 3.0;
        assert!(hot.validate().is_err());

        let bad_url = ProviderConfig::new("u", ProviderKind::OpenAi, "gpt-4").with_base_url("ftp://x");
        assert!(bad_url.validate().is_err());

        assert!(ProviderConfig::new(" ", ProviderKind::OpenAi, "gpt-4")
            .validate()
            .is_err());
    }

    #[test]
    fn adapter_matches_kind() {
        let client = reqwest::Client::new();
        for kind in [ProviderKind::OpenAi, ProviderKind::Anthropic, ProviderKind::Google] {
            let adapter = adapter_for(ProviderConfig::new("p", kind, "model"), client.clone())
                .expect("adapter");
            assert_eq!(adapter.config().kind, kind);
        }
        let missing_url = adapter_for(ProviderConfig::new("c", ProviderKind::Custom, "m"), client);
        assert!(missing_url.is_err());
    }
}
