//! Provider-specific authentication headers.

use crate::api::anthropic::API_VERSION;
use crate::core::providers::ProviderKind;

/// Attach the API key the way `kind` expects it:
/// - Anthropic: `x-api-key` plus `anthropic-version`
/// - Google: `x-goog-api-key`
/// - everything else: `Authorization: Bearer`
///
/// Without a key only the non-secret headers are added.
pub fn add_auth_headers(
    request: reqwest::RequestBuilder,
    kind: ProviderKind,
    api_key: Option<&str>,
) -> reqwest::RequestBuilder {
    match (kind, api_key) {
        (ProviderKind::Anthropic, key) => {
            let request = request.header("anthropic-version", API_VERSION);
            match key {
                Some(key) => request.header("x-api-key", key),
                None => request,
            }
        }
        (ProviderKind::Google, Some(key)) => request.header("x-goog-api-key", key),
        (_, Some(key)) => request.bearer_auth(key),
        (_, None) => request,
    }
}
