//! Per-kind provider defaults embedded at build time from
//! `builtin_providers.toml`.

use std::sync::OnceLock;

use serde::Deserialize;

use crate::core::providers::ProviderKind;

#[derive(Debug, Clone, Deserialize)]
pub struct BuiltinProvider {
    pub kind: ProviderKind,
    pub display_name: String,
    /// Absent for kinds that always need an explicit endpoint.
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct BuiltinProvidersConfig {
    providers: Vec<BuiltinProvider>,
}

/// All embedded provider defaults.
pub fn load_builtin_providers() -> &'static [BuiltinProvider] {
    static PROVIDERS: OnceLock<Vec<BuiltinProvider>> = OnceLock::new();
    PROVIDERS.get_or_init(|| {
        const CONFIG_CONTENT: &str = include_str!("../builtin_providers.toml");
        let config: BuiltinProvidersConfig =
            toml::from_str(CONFIG_CONTENT).expect("Failed to parse builtin_providers.toml");
        config.providers
    })
}

pub fn find_builtin_provider(kind: ProviderKind) -> Option<&'static BuiltinProvider> {
    load_builtin_providers()
        .iter()
        .find(|provider| provider.kind == kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_defaults() {
        for kind in ProviderKind::ALL {
            let provider = find_builtin_provider(kind).expect("builtin entry");
            assert!(!provider.display_name.is_empty());
            assert!(provider.timeout_secs > 0);
        }
    }

    #[test]
    fn only_custom_lacks_an_endpoint() {
        for provider in load_builtin_providers() {
            match provider.kind {
                ProviderKind::Custom => assert!(provider.base_url.is_none()),
                _ => {
                    let url = provider.base_url.as_deref().expect("base url");
                    assert!(url.starts_with("https://"), "{url}");
                }
            }
        }
    }

    #[test]
    fn anthropic_and_google_allow_longer_requests() {
        let anthropic = find_builtin_provider(ProviderKind::Anthropic).expect("anthropic");
        let openai = find_builtin_provider(ProviderKind::OpenAi).expect("openai");
        assert_eq!(anthropic.timeout_secs, 60);
        assert_eq!(openai.timeout_secs, 30);
        assert_eq!(openai.base_url.as_deref(), Some("https://api.openai.com/v1"));
    }
}
