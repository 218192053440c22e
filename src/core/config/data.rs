use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::character::Character;
use crate::core::error::{Error, Result};
use crate::core::providers::{ProviderConfig, ProviderRegistry};
use crate::core::retry::RetryPolicy;

fn default_user_name() -> String {
    "User".to_string()
}

/// Persisted settings: provider configs, characters, and retry overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub default_provider: Option<String>,
    /// Substituted for `{{user}}` in personas and greetings.
    #[serde(default = "default_user_name")]
    pub user_name: String,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub characters: Vec<Character>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_provider: None,
            user_name: default_user_name(),
            retry: RetryPolicy::default(),
            providers: Vec::new(),
            characters: Vec::new(),
        }
    }
}

/// Get a user-friendly display string for a path, using `~` for the home
/// directory on Unix-like systems.
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}

impl Config {
    /// Add a provider config, rejecting invalid configs and duplicate ids.
    pub fn add_provider(&mut self, provider: ProviderConfig) -> Result<()> {
        provider.validate()?;
        if self.get_provider(&provider.id).is_some() {
            return Err(Error::InvalidConfig(format!(
                "provider '{}' already exists",
                provider.id
            )));
        }
        self.providers.push(provider);
        Ok(())
    }

    /// Remove a provider config. The default is cleared when it pointed at
    /// the removed config.
    pub fn remove_provider(&mut self, id: &str) -> Option<ProviderConfig> {
        let index = self
            .providers
            .iter()
            .position(|p| p.id.eq_ignore_ascii_case(id))?;
        let removed = self.providers.remove(index);
        if self
            .default_provider
            .as_deref()
            .is_some_and(|default| default.eq_ignore_ascii_case(&removed.id))
        {
            self.default_provider = None;
        }
        Some(removed)
    }

    pub fn get_provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id.eq_ignore_ascii_case(id))
    }

    pub fn set_default_provider(&mut self, id: &str) -> Result<()> {
        let provider = self
            .get_provider(id)
            .ok_or_else(|| Error::NotFound(format!("provider '{id}'")))?;
        self.default_provider = Some(provider.id.clone());
        Ok(())
    }

    /// Add or replace a character by id.
    pub fn upsert_character(&mut self, character: Character) {
        match self.characters.iter_mut().find(|c| c.id == character.id) {
            Some(existing) => *existing = character,
            None => self.characters.push(character),
        }
    }

    pub fn get_character(&self, id: &str) -> Option<&Character> {
        self.characters.iter().find(|c| c.id.eq_ignore_ascii_case(id))
    }

    /// Registry holding every configured provider, with the configured
    /// default applied.
    pub fn build_registry(&self, client: reqwest::Client) -> Result<ProviderRegistry> {
        ProviderRegistry::from_configs(
            client,
            self.providers.iter().cloned(),
            self.default_provider.as_deref(),
        )
    }
}

/// Generate a suggested id from a display name: lowercase, alphanumerics and
/// dashes only.
pub fn suggest_provider_id(display_name: &str) -> String {
    display_name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-')
        .collect()
}
