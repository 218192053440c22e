use std::error::Error;
use std::io::Write;

use crate::cli::ProviderAddArgs;
use crate::core::config::Config;
use crate::core::providers::{Credential, ProviderConfig};

pub fn list_providers(config: &Config, out: &mut impl Write) -> Result<(), Box<dyn Error>> {
    if config.providers.is_empty() {
        writeln!(out, "No providers configured.")?;
        writeln!(out, "\n💡 Add one with:")?;
        writeln!(
            out,
            "   parley providers add <id> --kind openai --model gpt-4o --api-key-env OPENAI_API_KEY"
        )?;
        return Ok(());
    }

    // The first provider is the default until one is chosen explicitly.
    let default_id = config
        .default_provider
        .as_deref()
        .or_else(|| config.providers.first().map(|p| p.id.as_str()));

    writeln!(out, "Configured providers:\n")?;
    for provider in &config.providers {
        let marker = if default_id.is_some_and(|id| id.eq_ignore_ascii_case(&provider.id)) {
            "*"
        } else {
            " "
        };
        let endpoint = provider.endpoint().unwrap_or_else(|| "-".to_string());
        let streaming = if provider.supports_streaming {
            ""
        } else {
            ", no streaming"
        };
        writeln!(
            out,
            "{marker} {} ({}) {} @ {} [context {}{streaming}]",
            provider.id,
            provider.kind,
            provider.model,
            endpoint,
            provider.context_size()
        )?;
    }
    writeln!(out, "\n* = default provider")?;
    Ok(())
}

pub fn add_provider(
    config: &mut Config,
    args: ProviderAddArgs,
    out: &mut impl Write,
) -> Result<(), Box<dyn Error>> {
    let mut provider = ProviderConfig::new(args.id, args.kind, args.model);
    provider.base_url = args.base_url;
    provider.context_size = args.context_size;
    provider.supports_streaming = !args.no_stream;
    if let Some(var) = args.api_key_env {
        provider.credential = Credential::Env(var);
    }
    if let Some(max_tokens) = args.max_tokens {
        provider.sampling.max_tokens = max_tokens;
    }
    if let Some(temperature) = args.temperature {
        provider.sampling.temperature = temperature;
    }
    if let Some(format) = args.format {
        provider.instruction_format = format;
    }

    let id = provider.id.clone();
    config.add_provider(provider)?;
    writeln!(out, "✅ Added provider '{id}'")?;
    Ok(())
}

pub fn remove_provider(
    config: &mut Config,
    id: &str,
    out: &mut impl Write,
) -> Result<(), Box<dyn Error>> {
    let removed = config
        .remove_provider(id)
        .ok_or_else(|| format!("provider '{id}' not found"))?;
    writeln!(out, "✅ Removed provider '{}'", removed.id)?;
    Ok(())
}

pub fn set_default_provider(
    config: &mut Config,
    id: &str,
    out: &mut impl Write,
) -> Result<(), Box<dyn Error>> {
    config.set_default_provider(id)?;
    writeln!(out, "✅ Set default provider to '{id}'")?;
    Ok(())
}
