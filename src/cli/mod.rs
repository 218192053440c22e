//! Command-line interface parsing and handling
//!
//! Every command loads the config, acts on it or on a character's saved
//! conversation tree, and exits. Streamed replies go to stdout; diagnostics
//! and logs go to stderr.

pub mod characters;
pub mod history;
pub mod providers;
pub mod say;

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::core::app::ChatService;
use crate::core::config::Config;
use crate::core::message::MessageId;
use crate::core::prompt_format::InstructionFormat;
use crate::core::providers::ProviderKind;
use crate::core::tree_store::JsonTreeStore;
use crate::utils::logging::init_tracing;

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Branching character conversations over multiple LLM providers")]
#[command(
    long_about = "Parley keeps one branching conversation per character and streams replies \
from OpenAI-compatible, Anthropic, and Google providers.\n\n\
Environment Variables:\n\
  PARLEY_LOG        tracing filter for diagnostics on stderr (default: warn)"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Show debug diagnostics on stderr
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Use this config file instead of the platform default
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage provider configurations
    Providers {
        #[command(subcommand)]
        command: ProviderCommands,
    },
    /// Manage characters
    Characters {
        #[command(subcommand)]
        command: CharacterCommands,
    },
    /// Send a message to a character and stream the reply
    Say {
        #[arg(short = 'c', long)]
        character: String,
        /// Provider config id (defaults to the character's, then the global default)
        #[arg(short = 'p', long)]
        provider: Option<String>,
        #[arg(required = true, trailing_var_arg = true)]
        prompt: Vec<String>,
    },
    /// Generate a new sibling for an assistant reply (the latest one by default)
    Regenerate {
        #[arg(short = 'c', long)]
        character: String,
        #[arg(short = 'p', long)]
        provider: Option<String>,
        #[arg(value_parser = parse_message_id)]
        message: Option<MessageId>,
    },
    /// Reply to the latest user message after a failed or cancelled generation
    Retry {
        #[arg(short = 'c', long)]
        character: String,
        #[arg(short = 'p', long)]
        provider: Option<String>,
    },
    /// Show the active conversation path
    History {
        #[arg(short = 'c', long)]
        character: String,
    },
    /// Make a message the active branch
    Select {
        #[arg(short = 'c', long)]
        character: String,
        #[arg(value_parser = parse_message_id)]
        message: MessageId,
    },
    /// Delete a message and everything below it
    Delete {
        #[arg(short = 'c', long)]
        character: String,
        #[arg(value_parser = parse_message_id)]
        message: MessageId,
    },
}

#[derive(Subcommand)]
pub enum ProviderCommands {
    /// List configured providers
    List,
    /// Add a provider configuration
    Add(ProviderAddArgs),
    /// Remove a provider configuration
    Remove { id: String },
    /// Set the default provider
    Default { id: String },
}

#[derive(clap::Args, Debug, Clone)]
pub struct ProviderAddArgs {
    pub id: String,
    /// openai, anthropic, google, deepseek, groq, or custom
    #[arg(long)]
    pub kind: ProviderKind,
    #[arg(long)]
    pub model: String,
    /// Required for custom providers
    #[arg(long)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key
    #[arg(long, value_name = "VAR")]
    pub api_key_env: Option<String>,
    /// Context window in tokens (defaults to the model's known size)
    #[arg(long)]
    pub context_size: Option<usize>,
    #[arg(long)]
    pub max_tokens: Option<u32>,
    #[arg(long)]
    pub temperature: Option<f64>,
    /// default, alpaca, chatml, vicuna, or llama
    #[arg(long)]
    pub format: Option<InstructionFormat>,
    /// Always request complete responses
    #[arg(long)]
    pub no_stream: bool,
}

#[derive(Subcommand)]
pub enum CharacterCommands {
    /// List characters
    List,
    /// Add or replace a character
    Add(CharacterAddArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct CharacterAddArgs {
    pub id: String,
    #[arg(long)]
    pub name: String,
    #[arg(long)]
    pub persona: String,
    #[arg(long)]
    pub greeting: Option<String>,
    /// Preferred provider config id
    #[arg(long)]
    pub provider: Option<String>,
    /// Persona template with {character_name} and {personality}
    #[arg(long)]
    pub system_template: Option<String>,
}

fn parse_message_id(value: &str) -> Result<MessageId, String> {
    value
        .parse()
        .map_err(|err| format!("invalid message id '{value}': {err}"))
}

pub fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(args.verbose);
    tokio::runtime::Runtime::new()?.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<(), Box<dyn Error>> {
    let config_path = match args.config {
        Some(path) => path,
        None => Config::config_path()?,
    };
    let mut config = Config::load_from_path(&config_path)?;
    let mut stdout = std::io::stdout();

    match args.command {
        Commands::Providers { command } => match command {
            ProviderCommands::List => providers::list_providers(&config, &mut stdout)?,
            ProviderCommands::Add(add) => {
                providers::add_provider(&mut config, add, &mut stdout)?;
                config.save_to_path(&config_path)?;
            }
            ProviderCommands::Remove { id } => {
                providers::remove_provider(&mut config, &id, &mut stdout)?;
                config.save_to_path(&config_path)?;
            }
            ProviderCommands::Default { id } => {
                providers::set_default_provider(&mut config, &id, &mut stdout)?;
                config.save_to_path(&config_path)?;
            }
        },
        Commands::Characters { command } => match command {
            CharacterCommands::List => characters::list_characters(&config, &mut stdout)?,
            CharacterCommands::Add(add) => {
                characters::add_character(&mut config, add, &mut stdout)?;
                config.save_to_path(&config_path)?;
            }
        },
        Commands::Say {
            character,
            provider,
            prompt,
        } => {
            let service = open_service(&config)?;
            say::run_say(&service, &character, provider.as_deref(), &prompt.join(" ")).await?;
        }
        Commands::Regenerate {
            character,
            provider,
            message,
        } => {
            let service = open_service(&config)?;
            say::run_regenerate(&service, &character, provider.as_deref(), message).await?;
        }
        Commands::Retry {
            character,
            provider,
        } => {
            let service = open_service(&config)?;
            say::run_retry(&service, &character, provider.as_deref()).await?;
        }
        Commands::History { character } => {
            let service = open_service(&config)?;
            history::show_history(&service, &character, &mut stdout).await?;
        }
        Commands::Select { character, message } => {
            let service = open_service(&config)?;
            service.select_branch(&character, message).await?;
            history::show_history(&service, &character, &mut stdout).await?;
        }
        Commands::Delete { character, message } => {
            let service = open_service(&config)?;
            let removed = service.delete_subtree(&character, message).await?;
            history::print_deleted(removed.len(), &mut stdout)?;
        }
    }
    Ok(())
}

/// Service over the configured providers and characters, saving trees under
/// the platform data directory.
fn open_service(config: &Config) -> Result<ChatService, Box<dyn Error>> {
    let registry = config.build_registry(reqwest::Client::new())?;
    let store = JsonTreeStore::new(Config::trees_dir()?);
    let service = ChatService::new(Arc::new(registry))
        .with_store(Arc::new(store))
        .with_retry_policy(config.retry)
        .with_user_name(config.user_name.clone());
    for character in &config.characters {
        service.add_character(character.clone());
    }
    Ok(service)
}
