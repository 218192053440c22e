use std::error::Error;
use std::io::Write;

use crate::character::Character;
use crate::cli::CharacterAddArgs;
use crate::core::config::Config;

pub fn list_characters(config: &Config, out: &mut impl Write) -> Result<(), Box<dyn Error>> {
    if config.characters.is_empty() {
        writeln!(out, "No characters configured.")?;
        writeln!(out, "\n💡 Add one with:")?;
        writeln!(
            out,
            "   parley characters add <id> --name <name> --persona <text>"
        )?;
        return Ok(());
    }

    writeln!(out, "Characters:\n")?;
    for character in &config.characters {
        match character.provider.as_deref() {
            Some(provider) => writeln!(
                out,
                "  • {} ({}) via {provider}",
                character.name, character.id
            )?,
            None => writeln!(out, "  • {} ({})", character.name, character.id)?,
        }
    }
    Ok(())
}

pub fn add_character(
    config: &mut Config,
    args: CharacterAddArgs,
    out: &mut impl Write,
) -> Result<(), Box<dyn Error>> {
    let valid_id = !args.id.is_empty()
        && args
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
    if !valid_id {
        return Err(format!(
            "character id '{}' may only contain letters, digits, '-' and '_'",
            args.id
        )
        .into());
    }

    if let Some(provider) = args.provider.as_deref() {
        if config.get_provider(provider).is_none() {
            writeln!(
                out,
                "⚠️  Provider '{provider}' is not configured; the default will be used until it is."
            )?;
        }
    }

    let mut character = Character::new(args.id, args.name, args.persona);
    character.greeting = args.greeting;
    character.provider = args.provider;
    character.system_template = args.system_template;

    writeln!(out, "✅ Saved character '{}'", character.id)?;
    config.upsert_character(character);
    Ok(())
}
