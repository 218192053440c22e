use std::error::Error;
use std::io::Write;

use crate::core::app::ChatService;
use crate::core::tree::ConversationTree;

pub async fn show_history(
    service: &ChatService,
    character: &str,
    out: &mut impl Write,
) -> Result<(), Box<dyn Error>> {
    let tree = service.tree(character).await?;
    let tree = tree.lock().await;
    render_history(&tree, out)
}

/// Print the active path, one message per block, marking branch points with
/// the message's position among its siblings.
pub fn render_history(tree: &ConversationTree, out: &mut impl Write) -> Result<(), Box<dyn Error>> {
    let path = tree.active_path(None)?;
    if path.is_empty() {
        writeln!(out, "(empty conversation)")?;
        return Ok(());
    }

    for message in &path {
        let (index, count) = tree.sibling_position(&message.id)?;
        let branch = if count > 1 {
            format!(" ({}/{count})", index + 1)
        } else {
            String::new()
        };
        let source = message
            .provider
            .as_ref()
            .map(|meta| format!(" via {}/{}", meta.provider_id, meta.model))
            .unwrap_or_default();
        writeln!(out, "## {}{branch}{source} [{}]", message.role, message.id)?;
        writeln!(out, "{}\n", message.content)?;
    }
    Ok(())
}

pub fn print_deleted(count: usize, out: &mut impl Write) -> Result<(), Box<dyn Error>> {
    let noun = if count == 1 { "message" } else { "messages" };
    writeln!(out, "✅ Deleted {count} {noun}")?;
    Ok(())
}
