//! Generation commands: stream a reply to stdout, cancel on Ctrl-C.

use std::error::Error;
use std::io::{self, Write};

use crate::core::app::{ChatService, GenerationHandle};
use crate::core::chat_stream::StreamEvent;
use crate::core::message::{Message, MessageId};

pub async fn run_say(
    service: &ChatService,
    character: &str,
    provider: Option<&str>,
    prompt: &str,
) -> Result<(), Box<dyn Error>> {
    let handle = service
        .start_generation(character, provider, prompt)
        .await?;
    finish(service, handle).await
}

/// Regenerate `message`, or the latest assistant reply when none is given.
pub async fn run_regenerate(
    service: &ChatService,
    character: &str,
    provider: Option<&str>,
    message: Option<MessageId>,
) -> Result<(), Box<dyn Error>> {
    let target = match message {
        Some(id) => id,
        None => latest_reply(&service.active_path(character).await?)
            .ok_or("no assistant reply to regenerate")?,
    };
    let handle = service.regenerate(character, target, provider).await?;
    finish(service, handle).await
}

pub async fn run_retry(
    service: &ChatService,
    character: &str,
    provider: Option<&str>,
) -> Result<(), Box<dyn Error>> {
    let handle = service.retry(character, provider).await?;
    finish(service, handle).await
}

fn latest_reply(path: &[Message]) -> Option<MessageId> {
    path.iter()
        .rev()
        .find(|message| message.is_assistant())
        .map(|message| message.id)
}

async fn finish(service: &ChatService, mut handle: GenerationHandle) -> Result<(), Box<dyn Error>> {
    let mut stdout = io::stdout();
    let mut interrupted = false;
    loop {
        tokio::select! {
            event = handle.events.recv() => {
                let Some(event) = event else { break };
                render_event(&event, &mut stdout)?;
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                let _ = service.cancel(handle.session_id);
            }
        }
    }

    match handle.wait().await {
        Ok(message) => {
            eprintln!("[{}]", message.id);
            Ok(())
        }
        Err(err) if err.is_cancelled() => {
            eprintln!("⏹️  Generation cancelled; nothing was saved.");
            Ok(())
        }
        Err(err) => {
            eprintln!("❌ Error: {err}");
            eprintln!("💡 Run `parley retry -c <character>` to try again.");
            std::process::exit(1);
        }
    }
}

/// Write one event. Deltas go out as they arrive; retries are reported on
/// stderr.
pub fn render_event(event: &StreamEvent, out: &mut impl Write) -> io::Result<()> {
    match event {
        StreamEvent::Delta(text) => {
            out.write_all(text.as_bytes())?;
            out.flush()
        }
        StreamEvent::Retrying {
            attempt,
            delay,
            error,
        } => {
            writeln!(out)?;
            eprintln!(
                "⚠️  Attempt {attempt} failed ({error}); retrying in {:.1}s",
                delay.as_secs_f64()
            );
            Ok(())
        }
        StreamEvent::Completed(_) => writeln!(out),
        StreamEvent::Started { .. } | StreamEvent::Failed(_) | StreamEvent::Cancelled => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::Role;
    use crate::core::providers::ProviderError;
    use std::time::Duration;

    #[test]
    fn deltas_are_written_verbatim() {
        let mut out = Vec::new();
        for event in [
            StreamEvent::Delta("Hi".into()),
            StreamEvent::Delta(" there".into()),
            StreamEvent::Cancelled,
        ] {
            render_event(&event, &mut out).expect("render");
        }
        assert_eq!(String::from_utf8(out).expect("utf8"), "Hi there");
    }

    #[test]
    fn retry_breaks_the_partial_line() {
        let mut out = Vec::new();
        render_event(&StreamEvent::Delta("Hel".into()), &mut out).expect("render");
        render_event(
            &StreamEvent::Retrying {
                attempt: 1,
                delay: Duration::from_millis(500),
                error: ProviderError::Unavailable("503".into()),
            },
            &mut out,
        )
        .expect("render");
        assert_eq!(String::from_utf8(out).expect("utf8"), "Hel\n");
    }

    #[test]
    fn latest_reply_skips_trailing_user_turns() {
        let persona = Message::new(None, Role::System, "persona", None);
        let reply = Message::new(Some(persona.id), Role::Assistant, "hello", None);
        let user = Message::new(Some(reply.id), Role::User, "hi", None);
        assert_eq!(
            latest_reply(&[persona.clone(), reply.clone(), user]),
            Some(reply.id)
        );
        assert_eq!(latest_reply(&[persona]), None);
    }
}
