//! Server-sent-event framing shared by the streaming adapters.

use std::pin::Pin;
use std::time::Duration;

use futures_util::{stream, Stream, StreamExt};
use memchr::memchr;
use tracing::{debug, trace};

use super::{Increment, IncrementStream, ProviderError};

/// What one `data:` payload means to an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Delta(String),
    Done,
    Ignore,
}

/// Splits a byte stream into complete lines, tolerating chunk boundaries that
/// fall inside a line or a multi-byte character.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete `data:` payload, skipping comments and other fields.
    pub fn next_payload(&mut self) -> Option<String> {
        while let Some(newline_pos) = memchr(b'\n', &self.buffer) {
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            let Ok(text) = std::str::from_utf8(&line) else {
                debug!("skipping SSE line with invalid UTF-8");
                continue;
            };
            if let Some(payload) = extract_data_payload(text.trim()) {
                return Some(payload.to_string());
            }
        }
        None
    }

    /// Payload left over when the body ends without a trailing newline.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let text = String::from_utf8(rest).ok()?;
        extract_data_payload(text.trim()).map(str::to_string)
    }
}

fn extract_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

struct SseState<S, F> {
    body: Pin<Box<S>>,
    decoder: SseDecoder,
    parse: F,
    idle_timeout: Duration,
    finished: bool,
}

/// Turn an SSE body into increments.
///
/// `parse` maps each `data:` payload to an [`SseEvent`]. The stream ends after
/// a `Done` event, a parse error, or the end of the body. Waiting longer than
/// `idle_timeout` for the next chunk yields `Unavailable`.
pub fn sse_increments<S, B, F>(body: S, idle_timeout: Duration, parse: F) -> IncrementStream
where
    S: Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    F: FnMut(&str) -> Result<SseEvent, ProviderError> + Send + 'static,
{
    let state = SseState {
        body: Box::pin(body),
        decoder: SseDecoder::new(),
        parse,
        idle_timeout,
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        loop {
            while let Some(payload) = state.decoder.next_payload() {
                if let Some(item) = state.handle(&payload) {
                    return Some((item, state));
                }
            }

            match tokio::time::timeout(state.idle_timeout, state.body.next()).await {
                Err(_) => {
                    state.finished = true;
                    let error = ProviderError::timed_out(state.idle_timeout);
                    return Some((Err(error), state));
                }
                Ok(Some(Ok(chunk))) => state.decoder.push(chunk.as_ref()),
                Ok(Some(Err(err))) => {
                    state.finished = true;
                    return Some((Err(ProviderError::from_transport(&err)), state));
                }
                Ok(None) => {
                    state.finished = true;
                    if let Some(payload) = state.decoder.finish() {
                        match state.handle(&payload) {
                            Some(Ok(increment)) => {
                                let terminal = Increment::terminal(increment.delta);
                                return Some((Ok(terminal), state));
                            }
                            Some(Err(error)) => return Some((Err(error), state)),
                            None => {}
                        }
                    }
                    trace!("SSE body ended without a completion marker");
                    return Some((Ok(Increment::terminal(String::new())), state));
                }
            }
        }
    }))
}

impl<S, F> SseState<S, F>
where
    F: FnMut(&str) -> Result<SseEvent, ProviderError>,
{
    fn handle(&mut self, payload: &str) -> Option<Result<Increment, ProviderError>> {
        if payload.is_empty() {
            return None;
        }
        match (self.parse)(payload) {
            Ok(SseEvent::Delta(text)) if text.is_empty() => None,
            Ok(SseEvent::Delta(text)) => Some(Ok(Increment::delta(text))),
            Ok(SseEvent::Done) => {
                self.finished = true;
                Some(Ok(Increment::terminal(String::new())))
            }
            Ok(SseEvent::Ignore) => None,
            Err(error) => {
                self.finished = true;
                Some(Err(error))
            }
        }
    }
}
