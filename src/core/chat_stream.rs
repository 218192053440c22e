//! One generation request from context building to committed message.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{ChatMessage, ChatRequest};
use crate::core::context::{ContextBuilder, ContextWindow, TokenEstimator};
use crate::core::error::{Error, Result};
use crate::core::message::{Message, MessageId, Role};
use crate::core::prompt_format::InstructionFormat;
use crate::core::providers::{ProviderAdapter, ProviderConfig, ProviderError, ProviderRegistry};
use crate::core::retry::RetryPolicy;
use crate::core::tree::SharedTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Requesting,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamState::Completed | StreamState::Failed | StreamState::Cancelled
        )
    }
}

/// Progress reported to whoever started a generation.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Started {
        session_id: SessionId,
        provider_id: String,
        model: String,
    },
    /// Newly generated text, forwarded as soon as it arrives.
    Delta(String),
    /// A transient failure ended attempt `attempt`; the next one starts after
    /// `delay`. Text streamed by the failed attempt is discarded.
    Retrying {
        attempt: u32,
        delay: Duration,
        error: ProviderError,
    },
    Completed(Message),
    Failed(Error),
    Cancelled,
}

/// Mutable state of one generation.
#[derive(Debug)]
pub struct StreamSession {
    pub id: SessionId,
    pub branch_parent: Option<MessageId>,
    pub draft: String,
    pub state: StreamState,
    pub attempts: u32,
}

enum AttemptError {
    Cancelled,
    Provider(ProviderError),
}

impl From<ProviderError> for AttemptError {
    fn from(error: ProviderError) -> Self {
        AttemptError::Provider(error)
    }
}

/// Drives a single generation through
/// `Idle → Requesting → (Streaming →) Completed`, with `Failed` and
/// `Cancelled` as the other exits.
///
/// Nothing is written to the tree unless the generation completes: failed and
/// cancelled sessions leave the conversation exactly as they found it.
pub struct StreamController {
    session: StreamSession,
    registry: Arc<ProviderRegistry>,
    retry: RetryPolicy,
    estimator: Arc<dyn TokenEstimator>,
    cancel_token: CancellationToken,
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamController {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        retry: RetryPolicy,
        estimator: Arc<dyn TokenEstimator>,
    ) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = Self {
            session: StreamSession {
                id: SessionId::new(),
                branch_parent: None,
                draft: String::new(),
                state: StreamState::Idle,
                attempts: 0,
            },
            registry,
            retry,
            estimator,
            cancel_token: CancellationToken::new(),
            events: tx,
        };
        (controller, rx)
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id
    }

    pub fn state(&self) -> StreamState {
        self.session.state
    }

    pub fn session(&self) -> &StreamSession {
        &self.session
    }

    /// Token that cancels this session when triggered from anywhere.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Generate a reply under `branch_parent` using provider `config_id`.
    pub async fn start(
        &mut self,
        tree: &SharedTree,
        branch_parent: MessageId,
        config_id: &str,
    ) -> Result<Message> {
        if self.session.state != StreamState::Idle {
            return Err(Error::InvalidState(format!(
                "session {} has already run",
                self.session.id
            )));
        }
        self.session.branch_parent = Some(branch_parent);
        if self.cancel_token.is_cancelled() {
            return Err(self.finish_cancelled());
        }

        let prepared = self.prepare(tree, branch_parent, config_id).await;
        let (adapter, request) = match prepared {
            Ok(prepared) => prepared,
            Err(error) => return Err(self.finish_failed(error)),
        };
        self.emit(StreamEvent::Started {
            session_id: self.session.id,
            provider_id: adapter.config().id.clone(),
            model: adapter.config().model.clone(),
        });
        info!(
            session = %self.session.id,
            provider = %adapter.config().id,
            messages = request.messages.len(),
            "generation started"
        );

        loop {
            self.session.attempts += 1;
            self.session.draft.clear();
            self.session.state = StreamState::Requesting;
            debug!(session = %self.session.id, attempt = self.session.attempts, "attempt started");

            match self.attempt(adapter.as_ref(), &request).await {
                Ok(()) => break,
                Err(AttemptError::Cancelled) => return Err(self.finish_cancelled()),
                Err(AttemptError::Provider(error)) => {
                    let Some(delay) = self.retry.next_delay(&error, self.session.attempts) else {
                        return Err(self.finish_failed(Error::Provider(error)));
                    };
                    warn!(
                        session = %self.session.id,
                        attempt = self.session.attempts,
                        ?delay,
                        %error,
                        "transient provider failure, retrying"
                    );
                    self.emit(StreamEvent::Retrying {
                        attempt: self.session.attempts,
                        delay,
                        error,
                    });
                    let cancel = self.cancel_token.clone();
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(self.finish_cancelled()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.commit(tree, branch_parent, adapter.config()).await
    }

    /// Generate a replacement for assistant message `original`. The result
    /// becomes its active sibling; `original` is left untouched.
    pub async fn regenerate(
        &mut self,
        tree: &SharedTree,
        original: MessageId,
        config_id: &str,
    ) -> Result<Message> {
        let parent = tree.lock().await.regeneration_parent(&original);
        match parent {
            Ok(parent) => self.start(tree, parent, config_id).await,
            Err(error) => Err(self.finish_failed(error)),
        }
    }

    async fn prepare(
        &self,
        tree: &SharedTree,
        branch_parent: MessageId,
        config_id: &str,
    ) -> Result<(Arc<dyn ProviderAdapter>, ChatRequest)> {
        let adapter = self.registry.resolve(config_id)?;
        let path = tree.lock().await.active_path(Some(branch_parent))?;
        let config = adapter.config();
        let path = format_turns(path, config.instruction_format);
        let window = ContextBuilder::new(self.estimator.as_ref())
            .build(&path, config.context_budget())?;
        if window.dropped > 0 || window.truncated {
            debug!(
                session = %self.session.id,
                dropped = window.dropped,
                truncated = window.truncated,
                budget = config.context_budget(),
                "history trimmed to fit the context window"
            );
        }
        let request = build_request(&window, config);
        Ok((adapter, request))
    }

    async fn attempt(
        &mut self,
        adapter: &dyn ProviderAdapter,
        request: &ChatRequest,
    ) -> Result<(), AttemptError> {
        let cancel = self.cancel_token.clone();
        let mut increments = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
            opened = adapter.send(request) => opened?,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
                next = increments.next() => next,
            };
            let increment = match next {
                Some(Ok(increment)) => increment,
                Some(Err(error)) => return Err(AttemptError::Provider(error)),
                None => return Ok(()),
            };
            if cancel.is_cancelled() {
                return Err(AttemptError::Cancelled);
            }

            if !increment.terminal {
                self.session.state = StreamState::Streaming;
            }
            if !increment.delta.is_empty() {
                self.session.draft.push_str(&increment.delta);
                self.emit(StreamEvent::Delta(increment.delta));
            }
            if increment.terminal {
                return Ok(());
            }
        }
    }

    async fn commit(
        &mut self,
        tree: &SharedTree,
        branch_parent: MessageId,
        config: &ProviderConfig,
    ) -> Result<Message> {
        let committed = {
            let mut tree = tree.lock().await;
            // Checked under the lock so a cancel that lands before the commit
            // still leaves no branch.
            if self.cancel_token.is_cancelled() {
                None
            } else {
                Some(tree.append_message(
                    branch_parent,
                    Role::Assistant,
                    self.session.draft.clone(),
                    Some(config.meta()),
                ))
            }
        };

        match committed {
            None => Err(self.finish_cancelled()),
            Some(Err(error)) => Err(self.finish_failed(error)),
            Some(Ok(message)) => {
                self.session.state = StreamState::Completed;
                info!(
                    session = %self.session.id,
                    message = %message.id,
                    attempts = self.session.attempts,
                    "generation completed"
                );
                self.emit(StreamEvent::Completed(message.clone()));
                Ok(message)
            }
        }
    }

    fn finish_cancelled(&mut self) -> Error {
        self.session.state = StreamState::Cancelled;
        self.session.draft.clear();
        info!(session = %self.session.id, "generation cancelled");
        self.emit(StreamEvent::Cancelled);
        Error::Cancelled
    }

    fn finish_failed(&mut self, error: Error) -> Error {
        self.session.state = StreamState::Failed;
        self.session.draft.clear();
        warn!(session = %self.session.id, %error, "generation failed");
        self.emit(StreamEvent::Failed(error.clone()));
        error
    }

    fn emit(&self, event: StreamEvent) {
        let _ = self.events.send(event);
    }
}

/// Wrap every turn in `format`. Runs before budgeting so the estimate covers
/// exactly what is sent.
fn format_turns(path: Vec<Message>, format: InstructionFormat) -> Vec<Message> {
    if format == InstructionFormat::Default {
        return path;
    }
    path.into_iter()
        .map(|mut message| {
            message.content = format.apply(message.role, &message.content);
            message
        })
        .collect()
}

/// Turn an already formatted context window into the request sent to
/// `config`'s provider.
pub fn build_request(window: &ContextWindow, config: &ProviderConfig) -> ChatRequest {
    let messages = window
        .messages
        .iter()
        .map(|message| ChatMessage::new(message.role, message.content.clone()))
        .collect();
    ChatRequest {
        model: config.model.clone(),
        messages,
        sampling: config.sampling,
        extra: config.extra.clone(),
    }
}
