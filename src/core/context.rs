//! Token-budget-aware selection of conversation history.

use crate::core::error::{Error, Result};
use crate::core::message::Message;

/// Estimates how many provider tokens a piece of text costs.
///
/// Providers with an exact tokenizer can plug one in; everything else falls
/// back to [`CharEstimator`].
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;

    /// Fixed cost every message adds on top of its content (role markers,
    /// separators).
    fn message_overhead(&self) -> usize {
        0
    }

    fn message_cost(&self, message: &Message) -> usize {
        self.estimate(&message.content) + self.message_overhead()
    }

    /// Longest suffix of `text` whose estimate fits in `max_tokens`.
    fn truncate_tail(&self, text: &str, max_tokens: usize) -> String {
        if self.estimate(text) <= max_tokens {
            return text.to_string();
        }

        let boundaries: Vec<usize> = text.char_indices().map(|(index, _)| index).collect();
        // Search for the smallest start offset that still fits.
        let (mut low, mut high) = (0, boundaries.len());
        while low < high {
            let mid = (low + high) / 2;
            if self.estimate(&text[boundaries[mid]..]) <= max_tokens {
                high = mid;
            } else {
                low = mid + 1;
            }
        }

        boundaries
            .get(low)
            .map(|start| text[*start..].to_string())
            .unwrap_or_default()
    }
}

/// Approximate estimator: one token per `chars_per_token` characters plus a
/// fixed per-message overhead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharEstimator {
    pub chars_per_token: usize,
    pub per_message_overhead: usize,
}

impl CharEstimator {
    pub const DEFAULT_CHARS_PER_TOKEN: usize = 4;
    pub const DEFAULT_MESSAGE_OVERHEAD: usize = 20;

    pub fn new(chars_per_token: usize, per_message_overhead: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
            per_message_overhead,
        }
    }
}

impl Default for CharEstimator {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_CHARS_PER_TOKEN,
            Self::DEFAULT_MESSAGE_OVERHEAD,
        )
    }
}

impl TokenEstimator for CharEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count() / self.chars_per_token
    }

    fn message_overhead(&self) -> usize {
        self.per_message_overhead
    }
}

/// The history selected for one request, oldest first, persona leading.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextWindow {
    pub messages: Vec<Message>,
    pub estimated_tokens: usize,
    /// Older messages left out to respect the budget.
    pub dropped: usize,
    /// Whether the most recent message had to be cut down to its tail.
    pub truncated: bool,
}

impl ContextWindow {
    fn empty() -> Self {
        Self {
            messages: Vec::new(),
            estimated_tokens: 0,
            dropped: 0,
            truncated: false,
        }
    }
}

pub struct ContextBuilder<'a> {
    estimator: &'a dyn TokenEstimator,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(estimator: &'a dyn TokenEstimator) -> Self {
        Self { estimator }
    }

    /// Select the suffix of `path` that fits `budget` tokens.
    ///
    /// A system message at the head of the path is the persona: it is always
    /// kept and never counts as droppable history. The most recent message is
    /// always kept as well, reduced to its tail when it cannot fit whole.
    /// Older messages are then added newest first until the next one would
    /// overflow the budget.
    pub fn build(&self, path: &[Message], budget: usize) -> Result<ContextWindow> {
        let (persona, history) = match path.split_first() {
            Some((first, rest)) if first.is_system() => (Some(first), rest),
            _ => (None, path),
        };

        let persona_cost = persona
            .map(|message| self.estimator.message_cost(message))
            .unwrap_or(0);
        if persona.is_some() && budget <= persona_cost {
            return Err(Error::InsufficientBudget {
                budget,
                required: persona_cost + 1,
            });
        }

        let Some((latest, older)) = history.split_last() else {
            let mut window = ContextWindow::empty();
            if let Some(persona) = persona {
                window.messages.push(persona.clone());
                window.estimated_tokens = persona_cost;
            }
            return Ok(window);
        };

        let overhead = self.estimator.message_overhead();
        let room_for_latest = budget - persona_cost;
        if room_for_latest <= overhead {
            return Err(Error::InsufficientBudget {
                budget,
                required: persona_cost + overhead + 1,
            });
        }

        let mut kept_latest = latest.clone();
        let mut truncated = false;
        let mut latest_cost = self.estimator.message_cost(latest);
        if latest_cost > room_for_latest {
            kept_latest.content = self
                .estimator
                .truncate_tail(&latest.content, room_for_latest - overhead);
            latest_cost = self.estimator.message_cost(&kept_latest);
            truncated = true;
        }

        let mut used = persona_cost + latest_cost;
        let mut kept_older = Vec::new();
        for message in older.iter().rev() {
            let cost = self.estimator.message_cost(message);
            if used + cost > budget {
                break;
            }
            used += cost;
            kept_older.push(message.clone());
        }
        let dropped = older.len() - kept_older.len();

        let mut messages = Vec::with_capacity(kept_older.len() + 2);
        if let Some(persona) = persona {
            messages.push(persona.clone());
        }
        messages.extend(kept_older.into_iter().rev());
        messages.push(kept_latest);

        Ok(ContextWindow {
            messages,
            estimated_tokens: used,
            dropped,
            truncated,
        })
    }
}
