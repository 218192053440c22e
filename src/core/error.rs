use crate::core::providers::ProviderError;
use thiserror::Error;

/// Errors surfaced by the conversation core.
///
/// `NotFound` and `InvalidState` are contract violations by the caller and are
/// never retried. Provider failures arrive here only after the retry policy
/// has given up on them.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("context budget of {budget} tokens cannot fit the required {required} tokens")]
    InsufficientBudget { budget: usize, required: usize },

    #[error("invalid provider config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("generation cancelled")]
    Cancelled,

    #[error("storage failure: {0}")]
    Storage(String),
}

impl Error {
    pub(crate) fn message_not_found(id: impl std::fmt::Display) -> Self {
        Error::NotFound(format!("message {id}"))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
