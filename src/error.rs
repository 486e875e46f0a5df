use thiserror::Error;

use crate::comment::CommentId;
use crate::protocol::Action;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while harvesting a thread.
///
/// Only a failure to obtain the snapshot stops a thread's retrieval; the other
/// variants are collected into `ThreadResult::errors` next to the comments that
/// did arrive.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport failure or timeout. Retryable.
    #[error("{action} failed: {message}")]
    Network { action: Action, message: String },

    /// The server answered with JSON we cannot use.
    #[error("{action} returned an unexpected response: {message}")]
    Protocol { action: Action, message: String },

    #[error("comment {} could not be extracted: {source}", display_id(*.id))]
    Extraction {
        id: Option<CommentId>,
        #[source]
        source: ExtractionError,
    },

    /// Advisory: a response carried exactly the server cap worth of items and
    /// may have been truncated.
    #[error(
        "{action} returned {count} items (the server cap) for {scope}; result may be incomplete"
    )]
    LimitExceeded {
        action: Action,
        count: usize,
        scope: String,
    },

    #[error("expanding embedded post {story_id} failed: {source}")]
    Expansion {
        story_id: u64,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn network(action: Action, message: impl Into<String>) -> Self {
        Self::Network {
            action,
            message: message.into(),
        }
    }

    pub fn protocol(action: Action, message: impl Into<String>) -> Self {
        Self::Protocol {
            action,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }

    pub fn is_advisory(&self) -> bool {
        matches!(self, Self::LimitExceeded { .. })
    }
}

/// Why a single markup fragment could not be turned into a `Comment`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error("no comment container in fragment")]
    MissingContainer,
    #[error("comment container has no data-meta attribute")]
    MissingMeta,
    #[error("comment container has an invalid data-id {0:?}")]
    InvalidId(String),
}

fn display_id(id: Option<CommentId>) -> String {
    id.map(|id| id.to_string())
        .unwrap_or_else(|| "<unknown>".to_string())
}
