use serde::Serialize;
use std::fmt;

/// What a cancel request did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The running execution was sent an interrupt; the completion router
    /// will report it as cancelled.
    Interrupted,
    /// A queued execution was marked cancelled and will never be sent.
    Dequeued { position: usize },
    AlreadyFinished,
    NotFound,
    Reject { reason: String },
}

impl CancelOutcome {
    pub(crate) fn reject(reason: impl Into<String>) -> Self {
        Self::Reject {
            reason: reason.into(),
        }
    }

    /// True when the execution will end up `cancelled`.
    pub fn accepted(&self) -> bool {
        matches!(self, Self::Interrupted | Self::Dequeued { .. })
    }
}

impl fmt::Display for CancelOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupted => write!(f, "interrupted"),
            Self::Dequeued { position } => write!(f, "dequeued(position {position})"),
            Self::AlreadyFinished => write!(f, "already_finished"),
            Self::NotFound => write!(f, "not_found"),
            Self::Reject { reason } => write!(f, "reject({reason})"),
        }
    }
}
