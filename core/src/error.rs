use std::time::Duration;

use thiserror::Error;

use crate::exec_id::ExecId;

pub type Result<T> = std::result::Result<T, SqlCellErr>;

#[derive(Debug, Error)]
pub enum SqlCellErr {
    /// The session process never printed its readiness token. Spawn failures
    /// and early exits are reported through this variant as well.
    #[error("session `{session}` did not become ready within {}ms: {detail}", waited.as_millis())]
    StartupTimeout {
        session: String,
        waited: Duration,
        detail: String,
    },

    #[error("execution {exec_id} did not complete within {}ms", waited.as_millis())]
    ExecutionTimeout { exec_id: ExecId, waited: Duration },

    #[error("session `{session}` has exited")]
    SessionExited { session: String },

    #[error("template error: {0}")]
    Template(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SqlCellErr {
    pub(crate) fn startup(session: &str, waited: Duration, detail: impl Into<String>) -> Self {
        Self::StartupTimeout {
            session: session.to_string(),
            waited,
            detail: detail.into(),
        }
    }

    pub(crate) fn session_exited(session: &str) -> Self {
        Self::SessionExited {
            session: session.to_string(),
        }
    }
}
