use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

const ASYNC_MARKER_PREFIX: &str = "ASYNC_COMPLETE_";

/// Fixed sentinel printed at the end of a synchronous execution. A session
/// only ever has one transmitted execution, so sync calls can share it.
pub const SYNC_MARKER: &str = "SYNC_COMPLETE";

/// Identifier of one execution. Random v4 ids keep the completion marker
/// unlikely to collide with query output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecId(Uuid);

impl ExecId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::try_parse(raw).ok().map(Self)
    }

    pub fn async_marker(&self) -> String {
        format!("{ASYNC_MARKER_PREFIX}{}", self.0.simple())
    }

    /// Short prefix used in file names and log lines.
    pub fn short(&self) -> String {
        let mut simple = self.0.simple().to_string();
        simple.truncate(8);
        simple
    }
}

impl Default for ExecId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn async_marker_embeds_the_full_id() {
        let id = ExecId::new();
        let marker = id.async_marker();
        assert!(marker.starts_with("ASYNC_COMPLETE_"));
        assert!(marker.ends_with(&id.to_string()));
        assert_eq!(marker.len(), "ASYNC_COMPLETE_".len() + 32);
    }

    #[test]
    fn display_round_trips_through_parse() {
        let id = ExecId::new();
        assert_eq!(ExecId::parse(&id.to_string()), Some(id));
        assert_eq!(ExecId::parse("not-an-id"), None);
    }
}
