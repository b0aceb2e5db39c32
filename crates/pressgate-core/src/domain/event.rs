//! Trigger events delivered by the external event source.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// What caused a pipeline run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Push,
    PullRequest,
    Manual,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Push => "push",
            TriggerKind::PullRequest => "pull_request",
            TriggerKind::Manual => "manual",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" => Ok(TriggerKind::Push),
            "pull_request" | "pull-request" | "pr" => Ok(TriggerKind::PullRequest),
            "manual" | "workflow_dispatch" => Ok(TriggerKind::Manual),
            other => Err(format!("unknown trigger kind: {other}")),
        }
    }
}

/// A single trigger. Consumed once by [`crate::Orchestrator::handle`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerEvent {
    pub kind: TriggerKind,
    pub branch: String,
    /// Opaque commit identifier.
    pub commit: String,
    /// Whether `branch` is the production branch, as judged by the event source.
    pub is_main: bool,
}

impl TriggerEvent {
    pub fn new(kind: TriggerKind, branch: impl Into<String>, commit: impl Into<String>, is_main: bool) -> Self {
        Self {
            kind,
            branch: branch.into(),
            commit: commit.into(),
            is_main,
        }
    }

    pub fn push(branch: impl Into<String>, commit: impl Into<String>, is_main: bool) -> Self {
        Self::new(TriggerKind::Push, branch, commit, is_main)
    }

    pub fn pull_request(branch: impl Into<String>, commit: impl Into<String>, is_main: bool) -> Self {
        Self::new(TriggerKind::PullRequest, branch, commit, is_main)
    }

    pub fn manual(branch: impl Into<String>, commit: impl Into<String>, is_main: bool) -> Self {
        Self::new(TriggerKind::Manual, branch, commit, is_main)
    }

    /// Deploy policy: only a push to the main branch is ever promoted.
    pub fn warrants_deploy(&self) -> bool {
        self.kind == TriggerKind::Push && self.is_main
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_main_push_warrants_deploy() {
        assert!(TriggerEvent::push("main", "a1", true).warrants_deploy());
        assert!(!TriggerEvent::push("feature", "a1", false).warrants_deploy());
        assert!(!TriggerEvent::pull_request("main", "a1", true).warrants_deploy());
        assert!(!TriggerEvent::manual("main", "a1", true).warrants_deploy());
    }

    #[test]
    fn trigger_kind_parses_aliases() {
        assert_eq!("push".parse::<TriggerKind>().unwrap(), TriggerKind::Push);
        assert_eq!("pull-request".parse::<TriggerKind>().unwrap(), TriggerKind::PullRequest);
        assert_eq!("pull_request".parse::<TriggerKind>().unwrap(), TriggerKind::PullRequest);
        assert_eq!("workflow_dispatch".parse::<TriggerKind>().unwrap(), TriggerKind::Manual);
        assert!("tag".parse::<TriggerKind>().is_err());
    }

    #[test]
    fn trigger_event_json_shape() {
        let event: TriggerEvent = serde_json::from_str(
            r#"{"kind":"pull_request","branch":"main","commit":"abc","is_main":true}"#,
        )
        .unwrap();
        assert_eq!(event.kind, TriggerKind::PullRequest);
        assert!(event.is_main);
    }
}
