//! Run identity and the terminal record reported to the triggering caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{FailureKind, PipelineError};
use super::event::TriggerEvent;
use crate::fingerprint::Fingerprint;
use crate::store::ArtifactId;

/// Unique identifier for a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Coarse status for status checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failure,
    Skipped,
}

/// Where a run stopped. Exactly one per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    /// Artifact promoted to the live endpoint.
    Deployed,
    /// Build and publish succeeded; deploy policy did not apply.
    CheckPassed,
    /// Another deployment held the gate; this request was dropped.
    SkippedSuperseded,
    Failed,
}

impl TerminalState {
    pub fn status(&self) -> RunStatus {
        match self {
            TerminalState::Deployed | TerminalState::CheckPassed => RunStatus::Success,
            TerminalState::SkippedSuperseded => RunStatus::Skipped,
            TerminalState::Failed => RunStatus::Failure,
        }
    }
}

/// Terminal record of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub event: TriggerEvent,
    pub fingerprint: Option<Fingerprint>,
    pub cache_hit: bool,
    pub status: RunStatus,
    pub terminal: TerminalState,
    pub failure_kind: Option<FailureKind>,
    pub artifact_id: Option<ArtifactId>,
    pub deployed: bool,
    /// A newer trigger for the same branch arrived while this run was in flight.
    pub stale: bool,
    pub logs: Vec<String>,
    pub diagnostics: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// Mutable aggregate for a run in flight. Consumed by [`Run::finish`] so that
/// `status`, `terminal` and `deployed` can never disagree.
#[derive(Debug)]
pub(crate) struct Run {
    pub id: RunId,
    pub event: TriggerEvent,
    pub fingerprint: Option<Fingerprint>,
    pub cache_hit: bool,
    pub artifact_id: Option<ArtifactId>,
    pub stale: bool,
    pub logs: Vec<String>,
    started_at: DateTime<Utc>,
    started: std::time::Instant,
}

impl Run {
    pub fn start(event: TriggerEvent) -> Self {
        Self {
            id: RunId::new(),
            event,
            fingerprint: None,
            cache_hit: false,
            artifact_id: None,
            stale: false,
            logs: Vec::new(),
            started_at: Utc::now(),
            started: std::time::Instant::now(),
        }
    }

    pub fn log(&mut self, line: impl Into<String>) {
        self.logs.push(line.into());
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn finish(self, terminal: TerminalState) -> RunOutcome {
        debug_assert!(terminal != TerminalState::Failed, "use fail() for failures");
        self.into_outcome(terminal, None, None)
    }

    pub fn fail(self, error: &PipelineError) -> RunOutcome {
        let diagnostics = error.diagnostics();
        self.into_outcome(TerminalState::Failed, Some(error.kind()), Some(diagnostics))
    }

    fn into_outcome(
        self,
        terminal: TerminalState,
        failure_kind: Option<FailureKind>,
        diagnostics: Option<String>,
    ) -> RunOutcome {
        let duration_ms = self.elapsed_ms();
        RunOutcome {
            run_id: self.id,
            event: self.event,
            fingerprint: self.fingerprint,
            cache_hit: self.cache_hit,
            status: terminal.status(),
            terminal,
            failure_kind,
            artifact_id: self.artifact_id,
            deployed: terminal == TerminalState::Deployed,
            stale: self.stale,
            logs: self.logs,
            diagnostics,
            started_at: self.started_at,
            duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::BuildError;

    #[test]
    fn terminal_states_map_to_exactly_one_status() {
        assert_eq!(TerminalState::Deployed.status(), RunStatus::Success);
        assert_eq!(TerminalState::CheckPassed.status(), RunStatus::Success);
        assert_eq!(TerminalState::SkippedSuperseded.status(), RunStatus::Skipped);
        assert_eq!(TerminalState::Failed.status(), RunStatus::Failure);
    }

    #[test]
    fn only_deployed_terminal_sets_deployed() {
        for terminal in [
            TerminalState::Deployed,
            TerminalState::CheckPassed,
            TerminalState::SkippedSuperseded,
        ] {
            let run = Run::start(TriggerEvent::push("main", "c1", true));
            let outcome = run.finish(terminal);
            assert_eq!(outcome.deployed, terminal == TerminalState::Deployed);
            assert!(outcome.failure_kind.is_none());
        }
    }

    #[test]
    fn failed_run_carries_kind_and_diagnostics() {
        let run = Run::start(TriggerEvent::push("main", "c1", true));
        let err = PipelineError::from(BuildError::Toolchain {
            exit_code: 2,
            diagnostics: "boom".to_string(),
        });
        let outcome = run.fail(&err);
        assert_eq!(outcome.status, RunStatus::Failure);
        assert_eq!(outcome.failure_kind, Some(FailureKind::Build));
        assert!(!outcome.deployed);
        assert!(outcome.diagnostics.unwrap().contains("boom"));
    }

    #[test]
    fn run_ids_are_unique() {
        assert_ne!(RunId::new(), RunId::new());
    }
}
