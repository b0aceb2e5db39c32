//! Run records and human-facing summaries.

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::domain::{RunOutcome, TerminalState};
use crate::store::StoreResult;

/// Persist `outcome` as `<dir>/<run_id>.json` (pretty JSON). Returns the path.
pub fn write_run_record(dir: &Path, outcome: &RunOutcome) -> StoreResult<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.json", outcome.run_id));
    let content = serde_json::to_vec_pretty(outcome)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&content)?;
    tmp.persist(&path).map_err(|e| e.error)?;
    Ok(path)
}

/// Load a record written by [`write_run_record`].
pub fn read_run_record(path: &Path) -> StoreResult<RunOutcome> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn headline(outcome: &RunOutcome) -> &'static str {
    match outcome.terminal {
        TerminalState::Deployed => "✓ Deployed",
        TerminalState::CheckPassed => "✓ Check passed",
        TerminalState::SkippedSuperseded => "↷ Skipped (deployment already in flight)",
        TerminalState::Failed => "✗ Failed",
    }
}

/// Render a short markdown block for a pull-request status check.
pub fn render_run_summary_md(outcome: &RunOutcome) -> String {
    let mut out = String::new();
    out.push_str(&format!("### {}\n\n", headline(outcome)));
    out.push_str(&format!(
        "- trigger: `{}` on `{}` @ `{}`\n",
        outcome.event.kind, outcome.event.branch, outcome.event.commit
    ));
    out.push_str(&format!("- run: `{}`\n", outcome.run_id));
    if let Some(fp) = &outcome.fingerprint {
        let cache = if outcome.cache_hit { "hit" } else { "miss" };
        out.push_str(&format!("- dependencies: `{}` (cache {})\n", fp.short(), cache));
    }
    if let Some(id) = &outcome.artifact_id {
        out.push_str(&format!("- artifact: `{}`\n", id));
    }
    if outcome.stale {
        out.push_str("- note: a newer commit was pushed to this branch during the run\n");
    }
    out.push_str(&format!("- duration: {} ms\n", outcome.duration_ms));

    if let Some(diag) = &outcome.diagnostics {
        out.push_str("\n<details><summary>Diagnostics</summary>\n\n```text\n");
        out.push_str(diag.trim_end());
        out.push_str("\n```\n\n</details>\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BuildError, PipelineError, Run, TriggerEvent};

    fn failed_outcome() -> RunOutcome {
        let mut run = Run::start(TriggerEvent::pull_request("feature/x", "deadbeef", false));
        run.log("build started");
        run.fail(&PipelineError::from(BuildError::Toolchain {
            exit_code: 1,
            diagnostics: "error: chapter_3.md not found".to_string(),
        }))
    }

    #[test]
    fn record_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = failed_outcome();
        let path = write_run_record(dir.path(), &outcome).unwrap();
        assert_eq!(path.file_name().unwrap().to_string_lossy(), format!("{}.json", outcome.run_id));

        let loaded = read_run_record(&path).unwrap();
        assert_eq!(loaded.run_id, outcome.run_id);
        assert_eq!(loaded.terminal, TerminalState::Failed);
        assert_eq!(loaded.logs, vec!["build started".to_string()]);
    }

    #[test]
    fn record_uses_snake_case_states() {
        let outcome = failed_outcome();
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failure");
        assert_eq!(json["terminal"], "failed");
        assert_eq!(json["failure_kind"], "build");
        assert_eq!(json["deployed"], false);
    }

    #[test]
    fn summary_includes_verbatim_diagnostics() {
        let md = render_run_summary_md(&failed_outcome());
        assert!(md.starts_with("### ✗ Failed"));
        assert!(md.contains("`pull_request` on `feature/x` @ `deadbeef`"));
        assert!(md.contains("error: chapter_3.md not found"));
    }

    #[test]
    fn check_passed_summary_has_no_diagnostics() {
        let run = Run::start(TriggerEvent::manual("main", "c1", true));
        let md = render_run_summary_md(&run.finish(TerminalState::CheckPassed));
        assert!(md.contains("Check passed"));
        assert!(!md.contains("Diagnostics"));
    }
}
