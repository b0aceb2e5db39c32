//! Builder: runs the external rendering toolchain over the document corpus.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::BuildError;
use crate::exec::{command_from_argv, run_with_budget, ExecError};
use crate::resolver::ResolvedDependencies;
use crate::store::tree::is_non_empty_dir;

/// Coarse build status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Success,
    Failure,
}

#[derive(Debug)]
pub enum BuildOutcome {
    Success { output_root: PathBuf },
    Failure(BuildError),
}

/// Result of one build. The output root is present iff the build succeeded.
#[derive(Debug)]
pub struct BuildResult {
    pub outcome: BuildOutcome,
    /// Toolchain output, verbatim.
    pub logs: String,
    pub duration_ms: u64,
}

impl BuildResult {
    pub fn success(output_root: PathBuf, logs: String, duration_ms: u64) -> Self {
        Self {
            outcome: BuildOutcome::Success { output_root },
            logs,
            duration_ms,
        }
    }

    pub fn failure(error: BuildError, logs: String, duration_ms: u64) -> Self {
        Self {
            outcome: BuildOutcome::Failure(error),
            logs,
            duration_ms,
        }
    }

    pub fn status(&self) -> BuildStatus {
        match self.outcome {
            BuildOutcome::Success { .. } => BuildStatus::Success,
            BuildOutcome::Failure(_) => BuildStatus::Failure,
        }
    }

    pub fn output_root(&self) -> Option<&Path> {
        match &self.outcome {
            BuildOutcome::Success { output_root } => Some(output_root),
            BuildOutcome::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&BuildError> {
        match &self.outcome {
            BuildOutcome::Failure(e) => Some(e),
            BuildOutcome::Success { .. } => None,
        }
    }
}

/// Renders the corpus. Must not mutate `corpus_root`.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(&self, corpus_root: &Path, deps: &ResolvedDependencies) -> BuildResult;

    /// Release scratch space held by a result once it has been published.
    async fn discard(&self, _result: &BuildResult) {}
}

/// Toolchain invocation template.
///
/// Arguments may contain `{corpus}`, `{output}` and `{deps}`, replaced with
/// the corpus root, the fresh output directory and the resolved-dependency
/// file respectively.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildCommand {
    pub argv: Vec<String>,
}

impl BuildCommand {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    /// `mdbook build {corpus} --dest-dir {output}`
    pub fn mdbook() -> Self {
        Self::new(vec![
            "mdbook".to_string(),
            "build".to_string(),
            "{corpus}".to_string(),
            "--dest-dir".to_string(),
            "{output}".to_string(),
        ])
    }

    pub fn render(&self, corpus: &Path, output: &Path, deps: &Path) -> Vec<String> {
        self.argv
            .iter()
            .map(|arg| {
                arg.replace("{corpus}", &corpus.to_string_lossy())
                    .replace("{output}", &output.to_string_lossy())
                    .replace("{deps}", &deps.to_string_lossy())
            })
            .collect()
    }
}

/// Runs the configured toolchain as a child process.
///
/// Each build gets `<scratch_root>/<uuid>/` holding `deps.bin` and the output
/// directory `site/`. The toolchain also sees `PRESSGATE_CORPUS`,
/// `PRESSGATE_OUTPUT`, `PRESSGATE_DEPS_FILE` and `PRESSGATE_DEPS_FINGERPRINT`.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    command: BuildCommand,
    scratch_root: PathBuf,
    budget: Duration,
}

impl CommandBuilder {
    pub fn new(command: BuildCommand, scratch_root: impl Into<PathBuf>, budget: Duration) -> Self {
        Self {
            command,
            scratch_root: scratch_root.into(),
            budget,
        }
    }

    fn budget_ms(&self) -> u64 {
        self.budget.as_millis() as u64
    }
}

#[async_trait]
impl Builder for CommandBuilder {
    async fn build(&self, corpus_root: &Path, deps: &ResolvedDependencies) -> BuildResult {
        let start = Instant::now();
        let elapsed = |start: Instant| start.elapsed().as_millis() as u64;

        let work_dir = self.scratch_root.join(uuid::Uuid::new_v4().to_string());
        let output = work_dir.join("site");
        let deps_file = work_dir.join("deps.bin");

        if let Err(e) = tokio::fs::create_dir_all(&work_dir).await {
            let err = BuildError::Spawn(format!("cannot create scratch dir {}: {e}", work_dir.display()));
            return BuildResult::failure(err, String::new(), elapsed(start));
        }
        if let Err(e) = tokio::fs::write(&deps_file, &deps.payload).await {
            let err = BuildError::Spawn(format!("cannot write {}: {e}", deps_file.display()));
            return BuildResult::failure(err, String::new(), elapsed(start));
        }

        let argv = self.command.render(corpus_root, &output, &deps_file);
        debug!(command = ?argv, "invoking toolchain");
        let mut cmd = match command_from_argv(&argv) {
            Ok(cmd) => cmd,
            Err(e) => return BuildResult::failure(BuildError::Spawn(e.to_string()), String::new(), elapsed(start)),
        };
        cmd.current_dir(corpus_root)
            .env("PRESSGATE_CORPUS", corpus_root)
            .env("PRESSGATE_OUTPUT", &output)
            .env("PRESSGATE_DEPS_FILE", &deps_file)
            .env("PRESSGATE_DEPS_FINGERPRINT", deps.fingerprint.as_str());

        match run_with_budget(cmd, Some(self.budget)).await {
            Ok(out) => {
                let logs = out.combined_output();
                if !out.success {
                    let err = BuildError::Toolchain {
                        exit_code: out.exit_code,
                        diagnostics: logs.clone(),
                    };
                    return BuildResult::failure(err, logs, out.duration_ms);
                }
                if !is_non_empty_dir(&output) {
                    let err = BuildError::InvalidOutput(format!(
                        "toolchain exited successfully but {} is missing or empty",
                        output.display()
                    ));
                    return BuildResult::failure(err, logs, out.duration_ms);
                }
                BuildResult::success(output, logs, out.duration_ms)
            }
            Err(ExecError::TimedOut { pid, output, .. }) => {
                let err = BuildError::Timeout {
                    budget_ms: self.budget_ms(),
                    pid,
                    diagnostics: output.clone(),
                };
                BuildResult::failure(err, output, elapsed(start))
            }
            Err(e) => BuildResult::failure(BuildError::Spawn(e.to_string()), String::new(), elapsed(start)),
        }
    }

    async fn discard(&self, result: &BuildResult) {
        let Some(work_dir) = result.output_root().and_then(Path::parent) else {
            return;
        };
        if !work_dir.starts_with(&self.scratch_root) {
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(work_dir).await {
            warn!(dir = %work_dir.display(), error = %e, "failed to remove build scratch dir");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;

    fn deps() -> ResolvedDependencies {
        ResolvedDependencies {
            fingerprint: Fingerprint::compute([("book.toml", b"x".as_slice())]),
            payload: b"{\"mdbook\":\"0.4\"}".to_vec(),
            restored: false,
        }
    }

    fn sh(script: &str) -> BuildCommand {
        BuildCommand::new(vec!["sh".into(), "-c".into(), script.into()])
    }

    #[test]
    fn render_substitutes_placeholders() {
        let argv = BuildCommand::mdbook().render(
            Path::new("/book"),
            Path::new("/out/site"),
            Path::new("/out/deps.bin"),
        );
        assert_eq!(argv, vec!["mdbook", "build", "/book", "--dest-dir", "/out/site"]);
    }

    #[test]
    fn result_output_root_present_iff_success() {
        let ok = BuildResult::success(PathBuf::from("/x"), String::new(), 1);
        assert_eq!(ok.status(), BuildStatus::Success);
        assert!(ok.output_root().is_some());
        assert!(ok.error().is_none());

        let failed = BuildResult::failure(BuildError::InvalidOutput("x".into()), String::new(), 1);
        assert_eq!(failed.status(), BuildStatus::Failure);
        assert!(failed.output_root().is_none());
        assert!(failed.error().is_some());
    }

    #[tokio::test]
    async fn successful_build_produces_output_and_leaves_corpus_alone() {
        let corpus = tempfile::tempdir().unwrap();
        std::fs::write(corpus.path().join("intro.md"), "# Intro").unwrap();
        let scratch = tempfile::tempdir().unwrap();

        let builder = CommandBuilder::new(
            sh("mkdir -p \"$PRESSGATE_OUTPUT\" && cp \"$PRESSGATE_CORPUS\"/intro.md \"$PRESSGATE_OUTPUT\"/index.html && echo rendered"),
            scratch.path(),
            Duration::from_secs(10),
        );
        let result = builder.build(corpus.path(), &deps()).await;
        assert_eq!(result.status(), BuildStatus::Success, "{:?}", result.error());
        let out = result.output_root().unwrap();
        assert_eq!(std::fs::read_to_string(out.join("index.html")).unwrap(), "# Intro");
        assert!(result.logs.contains("rendered"));

        let corpus_entries: Vec<_> = std::fs::read_dir(corpus.path()).unwrap().collect();
        assert_eq!(corpus_entries.len(), 1);

        builder.discard(&result).await;
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn deps_payload_is_available_to_toolchain() {
        let corpus = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let builder = CommandBuilder::new(
            sh("mkdir -p {output} && cp {deps} {output}/deps.json"),
            scratch.path(),
            Duration::from_secs(10),
        );
        let result = builder.build(corpus.path(), &deps()).await;
        let out = result.output_root().expect("success");
        assert_eq!(std::fs::read(out.join("deps.json")).unwrap(), deps().payload);
    }

    #[tokio::test]
    async fn failing_toolchain_surfaces_diagnostics_verbatim() {
        let corpus = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let builder = CommandBuilder::new(
            sh("echo 'ERROR: chapter not found: intro.md' >&2; exit 101"),
            scratch.path(),
            Duration::from_secs(10),
        );
        let result = builder.build(corpus.path(), &deps()).await;
        match result.error() {
            Some(BuildError::Toolchain { exit_code, diagnostics }) => {
                assert_eq!(*exit_code, 101);
                assert_eq!(diagnostics, "ERROR: chapter not found: intro.md\n");
            }
            other => panic!("expected Toolchain error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_output_is_invalid() {
        let corpus = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let builder = CommandBuilder::new(sh("true"), scratch.path(), Duration::from_secs(10));
        let result = builder.build(corpus.path(), &deps()).await;
        assert!(matches!(result.error(), Some(BuildError::InvalidOutput(_))));
    }

    #[tokio::test]
    async fn missing_toolchain_is_spawn_error() {
        let corpus = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let builder = CommandBuilder::new(
            BuildCommand::new(vec!["pressgate-no-such-renderer".into()]),
            scratch.path(),
            Duration::from_secs(10),
        );
        let result = builder.build(corpus.path(), &deps()).await;
        assert!(matches!(result.error(), Some(BuildError::Spawn(_))));
    }
}
