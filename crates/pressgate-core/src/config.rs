//! Pipeline configuration.
//!
//! Config lives in `pressgate.toml` next to the document corpus. Environment
//! variables with a `PRESSGATE_` prefix override file values, which override
//! defaults. Relative paths resolve against the config file's directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = "pressgate.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("failed to open {what}: {reason}")]
    Open { what: &'static str, reason: String },
}

/// Top-level config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub pipeline: PipelineSection,

    #[serde(default)]
    pub resolve: ResolveSection,

    #[serde(default)]
    pub build: BuildSection,

    #[serde(default)]
    pub publish: PublishSection,

    #[serde(default)]
    pub deploy: DeploySection,
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Document corpus root.
    #[serde(default = "default_corpus")]
    pub corpus: PathBuf,

    /// Dependency manifests, in fingerprint order.
    #[serde(default = "default_manifests")]
    pub manifests: Vec<PathBuf>,

    /// Cache, artifacts, scratch space and run records live here.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_main_branch")]
    pub main_branch: String,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            corpus: default_corpus(),
            manifests: default_manifests(),
            state_dir: default_state_dir(),
            main_branch: default_main_branch(),
        }
    }
}

fn default_corpus() -> PathBuf {
    PathBuf::from(".")
}
fn default_manifests() -> Vec<PathBuf> {
    vec![PathBuf::from("book.toml")]
}
fn default_state_dir() -> PathBuf {
    PathBuf::from(".pressgate")
}
fn default_main_branch() -> String {
    "main".into()
}

/// `[resolve]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveSection {
    /// Resolver argv; stdout becomes the cached payload. Pins are read from
    /// the manifests when unset.
    #[serde(default)]
    pub command: Option<Vec<String>>,

    #[serde(default = "default_resolve_timeout")]
    pub timeout_secs: u64,
}

impl Default for ResolveSection {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: default_resolve_timeout(),
        }
    }
}

fn default_resolve_timeout() -> u64 {
    300
}

/// `[build]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSection {
    /// Toolchain argv with `{corpus}`, `{output}`, `{deps}` placeholders.
    #[serde(default = "default_build_command")]
    pub command: Vec<String>,

    #[serde(default = "default_build_timeout")]
    pub timeout_secs: u64,
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            command: default_build_command(),
            timeout_secs: default_build_timeout(),
        }
    }
}

fn default_build_command() -> Vec<String> {
    crate::builder::BuildCommand::mdbook().argv
}
fn default_build_timeout() -> u64 {
    600
}

/// `[publish]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishSection {
    #[serde(default = "default_publish_attempts")]
    pub max_attempts: u32,

    /// First retry delay; doubles on each further attempt.
    #[serde(default = "default_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Budget per upload attempt.
    #[serde(default = "default_publish_timeout")]
    pub timeout_secs: u64,
}

impl Default for PublishSection {
    fn default() -> Self {
        Self {
            max_attempts: default_publish_attempts(),
            initial_backoff_ms: default_backoff_ms(),
            timeout_secs: default_publish_timeout(),
        }
    }
}

fn default_publish_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    500
}
fn default_publish_timeout() -> u64 {
    300
}

/// `[deploy]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySection {
    /// Hosting root holding the `live` pointer.
    #[serde(default = "default_site_dir")]
    pub site_dir: PathBuf,

    #[serde(default = "default_deploy_timeout")]
    pub timeout_secs: u64,

    /// After a deployment, promote the newest request that found the gate busy.
    #[serde(default)]
    pub honor_pending: bool,
}

impl Default for DeploySection {
    fn default() -> Self {
        Self {
            site_dir: default_site_dir(),
            timeout_secs: default_deploy_timeout(),
            honor_pending: false,
        }
    }
}

fn default_site_dir() -> PathBuf {
    PathBuf::from(".pressgate/site")
}
fn default_deploy_timeout() -> u64 {
    120
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl PipelineConfig {
    /// Load from `path`, apply `PRESSGATE_*` environment overrides, resolve
    /// relative paths against the file's directory and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&text, base, |key| std::env::var(key).ok())
    }

    /// Load `path` if it exists, otherwise start from defaults rooted at the
    /// current directory.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Self::from_toml_str("", Path::new("."), |key| std::env::var(key).ok())
        }
    }

    /// Parse `text` with an explicit environment lookup (for tests).
    pub fn from_toml_str(
        text: &str,
        base_dir: &Path,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config: PipelineConfig = toml::from_str(text)?;
        config.apply_env(env)?;
        config.resolve_paths(base_dir);
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = env("PRESSGATE_STATE_DIR") {
            self.pipeline.state_dir = PathBuf::from(v);
        }
        if let Some(v) = env("PRESSGATE_MAIN_BRANCH") {
            self.pipeline.main_branch = v;
        }
        if let Some(v) = env("PRESSGATE_BUILD_TIMEOUT_SECS") {
            self.build.timeout_secs = v
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("PRESSGATE_BUILD_TIMEOUT_SECS={v} is not a number")))?;
        }
        if let Some(v) = env("PRESSGATE_SITE_DIR") {
            self.deploy.site_dir = PathBuf::from(v);
        }
        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        let abs = |p: &Path| if p.is_absolute() { p.to_path_buf() } else { base.join(p) };
        self.pipeline.corpus = abs(&self.pipeline.corpus);
        self.pipeline.state_dir = abs(&self.pipeline.state_dir);
        self.pipeline.manifests = self.pipeline.manifests.iter().map(|p| abs(p)).collect();
        self.deploy.site_dir = abs(&self.deploy.site_dir);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.build.command.is_empty() {
            return Err(ConfigError::Invalid("build.command must not be empty".into()));
        }
        if matches!(&self.resolve.command, Some(cmd) if cmd.is_empty()) {
            return Err(ConfigError::Invalid("resolve.command must not be empty when set".into()));
        }
        if self.pipeline.manifests.is_empty() {
            return Err(ConfigError::Invalid("pipeline.manifests must list at least one file".into()));
        }
        if self.pipeline.main_branch.trim().is_empty() {
            return Err(ConfigError::Invalid("pipeline.main_branch must not be empty".into()));
        }
        for (name, secs) in [
            ("resolve.timeout_secs", self.resolve.timeout_secs),
            ("build.timeout_secs", self.build.timeout_secs),
            ("publish.timeout_secs", self.publish.timeout_secs),
            ("deploy.timeout_secs", self.deploy.timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }
        if self.publish.max_attempts == 0 {
            return Err(ConfigError::Invalid("publish.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.pipeline.state_dir.join("cache")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.pipeline.state_dir.join("artifacts")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.pipeline.state_dir.join("scratch")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.pipeline.state_dir.join("runs")
    }

    pub fn build_budget(&self) -> Duration {
        Duration::from_secs(self.build.timeout_secs)
    }

    pub fn is_main_branch(&self, branch: &str) -> bool {
        branch == self.pipeline.main_branch
    }
}
