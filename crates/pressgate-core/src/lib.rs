//! Pressgate core library
//!
//! Build-and-deploy orchestration for static document sites: fingerprinted
//! dependency caching, toolchain builds with a wall-clock budget, immutable
//! artifacts, and a single-slot deployment gate in front of the live site.

pub mod builder;
pub mod config;
pub mod domain;
pub mod exec;
pub mod fakes;
pub mod fingerprint;
pub mod gate;
pub mod hosting;
pub mod obs;
pub mod orchestrator;
pub mod reporting;
pub mod resolver;
pub mod store;
pub mod telemetry;

pub use builder::{BuildCommand, BuildOutcome, BuildResult, BuildStatus, Builder, CommandBuilder};
pub use config::{ConfigError, PipelineConfig, CONFIG_FILE_NAME};
pub use domain::{
    BuildError, FailureKind, PipelineError, PromotionError, PublishError, ResolveError, RunId,
    RunOutcome, RunStatus, TerminalState, TriggerEvent, TriggerKind,
};
pub use fingerprint::{DependencyManifest, Fingerprint};
pub use gate::{DeployGate, DeployRequest, DeployToken, GateBusy, GateState};
pub use hosting::{DeployAction, Deployment, DirectoryHost, HostingEndpoint};
pub use orchestrator::{Collaborators, Orchestrator, PipelineSettings};
pub use reporting::{read_run_record, render_run_summary_md, write_run_record};
pub use resolver::{CommandResolver, DependencyResolver, ManifestResolver, ResolvedDependencies};
pub use store::{
    Artifact, ArtifactId, ArtifactStore, CacheEntry, CacheStore, FsArtifactStore, FsCacheStore,
    StoreError, StoreResult,
};
pub use telemetry::init_tracing;

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
