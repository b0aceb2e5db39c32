//! Domain types shared by every pipeline component.

pub mod error;
pub mod event;
pub mod run;

pub use error::{BuildError, FailureKind, PipelineError, PromotionError, PublishError, ResolveError};
pub use event::{TriggerEvent, TriggerKind};
pub use run::{RunId, RunOutcome, RunStatus, TerminalState};
pub(crate) use run::Run;
