//! Deployment gate: at most one promotion in flight per process.
//!
//! The gate is a single atomic state word advanced by compare-and-swap:
//!
//! ```text
//! Idle -> Acquiring -> Deploying -> Idle
//!                              \-> Failed -> Idle
//! ```
//!
//! `try_acquire` never blocks. A request that finds the gate held gets
//! [`GateBusy`] and is remembered as the *pending* request, replacing any older
//! pending one; an in-flight deployment is never cancelled or preempted.
//! The returned [`DeployToken`] releases the gate when dropped, so the slot
//! cannot leak past the end of a promotion attempt, whatever its outcome.
//!
//! A holder that honors pending requests ends with [`DeployToken::hand_off`],
//! which takes the pending request or releases the slot under one lock. A
//! busy request is queued under that same lock only while the gate is still
//! held, so it is either handed off or retried against an idle gate, never
//! stranded.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::RunId;
use crate::store::ArtifactId;

const IDLE: u8 = 0;
const ACQUIRING: u8 = 1;
const DEPLOYING: u8 = 2;
const FAILED: u8 = 3;

/// Observable gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Idle,
    Acquiring,
    Deploying,
    Failed,
}

impl GateState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            ACQUIRING => GateState::Acquiring,
            DEPLOYING => GateState::Deploying,
            FAILED => GateState::Failed,
            _ => GateState::Idle,
        }
    }
}

/// A request to promote one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRequest {
    pub run_id: RunId,
    pub commit: String,
    pub artifact_id: ArtifactId,
    pub requested_at: DateTime<Utc>,
}

impl DeployRequest {
    pub fn new(run_id: RunId, commit: impl Into<String>, artifact_id: ArtifactId) -> Self {
        Self {
            run_id,
            commit: commit.into(),
            artifact_id,
            requested_at: Utc::now(),
        }
    }
}

/// Returned by [`DeployGate::try_acquire`] while another deployment holds the gate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("deployment gate busy (held by run {holder:?})")]
pub struct GateBusy {
    pub holder: Option<RunId>,
}

/// Process-wide deployment slot. Share it as `Arc<DeployGate>`.
#[derive(Debug, Default)]
pub struct DeployGate {
    state: AtomicU8,
    holder: Mutex<Option<RunId>>,
    pending: Mutex<Option<DeployRequest>>,
    acquisitions: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DeployGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the slot without waiting. A busy request becomes the
    /// pending request.
    pub fn try_acquire(self: &Arc<Self>, request: DeployRequest) -> Result<DeployToken, GateBusy> {
        self.acquire(request, true)
    }

    /// Like [`try_acquire`](Self::try_acquire), but a busy request is not
    /// remembered. Used for operator actions such as rollback.
    pub fn try_acquire_untracked(
        self: &Arc<Self>,
        request: DeployRequest,
    ) -> Result<DeployToken, GateBusy> {
        self.acquire(request, false)
    }

    fn acquire(self: &Arc<Self>, request: DeployRequest, remember: bool) -> Result<DeployToken, GateBusy> {
        loop {
            if self
                .state
                .compare_exchange(IDLE, ACQUIRING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                *lock(&self.holder) = Some(request.run_id.clone());
                // Anything queued before this run started is now superseded.
                if let Some(dropped) = lock(&self.pending).take() {
                    debug!(run_id = %dropped.run_id, "pending deploy request superseded by new holder");
                }
                self.acquisitions.fetch_add(1, Ordering::Relaxed);
                return Ok(DeployToken {
                    gate: Arc::clone(self),
                    request,
                    released: false,
                });
            }

            let holder = lock(&self.holder).clone();
            if !remember {
                return Err(GateBusy { holder });
            }
            let mut pending = lock(&self.pending);
            if self.state.load(Ordering::Acquire) == IDLE {
                // Released between the CAS and taking the lock.
                continue;
            }
            if let Some(dropped) = pending.replace(request) {
                info!(
                    event = "deploy.request_dropped",
                    run_id = %dropped.run_id,
                    commit = %dropped.commit,
                    "older pending deploy request superseded"
                );
            }
            return Err(GateBusy { holder });
        }
    }

    pub fn state(&self) -> GateState {
        GateState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn is_idle(&self) -> bool {
        self.state() == GateState::Idle
    }

    /// The most recent request that found the gate busy, if any.
    pub fn pending(&self) -> Option<DeployRequest> {
        lock(&self.pending).clone()
    }

    /// Take the pending request; it is handed out at most once.
    pub fn take_pending(&self) -> Option<DeployRequest> {
        lock(&self.pending).take()
    }

    /// Total successful acquisitions since creation.
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    fn release(&self) {
        *lock(&self.holder) = None;
        self.state.store(IDLE, Ordering::Release);
    }
}

/// Proof of holding the deployment slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct DeployToken {
    gate: Arc<DeployGate>,
    request: DeployRequest,
    released: bool,
}

impl DeployToken {
    pub fn request(&self) -> &DeployRequest {
        &self.request
    }

    /// `Acquiring -> Deploying`
    pub fn begin_deploying(&self) {
        self.gate.state.store(DEPLOYING, Ordering::Release);
    }

    /// `Deploying -> Failed`. The slot is still released on drop.
    pub fn mark_failed(&self) {
        self.gate.state.store(FAILED, Ordering::Release);
    }

    /// Keep the slot for the pending request, or release it if there is none.
    ///
    /// On `Some` the returned token holds the slot on behalf of the pending
    /// run, already `Deploying`.
    pub fn hand_off(mut self) -> Option<(DeployToken, DeployRequest)> {
        let gate = Arc::clone(&self.gate);
        let mut pending = lock(&gate.pending);
        match pending.take() {
            Some(next) => {
                *lock(&gate.holder) = Some(next.run_id.clone());
                gate.state.store(DEPLOYING, Ordering::Release);
                self.request = next.clone();
                Some((self, next))
            }
            None => {
                gate.release();
                self.released = true;
                None
            }
        }
    }
}

impl Drop for DeployToken {
    fn drop(&mut self) {
        if !self.released {
            self.gate.release();
        }
    }
}
