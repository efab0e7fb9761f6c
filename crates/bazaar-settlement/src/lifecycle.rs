//! Process lifecycle: the in-flight action set and the job overlap guard.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::SettlementError;

#[derive(Debug, Default)]
struct Inflight {
    closing: bool,
    ids: Vec<String>,
}

/// Tracks long-running actions so shutdown can wait for them.
///
/// Once closing, [`begin`](Self::begin) refuses new work with
/// [`SettlementError::ShuttingDown`].
pub struct ActionTracker {
    state: watch::Sender<Inflight>,
}

impl ActionTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { state: watch::Sender::new(Inflight::default()) })
    }

    pub fn begin(self: &Arc<Self>, id: impl Into<String>) -> Result<InflightGuard, SettlementError> {
        let id = id.into();
        let mut accepted = false;
        self.state.send_if_modified(|s| {
            if s.closing {
                return false;
            }
            s.ids.push(id.clone());
            accepted = true;
            true
        });
        if !accepted {
            return Err(SettlementError::ShuttingDown);
        }
        Ok(InflightGuard { tracker: self.clone(), id })
    }

    pub fn is_closing(&self) -> bool {
        self.state.borrow().closing
    }

    pub fn inflight(&self) -> Vec<String> {
        self.state.borrow().ids.clone()
    }

    /// Resolves once shutdown has begun.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| s.closing).await;
    }

    /// Stop accepting work and wait up to `grace` for in-flight actions.
    ///
    /// Returns `false` if actions were still running when `grace` elapsed.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.state.send_modify(|s| s.closing = true);
        let mut rx = self.state.subscribe();
        let drained = matches!(
            tokio::time::timeout(grace, rx.wait_for(|s| s.ids.is_empty())).await,
            Ok(Ok(_))
        );
        if drained {
            info!("all in-flight actions drained");
        } else {
            warn!(remaining = ?self.inflight(), secs = grace.as_secs(), "shutdown grace elapsed");
        }
        drained
    }
}

/// Removes its action from the in-flight set on drop.
pub struct InflightGuard {
    tracker: Arc<ActionTracker>,
    id: String,
}

impl InflightGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let id = &self.id;
        self.tracker.state.send_modify(|s| {
            if let Some(pos) = s.ids.iter().position(|x| x == id) {
                s.ids.swap_remove(pos);
            }
        });
    }
}

/// Keeps a recurring job from overlapping itself within this process.
///
/// Does not serialize request-triggered work; the state machine's guarded
/// transitions do that.
pub struct JobLock {
    name: &'static str,
    running: AtomicBool,
}

impl JobLock {
    pub const fn new(name: &'static str) -> Self {
        Self { name, running: AtomicBool::new(false) }
    }

    pub fn try_acquire(&self) -> Result<JobGuard<'_>, SettlementError> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SettlementError::AlreadyRunning(self.name))?;
        Ok(JobGuard { lock: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

pub struct JobGuard<'a> {
    lock: &'a JobLock,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        self.lock.running.store(false, Ordering::Release);
    }
}
