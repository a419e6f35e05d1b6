//! Trigger Controller
//!
//! Decides when the expensive downstream computations run and guarantees at
//! most one invocation in flight per [`TriggerKey`].
//!
//! - [`TriggerController::request`] never blocks: it marks a key `PENDING`,
//!   leaves a pending key as is, or flags a running key for a rerun.
//! - [`TriggerController::dispatch_pending`] moves pending keys to `RUNNING`
//!   and spawns their invocations. A semaphore bounds how many run at once
//!   across keys; at most `queue_capacity` more may wait for a permit. Keys
//!   beyond that stay `PENDING` for the next dispatch.
//! - A failed, panicked or cancelled invocation returns its key to `PENDING`.
//! - [`TriggerController::shutdown`] lets running invocations finish; queued
//!   ones return to `PENDING` without running.

use super::state::{TriggerCounts, TriggerKey, TriggerSlot, TriggerState};
use crate::error::TriggerError;
use crate::metrics::{PipelineMetrics, ResultLabel};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Downstream work run for a key
#[async_trait]
pub trait TriggerJob: Send + Sync {
    /// Run the computation for `key`
    ///
    /// `cancel` fires on shutdown. Jobs that produce output in several steps
    /// should check it between steps and return [`TriggerError::Cancelled`]
    /// instead of publishing partial results.
    async fn run(&self, key: &TriggerKey, cancel: &CancellationToken) -> Result<(), TriggerError>;
}

/// Trigger controller configuration
#[derive(Debug, Clone, Copy)]
pub struct TriggerControllerConfig {
    /// Invocations running at once across all keys
    pub max_concurrent: usize,
    /// Dispatched invocations that may wait for a free slot
    pub queue_capacity: usize,
}

impl Default for TriggerControllerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            queue_capacity: 64,
        }
    }
}

enum Outcome {
    Completed,
    Failed(TriggerError),
    Panicked,
    Cancelled,
}

/// Per-key trigger state machine with a bounded execution pool
pub struct TriggerController {
    job: Arc<dyn TriggerJob>,
    config: TriggerControllerConfig,
    slots: DashMap<TriggerKey, TriggerSlot>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    settled: Notify,
    epoch: AtomicU64,
    /// Dispatched and not yet finished
    outstanding: AtomicI64,
    /// Holding a permit
    executing: AtomicI64,
    metrics: Arc<PipelineMetrics>,
}

impl TriggerController {
    pub fn new(
        job: Arc<dyn TriggerJob>,
        config: TriggerControllerConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            job,
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            config,
            slots: DashMap::new(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            settled: Notify::new(),
            epoch: AtomicU64::new(0),
            outstanding: AtomicI64::new(0),
            executing: AtomicI64::new(0),
            metrics,
        }
    }

    /// Signal that `key` has new work
    pub fn request(&self, key: &TriggerKey) -> TriggerState {
        let mut slot = self.slots.entry(key.clone()).or_default();
        match slot.state {
            TriggerState::Idle => {
                slot.transition(TriggerState::Pending);
                debug!(key = %key, "Trigger pending");
            }
            TriggerState::Pending => {}
            TriggerState::Running => slot.rerun_requested = true,
        }
        let state = slot.state;
        drop(slot);
        self.update_pending_gauge();
        state
    }

    /// Current state of `key`; unknown keys are idle
    pub fn state(&self, key: &TriggerKey) -> TriggerState {
        self.slots.get(key).map_or(TriggerState::Idle, |slot| slot.state)
    }

    /// Completed invocations of `key`
    pub fn runs(&self, key: &TriggerKey) -> u64 {
        self.slots.get(key).map_or(0, |slot| slot.runs)
    }

    /// Failed or panicked invocations of `key`
    pub fn failures(&self, key: &TriggerKey) -> u64 {
        self.slots.get(key).map_or(0, |slot| slot.failures)
    }

    pub fn counts(&self) -> TriggerCounts {
        let mut counts = TriggerCounts::default();
        for slot in self.slots.iter() {
            match slot.state {
                TriggerState::Idle => counts.idle += 1,
                TriggerState::Pending => counts.pending += 1,
                TriggerState::Running => counts.running += 1,
            }
        }
        counts
    }

    /// Invocations dispatched and not yet finished
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire).max(0) as usize
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Dispatch every pending key the pool has room for
    pub fn dispatch_pending(self: &Arc<Self>) -> usize {
        self.dispatch(None)
    }

    fn dispatch(self: &Arc<Self>, skip_failed_in: Option<u64>) -> usize {
        if self.cancel.is_cancelled() {
            return 0;
        }

        let limit = self.config.max_concurrent + self.config.queue_capacity;
        let room = limit.saturating_sub(self.outstanding());
        if room == 0 {
            return 0;
        }

        let mut candidates: Vec<TriggerKey> = self
            .slots
            .iter()
            .filter(|slot| slot.state == TriggerState::Pending)
            .filter(|slot| skip_failed_in.map_or(true, |epoch| slot.failed_epoch != Some(epoch)))
            .map(|slot| slot.key().clone())
            .collect();
        candidates.sort();

        let mut dispatched = 0;
        for key in candidates.into_iter().take(room) {
            // Recheck under the entry lock; another dispatcher may have won
            let claimed = match self.slots.get_mut(&key) {
                Some(mut slot) if slot.state == TriggerState::Pending => {
                    slot.rerun_requested = false;
                    slot.transition(TriggerState::Running)
                }
                _ => false,
            };
            if !claimed {
                continue;
            }

            self.outstanding.fetch_add(1, Ordering::AcqRel);
            let this = Arc::clone(self);
            self.tracker.spawn(async move { this.execute(key).await });
            dispatched += 1;
        }

        if dispatched > 0 {
            self.update_pending_gauge();
        }
        dispatched
    }

    async fn execute(self: Arc<Self>, key: TriggerKey) {
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            self.finish(&key, Outcome::Cancelled);
            return;
        };

        let executing = self.executing.fetch_add(1, Ordering::AcqRel) + 1;
        self.metrics.set_triggers_in_flight(executing);
        debug!(key = %key, "Running trigger");

        let result = AssertUnwindSafe(self.job.run(&key, &self.cancel))
            .catch_unwind()
            .await;

        let executing = self.executing.fetch_sub(1, Ordering::AcqRel) - 1;
        self.metrics.set_triggers_in_flight(executing);
        drop(permit);

        let outcome = match result {
            Ok(Ok(())) => Outcome::Completed,
            Ok(Err(TriggerError::Cancelled)) => Outcome::Cancelled,
            Ok(Err(e)) => Outcome::Failed(e),
            Err(_) => Outcome::Panicked,
        };
        self.finish(&key, outcome);
    }

    fn finish(&self, key: &TriggerKey, outcome: Outcome) {
        let epoch = self.epoch.load(Ordering::Acquire);
        {
            let mut slot = self.slots.entry(key.clone()).or_default();
            let rerun = std::mem::take(&mut slot.rerun_requested);
            match outcome {
                Outcome::Completed => {
                    slot.runs += 1;
                    let next = if rerun {
                        TriggerState::Pending
                    } else {
                        TriggerState::Idle
                    };
                    slot.transition(next);
                    self.metrics
                        .record_trigger_invocation(key.kind, ResultLabel::Success);
                    debug!(key = %key, next = %next, "Trigger completed");
                }
                Outcome::Failed(e) => {
                    slot.failures += 1;
                    slot.failed_epoch = Some(epoch);
                    slot.transition(TriggerState::Pending);
                    self.metrics
                        .record_trigger_invocation(key.kind, ResultLabel::Failure);
                    warn!(key = %key, error = %e, "Trigger failed, will retry");
                }
                Outcome::Panicked => {
                    slot.failures += 1;
                    slot.failed_epoch = Some(epoch);
                    slot.transition(TriggerState::Pending);
                    self.metrics
                        .record_trigger_invocation(key.kind, ResultLabel::Panicked);
                    error!(key = %key, "Trigger panicked, will retry");
                }
                Outcome::Cancelled => {
                    slot.transition(TriggerState::Pending);
                    self.metrics
                        .record_trigger_invocation(key.kind, ResultLabel::Cancelled);
                    debug!(key = %key, "Trigger cancelled");
                }
            }
        }

        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.update_pending_gauge();
        self.settled.notify_waiters();
    }

    /// Run pending work until every key is idle or has failed during this drain
    ///
    /// A key whose invocation fails is left `PENDING` and not retried by the
    /// same drain, so a persistently failing function cannot stall it.
    pub async fn drain(self: &Arc<Self>) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        loop {
            let settled = self.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            let dispatched = self.dispatch(Some(epoch));
            if dispatched == 0 && self.outstanding() == 0 {
                break;
            }
            settled.await;
        }

        let counts = self.counts();
        debug!(
            idle = counts.idle,
            pending = counts.pending,
            running = counts.running,
            "Trigger drain finished"
        );
    }

    /// Stop dispatching, let running invocations finish, revert queued ones
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        let counts = self.counts();
        info!(
            pending = counts.pending,
            "Trigger controller stopped"
        );
    }

    fn update_pending_gauge(&self) {
        let pending = self
            .slots
            .iter()
            .filter(|slot| slot.state == TriggerState::Pending)
            .count();
        self.metrics.set_triggers_pending(pending as i64);
    }
}
