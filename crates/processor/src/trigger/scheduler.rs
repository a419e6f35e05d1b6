//! Cadence scheduler
//!
//! Drives window-close checks and trigger dispatch on a fixed interval until
//! cancelled. A tick that returns an error stops the loop and cancels the
//! token so the rest of the processor can observe the fatal condition.

use crate::error::ProcessorError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};

/// Periodic work driven by the scheduler
#[async_trait]
pub trait CadenceTask: Send + Sync {
    async fn tick(&self) -> Result<(), ProcessorError>;
}

/// Runs a [`CadenceTask`] every `period`
pub struct Scheduler {
    period: Duration,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(period: Duration, cancel: CancellationToken) -> Self {
        Self { period, cancel }
    }

    /// Loop until cancelled or a tick fails; returns the number of ticks run
    pub async fn run(self, task: Arc<dyn CadenceTask>) -> Result<u64, ProcessorError> {
        info!(period_ms = self.period.as_millis() as u64, "Starting cadence scheduler");

        let mut timer = interval(self.period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = timer.tick() => {}
            }

            ticks += 1;
            trace!(tick = ticks, "Cadence tick");
            if let Err(e) = task.tick().await {
                error!(error = %e, "Cadence tick failed, stopping scheduler");
                self.cancel.cancel();
                return Err(e);
            }
        }

        info!(ticks, "Cadence scheduler stopped");
        Ok(ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SinkWriteError;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingTask {
        ticks: AtomicU64,
        fail_at: Option<u64>,
    }

    #[async_trait]
    impl CadenceTask for CountingTask {
        async fn tick(&self) -> Result<(), ProcessorError> {
            let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
            if Some(tick) == self.fail_at {
                return Err(SinkWriteError::SinkFailed("memory".to_string()).into());
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_until_cancelled() {
        let task = Arc::new(CountingTask {
            ticks: AtomicU64::new(0),
            fail_at: None,
        });
        let cancel = CancellationToken::new();
        let scheduler = Scheduler::new(Duration::from_secs(5), cancel.clone());
        let handle = tokio::spawn(scheduler.run(task.clone()));

        // First tick fires immediately, then every 5s
        tokio::time::sleep(Duration::from_secs(12)).await;
        cancel.cancel();

        let ticks = handle.await.unwrap().unwrap();
        assert_eq!(ticks, 3);
        assert_eq!(task.ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_tick_stops_and_cancels() {
        let task = Arc::new(CountingTask {
            ticks: AtomicU64::new(0),
            fail_at: Some(2),
        });
        let cancel = CancellationToken::new();
        let scheduler = Scheduler::new(Duration::from_secs(1), cancel.clone());

        let result = scheduler.run(task).await;

        assert!(matches!(result, Err(ProcessorError::Sink(_))));
        assert!(cancel.is_cancelled());
    }
}
