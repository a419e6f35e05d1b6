//! Trigger control for downstream computations
//!
//! - [`TriggerController`]: per-key `IDLE → PENDING → RUNNING` state machine
//! - [`DownstreamJobs`]: the forecast and sentiment invocations it runs
//! - [`Scheduler`]: the cadence loop driving window closes and dispatch

pub mod controller;
pub mod jobs;
pub mod scheduler;
pub mod state;

pub use controller::{TriggerController, TriggerControllerConfig, TriggerJob};
pub use jobs::{DownstreamJobs, MentionBatch, SeriesSource};
pub use scheduler::{CadenceTask, Scheduler};
pub use state::{TriggerCounts, TriggerKey, TriggerKind, TriggerState};
