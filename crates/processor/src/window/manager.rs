//! Window lifecycle management
//!
//! The `WindowManager` owns every live window of one family:
//! - Assigns events to windows and creates windows lazily per partition key
//! - Applies the lateness admission rule against the stream watermark
//! - Closes windows whose lateness tolerance has expired, or all of them on flush
//! - Keeps a bounded history of closed windows per key
//!
//! Each partition key has its own lock, so updates for different keys never
//! contend. Updates for one key are applied in the order they acquire that
//! lock.
//!
//! # Example
//!
//! ```rust
//! use processor::aggregation::{AggregateStats, IncrementalAggregator};
//! use processor::metrics::PipelineMetrics;
//! use processor::watermark::Watermark;
//! use processor::window::{TumblingWindowAssigner, WindowFamily, WindowManager};
//! use chrono::{Duration, Utc};
//! use prometheus_client::registry::Registry;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let metrics = Arc::new(PipelineMetrics::new(&mut Registry::default()));
//! let manager: WindowManager<AggregateStats> = WindowManager::new(
//!     WindowFamily::AnomalyStats,
//!     Arc::new(TumblingWindowAssigner::new(Duration::minutes(30))),
//!     Duration::minutes(5),
//!     Arc::new(Watermark::new("sales")),
//!     metrics,
//! );
//!
//! let updated = manager
//!     .apply("A", Utc::now(), |_, stats| IncrementalAggregator::accumulate(stats, 5.0))
//!     .await?;
//! let closed = manager.close_expired().await;
//! # Ok(())
//! # }
//! ```

use super::{WindowAssigner, WindowBounds, WindowFamily, WindowRef, WindowState};
use crate::error::WindowError;
use crate::metrics::PipelineMetrics;
use crate::watermark::Watermark;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// Per-window state maintained by a window manager
pub trait WindowAccumulator: Clone + Send + 'static {
    /// Empty accumulator for a newly created window
    fn create(window_ref: &WindowRef) -> Self;
}

/// A live window
#[derive(Debug, Clone)]
pub struct Window<S> {
    pub window_ref: WindowRef,
    pub state: WindowState,
    pub accumulator: S,
    /// Number of events admitted
    pub event_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl<S: WindowAccumulator> Window<S> {
    fn new(window_ref: WindowRef) -> Self {
        let now = Utc::now();
        Self {
            accumulator: S::create(&window_ref),
            window_ref,
            state: WindowState::Open,
            event_count: 0,
            created_at: now,
            last_update: now,
        }
    }

    fn advance_state(&mut self, to: WindowState) {
        if self.state.can_transition_to(to) {
            trace!(window = %self.window_ref, from = %self.state, to = %to, "Window state changed");
            self.state = to;
        }
    }
}

/// Frozen snapshot of a window after it closed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedWindow<S> {
    pub window_ref: WindowRef,
    pub accumulator: S,
    pub event_count: u64,
    pub closed_at: DateTime<Utc>,
}

/// Windows of one partition key
struct PartitionWindows<S> {
    /// Live windows keyed by start millis
    live: BTreeMap<i64, Window<S>>,
    /// Largest end (millis) of any window closed for this key
    closed_through: Option<i64>,
    history: VecDeque<ClosedWindow<S>>,
}

impl<S> PartitionWindows<S> {
    fn new() -> Self {
        Self {
            live: BTreeMap::new(),
            closed_through: None,
            history: VecDeque::new(),
        }
    }

    fn is_closed(&self, bounds: &WindowBounds) -> bool {
        self.closed_through
            .map_or(false, |through| bounds.end_millis() <= through)
    }
}

/// Summary of one manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStats {
    pub family: WindowFamily,
    pub active_windows: usize,
    pub partitions: usize,
    pub watermark: Option<DateTime<Utc>>,
}

/// Manager for the windows of one family
pub struct WindowManager<S: WindowAccumulator> {
    family: WindowFamily,
    assigner: Arc<dyn WindowAssigner>,
    lateness: Duration,
    retained_history: usize,
    watermark: Arc<Watermark>,
    partitions: DashMap<String, Arc<Mutex<PartitionWindows<S>>>>,
    active_windows: AtomicI64,
    metrics: Arc<PipelineMetrics>,
}

impl<S: WindowAccumulator> WindowManager<S> {
    /// Create a window manager that keeps no closed-window history
    pub fn new(
        family: WindowFamily,
        assigner: Arc<dyn WindowAssigner>,
        lateness: Duration,
        watermark: Arc<Watermark>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            family,
            assigner,
            lateness,
            retained_history: 0,
            watermark,
            partitions: DashMap::new(),
            active_windows: AtomicI64::new(0),
            metrics,
        }
    }

    /// Keep the last `count` closed windows per key
    pub fn with_retained_history(mut self, count: usize) -> Self {
        self.retained_history = count;
        self
    }

    pub fn family(&self) -> WindowFamily {
        self.family
    }

    pub fn assigner(&self) -> &Arc<dyn WindowAssigner> {
        &self.assigner
    }

    pub fn lateness(&self) -> Duration {
        self.lateness
    }

    pub fn watermark(&self) -> &Arc<Watermark> {
        &self.watermark
    }

    fn partition(&self, key: &str) -> Arc<Mutex<PartitionWindows<S>>> {
        if let Some(partition) = self.partitions.get(key) {
            return Arc::clone(partition.value());
        }
        Arc::clone(
            self.partitions
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(PartitionWindows::new())))
                .value(),
        )
    }

    /// Windows that would receive an event at `event_time`, creating them if needed
    ///
    /// Nothing is folded in, so the windows' event counts are left alone;
    /// the event is counted by the `update_window` call that follows.
    pub async fn assign(
        &self,
        key: &str,
        event_time: DateTime<Utc>,
    ) -> Result<Vec<WindowRef>, WindowError> {
        self.admit(key, event_time, false, |window_ref, _| window_ref.clone())
            .await
    }

    /// Admit an event and run `update` on every window that accepts it
    ///
    /// Admission, lazy creation and the update happen under the partition
    /// lock, so `update` observes the accumulator exactly as the previous
    /// accepted event left it. A window accepts the event unless it is
    /// CLOSED at the current watermark or was already closed by a flush.
    /// When no window accepts it the event is late-dropped.
    pub async fn apply<R, F>(
        &self,
        key: &str,
        event_time: DateTime<Utc>,
        update: F,
    ) -> Result<Vec<R>, WindowError>
    where
        F: FnMut(&WindowRef, &mut S) -> R,
    {
        self.admit(key, event_time, true, update).await
    }

    async fn admit<R, F>(
        &self,
        key: &str,
        event_time: DateTime<Utc>,
        count_event: bool,
        mut update: F,
    ) -> Result<Vec<R>, WindowError>
    where
        F: FnMut(&WindowRef, &mut S) -> R,
    {
        let watermark = self.watermark.current_millis();
        let candidates = self.assigner.assign_windows(event_time);

        let partition = self.partition(key);
        let mut partition = partition.lock().await;
        let mut results = Vec::with_capacity(candidates.len());

        for bounds in candidates {
            let state = WindowState::at(&bounds, self.lateness, watermark);
            if !state.accepts_events() || partition.is_closed(&bounds) {
                continue;
            }

            let window = partition.live.entry(bounds.start_millis()).or_insert_with(|| {
                let window_ref = WindowRef::new(self.family, key, bounds);
                debug!(
                    window = %window_ref,
                    window_start = %bounds.start,
                    window_end = %bounds.end,
                    "Created new window"
                );
                self.metrics.record_window_created(self.family);
                let active = self.active_windows.fetch_add(1, Ordering::Relaxed) + 1;
                self.metrics.set_windows_active(self.family, active);
                Window::new(window_ref)
            });

            window.advance_state(state);
            if count_event {
                window.event_count += 1;
                window.last_update = Utc::now();
            }
            results.push(update(&window.window_ref, &mut window.accumulator));
        }

        if results.is_empty() {
            self.metrics.record_late_rejection(self.family);
            let watermark = self.watermark.current();
            warn!(
                family = %self.family,
                partition_key = %key,
                event_time = %event_time,
                watermark = ?watermark,
                "Event is too late, dropping"
            );
            return Err(WindowError::LateDropped {
                family: self.family,
                partition_key: key.to_string(),
                event_time,
                watermark,
            });
        }

        trace!(
            family = %self.family,
            partition_key = %key,
            event_time = %event_time,
            window_count = results.len(),
            "Assigned event to windows"
        );
        Ok(results)
    }

    /// Run `update` on the accumulator of a specific live window
    pub async fn update_window<R, F>(&self, window_ref: &WindowRef, update: F) -> Result<R, WindowError>
    where
        F: FnOnce(&mut S) -> R,
    {
        let not_found = || WindowError::WindowNotFound(window_ref.to_string());
        if window_ref.family != self.family {
            return Err(not_found());
        }
        let partition = match self.partitions.get(&window_ref.partition_key) {
            Some(partition) => Arc::clone(partition.value()),
            None => return Err(not_found()),
        };
        let mut partition = partition.lock().await;

        let state = WindowState::at(
            &window_ref.bounds,
            self.lateness,
            self.watermark.current_millis(),
        );
        if !state.accepts_events() || partition.is_closed(&window_ref.bounds) {
            return Err(WindowError::WindowClosed(window_ref.to_string()));
        }

        let window = partition
            .live
            .get_mut(&window_ref.bounds.start_millis())
            .filter(|w| w.window_ref.bounds == window_ref.bounds)
            .ok_or_else(not_found)?;
        window.advance_state(state);
        window.event_count += 1;
        window.last_update = Utc::now();
        Ok(update(&mut window.accumulator))
    }

    /// Current lifecycle state of a window, `None` if it never existed
    pub async fn window_state(&self, window_ref: &WindowRef) -> Option<WindowState> {
        let partition = Arc::clone(self.partitions.get(&window_ref.partition_key)?.value());
        let partition = partition.lock().await;
        if partition.live.contains_key(&window_ref.bounds.start_millis()) {
            Some(WindowState::at(
                &window_ref.bounds,
                self.lateness,
                self.watermark.current_millis(),
            ))
        } else if partition.is_closed(&window_ref.bounds) {
            Some(WindowState::Closed)
        } else {
            None
        }
    }

    /// Copy of a live window's accumulator
    pub async fn snapshot(&self, window_ref: &WindowRef) -> Option<S> {
        let partition = Arc::clone(self.partitions.get(&window_ref.partition_key)?.value());
        let partition = partition.lock().await;
        partition
            .live
            .get(&window_ref.bounds.start_millis())
            .map(|w| w.accumulator.clone())
    }

    /// Live windows of a key, ordered by start
    pub async fn live_windows(&self, key: &str) -> Vec<Window<S>> {
        let Some(partition) = self.partitions.get(key).map(|p| Arc::clone(p.value())) else {
            return Vec::new();
        };
        let partition = partition.lock().await;
        partition.live.values().cloned().collect()
    }

    /// Retained closed windows of a key, oldest first
    pub async fn history(&self, key: &str) -> Vec<ClosedWindow<S>> {
        let Some(partition) = self.partitions.get(key).map(|p| Arc::clone(p.value())) else {
            return Vec::new();
        };
        let partition = partition.lock().await;
        partition.history.iter().cloned().collect()
    }

    /// Close every window whose lateness tolerance has expired
    pub async fn close_expired(&self) -> Vec<ClosedWindow<S>> {
        let Some(watermark) = self.watermark.current_millis() else {
            return Vec::new();
        };
        let lateness = self.lateness;
        self.close_where(|bounds| {
            WindowState::at(bounds, lateness, Some(watermark)) == WindowState::Closed
        })
        .await
    }

    /// Close every live window regardless of the watermark
    pub async fn flush_all(&self) -> Vec<ClosedWindow<S>> {
        self.close_where(|_| true).await
    }

    async fn close_where<P>(&self, should_close: P) -> Vec<ClosedWindow<S>>
    where
        P: Fn(&WindowBounds) -> bool,
    {
        let watermark = self.watermark.current_millis();
        let partitions: Vec<_> = self
            .partitions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut closed = Vec::new();
        for partition in partitions {
            let mut partition = partition.lock().await;
            let expired: Vec<i64> = partition
                .live
                .iter()
                .filter(|(_, w)| should_close(&w.window_ref.bounds))
                .map(|(start, _)| *start)
                .collect();

            for start in expired {
                let Some(mut window) = partition.live.remove(&start) else {
                    continue;
                };
                window.advance_state(WindowState::Closed);
                let end = window.window_ref.bounds.end_millis();
                partition.closed_through = Some(partition.closed_through.map_or(end, |c| c.max(end)));

                let snapshot = ClosedWindow {
                    window_ref: window.window_ref,
                    accumulator: window.accumulator,
                    event_count: window.event_count,
                    closed_at: Utc::now(),
                };
                debug!(
                    window = %snapshot.window_ref,
                    event_count = snapshot.event_count,
                    "Closed window"
                );

                if self.retained_history > 0 {
                    partition.history.push_back(snapshot.clone());
                    while partition.history.len() > self.retained_history {
                        partition.history.pop_front();
                    }
                }
                closed.push(snapshot);
            }

            for window in partition.live.values_mut() {
                window.advance_state(WindowState::at(
                    &window.window_ref.bounds,
                    self.lateness,
                    watermark,
                ));
            }
        }

        if !closed.is_empty() {
            let active = self
                .active_windows
                .fetch_sub(closed.len() as i64, Ordering::Relaxed)
                - closed.len() as i64;
            self.metrics.set_windows_active(self.family, active);
            for _ in &closed {
                self.metrics.record_window_closed(self.family);
            }
        }

        closed.sort_by(|a, b| {
            (a.window_ref.bounds.end, &a.window_ref.partition_key)
                .cmp(&(b.window_ref.bounds.end, &b.window_ref.partition_key))
        });
        closed
    }

    /// Number of live windows across all keys
    pub fn active_window_count(&self) -> usize {
        self.active_windows.load(Ordering::Relaxed).max(0) as usize
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            family: self.family,
            active_windows: self.active_window_count(),
            partitions: self.partitions.len(),
            watermark: self.watermark.current(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::{SlidingWindowAssigner, TumblingWindowAssigner};
    use chrono::TimeZone;
    use prometheus_client::registry::Registry;

    #[derive(Debug, Clone, PartialEq)]
    struct Counter(u64);

    impl WindowAccumulator for Counter {
        fn create(_: &WindowRef) -> Self {
            Counter(0)
        }
    }

    fn create_timestamp(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    fn tumbling(size_ms: i64, lateness_ms: i64) -> WindowManager<Counter> {
        WindowManager::new(
            WindowFamily::Forecast,
            Arc::new(TumblingWindowAssigner::new(Duration::milliseconds(size_ms))),
            Duration::milliseconds(lateness_ms),
            Arc::new(Watermark::new("sales")),
            Arc::new(PipelineMetrics::new(&mut Registry::default())),
        )
    }

    async fn add(manager: &WindowManager<Counter>, key: &str, millis: i64) -> Result<Vec<u64>, WindowError> {
        manager
            .apply(key, create_timestamp(millis), |_, c| {
                c.0 += 1;
                c.0
            })
            .await
    }

    #[tokio::test]
    async fn test_window_manager_basic() {
        let manager = tumbling(1_000, 0);

        let windows = manager.assign("A", create_timestamp(500)).await.unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].bounds.start, create_timestamp(0));
        assert_eq!(manager.active_window_count(), 1);

        assert_eq!(add(&manager, "A", 600).await.unwrap(), vec![1]);
        assert_eq!(add(&manager, "A", 700).await.unwrap(), vec![2]);
        assert_eq!(add(&manager, "B", 700).await.unwrap(), vec![1]);
        assert_eq!(manager.active_window_count(), 2);
        assert_eq!(manager.stats().partitions, 2);
    }

    #[tokio::test]
    async fn test_window_manager_sliding_windows() {
        let manager: WindowManager<Counter> = WindowManager::new(
            WindowFamily::AnomalyStats,
            Arc::new(SlidingWindowAssigner::new(
                Duration::milliseconds(1_000),
                Duration::milliseconds(500),
            )),
            Duration::zero(),
            Arc::new(Watermark::new("sales")),
            Arc::new(PipelineMetrics::new(&mut Registry::default())),
        );

        let windows = manager.assign("A", create_timestamp(700)).await.unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(manager.active_window_count(), 2);
    }

    #[tokio::test]
    async fn test_lateness_boundary_is_inclusive() {
        // Window [0, 1000) with 500ms lateness: open to late events until the
        // watermark passes 1500.
        let manager = tumbling(1_000, 500);
        add(&manager, "A", 100).await.unwrap();

        manager.watermark().advance(create_timestamp(1_500));
        assert_eq!(add(&manager, "A", 999).await.unwrap(), vec![2]);

        manager.watermark().advance(create_timestamp(1_501));
        let result = add(&manager, "A", 999).await;
        assert!(matches!(result, Err(WindowError::LateDropped { .. })));
    }

    #[tokio::test]
    async fn test_close_expired_and_late_drop_after_close() {
        let manager = tumbling(1_000, 100).with_retained_history(2);
        add(&manager, "A", 100).await.unwrap();
        add(&manager, "A", 1_100).await.unwrap();

        manager.watermark().advance(create_timestamp(1_050));
        assert!(manager.close_expired().await.is_empty());
        let first = WindowRef::new(
            WindowFamily::Forecast,
            "A",
            WindowBounds::from_millis(0, 1_000).unwrap(),
        );
        assert_eq!(manager.window_state(&first).await, Some(WindowState::Closing));

        manager.watermark().advance(create_timestamp(1_101));
        let closed = manager.close_expired().await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].window_ref, first);
        assert_eq!(closed[0].accumulator, Counter(1));
        assert_eq!(manager.active_window_count(), 1);
        assert_eq!(manager.window_state(&first).await, Some(WindowState::Closed));

        assert!(add(&manager, "A", 500).await.is_err());
        assert_eq!(manager.history("A").await.len(), 1);
    }

    #[tokio::test]
    async fn test_flush_closes_everything() {
        let manager = tumbling(1_000, 0);
        add(&manager, "A", 100).await.unwrap();
        add(&manager, "B", 2_100).await.unwrap();

        let closed = manager.flush_all().await;
        assert_eq!(closed.len(), 2);
        assert!(closed[0].window_ref.bounds.end <= closed[1].window_ref.bounds.end);
        assert_eq!(manager.active_window_count(), 0);

        // A flushed window never reopens even though the watermark allows it
        assert!(add(&manager, "A", 200).await.is_err());
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let manager = tumbling(1_000, 0).with_retained_history(2);
        for i in 0..4 {
            add(&manager, "A", i * 1_000 + 10).await.unwrap();
        }
        manager.flush_all().await;

        let history = manager.history("A").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].window_ref.bounds.start, create_timestamp(2_000));
        assert_eq!(history[1].window_ref.bounds.start, create_timestamp(3_000));
    }

    #[tokio::test]
    async fn test_update_window() {
        let manager = tumbling(1_000, 0);
        let window = manager.assign("A", create_timestamp(10)).await.unwrap().remove(0);

        let count = manager
            .update_window(&window, |c| {
                c.0 += 5;
                c.0
            })
            .await
            .unwrap();
        assert_eq!(count, 5);
        assert_eq!(manager.snapshot(&window).await, Some(Counter(5)));

        let closed = manager.flush_all().await;
        assert_eq!(closed.len(), 1);
        // assign only located the window; the update is the one event
        assert_eq!(closed[0].event_count, 1);
        assert_eq!(
            manager.update_window(&window, |c| c.0).await,
            Err(WindowError::WindowClosed(window.to_string()))
        );

        let missing = WindowRef::new(
            WindowFamily::Forecast,
            "Z",
            WindowBounds::from_millis(0, 1_000).unwrap(),
        );
        assert!(matches!(
            manager.update_window(&missing, |c| c.0).await,
            Err(WindowError::WindowNotFound(_))
        ));
    }
}
