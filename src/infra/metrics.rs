//! Gateway counters, histograms and the periodic summary
//!
//! Counters are plain atomics updated from the bus workers, the correlator
//! and the store; `report()` takes a snapshot and resets the per-window
//! dispatch latency data.
//!
//! All atomics use Relaxed ordering: they are statistics only and never
//! gate control flow.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Dispatch latency bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Session duration bucket boundaries (milliseconds), press to commit/abort
/// Buckets: ≤250, ≤500, ≤1000, ≤2000, ≤4000, ≤8000, ≤16000, ≤32000, ≤64000, ≤128000, >128000 ms
const SESSION_MS_BOUNDS: [u64; 10] =
    [250, 500, 1000, 2000, 4000, 8000, 16000, 32000, 64000, 128000];

#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

#[inline]
fn session_bucket_index(duration_ms: u64) -> usize {
    SESSION_MS_BOUNDS.partition_point(|&bound| bound < duration_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Compute percentile from dispatch latency buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    // Event bus
    events_published: AtomicU64,
    events_dispatched: AtomicU64,
    events_since_report: AtomicU64,
    dispatch_latency_sum_us: AtomicU64,
    dispatch_latency_max_us: AtomicU64,
    dispatch_latency_buckets: [AtomicU64; NUM_BUCKETS],
    events_dropped_queue_full: AtomicU64,
    events_malformed: AtomicU64,
    handler_failures: AtomicU64,
    handler_timeouts: AtomicU64,

    // Signal conditioning
    presses_accepted: AtomicU64,
    presses_debounced: AtomicU64,
    proximity_edges: AtomicU64,
    signals_dropped: AtomicU64,

    // Sessions
    sessions_started: AtomicU64,
    sessions_committed: AtomicU64,
    sessions_aborted: AtomicU64,
    presses_ignored_active: AtomicU64,
    stale_results: AtomicU64,
    /// Session duration histogram (cumulative, never reset)
    session_duration_buckets: [AtomicU64; NUM_BUCKETS],
    session_duration_sum_ms: AtomicU64,

    // Camera and recognition
    captures_ok: AtomicU64,
    captures_failed: AtomicU64,
    camera_busy_retries: AtomicU64,
    recognition_attempts: AtomicU64,
    recognition_transient_failures: AtomicU64,
    recognition_permanent_failures: AtomicU64,
    recognition_fallbacks: AtomicU64,

    // Inventory and notifications
    items_present: AtomicU64,
    snapshot_failures: AtomicU64,
    notifications_sent: AtomicU64,
    subscribers_dropped: AtomicU64,

    /// Current bus intake queue depth (updated by dispatcher)
    bus_queue_depth: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            events_published: AtomicU64::new(0),
            events_dispatched: AtomicU64::new(0),
            events_since_report: AtomicU64::new(0),
            dispatch_latency_sum_us: AtomicU64::new(0),
            dispatch_latency_max_us: AtomicU64::new(0),
            dispatch_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            events_dropped_queue_full: AtomicU64::new(0),
            events_malformed: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            handler_timeouts: AtomicU64::new(0),
            presses_accepted: AtomicU64::new(0),
            presses_debounced: AtomicU64::new(0),
            proximity_edges: AtomicU64::new(0),
            signals_dropped: AtomicU64::new(0),
            sessions_started: AtomicU64::new(0),
            sessions_committed: AtomicU64::new(0),
            sessions_aborted: AtomicU64::new(0),
            presses_ignored_active: AtomicU64::new(0),
            stale_results: AtomicU64::new(0),
            session_duration_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            session_duration_sum_ms: AtomicU64::new(0),
            captures_ok: AtomicU64::new(0),
            captures_failed: AtomicU64::new(0),
            camera_busy_retries: AtomicU64::new(0),
            recognition_attempts: AtomicU64::new(0),
            recognition_transient_failures: AtomicU64::new(0),
            recognition_permanent_failures: AtomicU64::new(0),
            recognition_fallbacks: AtomicU64::new(0),
            items_present: AtomicU64::new(0),
            snapshot_failures: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            subscribers_dropped: AtomicU64::new(0),
            bus_queue_depth: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    // --- Event bus ---

    #[inline]
    pub fn record_event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an event handed to its handlers, with queue-to-dispatch latency (lock-free)
    #[inline]
    pub fn record_event_dispatched(&self, latency_us: u64) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
        self.events_since_report.fetch_add(1, Ordering::Relaxed);
        self.dispatch_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.dispatch_latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.dispatch_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_event_dropped(&self) {
        self.events_dropped_queue_full.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_malformed(&self) {
        self.events_malformed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_handler_timeout(&self) {
        self.handler_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_bus_queue_depth(&self, depth: u64) {
        self.bus_queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    pub fn events_malformed(&self) -> u64 {
        self.events_malformed.load(Ordering::Relaxed)
    }

    pub fn handler_failures(&self) -> u64 {
        self.handler_failures.load(Ordering::Relaxed)
    }

    // --- Signals ---

    #[inline]
    pub fn record_press_accepted(&self) {
        self.presses_accepted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_press_debounced(&self) {
        self.presses_debounced.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_proximity_edge(&self) {
        self.proximity_edges.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_signal_dropped(&self) {
        self.signals_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn presses_debounced(&self) -> u64 {
        self.presses_debounced.load(Ordering::Relaxed)
    }

    // --- Sessions ---

    #[inline]
    pub fn record_session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_committed(&self, duration_ms: u64) {
        self.sessions_committed.fetch_add(1, Ordering::Relaxed);
        self.record_session_duration(duration_ms);
    }

    #[inline]
    pub fn record_session_aborted(&self, duration_ms: u64) {
        self.sessions_aborted.fetch_add(1, Ordering::Relaxed);
        self.record_session_duration(duration_ms);
    }

    fn record_session_duration(&self, duration_ms: u64) {
        self.session_duration_buckets[session_bucket_index(duration_ms)]
            .fetch_add(1, Ordering::Relaxed);
        self.session_duration_sum_ms.fetch_add(duration_ms, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_press_ignored(&self) {
        self.presses_ignored_active.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_stale_result(&self) {
        self.stale_results.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sessions_started(&self) -> u64 {
        self.sessions_started.load(Ordering::Relaxed)
    }

    pub fn sessions_committed(&self) -> u64 {
        self.sessions_committed.load(Ordering::Relaxed)
    }

    pub fn sessions_aborted(&self) -> u64 {
        self.sessions_aborted.load(Ordering::Relaxed)
    }

    pub fn presses_ignored(&self) -> u64 {
        self.presses_ignored_active.load(Ordering::Relaxed)
    }

    // --- Camera / recognition ---

    #[inline]
    pub fn record_capture(&self, ok: bool) {
        if ok {
            self.captures_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.captures_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_camera_busy_retry(&self) {
        self.camera_busy_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_recognition_attempt(&self) {
        self.recognition_attempts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_recognition_failure(&self, transient: bool) {
        if transient {
            self.recognition_transient_failures.fetch_add(1, Ordering::Relaxed);
        } else {
            self.recognition_permanent_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_recognition_fallback(&self) {
        self.recognition_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recognition_attempts(&self) -> u64 {
        self.recognition_attempts.load(Ordering::Relaxed)
    }

    pub fn recognition_fallbacks(&self) -> u64 {
        self.recognition_fallbacks.load(Ordering::Relaxed)
    }

    pub fn camera_busy_retries(&self) -> u64 {
        self.camera_busy_retries.load(Ordering::Relaxed)
    }

    // --- Inventory / notifications ---

    pub fn set_items_present(&self, count: u64) {
        self.items_present.store(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_snapshot_failure(&self) {
        self.snapshot_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_sent(&self) {
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_subscriber_dropped(&self) {
        self.subscribers_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscribers_dropped(&self) -> u64 {
        self.subscribers_dropped.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let events_count = self.events_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.dispatch_latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.dispatch_latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.dispatch_latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let events_per_sec = if elapsed.as_secs_f64() > 0.0 {
            events_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_latency = if events_count > 0 { latency_sum / events_count } else { 0 };

        let session_duration_buckets = load_buckets(&self.session_duration_buckets);
        let session_count: u64 = session_duration_buckets.iter().sum();
        let session_duration_sum_ms = self.session_duration_sum_ms.load(Ordering::Relaxed);
        let session_avg_ms =
            if session_count > 0 { session_duration_sum_ms / session_count } else { 0 };

        MetricsSummary {
            events_published: self.events_published.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            events_per_sec,
            avg_dispatch_latency_us: avg_latency,
            max_dispatch_latency_us: max_latency,
            lat_buckets,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            events_dropped_queue_full: self.events_dropped_queue_full.load(Ordering::Relaxed),
            events_malformed: self.events_malformed.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            handler_timeouts: self.handler_timeouts.load(Ordering::Relaxed),
            presses_accepted: self.presses_accepted.load(Ordering::Relaxed),
            presses_debounced: self.presses_debounced.load(Ordering::Relaxed),
            proximity_edges: self.proximity_edges.load(Ordering::Relaxed),
            signals_dropped: self.signals_dropped.load(Ordering::Relaxed),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_committed: self.sessions_committed.load(Ordering::Relaxed),
            sessions_aborted: self.sessions_aborted.load(Ordering::Relaxed),
            presses_ignored_active: self.presses_ignored_active.load(Ordering::Relaxed),
            stale_results: self.stale_results.load(Ordering::Relaxed),
            session_duration_buckets,
            session_duration_sum_ms,
            session_avg_ms,
            captures_ok: self.captures_ok.load(Ordering::Relaxed),
            captures_failed: self.captures_failed.load(Ordering::Relaxed),
            camera_busy_retries: self.camera_busy_retries.load(Ordering::Relaxed),
            recognition_attempts: self.recognition_attempts.load(Ordering::Relaxed),
            recognition_transient_failures: self
                .recognition_transient_failures
                .load(Ordering::Relaxed),
            recognition_permanent_failures: self
                .recognition_permanent_failures
                .load(Ordering::Relaxed),
            recognition_fallbacks: self.recognition_fallbacks.load(Ordering::Relaxed),
            items_present: self.items_present.load(Ordering::Relaxed),
            snapshot_failures: self.snapshot_failures.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            subscribers_dropped: self.subscribers_dropped.load(Ordering::Relaxed),
            bus_queue_depth: self.bus_queue_depth.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_SESSION_MS_BOUNDS: [u64; 10] = SESSION_MS_BOUNDS;
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub events_published: u64,
    pub events_dispatched: u64,
    pub events_per_sec: f64,
    pub avg_dispatch_latency_us: u64,
    pub max_dispatch_latency_us: u64,
    /// Queue-to-dispatch latency histogram (reset on report)
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p99_us: u64,
    pub events_dropped_queue_full: u64,
    pub events_malformed: u64,
    pub handler_failures: u64,
    pub handler_timeouts: u64,
    pub presses_accepted: u64,
    pub presses_debounced: u64,
    pub proximity_edges: u64,
    pub signals_dropped: u64,
    pub sessions_started: u64,
    pub sessions_committed: u64,
    pub sessions_aborted: u64,
    /// Presses ignored because their channel already had a session
    pub presses_ignored_active: u64,
    pub stale_results: u64,
    /// Session duration histogram (cumulative)
    pub session_duration_buckets: [u64; NUM_BUCKETS],
    pub session_duration_sum_ms: u64,
    pub session_avg_ms: u64,
    pub captures_ok: u64,
    pub captures_failed: u64,
    pub camera_busy_retries: u64,
    pub recognition_attempts: u64,
    pub recognition_transient_failures: u64,
    pub recognition_permanent_failures: u64,
    pub recognition_fallbacks: u64,
    pub items_present: u64,
    pub snapshot_failures: u64,
    pub notifications_sent: u64,
    pub subscribers_dropped: u64,
    pub bus_queue_depth: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            events = %self.events_dispatched,
            events_per_sec = format!("{:.1}", self.events_per_sec),
            p99_us = %self.lat_p99_us,
            dropped = %self.events_dropped_queue_full,
            malformed = %self.events_malformed,
            handler_failures = %self.handler_failures,
            sessions_started = %self.sessions_started,
            committed = %self.sessions_committed,
            aborted = %self.sessions_aborted,
            fallbacks = %self.recognition_fallbacks,
            items = %self.items_present,
            "metrics"
        );
    }
}
