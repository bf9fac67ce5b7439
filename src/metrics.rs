//! Engine Metrics and Observability
//!
//! Counters and gauges for one engine, exportable in Prometheus text format,
//! plus the structured tracing helpers shared by the runtime.

use crate::raft::{LogIndex, NodeId, Role, Term};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Engine metrics for Prometheus export.
#[derive(Debug, Clone)]
pub struct EngineMetrics {
    inner: Arc<EngineMetricsInner>,
}

#[derive(Debug)]
struct EngineMetricsInner {
    /// Instance label, usually the listening port
    instance: String,

    // Gauges
    groups: AtomicU64,
    largest_batch: AtomicU64,

    // Counters
    write_rounds: AtomicU64,
    read_rounds: AtomicU64,
    requests_batched: AtomicU64,
    not_leader: AtomicU64,
    persistence_failures: AtomicU64,
    commit_timeouts: AtomicU64,
    read_timeouts: AtomicU64,
    entries_applied: AtomicU64,
    role_changes: AtomicU64,

    // Histograms (Observability)
    #[cfg(feature = "observability")]
    journal_write_duration: Option<prometheus::Histogram>,
    #[cfg(feature = "observability")]
    apply_duration: Option<prometheus::Histogram>,
}

/// Registers a histogram, falling back to an unregistered one when another
/// engine in the process already owns the name.
#[cfg(feature = "observability")]
fn histogram(name: &str, help: &str) -> Option<prometheus::Histogram> {
    prometheus::register_histogram!(name, help, prometheus::DEFAULT_BUCKETS.to_vec())
        .or_else(|_| prometheus::Histogram::with_opts(prometheus::HistogramOpts::new(name, help)))
        .ok()
}

impl EngineMetrics {
    /// Creates a new metrics instance labelled `instance`.
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EngineMetricsInner {
                instance: instance.into(),
                groups: AtomicU64::new(0),
                largest_batch: AtomicU64::new(0),
                write_rounds: AtomicU64::new(0),
                read_rounds: AtomicU64::new(0),
                requests_batched: AtomicU64::new(0),
                not_leader: AtomicU64::new(0),
                persistence_failures: AtomicU64::new(0),
                commit_timeouts: AtomicU64::new(0),
                read_timeouts: AtomicU64::new(0),
                entries_applied: AtomicU64::new(0),
                role_changes: AtomicU64::new(0),
                #[cfg(feature = "observability")]
                journal_write_duration: histogram(
                    "multiraft_journal_write_duration_seconds",
                    "Journal batch write duration in seconds",
                ),
                #[cfg(feature = "observability")]
                apply_duration: histogram(
                    "multiraft_apply_duration_seconds",
                    "State machine apply duration in seconds",
                ),
            }),
        }
    }

    pub fn instance(&self) -> &str {
        &self.inner.instance
    }

    // ========================================================================
    // UPDATES
    // ========================================================================

    pub fn set_groups(&self, count: usize) {
        self.inner.groups.store(count as u64, Ordering::Relaxed);
    }

    /// Records a started write round of `batch` requests.
    pub fn record_write_round(&self, batch: usize) {
        self.inner.write_rounds.fetch_add(1, Ordering::Relaxed);
        self.record_batch(batch);
    }

    /// Records a started read round of `batch` requests.
    pub fn record_read_round(&self, batch: usize) {
        self.inner.read_rounds.fetch_add(1, Ordering::Relaxed);
        self.record_batch(batch);
    }

    fn record_batch(&self, batch: usize) {
        self.inner
            .requests_batched
            .fetch_add(batch as u64, Ordering::Relaxed);
        self.inner
            .largest_batch
            .fetch_max(batch as u64, Ordering::Relaxed);
    }

    pub fn inc_not_leader(&self, count: usize) {
        self.inner.not_leader.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn inc_persistence_failures(&self) {
        self.inner.persistence_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_commit_timeouts(&self) {
        self.inner.commit_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_read_timeouts(&self, count: usize) {
        self.inner.read_timeouts.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn inc_entries_applied(&self, count: usize) {
        self.inner
            .entries_applied
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn inc_role_changes(&self) {
        self.inner.role_changes.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // OBSERVABILITY
    // ========================================================================

    /// Observes a journal batch write duration.
    pub fn observe_journal_write(&self, duration: Duration) {
        let _ = duration;
        #[cfg(feature = "observability")]
        if let Some(histogram) = &self.inner.journal_write_duration {
            histogram.observe(duration.as_secs_f64());
        }
    }

    /// Observes a state machine apply duration.
    pub fn observe_apply(&self, duration: Duration) {
        let _ = duration;
        #[cfg(feature = "observability")]
        if let Some(histogram) = &self.inner.apply_duration {
            histogram.observe(duration.as_secs_f64());
        }
    }

    // ========================================================================
    // GETTERS (for export)
    // ========================================================================

    pub fn groups(&self) -> u64 {
        self.inner.groups.load(Ordering::Relaxed)
    }
    pub fn largest_batch(&self) -> u64 {
        self.inner.largest_batch.load(Ordering::Relaxed)
    }
    pub fn write_rounds(&self) -> u64 {
        self.inner.write_rounds.load(Ordering::Relaxed)
    }
    pub fn read_rounds(&self) -> u64 {
        self.inner.read_rounds.load(Ordering::Relaxed)
    }
    pub fn requests_batched(&self) -> u64 {
        self.inner.requests_batched.load(Ordering::Relaxed)
    }
    pub fn not_leader(&self) -> u64 {
        self.inner.not_leader.load(Ordering::Relaxed)
    }
    pub fn persistence_failures(&self) -> u64 {
        self.inner.persistence_failures.load(Ordering::Relaxed)
    }
    pub fn commit_timeouts(&self) -> u64 {
        self.inner.commit_timeouts.load(Ordering::Relaxed)
    }
    pub fn read_timeouts(&self) -> u64 {
        self.inner.read_timeouts.load(Ordering::Relaxed)
    }
    pub fn entries_applied(&self) -> u64 {
        self.inner.entries_applied.load(Ordering::Relaxed)
    }
    pub fn role_changes(&self) -> u64 {
        self.inner.role_changes.load(Ordering::Relaxed)
    }

    // ========================================================================
    // PROMETHEUS EXPORT
    // ========================================================================

    /// Exports metrics in Prometheus text format.
    pub fn to_prometheus_text(&self) -> String {
        let instance = self.instance();

        let mut output = String::new();

        macro_rules! gauge {
            ($name:expr, $help:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} gauge\n{}{{instance=\"{}\"}} {}\n",
                    $name, $help, $name, $name, instance, $value
                ));
            };
        }

        macro_rules! counter {
            ($name:expr, $help:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} counter\n{}{{instance=\"{}\"}} {}\n",
                    $name, $help, $name, $name, instance, $value
                ));
            };
        }

        gauge!("multiraft_groups", "Groups hosted by this engine", self.groups());
        gauge!(
            "multiraft_largest_batch",
            "Largest number of requests merged into one round",
            self.largest_batch()
        );

        counter!("multiraft_write_rounds_total", "Write rounds started", self.write_rounds());
        counter!("multiraft_read_rounds_total", "Read rounds started", self.read_rounds());
        counter!(
            "multiraft_requests_batched_total",
            "Requests carried by rounds",
            self.requests_batched()
        );
        counter!(
            "multiraft_not_leader_total",
            "Requests rejected because this node does not lead the group",
            self.not_leader()
        );
        counter!(
            "multiraft_persistence_failures_total",
            "Journal writes that failed",
            self.persistence_failures()
        );
        counter!(
            "multiraft_commit_timeouts_total",
            "Writes whose commit wait expired",
            self.commit_timeouts()
        );
        counter!(
            "multiraft_read_timeouts_total",
            "Reads whose barrier expired",
            self.read_timeouts()
        );
        counter!(
            "multiraft_entries_applied_total",
            "Entries handed to state machines",
            self.entries_applied()
        );
        counter!(
            "multiraft_role_changes_total",
            "Role or term changes observed",
            self.role_changes()
        );

        output
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new("local")
    }
}

// ============================================================================
// TRACING HELPERS
// ============================================================================

/// Creates a span scoped to one group.
#[macro_export]
macro_rules! group_span {
    ($name:expr, $identity:expr) => {
        tracing::info_span!($name, group = %$identity)
    };
    ($name:expr, $identity:expr, $($field:tt)*) => {
        tracing::info_span!($name, group = %$identity, $($field)*)
    };
}

/// Records the start of a write or read round.
pub fn trace_round_started(group: &str, kind: &'static str, round: u64, count: usize) {
    tracing::debug!(
        group = group,
        kind = kind,
        round = round,
        count = count,
        event = "round_started",
        "Starting round"
    );
}

/// Records a role transition.
pub fn trace_role_changed(node_id: NodeId, from: Role, to: Role, term: Term) {
    tracing::info!(
        node_id = node_id,
        from = %from,
        to = %to,
        term = term,
        event = "role_changed",
        "Role changed"
    );
}

/// Records commit index advancement.
pub fn trace_commit_advanced(node_id: NodeId, old_index: LogIndex, new_index: LogIndex) {
    tracing::debug!(
        node_id = node_id,
        old_index = old_index,
        new_index = new_index,
        event = "commit_advanced",
        "Advanced commit index"
    );
}

// ============================================================================
// TESTS
// ============================================================================
