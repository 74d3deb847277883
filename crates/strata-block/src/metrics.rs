//! Synchronization metrics.
//!
//! Everything lives under the `blocks_meta` subsystem. Per-state and
//! per-modification counts go through transactional gauge vectors: stages
//! mutate a staging copy during the fetch and the fetcher publishes the
//! whole set atomically at the end, so scrapes never observe the transient
//! zeroes of a refresh in progress.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Total synchronization attempts.
pub const SYNCS_TOTAL: &str = "blocks_meta_syncs_total";

/// Total synchronization failures, including incomplete views.
pub const SYNC_FAILURES_TOTAL: &str = "blocks_meta_sync_failures_total";

/// Synchronization duration in seconds.
///
/// Recommended exporter buckets: 0.01, 1, 10, 100, 1000.
pub const SYNC_DURATION_SECONDS: &str = "blocks_meta_sync_duration_seconds";

/// Per-state block counts of the last completed fetch.
pub const SYNCED: &str = "blocks_meta_synced";

/// Per-kind modification counts of the last completed fetch.
pub const MODIFIED: &str = "blocks_meta_modified";

/// The configured consistency delay in seconds.
pub const CONSISTENCY_DELAY_SECONDS: &str = "consistency_delay_seconds";

/// Registers all metric descriptions.
///
/// Call this once at application startup after installing the metrics
/// recorder.
pub fn register_metrics() {
    describe_counter!(SYNCS_TOTAL, "Total block metadata synchronization attempts");
    describe_counter!(
        SYNC_FAILURES_TOTAL,
        "Total block metadata synchronization failures"
    );
    describe_histogram!(
        SYNC_DURATION_SECONDS,
        "Duration of block metadata synchronization in seconds"
    );
    describe_gauge!(SYNCED, "Number of block metadata synced, by state");
    describe_gauge!(MODIFIED, "Number of block metadata modified, by kind");
    describe_gauge!(
        CONSISTENCY_DELAY_SECONDS,
        "Configured consistency delay in seconds"
    );
}

/// Records a synchronization attempt.
pub(crate) fn record_sync_attempt() {
    counter!(SYNCS_TOTAL).increment(1);
}

/// Records a synchronization failure.
pub(crate) fn record_sync_failure() {
    counter!(SYNC_FAILURES_TOTAL).increment(1);
}

/// Records the duration of a synchronization.
pub(crate) fn record_sync_duration(secs: f64) {
    histogram!(SYNC_DURATION_SECONDS).record(secs);
}

/// Publishes the configured consistency delay.
pub(crate) fn set_consistency_delay(secs: f64) {
    gauge!(CONSISTENCY_DELAY_SECONDS).set(secs);
}

/// Why a block is or is not part of the synced view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncedState {
    /// Loaded and accepted by every filter.
    Loaded,
    /// Descriptor missing from the bucket.
    NoMeta,
    /// Descriptor present but unparseable.
    CorruptedMeta,
    /// Dropped by the consistency delay filter.
    TooFresh,
    /// Descriptor load failed transiently.
    Failed,
    /// Rejected by the label sharding ruleset.
    LabelExcluded,
    /// Outside the configured time window.
    TimeExcluded,
    /// Covered by another block's compaction lineage.
    Duplicate,
    /// Deletion marker older than the grace delay.
    MarkedForDeletion,
}

impl SyncedState {
    /// Every state, used to preset the gauge vector.
    pub const ALL: [SyncedState; 9] = [
        SyncedState::Loaded,
        SyncedState::NoMeta,
        SyncedState::CorruptedMeta,
        SyncedState::TooFresh,
        SyncedState::Failed,
        SyncedState::LabelExcluded,
        SyncedState::TimeExcluded,
        SyncedState::Duplicate,
        SyncedState::MarkedForDeletion,
    ];

    /// The metric label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            SyncedState::Loaded => "loaded",
            SyncedState::NoMeta => "no-meta",
            SyncedState::CorruptedMeta => "corrupted-meta",
            SyncedState::TooFresh => "too-fresh",
            SyncedState::Failed => "failed",
            SyncedState::LabelExcluded => "label-excluded",
            SyncedState::TimeExcluded => "time-excluded",
            SyncedState::Duplicate => "duplicate",
            SyncedState::MarkedForDeletion => "marked-for-deletion",
        }
    }
}

/// What a modifier did to a block that stayed in the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModifiedKind {
    /// A configured replica label was stripped from the external labels.
    ReplicaLabelRemoved,
}

impl ModifiedKind {
    /// Every kind, used to preset the gauge vector.
    pub const ALL: [ModifiedKind; 1] = [ModifiedKind::ReplicaLabelRemoved];

    /// The metric label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ModifiedKind::ReplicaLabelRemoved => "replica-label-removed",
        }
    }
}

/// A gauge vector with transactional publication.
///
/// Mutations touch a staging copy; `submit` swaps staging into the active
/// copy and publishes every value through the metrics recorder in one pass.
/// Declared labels are preset to zero on `reset_tx` so states that did not
/// occur in a cycle still report zero after the commit.
#[derive(Debug)]
pub struct TxGaugeVec {
    name: &'static str,
    label: &'static str,
    preset: &'static [&'static str],
    state: Mutex<TxState>,
}

#[derive(Debug, Default)]
struct TxState {
    staging: HashMap<&'static str, f64>,
    active: HashMap<&'static str, f64>,
}

impl TxGaugeVec {
    /// Creates a gauge vector named `name` with one `label` dimension and
    /// the given preset label values.
    #[must_use]
    pub fn new(name: &'static str, label: &'static str, preset: &'static [&'static str]) -> Self {
        let vec = Self {
            name,
            label,
            preset,
            state: Mutex::new(TxState::default()),
        };
        vec.reset_tx();
        vec
    }

    /// Starts a new transaction: zeroes staging and presets declared labels.
    pub fn reset_tx(&self) {
        let mut state = self.lock();
        state.staging.clear();
        for label in self.preset {
            state.staging.insert(label, 0.0);
        }
    }

    /// Increments a staged value by one.
    pub fn inc(&self, label: &'static str) {
        self.add(label, 1.0);
    }

    /// Adds to a staged value.
    pub fn add(&self, label: &'static str, v: f64) {
        let mut state = self.lock();
        *state.staging.entry(label).or_insert(0.0) += v;
    }

    /// Sets a staged value.
    pub fn set(&self, label: &'static str, v: f64) {
        self.lock().staging.insert(label, v);
    }

    /// Atomically publishes the staged values.
    ///
    /// Labels that were active before but absent from this transaction are
    /// published as zero, so stale states never linger on the recorder.
    pub fn submit(&self) {
        let mut state = self.lock();
        let staged = state.staging.clone();

        for (label, value) in &staged {
            let labels = [(self.label, (*label).to_string())];
            gauge!(self.name, &labels).set(*value);
        }
        for label in state.active.keys() {
            if !staged.contains_key(label) {
                let labels = [(self.label, (*label).to_string())];
                gauge!(self.name, &labels).set(0.0);
            }
        }

        state.active = staged;
    }

    /// Reads a published value. Labels never submitted read zero.
    #[must_use]
    pub fn value(&self, label: &str) -> f64 {
        self.lock().active.get(label).copied().unwrap_or(0.0)
    }

    /// Sum of all published values.
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.lock().active.values().sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The metric set owned by one fetcher instance.
///
/// Each fetcher owns its own staging state, so multiple fetchers coexist in
/// one process (and in tests) without collisions; only the published values
/// meet at the recorder.
#[derive(Debug)]
pub struct SyncMetrics {
    /// Per-state block counts.
    pub synced: TxGaugeVec,
    /// Per-kind modification counts.
    pub modified: TxGaugeVec,
}

const SYNCED_PRESET: [&str; 9] = [
    "loaded",
    "no-meta",
    "corrupted-meta",
    "too-fresh",
    "failed",
    "label-excluded",
    "time-excluded",
    "duplicate",
    "marked-for-deletion",
];

const MODIFIED_PRESET: [&str; 1] = ["replica-label-removed"];

impl SyncMetrics {
    /// Creates the metric set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            synced: TxGaugeVec::new(SYNCED, "state", &SYNCED_PRESET),
            modified: TxGaugeVec::new(MODIFIED, "kind", &MODIFIED_PRESET),
        }
    }

    /// Increments a staged per-state count.
    pub fn inc_synced(&self, state: SyncedState) {
        self.synced.inc(state.as_str());
    }

    /// Sets a staged per-state count.
    pub fn set_synced(&self, state: SyncedState, v: f64) {
        self.synced.set(state.as_str(), v);
    }

    /// Increments a staged per-kind modification count.
    pub fn inc_modified(&self, kind: ModifiedKind) {
        self.modified.inc(kind.as_str());
    }

    /// Reads a published per-state count.
    #[must_use]
    pub fn synced_value(&self, state: SyncedState) -> f64 {
        self.synced.value(state.as_str())
    }

    /// Sum of all published per-state counts.
    #[must_use]
    pub fn synced_sum(&self) -> f64 {
        self.synced.sum()
    }

    /// Reads a published per-kind modification count.
    #[must_use]
    pub fn modified_value(&self, kind: ModifiedKind) -> f64 {
        self.modified.value(kind.as_str())
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}
