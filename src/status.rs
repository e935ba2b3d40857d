//! Progress tracking for long-running composite requests.
//!
//! A [`RequestStatus`] is handed to every branch of a running pipeline;
//! branches bump the processed counter as units of work complete and
//! append partial results as they arrive, so an HTTP layer polling the
//! registry can report progress before the pipeline finishes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::stats::{rank_records, summarize, EnrichmentRecord, EnrichmentSummary};

/// Standard deviations kept by the dropoff filter when summarizing
/// accumulated enrichment ranks.
const ENRICHMENT_DROPOFF_SDS: f64 = 1.0;

#[derive(Default)]
struct StatusInner {
    phase: String,
    processed: u64,
    total: u64,
    finished: bool,
    results: Value,
    partials: Vec<Value>,
    enrichment: Vec<EnrichmentRecord>,
    summary: EnrichmentSummary,
}

/// Cheaply cloneable progress handle shared across pipeline branches.
#[derive(Clone, Default)]
pub struct RequestStatus {
    inner: Arc<Mutex<StatusInner>>,
}

impl RequestStatus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StatusInner> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Restart progress accounting with a new expected total. Partial
    /// results and accumulated enrichment rows are kept.
    pub fn reset(&self, total: u64) {
        let mut inner = self.lock();
        inner.processed = 0;
        inner.total = total;
        inner.finished = false;
    }

    /// One unit of work completed.
    pub fn increment(&self) {
        let mut inner = self.lock();
        inner.processed += 1;
        debug!(
            phase = %inner.phase,
            processed = inner.processed,
            total = inner.total,
            "request progress"
        );
    }

    pub fn set_phase(&self, phase: &str) {
        self.lock().phase = phase.to_string();
    }

    /// Record the terminal result payload.
    pub fn finish(&self, results: Value) {
        let mut inner = self.lock();
        inner.results = results;
        inner.finished = true;
    }

    pub fn phase(&self) -> String {
        self.lock().phase.clone()
    }

    pub fn processed(&self) -> u64 {
        self.lock().processed
    }

    pub fn total(&self) -> u64 {
        self.lock().total
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    /// Append an intermediate record visible to pollers before the
    /// request finishes.
    pub fn add_partial(&self, partial: Value) {
        self.lock().partials.push(partial);
    }

    pub fn partials(&self) -> Vec<Value> {
        self.lock().partials.clone()
    }

    /// Fold a batch of enrichment rows into the accumulated set,
    /// re-ranking everything seen so far and refreshing the grouped
    /// summary.
    pub fn merge_enrichment(&self, rows: Vec<EnrichmentRecord>) {
        let mut inner = self.lock();
        inner.enrichment.extend(rows);
        rank_records(&mut inner.enrichment);
        inner.summary = summarize(&inner.enrichment, ENRICHMENT_DROPOFF_SDS);
    }

    pub fn enrichment_records(&self) -> Vec<EnrichmentRecord> {
        self.lock().enrichment.clone()
    }

    pub fn enrichment_summary(&self) -> EnrichmentSummary {
        self.lock().summary.clone()
    }

    /// Poller view: progress while running, terminal results once
    /// finished.
    pub fn snapshot(&self) -> Value {
        let inner = self.lock();
        if inner.finished {
            return inner.results.clone();
        }
        json!({
            "phase": inner.phase,
            "total": inner.total,
            "processed": inner.processed,
            "partial": inner.partials,
        })
    }

    pub fn progress_text(&self) -> String {
        let inner = self.lock();
        format!("{} ({}/{})", inner.phase, inner.processed, inner.total)
    }
}

/// Live trackers keyed by invocation handle.
#[derive(Default)]
pub struct StatusRegistry {
    entries: Mutex<HashMap<Uuid, RequestStatus>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, RequestStatus>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a fresh tracker and return its handle.
    pub fn register(&self, status: RequestStatus) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().insert(id, status);
        id
    }

    pub fn get(&self, id: &Uuid) -> Option<RequestStatus> {
        self.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &Uuid) -> Option<RequestStatus> {
        self.lock().remove(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
