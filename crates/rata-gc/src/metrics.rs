//! Collection metrics and statistics.

use std::cell::Cell;
use std::time::Duration;

/// Statistics from the most recent collection.
#[derive(Debug, Clone, Copy)]
pub struct GcMetrics {
    /// Duration of the last collection, finalization excluded.
    pub duration: Duration,
    /// Level collected: 0 young only, up to the number of old
    /// generations for a full collection.
    pub level: usize,
    /// Live cells after the collection.
    pub cells_in_use: usize,
    /// Free cells under the trigger; negative when the trigger shrank
    /// below the live count.
    pub cells_free: i64,
    /// Free vector words under the budget.
    pub vector_words_free: i64,
    /// Collections since the heap was initialized.
    pub total_collections: usize,
}

impl Default for GcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GcMetrics {
    /// A zeroed metrics record.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            duration: Duration::from_secs(0),
            level: 0,
            cells_in_use: 0,
            cells_free: 0,
            vector_words_free: 0,
            total_collections: 0,
        }
    }
}

thread_local! {
    static LAST_METRICS: Cell<GcMetrics> = const { Cell::new(GcMetrics::new()) };
}

/// Metrics from the last collection on this thread.
#[must_use]
pub fn last_gc_metrics() -> GcMetrics {
    LAST_METRICS.with(Cell::get)
}

/// Record metrics for a collection.
pub(crate) fn record_metrics(metrics: GcMetrics) {
    LAST_METRICS.with(|m| m.set(metrics));
}
