//! Collector control: explicit collection, torture and reporting
//! toggles, heap limits, the per-kind census, and the write barrier
//! invoked by every reference-slot setter.

mod collect;

use std::cell::Cell as StdCell;
use std::time::Instant;

use crate::cell::{CellRef, NUM_KINDS, NUM_OLD_GENERATIONS};
use crate::heap::with_heap;
use crate::metrics::{record_metrics, GcMetrics};

// ----------------------------------------------------------------------
// Interrupt suspension
// ----------------------------------------------------------------------

thread_local! {
    static INTERRUPT_DEPTH: StdCell<u32> = const { StdCell::new(0) };
}

/// Whether asynchronous event handling is currently suspended. The
/// embedding interpreter polls this before acting on an interrupt, so
/// no event can observe half-linked rings.
#[must_use]
pub fn interrupts_suspended() -> bool {
    INTERRUPT_DEPTH.with(|d| d.get() > 0)
}

/// Run `f` with interrupt handling suspended. Nests.
pub fn suspend_interrupts<R>(f: impl FnOnce() -> R) -> R {
    INTERRUPT_DEPTH.with(|d| d.set(d.get() + 1));
    let r = f();
    INTERRUPT_DEPTH.with(|d| d.set(d.get() - 1));
    r
}

// ----------------------------------------------------------------------
// Write barrier
// ----------------------------------------------------------------------

/// The write barrier run by every setter of a cell-reference slot.
///
/// When the written cell is older than the value, the *referrer* is
/// relocated onto the remembered set of its class and generation (or,
/// under `expel-old-to-new`, the referent is aged up to the referrer's
/// generation instead).
pub(crate) fn write_barrier(x: CellRef, y: CellRef) {
    with_heap(|h| h.check_old_to_new(x.as_ptr(), y.as_ptr()));
}

// ----------------------------------------------------------------------
// Collection driver
// ----------------------------------------------------------------------

/// Run a collection at the scheduled level, then finalization, then --
/// if finalizers ran and the request is still unsatisfied -- one more
/// collection without finalization.
pub(crate) fn gc_internal(size_needed: usize) {
    let mut first = true;
    loop {
        let start = Instant::now();
        let (count, level, collected, vfree, n_size, v_size, in_use, reporting) =
            suspend_interrupts(|| {
                with_heap(|h| {
                    h.gc_count += 1;
                    let _span =
                        tracing::debug_span!("collect", run = h.gc_count, size_needed).entered();
                    let level = h.run_gen_collect(size_needed);
                    (
                        h.gc_count,
                        level,
                        h.collected,
                        h.vheap_free(),
                        h.n_size,
                        h.v_size,
                        h.nodes_in_use,
                        h.reporting,
                    )
                })
            });
        record_metrics(GcMetrics {
            duration: start.elapsed(),
            level,
            cells_in_use: in_use,
            cells_free: collected,
            vector_words_free: vfree,
            total_collections: count,
        });
        if reporting {
            #[allow(clippy::cast_precision_loss)]
            let cells_pct = 100.0 * collected as f64 / n_size as f64;
            #[allow(clippy::cast_precision_loss)]
            let vector_pct = 100.0 * vfree as f64 / v_size as f64;
            tracing::info!(
                run = count,
                level,
                cells_free = collected,
                cells_free_pct = cells_pct,
                vector_words_free = vfree,
                vector_free_pct = vector_pct,
                "garbage collection"
            );
        }
        if first {
            first = false;
            #[allow(clippy::cast_possible_wrap)]
            let rerun = crate::finalize::run_pending_finalizers()
                && with_heap(|h| h.no_free_nodes() || size_needed as i64 > h.vheap_free());
            if rerun {
                continue;
            }
        }
        break;
    }
}

/// Run an explicit full collection and report usage.
///
/// The result is `[cells_used, vector_words_used, cells_used_tmb,
/// vector_used_tmb, cell_trigger, vector_trigger, cell_trigger_tmb,
/// vector_trigger_tmb, cell_max_tmb, vector_max_tmb]`, where `_tmb`
/// entries are tenths of a MiB rounded up and the last two are
/// `usize::MAX` when no cap is set.
pub fn gc() -> [usize; 10] {
    with_heap(|h| h.gens_to_collect = NUM_OLD_GENERATIONS);
    gc_internal(0);
    with_heap(|h| {
        let cells_used = h.nodes_in_use;
        let vector_used = h.small_valloc + h.large_valloc;
        [
            cells_used,
            vector_used,
            cells_to_tenth_mib(cells_used),
            words_to_tenth_mib(vector_used),
            h.n_size,
            h.v_size,
            cells_to_tenth_mib(h.n_size),
            words_to_tenth_mib(h.v_size),
            if h.max_n_size == usize::MAX {
                usize::MAX
            } else {
                cells_to_tenth_mib(h.max_n_size)
            },
            if h.max_v_size == usize::MAX {
                usize::MAX
            } else {
                words_to_tenth_mib(h.max_v_size)
            },
        ]
    })
}

#[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn cells_to_tenth_mib(cells: usize) -> usize {
    (10.0 * cells as f64 * std::mem::size_of::<crate::cell::Cell>() as f64 / 1_048_576.0 + 0.999)
        as usize
}

#[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn words_to_tenth_mib(words: usize) -> usize {
    (10.0 * words as f64 / 131_072.0 + 0.999) as usize
}

/// Toggle torture mode, in which every allocation entry collects first.
/// Returns the previous setting.
pub fn gc_torture(on: bool) -> bool {
    with_heap(|h| {
        let old = h.torture;
        h.torture = on;
        old
    })
}

/// Toggle collection reporting through `tracing`. Returns the previous
/// setting.
pub fn gc_info(on: bool) -> bool {
    with_heap(|h| {
        let old = h.reporting;
        h.reporting = on;
        old
    })
}

/// Adjust the heap caps. `None` leaves a cap unchanged; a cap is never
/// lowered below the corresponding current trigger. Returns the caps in
/// force afterwards, `usize::MAX` meaning "no cap".
pub fn mem_limits(n_max: Option<usize>, v_max: Option<usize>) -> (usize, usize) {
    with_heap(|h| {
        if let Some(n) = n_max {
            h.set_max_node_target(n);
        }
        if let Some(v) = v_max {
            h.set_max_vector_words(v);
        }
        (h.max_n_size, h.max_v_size)
    })
}

/// Per-kind census of live cells, indexed by `Kind as usize`. Forces a
/// full collection first so every live cell sits in an old generation.
#[must_use]
pub fn mem_profile() -> [usize; NUM_KINDS] {
    suspend_interrupts(|| {
        with_heap(|h| h.gens_to_collect = NUM_OLD_GENERATIONS);
        gc_internal(0);
        with_heap(|h| h.census())
    })
}
