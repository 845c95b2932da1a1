//! Memory-management core of the Rata interpreter.
//!
//! Interpreter values are heterogeneous reference-graph cells: small
//! fixed-size records, small inline vectors and large vectors. This
//! crate provides their allocation, automatic reclamation by a
//! non-moving generational mark-sweep collector with a write barrier,
//! the protect-stack root discipline, a mark-scoped scratch allocator,
//! finalization hooks, and the argument-matching protocol the evaluator
//! relies on.
//!
//! # Design
//!
//! - **Cells on rings**: every cell is on exactly one circular doubly
//!   linked list (free, new, old, remembered set, or the collector's
//!   work list), so any membership change is O(1).
//! - **Two old generations**: survivors of a collection age one step;
//!   the write barrier keeps a remembered set of old cells that may
//!   point at younger ones, so young collections stay cheap.
//! - **Explicit roots**: there is no stack scanning. Interpreter code
//!   pins intermediates with [`protect`]/[`unprotect`] across any
//!   operation that may allocate.
//! - **Thread-local heap**: the whole heap is owned by one thread;
//!   there is no locking and no internal parallelism.
//!
//! # Quick start
//!
//! ```
//! use rata_gc::{cons, gc, nil, protect, unprotect};
//!
//! let pair = protect(cons(nil(), nil()).unwrap());
//! gc();
//! assert!(pair.car().is_nil());
//! unprotect(1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]

mod alloc;
mod args;
mod cell;
mod error;
mod finalize;
mod gc;
mod heap;
mod links;
mod metrics;
mod roots;
mod scratch;

pub use alloc::{
    alloc_cell, alloc_list, alloc_string, alloc_vector, cons, mk_char, mk_external_ptr,
    mk_promise, new_environment,
};
pub use args::{match_arg, match_args, match_par, non_null_string_match, pmatch, psmatch};
pub use cell::{CellRef, Complex, Kind, NativeFinalizer, NUM_KINDS};
pub use error::MemError;
pub use finalize::{register_finalizer, register_native_finalizer, set_apply_hook, ApplyHook};
pub use gc::{
    gc, gc_info, gc_torture, interrupts_suspended, mem_limits, mem_profile, suspend_interrupts,
};
pub use heap::{init_memory, HeapConfig};
pub use metrics::{last_gc_metrics, GcMetrics};
pub use roots::{
    blank_string, comment_marker, current_expr, dots_symbol, global_env, intern, missing_arg,
    nil, pop_context, preserve, protect, protect_depth, protect_with_index, push_context,
    release, reprotect, set_current_expr, set_warnings, unbound_value, unprotect, unprotect_ptr,
    warnings, ProtectIndex,
};
pub use scratch::{
    c_alloc, c_free, chk_calloc, chk_free, chk_realloc, r_alloc, reset_c_allocations, s_alloc,
    s_realloc, vmaxget, vmaxset, ScratchMark,
};

/// Heap introspection for tests.
#[doc(hidden)]
pub mod test_util {
    use crate::cell::{Cell, CellRef, NUM_OLD_GENERATIONS};
    use crate::heap::with_heap;

    /// Drop this thread's heap; the next use re-initializes it with the
    /// default configuration.
    pub fn reset() {
        crate::heap::reset_heap();
    }

    /// Live cells, as recomputed by the last collection plus
    /// allocations since.
    #[must_use]
    pub fn cells_in_use() -> usize {
        with_heap(|h| h.nodes_in_use)
    }

    /// Free cells under the trigger after the last collection.
    #[must_use]
    pub fn free_cells() -> i64 {
        with_heap(|h| h.collected)
    }

    /// Words held by live large vectors.
    #[must_use]
    pub fn large_vector_words() -> usize {
        with_heap(|h| h.large_valloc)
    }

    /// Words held by live small vectors.
    #[must_use]
    pub fn small_vector_words() -> usize {
        with_heap(|h| h.small_valloc)
    }

    /// Run a collection at exactly the given level (0 collects only the
    /// young cells), bypassing the promotion schedule.
    pub fn run_gc(level: usize) {
        assert!(level <= NUM_OLD_GENERATIONS);
        with_heap(|h| {
            h.gens_to_collect = level;
            h.collect_counts = [i32::MAX; NUM_OLD_GENERATIONS];
        });
        crate::gc::gc_internal(0);
        with_heap(|h| {
            h.collect_counts = [h.config.level0_freq, h.config.level1_freq];
        });
    }

    /// The generation recorded on a cell.
    #[must_use]
    pub fn node_generation(x: CellRef) -> usize {
        // SAFETY: `x` is a live cell.
        unsafe { Cell::generation(x.as_ptr()) }
    }

    /// Whether a cell carries the mark bit.
    #[must_use]
    pub fn is_marked(x: CellRef) -> bool {
        // SAFETY: `x` is a live cell.
        unsafe { Cell::is_marked(x.as_ptr()) }
    }

    /// Whether a cell currently sits on a remembered-set ring.
    #[must_use]
    pub fn on_remembered_set(x: CellRef) -> bool {
        #[cfg(feature = "expel-old-to-new")]
        {
            let _ = x;
            false
        }
        #[cfg(not(feature = "expel-old-to-new"))]
        with_heap(|h| {
            // SAFETY: read-only ring walk.
            unsafe {
                let class = Cell::class_of(x.as_ptr());
                for gen in 0..NUM_OLD_GENERATIONS {
                    let peg = h.classes[class].old_to_new[gen];
                    let mut s = (*peg).next;
                    while s != peg {
                        if s == x.as_ptr() {
                            return true;
                        }
                        s = (*s).next;
                    }
                }
            }
            false
        })
    }

    /// Walk every ring and panic on any structural violation.
    pub fn validate_heap() {
        with_heap(|h| h.check_heap_integrity());
    }
}
