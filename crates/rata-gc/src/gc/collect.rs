//! The generational collection algorithm.
//!
//! Marking is done by "forwarding": a reachable cell is marked,
//! unsnapped from its ring and pushed onto a work list threaded through
//! its next link (no motion occurs). Sweeping is implicit: whatever
//! remains on the "new" rings after the work list drains is free, and
//! the free cursors are simply reset.

use std::ptr;

use crate::alloc::{dealloc_large_cell, large_cell_words};
use crate::cell::{
    for_each_child, node_size, Cell, CellRef, Kind, LARGE_NODE_CLASS, NODE_CLASS_SIZE, NUM_KINDS,
    NUM_NODE_CLASSES, NUM_OLD_GENERATIONS, NUM_SMALL_NODE_CLASSES,
};
use crate::heap::{page_layout, page_node_count, Heap, PageHeader};
use crate::links::{bulk_move, reset_peg, ring_is_empty, snap, unsnap};

/// Mark `s` and push it onto the work list. Already-marked cells (and
/// the nil self-references that terminate traversal) are skipped.
unsafe fn forward_node(s: *mut Cell, forwarded: &mut *mut Cell) {
    // SAFETY: `s` is a live cell or null; the work list reuses the next
    // link, which snap() rewrites when the cell is placed.
    unsafe {
        if !s.is_null() && !Cell::is_marked(s) {
            Cell::mark(s);
            unsnap(s);
            (*s).next = *forwarded;
            *forwarded = s;
        }
    }
}

unsafe fn forward_children(s: *mut Cell, forwarded: &mut *mut Cell) {
    // SAFETY: delegated to the per-kind traversal.
    unsafe {
        for_each_child(s, |c| {
            // SAFETY: children of a live cell are live cells or null.
            unsafe { forward_node(c, forwarded) };
        });
    }
}

impl Heap {
    /// The write-barrier check. The referrer moves, not the referent
    /// (except under `expel-old-to-new`, where the referent is aged).
    pub(crate) fn check_old_to_new(&mut self, x: *mut Cell, y: *mut Cell) {
        // SAFETY: both pointers come from live CellRefs.
        unsafe {
            if !Cell::is_older(x, y) {
                return;
            }
            #[cfg(feature = "expel-old-to-new")]
            {
                self.age_node_and_children(y, Cell::generation(x));
            }
            #[cfg(not(feature = "expel-old-to-new"))]
            {
                let _ = y;
                unsnap(x);
                snap(
                    x,
                    self.classes[Cell::class_of(x)].old_to_new[Cell::generation(x)],
                );
            }
        }
    }

    unsafe fn age_node(&mut self, s: *mut Cell, gen: usize, forwarded: &mut *mut Cell) {
        // SAFETY: ring surgery on live cells.
        unsafe {
            if !s.is_null() && Cell::gen_is_younger(s, gen) {
                if Cell::is_marked(s) {
                    self.classes[Cell::class_of(s)].old_count[Cell::generation(s)] -= 1;
                } else {
                    Cell::mark(s);
                }
                Cell::set_generation(s, gen);
                unsnap(s);
                (*s).next = *forwarded;
                *forwarded = s;
            }
        }
    }

    /// Transitively raise `s` and everything it reaches to at least
    /// generation `gen`.
    pub(crate) unsafe fn age_node_and_children(&mut self, s: *mut Cell, gen: usize) {
        let mut forwarded: *mut Cell = ptr::null_mut();
        // SAFETY: the work list discipline matches forward/process.
        unsafe {
            self.age_node(s, gen, &mut forwarded);
            while !forwarded.is_null() {
                let s = forwarded;
                forwarded = (*s).next;
                debug_assert_eq!(Cell::generation(s), gen);
                snap(s, self.classes[Cell::class_of(s)].old[gen]);
                self.classes[Cell::class_of(s)].old_count[gen] += 1;
                for_each_child(s, |c| {
                    // SAFETY: children of a live cell are live or null.
                    unsafe { self.age_node(c, gen, &mut forwarded) };
                });
            }
        }
    }

    unsafe fn process_worklist(&mut self, forwarded: &mut *mut Cell) {
        // SAFETY: every cell on the work list was marked and unsnapped
        // by forward_node.
        unsafe {
            while !forwarded.is_null() {
                let s = *forwarded;
                *forwarded = (*s).next;
                let class = Cell::class_of(s);
                let gen = Cell::generation(s);
                snap(s, self.classes[class].old[gen]);
                self.classes[class].old_count[gen] += 1;
                forward_children(s, forwarded);
            }
        }
    }

    fn collect_counts_max(&self, level: usize) -> i32 {
        if level == 0 {
            self.config.level0_freq
        } else {
            self.config.level1_freq
        }
    }

    /// One full run of the collector; returns the level collected.
    #[allow(clippy::too_many_lines)]
    pub(crate) fn run_gen_collect(&mut self, size_needed: usize) -> usize {
        // Promotion schedule: every level0_freq-th collection is at
        // least level 1, every level1_freq-th of those is level 2.
        while self.gens_to_collect < NUM_OLD_GENERATIONS {
            let n = self.gens_to_collect;
            let count = self.collect_counts[n];
            self.collect_counts[n] = count - 1;
            if count <= 0 {
                self.collect_counts[n] = self.collect_counts_max(n);
                self.gens_to_collect += 1;
            } else {
                break;
            }
        }

        let gens_collected = loop {
            let level = self.gens_to_collect;

            #[cfg(not(feature = "expel-old-to-new"))]
            // Drain the remembered sets of the generations being
            // collected: age each referenced child up to the referrer's
            // generation, then return the referrer to its old ring.
            unsafe {
                for gen in 0..level {
                    for i in 0..NUM_NODE_CLASSES {
                        let peg = self.classes[i].old_to_new[gen];
                        let mut s = (*peg).next;
                        while s != peg {
                            let next = (*s).next;
                            for_each_child(s, |c| {
                                // SAFETY: children of a live cell are
                                // live or null.
                                unsafe { self.age_node_and_children(c, gen) };
                            });
                            unsnap(s);
                            debug_assert_eq!(Cell::generation(s), gen);
                            snap(s, self.classes[i].old[gen]);
                            s = next;
                        }
                    }
                }
            }

            // Empty the candidate generations: unmark everything,
            // pre-bump the generation so survivors land one step older,
            // and move the cells onto the "new" rings.
            unsafe {
                for gen in 0..level {
                    for i in 0..NUM_NODE_CLASSES {
                        self.classes[i].old_count[gen] = 0;
                        let peg = self.classes[i].old[gen];
                        let mut s = (*peg).next;
                        while s != peg {
                            let next = (*s).next;
                            if gen < NUM_OLD_GENERATIONS - 1 {
                                Cell::set_generation(s, gen + 1);
                            }
                            Cell::unmark(s);
                            s = next;
                        }
                        if !ring_is_empty(peg) {
                            bulk_move(peg, self.classes[i].new);
                        }
                    }
                }
            }

            let mut forwarded: *mut Cell = ptr::null_mut();

            #[cfg(not(feature = "expel-old-to-new"))]
            // References out of the retained older generations keep
            // their targets alive without being collected themselves.
            unsafe {
                for gen in level..NUM_OLD_GENERATIONS {
                    for i in 0..NUM_NODE_CLASSES {
                        let peg = self.classes[i].old_to_new[gen];
                        let mut s = (*peg).next;
                        while s != peg {
                            forward_children(s, &mut forwarded);
                            s = (*s).next;
                        }
                    }
                }
            }

            // Forward all roots, in registry order.
            unsafe {
                forward_node(self.roots.nil, &mut forwarded);
                forward_node(self.roots.missing_arg, &mut forwarded);
                forward_node(self.roots.unbound_value, &mut forwarded);
                forward_node(self.roots.blank_string, &mut forwarded);
                forward_node(self.roots.na_string, &mut forwarded);
                forward_node(self.roots.comment_marker, &mut forwarded);
                forward_node(self.roots.warnings, &mut forwarded);

                forward_node(self.roots.global_env, &mut forwarded);
                for i in 0..self.roots.symbol_table.len() {
                    forward_node(self.roots.symbol_table[i], &mut forwarded);
                }
                forward_node(self.roots.current_expr, &mut forwarded);

                for i in 0..self.roots.contexts.len() {
                    forward_node(self.roots.contexts[i], &mut forwarded);
                }
                for i in 0..self.roots.protect.len() {
                    forward_node(self.roots.protect[i], &mut forwarded);
                }
                forward_node(self.roots.preserved, &mut forwarded);
                forward_node(self.vstack, &mut forwarded);

                self.process_worklist(&mut forwarded);
            }

            // Flag finalizer candidates, then keep their targets alive
            // for this cycle by forwarding the registry itself.
            unsafe {
                self.check_finalizers();
                forward_node(self.fin_registered, &mut forwarded);
                self.process_worklist(&mut forwarded);
            }

            unsafe {
                self.release_large_free_vectors();
            }

            // Reset the free cursors: everything left on "new" is free.
            unsafe {
                for i in 0..NUM_NODE_CLASSES {
                    self.classes[i].free = (*self.classes[i].new).next;
                }
            }

            // Update the heap statistics.
            self.small_valloc = 0;
            let mut live = 0usize;
            for gen in 0..NUM_OLD_GENERATIONS {
                for i in 1..NUM_SMALL_NODE_CLASSES {
                    self.small_valloc += self.classes[i].old_count[gen] * NODE_CLASS_SIZE[i];
                }
                for i in 0..NUM_NODE_CLASSES {
                    live += self.classes[i].old_count[gen];
                }
            }
            #[allow(clippy::cast_possible_wrap)]
            {
                self.collected = self.n_size as i64 - live as i64;
            }
            self.nodes_in_use = live;

            // Feedback: when the yield misses the minimum-free targets,
            // raise the level; when the request is still unsatisfied,
            // collect again right away.
            #[allow(clippy::cast_possible_wrap, clippy::cast_precision_loss)]
            if self.gens_to_collect < NUM_OLD_GENERATIONS {
                let min_n_free = (self.config.min_free_frac * self.n_size as f64) as i64;
                let min_v_free = (self.config.min_free_frac * self.v_size as f64) as i64;
                if self.collected < min_n_free
                    || self.vheap_free() - (size_needed as i64) < min_v_free
                {
                    self.gens_to_collect += 1;
                    if self.collected <= 0 || self.vheap_free() < size_needed as i64 {
                        continue;
                    }
                } else {
                    self.gens_to_collect = 0;
                }
            } else {
                self.gens_to_collect = 0;
            }
            break level;
        };

        self.gen_gc_counts[gens_collected] += 1;

        if gens_collected == NUM_OLD_GENERATIONS {
            self.adjust_heap_size(size_needed);
            self.try_to_release_pages();
            self.sort_nodes();
        } else if gens_collected > 0 {
            self.try_to_release_pages();
        }

        #[cfg(feature = "paranoid-heap")]
        self.check_heap_integrity();

        gens_collected
    }

    fn check_finalizers(&mut self) {
        // SAFETY: the registry is a nil-terminated chain of pair cells.
        unsafe {
            let mut s = self.fin_registered;
            while !s.is_null() && Cell::kind_of(s) != Kind::Nil {
                let entry = CellRef::new(s);
                // Set pending only when currently clear: registration
                // clears the bit, and a still-queued entry must not be
                // re-scheduled by a nested collection.
                if !Cell::is_marked((*s).data.pair.car) && !entry.pending() {
                    entry.set_pending(true);
                }
                s = (*s).data.pair.cdr;
            }
        }
    }

    unsafe fn release_large_free_vectors(&mut self) {
        // SAFETY: after the work list drains, every cell still on the
        // large "new" ring is an unmarked, unreachable vector.
        unsafe {
            let peg = self.classes[LARGE_NODE_CLASS].new;
            let mut s = (*peg).next;
            while s != peg {
                let next = (*s).next;
                let words = large_cell_words(s);
                unsnap(s);
                self.large_valloc -= words;
                self.classes[LARGE_NODE_CLASS].alloc_count -= 1;
                dealloc_large_cell(s);
                s = next;
            }
        }
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    fn adjust_heap_size(&mut self, size_needed: usize) {
        let min_n_free = (self.orig_n_size as f64 * self.config.min_free_frac) as usize;
        let min_v_free = (self.orig_v_size as f64 * self.config.min_free_frac) as usize;
        let n_needed = self.nodes_in_use + min_n_free;
        let v_needed = self.small_valloc + self.large_valloc + size_needed + min_v_free;
        let node_occup = n_needed as f64 / self.n_size as f64;
        let vect_occup = v_needed as f64 / self.v_size as f64;

        if node_occup > self.config.node_grow_frac {
            let change = self.config.node_grow_incr_min
                + (self.config.node_grow_incr_frac * self.n_size as f64) as usize;
            if self.max_n_size.saturating_sub(self.n_size) >= change {
                self.n_size += change;
            }
        } else if node_occup < self.config.node_shrink_frac {
            let change = self.config.node_shrink_incr_min
                + (self.config.node_shrink_incr_frac * self.n_size as f64) as usize;
            self.n_size = self.n_size.saturating_sub(change);
            if self.n_size < n_needed {
                self.n_size = n_needed.min(self.max_n_size);
            }
            self.n_size = self.n_size.max(self.orig_n_size);
        }

        if vect_occup > 1.0 && v_needed < self.max_v_size {
            self.v_size = v_needed;
        }
        if vect_occup > self.config.vector_grow_frac {
            let change = self.config.vector_grow_incr_min
                + (self.config.vector_grow_incr_frac * self.v_size as f64) as usize;
            if self.max_v_size.saturating_sub(self.v_size) >= change {
                self.v_size += change;
            }
        } else if vect_occup < self.config.vector_shrink_frac {
            let change = self.config.vector_shrink_incr_min
                + (self.config.vector_shrink_incr_frac * self.v_size as f64) as usize;
            self.v_size = self.v_size.saturating_sub(change);
            if self.v_size < v_needed {
                self.v_size = v_needed;
            }
            self.v_size = self.v_size.max(self.orig_v_size);
        }
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    fn try_to_release_pages(&mut self) {
        if self.release_count > 0 {
            self.release_count -= 1;
            return;
        }
        self.release_count = self.config.page_release_freq;
        for i in 0..NUM_SMALL_NODE_CLASSES {
            let node_sz = node_size(i);
            let per_page = page_node_count(i);

            let mut maxrel = self.classes[i].alloc_count as f64;
            for gen in 0..NUM_OLD_GENERATIONS {
                maxrel -=
                    (1.0 + self.config.max_keep_frac) * self.classes[i].old_count[gen] as f64;
            }
            let maxrel_pages = if maxrel > 0.0 {
                maxrel as usize / per_page
            } else {
                0
            };

            // Pages with no marked cell hold only free cells and can go
            // back to the OS, up to the retention bound.
            // SAFETY: page chains and their slots are owned by the heap.
            unsafe {
                let mut rel_pages = 0;
                let mut last: *mut PageHeader = ptr::null_mut();
                let mut page = self.classes[i].pages;
                while rel_pages < maxrel_pages && !page.is_null() {
                    let next = (*page).next;
                    let mut in_use = false;
                    let mut data = page.add(1).cast::<u8>();
                    for _ in 0..per_page {
                        if Cell::is_marked(data.cast::<Cell>()) {
                            in_use = true;
                            break;
                        }
                        data = data.add(node_sz);
                    }
                    if in_use {
                        last = page;
                    } else {
                        self.release_page(page, i);
                        if last.is_null() {
                            self.classes[i].pages = next;
                        } else {
                            (*last).next = next;
                        }
                        rel_pages += 1;
                    }
                    page = next;
                }
                self.classes[i].free = (*self.classes[i].new).next;
            }
        }
    }

    unsafe fn release_page(&mut self, page: *mut PageHeader, class: usize) {
        let node_sz = node_size(class);
        let per_page = page_node_count(class);
        // SAFETY: every slot of a releasable page is a free cell on the
        // "new" ring; unsnapping detaches it before the page goes away.
        unsafe {
            let mut data = page.add(1).cast::<u8>();
            for _ in 0..per_page {
                unsnap(data.cast::<Cell>());
                self.classes[class].alloc_count -= 1;
                data = data.add(node_sz);
            }
            self.classes[class].page_count -= 1;
            std::alloc::dealloc(page.cast(), page_layout());
        }
    }

    /// Rebuild the free rings in page-address order to improve locality.
    /// Run after full collections, when "new" holds only free cells.
    fn sort_nodes(&mut self) {
        for i in 0..NUM_SMALL_NODE_CLASSES {
            let node_sz = node_size(i);
            let per_page = page_node_count(i);
            // SAFETY: all live cells sit on old rings after a full
            // collection; unmarked page slots are exactly the free set.
            unsafe {
                reset_peg(self.classes[i].new);
                let mut page = self.classes[i].pages;
                while !page.is_null() {
                    let mut data = page.add(1).cast::<u8>();
                    for _ in 0..per_page {
                        let s = data.cast::<Cell>();
                        if !Cell::is_marked(s) {
                            snap(s, self.classes[i].new);
                        }
                        data = data.add(node_sz);
                    }
                    page = (*page).next;
                }
                self.classes[i].free = (*self.classes[i].new).next;
            }
        }
    }

    /// Per-kind census of cells on the old rings.
    pub(crate) fn census(&self) -> [usize; NUM_KINDS] {
        let mut counts = [0usize; NUM_KINDS];
        // SAFETY: read-only ring walk.
        unsafe {
            for gen in 0..NUM_OLD_GENERATIONS {
                for i in 0..NUM_NODE_CLASSES {
                    let peg = self.classes[i].old[gen];
                    let mut s = (*peg).next;
                    while s != peg {
                        counts[Cell::kind_of(s) as usize] += 1;
                        s = (*s).next;
                    }
                }
            }
        }
        counts
    }

    /// Walk every ring and verify the structural invariants: link
    /// symmetry, class and generation membership, count consistency and
    /// the remembered-set invariant.
    ///
    /// # Panics
    ///
    /// Panics on the first violation found.
    pub(crate) fn check_heap_integrity(&self) {
        // SAFETY: read-only ring walks over heap-owned cells.
        unsafe {
            let mut live = 0usize;
            for i in 0..NUM_NODE_CLASSES {
                for gen in 0..NUM_OLD_GENERATIONS {
                    // Cells of generation `gen` sit on the old ring or,
                    // after a barriered write, on the remembered set;
                    // old_count covers both.
                    let mut count = 0usize;
                    let peg = self.classes[i].old[gen];
                    let mut s = (*peg).next;
                    while s != peg {
                        assert_eq!((*(*s).next).prev, s, "broken ring link");
                        assert_eq!(Cell::class_of(s), i, "cell on wrong class ring");
                        assert_eq!(Cell::generation(s), gen, "cell on wrong generation ring");
                        assert!(Cell::is_marked(s), "unmarked cell on an old ring");
                        for_each_child(s, |c| {
                            // SAFETY: children of a live cell are live.
                            let younger = unsafe { Cell::gen_is_younger(c, gen) };
                            assert!(!younger, "untraced old-to-new reference");
                        });
                        count += 1;
                        s = (*s).next;
                    }
                    #[cfg(not(feature = "expel-old-to-new"))]
                    {
                        let peg = self.classes[i].old_to_new[gen];
                        let mut s = (*peg).next;
                        while s != peg {
                            assert_eq!((*(*s).next).prev, s, "broken ring link");
                            assert_eq!(Cell::class_of(s), i, "cell on wrong class ring");
                            assert_eq!(
                                Cell::generation(s),
                                gen,
                                "cell on wrong generation ring"
                            );
                            count += 1;
                            s = (*s).next;
                        }
                    }
                    assert_eq!(
                        count, self.classes[i].old_count[gen],
                        "old-generation count mismatch"
                    );
                    live += count;
                }
                let peg = self.classes[i].new;
                let mut s = (*peg).next;
                while s != peg {
                    assert_eq!((*(*s).next).prev, s, "broken ring link");
                    s = (*s).next;
                }
            }
            let _ = live;
        }
    }
}
