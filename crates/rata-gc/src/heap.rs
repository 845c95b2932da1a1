//! Heap state: slab pages, per-class/per-generation rings, tunables.
//!
//! Cells of the small classes are carved out of fixed-size pages; each
//! page is one OS allocation sliced into equal slots. The large class
//! bypasses pages entirely. All heap state is thread-local, so each
//! thread (in particular, each test thread) owns an isolated heap.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::RefCell;
use std::ptr;

use crate::cell::{
    node_size, Cell, Kind, LARGE_NODE_CLASS, NODE_CLASS_SIZE, NUM_NODE_CLASSES,
    NUM_OLD_GENERATIONS, NUM_SMALL_NODE_CLASSES, VEC_WORD,
};
use crate::error::MemError;
use crate::links::{reset_peg, snap};
use crate::roots::{symbol_hash, RootSet};

/// Nominal page size in bytes, trimmed to a whole number of class-0
/// slots plus the header.
const BASE_PAGE_SIZE: usize = 2000;

const PAGE_HEADER_SIZE: usize = std::mem::size_of::<PageHeader>();

/// Actual page size used for every small class.
pub(crate) const PAGE_SIZE: usize = (BASE_PAGE_SIZE - PAGE_HEADER_SIZE)
    / std::mem::size_of::<Cell>()
    * std::mem::size_of::<Cell>()
    + PAGE_HEADER_SIZE;

/// Cells per page for a small class.
pub(crate) const fn page_node_count(class: usize) -> usize {
    (PAGE_SIZE - PAGE_HEADER_SIZE) / node_size(class)
}

pub(crate) const fn page_layout() -> Layout {
    match Layout::from_size_align(PAGE_SIZE, std::mem::align_of::<Cell>()) {
        Ok(l) => l,
        Err(_) => panic!("invalid page layout"),
    }
}

/// Header linking a page into its class's page chain.
#[repr(C)]
pub(crate) struct PageHeader {
    pub next: *mut PageHeader,
}

/// Tunables, all read at initialization. The documented defaults match
/// the interpreter's shipping configuration.
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Initial (and minimal) cell trigger.
    pub initial_node_target: usize,
    /// Initial (and minimal) vector budget, in vector words.
    pub initial_vector_words: usize,
    /// Upper bound on the cell trigger; `usize::MAX` means no cap.
    pub max_node_target: usize,
    /// Upper bound on the vector budget; `usize::MAX` means no cap.
    pub max_vector_words: usize,
    /// Capacity of the protect stack.
    pub protect_stack_size: usize,
    /// Bucket count of the symbol table.
    pub symbol_table_size: usize,
    /// Fraction of each trigger that must be free after a collection,
    /// or the next collection runs at a higher level.
    pub min_free_frac: f64,
    /// Free cells retained per allocated cell when releasing pages.
    pub max_keep_frac: f64,
    /// Attempt a page release every this many level>=1 collections.
    pub page_release_freq: usize,
    /// Cell occupancy above which the cell trigger grows.
    pub node_grow_frac: f64,
    /// Cell occupancy below which the cell trigger shrinks.
    pub node_shrink_frac: f64,
    /// Vector occupancy above which the vector budget grows.
    pub vector_grow_frac: f64,
    /// Vector occupancy below which the vector budget shrinks.
    pub vector_shrink_frac: f64,
    /// Additive part of a cell-trigger growth step.
    pub node_grow_incr_min: usize,
    /// Proportional part of a cell-trigger growth step.
    pub node_grow_incr_frac: f64,
    /// Additive part of a cell-trigger shrink step.
    pub node_shrink_incr_min: usize,
    /// Proportional part of a cell-trigger shrink step.
    pub node_shrink_incr_frac: f64,
    /// Additive part of a vector-budget growth step.
    pub vector_grow_incr_min: usize,
    /// Proportional part of a vector-budget growth step.
    pub vector_grow_incr_frac: f64,
    /// Additive part of a vector-budget shrink step.
    pub vector_shrink_incr_min: usize,
    /// Proportional part of a vector-budget shrink step.
    pub vector_shrink_incr_frac: f64,
    /// Level-0 collections before a level-1 collection.
    pub level0_freq: i32,
    /// Level-1 collections before a level-2 collection.
    pub level1_freq: i32,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            initial_node_target: 350_000,
            initial_vector_words: 786_432,
            max_node_target: usize::MAX,
            max_vector_words: usize::MAX,
            protect_stack_size: 10_000,
            symbol_table_size: 1021,
            min_free_frac: 0.2,
            max_keep_frac: 0.5,
            page_release_freq: 1,
            node_grow_frac: 0.70,
            node_shrink_frac: 0.30,
            vector_grow_frac: 0.70,
            vector_shrink_frac: 0.30,
            node_grow_incr_min: 40_000,
            node_grow_incr_frac: 0.05,
            node_shrink_incr_min: 0,
            node_shrink_incr_frac: 0.2,
            vector_grow_incr_min: 80_000,
            vector_grow_incr_frac: 0.05,
            vector_shrink_incr_min: 0,
            vector_shrink_incr_frac: 0.2,
            level0_freq: 20,
            level1_freq: 5,
        }
    }
}

/// Per-class heap state: the generation rings, the page chain and the
/// free cursor. Free cells are the suffix of the "new" ring starting at
/// the cursor; allocation advances the cursor, the sweep resets it.
pub(crate) struct ClassHeap {
    pub old: [*mut Cell; NUM_OLD_GENERATIONS],
    #[cfg(not(feature = "expel-old-to-new"))]
    pub old_to_new: [*mut Cell; NUM_OLD_GENERATIONS],
    pub new: *mut Cell,
    pub free: *mut Cell,
    pub old_count: [usize; NUM_OLD_GENERATIONS],
    pub alloc_count: usize,
    pub page_count: usize,
    pub pages: *mut PageHeader,
}

fn new_peg() -> *mut Cell {
    let peg = Box::into_raw(Box::new(Cell::template()));
    // SAFETY: freshly boxed cell, exclusively owned.
    unsafe { reset_peg(peg) };
    peg
}

impl ClassHeap {
    fn new() -> Self {
        let new = new_peg();
        Self {
            old: std::array::from_fn(|_| new_peg()),
            #[cfg(not(feature = "expel-old-to-new"))]
            old_to_new: std::array::from_fn(|_| new_peg()),
            new,
            free: new,
            old_count: [0; NUM_OLD_GENERATIONS],
            alloc_count: 0,
            page_count: 0,
            pages: ptr::null_mut(),
        }
    }
}

/// The thread-local heap.
pub(crate) struct Heap {
    pub classes: [ClassHeap; NUM_NODE_CLASSES],
    pub nodes_in_use: usize,
    /// Free cells after the last collection; signed because the trigger
    /// can shrink below the live count.
    pub collected: i64,
    /// Vector words held by live small-vector cells.
    pub small_valloc: usize,
    /// Vector words held by live large-vector cells.
    pub large_valloc: usize,
    /// Cell trigger.
    pub n_size: usize,
    /// Vector budget, in vector words.
    pub v_size: usize,
    pub orig_n_size: usize,
    pub orig_v_size: usize,
    pub max_n_size: usize,
    pub max_v_size: usize,
    pub gens_to_collect: usize,
    pub collect_counts: [i32; NUM_OLD_GENERATIONS],
    pub gen_gc_counts: [usize; NUM_OLD_GENERATIONS + 1],
    pub gc_count: usize,
    pub release_count: usize,
    pub torture: bool,
    pub torture_inhibit: u32,
    pub reporting: bool,
    pub roots: RootSet,
    /// Head of the finalizer registry (a chain of pair cells), nil when
    /// empty.
    pub fin_registered: *mut Cell,
    /// Head of the scratch-allocation chain, nil when empty.
    pub vstack: *mut Cell,
    pub config: HeapConfig,
}

impl Heap {
    /// Build a fresh heap and perform the initialization ritual: the nil
    /// cell is allocated first and points every reference slot at
    /// itself, then the remaining singletons and the symbol table are
    /// created.
    pub fn new(config: HeapConfig) -> Self {
        let mut heap = Self {
            classes: std::array::from_fn(|_| ClassHeap::new()),
            nodes_in_use: 0,
            collected: 0,
            small_valloc: 0,
            large_valloc: 0,
            n_size: config.initial_node_target,
            v_size: config.initial_vector_words,
            orig_n_size: config.initial_node_target,
            orig_v_size: config.initial_vector_words,
            max_n_size: config.max_node_target,
            max_v_size: config.max_vector_words,
            gens_to_collect: 0,
            collect_counts: [config.level0_freq, config.level1_freq],
            gen_gc_counts: [0; NUM_OLD_GENERATIONS + 1],
            gc_count: 0,
            release_count: 0,
            torture: false,
            torture_inhibit: 0,
            reporting: false,
            roots: RootSet::empty(),
            fin_registered: ptr::null_mut(),
            vstack: ptr::null_mut(),
            config,
        };
        heap.init_singletons();
        heap
    }

    fn init_singletons(&mut self) {
        // Nil must be the first cell allocated; the collector relies on
        // its self-references to terminate traversal. Its fields are
        // written directly: the write barrier refuses nil.
        let nil = self
            .get_free_node(0)
            .expect("failed to allocate the initial heap page");
        // SAFETY: fresh class-0 slot, exclusively owned.
        unsafe {
            (*nil).info = Kind::Nil as u32;
            (*nil).attrib = nil;
            (*nil).data.pair.car = nil;
            (*nil).data.pair.cdr = nil;
            (*nil).data.pair.tag = nil;
        }
        self.roots.nil = nil;

        let blank = self.init_char(b"");
        let na = self.init_char(b"NA");
        self.roots.blank_string = blank;
        self.roots.na_string = na;
        let unbound = self.init_symbol(blank);
        // SAFETY: the unbound marker is its own value.
        unsafe { (*unbound).data.pair.cdr = unbound };
        self.roots.unbound_value = unbound;
        let missing = self.init_symbol(blank);
        unsafe { (*missing).data.pair.cdr = missing };
        self.roots.missing_arg = missing;

        self.roots.symbol_table = vec![nil; self.config.symbol_table_size];
        self.roots.dots_symbol = self.init_intern("...");
        self.roots.comment_marker = self.init_intern("comment");
        self.roots.warnings = nil;
        self.roots.current_expr = nil;

        let global_env = self.init_cell(Kind::Env);
        unsafe {
            (*global_env).data.env.frame = nil;
            (*global_env).data.env.enclos = nil;
            (*global_env).data.env.hashtab = nil;
        }
        self.roots.global_env = global_env;
        self.roots.preserved = nil;

        self.fin_registered = nil;
        self.vstack = nil;
    }

    /// Allocate a class-0 cell during initialization, every reference
    /// slot pointing at nil. No collection can be needed this early.
    fn init_cell(&mut self, kind: Kind) -> *mut Cell {
        let s = self
            .get_free_node(0)
            .expect("failed to grow the heap during initialization");
        let nil = self.roots.nil;
        unsafe {
            (*s).info = kind as u32;
            (*s).attrib = nil;
            (*s).data.pair.car = nil;
            (*s).data.pair.cdr = nil;
            (*s).data.pair.tag = nil;
        }
        s
    }

    fn init_char(&mut self, bytes: &[u8]) -> *mut Cell {
        let words = crate::alloc::vec_words(Kind::Char, bytes.len())
            .expect("initialization string cannot overflow");
        let class = crate::alloc::small_class_for(words).expect("initialization string is small");
        let s = self
            .get_free_node(class)
            .expect("failed to grow the heap during initialization");
        let nil = self.roots.nil;
        unsafe {
            (*s).info = Kind::Char as u32;
            Cell::set_class(s, class);
            (*s).attrib = nil;
            (*s).data.vec.length = bytes.len();
            (*s).data.vec.truelength = bytes.len();
            let data = crate::cell::vec_data_ptr::<u8>(s);
            ptr::copy_nonoverlapping(bytes.as_ptr(), data, bytes.len());
            *data.add(bytes.len()) = 0;
        }
        self.small_valloc += NODE_CLASS_SIZE[class];
        s
    }

    fn init_symbol(&mut self, pname: *mut Cell) -> *mut Cell {
        let s = self.init_cell(Kind::Symbol);
        unsafe {
            (*s).data.pair.car = pname;
            (*s).data.pair.cdr = self.roots.unbound_value;
        }
        s
    }

    fn init_intern(&mut self, name: &str) -> *mut Cell {
        let bucket = symbol_hash(name.as_bytes()) % self.roots.symbol_table.len();
        let pname = self.init_char(name.as_bytes());
        let sym = self.init_symbol(pname);
        let entry = self.init_cell(Kind::Pair);
        unsafe {
            (*entry).data.pair.car = sym;
            (*entry).data.pair.cdr = self.roots.symbol_table[bucket];
        }
        self.roots.symbol_table[bucket] = entry;
        sym
    }

    /// Take a cell from the class's free cursor, pulling a fresh page in
    /// when the cursor has reached the peg. The cell stays on the "new"
    /// ring; the cursor is what separates live new cells from free ones.
    pub fn get_free_node(&mut self, class: usize) -> Result<*mut Cell, MemError> {
        let mut n = self.classes[class].free;
        if n == self.classes[class].new {
            self.get_new_page(class)?;
            n = self.classes[class].free;
        }
        // SAFETY: the cursor always points at a linked cell or the peg,
        // and the peg case was handled above.
        self.classes[class].free = unsafe { (*n).next };
        self.nodes_in_use += 1;
        Ok(n)
    }

    fn get_new_page(&mut self, class: usize) -> Result<(), MemError> {
        debug_assert!(class < NUM_SMALL_NODE_CLASSES);
        let node_sz = node_size(class);
        let count = page_node_count(class);

        // SAFETY: the page layout is valid and non-zero; zeroed storage
        // keeps reads of recycled element slots defined.
        let page = unsafe { alloc_zeroed(page_layout()) }.cast::<PageHeader>();
        if page.is_null() {
            return Err(MemError::HeapExhausted);
        }
        let ch = &mut self.classes[class];
        // SAFETY: freshly allocated page memory.
        unsafe { (*page).next = ch.pages };
        ch.pages = page;
        ch.page_count += 1;

        // Slice the page into slots, stamp each with the unmarked
        // template and snap it in front of the previous one so the free
        // span reads in address order from the cursor.
        let mut data = unsafe { page.add(1) }.cast::<u8>();
        let mut base = ch.new;
        for _ in 0..count {
            let s = data.cast::<Cell>();
            ch.alloc_count += 1;
            // SAFETY: `s` is an exclusive fresh slot inside the page.
            unsafe {
                s.write(Cell::template());
                snap(s, base);
                Cell::set_class(s, class);
            }
            base = s;
            ch.free = s;
            data = unsafe { data.add(node_sz) };
        }
        Ok(())
    }

    /// Whether the cell trigger is exhausted.
    pub fn no_free_nodes(&self) -> bool {
        self.nodes_in_use >= self.n_size
    }

    /// Remaining vector budget, in words. Signed: the budget can shrink
    /// below the live total.
    #[allow(clippy::cast_possible_wrap)]
    pub fn vheap_free(&self) -> i64 {
        self.v_size as i64 - self.large_valloc as i64 - self.small_valloc as i64
    }

    /// Whether every allocation entry must collect first.
    pub fn force_gc(&self) -> bool {
        self.torture && self.torture_inhibit == 0
    }

    /// Raise the cell-trigger cap; never below the current trigger.
    pub fn set_max_node_target(&mut self, size: usize) {
        if size >= self.n_size {
            self.max_n_size = size;
        }
    }

    /// Raise the vector-budget cap; never below the current budget.
    pub fn set_max_vector_words(&mut self, size: usize) {
        if size >= self.v_size {
            self.max_v_size = size;
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // SAFETY: the heap owns every page, large cell and peg; nothing
        // is read after deallocation.
        unsafe {
            for class in 0..NUM_SMALL_NODE_CLASSES {
                let mut page = self.classes[class].pages;
                while !page.is_null() {
                    let next = (*page).next;
                    dealloc(page.cast(), page_layout());
                    page = next;
                }
            }
            let large = &self.classes[LARGE_NODE_CLASS];
            let mut rings = vec![large.new];
            rings.extend_from_slice(&large.old);
            #[cfg(not(feature = "expel-old-to-new"))]
            rings.extend_from_slice(&large.old_to_new);
            for peg in rings {
                crate::links::for_each_on_ring(peg, |s| {
                    // SAFETY: large cells are exclusively heap-owned.
                    unsafe { crate::alloc::dealloc_large_cell(s) };
                });
            }
            for ch in &self.classes {
                drop(Box::from_raw(ch.new));
                for &peg in &ch.old {
                    drop(Box::from_raw(peg));
                }
                #[cfg(not(feature = "expel-old-to-new"))]
                for &peg in &ch.old_to_new {
                    drop(Box::from_raw(peg));
                }
            }
        }
    }
}

thread_local! {
    static HEAP: RefCell<Option<Heap>> = const { RefCell::new(None) };
}

/// Run `f` with exclusive access to the thread's heap, initializing it
/// with the default configuration on first touch.
pub(crate) fn with_heap<R>(f: impl FnOnce(&mut Heap) -> R) -> R {
    HEAP.with(|slot| {
        let mut slot = slot.borrow_mut();
        let heap = slot.get_or_insert_with(|| Heap::new(HeapConfig::default()));
        f(heap)
    })
}

/// Initialize this thread's heap with an explicit configuration.
///
/// # Panics
///
/// Panics if the heap was already initialized (or touched) on this
/// thread.
pub fn init_memory(config: HeapConfig) {
    HEAP.with(|slot| {
        let mut slot = slot.borrow_mut();
        assert!(
            slot.is_none(),
            "memory already initialized on this thread"
        );
        *slot = Some(Heap::new(config));
    });
}

/// Drop the thread's heap, releasing every page and large allocation.
/// The next touch re-initializes with defaults. Intended for tests.
pub(crate) fn reset_heap() {
    HEAP.with(|slot| {
        *slot.borrow_mut() = None;
    });
}
