//! The root registry: built-in singletons, the symbol table, the
//! context chain, the protect stack and the preserved-objects list.
//!
//! The protect stack is the only way interpreter code keeps freshly
//! allocated intermediates alive across an operation that may itself
//! allocate. `protect` returns its argument so allocation and rooting
//! compose in one expression.

use std::ptr;

use crate::alloc::{cons, mk_char};
use crate::cell::{Cell, CellRef, Kind};
use crate::error::MemError;
use crate::heap::{with_heap, Heap};

/// Every root the collector scans, in scan order.
pub(crate) struct RootSet {
    pub nil: *mut Cell,
    pub unbound_value: *mut Cell,
    pub missing_arg: *mut Cell,
    pub blank_string: *mut Cell,
    pub na_string: *mut Cell,
    pub comment_marker: *mut Cell,
    pub warnings: *mut Cell,
    pub global_env: *mut Cell,
    pub symbol_table: Vec<*mut Cell>,
    pub dots_symbol: *mut Cell,
    pub current_expr: *mut Cell,
    /// On-exit expressions of the call-evaluation context chain.
    pub contexts: Vec<*mut Cell>,
    pub protect: Vec<*mut Cell>,
    pub preserved: *mut Cell,
}

impl RootSet {
    pub fn empty() -> Self {
        Self {
            nil: ptr::null_mut(),
            unbound_value: ptr::null_mut(),
            missing_arg: ptr::null_mut(),
            blank_string: ptr::null_mut(),
            na_string: ptr::null_mut(),
            comment_marker: ptr::null_mut(),
            warnings: ptr::null_mut(),
            global_env: ptr::null_mut(),
            symbol_table: Vec::new(),
            dots_symbol: ptr::null_mut(),
            current_expr: ptr::null_mut(),
            contexts: Vec::new(),
            protect: Vec::new(),
            preserved: ptr::null_mut(),
        }
    }
}

/// Bucket hash for symbol names.
pub(crate) fn symbol_hash(bytes: &[u8]) -> usize {
    let mut h: usize = 5381;
    for &b in bytes {
        h = h.wrapping_shl(5).wrapping_add(h).wrapping_add(usize::from(b));
    }
    h
}

impl Heap {
    /// Find an interned symbol by name.
    pub(crate) fn lookup_symbol(&self, name: &str) -> Option<*mut Cell> {
        let table = &self.roots.symbol_table;
        let bucket = symbol_hash(name.as_bytes()) % table.len();
        let mut entry = table[bucket];
        // SAFETY: bucket chains are pair cells whose cars are symbols;
        // the chain terminates at nil.
        unsafe {
            while Cell::kind_of(entry) != Kind::Nil {
                let sym = (*entry).data.pair.car;
                let pname = (*sym).data.pair.car;
                let len = (*pname).data.vec.length;
                let data = crate::cell::vec_data_ptr::<u8>(pname);
                if std::slice::from_raw_parts(data, len) == name.as_bytes() {
                    return Some(sym);
                }
                entry = (*entry).data.pair.cdr;
            }
        }
        None
    }
}

// ----------------------------------------------------------------------
// Singletons
// ----------------------------------------------------------------------

/// The nil cell.
#[must_use]
pub fn nil() -> CellRef {
    with_heap(|h| CellRef::new(h.roots.nil))
}

/// The missing-argument marker.
#[must_use]
pub fn missing_arg() -> CellRef {
    with_heap(|h| CellRef::new(h.roots.missing_arg))
}

/// The unbound-value marker.
#[must_use]
pub fn unbound_value() -> CellRef {
    with_heap(|h| CellRef::new(h.roots.unbound_value))
}

/// The empty character cell.
#[must_use]
pub fn blank_string() -> CellRef {
    with_heap(|h| CellRef::new(h.roots.blank_string))
}

/// The NA character cell.
#[must_use]
pub fn na_string() -> CellRef {
    with_heap(|h| CellRef::new(h.roots.na_string))
}

/// The comment-attribute marker symbol.
#[must_use]
pub fn comment_marker() -> CellRef {
    with_heap(|h| CellRef::new(h.roots.comment_marker))
}

/// The distinguished dots symbol, compared by identity during argument
/// matching.
#[must_use]
pub fn dots_symbol() -> CellRef {
    with_heap(|h| CellRef::new(h.roots.dots_symbol))
}

/// The global environment.
#[must_use]
pub fn global_env() -> CellRef {
    with_heap(|h| CellRef::new(h.roots.global_env))
}

/// The pending-warnings list.
#[must_use]
pub fn warnings() -> CellRef {
    with_heap(|h| CellRef::new(h.roots.warnings))
}

/// Replace the pending-warnings list.
pub fn set_warnings(w: CellRef) {
    with_heap(|h| h.roots.warnings = w.as_ptr());
}

/// The current top-level expression.
#[must_use]
pub fn current_expr() -> CellRef {
    with_heap(|h| CellRef::new(h.roots.current_expr))
}

/// Replace the current top-level expression.
pub fn set_current_expr(e: CellRef) {
    with_heap(|h| h.roots.current_expr = e.as_ptr());
}

// ----------------------------------------------------------------------
// Context chain
// ----------------------------------------------------------------------

/// Enter a call-evaluation context carrying an on-exit expression. The
/// expression is a root until the context is popped.
pub fn push_context(on_exit: CellRef) {
    with_heap(|h| h.roots.contexts.push(on_exit.as_ptr()));
}

/// Leave the innermost call-evaluation context.
pub fn pop_context() -> Option<CellRef> {
    with_heap(|h| h.roots.contexts.pop().map(CellRef::new))
}

// ----------------------------------------------------------------------
// Protect stack
// ----------------------------------------------------------------------

/// A saved position on the protect stack, for [`reprotect`].
#[derive(Debug, Clone, Copy)]
pub struct ProtectIndex(usize);

/// Push a cell onto the protect stack and return it.
///
/// # Panics
///
/// Panics when the stack is full: the overflow cannot be reported
/// through an allocation, so it is fatal.
pub fn protect(s: CellRef) -> CellRef {
    with_heap(|h| {
        assert!(
            h.roots.protect.len() < h.config.protect_stack_size,
            "protect(): stack overflow"
        );
        h.roots.protect.push(s.as_ptr());
    });
    s
}

/// Pop the top `n` entries from the protect stack.
///
/// # Panics
///
/// Panics when fewer than `n` entries are on the stack.
pub fn unprotect(n: usize) {
    with_heap(|h| {
        let top = h.roots.protect.len();
        assert!(top >= n, "unprotect(): stack imbalance");
        h.roots.protect.truncate(top - n);
    });
}

/// Remove a specific cell from the protect stack, wherever it sits
/// (expected near the top); entries above it slide down.
///
/// # Panics
///
/// Panics when the cell is not on the stack.
pub fn unprotect_ptr(s: CellRef) {
    with_heap(|h| {
        let pos = h
            .roots
            .protect
            .iter()
            .rposition(|&p| p == s.as_ptr())
            .expect("unprotect_ptr: pointer not found");
        h.roots.protect.remove(pos);
    });
}

/// Push a cell and report the slot it occupies, so the slot can later be
/// rewritten with [`reprotect`].
pub fn protect_with_index(s: CellRef) -> ProtectIndex {
    protect(s);
    ProtectIndex(with_heap(|h| h.roots.protect.len() - 1))
}

/// Replace an earlier protect slot in place.
///
/// # Panics
///
/// Panics when the index no longer refers to a live slot.
pub fn reprotect(s: CellRef, i: ProtectIndex) {
    with_heap(|h| {
        let slot = h
            .roots
            .protect
            .get_mut(i.0)
            .expect("reprotect: stale protect index");
        *slot = s.as_ptr();
    });
}

/// Current protect-stack depth. Useful for balancing checks in tests.
#[must_use]
pub fn protect_depth() -> usize {
    with_heap(|h| h.roots.protect.len())
}

// ----------------------------------------------------------------------
// Preserved objects
// ----------------------------------------------------------------------

/// Pin a cell across collections until [`release`]d. Registration
/// prepends to the preserved list.
///
/// # Errors
///
/// Returns an error when the list cell cannot be allocated.
pub fn preserve(object: CellRef) -> Result<(), MemError> {
    let head = with_heap(|h| CellRef::new(h.roots.preserved));
    let entry = cons(object, head)?;
    with_heap(|h| h.roots.preserved = entry.as_ptr());
    Ok(())
}

/// Release the first preserved entry holding `object`. A no-op when the
/// object was never preserved.
pub fn release(object: CellRef) {
    let mut prev: Option<CellRef> = None;
    let mut cur = with_heap(|h| CellRef::new(h.roots.preserved));
    while !cur.is_nil() {
        if cur.car() == object {
            match prev {
                None => with_heap(|h| h.roots.preserved = cur.cdr().as_ptr()),
                Some(p) => {
                    p.set_cdr(cur.cdr());
                }
            }
            return;
        }
        prev = Some(cur);
        cur = cur.cdr();
    }
}

// ----------------------------------------------------------------------
// Symbol interning
// ----------------------------------------------------------------------

/// Intern a symbol by name, creating it on first use. Symbols are
/// unique: repeated interning returns the identical cell, which is what
/// makes identity comparison against the dots symbol sound.
///
/// # Errors
///
/// Returns an error when the symbol or its print name cannot be
/// allocated.
pub fn intern(name: &str) -> Result<CellRef, MemError> {
    if let Some(sym) = with_heap(|h| h.lookup_symbol(name)) {
        return Ok(CellRef::new(sym));
    }
    let pname = protect(mk_char(name)?);
    let sym = intern_new(name, pname);
    unprotect(1);
    sym
}

fn intern_new(name: &str, pname: CellRef) -> Result<CellRef, MemError> {
    let sym = protect(crate::alloc::alloc_cell(Kind::Symbol)?);
    sym.set_print_name(pname);
    sym.set_sym_value(unbound_value());
    let bucket = with_heap(|h| {
        let bucket = symbol_hash(name.as_bytes()) % h.roots.symbol_table.len();
        CellRef::new(h.roots.symbol_table[bucket])
    });
    let entry = cons(sym, bucket);
    unprotect(1);
    let entry = entry?;
    with_heap(|h| {
        let i = symbol_hash(name.as_bytes()) % h.roots.symbol_table.len();
        h.roots.symbol_table[i] = entry.as_ptr();
    });
    Ok(sym)
}
