//! Allocation entry points.
//!
//! Every entry begins with the collection pre-check: under torture mode,
//! when the cell trigger is exhausted, or when a vector request exceeds
//! the remaining budget, the inputs are protected and a collection runs
//! before the cell is taken. `cons` and friends protect their own
//! arguments only when a collection will actually occur, so the fast
//! path stays free of root traffic.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ffi::c_void;
use std::ptr;

use crate::cell::{
    vec_data_ptr, Cell, CellRef, Kind, LARGE_NODE_CLASS, NODE_CLASS_SIZE,
    NUM_SMALL_NODE_CLASSES, VEC_WORD,
};
use crate::error::MemError;
use crate::heap::with_heap;
use crate::links::snap;
use crate::roots::{protect, unprotect};

/// Vector words needed by `length` elements of the given kind.
/// `Err(OversizeVector)` when the byte count overflows.
pub(crate) fn vec_words(kind: Kind, length: usize) -> Result<usize, MemError> {
    let elem_bytes = match kind {
        Kind::Char => {
            let bytes = length.checked_add(1).ok_or(MemError::OversizeVector)?;
            return Ok(bytes.div_ceil(VEC_WORD));
        }
        Kind::Logical | Kind::Int => 4,
        Kind::Real => 8,
        Kind::Complex => 16,
        Kind::Str | Kind::Vec | Kind::Expr => std::mem::size_of::<*mut Cell>(),
        _ => return Err(MemError::OversizeVector),
    };
    if length == 0 {
        return Ok(0);
    }
    let bytes = length
        .checked_mul(elem_bytes)
        .ok_or(MemError::OversizeVector)?;
    Ok(bytes.div_ceil(VEC_WORD))
}

/// The smallest small class whose inline capacity holds `words`, or
/// `None` when only the large class fits.
pub(crate) fn small_class_for(words: usize) -> Option<usize> {
    (1..NUM_SMALL_NODE_CLASSES).find(|&c| words <= NODE_CLASS_SIZE[c])
}

fn large_layout(words: usize) -> Result<Layout, MemError> {
    let bytes = words
        .checked_mul(VEC_WORD)
        .and_then(|b| b.checked_add(std::mem::size_of::<Cell>()))
        .ok_or(MemError::OversizeVector)?;
    Layout::from_size_align(bytes, std::mem::align_of::<Cell>())
        .map_err(|_| MemError::OversizeVector)
}

/// Free a large-class cell, header and trailing payload together.
pub(crate) unsafe fn dealloc_large_cell(s: *mut Cell) {
    // SAFETY: the header is still intact, so the original layout can be
    // recomputed from the kind and length.
    unsafe {
        let kind = Cell::kind_of(s);
        let words =
            vec_words(kind, (*s).data.vec.length).expect("live large vector has a valid size");
        let layout = large_layout(words).expect("live large vector has a valid layout");
        dealloc(s.cast(), layout);
    }
}

/// Words of payload a large cell carries, for the release accounting.
pub(crate) unsafe fn large_cell_words(s: *mut Cell) -> usize {
    // SAFETY: as for `dealloc_large_cell`.
    unsafe {
        vec_words(Cell::kind_of(s), (*s).data.vec.length)
            .expect("live large vector has a valid size")
    }
}

/// Pre-check shared by every allocation entry. `words_needed` is zero
/// for non-vector requests. When a collection is required the given
/// inputs are protected across it.
fn gc_precheck(inputs: &[CellRef], words_needed: usize) -> Result<(), MemError> {
    #[allow(clippy::cast_possible_wrap)]
    let need = with_heap(|h| {
        h.force_gc()
            || h.no_free_nodes()
            || (words_needed > 0 && words_needed as i64 > h.vheap_free())
    });
    if !need {
        return Ok(());
    }
    for &r in inputs {
        protect(r);
    }
    crate::gc::gc_internal(words_needed);
    unprotect(inputs.len());
    #[allow(clippy::cast_possible_wrap)]
    with_heap(|h| {
        if h.no_free_nodes() {
            return Err(MemError::ConsExhausted);
        }
        if words_needed > 0 && words_needed as i64 > h.vheap_free() {
            return Err(MemError::HeapExhausted);
        }
        Ok(())
    })
}

/// Allocate a class-0 cell of the given kind with car, cdr, tag and
/// attribute initialized to nil.
///
/// # Errors
///
/// `ConsExhausted` when no free cell remains after a collection,
/// `HeapExhausted` when a fresh page cannot be obtained from the OS.
pub fn alloc_cell(kind: Kind) -> Result<CellRef, MemError> {
    gc_precheck(&[], 0)?;
    with_heap(|h| {
        let s = h.get_free_node(0)?;
        let nil = h.roots.nil;
        // SAFETY: fresh class-0 slot off the free cursor.
        unsafe {
            (*s).info = kind as u32;
            (*s).attrib = nil;
            (*s).data.pair.car = nil;
            (*s).data.pair.cdr = nil;
            (*s).data.pair.tag = nil;
        }
        Ok(CellRef::new(s))
    })
}

/// Allocate a class-0 cell initializing only the tag and attribute;
/// used for records whose payload is not pair-shaped.
fn alloc_cell_non_cons(kind: Kind) -> Result<CellRef, MemError> {
    gc_precheck(&[], 0)?;
    with_heap(|h| {
        let s = h.get_free_node(0)?;
        let nil = h.roots.nil;
        // SAFETY: fresh class-0 slot off the free cursor.
        unsafe {
            (*s).info = kind as u32;
            (*s).attrib = nil;
            (*s).data.pair.tag = nil;
            (*s).data.vec.length = 0;
            (*s).data.vec.truelength = 0;
        }
        Ok(CellRef::new(s))
    })
}

/// Allocate a pair with the given car and cdr; tag and attribute start
/// nil. The arguments are protected automatically when a collection has
/// to run first.
///
/// # Errors
///
/// As for [`alloc_cell`].
pub fn cons(car: CellRef, cdr: CellRef) -> Result<CellRef, MemError> {
    gc_precheck(&[car, cdr], 0)?;
    with_heap(|h| {
        let s = h.get_free_node(0)?;
        let nil = h.roots.nil;
        // SAFETY: fresh class-0 slot off the free cursor.
        unsafe {
            (*s).info = Kind::Pair as u32;
            (*s).attrib = nil;
            (*s).data.pair.car = car.as_ptr();
            (*s).data.pair.cdr = cdr.as_ptr();
            (*s).data.pair.tag = nil;
        }
        Ok(CellRef::new(s))
    })
}

/// Allocate a chain of `n` pairs, each slot nil.
///
/// # Errors
///
/// As for [`alloc_cell`].
pub fn alloc_list(n: usize) -> Result<CellRef, MemError> {
    let mut result = crate::roots::nil();
    for _ in 0..n {
        result = cons(crate::roots::nil(), result)?;
    }
    Ok(result)
}

/// Create an environment extending `parent` with a frame pairing the
/// tags of `names` with the elements of `values`. The names list may be
/// shorter, tagging only a prefix; remaining values keep the tags they
/// already carry.
///
/// # Errors
///
/// As for [`alloc_cell`].
pub fn new_environment(
    names: CellRef,
    values: CellRef,
    parent: CellRef,
) -> Result<CellRef, MemError> {
    gc_precheck(&[names, values, parent], 0)?;
    let newrho = with_heap(|h| {
        let s = h.get_free_node(0)?;
        let nil = h.roots.nil;
        // SAFETY: fresh class-0 slot off the free cursor.
        unsafe {
            (*s).info = Kind::Env as u32;
            (*s).attrib = nil;
            (*s).data.env.frame = values.as_ptr();
            (*s).data.env.enclos = parent.as_ptr();
            (*s).data.env.hashtab = nil;
        }
        Ok::<_, MemError>(CellRef::new(s))
    })?;
    let mut v = values;
    let mut n = names;
    while !v.is_nil() && !n.is_nil() {
        v.set_tag(n.tag());
        v = v.cdr();
        n = n.cdr();
    }
    Ok(newrho)
}

/// Allocate a promise over `expr` in `env`; the value slot starts as the
/// unbound marker and the seen flag clear.
///
/// # Errors
///
/// As for [`alloc_cell`].
pub fn mk_promise(expr: CellRef, env: CellRef) -> Result<CellRef, MemError> {
    gc_precheck(&[expr, env], 0)?;
    with_heap(|h| {
        let s = h.get_free_node(0)?;
        let nil = h.roots.nil;
        // SAFETY: fresh class-0 slot off the free cursor.
        unsafe {
            (*s).info = Kind::Promise as u32;
            (*s).attrib = nil;
            (*s).data.pair.car = h.roots.unbound_value;
            (*s).data.pair.cdr = expr.as_ptr();
            (*s).data.pair.tag = env.as_ptr();
        }
        Ok(CellRef::new(s))
    })
}

/// Allocate an external pointer over a raw address with the given tag
/// and protected cell.
///
/// # Errors
///
/// As for [`alloc_cell`].
pub fn mk_external_ptr(
    addr: *mut c_void,
    tag: CellRef,
    prot: CellRef,
) -> Result<CellRef, MemError> {
    gc_precheck(&[tag, prot], 0)?;
    with_heap(|h| {
        let s = h.get_free_node(0)?;
        let nil = h.roots.nil;
        // SAFETY: fresh class-0 slot off the free cursor.
        unsafe {
            (*s).info = Kind::ExtPtr as u32;
            (*s).attrib = nil;
            (*s).data.extptr.addr = addr;
            (*s).data.extptr.prot = prot.as_ptr();
            (*s).data.extptr.tag = tag.as_ptr();
        }
        Ok(CellRef::new(s))
    })
}

/// Allocate a vector of the given kind and length.
///
/// List-like and language-like kinds produce pair chains (a zero-length
/// language form is nil). Zero-length payloads produce a bare record.
/// Otherwise the smallest fitting small class is used, falling back to
/// one dedicated OS allocation for the large class. String and generic
/// vector elements are initialized to the blank string and nil.
///
/// # Errors
///
/// `ConsExhausted` / `HeapExhausted` as for [`alloc_cell`],
/// `OversizeVector` when the byte count overflows the budget counter.
pub fn alloc_vector(kind: Kind, length: usize) -> Result<CellRef, MemError> {
    match kind {
        Kind::Nil => return Ok(crate::roots::nil()),
        Kind::Lang => {
            if length == 0 {
                return Ok(crate::roots::nil());
            }
            let s = alloc_list(length)?;
            s.set_kind(Kind::Lang);
            return Ok(s);
        }
        Kind::Pair => return alloc_list(length),
        Kind::Char
        | Kind::Logical
        | Kind::Int
        | Kind::Real
        | Kind::Complex
        | Kind::Str
        | Kind::Vec
        | Kind::Expr => {}
        other => panic!("invalid kind {other:?} in vector allocation"),
    }

    let words = vec_words(kind, length)?;
    let (class, alloc_size) = small_class_for(words)
        .map_or((LARGE_NODE_CLASS, words), |c| (c, NODE_CLASS_SIZE[c]));

    // The budget may have been grown for this request; remember the old
    // trigger so an OS refusal can roll it back.
    let old_v_size = with_heap(|h| h.v_size);
    gc_precheck(&[], alloc_size)?;

    let s = if words > 0 {
        if class < NUM_SMALL_NODE_CLASSES {
            with_heap(|h| {
                let s = h.get_free_node(class)?;
                let nil = h.roots.nil;
                // SAFETY: fresh slot of the right class.
                unsafe {
                    (*s).info = kind as u32;
                    Cell::set_class(s, class);
                    (*s).attrib = nil;
                }
                h.small_valloc += alloc_size;
                Ok::<_, MemError>(CellRef::new(s))
            })?
        } else {
            let layout = large_layout(words)?;
            with_heap(|h| {
                // SAFETY: layout is valid and non-zero; zeroed storage
                // keeps recycled reads defined.
                let s = unsafe { alloc_zeroed(layout) }.cast::<Cell>();
                if s.is_null() {
                    h.v_size = old_v_size;
                    return Err(MemError::HeapExhausted);
                }
                let ch = &mut h.classes[LARGE_NODE_CLASS];
                let nil = h.roots.nil;
                // SAFETY: freshly allocated cell storage.
                unsafe {
                    (*s).info = kind as u32;
                    Cell::set_class(s, LARGE_NODE_CLASS);
                    (*s).attrib = nil;
                    snap(s, ch.new);
                }
                ch.alloc_count += 1;
                h.large_valloc += words;
                Ok(CellRef::new(s))
            })?
        }
    } else {
        // Zero-payload vectors reuse the bare-record path; a torture
        // collection already ran above, so inhibit a second one.
        with_heap(|h| h.torture_inhibit += 1);
        let r = alloc_cell_non_cons(kind);
        with_heap(|h| h.torture_inhibit -= 1);
        r?
    };

    s.set_length(length);
    s.set_truelength(length);
    s.set_named(0);

    // Fresh cells are at least as new as the blank string and nil, so
    // these element writes need no barrier.
    match kind {
        Kind::Str => {
            let blank = crate::roots::blank_string();
            // SAFETY: element storage covers `length` references.
            unsafe {
                let data = vec_data_ptr::<*mut Cell>(s.as_ptr());
                for i in 0..length {
                    *data.add(i) = blank.as_ptr();
                }
            }
        }
        Kind::Vec | Kind::Expr => {
            let nil = crate::roots::nil();
            // SAFETY: element storage covers `length` references.
            unsafe {
                let data = vec_data_ptr::<*mut Cell>(s.as_ptr());
                for i in 0..length {
                    *data.add(i) = nil.as_ptr();
                }
            }
        }
        _ => {}
    }
    Ok(s)
}

/// Allocate a character cell able to hold `length` bytes plus the
/// trailing NUL.
///
/// # Errors
///
/// As for [`alloc_vector`].
pub fn alloc_string(length: usize) -> Result<CellRef, MemError> {
    alloc_vector(Kind::Char, length)
}

/// Allocate a character cell holding a copy of `s`.
///
/// # Errors
///
/// As for [`alloc_vector`].
pub fn mk_char(s: &str) -> Result<CellRef, MemError> {
    let cell = alloc_string(s.len())?;
    // SAFETY: capacity is at least `len + 1` bytes.
    unsafe {
        let data = vec_data_ptr::<u8>(cell.as_ptr());
        ptr::copy_nonoverlapping(s.as_ptr(), data, s.len());
        *data.add(s.len()) = 0;
    }
    Ok(cell)
}
