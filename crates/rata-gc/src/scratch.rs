//! The scratch allocator: a high-water-mark stack for transient
//! buffers, layered on character-cell allocation.
//!
//! Scratch buffers chain through the attribute slot of their character
//! cells; the collector holds one head reference into the chain.
//! Callers snapshot the head with [`vmaxget`], allocate freely, and
//! restore with [`vmaxset`]; everything allocated since the snapshot
//! becomes unreachable and is reclaimed by the next collection.
//!
//! A separate bounded table of raw OS allocations ([`c_alloc`] /
//! [`c_free`]) supports code that needs memory surviving error
//! recovery; [`reset_c_allocations`] frees every outstanding entry.

use std::alloc::{alloc, alloc_zeroed, dealloc, realloc, Layout};
use std::cell::RefCell;
use std::ptr;

use crate::alloc::alloc_string;
use crate::cell::{vec_data_ptr, Cell};
use crate::error::MemError;
use crate::heap::with_heap;

/// A snapshot of the scratch stack, returned by [`vmaxget`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchMark(*mut Cell);

/// Snapshot the scratch stack head.
#[must_use]
pub fn vmaxget() -> ScratchMark {
    ScratchMark(with_heap(|h| h.vstack))
}

/// Restore the scratch stack head, releasing (at the next collection)
/// everything allocated since the matching [`vmaxget`].
pub fn vmaxset(mark: ScratchMark) {
    with_heap(|h| h.vstack = mark.0);
}

/// Allocate `nelem * elsize` bytes of scratch storage. Returns null for
/// an empty request. The buffer lives until the scratch stack is
/// restored past it.
///
/// # Errors
///
/// `OversizeVector` when the byte count overflows; allocation errors as
/// for vector allocation.
pub fn r_alloc(nelem: usize, elsize: usize) -> Result<*mut u8, MemError> {
    let size = nelem
        .checked_mul(elsize)
        .ok_or(MemError::OversizeVector)?;
    if size == 0 {
        return Ok(ptr::null_mut());
    }
    let s = alloc_string(size)?;
    with_heap(|h| {
        // Fresh cell, so the chain write needs no barrier.
        // SAFETY: `s` is live; the chain threads through the attribute
        // slot, which the collector traverses.
        unsafe { (*s.as_ptr()).attrib = h.vstack };
        h.vstack = s.as_ptr();
    });
    // SAFETY: the cell's storage covers `size` bytes.
    Ok(unsafe { vec_data_ptr::<u8>(s.as_ptr()) })
}

/// As [`r_alloc`], but the buffer is zeroed.
///
/// # Errors
///
/// As for [`r_alloc`].
pub fn s_alloc(nelem: usize, elsize: usize) -> Result<*mut u8, MemError> {
    let p = r_alloc(nelem, elsize)?;
    if !p.is_null() {
        // SAFETY: `p` covers `nelem * elsize` bytes (checked above).
        unsafe { ptr::write_bytes(p, 0, nelem * elsize) };
    }
    Ok(p)
}

/// Grow a scratch buffer from `old` to `new` elements, copying the old
/// contents and zeroing the tail. Shrinking is a no-op returning `p`.
///
/// # Errors
///
/// As for [`r_alloc`].
///
/// # Safety
///
/// `p` must be a buffer of at least `old * elsize` bytes obtained from
/// this allocator and still live under the current scratch mark.
pub unsafe fn s_realloc(
    p: *mut u8,
    new: usize,
    old: usize,
    elsize: usize,
) -> Result<*mut u8, MemError> {
    if new <= old {
        return Ok(p);
    }
    let q = r_alloc(new, elsize)?;
    let old_bytes = old * elsize;
    // SAFETY: caller guarantees `p` covers `old_bytes`; `q` covers
    // `new * elsize` which is larger.
    unsafe {
        ptr::copy_nonoverlapping(p, q, old_bytes);
        ptr::write_bytes(q.add(old_bytes), 0, new * elsize - old_bytes);
    }
    Ok(q)
}

// ----------------------------------------------------------------------
// Bounded raw-allocation table
// ----------------------------------------------------------------------

const MAX_POINTERS: usize = 100;

thread_local! {
    static C_POINTERS: RefCell<[Option<(*mut u8, Layout)>; MAX_POINTERS]> =
        const { RefCell::new([None; MAX_POINTERS]) };
}

/// Allocate raw memory registered in the bounded emergency table, so it
/// can be reclaimed wholesale during error recovery.
///
/// # Errors
///
/// `ScratchTableFull` when all table slots are in use, `HeapExhausted`
/// when the OS refuses, `OversizeVector` on byte-count overflow.
pub fn c_alloc(nelem: usize, elsize: usize) -> Result<*mut u8, MemError> {
    let size = nelem
        .checked_mul(elsize)
        .ok_or(MemError::OversizeVector)?
        .max(1);
    let layout = Layout::from_size_align(size, std::mem::align_of::<usize>())
        .map_err(|_| MemError::OversizeVector)?;
    C_POINTERS.with(|table| {
        let mut table = table.borrow_mut();
        let slot = table
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(MemError::ScratchTableFull)?;
        // SAFETY: layout is valid and non-zero.
        let p = unsafe { alloc(layout) };
        if p.is_null() {
            return Err(MemError::HeapExhausted);
        }
        *slot = Some((p, layout));
        Ok(p)
    })
}

/// Free a pointer obtained from [`c_alloc`].
///
/// # Errors
///
/// `UnknownScratchPointer` when the pointer is not in the table.
pub fn c_free(p: *mut u8) -> Result<(), MemError> {
    C_POINTERS.with(|table| {
        let mut table = table.borrow_mut();
        let slot = table
            .iter_mut()
            .find(|s| s.is_some_and(|(q, _)| q == p))
            .ok_or(MemError::UnknownScratchPointer)?;
        let (p, layout) = slot.take().expect("slot matched above");
        // SAFETY: the table records the original layout.
        unsafe { dealloc(p, layout) };
        Ok(())
    })
}

/// Free every outstanding [`c_alloc`] entry. Called by the error
/// recovery path.
pub fn reset_c_allocations() {
    C_POINTERS.with(|table| {
        for slot in table.borrow_mut().iter_mut() {
            if let Some((p, layout)) = slot.take() {
                // SAFETY: the table records the original layout.
                unsafe { dealloc(p, layout) };
            }
        }
    });
}

// ----------------------------------------------------------------------
// Checked OS-allocation wrappers
// ----------------------------------------------------------------------

/// Zeroed OS allocation that surfaces failure as an error instead of a
/// null pointer.
///
/// # Errors
///
/// `HeapExhausted` when the OS refuses, `OversizeVector` on overflow.
pub fn chk_calloc(nelem: usize, elsize: usize) -> Result<*mut u8, MemError> {
    let size = nelem
        .checked_mul(elsize)
        .ok_or(MemError::OversizeVector)?
        .max(1);
    let layout = Layout::from_size_align(size, std::mem::align_of::<usize>())
        .map_err(|_| MemError::OversizeVector)?;
    // SAFETY: layout is valid and non-zero.
    let p = unsafe { alloc_zeroed(layout) };
    if p.is_null() {
        Err(MemError::HeapExhausted)
    } else {
        Ok(p)
    }
}

/// Checked reallocation of a [`chk_calloc`] buffer.
///
/// # Errors
///
/// `HeapExhausted` when the OS refuses, `OversizeVector` on overflow.
///
/// # Safety
///
/// `p` must have been obtained from [`chk_calloc`] (or this function)
/// with exactly `old_size` bytes.
pub unsafe fn chk_realloc(
    p: *mut u8,
    old_size: usize,
    new_size: usize,
) -> Result<*mut u8, MemError> {
    let old_layout = Layout::from_size_align(old_size.max(1), std::mem::align_of::<usize>())
        .map_err(|_| MemError::OversizeVector)?;
    // SAFETY: caller guarantees `p` and `old_size` match.
    let q = unsafe { realloc(p, old_layout, new_size.max(1)) };
    if q.is_null() {
        Err(MemError::HeapExhausted)
    } else {
        Ok(q)
    }
}

/// Free a [`chk_calloc`] buffer. Null is tolerated.
///
/// # Safety
///
/// `p` must have been obtained from [`chk_calloc`] / [`chk_realloc`]
/// with exactly `size` bytes, and must not be used afterwards.
pub unsafe fn chk_free(p: *mut u8, size: usize) {
    if p.is_null() {
        return;
    }
    let layout = Layout::from_size_align(size.max(1), std::mem::align_of::<usize>())
        .expect("layout was valid at allocation");
    // SAFETY: caller guarantees the pair matches the allocation.
    unsafe { dealloc(p, layout) };
}
