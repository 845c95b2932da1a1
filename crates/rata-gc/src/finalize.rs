//! Finalization: registered (cell, action) pairs run after a cell
//! becomes unreachable.
//!
//! The registry is a chain of pair cells: car is the target, tag is the
//! action. During collection, entries whose target was left unmarked get
//! their pending bit set, and the registry itself is then forwarded so
//! pending targets stay alive for that one cycle. The finalizers run
//! after the collector returns, each entry unlinked *before* its action
//! runs so that an action that fails or re-registers cannot run twice.

use std::cell::Cell as StdCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;

use crate::alloc::{alloc_cell, cons};
use crate::cell::{Cell, CellRef, Kind, NativeFinalizer};
use crate::error::MemError;
use crate::gc::suspend_interrupts;
use crate::heap::with_heap;
use crate::roots::{protect, unprotect};

/// Hook through which callable finalizer actions are dispatched; the
/// interpreter installs its applicator here. Called with the action and
/// the finalized cell.
pub type ApplyHook = fn(action: CellRef, target: CellRef);

thread_local! {
    static APPLY_HOOK: StdCell<Option<ApplyHook>> = const { StdCell::new(None) };
}

/// Install (or clear) the applicator used to run callable finalizer
/// actions. Without one, callable actions are skipped with a warning;
/// native finalizers are unaffected.
pub fn set_apply_hook(hook: Option<ApplyHook>) {
    APPLY_HOOK.with(|h| h.set(hook));
}

fn check_target(target: CellRef) -> Result<(), MemError> {
    match target.kind() {
        Kind::Env | Kind::ExtPtr => Ok(()),
        _ => Err(MemError::InvalidFinalizerTarget),
    }
}

fn push_entry(target: CellRef, action: CellRef) -> Result<(), MemError> {
    let head = with_heap(|h| CellRef::new(h.fin_registered));
    let entry = cons(target, head)?;
    entry.set_tag(action);
    entry.set_pending(false);
    with_heap(|h| h.fin_registered = entry.as_ptr());
    Ok(())
}

/// Register a callable finalizer for an environment or external
/// pointer.
///
/// # Errors
///
/// `InvalidFinalizerTarget` / `InvalidFinalizerFunction` on type
/// mismatch, or an allocation error for the registry entry.
pub fn register_finalizer(target: CellRef, action: CellRef) -> Result<(), MemError> {
    check_target(target)?;
    match action.kind() {
        Kind::Closure | Kind::Builtin | Kind::Special => {}
        _ => return Err(MemError::InvalidFinalizerFunction),
    }
    push_entry(target, action)
}

/// Register a native finalizer for an environment or external pointer.
/// The function pointer is stored in a dedicated cell variant and
/// invoked with the target when it becomes unreachable.
///
/// # Errors
///
/// `InvalidFinalizerTarget` on type mismatch, or an allocation error.
pub fn register_native_finalizer(
    target: CellRef,
    func: NativeFinalizer,
) -> Result<(), MemError> {
    check_target(target)?;
    // The registry link built below is the action's only reference, so
    // keep the target rooted while the action cell is allocated.
    protect(target);
    let action = alloc_cell(Kind::NativeFin);
    let result = action.and_then(|action| {
        // SAFETY: a fresh NativeFin cell; the union field is the typed
        // function pointer.
        unsafe { (*action.as_ptr()).data.native.func = func };
        push_entry(target, action)
    });
    unprotect(1);
    result
}

/// Run every pending finalizer. Returns whether any ran.
///
/// Each action is isolated: a panic is caught and logged so it cannot
/// corrupt the allocation that triggered the collection.
pub(crate) fn run_pending_finalizers() -> bool {
    // Sweep the registry with interrupts suspended: unlink every
    // pending entry and keep it (with its payload) alive through the
    // protect stack while the actions run.
    let pending: Vec<*mut Cell> = suspend_interrupts(|| {
        with_heap(|h| {
            let mut pending = Vec::new();
            // SAFETY: the registry is a nil-terminated pair chain.
            unsafe {
                let nil = h.roots.nil;
                let mut last: *mut Cell = ptr::null_mut();
                let mut s = h.fin_registered;
                while s != nil {
                    let next = (*s).data.pair.cdr;
                    if CellRef::new(s).pending() {
                        if last.is_null() {
                            h.fin_registered = next;
                        } else {
                            h.check_old_to_new(last, next);
                            (*last).data.pair.cdr = next;
                        }
                        assert!(
                            h.roots.protect.len() < h.config.protect_stack_size,
                            "protect(): stack overflow"
                        );
                        h.roots.protect.push(s);
                        pending.push(s);
                    } else {
                        last = s;
                    }
                    s = next;
                }
            }
            pending
        })
    });
    if pending.is_empty() {
        return false;
    }

    for &s in &pending {
        let entry = CellRef::new(s);
        let target = entry.car();
        let action = entry.tag();
        let outcome = match action.kind() {
            Kind::NativeFin => {
                let func = action.native_finalizer();
                catch_unwind(AssertUnwindSafe(|| func(target)))
            }
            _ => match APPLY_HOOK.with(StdCell::get) {
                Some(hook) => catch_unwind(AssertUnwindSafe(|| hook(action, target))),
                None => {
                    tracing::warn!("no apply hook installed; callable finalizer skipped");
                    Ok(())
                }
            },
        };
        if outcome.is_err() {
            tracing::warn!("finalizer failed; error discarded");
        }
    }
    unprotect(pending.len());
    true
}
