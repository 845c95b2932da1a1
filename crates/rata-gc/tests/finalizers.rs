//! Finalization: run-once, isolation, type checks and the apply hook.

use std::cell::Cell;

use rata_gc::test_util::cells_in_use;
use rata_gc::{
    alloc_cell, cons, gc, mk_external_ptr, nil, protect, register_finalizer,
    register_native_finalizer, set_apply_hook, unprotect, CellRef, Kind, MemError,
};

thread_local! {
    static RUNS: Cell<usize> = const { Cell::new(0) };
    static HOOK_RUNS: Cell<usize> = const { Cell::new(0) };
    static LAST_ADDR: Cell<usize> = const { Cell::new(0) };
}

fn counting_finalizer(_target: CellRef) {
    RUNS.with(|r| r.set(r.get() + 1));
}

fn panicking_finalizer(_target: CellRef) {
    RUNS.with(|r| r.set(r.get() + 1));
    panic!("finalizer deliberately failed");
}

fn addr_reading_finalizer(target: CellRef) {
    LAST_ADDR.with(|a| a.set(target.external_addr() as usize));
}

fn apply_hook(_action: CellRef, _target: CellRef) {
    HOOK_RUNS.with(|r| r.set(r.get() + 1));
}

#[test]
fn native_finalizer_runs_once_when_target_dies() {
    let env = protect(alloc_cell(Kind::Env).unwrap());
    register_native_finalizer(env, counting_finalizer).unwrap();

    gc();
    assert_eq!(RUNS.with(Cell::get), 0, "rooted target must not finalize");

    unprotect(1);
    gc();
    assert_eq!(RUNS.with(Cell::get), 1);

    gc();
    assert_eq!(RUNS.with(Cell::get), 1, "a registration runs at most once");
}

#[test]
fn panicking_finalizer_is_isolated() {
    let hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(|_| {}));

    let env = alloc_cell(Kind::Env).unwrap();
    register_native_finalizer(env, panicking_finalizer).unwrap();
    gc();
    assert_eq!(RUNS.with(Cell::get), 1);

    // The failure was swallowed; the heap is still fully usable and the
    // registry no longer holds the entry.
    let p = protect(cons(nil(), nil()).unwrap());
    gc();
    assert!(p.car().is_nil());
    assert_eq!(RUNS.with(Cell::get), 1);
    unprotect(1);

    std::panic::set_hook(hook);
}

#[test]
fn external_pointer_finalizer_reads_the_address() {
    let raw = Box::into_raw(Box::new(42u64));
    let ptr = mk_external_ptr(raw.cast(), nil(), nil()).unwrap();
    register_native_finalizer(ptr, addr_reading_finalizer).unwrap();
    gc();
    assert_eq!(LAST_ADDR.with(Cell::get), raw as usize);
    // SAFETY: the finalizer only recorded the address; the box is still
    // ours to free.
    drop(unsafe { Box::from_raw(raw) });
}

#[test]
fn callable_finalizer_dispatches_through_the_hook() {
    set_apply_hook(Some(apply_hook));
    let env = alloc_cell(Kind::Env).unwrap();
    let action = protect(alloc_cell(Kind::Builtin).unwrap());
    action.set_prim_offset(7);
    register_finalizer(env, action).unwrap();
    unprotect(1);
    gc();
    assert_eq!(HOOK_RUNS.with(Cell::get), 1);
    set_apply_hook(None);
}

#[test]
fn finalizer_memory_is_reclaimed() {
    gc();
    let baseline = cells_in_use();
    let env = alloc_cell(Kind::Env).unwrap();
    register_native_finalizer(env, counting_finalizer).unwrap();
    gc();
    assert_eq!(RUNS.with(Cell::get), 1);
    // The target survived the finalizing cycle; one more collection
    // frees it together with the unlinked registry entry.
    gc();
    assert_eq!(cells_in_use(), baseline);
}

#[test]
fn registration_type_checks() {
    let pair = alloc_cell(Kind::Pair).unwrap();
    let closure = alloc_cell(Kind::Closure).unwrap();
    assert_eq!(
        register_finalizer(pair, closure).unwrap_err(),
        MemError::InvalidFinalizerTarget
    );

    let env = alloc_cell(Kind::Env).unwrap();
    let not_callable = alloc_cell(Kind::Pair).unwrap();
    assert_eq!(
        register_finalizer(env, not_callable).unwrap_err(),
        MemError::InvalidFinalizerFunction
    );
    assert_eq!(
        register_native_finalizer(pair, counting_finalizer).unwrap_err(),
        MemError::InvalidFinalizerTarget
    );
}
