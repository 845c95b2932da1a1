//! Protect-stack discipline.

use rata_gc::{
    cons, gc, nil, protect, protect_depth, protect_with_index, reprotect, unprotect,
    unprotect_ptr,
};

#[test]
fn protect_unprotect_round_trip() {
    let depth = protect_depth();
    let x = cons(nil(), nil()).unwrap();
    let y = protect(x);
    assert_eq!(x, y);
    assert_eq!(protect_depth(), depth + 1);
    unprotect(1);
    assert_eq!(protect_depth(), depth);
}

#[test]
fn unprotect_ptr_removes_from_the_middle() {
    let depth = protect_depth();
    let a = protect(cons(nil(), nil()).unwrap());
    let b = protect(cons(nil(), nil()).unwrap());
    let c = protect(cons(nil(), nil()).unwrap());
    unprotect_ptr(b);
    assert_eq!(protect_depth(), depth + 2);

    // The survivors are still rooted.
    gc();
    assert!(a.car().is_nil());
    assert!(c.car().is_nil());
    unprotect(2);
    assert_eq!(protect_depth(), depth);
}

#[test]
fn reprotect_rewrites_a_slot() {
    let a = cons(nil(), nil()).unwrap();
    let i = protect_with_index(a);
    let b = cons(nil(), a).unwrap();
    reprotect(b, i);
    gc();
    assert_eq!(b.cdr(), a);
    unprotect(1);
}

#[test]
fn protected_cells_survive_collection() {
    let a = protect(cons(nil(), nil()).unwrap());
    for _ in 0..5 {
        gc();
    }
    assert!(a.car().is_nil());
    unprotect(1);
}

#[test]
#[should_panic(expected = "stack imbalance")]
fn unbalanced_unprotect_panics() {
    unprotect(protect_depth() + 1);
}

#[test]
#[should_panic(expected = "pointer not found")]
fn unprotect_ptr_missing_panics() {
    let a = cons(nil(), nil()).unwrap();
    unprotect_ptr(a);
}

#[test]
#[should_panic(expected = "stack overflow")]
fn protect_overflow_is_fatal() {
    rata_gc::init_memory(rata_gc::HeapConfig {
        protect_stack_size: 8,
        ..rata_gc::HeapConfig::default()
    });
    let x = cons(nil(), nil()).unwrap();
    for _ in 0..9 {
        protect(x);
    }
}
