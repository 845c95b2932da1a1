//! Large-vector allocation and release accounting.

use rata_gc::test_util::large_vector_words;
use rata_gc::{alloc_vector, gc, protect, unprotect, HeapConfig, Kind, MemError};

#[test]
fn release_returns_payload_words_to_the_budget() {
    gc();
    let baseline = large_vector_words();

    let r = protect(alloc_vector(Kind::Real, 10_000).unwrap());
    assert_eq!(r.length(), 10_000);
    assert_eq!(large_vector_words(), baseline + 10_000);
    r.set_real_elt(9_999, 1.5);
    assert!((r.real_elt(9_999) - 1.5).abs() < f64::EPSILON);

    unprotect(1);
    gc();
    assert_eq!(large_vector_words(), baseline);

    // Nothing left to reclaim on a second pass.
    gc();
    assert_eq!(large_vector_words(), baseline);
}

#[test]
fn protected_large_vector_survives() {
    let baseline = large_vector_words();
    let r = protect(alloc_vector(Kind::Int, 50_000).unwrap());
    gc();
    assert_eq!(large_vector_words(), baseline + 25_000);
    assert_eq!(r.length(), 50_000);
    unprotect(1);
}

#[test]
fn complex_vector_words_are_double() {
    gc();
    let baseline = large_vector_words();
    let c = protect(alloc_vector(Kind::Complex, 1_000).unwrap());
    assert_eq!(large_vector_words(), baseline + 2_000);
    c.set_complex_elt(0, rata_gc::Complex { re: 1.0, im: -1.0 });
    assert!((c.complex_elt(0).im + 1.0).abs() < f64::EPSILON);
    unprotect(1);
}

#[test]
fn oversize_request_is_rejected() {
    let err = alloc_vector(Kind::Real, usize::MAX / 4).unwrap_err();
    assert_eq!(err, MemError::OversizeVector);
}

#[test]
fn vector_budget_exhaustion_reports_heap_exhausted() {
    rata_gc::init_memory(HeapConfig {
        initial_vector_words: 2_000,
        max_vector_words: 2_000,
        ..HeapConfig::default()
    });
    let err = alloc_vector(Kind::Real, 10_000).unwrap_err();
    assert_eq!(err, MemError::HeapExhausted);
}

#[test]
fn cell_trigger_exhaustion_reports_cons_exhausted() {
    rata_gc::init_memory(HeapConfig {
        initial_node_target: 300,
        max_node_target: 300,
        ..HeapConfig::default()
    });
    let mut last = None;
    for _ in 0..400 {
        match rata_gc::cons(rata_gc::nil(), rata_gc::nil()) {
            Ok(cell) => {
                rata_gc::protect(cell);
            }
            Err(e) => {
                last = Some(e);
                break;
            }
        }
    }
    assert_eq!(last, Some(MemError::ConsExhausted));
}
