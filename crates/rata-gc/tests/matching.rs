//! Argument matching: psmatch algebra, the three-pass protocol, dots
//! gathering and the failure modes.

use rata_gc::{
    alloc_list, alloc_vector, cons, dots_symbol, intern, match_args, match_par, missing_arg,
    nil, pmatch, protect, psmatch, unprotect, CellRef, Kind, MemError,
};

fn int_scalar(v: i32) -> CellRef {
    let x = alloc_vector(Kind::Int, 1).unwrap();
    x.set_int_elt(0, v);
    x
}

/// Build a tagged list from (tag-name, value) pairs; an empty tag name
/// leaves the entry untagged.
fn tagged_list(entries: &[(&str, CellRef)]) -> CellRef {
    let list = protect(alloc_list(entries.len()).unwrap());
    let mut cur = list;
    for (name, value) in entries {
        cur.set_car(*value);
        if !name.is_empty() {
            cur.set_tag(intern(name).unwrap());
        }
        cur = cur.cdr();
    }
    unprotect(1);
    list
}

fn formals_list(names: &[&str]) -> CellRef {
    let list = protect(alloc_list(names.len()).unwrap());
    let mut cur = list;
    for name in names {
        if *name == "..." {
            cur.set_tag(dots_symbol());
        } else {
            cur.set_tag(intern(name).unwrap());
        }
        cur = cur.cdr();
    }
    unprotect(1);
    list
}

#[test]
fn psmatch_prefix_and_exact() {
    assert!(psmatch("aa", "aaa", false));
    assert!(psmatch("aaa", "aaa", false));
    assert!(!psmatch("aaa", "aa", false));
    assert!(!psmatch("ab", "aaa", false));
    assert!(psmatch("", "anything", false));
    assert!(psmatch("aaa", "aaa", true));
    assert!(!psmatch("aa", "aaa", true));
}

#[test]
fn pmatch_rejects_unmatchable_tags() {
    let sym = intern("alpha").unwrap();
    let num = int_scalar(1);
    assert_eq!(
        pmatch(sym, num, false).unwrap_err(),
        MemError::InvalidPartialStringMatch
    );
}

#[test]
fn exact_partial_and_dots_gathering() {
    let formals = protect(formals_list(&["alpha", "beta", "..."]));
    let v1 = protect(int_scalar(1));
    let v2 = protect(int_scalar(2));
    let v3 = protect(int_scalar(3));
    let v4 = protect(int_scalar(4));
    let supplied = protect(tagged_list(&[("al", v1), ("bet", v2), ("", v3), ("", v4)]));

    let actuals = protect(match_args(formals, supplied).unwrap());
    assert_eq!(actuals.car(), v1);
    assert_eq!(actuals.cadr(), v2);

    let dots = actuals.caddr();
    assert_eq!(dots.kind(), Kind::Dots);
    assert_eq!(dots.car(), v3);
    assert!(dots.tag().is_nil());
    assert_eq!(dots.cadr(), v4);
    assert!(dots.cddr().is_nil());
    unprotect(7);
}

#[test]
fn duplicate_partial_after_exact_is_a_multiple_match() {
    let formals = protect(formals_list(&["alpha", "beta", "..."]));
    let v1 = protect(int_scalar(1));
    let v2 = protect(int_scalar(2));
    let supplied = protect(tagged_list(&[("alpha", v1), ("alp", v2)]));
    let err = match_args(formals, supplied).unwrap_err();
    assert!(matches!(err, MemError::MultipleMatch(_)));
    unprotect(4);
}

#[test]
fn supplied_matching_two_formals_is_a_multiple_match() {
    let formals = protect(formals_list(&["alpha", "aleph"]));
    let v1 = protect(int_scalar(1));
    let supplied = protect(tagged_list(&[("al", v1)]));
    let err = match_args(formals, supplied).unwrap_err();
    assert!(matches!(err, MemError::MultipleMatch(_)));
    unprotect(3);
}

#[test]
fn positional_fills_remaining_formals_in_order() {
    let formals = protect(formals_list(&["x", "y", "z"]));
    let v1 = protect(int_scalar(1));
    let v2 = protect(int_scalar(2));
    let v3 = protect(int_scalar(3));
    let supplied = protect(tagged_list(&[("", v1), ("z", v3), ("", v2)]));

    let actuals = protect(match_args(formals, supplied).unwrap());
    assert_eq!(actuals.car(), v1);
    assert_eq!(actuals.cadr(), v2);
    assert_eq!(actuals.caddr(), v3);
    unprotect(6);
}

#[test]
fn unfilled_formals_hold_the_missing_marker() {
    let formals = protect(formals_list(&["x", "y"]));
    let v1 = protect(int_scalar(1));
    let supplied = protect(tagged_list(&[("", v1)]));

    let actuals = protect(match_args(formals, supplied).unwrap());
    assert_eq!(actuals.car(), v1);
    assert_eq!(actuals.cadr(), missing_arg());
    assert_eq!(actuals.cdr().missing(), 1);
    unprotect(4);
}

#[test]
fn leftover_without_dots_is_an_unused_argument() {
    let formals = protect(formals_list(&["x"]));
    let v1 = protect(int_scalar(1));
    let v2 = protect(int_scalar(2));
    let supplied = protect(tagged_list(&[("", v1), ("oops", v2)]));
    let err = match_args(formals, supplied).unwrap_err();
    assert!(matches!(err, MemError::UnusedArgument(_)));
    unprotect(4);
}

#[test]
fn empty_dots_stays_missing() {
    let formals = protect(formals_list(&["x", "..."]));
    let v1 = protect(int_scalar(1));
    let supplied = protect(tagged_list(&[("", v1)]));
    let actuals = protect(match_args(formals, supplied).unwrap());
    assert_eq!(actuals.car(), v1);
    assert_eq!(actuals.cadr(), missing_arg());
    unprotect(4);
}

#[test]
fn match_par_extracts_destructively() {
    let v1 = protect(int_scalar(1));
    let v2 = protect(int_scalar(2));
    let mut list = tagged_list(&[("first", v1), ("second", v2)]);
    protect(list);

    let got = match_par("second", &mut list);
    assert_eq!(got, v2);
    assert_eq!(list.car(), v1);
    assert!(list.cdr().is_nil());

    let none = match_par("absent", &mut list);
    assert_eq!(none, missing_arg());
    unprotect(3);
}

#[test]
fn match_arg_uses_the_symbol_print_name() {
    let v1 = protect(int_scalar(1));
    let mut list = tagged_list(&[("width", v1)]);
    protect(list);
    let got = rata_gc::match_arg(intern("width").unwrap(), &mut list);
    assert_eq!(got, v1);
    assert!(list.is_nil());
    unprotect(2);
}

#[test]
fn non_null_string_match_requires_non_empty_equality() {
    let a = protect(rata_gc::mk_char("abc").unwrap());
    let b = protect(rata_gc::mk_char("abc").unwrap());
    let empty = protect(rata_gc::mk_char("").unwrap());
    assert!(rata_gc::non_null_string_match(a, b));
    assert!(!rata_gc::non_null_string_match(a, empty));
    assert!(!rata_gc::non_null_string_match(empty, empty));
    unprotect(3);
}

#[test]
fn dots_symbol_is_identity_interned() {
    assert_eq!(intern("...").unwrap(), dots_symbol());
    let a = intern("twice").unwrap();
    let b = intern("twice").unwrap();
    assert_eq!(a, b);
}

#[test]
fn supplied_list_values_are_not_consumed() {
    let formals = protect(formals_list(&["x"]));
    let v1 = protect(int_scalar(7));
    let supplied = protect(tagged_list(&[("x", v1)]));
    let actuals = protect(match_args(formals, supplied).unwrap());
    assert_eq!(actuals.car(), v1);
    // The caller's supplied list still holds its entry.
    assert_eq!(supplied.car(), v1);
    assert_eq!(cons(supplied, nil()).unwrap().car(), supplied);
    unprotect(4);
}
