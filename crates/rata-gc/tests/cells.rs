//! Cell accessor surface: kinds, flags, environments, promises,
//! symbols, external pointers and vector elements.

use rata_gc::{
    alloc_cell, alloc_list, alloc_vector, blank_string, cons, intern, mk_char, mk_external_ptr,
    mk_promise, new_environment, nil, protect, unbound_value, unprotect, Kind,
};

#[test]
fn nil_is_self_referential() {
    let nil = nil();
    assert!(nil.is_nil());
    assert_eq!(nil.kind(), Kind::Nil);
    assert_eq!(nil.car(), nil);
    assert_eq!(nil.cdr(), nil);
    assert_eq!(nil.tag(), nil);
    assert_eq!(nil.attrib(), nil);
}

#[test]
#[should_panic(expected = "bad value")]
fn setting_car_of_nil_panics() {
    let n = nil();
    n.set_car(n);
}

#[test]
fn named_counter_round_trip() {
    let x = cons(nil(), nil()).unwrap();
    assert_eq!(x.named(), 0);
    x.set_named(2);
    assert_eq!(x.named(), 2);
}

#[test]
fn list_accessor_chains() {
    let l = protect(alloc_list(5).unwrap());
    let v = alloc_vector(Kind::Int, 1).unwrap();
    v.set_int_elt(0, 9);
    l.set_caddr(v);
    assert_eq!(l.caddr(), v);
    assert!(l.cadr().is_nil());
    l.set_cad4r(v);
    assert_eq!(l.cad4r(), v);
    unprotect(1);
}

#[test]
fn environment_frame_tagging_is_a_prefix() {
    let a = intern("a").unwrap();
    let b = intern("b").unwrap();
    let names = protect(alloc_list(2).unwrap());
    names.set_tag(a);
    names.cdr().set_tag(b);

    let values = protect(alloc_list(3).unwrap());
    let env = protect(new_environment(names, values, nil()).unwrap());

    assert_eq!(env.kind(), Kind::Env);
    assert_eq!(env.frame(), values);
    assert!(env.enclos().is_nil());
    assert!(env.hash_tab().is_nil());
    assert_eq!(values.tag(), a);
    assert_eq!(values.cdr().tag(), b);
    assert!(values.cddr().tag().is_nil());
    unprotect(3);
}

#[test]
fn promise_slots_and_seen_flag() {
    let expr = protect(cons(nil(), nil()).unwrap());
    let env = protect(alloc_cell(Kind::Env).unwrap());
    let p = protect(mk_promise(expr, env).unwrap());

    assert_eq!(p.kind(), Kind::Promise);
    assert_eq!(p.promise_expr(), expr);
    assert_eq!(p.promise_env(), env);
    assert_eq!(p.promise_value(), unbound_value());
    assert!(!p.promise_seen());
    p.set_promise_seen(true);
    assert!(p.promise_seen());
    p.set_promise_value(expr);
    assert_eq!(p.promise_value(), expr);
    unprotect(3);
}

#[test]
fn symbol_print_name_and_value() {
    let sym = intern("answer").unwrap();
    assert_eq!(sym.kind(), Kind::Symbol);
    assert_eq!(sym.print_name().char_str(), Some("answer"));
    assert_eq!(sym.sym_value(), unbound_value());
    let v = alloc_vector(Kind::Real, 1).unwrap();
    sym.set_sym_value(v);
    assert_eq!(sym.sym_value(), v);
    assert!(!sym.ddval());
    sym.set_ddval(true);
    assert!(sym.ddval());
}

#[test]
fn external_pointer_fields() {
    let mut native = 7i64;
    let tag = protect(mk_char("handle").unwrap());
    let ptr = protect(mk_external_ptr(std::ptr::addr_of_mut!(native).cast(), tag, nil()).unwrap());

    assert_eq!(ptr.kind(), Kind::ExtPtr);
    assert_eq!(ptr.external_tag(), tag);
    assert!(ptr.external_prot().is_nil());
    assert_eq!(ptr.external_addr().cast::<i64>(), std::ptr::addr_of_mut!(native));
    ptr.clear_external_addr();
    assert!(ptr.external_addr().is_null());
    unprotect(2);
}

#[test]
fn string_vector_elements_default_to_blank() {
    let s = protect(alloc_vector(Kind::Str, 3).unwrap());
    for i in 0..3 {
        assert_eq!(s.string_elt(i), blank_string());
    }
    let c = mk_char("hello").unwrap();
    s.set_string_elt(1, c);
    assert_eq!(s.string_elt(1).char_str(), Some("hello"));
    unprotect(1);
}

#[test]
fn generic_vector_elements_default_to_nil() {
    let v = protect(alloc_vector(Kind::Vec, 4).unwrap());
    for i in 0..4 {
        assert!(v.vector_elt(i).is_nil());
    }
    unprotect(1);
}

#[test]
fn numeric_vector_elements_round_trip() {
    let l = alloc_vector(Kind::Logical, 2).unwrap();
    l.set_logical_elt(0, 1);
    assert_eq!(l.logical_elt(0), 1);

    let r = protect(alloc_vector(Kind::Real, 20).unwrap());
    for i in 0..20 {
        #[allow(clippy::cast_precision_loss)]
        r.set_real_elt(i, i as f64 / 2.0);
    }
    assert!((r.real_elt(19) - 9.5).abs() < f64::EPSILON);
    unprotect(1);
}

#[test]
#[should_panic(expected = "out of bounds")]
fn vector_index_is_checked() {
    let v = alloc_vector(Kind::Int, 2).unwrap();
    v.int_elt(2);
}

#[test]
fn char_cells_carry_their_bytes() {
    let c = mk_char("tūī").unwrap();
    assert_eq!(c.kind(), Kind::Char);
    assert_eq!(c.length(), "tūī".len());
    assert_eq!(c.char_str(), Some("tūī"));
}

#[test]
fn truelength_is_recorded() {
    let v = alloc_vector(Kind::Int, 6).unwrap();
    assert_eq!(v.truelength(), 6);
    v.set_length(4);
    assert_eq!(v.length(), 4);
    assert_eq!(v.truelength(), 6);
}

#[test]
fn zero_length_vectors_are_bare_records() {
    let v = alloc_vector(Kind::Real, 0).unwrap();
    assert_eq!(v.kind(), Kind::Real);
    assert_eq!(v.length(), 0);
    let lang = alloc_vector(Kind::Lang, 0).unwrap();
    assert!(lang.is_nil());
    let l = alloc_vector(Kind::Lang, 2).unwrap();
    assert_eq!(l.kind(), Kind::Lang);
    assert!(!l.cdr().is_nil());
}
