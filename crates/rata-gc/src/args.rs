//! Matching and partial matching of supplied arguments against a
//! formal-parameter list.
//!
//! [`match_args`] runs the three-pass protocol: exact tag matches,
//! partial (prefix) tag matches, then positional assignment, with any
//! leftovers gathered by a dots formal. The dots formal is recognized by
//! identity with the interned dots symbol, never by name comparison.
//! The use marks live in the general-purpose bits of the formal and
//! supplied cells; the caller's supplied list is otherwise left intact.

use crate::alloc::{alloc_list, cons};
use crate::cell::{CellRef, Kind};
use crate::error::MemError;
use crate::roots::{dots_symbol, missing_arg, nil, protect, unprotect};

/// Whether `f` names a prefix of `t` (or, with `exact`, the whole of
/// `t`). Both sides compare as byte strings.
#[must_use]
pub fn psmatch(f: &str, t: &str, exact: bool) -> bool {
    if exact {
        f == t
    } else {
        t.as_bytes().starts_with(f.as_bytes())
    }
}

fn tag_chars(c: CellRef) -> Result<CellRef, MemError> {
    match c.kind() {
        Kind::Symbol => Ok(c.print_name()),
        Kind::Char => Ok(c),
        Kind::Str => Ok(c.string_elt(0)),
        _ => Err(MemError::InvalidPartialStringMatch),
    }
}

/// Whether a supplied `tag` matches a `formal` name: exactly, or -- when
/// partial matching is allowed -- as a prefix of it. Either side may be
/// a symbol, a character cell or a string vector.
///
/// # Errors
///
/// `InvalidPartialStringMatch` when either side is none of those.
pub fn pmatch(formal: CellRef, tag: CellRef, exact: bool) -> Result<bool, MemError> {
    let f = tag_chars(formal)?;
    let t = tag_chars(tag)?;
    let fb = f.char_bytes();
    let tb = t.char_bytes();
    Ok(if exact { fb == tb } else { fb.starts_with(tb) })
}

/// Exact match of two non-empty character cells.
#[must_use]
pub fn non_null_string_match(s: CellRef, t: CellRef) -> bool {
    let sb = s.char_bytes();
    let tb = t.char_bytes();
    !sb.is_empty() && !tb.is_empty() && sb == tb
}

/// Destructively extract the first entry of `list` whose tag partially
/// matches `tag`, returning its value or the missing marker.
pub fn match_par(tag: &str, list: &mut CellRef) -> CellRef {
    fn tag_matches(entry: CellRef, pattern: &str) -> bool {
        let t = entry.tag();
        if t.is_nil() || t.kind() != Kind::Symbol {
            return false;
        }
        let name = t.print_name();
        pattern.as_bytes().starts_with(name.char_bytes())
    }

    if list.is_nil() {
        return missing_arg();
    }
    if tag_matches(*list, tag) {
        let s = *list;
        *list = s.cdr();
        return s.car();
    }
    let mut last = *list;
    let mut next = list.cdr();
    while !next.is_nil() {
        if tag_matches(next, tag) {
            last.set_cdr(next.cdr());
            return next.car();
        }
        last = next;
        next = next.cdr();
    }
    missing_arg()
}

/// As [`match_par`], with the pattern given as a symbol.
pub fn match_arg(tag: CellRef, list: &mut CellRef) -> CellRef {
    let name = tag.print_name();
    let owned = name.char_str().unwrap_or_default().to_owned();
    match_par(&owned, list)
}

fn formal_name(tag: CellRef) -> String {
    if tag.kind() == Kind::Symbol {
        tag.print_name().char_str().unwrap_or("?").to_owned()
    } else {
        String::from("?")
    }
}

fn multiple_actual(f_tag: CellRef) -> MemError {
    MemError::MultipleMatch(format!(
        "formal argument \"{}\" matched by multiple actual arguments",
        formal_name(f_tag)
    ))
}

fn multiple_formal(index: usize) -> MemError {
    MemError::MultipleMatch(format!(
        "argument {index} matches multiple formal arguments"
    ))
}

/// Match `supplied` against `formals` and return the actuals list, one
/// entry per formal, unfilled slots holding the missing marker. The
/// supplied list is left unchanged apart from its use marks.
///
/// # Errors
///
/// `MultipleMatch` when a formal or supplied argument matches twice,
/// `UnusedArgument` when a supplied value binds nowhere and there is no
/// dots formal, `InvalidPartialStringMatch` for unmatchable tags, plus
/// allocation errors for the actuals list.
pub fn match_args(formals: CellRef, supplied: CellRef) -> Result<CellRef, MemError> {
    let mut actuals = nil();
    let missing = missing_arg();
    let mut f = formals;
    while !f.is_nil() {
        actuals = cons(missing, actuals)?;
        actuals.set_missing(1);
        f.set_levels(0);
        f = f.cdr();
    }
    let mut b = supplied;
    while !b.is_nil() {
        b.set_levels(0);
        b = b.cdr();
    }

    protect(actuals);
    let result = match_passes(formals, supplied, actuals);
    unprotect(1);
    result?;
    Ok(actuals)
}

#[allow(clippy::too_many_lines)]
fn match_passes(
    formals: CellRef,
    supplied: CellRef,
    actuals: CellRef,
) -> Result<(), MemError> {
    let dots_sym = dots_symbol();
    let missing = missing_arg();

    // First pass: exact matches by tag, catching duplicates on either
    // side.
    let mut f = formals;
    let mut a = actuals;
    while !f.is_nil() {
        if f.tag() != dots_sym {
            let mut i = 1usize;
            let mut b = supplied;
            while !b.is_nil() {
                if !b.tag().is_nil() && pmatch(f.tag(), b.tag(), true)? {
                    if f.levels() == 2 {
                        return Err(multiple_actual(f.tag()));
                    }
                    if b.levels() == 2 {
                        return Err(multiple_formal(i));
                    }
                    a.set_car(b.car());
                    if b.car() != missing {
                        a.set_missing(0);
                    }
                    b.set_levels(2);
                    f.set_levels(2);
                }
                i += 1;
                b = b.cdr();
            }
        }
        f = f.cdr();
        a = a.cdr();
    }

    // Second pass: partial matches. Once the dots formal has been seen,
    // only exact matches are allowed for the formals after it. A partial
    // match against a formal that pass one already filled is a multiple
    // match, not a leftover.
    let mut dots: Option<CellRef> = None;
    let mut seendots = false;
    let mut f = formals;
    let mut a = actuals;
    while !f.is_nil() {
        if f.tag() == dots_sym && !seendots {
            dots = Some(a);
            seendots = true;
        } else {
            let mut i = 1usize;
            let mut b = supplied;
            while !b.is_nil() {
                if b.levels() != 2 && !b.tag().is_nil() && pmatch(f.tag(), b.tag(), seendots)? {
                    if f.levels() != 0 {
                        return Err(multiple_actual(f.tag()));
                    }
                    if b.levels() != 0 {
                        return Err(multiple_formal(i));
                    }
                    a.set_car(b.car());
                    if b.car() != missing {
                        a.set_missing(0);
                    }
                    b.set_levels(1);
                    f.set_levels(1);
                }
                i += 1;
                b = b.cdr();
            }
        }
        f = f.cdr();
        a = a.cdr();
    }

    // Third pass: positional. Tagged or used supplied values never match
    // positionally, and matching stops at the dots formal.
    let mut f = formals;
    let mut a = actuals;
    let mut b = supplied;
    let mut seendots = false;
    while !f.is_nil() && !b.is_nil() && !seendots {
        if f.tag() == dots_sym {
            seendots = true;
            f = f.cdr();
            a = a.cdr();
        } else if a.car() != missing {
            f = f.cdr();
            a = a.cdr();
        } else if b.levels() != 0 || !b.tag().is_nil() {
            b = b.cdr();
        } else {
            a.set_car(b.car());
            if b.car() != missing {
                a.set_missing(0);
            }
            b.set_levels(1);
            b = b.cdr();
            f = f.cdr();
            a = a.cdr();
        }
    }

    if let Some(dots) = dots {
        // Gather every unused supplied value, tags and order preserved.
        dots.set_missing(0);
        let mut n = 0usize;
        let mut b = supplied;
        while !b.is_nil() {
            if b.levels() == 0 {
                n += 1;
            }
            b = b.cdr();
        }
        if n > 0 {
            let gathered = alloc_list(n)?;
            gathered.set_kind(Kind::Dots);
            let mut slot = gathered;
            let mut b = supplied;
            while !b.is_nil() {
                if b.levels() == 0 {
                    slot.set_car(b.car());
                    slot.set_tag(b.tag());
                    slot = slot.cdr();
                }
                b = b.cdr();
            }
            dots.set_car(gathered);
        }
    } else {
        let mut b = supplied;
        while !b.is_nil() {
            if b.levels() == 0 && b.car() != missing {
                let name = if b.tag().is_nil() {
                    String::new()
                } else {
                    formal_name(b.tag())
                };
                return Err(MemError::UnusedArgument(name));
            }
            b = b.cdr();
        }
    }
    Ok(())
}
