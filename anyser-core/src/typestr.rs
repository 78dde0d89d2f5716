//! Type descriptor grammar and parser (spec §3.1, §4.1).
//!
//! A type descriptor `T` is a string over `b c i I d s a e l m t o x X` plus
//! decimal digits (which appear only after `t`). This module validates a `T`
//! one character at a time and reports where it went wrong; it does not
//! interpret a value against it (that's [`crate::scan`]).

use tracing::instrument;

/// What went wrong parsing a type descriptor, and where.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TypeProblem {
    /// Parsing completed with no error.
    Ok,
    /// The descriptor ended in the middle of a multi-character production
    /// (e.g. `l` with nothing after it, or a tuple cut off before all of
    /// its fields).
    End,
    /// An unrecognized character, or a digit outside of a `t` arity.
    Chr,
    /// A `t` with a missing or too-small (< 2) decimal arity.
    Num,
}

impl TypeProblem {
    pub fn is_ok(self) -> bool {
        matches!(self, TypeProblem::Ok)
    }
}

/// The result of parsing one type token: how many bytes of the input were
/// consumed, and whether it succeeded.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TypeResult {
    pub consumed: usize,
    pub problem: TypeProblem,
}

impl TypeResult {
    fn ok(consumed: usize) -> Self {
        TypeResult { consumed, problem: TypeProblem::Ok }
    }
    fn err(consumed: usize, problem: TypeProblem) -> Self {
        TypeResult { consumed, problem }
    }
}

/// Parses exactly one type token starting at byte 0 of `t`, returning how
/// many bytes it spans. Does not require `t` to be fully consumed — callers
/// that want "no trailing garbage" (the scanner's `tlong` check) compare
/// `consumed` against `t.len()` themselves.
///
/// `accept_void` permits an entirely empty `t` to parse as the void type
/// (zero bytes consumed, [`TypeProblem::Ok`]). Grammar positions that forbid
/// void (list element, map key/value, tuple field) pass `false`.
#[instrument(level = "trace", skip(t))]
pub fn parse_type(t: &[u8], accept_void: bool) -> TypeResult {
    parse_at(t, 0, accept_void)
}

fn parse_at(t: &[u8], pos: usize, accept_void: bool) -> TypeResult {
    if pos >= t.len() {
        return if accept_void {
            TypeResult::ok(pos)
        } else {
            TypeResult::err(pos, TypeProblem::End)
        };
    }
    match t[pos] {
        b'b' | b'c' | b'i' | b'I' | b'd' | b's' | b'a' | b'e' | b'X' => {
            TypeResult::ok(pos + 1)
        }
        b'l' => {
            let inner = parse_at(t, pos + 1, false);
            if inner.problem.is_ok() {
                TypeResult::ok(inner.consumed)
            } else {
                inner
            }
        }
        b'o' | b'x' => {
            let inner = parse_at(t, pos + 1, false);
            if inner.problem.is_ok() {
                TypeResult::ok(inner.consumed)
            } else {
                inner
            }
        }
        b'm' => {
            let key = parse_at(t, pos + 1, false);
            if !key.problem.is_ok() {
                return key;
            }
            let val = parse_at(t, key.consumed, false);
            if val.problem.is_ok() {
                TypeResult::ok(val.consumed)
            } else {
                val
            }
        }
        b't' => parse_tuple(t, pos),
        b'0'..=b'9' => TypeResult::err(pos, TypeProblem::Chr),
        _ => TypeResult::err(pos, TypeProblem::Chr),
    }
}

fn parse_tuple(t: &[u8], pos: usize) -> TypeResult {
    let digits_start = pos + 1;
    if digits_start >= t.len() {
        return TypeResult::err(digits_start, TypeProblem::End);
    }
    let mut end = digits_start;
    while end < t.len() && t[end].is_ascii_digit() {
        end += 1;
    }
    if end == digits_start {
        // `t` with no digits at all: if we ran off the end it's `End`,
        // otherwise the next char simply isn't a digit, which is `Num`
        // (a tuple with no arity at all).
        return TypeResult::err(digits_start, TypeProblem::Num);
    }
    let arity: u64 = match std::str::from_utf8(&t[digits_start..end]).unwrap().parse() {
        Ok(n) => n,
        Err(_) => return TypeResult::err(end, TypeProblem::Num),
    };
    if arity < 2 {
        return TypeResult::err(end, TypeProblem::Num);
    }
    let mut cursor = end;
    for _ in 0..arity {
        let field = parse_at(t, cursor, false);
        if !field.problem.is_ok() {
            return field;
        }
        cursor = field.consumed;
    }
    TypeResult::ok(cursor)
}

/// Feeds more bytes to a parse that ran out mid-token.
///
/// Grammar tokens are non-regular once tuples/lists/maps nest, so a true
/// incremental resumption would need an explicit stack of "how many more
/// sibling types are owed" frames. Since the engine has no suspension
/// points (spec §5 — every operation runs to completion synchronously),
/// we get the same externally-visible streaming behavior more simply: pull
/// another chunk, re-run the whole-buffer parse, and only report `End` for
/// good once the feed itself is exhausted.
pub fn parse_type_chunks<F>(mut buf: Vec<u8>, accept_void: bool, mut more: F) -> (Vec<u8>, TypeResult)
where
    F: FnMut() -> Option<Vec<u8>>,
{
    loop {
        let result = parse_type(&buf, accept_void);
        if result.problem != TypeProblem::End {
            return (buf, result);
        }
        match more() {
            Some(mut extra) => buf.append(&mut extra),
            None => return (buf, result),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn test_primitives() {
        for c in ["b", "c", "i", "I", "d", "s", "a", "e", "X"] {
            let r = parse_type(c.as_bytes(), false);
            assert_eq!(r, TypeResult::ok(1), "{c}");
        }
    }

    #[test]
    fn test_void() {
        assert_eq!(parse_type(b"", true), TypeResult::ok(0));
        assert_eq!(parse_type(b"", false).problem, TypeProblem::End);
    }

    #[test]
    fn test_list_and_optional() {
        assert_eq!(parse_type(b"li", false), TypeResult::ok(2));
        assert_eq!(parse_type(b"oI", false), TypeResult::ok(2));
        assert_eq!(parse_type(b"xs", false), TypeResult::ok(2));
        assert_eq!(parse_type(b"l", false).problem, TypeProblem::End);
    }

    #[test]
    fn test_map() {
        assert_eq!(parse_type(b"mis", false), TypeResult::ok(3));
        assert_eq!(parse_type(b"mi", false).problem, TypeProblem::End);
    }

    #[test]
    fn test_tuple_arity() {
        assert_eq!(parse_type(b"t2ii", false), TypeResult::ok(4));
        assert_eq!(parse_type(b"t3idb", false), TypeResult::ok(5));
        assert_eq!(parse_type(b"t1i", false).problem, TypeProblem::Num);
        assert_eq!(parse_type(b"ti", false).problem, TypeProblem::Num);
        assert_eq!(parse_type(b"t", false).problem, TypeProblem::End);
    }

    #[test]
    fn test_nested_and_unknown_char() {
        assert_eq!(parse_type(b"lt2is", false), TypeResult::ok(5));
        assert_eq!(parse_type(b"q", false).problem, TypeProblem::Chr);
        assert_eq!(parse_type(b"5", false).problem, TypeProblem::Chr);
    }

    #[test]
    fn test_trailing_bytes_not_rejected_here() {
        // Trailing-garbage detection ("tlong") is the scanner's job, not
        // the grammar parser's: it only reports how much of a single token
        // it consumed.
        let r = parse_type(b"iX", false);
        assert_eq!(r, TypeResult::ok(1));
    }

    #[test]
    fn test_streaming_feed() {
        let mut chunks = vec![b"t2i".to_vec(), b"s".to_vec()].into_iter();
        let (buf, result) = parse_type_chunks(Vec::new(), false, || chunks.next());
        assert_eq!(result, TypeResult::ok(4));
        assert_eq!(buf, b"t2is");
    }

    #[test]
    fn test_streaming_feed_exhausted() {
        let mut chunks = vec![b"l".to_vec()].into_iter();
        let (_buf, result) = parse_type_chunks(Vec::new(), false, || chunks.next());
        assert_eq!(result.problem, TypeProblem::End);
    }
}
