//! Type-aware pretty printer (spec §4.6): renders a `(T, V)` pair either as
//! a compact native form (`<T>value`, `(…)` tuples, `[…]` lists) or a
//! JSON-like form (no type tags, `null` for void).

use crate::codec::{self, AnyView};
use crate::errval;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum PrintMode {
    #[default]
    Native,
    Json,
}

/// The printer's result: either the complete rendering, or — when a
/// `max_len` budget was exhausted mid-print — the prefix that was emitted
/// before giving up (spec §4.6's "non-empty outer result containing empty
/// inner error pointer" made into an explicit enum variant).
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum PrintOutcome {
    Complete(String),
    TooLong(String),
}

impl PrintOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, PrintOutcome::Complete(_))
    }
    pub fn as_str(&self) -> &str {
        match self {
            PrintOutcome::Complete(s) | PrintOutcome::TooLong(s) => s,
        }
    }
}

struct Printer {
    out: String,
    mode: PrintMode,
    budget: Option<usize>,
}

type PResult = Result<(), ()>;

impl Printer {
    fn push(&mut self, s: &str) -> PResult {
        if let Some(b) = self.budget {
            if s.len() > b {
                return Err(());
            }
            self.budget = Some(b - s.len());
        }
        self.out.push_str(s);
        Ok(())
    }

    fn print_string_literal(&mut self, s: &str) -> PResult {
        self.push("\"")?;
        for b in s.bytes() {
            match b {
                b'"' | b'%' => {
                    self.push(&format!("%{b:02X}"))?;
                }
                0x20..=0x7e => self.push(&(b as char).to_string())?,
                _ => self.push(&format!("%{b:02X}"))?,
            }
        }
        self.push("\"")
    }

    fn print_char_literal(&mut self, b: u8) -> PResult {
        match self.mode {
            PrintMode::Native => {
                self.push("'")?;
                if (0x20..=0x7e).contains(&b) && b != b'\'' && b != b'%' {
                    self.push(&(b as char).to_string())?;
                } else {
                    self.push(&format!("%{b:02X}"))?;
                }
                self.push("'")
            }
            PrintMode::Json => self.print_string_literal(&(b as char).to_string()),
        }
    }

    fn print_double(&mut self, d: f64) -> PResult {
        if d.is_nan() || d.is_infinite() {
            return self.push(&d.to_string());
        }
        let mut s = format!("{d}");
        if !s.contains('.') && !s.contains('e') && !s.contains("inf") && !s.contains("NaN") {
            s.push_str(".0");
        }
        self.push(&s)
    }

    fn print_any(&mut self, inner: AnyView) -> PResult {
        match self.mode {
            PrintMode::Native => {
                self.push("<")?;
                self.push(inner.ty)?;
                self.push(">")?;
                self.print_body(inner.ty.as_bytes(), 0, inner.val, 0)?;
                Ok(())
            }
            PrintMode::Json => self.print_body(inner.ty.as_bytes(), 0, inner.val, 0),
        }
    }

    fn print_error(&mut self, v: &[u8], pos: usize) -> PResult {
        let (rec, _) = errval::read_error_record(v, pos).map_err(|_| ())?;
        self.push("error(")?;
        self.print_string_literal(&rec.kind)?;
        self.push(", ")?;
        self.print_string_literal(&rec.id)?;
        self.push(", ")?;
        self.print_string_literal(&rec.message)?;
        self.push(", ")?;
        self.print_any(rec.payload.as_view())?;
        self.push(")")
    }

    /// Renders the bare value at `t[tpos..]`/`v[vpos..]` (no outer type
    /// tag), returning the offset just past it in `v`.
    fn print_body(&mut self, t: &[u8], tpos: usize, v: &[u8], vpos: usize) -> PResult {
        if tpos >= t.len() {
            self.push(match self.mode {
                PrintMode::Native => "",
                PrintMode::Json => "null",
            })?;
            return Ok(());
        }
        match t[tpos] {
            b'b' => {
                let (b, _) = codec::read_bool(v, vpos).map_err(|_| ())?;
                self.push(if b { "true" } else { "false" })
            }
            b'c' => {
                let (c, _) = codec::read_char(v, vpos).map_err(|_| ())?;
                self.print_char_literal(c)
            }
            b'i' => {
                let (n, _) = codec::read_i32(v, vpos).map_err(|_| ())?;
                self.push(&n.to_string())
            }
            b'I' => {
                let (n, _) = codec::read_i64(v, vpos).map_err(|_| ())?;
                self.push(&n.to_string())
            }
            b'd' => {
                let (d, _) = codec::read_f64(v, vpos).map_err(|_| ())?;
                self.print_double(d)
            }
            b's' => {
                let (s, _) = codec::read_string_view(v, vpos).map_err(|_| ())?;
                self.print_string_literal(s)
            }
            b'a' => {
                let (any, _) = codec::read_any_view(v, vpos).map_err(|_| ())?;
                self.print_any(any)
            }
            b'e' => self.print_error(v, vpos),
            b'l' => {
                let elem_tpos = tpos + 1;
                let (count, after_count) = codec::read_u32_len(v, vpos).map_err(|_| ())?;
                self.push("[")?;
                let mut vcur = after_count;
                for i in 0..count {
                    if i > 0 {
                        self.push(",")?;
                    }
                    self.print_body(t, elem_tpos, v, vcur)?;
                    vcur = crate::scan::scan_value(t, elem_tpos, v, vcur, false, false)
                        .map_err(|_| ())?
                        .1;
                }
                self.push("]")
            }
            b'm' => {
                let key_tpos = tpos + 1;
                let key_tend = crate::typestr::parse_type(&t[key_tpos..], false).consumed + key_tpos;
                let val_tpos = key_tend;
                let (count, after_count) = codec::read_u32_len(v, vpos).map_err(|_| ())?;
                self.push("{")?;
                let mut vcur = after_count;
                for i in 0..count {
                    if i > 0 {
                        self.push(",")?;
                    }
                    self.print_body(t, key_tpos, v, vcur)?;
                    let (_, after_key) = crate::scan::scan_value(t, key_tpos, v, vcur, false, false).map_err(|_| ())?;
                    self.push(":")?;
                    self.print_body(t, val_tpos, v, after_key)?;
                    let (_, after_val) = crate::scan::scan_value(t, val_tpos, v, after_key, false, false).map_err(|_| ())?;
                    vcur = after_val;
                }
                self.push("}")
            }
            b't' => {
                let digits_start = tpos + 1;
                let mut end = digits_start;
                while end < t.len() && t[end].is_ascii_digit() {
                    end += 1;
                }
                let arity: u32 = std::str::from_utf8(&t[digits_start..end]).ok().and_then(|s| s.parse().ok()).ok_or(())?;
                self.push("(")?;
                let mut tcur = end;
                let mut vcur = vpos;
                for i in 0..arity {
                    if i > 0 {
                        self.push(",")?;
                    }
                    self.print_body(t, tcur, v, vcur)?;
                    let (tnext, vnext) = crate::scan::scan_value(t, tcur, v, vcur, false, false).map_err(|_| ())?;
                    tcur = tnext;
                    vcur = vnext;
                }
                self.push(")")
            }
            b'o' => {
                let (has_value, _) = codec::read_bool(v, vpos).map_err(|_| ())?;
                if has_value {
                    self.print_body(t, tpos + 1, v, vpos + 1)
                } else {
                    self.push("null")
                }
            }
            b'x' | b'X' => {
                let (has_value, _) = codec::read_bool(v, vpos).map_err(|_| ())?;
                if has_value {
                    if t[tpos] == b'X' {
                        self.push(match self.mode {
                            PrintMode::Native => "",
                            PrintMode::Json => "null",
                        })
                    } else {
                        self.print_body(t, tpos + 1, v, vpos + 1)
                    }
                } else {
                    self.print_error(v, vpos + 1)
                }
            }
            _ => Err(()),
        }
    }
}

/// Prints `any` in the given mode, enforcing an optional byte budget
/// (spec §4.6's `max_len`). Passing `None` never truncates.
pub fn print_value(any: AnyView, mode: PrintMode, max_len: Option<usize>) -> PrintOutcome {
    let mut p = Printer { out: String::new(), mode, budget: max_len };
    let result = if mode == PrintMode::Native {
        (|| {
            p.push("<")?;
            p.push(any.ty)?;
            p.push(">")?;
            p.print_body(any.ty.as_bytes(), 0, any.val, 0)
        })()
    } else {
        p.print_body(any.ty.as_bytes(), 0, any.val, 0)
    };
    match result {
        Ok(()) => PrintOutcome::Complete(p.out),
        Err(()) => PrintOutcome::TooLong(p.out),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    fn pv(ty: &str, val: &[u8]) -> String {
        match print_value(AnyView::new(ty, val), PrintMode::Native, None) {
            PrintOutcome::Complete(s) => s,
            PrintOutcome::TooLong(_) => panic!("unexpected truncation"),
        }
    }

    fn pv_json(ty: &str, val: &[u8]) -> String {
        match print_value(AnyView::new(ty, val), PrintMode::Json, None) {
            PrintOutcome::Complete(s) => s,
            PrintOutcome::TooLong(_) => panic!("unexpected truncation"),
        }
    }

    #[test]
    fn test_print_int() {
        assert_eq!(pv("i", &7i32.to_le_bytes()), "<i>7");
    }

    #[test]
    fn test_print_bool_json() {
        assert_eq!(pv_json("b", &[1]), "true");
    }

    #[test]
    fn test_print_string_escapes_quote() {
        let mut v = Vec::new();
        codec::write_string(&mut codec::Sink::append(&mut v), "a\"b");
        assert_eq!(pv("s", &v), "<s>\"a%22b\"");
    }

    #[test]
    fn test_print_list() {
        let mut v = 2u32.to_le_bytes().to_vec();
        v.extend_from_slice(&1i32.to_le_bytes());
        v.extend_from_slice(&2i32.to_le_bytes());
        assert_eq!(pv("li", &v), "<li>[1,2]");
    }

    #[test]
    fn test_print_tuple_s1() {
        let mut v = 1i32.to_le_bytes().to_vec();
        v.extend_from_slice(&2.5f64.to_le_bytes());
        v.push(1);
        assert_eq!(pv("t3idb", &v), "<t3idb>(1,2.5,true)");
    }

    #[test]
    fn test_print_null_json() {
        assert_eq!(pv_json("", &[]), "null");
    }

    #[test]
    fn test_print_any_native_shows_inner_type() {
        let mut inner = Vec::new();
        codec::write_any(&mut codec::Sink::append(&mut inner), AnyView::new("i", &7i32.to_le_bytes()));
        assert_eq!(pv("a", &inner), "<a><i>7");
    }

    #[test]
    fn test_max_len_too_long() {
        let v = 123456789i32.to_le_bytes();
        let out = print_value(AnyView::new("i", &v), PrintMode::Native, Some(2));
        assert!(matches!(out, PrintOutcome::TooLong(_)));
    }

    #[test]
    fn test_max_len_fits() {
        let v = 7i32.to_le_bytes();
        let out = print_value(AnyView::new("i", &v), PrintMode::Native, Some(100));
        assert!(out.is_complete());
    }
}
