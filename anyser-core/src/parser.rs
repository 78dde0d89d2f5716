//! Text-literal parser (spec §4.5): recognizes numbers, strings, booleans,
//! `null`, `error(...)`, lists, maps, tuples and type-annotated literals,
//! emitting a `(T, V)` pair with type inference.

use thiserror::Error;

use anyser_base::ConvertPolicy;

use crate::codec::{self, AnyOwned, Sink};
use crate::convert;
use crate::errval::{self, ErrorRecord};
use crate::typestr::parse_type;

/// Which dialect of the text grammar is active. `Strict` rejects
/// heterogeneous lists/maps outright; `Liberal` and `Json` both fall back
/// to wrapping elements in `a` on heterogeneity, and `Json` additionally
/// restricts map keys to `s` (spec §4.5, §9 open question).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum ParseMode {
    #[default]
    Strict,
    Liberal,
    Json,
}

impl ParseMode {
    fn allows_heterogeneous_fallback(self) -> bool {
        matches!(self, ParseMode::Liberal | ParseMode::Json)
    }
}

/// The parser's output: an owned `(T, V)` pair. An alias of [`AnyOwned`]
/// rather than a distinct type, since that's exactly what a parsed literal
/// is (spec §3.3).
pub type ParsedValue = AnyOwned;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unexpected end of input at offset {0}")]
    UnexpectedEnd(usize),
    #[error("unexpected character {found:?} at offset {at}, expected {expected}")]
    Unexpected { at: usize, found: char, expected: &'static str },
    #[error("invalid %-escape at offset {0}")]
    BadEscape(usize),
    #[error("invalid number literal {0:?} at offset {1}")]
    BadNumber(String, usize),
    #[error("list elements have incompatible types ({0:?} vs {1:?}) at offset {2}")]
    HeterogeneousList(String, String, usize),
    #[error("map keys have incompatible types ({0:?} vs {1:?}) at offset {2}")]
    HeterogeneousMapKey(String, String, usize),
    #[error("map keys must be strings in JSON mode, found {0:?} at offset {1}")]
    NonStringJsonKey(String, usize),
    #[error("cannot infer the element type of an empty list without a <T> annotation, at offset {0}")]
    EmptyListNeedsAnnotation(usize),
    #[error("malformed type annotation at offset {0}: {1}")]
    BadTypeAnnotation(usize, String),
    #[error("typed literal's value of type {0:?} does not convert to annotated type {1:?}: {2}")]
    AnnotationMismatch(String, String, String),
    #[error("error(...) takes 1 to 4 arguments, got {0} at offset {1}")]
    BadErrorArity(usize, usize),
    #[error("error(...) argument {0} must be a string, at offset {1}")]
    BadErrorArgType(usize, usize),
}

struct P<'a> {
    s: &'a [u8],
    pos: usize,
    mode: ParseMode,
}

fn is_sep(c: u8) -> bool {
    c == b',' || c == b';'
}

impl<'a> P<'a> {
    fn new(s: &'a str, mode: ParseMode) -> Self {
        P { s: s.as_bytes(), pos: 0, mode }
    }

    fn peek(&self) -> Option<u8> {
        self.s.get(self.pos).copied()
    }

    fn peek_at(&self, off: usize) -> Option<u8> {
        self.s.get(self.pos + off).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r')) {
            self.pos += 1;
        }
    }

    fn skip_sep(&mut self) {
        self.skip_ws();
        if matches!(self.peek(), Some(c) if is_sep(c)) {
            self.pos += 1;
        }
        self.skip_ws();
    }

    fn expect(&mut self, c: u8, what: &'static str) -> Result<(), ParseError> {
        self.skip_ws();
        match self.bump() {
            Some(got) if got == c => Ok(()),
            Some(got) => Err(ParseError::Unexpected { at: self.pos - 1, found: got as char, expected: what }),
            None => Err(ParseError::UnexpectedEnd(self.pos)),
        }
    }

    /// Case-insensitive keyword match with a word boundary after it;
    /// consumes on success, leaves position unchanged on failure.
    fn try_keyword(&mut self, kw: &str) -> bool {
        let kwb = kw.as_bytes();
        if self.pos + kwb.len() > self.s.len() {
            return false;
        }
        for (i, &b) in kwb.iter().enumerate() {
            if !self.s[self.pos + i].eq_ignore_ascii_case(&b) {
                return false;
            }
        }
        let after = self.pos + kwb.len();
        let boundary_ok = match self.s.get(after) {
            Some(c) => !(c.is_ascii_alphanumeric() || *c == b'_'),
            None => true,
        };
        if boundary_ok {
            self.pos = after;
            true
        } else {
            false
        }
    }

    fn hex_digit(c: u8) -> Option<u8> {
        match c {
            b'0'..=b'9' => Some(c - b'0'),
            b'a'..=b'f' => Some(c - b'a' + 10),
            b'A'..=b'F' => Some(c - b'A' + 10),
            _ => None,
        }
    }

    /// Parses a `%HH` escape (already past the `%`), returning the decoded
    /// byte.
    fn parse_hex_escape(&mut self) -> Result<u8, ParseError> {
        let start = self.pos;
        let hi = self.bump().and_then(Self::hex_digit).ok_or(ParseError::BadEscape(start))?;
        let lo = self.bump().and_then(Self::hex_digit).ok_or(ParseError::BadEscape(start))?;
        Ok((hi << 4) | lo)
    }

    fn parse_char_literal(&mut self) -> Result<ParsedValue, ParseError> {
        self.expect(b'\'', "a character literal")?;
        let byte = match self.bump() {
            Some(b'%') => self.parse_hex_escape()?,
            Some(c) => c,
            None => return Err(ParseError::UnexpectedEnd(self.pos)),
        };
        self.expect(b'\'', "closing '")?;
        if self.mode == ParseMode::Json {
            let mut out = Vec::new();
            codec::write_len_prefixed(&mut Sink::append(&mut out), &[byte]);
            return Ok(ParsedValue::new("s", out));
        }
        Ok(ParsedValue::new("c", vec![byte]))
    }

    fn parse_string_literal(&mut self) -> Result<ParsedValue, ParseError> {
        self.expect(b'"', "a string literal")?;
        let mut bytes = Vec::new();
        loop {
            match self.bump() {
                Some(b'"') => break,
                Some(b'%') => bytes.push(self.parse_hex_escape()?),
                Some(c) => bytes.push(c),
                None => return Err(ParseError::UnexpectedEnd(self.pos)),
            }
        }
        let s = String::from_utf8(bytes).map_err(|_| ParseError::BadEscape(self.pos))?;
        let mut out = Vec::new();
        codec::write_string(&mut Sink::append(&mut out), &s);
        Ok(ParsedValue::new("s", out))
    }

    fn at_number_start(&self) -> bool {
        match self.peek() {
            Some(c) if c.is_ascii_digit() => true,
            Some(b'-') | Some(b'+') => matches!(self.peek_at(1), Some(c) if c.is_ascii_digit() || c == b'.'),
            Some(b'.') => matches!(self.peek_at(1), Some(c) if c.is_ascii_digit()),
            _ => false,
        }
    }

    fn parse_number(&mut self) -> Result<ParsedValue, ParseError> {
        let start = self.pos;
        let allow_hex = self.mode != ParseMode::Json;
        if allow_hex
            && matches!(self.peek(), Some(b'0'))
            && matches!(self.peek_at(1), Some(b'x') | Some(b'X'))
        {
            self.pos += 2;
            let digits_start = self.pos;
            while matches!(self.peek(), Some(c) if c.is_ascii_hexdigit()) {
                self.pos += 1;
            }
            if self.pos == digits_start {
                return Err(ParseError::BadNumber(self.text(start), start));
            }
            let text = self.text(digits_start);
            let n = u64::from_str_radix(&text, 16).map_err(|_| ParseError::BadNumber(text.clone(), start))?;
            return Ok(self.emit_unsigned(n));
        }

        // Maximal integer span: optional sign, then digits.
        let mut int_end = start;
        if matches!(self.s.get(int_end), Some(b'-') | Some(b'+')) {
            int_end += 1;
        }
        let int_digits_start = int_end;
        while matches!(self.s.get(int_end), Some(c) if c.is_ascii_digit()) {
            int_end += 1;
        }
        let int_span = if int_end > int_digits_start { int_end - start } else { 0 };

        // Maximal float span: optional sign, digits, optional '.', digits,
        // optional exponent.
        let mut float_end = start;
        if matches!(self.s.get(float_end), Some(b'-') | Some(b'+')) {
            float_end += 1;
        }
        let mut saw_digit = false;
        while matches!(self.s.get(float_end), Some(c) if c.is_ascii_digit()) {
            float_end += 1;
            saw_digit = true;
        }
        if matches!(self.s.get(float_end), Some(b'.')) {
            let mut frac_end = float_end + 1;
            let mut saw_frac_digit = false;
            while matches!(self.s.get(frac_end), Some(c) if c.is_ascii_digit()) {
                frac_end += 1;
                saw_frac_digit = true;
            }
            if saw_frac_digit {
                float_end = frac_end;
                saw_digit = true;
            }
        }
        if saw_digit && matches!(self.s.get(float_end), Some(b'e') | Some(b'E')) {
            let mut exp_end = float_end + 1;
            if matches!(self.s.get(exp_end), Some(b'-') | Some(b'+')) {
                exp_end += 1;
            }
            let exp_digits_start = exp_end;
            while matches!(self.s.get(exp_end), Some(c) if c.is_ascii_digit()) {
                exp_end += 1;
            }
            if exp_end > exp_digits_start {
                float_end = exp_end;
            }
        }
        let float_span = if saw_digit { float_end - start } else { 0 };

        if float_span == 0 && int_span == 0 {
            return Err(ParseError::BadNumber(String::new(), start));
        }

        if float_span > int_span {
            self.pos = float_end;
            let text = self.text(start);
            let f: f64 = text.parse().map_err(|_| ParseError::BadNumber(text.clone(), start))?;
            let mut out = Vec::new();
            codec::write_f64(&mut Sink::append(&mut out), f);
            return Ok(ParsedValue::new("d", out));
        }

        self.pos = int_end;
        let text = self.text(start);
        if let Some(rest) = text.strip_prefix('-') {
            let n: i64 = rest.parse::<i64>().map(|v| -v).map_err(|_| ParseError::BadNumber(text.clone(), start))?;
            return Ok(self.emit_signed(n));
        }
        let text = text.strip_prefix('+').unwrap_or(&text);
        let n: u64 = text.parse().map_err(|_| ParseError::BadNumber(text.to_owned(), start))?;
        Ok(self.emit_unsigned(n))
    }

    fn emit_signed(&self, n: i64) -> ParsedValue {
        let mut out = Vec::new();
        if n >= i32::MIN as i64 && n <= i32::MAX as i64 {
            codec::write_i32(&mut Sink::append(&mut out), n as i32);
            ParsedValue::new("i", out)
        } else {
            codec::write_i64(&mut Sink::append(&mut out), n);
            ParsedValue::new("I", out)
        }
    }

    fn emit_unsigned(&self, n: u64) -> ParsedValue {
        let mut out = Vec::new();
        if n <= i32::MAX as u64 {
            codec::write_i32(&mut Sink::append(&mut out), n as i32);
            ParsedValue::new("i", out)
        } else {
            codec::write_i64(&mut Sink::append(&mut out), n as i64);
            ParsedValue::new("I", out)
        }
    }

    fn text(&self, start: usize) -> String {
        String::from_utf8_lossy(&self.s[start..self.pos]).into_owned()
    }

    fn parse_list(&mut self) -> Result<ParsedValue, ParseError> {
        let open = self.pos;
        self.expect(b'[', "a list")?;
        self.skip_ws();
        let mut elems = Vec::new();
        if self.peek() != Some(b']') {
            loop {
                elems.push(self.parse_value()?);
                self.skip_ws();
                match self.peek() {
                    Some(b']') => break,
                    Some(c) if is_sep(c) => {
                        self.skip_sep();
                        if self.peek() == Some(b']') {
                            break;
                        }
                    }
                    Some(c) => return Err(ParseError::Unexpected { at: self.pos, found: c as char, expected: "',' or ']'" }),
                    None => return Err(ParseError::UnexpectedEnd(self.pos)),
                }
            }
        }
        self.expect(b']', "closing ]")?;

        if elems.is_empty() {
            if self.mode.allows_heterogeneous_fallback() {
                return Ok(ParsedValue::new("la", 0u32.to_le_bytes().to_vec()));
            }
            return Err(ParseError::EmptyListNeedsAnnotation(open));
        }

        let common_ty = elems[0].ty.clone();
        let uniform = elems.iter().all(|e| e.ty == common_ty);
        if uniform {
            let mut out = (elems.len() as u32).to_le_bytes().to_vec();
            for e in &elems {
                out.extend_from_slice(&e.val);
            }
            return Ok(ParsedValue::new(format!("l{common_ty}"), out));
        }

        if !self.mode.allows_heterogeneous_fallback() {
            let second = elems.iter().find(|e| e.ty != common_ty).unwrap();
            return Err(ParseError::HeterogeneousList(common_ty, second.ty.clone(), open));
        }

        let mut out = (elems.len() as u32).to_le_bytes().to_vec();
        for e in &elems {
            codec::write_any(&mut Sink::append(&mut out), e.as_view());
        }
        Ok(ParsedValue::new("la", out))
    }

    fn parse_map(&mut self) -> Result<ParsedValue, ParseError> {
        let open = self.pos;
        self.expect(b'{', "a map")?;
        self.skip_ws();
        let mut entries = Vec::new();
        if self.peek() != Some(b'}') {
            loop {
                let key = self.parse_value()?;
                self.skip_ws();
                self.expect(b':', "':'")?;
                self.skip_ws();
                let val = self.parse_value()?;
                entries.push((key, val));
                self.skip_ws();
                match self.peek() {
                    Some(b'}') => break,
                    Some(c) if is_sep(c) => {
                        self.skip_sep();
                        if self.peek() == Some(b'}') {
                            break;
                        }
                    }
                    Some(c) => return Err(ParseError::Unexpected { at: self.pos, found: c as char, expected: "',' or '}'" }),
                    None => return Err(ParseError::UnexpectedEnd(self.pos)),
                }
            }
        }
        self.expect(b'}', "closing }")?;

        if entries.is_empty() {
            return Ok(ParsedValue::new("msa", 0u32.to_le_bytes().to_vec()));
        }

        if self.mode == ParseMode::Json {
            for (k, _) in &entries {
                if k.ty != "s" {
                    return Err(ParseError::NonStringJsonKey(k.ty.clone(), open));
                }
            }
            let mut out = (entries.len() as u32).to_le_bytes().to_vec();
            for (k, v) in &entries {
                out.extend_from_slice(&k.val);
                codec::write_any(&mut Sink::append(&mut out), v.as_view());
            }
            return Ok(ParsedValue::new("msa", out));
        }

        let key_ty = entries[0].0.ty.clone();
        let val_ty = entries[0].1.ty.clone();
        let keys_uniform = entries.iter().all(|(k, _)| k.ty == key_ty);
        let vals_uniform = entries.iter().all(|(_, v)| v.ty == val_ty);

        if keys_uniform && vals_uniform {
            let mut out = (entries.len() as u32).to_le_bytes().to_vec();
            for (k, v) in &entries {
                out.extend_from_slice(&k.val);
                out.extend_from_slice(&v.val);
            }
            return Ok(ParsedValue::new(format!("m{key_ty}{val_ty}"), out));
        }

        if !keys_uniform {
            let second = entries.iter().map(|(k, _)| k).find(|k| k.ty != key_ty).unwrap();
            if !self.mode.allows_heterogeneous_fallback() {
                return Err(ParseError::HeterogeneousMapKey(key_ty, second.ty.clone(), open));
            }
        }

        // Liberal fallback with heterogeneous values (or, degenerately, keys):
        // map-as-any, matching the "mKa"/"maa" shape.
        if !keys_uniform && !self.mode.allows_heterogeneous_fallback() {
            unreachable!("handled above");
        }
        let mut out = (entries.len() as u32).to_le_bytes().to_vec();
        if keys_uniform {
            for (k, v) in &entries {
                out.extend_from_slice(&k.val);
                codec::write_any(&mut Sink::append(&mut out), v.as_view());
            }
            Ok(ParsedValue::new(format!("m{key_ty}a"), out))
        } else {
            for (k, v) in &entries {
                codec::write_any(&mut Sink::append(&mut out), k.as_view());
                codec::write_any(&mut Sink::append(&mut out), v.as_view());
            }
            Ok(ParsedValue::new("maa", out))
        }
    }

    fn parse_tuple(&mut self) -> Result<ParsedValue, ParseError> {
        self.expect(b'(', "a tuple")?;
        self.skip_ws();
        let mut elems = Vec::new();
        loop {
            elems.push(self.parse_value()?);
            self.skip_ws();
            match self.peek() {
                Some(b')') => break,
                Some(c) if is_sep(c) => self.skip_sep(),
                Some(c) => return Err(ParseError::Unexpected { at: self.pos, found: c as char, expected: "',' or ')'" }),
                None => return Err(ParseError::UnexpectedEnd(self.pos)),
            }
        }
        self.expect(b')', "closing )")?;
        if elems.len() < 2 {
            return Err(ParseError::BadErrorArity(elems.len(), self.pos));
        }
        let ty = format!("t{}{}", elems.len(), elems.iter().map(|e| e.ty.as_str()).collect::<String>());
        let mut out = Vec::new();
        for e in &elems {
            out.extend_from_slice(&e.val);
        }
        Ok(ParsedValue::new(ty, out))
    }

    fn parse_typed_literal(&mut self) -> Result<ParsedValue, ParseError> {
        let open = self.pos;
        self.expect(b'<', "a type annotation")?;
        let ty_start = self.pos;
        let close = memchr::memchr(b'>', &self.s[ty_start..]).ok_or(ParseError::UnexpectedEnd(self.s.len()))?;
        self.pos = ty_start + close;
        let ty = self.text(ty_start);
        self.pos += 1; // consume '>'
        let r = parse_type(ty.as_bytes(), true);
        if !r.problem.is_ok() || r.consumed != ty.len() {
            return Err(ParseError::BadTypeAnnotation(open, ty));
        }

        self.skip_ws();
        let has_value = match self.peek() {
            None => false,
            Some(c) if matches!(c, b',' | b';' | b')' | b']' | b'}' | b':') => false,
            _ => true,
        };

        if !has_value {
            let val = if ty.is_empty() {
                Vec::new()
            } else {
                convert::convert("", &[], &ty, ConvertPolicy::ALL, None)
                    .map_err(|e| ParseError::AnnotationMismatch(String::new(), ty.clone(), e.render()))?
            };
            return Ok(ParsedValue::new(ty, val));
        }

        let parsed = self.parse_value()?;
        if parsed.ty == ty {
            return Ok(parsed);
        }
        let val = convert::convert(&parsed.ty, &parsed.val, &ty, ConvertPolicy::ALL, None)
            .map_err(|e| ParseError::AnnotationMismatch(parsed.ty.clone(), ty.clone(), e.render()))?;
        Ok(ParsedValue::new(ty, val))
    }

    fn parse_error_literal(&mut self) -> Result<ParsedValue, ParseError> {
        let open = self.pos;
        self.expect(b'(', "'(' after error")?;
        self.skip_ws();
        let mut args = Vec::new();
        if self.peek() != Some(b')') {
            loop {
                args.push(self.parse_value()?);
                self.skip_ws();
                match self.peek() {
                    Some(b')') => break,
                    Some(c) if is_sep(c) => self.skip_sep(),
                    Some(c) => return Err(ParseError::Unexpected { at: self.pos, found: c as char, expected: "',' or ')'" }),
                    None => return Err(ParseError::UnexpectedEnd(self.pos)),
                }
            }
        }
        self.expect(b')', "closing )")?;

        if args.is_empty() || args.len() > 4 {
            return Err(ParseError::BadErrorArity(args.len(), open));
        }
        let mut strings = Vec::new();
        for (i, a) in args.iter().take(3).enumerate() {
            if a.ty != "s" {
                return Err(ParseError::BadErrorArgType(i, open));
            }
            let (s, _) = codec::read_string_owned(&a.val, 0).unwrap();
            strings.push(s);
        }
        while strings.len() < 3 {
            strings.push(String::new());
        }
        let payload = if let Some(p) = args.get(3) {
            if p.ty == "a" {
                let (a, _) = codec::read_any_owned(&p.val, 0).unwrap();
                a
            } else {
                let val = convert::convert(&p.ty, &p.val, "a", ConvertPolicy::ANY, None)
                    .map_err(|_| ParseError::BadErrorArgType(3, open))?;
                let (a, _) = codec::read_any_owned(&val, 0).unwrap();
                a
            }
        } else {
            AnyOwned::void()
        };
        let record = ErrorRecord::new(strings[0].clone(), strings[1].clone(), strings[2].clone(), payload);
        let mut out = Vec::new();
        errval::write_error_record(&mut Sink::append(&mut out), &record);
        Ok(ParsedValue::new("e", out))
    }

    fn parse_value(&mut self) -> Result<ParsedValue, ParseError> {
        self.skip_ws();
        match self.peek() {
            Some(b'\'') => self.parse_char_literal(),
            Some(b'"') => self.parse_string_literal(),
            Some(b'[') => self.parse_list(),
            Some(b'{') => self.parse_map(),
            Some(b'(') => self.parse_tuple(),
            Some(b'<') => self.parse_typed_literal(),
            Some(_) if self.try_keyword("true") => Ok(ParsedValue::new("b", vec![1])),
            Some(_) if self.try_keyword("false") => Ok(ParsedValue::new("b", vec![0])),
            Some(_) if self.try_keyword("null") => Ok(ParsedValue::void()),
            Some(_) if self.try_keyword("error") => {
                self.skip_ws();
                self.parse_error_literal()
            }
            Some(_) if self.at_number_start() => self.parse_number(),
            Some(c) => Err(ParseError::Unexpected { at: self.pos, found: c as char, expected: "a value" }),
            None => Err(ParseError::UnexpectedEnd(self.pos)),
        }
    }
}

/// Parses one complete text literal, per spec §4.5. Trailing whitespace
/// after the value is tolerated; any other trailing bytes are an error.
pub fn parse_value(input: &str, mode: ParseMode) -> Result<ParsedValue, ParseError> {
    let mut p = P::new(input, mode);
    let v = p.parse_value()?;
    p.skip_ws();
    if p.pos != p.s.len() {
        return Err(ParseError::Unexpected { at: p.pos, found: p.s[p.pos] as char, expected: "end of input" });
    }
    Ok(v)
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn test_s1_tuple() {
        // spec.md S1: "(1, 2.5, true)" -> T="t3idb"
        let v = parse_value("(1, 2.5, true)", ParseMode::Strict).unwrap();
        assert_eq!(v.ty, "t3idb");
        let mut expect = 1i32.to_le_bytes().to_vec();
        expect.extend_from_slice(&2.5f64.to_le_bytes());
        expect.push(1);
        assert_eq!(v.val, expect);
    }

    #[test]
    fn test_unsigned_overflow_promotes_to_big() {
        let v = parse_value("3000000000", ParseMode::Strict).unwrap();
        assert_eq!(v.ty, "I");
    }

    #[test]
    fn test_negative_fitting_stays_small() {
        let v = parse_value("-7", ParseMode::Strict).unwrap();
        assert_eq!(v.ty, "i");
    }

    #[test]
    fn test_float_wins_tie_break() {
        let v = parse_value("2.5", ParseMode::Strict).unwrap();
        assert_eq!(v.ty, "d");
    }

    #[test]
    fn test_integer_wins_no_dot() {
        let v = parse_value("42", ParseMode::Strict).unwrap();
        assert_eq!(v.ty, "i");
    }

    #[test]
    fn test_string_escape() {
        let v = parse_value(r#""a%20b""#, ParseMode::Strict).unwrap();
        assert_eq!(v.ty, "s");
        let (s, _) = codec::read_string_view(&v.val, 0).unwrap();
        assert_eq!(s, "a b");
    }

    #[test]
    fn test_char_escape() {
        let v = parse_value("'%41'", ParseMode::Strict).unwrap();
        assert_eq!(v.ty, "c");
        assert_eq!(v.val, vec![b'A']);
    }

    #[test]
    fn test_bool_and_null() {
        assert_eq!(parse_value("TRUE", ParseMode::Strict).unwrap().val, vec![1]);
        assert_eq!(parse_value("false", ParseMode::Strict).unwrap().val, vec![0]);
        let n = parse_value("null", ParseMode::Strict).unwrap();
        assert_eq!(n.ty, "");
        assert!(n.val.is_empty());
    }

    #[test]
    fn test_uniform_list() {
        let v = parse_value("[1,2,3]", ParseMode::Strict).unwrap();
        assert_eq!(v.ty, "li");
    }

    #[test]
    fn test_heterogeneous_list_strict_errors() {
        let err = parse_value(r#"[1,"x"]"#, ParseMode::Strict).unwrap_err();
        assert!(matches!(err, ParseError::HeterogeneousList(..)));
    }

    #[test]
    fn test_heterogeneous_list_liberal_wraps_any() {
        let v = parse_value(r#"[1,"x"]"#, ParseMode::Liberal).unwrap();
        assert_eq!(v.ty, "la");
    }

    #[test]
    fn test_s6_json_map() {
        // spec.md S6: {"k":1,"v":"x"} in JSON mode -> T="msa"
        let v = parse_value(r#"{"k":1,"v":"x"}"#, ParseMode::Json).unwrap();
        assert_eq!(v.ty, "msa");
        let (count, after) = codec::read_u32_len(&v.val, 0).unwrap();
        assert_eq!(count, 2);
        let (_k, after_k) = codec::read_string_view(&v.val, after).unwrap();
        let (inner1, after_any) = codec::read_any_view(&v.val, after_k).unwrap();
        assert_eq!(inner1.ty, "i");
        let (_k2, after_k2) = codec::read_string_view(&v.val, after_any).unwrap();
        let (inner2, end) = codec::read_any_view(&v.val, after_k2).unwrap();
        assert_eq!(inner2.ty, "s");
        assert_eq!(end, v.val.len());
    }

    #[test]
    fn test_tuple_min_arity() {
        let err = parse_value("(1)", ParseMode::Strict).unwrap_err();
        assert!(matches!(err, ParseError::BadErrorArity(1, _)));
    }

    #[test]
    fn test_typed_literal_void() {
        let v = parse_value("<oi>", ParseMode::Strict).unwrap();
        assert_eq!(v.ty, "oi");
        assert_eq!(v.val, vec![0]);
    }

    #[test]
    fn test_typed_literal_with_value_converts() {
        let v = parse_value("<I>7", ParseMode::Strict).unwrap();
        assert_eq!(v.ty, "I");
        assert_eq!(i64::from_le_bytes(v.val.try_into().unwrap()), 7);
    }

    #[test]
    fn test_error_literal_pads_tail() {
        let v = parse_value(r#"error("boom")"#, ParseMode::Strict).unwrap();
        assert_eq!(v.ty, "e");
        let (rec, end) = errval::read_error_record(&v.val, 0).unwrap();
        assert_eq!(rec.kind, "boom");
        assert_eq!(rec.id, "");
        assert_eq!(rec.message, "");
        assert_eq!(end, v.val.len());
    }

    #[test]
    fn test_error_literal_full() {
        let v = parse_value(r#"error("k","i","m")"#, ParseMode::Strict).unwrap();
        let (rec, _) = errval::read_error_record(&v.val, 0).unwrap();
        assert_eq!(rec.kind, "k");
        assert_eq!(rec.id, "i");
        assert_eq!(rec.message, "m");
    }

    #[test]
    fn test_empty_list_needs_annotation_in_strict() {
        let err = parse_value("[]", ParseMode::Strict).unwrap_err();
        assert!(matches!(err, ParseError::EmptyListNeedsAnnotation(_)));
    }

    #[test]
    fn test_json_map_rejects_non_string_keys() {
        let err = parse_value("{1:2}", ParseMode::Json).unwrap_err();
        assert!(matches!(err, ParseError::NonStringJsonKey(..)));
    }

    #[test]
    fn test_char_literal_encodes_as_string_in_json_mode() {
        let v = parse_value("'A'", ParseMode::Json).unwrap();
        assert_eq!(v.ty, "s");
        let (s, end) = codec::read_string_view(&v.val, 0).unwrap();
        assert_eq!(s, "A");
        assert_eq!(end, v.val.len());
    }

    #[test]
    fn test_hex_number_outside_json() {
        let v = parse_value("0x2A", ParseMode::Strict).unwrap();
        assert_eq!(v.ty, "i");
        assert_eq!(i32::from_le_bytes(v.val.try_into().unwrap()), 42);
    }
}
