//! Primitive codec (spec §3.2, §4.2): fixed-width little-endian readers and
//! writers for `b c i I d`, and length-prefixed readers/writers for `s`.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("value too short: need {need} more byte(s) at offset {at}")]
    Short { at: usize, need: usize },
    #[error("string is not valid UTF-8 at offset {at}")]
    Utf8 { at: usize },
    #[error("trailing bytes after value: {extra} byte(s) left over")]
    Trailing { extra: usize },
}

/// Every write in the engine goes through one of three sinks, matching the
/// spec's "variadic output sink" design note: append to an owned buffer,
/// write into a preallocated cursor, or just count how many bytes would
/// have been written. One branch per top-level `serialize_to` call, not a
/// virtual dispatch per byte.
pub enum Sink<'a> {
    Append(&'a mut Vec<u8>),
    Cursor { buf: &'a mut [u8], pos: usize },
    LenOnly(usize),
}

impl<'a> Sink<'a> {
    pub fn append(buf: &'a mut Vec<u8>) -> Self {
        Sink::Append(buf)
    }
    pub fn cursor(buf: &'a mut [u8]) -> Self {
        Sink::Cursor { buf, pos: 0 }
    }
    pub fn len_only() -> Sink<'static> {
        Sink::LenOnly(0)
    }

    pub fn write(&mut self, bytes: &[u8]) {
        match self {
            Sink::Append(v) => v.extend_from_slice(bytes),
            Sink::Cursor { buf, pos } => {
                buf[*pos..*pos + bytes.len()].copy_from_slice(bytes);
                *pos += bytes.len();
            }
            Sink::LenOnly(n) => *n += bytes.len(),
        }
    }

    pub fn written(&self) -> usize {
        match self {
            Sink::Append(v) => v.len(),
            Sink::Cursor { pos, .. } => *pos,
            Sink::LenOnly(n) => *n,
        }
    }
}

/// The fixed wire width of primitive `c`, or `None` for `s` (which is
/// length-prefixed and has no fixed width).
pub fn fixed_width(c: u8) -> Option<usize> {
    match c {
        b'b' | b'c' => Some(1),
        b'i' => Some(4),
        b'I' | b'd' => Some(8),
        _ => None,
    }
}

// --- writers ---

pub fn write_bool(sink: &mut Sink, v: bool) {
    sink.write(&[v as u8]);
}
pub fn write_char(sink: &mut Sink, v: u8) {
    sink.write(&[v]);
}
pub fn write_i32(sink: &mut Sink, v: i32) {
    sink.write(&v.to_le_bytes());
}
pub fn write_i64(sink: &mut Sink, v: i64) {
    sink.write(&v.to_le_bytes());
}
pub fn write_f64(sink: &mut Sink, v: f64) {
    sink.write(&v.to_le_bytes());
}
pub fn write_len_prefixed(sink: &mut Sink, bytes: &[u8]) {
    sink.write(&(bytes.len() as u32).to_le_bytes());
    sink.write(bytes);
}
pub fn write_string(sink: &mut Sink, v: &str) {
    write_len_prefixed(sink, v.as_bytes());
}

pub fn serialize_len_string(v: &str) -> usize {
    4 + v.len()
}

// --- readers ---

fn need(v: &[u8], at: usize, n: usize) -> Result<(), CodecError> {
    if v.len() - at < n {
        Err(CodecError::Short { at, need: n - (v.len() - at) })
    } else {
        Ok(())
    }
}

pub fn read_bool(v: &[u8], at: usize) -> Result<(bool, usize), CodecError> {
    need(v, at, 1)?;
    Ok((v[at] != 0, at + 1))
}

pub fn read_char(v: &[u8], at: usize) -> Result<(u8, usize), CodecError> {
    need(v, at, 1)?;
    Ok((v[at], at + 1))
}

pub fn read_i32(v: &[u8], at: usize) -> Result<(i32, usize), CodecError> {
    need(v, at, 4)?;
    let bytes: [u8; 4] = v[at..at + 4].try_into().unwrap();
    Ok((i32::from_le_bytes(bytes), at + 4))
}

pub fn read_i64(v: &[u8], at: usize) -> Result<(i64, usize), CodecError> {
    need(v, at, 8)?;
    let bytes: [u8; 8] = v[at..at + 8].try_into().unwrap();
    Ok((i64::from_le_bytes(bytes), at + 8))
}

pub fn read_f64(v: &[u8], at: usize) -> Result<(f64, usize), CodecError> {
    need(v, at, 8)?;
    let bytes: [u8; 8] = v[at..at + 8].try_into().unwrap();
    Ok((f64::from_le_bytes(bytes), at + 8))
}

pub fn read_u32_len(v: &[u8], at: usize) -> Result<(u32, usize), CodecError> {
    need(v, at, 4)?;
    let bytes: [u8; 4] = v[at..at + 4].try_into().unwrap();
    Ok((u32::from_le_bytes(bytes), at + 4))
}

/// Reads a length-prefixed byte range, returning the range's bounds (not a
/// slice), so callers can decide whether to borrow or copy.
pub fn read_len_prefixed_range(v: &[u8], at: usize) -> Result<(std::ops::Range<usize>, usize), CodecError> {
    let (len, after_len) = read_u32_len(v, at)?;
    let len = len as usize;
    need(v, after_len, len)?;
    Ok((after_len..after_len + len, after_len + len))
}

/// Borrowed string view: returns `Err(Utf8)` if the bytes aren't valid
/// UTF-8, matching the spec's "either a borrowed slice (view) or an owned
/// copy" choice for `s` (this is the view half).
pub fn read_string_view(v: &[u8], at: usize) -> Result<(&str, usize), CodecError> {
    let (range, next) = read_len_prefixed_range(v, at)?;
    let s = std::str::from_utf8(&v[range]).map_err(|_| CodecError::Utf8 { at })?;
    Ok((s, next))
}

pub fn read_string_owned(v: &[u8], at: usize) -> Result<(String, usize), CodecError> {
    let (s, next) = read_string_view(v, at)?;
    Ok((s.to_owned(), next))
}

/// `deserialize_from<STRICT>`: reads one fixed-width/length-prefixed
/// primitive scalar and, when `STRICT`, additionally demands that this
/// consumed the whole of `v` (no trailing bytes) — used when validating an
/// `a`'s inner `(T, V)` exactly, as opposed to reading one field out of a
/// longer buffer mid-parse.
pub fn deserialize_from_strict(typechar: u8, v: &[u8]) -> Result<(), CodecError> {
    let consumed = match typechar {
        b'b' => read_bool(v, 0)?.1,
        b'c' => read_char(v, 0)?.1,
        b'i' => read_i32(v, 0)?.1,
        b'I' => read_i64(v, 0)?.1,
        b'd' => read_f64(v, 0)?.1,
        b's' => read_string_view(v, 0)?.1,
        _ => unreachable!("deserialize_from_strict only handles primitive typechars"),
    };
    if consumed != v.len() {
        return Err(CodecError::Trailing { extra: v.len() - consumed });
    }
    Ok(())
}

/// An any-view: a borrowed `(T, V)` pair (spec §3.3).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AnyView<'a> {
    pub ty: &'a str,
    pub val: &'a [u8],
}

impl<'a> AnyView<'a> {
    pub fn new(ty: &'a str, val: &'a [u8]) -> Self {
        AnyView { ty, val }
    }
    pub fn to_owned(&self) -> AnyOwned {
        AnyOwned { ty: self.ty.to_owned(), val: self.val.to_owned() }
    }
}

/// An owned any: owns both the type string and value bytes (spec §3.3).
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct AnyOwned {
    pub ty: String,
    pub val: Vec<u8>,
}

impl AnyOwned {
    pub fn new(ty: impl Into<String>, val: impl Into<Vec<u8>>) -> Self {
        AnyOwned { ty: ty.into(), val: val.into() }
    }
    pub fn as_view(&self) -> AnyView<'_> {
        AnyView { ty: &self.ty, val: &self.val }
    }
    pub fn void() -> Self {
        AnyOwned { ty: String::new(), val: Vec::new() }
    }
}

/// Encodes an any-view on the wire as `tlen ‖ T ‖ vlen ‖ V` (spec §3.3, §6.1).
pub fn write_any(sink: &mut Sink, any: AnyView) {
    write_len_prefixed(sink, any.ty.as_bytes());
    write_len_prefixed(sink, any.val);
}

/// Reads a wire-encoded any (`tlen ‖ T ‖ vlen ‖ V`) and returns it as an
/// owned any plus the offset just past it.
pub fn read_any_owned(v: &[u8], at: usize) -> Result<(AnyOwned, usize), CodecError> {
    let (ty, after_ty) = read_string_owned(v, at)?;
    let (val_range, after_val) = read_len_prefixed_range(v, after_ty)?;
    Ok((AnyOwned { ty, val: v[val_range].to_vec() }, after_val))
}

/// Same as [`read_any_owned`] but returns a borrowed [`AnyView`] instead of
/// copying the payload bytes.
pub fn read_any_view(v: &[u8], at: usize) -> Result<(AnyView<'_>, usize), CodecError> {
    let (ty, after_ty) = read_string_view(v, at)?;
    let (val_range, after_val) = read_len_prefixed_range(v, after_ty)?;
    Ok((AnyView { ty, val: &v[val_range] }, after_val))
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn test_bool_roundtrip() {
        let mut buf = Vec::new();
        write_bool(&mut Sink::append(&mut buf), true);
        assert_eq!(buf, vec![1]);
        assert_eq!(read_bool(&buf, 0).unwrap(), (true, 1));
    }

    #[test]
    fn test_i32_le() {
        let mut buf = Vec::new();
        write_i32(&mut Sink::append(&mut buf), 7);
        assert_eq!(buf, vec![7, 0, 0, 0]);
    }

    #[test]
    fn test_f64_le_matches_s1() {
        // 2.5 as IEEE-754 binary64 LE, from spec.md's S1 scenario.
        let mut buf = Vec::new();
        write_f64(&mut Sink::append(&mut buf), 2.5);
        assert_eq!(buf, vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x40]);
    }

    #[test]
    fn test_string_roundtrip() {
        let mut buf = Vec::new();
        write_string(&mut Sink::append(&mut buf), "hi");
        assert_eq!(buf, vec![2, 0, 0, 0, b'h', b'i']);
        let (s, next) = read_string_view(&buf, 0).unwrap();
        assert_eq!(s, "hi");
        assert_eq!(next, buf.len());
    }

    #[test]
    fn test_short_value() {
        let buf = vec![1, 2, 3];
        assert!(matches!(read_i64(&buf, 0), Err(CodecError::Short { .. })));
    }

    #[test]
    fn test_any_roundtrip() {
        let mut buf = Vec::new();
        write_any(&mut Sink::append(&mut buf), AnyView::new("i", &[7, 0, 0, 0]));
        let (any, next) = read_any_owned(&buf, 0).unwrap();
        assert_eq!(any.ty, "i");
        assert_eq!(any.val, vec![7, 0, 0, 0]);
        assert_eq!(next, buf.len());
    }

    #[test]
    fn test_len_only_sink_counts_without_allocating() {
        let mut sink = Sink::len_only();
        write_string(&mut sink, "hello");
        assert_eq!(sink.written(), serialize_len_string("hello"));
    }
}
