//! The `e` error-record value layout (spec §3.4): `(kind: s, id: s, message:
//! s, payload: a)`. Shared by the scanner, converter, text parser and
//! printer, so it lives in its own small module rather than inside any one
//! of them.

use crate::codec::{
    read_any_owned, read_any_view, read_string_owned, read_string_view, write_any, write_string,
    AnyOwned, CodecError, Sink,
};

/// An owned error record: `kind`/`id` classify the error, `message` is for
/// humans, `payload` carries structured context as an any.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorRecord {
    pub kind: String,
    pub id: String,
    pub message: String,
    pub payload: AnyOwned,
}

impl ErrorRecord {
    pub fn new(kind: impl Into<String>, id: impl Into<String>, message: impl Into<String>, payload: AnyOwned) -> Self {
        ErrorRecord { kind: kind.into(), id: id.into(), message: message.into(), payload }
    }
}

pub(crate) fn write_error_record(sink: &mut Sink, e: &ErrorRecord) {
    write_string(sink, &e.kind);
    write_string(sink, &e.id);
    write_string(sink, &e.message);
    write_any(sink, e.payload.as_view());
}

pub(crate) fn read_error_record(v: &[u8], pos: usize) -> Result<(ErrorRecord, usize), CodecError> {
    let (kind, p1) = read_string_owned(v, pos)?;
    let (id, p2) = read_string_owned(v, p1)?;
    let (message, p3) = read_string_owned(v, p2)?;
    let (payload, p4) = read_any_owned(v, p3)?;
    Ok((ErrorRecord { kind, id, message, payload }, p4))
}

/// Just the byte offset one-past the end of the error record starting at
/// `pos`, without copying anything out.
pub(crate) fn error_value_span(v: &[u8], pos: usize) -> Result<usize, CodecError> {
    let (_, p1) = read_string_view(v, pos)?;
    let (_, p2) = read_string_view(v, p1)?;
    let (_, p3) = read_string_view(v, p2)?;
    let (_, p4) = read_any_view(v, p3)?;
    Ok(p4)
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn test_roundtrip() {
        let e = ErrorRecord::new("type_mismatch_error", "", "bad juju", AnyOwned::void());
        let mut buf = Vec::new();
        write_error_record(&mut Sink::append(&mut buf), &e);
        let (back, next) = read_error_record(&buf, 0).unwrap();
        assert_eq!(back, e);
        assert_eq!(next, buf.len());
    }
}
