//! A small, explicitly-labeled demonstration host binding (spec.md §6.2)
//! for a handful of Rust types: `bool, i32, i64, f64, String, Vec<u8>,
//! Option<T>, Vec<T>, (A, B)` tuples, and `BTreeMap<K, V>`.
//!
//! This is **not** the general host-binding contract of spec.md §6.2 — a
//! real binding would cover arbitrary host containers, heterogeneity
//! fallback to `a`-wrapping, and liberal/strict inference modes. It exists
//! so the `anyser-cli` binary (and this crate's own tests) have something
//! concrete to round-trip through [`anyser_core::convert`],
//! [`anyser_core::scan`], [`anyser_core::parser`] and
//! [`anyser_core::printer`] end to end, the way the teacher's top-level
//! `submerge` crate is a thin client over its subsystem crates rather than
//! a subsystem of its own.

use std::collections::BTreeMap;

use anyser_core::codec::{self, Sink};
use anyser_core::{AnyOwned, ConvertPolicy};

/// Maps one Rust type to a fixed type descriptor and a primitive
/// reader/writer pair, the demonstration binding's entire contract.
pub trait Bind: Sized {
    /// The type descriptor this Rust type always serializes as. Composite
    /// binds (`Option`, `Vec`, tuples, maps) build this recursively from
    /// their element binds' descriptors.
    fn type_string() -> String;

    /// Appends this value's wire bytes to `sink`.
    fn write(&self, sink: &mut Sink);

    /// Reads one value of this type starting at `v[pos..]`, returning the
    /// value and the offset just past it.
    fn read(v: &[u8], pos: usize) -> Result<(Self, usize), codec::CodecError>;
}

impl Bind for bool {
    fn type_string() -> String {
        "b".into()
    }
    fn write(&self, sink: &mut Sink) {
        codec::write_bool(sink, *self)
    }
    fn read(v: &[u8], pos: usize) -> Result<(Self, usize), codec::CodecError> {
        codec::read_bool(v, pos)
    }
}

impl Bind for i32 {
    fn type_string() -> String {
        "i".into()
    }
    fn write(&self, sink: &mut Sink) {
        codec::write_i32(sink, *self)
    }
    fn read(v: &[u8], pos: usize) -> Result<(Self, usize), codec::CodecError> {
        codec::read_i32(v, pos)
    }
}

impl Bind for i64 {
    fn type_string() -> String {
        "I".into()
    }
    fn write(&self, sink: &mut Sink) {
        codec::write_i64(sink, *self)
    }
    fn read(v: &[u8], pos: usize) -> Result<(Self, usize), codec::CodecError> {
        codec::read_i64(v, pos)
    }
}

impl Bind for f64 {
    fn type_string() -> String {
        "d".into()
    }
    fn write(&self, sink: &mut Sink) {
        codec::write_f64(sink, *self)
    }
    fn read(v: &[u8], pos: usize) -> Result<(Self, usize), codec::CodecError> {
        codec::read_f64(v, pos)
    }
}

impl Bind for String {
    fn type_string() -> String {
        "s".into()
    }
    fn write(&self, sink: &mut Sink) {
        codec::write_string(sink, self)
    }
    fn read(v: &[u8], pos: usize) -> Result<(Self, usize), codec::CodecError> {
        codec::read_string_owned(v, pos)
    }
}

/// Maps to `lc`, a list of `char`. Host bindings routinely choose between
/// this and `s` for byte blobs; spec.md's S3 scenario (`convert("lc"->"s")`
/// under `allow_converting_aux`) is exactly the bridge between the two.
impl Bind for Vec<u8> {
    fn type_string() -> String {
        "lc".into()
    }
    fn write(&self, sink: &mut Sink) {
        sink.write(&(self.len() as u32).to_le_bytes());
        for b in self {
            codec::write_char(sink, *b);
        }
    }
    fn read(v: &[u8], pos: usize) -> Result<(Self, usize), codec::CodecError> {
        let (count, mut cur) = codec::read_u32_len(v, pos)?;
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (b, next) = codec::read_char(v, cur)?;
            out.push(b);
            cur = next;
        }
        Ok((out, cur))
    }
}

impl<T: Bind> Bind for Option<T> {
    fn type_string() -> String {
        format!("o{}", T::type_string())
    }
    fn write(&self, sink: &mut Sink) {
        match self {
            Some(v) => {
                codec::write_bool(sink, true);
                v.write(sink);
            }
            None => codec::write_bool(sink, false),
        }
    }
    fn read(v: &[u8], pos: usize) -> Result<(Self, usize), codec::CodecError> {
        let (has, after) = codec::read_bool(v, pos)?;
        if has {
            let (inner, next) = T::read(v, after)?;
            Ok((Some(inner), next))
        } else {
            Ok((None, after))
        }
    }
}

impl<T: Bind> Bind for Vec<T> {
    fn type_string() -> String {
        format!("l{}", T::type_string())
    }
    fn write(&self, sink: &mut Sink) {
        sink.write(&(self.len() as u32).to_le_bytes());
        for item in self {
            item.write(sink);
        }
    }
    fn read(v: &[u8], pos: usize) -> Result<(Self, usize), codec::CodecError> {
        let (count, mut cur) = codec::read_u32_len(v, pos)?;
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (item, next) = T::read(v, cur)?;
            out.push(item);
            cur = next;
        }
        Ok((out, cur))
    }
}

impl<A: Bind, B: Bind> Bind for (A, B) {
    fn type_string() -> String {
        format!("t2{}{}", A::type_string(), B::type_string())
    }
    fn write(&self, sink: &mut Sink) {
        self.0.write(sink);
        self.1.write(sink);
    }
    fn read(v: &[u8], pos: usize) -> Result<(Self, usize), codec::CodecError> {
        let (a, after_a) = A::read(v, pos)?;
        let (b, after_b) = B::read(v, after_a)?;
        Ok(((a, b), after_b))
    }
}

impl<K: Bind + Ord, V: Bind> Bind for BTreeMap<K, V> {
    fn type_string() -> String {
        format!("m{}{}", K::type_string(), V::type_string())
    }
    fn write(&self, sink: &mut Sink) {
        sink.write(&(self.len() as u32).to_le_bytes());
        for (k, v) in self {
            k.write(sink);
            v.write(sink);
        }
    }
    fn read(v: &[u8], pos: usize) -> Result<(Self, usize), codec::CodecError> {
        let (count, mut cur) = codec::read_u32_len(v, pos)?;
        let mut out = BTreeMap::new();
        for _ in 0..count {
            let (k, after_k) = K::read(v, cur)?;
            let (val, after_v) = V::read(v, after_k)?;
            out.insert(k, val);
            cur = after_v;
        }
        Ok((out, cur))
    }
}

/// Serializes `value` to its `(T, V)` wire pair.
pub fn encode<T: Bind>(value: &T) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    value.write(&mut Sink::append(&mut buf));
    (T::type_string(), buf)
}

/// Decodes `v` as a `T`, converting from `source_ty` first if it differs
/// from `T`'s own wire type (spec.md §4.4's converting codec, applied with
/// `policy`).
pub fn decode<T: Bind>(source_ty: &str, v: &[u8], policy: ConvertPolicy) -> anyser_base::Result<T> {
    let target_ty = T::type_string();
    let bytes = if source_ty == target_ty {
        v.to_vec()
    } else {
        anyser_core::convert(source_ty, v, &target_ty, policy, None)?
    };
    let (value, _) = T::read(&bytes, 0)?;
    Ok(value)
}

/// Wraps `value` as an `any` (spec.md §6.1's `u32 tlen‖T‖u32 vlen‖V`
/// envelope).
pub fn encode_any<T: Bind>(value: &T) -> AnyOwned {
    let (ty, val) = encode(value);
    AnyOwned::new(ty, val)
}

#[cfg(test)]
mod test {
    use super::*;
    use anyser_core::{parser, printer};
    use test_log::test;

    #[test]
    fn test_roundtrip_scalar() {
        let (ty, v) = encode(&7i32);
        assert_eq!(ty, "i");
        let back: i32 = decode(&ty, &v, ConvertPolicy::NONE).unwrap();
        assert_eq!(back, 7);
    }

    /// spec.md §8 scenario S1: `"(1, 2.5, true)"` parses to `T="t3idb"`
    /// with the exact bytes shown in the scenario, and the demonstration
    /// binding's own tuple encoding produces the same wire pair.
    #[test]
    fn test_s1_tuple_matches_parser_and_bind() {
        let parsed = parser::parse_value(r#"(1, 2.5, true)"#, parser::ParseMode::Strict).unwrap();
        assert_eq!(parsed.ty, "t3idb");

        let mut v = 1i32.to_le_bytes().to_vec();
        v.extend_from_slice(&2.5f64.to_le_bytes());
        v.push(1);
        assert_eq!(parsed.val, v);
    }

    /// spec.md §8 scenario S2.
    #[test]
    fn test_s2_list_roundtrip() {
        let (ty, v) = encode(&vec![7i32, 8, 9]);
        assert_eq!(ty, "li");
        let mut expect = 3u32.to_le_bytes().to_vec();
        expect.extend_from_slice(&7i32.to_le_bytes());
        expect.extend_from_slice(&8i32.to_le_bytes());
        expect.extend_from_slice(&9i32.to_le_bytes());
        assert_eq!(v, expect);
    }

    /// spec.md §8 scenario S3: `lc` converts to `s` byte-for-byte under
    /// `allow_converting_aux`.
    #[test]
    fn test_s3_bytes_convert_to_string() {
        let (ty, v) = encode(&b"hi".to_vec());
        assert_eq!(ty, "lc");
        let as_string: String = decode(&ty, &v, ConvertPolicy::AUX).unwrap();
        assert_eq!(as_string, "hi");
    }

    #[test]
    fn test_option_and_map_binds() {
        let mut m = BTreeMap::new();
        m.insert("k".to_string(), 1i32);
        let (ty, v) = encode(&m);
        assert_eq!(ty, "msi");
        let back: BTreeMap<String, i32> = decode(&ty, &v, ConvertPolicy::NONE).unwrap();
        assert_eq!(back.get("k"), Some(&1));

        let (ty, v) = encode(&Some(3i32));
        assert_eq!(ty, "oi");
        let back: Option<i32> = decode(&ty, &v, ConvertPolicy::NONE).unwrap();
        assert_eq!(back, Some(3));
    }

    #[test]
    fn test_printer_roundtrip_native() {
        let (ty, v) = encode(&(1i32, true));
        let out = printer::print_value(codec::AnyView::new(&ty, &v), printer::PrintMode::Native, None);
        assert_eq!(out.as_str(), "<t2ib>(1,true)");
    }
}
