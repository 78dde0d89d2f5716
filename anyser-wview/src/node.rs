//! The wview tree itself (spec §3.5–§3.6, §4.7–§4.9): a chunked, refcounted,
//! copy-on-write overlay over one serialized `(T, V)` blob. Indexing into a
//! container lazily parses and memoizes one child [`Node`] per position;
//! mutating a node disowns its own memoized children and splices the
//! change into every ancestor up to the root, rewriting `a`-envelope length
//! headers along the way.
//!
//! Generalized from the teacher's flat per-column chunk tracking
//! (`submerge-coldb/src/track.rs`, `src/chunk.rs`) into a recursive parent
//! tree: the teacher never needed parent pointers or retyping, since
//! columns have a fixed type for the database's lifetime, but the same
//! `Rc`-refcounted, offset/length "chunk" vocabulary carries over directly.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use anyser_core::{codec, scan, typestr, AnyOwned, ConvertPolicy};

use crate::chunk::{flatten, owned_chunk, splice, sub_range, Chunk};
use crate::error::{Result, WviewError};

fn conv(e: impl std::fmt::Display) -> WviewError {
    WviewError::Malformed(e.to_string())
}

/// True if `b` is an ancestor of `a`, or `a` is an ancestor of `b` (spec
/// §4.7: `swap_content_with` must not be an ancestor/descendant).
fn is_related(a: &Rc<RefCell<Node>>, b: &Rc<RefCell<Node>>) -> bool {
    fn is_ancestor_of(maybe_ancestor: &Rc<RefCell<Node>>, node: &Rc<RefCell<Node>>) -> bool {
        let mut cur = node.borrow().parent.as_ref().and_then(|w| w.upgrade());
        while let Some(p) = cur {
            if Rc::ptr_eq(&p, maybe_ancestor) {
                return true;
            }
            cur = p.borrow().parent.as_ref().and_then(|w| w.upgrade());
        }
        false
    }
    is_ancestor_of(a, b) || is_ancestor_of(b, a)
}

#[derive(Clone, Copy, Default)]
struct SlotBounds {
    tstart: usize,
    tlen: usize,
    vstart: usize,
    vlen: usize,
}

struct ChildSlot {
    index: usize,
    node: Rc<RefCell<Node>>,
    bounds: SlotBounds,
}

pub(crate) struct Node {
    parent: Option<Weak<RefCell<Node>>>,
    index_in_parent: Option<usize>,
    tchunks: Vec<Chunk>,
    vchunks: Vec<Chunk>,
    children: Vec<ChildSlot>,
}

/// A handle into a wview tree. Cheap to clone (an `Rc` bump); two handles
/// obtained via [`Wview::child`] from the same parent alias the same
/// memoized [`Node`].
#[derive(Clone)]
pub struct Wview(Rc<RefCell<Node>>);

impl Wview {
    /// Builds a fresh root wview over an owned copy of `(type_str, value)`.
    pub fn new(type_str: &str, value: &[u8]) -> Wview {
        let node = Node {
            parent: None,
            index_in_parent: None,
            tchunks: vec![owned_chunk(type_str.as_bytes().to_vec())],
            vchunks: vec![owned_chunk(value.to_vec())],
            children: Vec::new(),
        };
        Wview(Rc::new(RefCell::new(node)))
    }

    pub fn type_string(&self) -> String {
        String::from_utf8_lossy(&flatten(&self.0.borrow().tchunks)).into_owned()
    }

    pub fn value_bytes(&self) -> Vec<u8> {
        flatten(&self.0.borrow().vchunks)
    }

    pub fn typechar(&self) -> Option<u8> {
        flatten(&self.0.borrow().tchunks).first().copied()
    }

    pub fn as_any(&self) -> AnyOwned {
        AnyOwned::new(self.type_string(), self.value_bytes())
    }

    /// Number of indexable children, or `None` for a scalar with none.
    pub fn size(&self) -> Option<usize> {
        let (t, v) = { let n = self.0.borrow(); (flatten(&n.tchunks), flatten(&n.vchunks)) };
        match *t.first()? {
            b'l' => codec::read_u32_len(&v, 0).ok().map(|(c, _)| c as usize),
            b'm' => codec::read_u32_len(&v, 0).ok().map(|(c, _)| c as usize * 2),
            b't' => parse_tuple_arity(&t, 0).ok().map(|(n, _)| n),
            b'e' => Some(4),
            b'o' => codec::read_bool(&v, 0).ok().map(|(h, _)| if h { 1 } else { 0 }),
            b'x' | b'X' => Some(1),
            b'a' => Some(1),
            _ => None,
        }
    }

    /// Indexes into a container, lazily parsing and memoizing the child.
    /// Memoized children are invalidated (evicted) whenever a mutation
    /// shifts their byte position (spec §3.6: "mutations disown existing
    /// parsed children").
    pub fn child(&self, i: usize) -> Result<Wview> {
        if let Some(slot) = self.0.borrow().children.iter().find(|c| c.index == i) {
            return Ok(Wview(slot.node.clone()));
        }
        let (t, v) = { let n = self.0.borrow(); (flatten(&n.tchunks), flatten(&n.vchunks)) };
        let layout = locate_child(&t, &v, i)?;
        let (tchunks, vchunks) = {
            let n = self.0.borrow();
            let tchunks = match &layout.ty {
                ChildType::Shared { tstart, tlen } => sub_range(&n.tchunks, *tstart, *tlen),
                ChildType::Owned(bytes) => vec![owned_chunk(bytes.clone())],
            };
            let vchunks = sub_range(&n.vchunks, layout.vstart, layout.vlen);
            (tchunks, vchunks)
        };
        let bounds = match &layout.ty {
            ChildType::Shared { tstart, tlen } => SlotBounds { tstart: *tstart, tlen: *tlen, vstart: layout.vstart, vlen: layout.vlen },
            ChildType::Owned(_) => SlotBounds { tstart: 0, tlen: 0, vstart: layout.vstart, vlen: layout.vlen },
        };
        let child_node = Rc::new(RefCell::new(Node {
            parent: Some(Rc::downgrade(&self.0)),
            index_in_parent: Some(i),
            tchunks,
            vchunks,
            children: Vec::new(),
        }));
        let mut n = self.0.borrow_mut();
        let pos = n.children.partition_point(|c| c.index < i);
        n.children.insert(pos, ChildSlot { index: i, node: child_node.clone(), bounds });
        Ok(Wview(child_node))
    }

    /// Replaces this node's own type and value in place, subject to its
    /// parent's allow-child policy (spec §4.7), propagating the length
    /// change (and, through a chain of tuples, the type-string change) up
    /// to the root.
    #[tracing::instrument(level = "trace", skip(self, new_any), fields(new_type = %new_any.ty))]
    pub fn set(&self, new_any: AnyOwned) -> Result<()> {
        self.validate_type_change(new_any.ty.as_bytes())?;
        let tchunks = vec![owned_chunk(new_any.ty.into_bytes())];
        let vchunks = vec![owned_chunk(new_any.val)];
        commit_and_propagate(self.0.clone(), tchunks, vchunks)
    }

    fn validate_type_change(&self, new_type: &[u8]) -> Result<()> {
        let (parent_opt, index) = {
            let n = self.0.borrow();
            (n.parent.as_ref().and_then(|w| w.upgrade()), n.index_in_parent)
        };
        let (parent_rc, idx) = match (parent_opt, index) {
            (Some(p), Some(i)) => (p, i),
            _ => return Ok(()),
        };
        let parent_type = flatten(&parent_rc.borrow().tchunks);
        match check_child_type_change(&parent_type, idx, new_type)? {
            None => Ok(()),
            Some(new_parent_type) => Wview(parent_rc).validate_type_change(&new_parent_type),
        }
    }

    /// Removes the element (for `l`) or key/value pair (for `m`, counted in
    /// pairs) at `i`.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn erase(&self, i: usize) -> Result<()> {
        let (t, v) = { let n = self.0.borrow(); (flatten(&n.tchunks), flatten(&n.vchunks)) };
        match t.first() {
            Some(b'l') => {
                let elem_tpos = 1;
                let (count, after_count) = codec::read_u32_len(&v, 0).map_err(conv)?;
                if i as u32 >= count {
                    return Err(WviewError::IndexOutOfRange { index: i, len: count as usize });
                }
                let mut vcur = after_count;
                let mut elem_start = vcur;
                for idx in 0..count {
                    let vnext = skip_value(&t, elem_tpos, &v, vcur)?;
                    if idx as usize == i {
                        elem_start = vcur;
                        vcur = vnext;
                        break;
                    }
                    vcur = vnext;
                }
                let mut new_v = Vec::with_capacity(v.len());
                new_v.extend_from_slice(&(count - 1).to_le_bytes());
                new_v.extend_from_slice(&v[after_count..elem_start]);
                new_v.extend_from_slice(&v[vcur..]);
                commit_and_propagate(self.0.clone(), vec![owned_chunk(t)], vec![owned_chunk(new_v)])
            }
            Some(b'm') => {
                let key_tpos = 1;
                let key_tlen = type_len(&t, key_tpos)?;
                let val_tpos = key_tpos + key_tlen;
                let (count, after_count) = codec::read_u32_len(&v, 0).map_err(conv)?;
                if i as u32 >= count {
                    return Err(WviewError::IndexOutOfRange { index: i, len: count as usize });
                }
                let mut vcur = after_count;
                let mut pair_start = vcur;
                for idx in 0..count {
                    let vk = skip_value(&t, key_tpos, &v, vcur)?;
                    let vv = skip_value(&t, val_tpos, &v, vk)?;
                    if idx as usize == i {
                        pair_start = vcur;
                        vcur = vv;
                        break;
                    }
                    vcur = vv;
                }
                let mut new_v = Vec::with_capacity(v.len());
                new_v.extend_from_slice(&(count - 1).to_le_bytes());
                new_v.extend_from_slice(&v[after_count..pair_start]);
                new_v.extend_from_slice(&v[vcur..]);
                commit_and_propagate(self.0.clone(), vec![owned_chunk(t)], vec![owned_chunk(new_v)])
            }
            Some(b't') => {
                let (arity, tcur0) = parse_tuple_arity(&t, 0)?;
                if i >= arity {
                    return Err(WviewError::IndexOutOfRange { index: i, len: arity });
                }
                if arity <= 2 {
                    return Err(WviewError::Api("tuple may not drop below 2 elements".into()));
                }
                let mut tcur = tcur0;
                let mut vcur = 0;
                let mut field = (0usize, 0usize, 0usize, 0usize); // tstart, tlen, vstart, vlen
                for idx in 0..arity {
                    let flen = type_len(&t, tcur)?;
                    let vnext = skip_value(&t, tcur, &v, vcur)?;
                    if idx == i {
                        field = (tcur, flen, vcur, vnext - vcur);
                    }
                    tcur += flen;
                    vcur = vnext;
                }
                let (f_tstart, f_tlen, f_vstart, f_vlen) = field;
                let new_arity = arity - 1;
                let mut new_t = Vec::with_capacity(t.len());
                new_t.push(b't');
                new_t.extend_from_slice(new_arity.to_string().as_bytes());
                new_t.extend_from_slice(&t[tcur0..f_tstart]);
                new_t.extend_from_slice(&t[f_tstart + f_tlen..]);
                let mut new_v = Vec::with_capacity(v.len());
                new_v.extend_from_slice(&v[..f_vstart]);
                new_v.extend_from_slice(&v[f_vstart + f_vlen..]);
                commit_and_propagate(self.0.clone(), vec![owned_chunk(new_t)], vec![owned_chunk(new_v)])
            }
            Some(b'o') => {
                if i != 0 {
                    return Err(WviewError::IndexOutOfRange { index: i, len: if v.first() == Some(&1) { 1 } else { 0 } });
                }
                let mut new_v = Vec::with_capacity(v.len());
                new_v.push(0);
                commit_and_propagate(self.0.clone(), vec![owned_chunk(t)], vec![owned_chunk(new_v)])
            }
            Some(c) => Err(WviewError::NotIndexable { typechar: *c as char }),
            None => Err(WviewError::Malformed("empty type string".into())),
        }
    }

    /// Inserts `new_any` into a list after list-index `after` (`None`
    /// prepends), or as a new tuple field after tuple-field `after` (`None`
    /// prepends a new first field). `new_any`'s type is spliced in verbatim
    /// for tuples; for lists it must match the element type exactly.
    #[tracing::instrument(level = "trace", skip(self, new_any), fields(new_type = %new_any.ty))]
    pub fn insert_after(&self, after: Option<usize>, new_any: AnyOwned) -> Result<()> {
        let (t, v) = { let n = self.0.borrow(); (flatten(&n.tchunks), flatten(&n.vchunks)) };
        match t.first() {
            Some(b'l') => {
                let elem_type = &t[1..];
                if new_any.ty.as_bytes() != elem_type {
                    return Err(WviewError::TypeChangeDenied { attempted: new_any.ty, parent_typechar: 'l' });
                }
                let (count, after_count) = codec::read_u32_len(&v, 0).map_err(conv)?;
                let insert_at = match after {
                    None => after_count,
                    Some(idx) => {
                        if idx as u32 >= count {
                            return Err(WviewError::IndexOutOfRange { index: idx, len: count as usize });
                        }
                        let mut vcur = after_count;
                        for _ in 0..=idx {
                            vcur = skip_value(&t, 1, &v, vcur)?;
                        }
                        vcur
                    }
                };
                let mut new_v = Vec::with_capacity(v.len() + new_any.val.len() + 4);
                new_v.extend_from_slice(&(count + 1).to_le_bytes());
                new_v.extend_from_slice(&v[after_count..insert_at]);
                new_v.extend_from_slice(&new_any.val);
                new_v.extend_from_slice(&v[insert_at..]);
                commit_and_propagate(self.0.clone(), vec![owned_chunk(t)], vec![owned_chunk(new_v)])
            }
            Some(b't') => {
                let (arity, tcur0) = parse_tuple_arity(&t, 0)?;
                let insert_before = match after {
                    None => 0,
                    Some(idx) => {
                        if idx >= arity {
                            return Err(WviewError::IndexOutOfRange { index: idx, len: arity });
                        }
                        idx + 1
                    }
                };
                let mut tcur = tcur0;
                let mut vcur = 0;
                let mut t_insert_at = tcur0;
                let mut v_insert_at = 0;
                for idx in 0..arity {
                    let flen = type_len(&t, tcur)?;
                    let vnext = skip_value(&t, tcur, &v, vcur)?;
                    tcur += flen;
                    vcur = vnext;
                    if idx + 1 == insert_before {
                        t_insert_at = tcur;
                        v_insert_at = vcur;
                    }
                }
                let new_arity = arity + 1;
                let mut new_t = Vec::with_capacity(t.len() + new_any.ty.len() + 4);
                new_t.push(b't');
                new_t.extend_from_slice(new_arity.to_string().as_bytes());
                new_t.extend_from_slice(&t[tcur0..t_insert_at]);
                new_t.extend_from_slice(new_any.ty.as_bytes());
                new_t.extend_from_slice(&t[t_insert_at..]);
                let mut new_v = Vec::with_capacity(v.len() + new_any.val.len());
                new_v.extend_from_slice(&v[..v_insert_at]);
                new_v.extend_from_slice(&new_any.val);
                new_v.extend_from_slice(&v[v_insert_at..]);
                commit_and_propagate(self.0.clone(), vec![owned_chunk(new_t)], vec![owned_chunk(new_v)])
            }
            Some(c) => Err(WviewError::NotIndexable { typechar: *c as char }),
            None => Err(WviewError::Malformed("empty type string".into())),
        }
    }

    /// Swaps the entire `(type, value)` content of two nodes, each subject
    /// to its own parent's allow-child policy. Refuses when one node is an
    /// ancestor or descendant of the other (spec §4.7, §7 "API error").
    pub fn swap_content_with(&self, other: &Wview) -> Result<()> {
        if Rc::ptr_eq(&self.0, &other.0) || is_related(&self.0, &other.0) {
            return Err(WviewError::Api("cannot swap a node's content with its own ancestor or descendant".into()));
        }
        let (my_t, my_v) = { let n = self.0.borrow(); (n.tchunks.clone(), n.vchunks.clone()) };
        let (other_t, other_v) = { let n = other.0.borrow(); (n.tchunks.clone(), n.vchunks.clone()) };
        self.validate_type_change(&flatten(&other_t))?;
        other.validate_type_change(&flatten(&my_t))?;
        commit_and_propagate(self.0.clone(), other_t, other_v)?;
        commit_and_propagate(other.0.clone(), my_t, my_v)?;
        Ok(())
    }

    /// Scans this container's children in order for one whose first `n`
    /// sub-fields, concatenated, byte-for-byte equal `needle`; returns the
    /// first such element's index (spec §4.7, §8 testable property 10). An
    /// element with fewer than `n` sub-fields never matches. `n == 0` only
    /// matches against an empty `needle`. Uses `memchr`'s substring search
    /// for the final comparison, the same tool the teacher's heap dedup
    /// lookup (`submerge-coldb/src/heap.rs`) uses to scan a growing byte
    /// buffer.
    pub fn linear_search(&self, needle: &[u8], n: usize) -> Option<usize> {
        let count = self.size()?;
        'elems: for i in 0..count {
            let Ok(elem) = self.child(i) else { continue };
            let mut prefix = Vec::new();
            match elem.size() {
                Some(field_count) => {
                    if n > field_count {
                        continue;
                    }
                    for k in 0..n {
                        let Ok(sub) = elem.child(k) else { continue 'elems };
                        prefix.extend_from_slice(&sub.value_bytes());
                    }
                }
                None => {
                    if n != 1 {
                        continue;
                    }
                    prefix.extend_from_slice(&elem.value_bytes());
                }
            }
            if prefix.len() == needle.len() && (needle.is_empty() || memchr::memmem::find(&prefix, needle) == Some(0)) {
                return Some(i);
            }
        }
        None
    }

    pub fn get_as<T: HostScalar>(&self, policy: ConvertPolicy) -> Result<T> {
        let ty = self.type_string();
        let val = self.value_bytes();
        if ty == T::TYPE {
            T::decode(&val)
        } else {
            let converted = anyser_core::convert(&ty, &val, T::TYPE, policy, None)?;
            T::decode(&converted)
        }
    }
}

/// Host scalar types the demo binding ([`Wview::get_as`]) knows how to
/// decode, converting from the node's stored type if necessary.
pub trait HostScalar: Sized {
    const TYPE: &'static str;
    fn decode(v: &[u8]) -> Result<Self>;
}

impl HostScalar for bool {
    const TYPE: &'static str = "b";
    fn decode(v: &[u8]) -> Result<Self> {
        Ok(codec::read_bool(v, 0).map_err(conv)?.0)
    }
}
impl HostScalar for i32 {
    const TYPE: &'static str = "i";
    fn decode(v: &[u8]) -> Result<Self> {
        Ok(codec::read_i32(v, 0).map_err(conv)?.0)
    }
}
impl HostScalar for i64 {
    const TYPE: &'static str = "I";
    fn decode(v: &[u8]) -> Result<Self> {
        Ok(codec::read_i64(v, 0).map_err(conv)?.0)
    }
}
impl HostScalar for f64 {
    const TYPE: &'static str = "d";
    fn decode(v: &[u8]) -> Result<Self> {
        Ok(codec::read_f64(v, 0).map_err(conv)?.0)
    }
}
impl HostScalar for String {
    const TYPE: &'static str = "s";
    fn decode(v: &[u8]) -> Result<Self> {
        Ok(codec::read_string_owned(v, 0).map_err(conv)?.0)
    }
}

enum ChildType {
    Shared { tstart: usize, tlen: usize },
    Owned(Vec<u8>),
}

struct ChildLayout {
    ty: ChildType,
    vstart: usize,
    vlen: usize,
}

fn type_len(t: &[u8], tpos: usize) -> Result<usize> {
    let r = typestr::parse_type(&t[tpos..], false);
    if r.problem != typestr::TypeProblem::Ok {
        return Err(WviewError::Malformed("bad type string".into()));
    }
    Ok(r.consumed)
}

fn parse_tuple_arity(t: &[u8], tpos: usize) -> Result<(usize, usize)> {
    let mut p = tpos + 1;
    let start = p;
    while p < t.len() && t[p].is_ascii_digit() {
        p += 1;
    }
    let n: usize = std::str::from_utf8(&t[start..p])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| WviewError::Malformed("bad tuple arity".into()))?;
    Ok((n, p))
}

fn skip_error(v: &[u8], vpos: usize) -> Result<usize> {
    let (_, p1) = codec::read_string_view(v, vpos).map_err(conv)?;
    let (_, p2) = codec::read_string_view(v, p1).map_err(conv)?;
    let (_, p3) = codec::read_string_view(v, p2).map_err(conv)?;
    let (_, p4) = codec::read_any_view(v, p3).map_err(conv)?;
    Ok(p4)
}

/// Advances `vpos` past one value of type `t[tpos..]`, without copying it.
/// A crate-local re-derivation of `anyser_core::scan`'s walk (that module's
/// equivalent is private to its own crate), specialized for the wview
/// tree's own indexing needs.
fn skip_value(t: &[u8], tpos: usize, v: &[u8], vpos: usize) -> Result<usize> {
    if tpos >= t.len() {
        return Err(WviewError::Malformed("type exhausted".into()));
    }
    Ok(match t[tpos] {
        b'b' | b'c' => vpos + 1,
        b'i' => vpos + 4,
        b'I' | b'd' => vpos + 8,
        b's' => codec::read_string_view(v, vpos).map_err(conv)?.1,
        b'a' => codec::read_any_view(v, vpos).map_err(conv)?.1,
        b'e' => skip_error(v, vpos)?,
        b'l' => {
            let elem_tpos = tpos + 1;
            let (count, after_count) = codec::read_u32_len(v, vpos).map_err(conv)?;
            let mut vcur = after_count;
            for _ in 0..count {
                vcur = skip_value(t, elem_tpos, v, vcur)?;
            }
            vcur
        }
        b'm' => {
            let key_tpos = tpos + 1;
            let key_tlen = type_len(t, key_tpos)?;
            let val_tpos = key_tpos + key_tlen;
            let (count, after_count) = codec::read_u32_len(v, vpos).map_err(conv)?;
            let mut vcur = after_count;
            for _ in 0..count {
                vcur = skip_value(t, key_tpos, v, vcur)?;
                vcur = skip_value(t, val_tpos, v, vcur)?;
            }
            vcur
        }
        b't' => {
            let (arity, mut tcur) = parse_tuple_arity(t, tpos)?;
            let mut vcur = vpos;
            for _ in 0..arity {
                let flen = type_len(t, tcur)?;
                vcur = skip_value(t, tcur, v, vcur)?;
                tcur += flen;
            }
            vcur
        }
        b'o' => {
            let (has, _) = codec::read_bool(v, vpos).map_err(conv)?;
            if has {
                skip_value(t, tpos + 1, v, vpos + 1)?
            } else {
                vpos + 1
            }
        }
        b'x' | b'X' => {
            let (has, _) = codec::read_bool(v, vpos).map_err(conv)?;
            if has {
                if t[tpos] == b'X' {
                    vpos + 1
                } else {
                    skip_value(t, tpos + 1, v, vpos + 1)?
                }
            } else {
                skip_error(v, vpos + 1)?
            }
        }
        _ => return Err(WviewError::Malformed("unknown typechar".into())),
    })
}

/// Locates child `i` of the container described by flattened `(t, v)`
/// (spec §4.7's `operator[]` table).
fn locate_child(t: &[u8], v: &[u8], i: usize) -> Result<ChildLayout> {
    let tc = *t.first().ok_or_else(|| WviewError::NotIndexable { typechar: ' ' })?;
    match tc {
        b'l' => {
            let elem_tpos = 1;
            let elem_tlen = t.len() - 1;
            let (count, after_count) = codec::read_u32_len(v, 0).map_err(conv)?;
            if i as u32 >= count {
                return Err(WviewError::IndexOutOfRange { index: i, len: count as usize });
            }
            let mut vcur = after_count;
            for idx in 0..count {
                let vnext = skip_value(t, elem_tpos, v, vcur)?;
                if idx as usize == i {
                    return Ok(ChildLayout { ty: ChildType::Shared { tstart: elem_tpos, tlen: elem_tlen }, vstart: vcur, vlen: vnext - vcur });
                }
                vcur = vnext;
            }
            unreachable!()
        }
        b'm' => {
            let key_tpos = 1;
            let key_tlen = type_len(t, key_tpos)?;
            let val_tpos = key_tpos + key_tlen;
            let val_tlen = t.len() - val_tpos;
            let (count, after_count) = codec::read_u32_len(v, 0).map_err(conv)?;
            let total = count as usize * 2;
            if i >= total {
                return Err(WviewError::IndexOutOfRange { index: i, len: total });
            }
            let mut vcur = after_count;
            for idx in 0..count as usize {
                let vk = skip_value(t, key_tpos, v, vcur)?;
                if idx * 2 == i {
                    return Ok(ChildLayout { ty: ChildType::Shared { tstart: key_tpos, tlen: key_tlen }, vstart: vcur, vlen: vk - vcur });
                }
                let vv = skip_value(t, val_tpos, v, vk)?;
                if idx * 2 + 1 == i {
                    return Ok(ChildLayout { ty: ChildType::Shared { tstart: val_tpos, tlen: val_tlen }, vstart: vk, vlen: vv - vk });
                }
                vcur = vv;
            }
            unreachable!()
        }
        b't' => {
            let (arity, mut tcur) = parse_tuple_arity(t, 0)?;
            if i >= arity {
                return Err(WviewError::IndexOutOfRange { index: i, len: arity });
            }
            let mut vcur = 0;
            for idx in 0..arity {
                let flen = type_len(t, tcur)?;
                let vnext = skip_value(t, tcur, v, vcur)?;
                if idx == i {
                    return Ok(ChildLayout { ty: ChildType::Shared { tstart: tcur, tlen: flen }, vstart: vcur, vlen: vnext - vcur });
                }
                tcur += flen;
                vcur = vnext;
            }
            unreachable!()
        }
        b'e' => {
            const FIELD_TYPES: [&[u8]; 4] = [b"s", b"s", b"s", b"a"];
            if i >= 4 {
                return Err(WviewError::IndexOutOfRange { index: i, len: 4 });
            }
            let mut vcur = 0;
            for (idx, ft) in FIELD_TYPES.into_iter().enumerate() {
                let vnext = skip_value(ft, 0, v, vcur)?;
                if idx == i {
                    return Ok(ChildLayout { ty: ChildType::Owned(ft.to_vec()), vstart: vcur, vlen: vnext - vcur });
                }
                vcur = vnext;
            }
            unreachable!()
        }
        b'o' => {
            let (has, _) = codec::read_bool(v, 0).map_err(conv)?;
            if !has || i != 0 {
                return Err(WviewError::IndexOutOfRange { index: i, len: if has { 1 } else { 0 } });
            }
            Ok(ChildLayout { ty: ChildType::Shared { tstart: 1, tlen: t.len() - 1 }, vstart: 1, vlen: v.len() - 1 })
        }
        b'x' | b'X' => {
            let (has, _) = codec::read_bool(v, 0).map_err(conv)?;
            if i != 0 {
                return Err(WviewError::IndexOutOfRange { index: i, len: 1 });
            }
            if has {
                if t[0] == b'X' {
                    Ok(ChildLayout { ty: ChildType::Owned(Vec::new()), vstart: 1, vlen: v.len() - 1 })
                } else {
                    Ok(ChildLayout { ty: ChildType::Shared { tstart: 1, tlen: t.len() - 1 }, vstart: 1, vlen: v.len() - 1 })
                }
            } else {
                Ok(ChildLayout { ty: ChildType::Owned(b"e".to_vec()), vstart: 1, vlen: v.len() - 1 })
            }
        }
        b'a' => {
            if i != 0 {
                return Err(WviewError::IndexOutOfRange { index: i, len: 1 });
            }
            let (tlen, after_tlen) = codec::read_u32_len(v, 0).map_err(conv)?;
            let tstart2 = after_tlen;
            let tend2 = tstart2 + tlen as usize;
            let (vlen, after_vlen) = codec::read_u32_len(v, tend2).map_err(conv)?;
            let vstart2 = after_vlen;
            Ok(ChildLayout { ty: ChildType::Owned(v[tstart2..tend2].to_vec()), vstart: vstart2, vlen: vlen as usize })
        }
        c => Err(WviewError::NotIndexable { typechar: c as char }),
    }
}

/// The allow-child policy (spec §4.7): what typechar a child at `child_index`
/// of a container typed `parent_t` may change into. Returns the parent's
/// own rebuilt type string when changing the child forces the parent's type
/// string to change too (only possible for a `t<N>...` parent).
fn check_child_type_change(parent_t: &[u8], child_index: usize, attempted: &[u8]) -> Result<Option<Vec<u8>>> {
    let deny = |c: char| WviewError::TypeChangeDenied { attempted: String::from_utf8_lossy(attempted).into_owned(), parent_typechar: c };
    if parent_t.is_empty() {
        return Ok(None);
    }
    match parent_t[0] {
        b'a' => Ok(None),
        b'o' => {
            if attempted == &parent_t[1..] {
                Ok(None)
            } else {
                Err(deny('o'))
            }
        }
        b'x' | b'X' => {
            let inner: &[u8] = if parent_t[0] == b'X' { b"" } else { &parent_t[1..] };
            if attempted == inner || attempted == b"e" {
                Ok(None)
            } else {
                Err(deny(parent_t[0] as char))
            }
        }
        b'l' => {
            let elem_type = &parent_t[1..];
            if attempted == elem_type {
                Ok(None)
            } else {
                Err(deny('l'))
            }
        }
        b'm' => {
            let key_tlen = type_len(parent_t, 1)?;
            let key_type = &parent_t[1..1 + key_tlen];
            let val_type = &parent_t[1 + key_tlen..];
            let expected = if child_index % 2 == 0 { key_type } else { val_type };
            if attempted == expected {
                Ok(None)
            } else {
                Err(deny('m'))
            }
        }
        b'e' => {
            const FIELD_TYPES: [&[u8]; 4] = [b"s", b"s", b"s", b"a"];
            if child_index >= 4 {
                return Err(WviewError::IndexOutOfRange { index: child_index, len: 4 });
            }
            if attempted == FIELD_TYPES[child_index] {
                Ok(None)
            } else {
                Err(deny('e'))
            }
        }
        b't' => {
            if attempted.is_empty() {
                return Err(deny('t'));
            }
            let (arity, tcur0) = parse_tuple_arity(parent_t, 0)?;
            if child_index >= arity {
                return Err(WviewError::IndexOutOfRange { index: child_index, len: arity });
            }
            let mut tcur = tcur0;
            let mut field_start = 0;
            let mut field_len = 0;
            for idx in 0..arity {
                let flen = type_len(parent_t, tcur)?;
                if idx == child_index {
                    field_start = tcur;
                    field_len = flen;
                }
                tcur += flen;
            }
            let mut new_parent_type = Vec::with_capacity(parent_t.len() - field_len + attempted.len());
            new_parent_type.extend_from_slice(&parent_t[..field_start]);
            new_parent_type.extend_from_slice(attempted);
            new_parent_type.extend_from_slice(&parent_t[field_start + field_len..]);
            Ok(Some(new_parent_type))
        }
        c => Err(deny(c as char)),
    }
}

/// Debug-only sanity check that a node's own `(type, value)` chunk runs
/// still describe a well-formed `(T, V)` pair: the type string parses fully
/// and the value bytes scan against it to completion. Never run in release
/// builds (grounded on the original's `check_internal_invariants` in
/// `wany.h`, which is likewise compiled out outside debug builds); a
/// failure here means a bug in this module's splicing, not bad input, so it
/// panics rather than returning a `Result`.
fn debug_assert_invariants(node: &Node) {
    if !cfg!(debug_assertions) {
        return;
    }
    let t = flatten(&node.tchunks);
    let v = flatten(&node.vchunks);
    let type_str = match std::str::from_utf8(&t) {
        Ok(s) => s,
        Err(_) => panic!("wview node invariant violated: type bytes are not utf-8"),
    };
    match scan::scan(type_str, &v, false) {
        Ok((tconsumed, vconsumed)) => {
            assert_eq!(tconsumed, t.len(), "wview node invariant violated: trailing type bytes");
            assert_eq!(vconsumed, v.len(), "wview node invariant violated: trailing value bytes");
        }
        Err(e) => panic!("wview node invariant violated: {e:?}"),
    }
}

/// Writes `new_tchunks`/`new_vchunks` into `node_rc`, disowning its
/// memoized children, then splices the change into the parent (and so on,
/// up to the root). Handles the `a`-envelope length-header rewrite (spec
/// §4.8) as a special case since an `a` node's one child lives inside its
/// own value bytes rather than as a type-run substring.
fn commit_and_propagate(node_rc: Rc<RefCell<Node>>, new_tchunks: Vec<Chunk>, new_vchunks: Vec<Chunk>) -> Result<()> {
    let old_type_bytes = flatten(&node_rc.borrow().tchunks);

    {
        let mut n = node_rc.borrow_mut();
        n.tchunks = new_tchunks.clone();
        n.vchunks = new_vchunks.clone();
        n.children.clear();
        debug_assert_invariants(&n);
    }

    let (parent_opt, index) = {
        let n = node_rc.borrow();
        (n.parent.as_ref().and_then(|w| w.upgrade()), n.index_in_parent)
    };
    let (parent_rc, idx) = match (parent_opt, index) {
        (Some(p), Some(i)) => (p, i),
        _ => return Ok(()),
    };

    let new_type_bytes = flatten(&new_tchunks);
    let new_value_bytes = flatten(&new_vchunks);

    let slot = {
        let mut p = parent_rc.borrow_mut();
        let pos = p.children.iter().position(|c| c.index == idx);
        let bounds = pos.map(|p2| p.children[p2].bounds);
        p.children.retain(|c| c.index < idx);
        bounds
    };
    let Some(bounds) = slot else { return Ok(()) };

    let parent_type_before = flatten(&parent_rc.borrow().tchunks);
    let type_changed = old_type_bytes != new_type_bytes;

    let is_a_parent = parent_type_before.first() == Some(&b'a');
    let tuple_type_changed = parent_type_before.first() == Some(&b't') && type_changed;

    let (parent_new_tchunks, parent_new_vchunks) = if is_a_parent {
        let mut v = Vec::with_capacity(8 + new_type_bytes.len() + new_value_bytes.len());
        v.extend_from_slice(&(new_type_bytes.len() as u32).to_le_bytes());
        v.extend_from_slice(&new_type_bytes);
        v.extend_from_slice(&(new_value_bytes.len() as u32).to_le_bytes());
        v.extend_from_slice(&new_value_bytes);
        (parent_rc.borrow().tchunks.clone(), vec![owned_chunk(v)])
    } else {
        let mut new_vc = splice(&parent_rc.borrow().vchunks, bounds.vstart, bounds.vlen, new_vchunks);
        // A child of an `x`/`X` parent may switch between holding a real
        // value and holding an error record (spec §4.7's allow-child table:
        // "e or original T"); that switch is encoded as the has-value flag
        // byte just before the child's own chunk range, which the plain
        // splice above never touches.
        if matches!(parent_type_before.first(), Some(b'x') | Some(b'X')) && bounds.vstart > 0 {
            let new_flag = if new_type_bytes == b"e" { 0u8 } else { 1u8 };
            new_vc = splice(&new_vc, bounds.vstart - 1, 1, vec![owned_chunk(vec![new_flag])]);
        }
        let new_tc = if tuple_type_changed {
            splice(&parent_rc.borrow().tchunks, bounds.tstart, bounds.tlen, new_tchunks)
        } else {
            parent_rc.borrow().tchunks.clone()
        };
        (new_tc, new_vc)
    };

    // An in-place splice never moves `bounds.vstart`/`bounds.tstart`, only
    // the length of the window they bound, so the edited child's own slot
    // can be reseated here with its new lengths rather than forcing a
    // reparse on the next `child(idx)` lookup. This must happen after the
    // recursive call below, since that call's own `children.clear()` would
    // otherwise wipe out whatever we insert here.
    let reseated_bounds = if is_a_parent {
        SlotBounds { tstart: 0, tlen: 0, vstart: 8 + new_type_bytes.len(), vlen: new_value_bytes.len() }
    } else {
        SlotBounds {
            tstart: bounds.tstart,
            tlen: if tuple_type_changed { new_type_bytes.len() } else { bounds.tlen },
            vstart: bounds.vstart,
            vlen: new_value_bytes.len(),
        }
    };

    commit_and_propagate(parent_rc.clone(), parent_new_tchunks, parent_new_vchunks)?;

    {
        let mut p = parent_rc.borrow_mut();
        let pos = p.children.partition_point(|c| c.index < idx);
        p.children.insert(pos, ChildSlot { index: idx, node: node_rc, bounds: reseated_bounds });
    }
    Ok(())
}
