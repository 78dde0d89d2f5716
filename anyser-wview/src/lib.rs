//! A chunked, copy-on-write tree overlay over one serialized `(T, V)` blob
//! (spec §3.5–§3.6, §4.7–§4.9): index into lists, maps, tuples, `any`s,
//! `optional`s and `expected`s without reparsing the whole buffer each
//! time, and mutate in place without disturbing sibling views that still
//! point at the unshared parts of the original bytes.

mod chunk;
mod error;
mod node;
mod sview;

pub use error::{Result, WviewError};
pub use node::{HostScalar, Wview};

#[cfg(test)]
mod test {
    use super::*;
    use anyser_core::{codec, AnyOwned, ConvertPolicy};
    use test_log::test;

    fn encode_list_i32(items: &[i32]) -> Vec<u8> {
        let mut v = (items.len() as u32).to_le_bytes().to_vec();
        for it in items {
            v.extend_from_slice(&it.to_le_bytes());
        }
        v
    }

    #[test]
    fn test_scalar_roundtrip() {
        let w = Wview::new("i", &7i32.to_le_bytes());
        assert_eq!(w.typechar(), Some(b'i'));
        assert_eq!(w.get_as::<i32>(ConvertPolicy::NONE).unwrap(), 7);
    }

    #[test]
    fn test_list_children_and_size() {
        let v = encode_list_i32(&[10, 20, 30]);
        let w = Wview::new("li", &v);
        assert_eq!(w.size(), Some(3));
        assert_eq!(w.child(1).unwrap().get_as::<i32>(ConvertPolicy::NONE).unwrap(), 20);
    }

    #[test]
    fn test_list_index_out_of_range() {
        let v = encode_list_i32(&[1]);
        let w = Wview::new("li", &v);
        assert!(w.child(5).is_err());
    }

    #[test]
    fn test_tuple_field_access_s1() {
        // (1, 2.5, true) as t3idb, the spec's S1 scenario.
        let mut v = 1i32.to_le_bytes().to_vec();
        v.extend_from_slice(&2.5f64.to_le_bytes());
        v.push(1);
        let w = Wview::new("t3idb", &v);
        assert_eq!(w.size(), Some(3));
        assert_eq!(w.child(0).unwrap().get_as::<i32>(ConvertPolicy::NONE).unwrap(), 1);
        assert_eq!(w.child(1).unwrap().get_as::<f64>(ConvertPolicy::NONE).unwrap(), 2.5);
        assert!(w.child(2).unwrap().get_as::<bool>(ConvertPolicy::NONE).unwrap());
    }

    #[test]
    fn test_set_list_element_wrong_type_denied() {
        let v = encode_list_i32(&[1, 2]);
        let w = Wview::new("li", &v);
        let elem = w.child(0).unwrap();
        let mut buf = Vec::new();
        codec::write_string(&mut codec::Sink::append(&mut buf), "x");
        assert!(elem.set(AnyOwned::new("s", buf)).is_err());
    }

    #[test]
    fn test_set_tuple_field_same_type() {
        let mut v = 1i32.to_le_bytes().to_vec();
        v.extend_from_slice(&2.5f64.to_le_bytes());
        v.push(1);
        let w = Wview::new("t3idb", &v);
        let field0 = w.child(0).unwrap();
        field0.set(AnyOwned::new("i", 99i32.to_le_bytes().to_vec())).unwrap();
        assert_eq!(w.child(0).unwrap().get_as::<i32>(ConvertPolicy::NONE).unwrap(), 99);
    }

    #[test]
    fn test_erase_and_insert_list() {
        let v = encode_list_i32(&[1, 2, 3]);
        let w = Wview::new("li", &v);
        w.erase(1).unwrap();
        assert_eq!(w.size(), Some(2));
        assert_eq!(w.child(1).unwrap().get_as::<i32>(ConvertPolicy::NONE).unwrap(), 3);
        w.insert_after(Some(0), AnyOwned::new("i", 42i32.to_le_bytes().to_vec())).unwrap();
        assert_eq!(w.size(), Some(3));
        assert_eq!(w.child(1).unwrap().get_as::<i32>(ConvertPolicy::NONE).unwrap(), 42);
    }

    #[test]
    fn test_any_envelope_header_updates_after_child_set() {
        let mut inner = Vec::new();
        codec::write_any(&mut codec::Sink::append(&mut inner), codec::AnyView::new("i", &7i32.to_le_bytes()));
        let w = Wview::new("a", &inner);
        let child = w.child(0).unwrap();
        assert_eq!(child.type_string(), "i");
        child.set(AnyOwned::new("s", {
            let mut buf = Vec::new();
            codec::write_string(&mut codec::Sink::append(&mut buf), "hello");
            buf
        })).unwrap();
        // The outer `a` node's own value bytes must now decode to a longer
        // inner type/value pair with correctly-updated length headers.
        let (inner_ty, after_ty) = codec::read_string_view(&w.value_bytes(), 0).unwrap();
        assert_eq!(inner_ty, "s");
        let (inner_val, _) = codec::read_len_prefixed_range(&w.value_bytes(), after_ty).unwrap();
        assert_eq!(inner_val.len(), codec::serialize_len_string("hello"));
    }

    #[test]
    fn test_linear_search_list() {
        let v = encode_list_i32(&[5, 6, 7]);
        let w = Wview::new("li", &v);
        let found = w.linear_search(&6i32.to_le_bytes(), 1).unwrap();
        assert_eq!(found, 1);
        assert!(w.linear_search(&99i32.to_le_bytes(), 1).is_none());
    }

    #[test]
    fn test_linear_search_tuple_list_prefix() {
        // A list of (i, s) records; search on just the leading `i` field.
        let mut v = 2u32.to_le_bytes().to_vec();
        let mut rec = |id: i32, name: &str| {
            let mut buf = id.to_le_bytes().to_vec();
            codec::write_string(&mut codec::Sink::append(&mut buf), name);
            buf
        };
        v.extend_from_slice(&rec(1, "alice"));
        v.extend_from_slice(&rec(2, "bob"));
        let w = Wview::new("lt2is", &v);
        let found = w.linear_search(&2i32.to_le_bytes(), 1).unwrap();
        assert_eq!(found, 1);
        assert!(w.linear_search(&9i32.to_le_bytes(), 1).is_none());
    }

    #[test]
    fn test_tuple_erase_and_insert_after() {
        let mut v = 1i32.to_le_bytes().to_vec();
        v.extend_from_slice(&2.5f64.to_le_bytes());
        v.push(1);
        let w = Wview::new("t3idb", &v);
        w.erase(1).unwrap();
        assert_eq!(w.type_string(), "t2ib");
        assert_eq!(w.size(), Some(2));
        assert!(w.child(1).unwrap().get_as::<bool>(ConvertPolicy::NONE).unwrap());
        w.insert_after(Some(0), AnyOwned::new("d", 9.5f64.to_le_bytes().to_vec())).unwrap();
        assert_eq!(w.type_string(), "t3idb");
        assert_eq!(w.size(), Some(3));
        assert_eq!(w.child(1).unwrap().get_as::<f64>(ConvertPolicy::NONE).unwrap(), 9.5);
    }

    #[test]
    fn test_tuple_erase_refuses_below_two() {
        let mut v = 1i32.to_le_bytes().to_vec();
        v.push(1);
        let w = Wview::new("t2ib", &v);
        assert!(w.erase(0).is_err());
    }

    #[test]
    fn test_swap_content_same_container() {
        let v = encode_list_i32(&[1, 2]);
        let w = Wview::new("li", &v);
        let a = w.child(0).unwrap();
        let b = w.child(1).unwrap();
        a.swap_content_with(&b).unwrap();
        assert_eq!(w.child(0).unwrap().get_as::<i32>(ConvertPolicy::NONE).unwrap(), 2);
        assert_eq!(w.child(1).unwrap().get_as::<i32>(ConvertPolicy::NONE).unwrap(), 1);
    }

    #[test]
    fn test_erase_optional_clears_has_value() {
        let mut v = vec![1u8];
        v.extend_from_slice(&7i32.to_le_bytes());
        let w = Wview::new("oi", &v);
        assert_eq!(w.size(), Some(1));
        w.erase(0).unwrap();
        assert_eq!(w.size(), Some(0));
        assert_eq!(w.value_bytes(), vec![0u8]);
        assert!(w.child(0).is_err());
    }

    #[test]
    fn test_swap_content_with_ancestor_denied() {
        let v = encode_list_i32(&[1, 2]);
        let w = Wview::new("li", &v);
        let child = w.child(0).unwrap();
        assert!(w.swap_content_with(&child).is_err());
        assert!(child.swap_content_with(&w).is_err());
    }

    #[test]
    fn test_expected_child_set_to_error_flips_has_value_flag() {
        let mut v = vec![1u8];
        v.extend_from_slice(&7i32.to_le_bytes());
        let w = Wview::new("xi", &v);
        let child = w.child(0).unwrap();
        assert_eq!(child.type_string(), "i");

        let mut err_bytes = Vec::new();
        {
            let mut sink = codec::Sink::append(&mut err_bytes);
            codec::write_string(&mut sink, "type_mismatch_error");
            codec::write_string(&mut sink, "");
            codec::write_string(&mut sink, "bad juju");
            codec::write_any(&mut sink, AnyOwned::void().as_view());
        }
        child.set(AnyOwned::new("e", err_bytes.clone())).unwrap();

        assert_eq!(w.type_string(), "xi");
        assert_eq!(w.value_bytes()[0], 0);
        let refetched = w.child(0).unwrap();
        assert_eq!(refetched.type_string(), "e");
        assert_eq!(refetched.value_bytes(), err_bytes);

        refetched.set(AnyOwned::new("i", 42i32.to_le_bytes().to_vec())).unwrap();
        assert_eq!(w.value_bytes()[0], 1);
        assert_eq!(w.child(0).unwrap().get_as::<i32>(ConvertPolicy::NONE).unwrap(), 42);
    }

    /// spec.md §8 property 7: the same sequence of edits produces the same
    /// flattened bytes whether applied incrementally to a wview or built up
    /// directly on a fresh blob.
    #[test]
    fn test_wview_equivalence_across_edit_sequence() {
        let w = Wview::new("li", &encode_list_i32(&[1, 2, 3]));
        w.erase(1).unwrap();
        w.insert_after(Some(0), AnyOwned::new("i", 99i32.to_le_bytes().to_vec())).unwrap();
        assert_eq!(w.value_bytes(), encode_list_i32(&[1, 99, 3]));
        assert_eq!(w.type_string(), "li");
    }

    /// A second `set()` on the same held child handle must still propagate
    /// to the parent, not just the first (regression: the parent used to
    /// evict the edited slot without reseating it, so a reused handle's
    /// second write never reached the parent's bytes).
    #[test]
    fn test_same_handle_reused_across_two_sets_both_propagate() {
        let v = encode_list_i32(&[1, 2, 3]);
        let w = Wview::new("li", &v);
        let elem = w.child(1).unwrap();
        elem.set(AnyOwned::new("i", 20i32.to_le_bytes().to_vec())).unwrap();
        assert_eq!(w.value_bytes(), encode_list_i32(&[1, 20, 3]));
        elem.set(AnyOwned::new("i", 30i32.to_le_bytes().to_vec())).unwrap();
        assert_eq!(w.value_bytes(), encode_list_i32(&[1, 30, 3]));
        assert_eq!(w.child(1).unwrap().get_as::<i32>(ConvertPolicy::NONE).unwrap(), 30);
    }

    /// spec.md §8 property 8: once a memoized child has been evicted by its
    /// parent's own mutation, further edits to that now-stale handle must
    /// not reach back into the parent's bytes.
    #[test]
    fn test_child_isolated_after_parent_set() {
        let v = encode_list_i32(&[1, 2]);
        let w = Wview::new("li", &v);
        let c = w.child(0).unwrap();
        w.set(AnyOwned::new("li", encode_list_i32(&[10, 20]))).unwrap();
        let before = w.value_bytes();
        let _ = c.set(AnyOwned::new("i", 999i32.to_le_bytes().to_vec()));
        assert_eq!(w.value_bytes(), before);
    }
}
