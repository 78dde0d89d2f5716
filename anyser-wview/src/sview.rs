//! Copy-on-write byte storage (spec §3.5, §3.6, §5, §9 design note).
//!
//! An [`Sview`] owns a byte buffer, either freshly allocated ([`Sview::new_writable`])
//! or handed in from elsewhere ([`Sview::new_owned`]). Once more than one
//! [`Chunk`](crate::chunk::Chunk) has ever pointed at the
//! same `Sview`, it freezes permanently: further writes first clone the
//! bytes into a fresh, unshared `Sview` rather than mutate in place. This
//! mirrors the teacher's `Heap` (`submerge-coldb/src/heap.rs`) in spirit —
//! a plain `Vec<u8>` behind a cheap handle — generalized to add the
//! freeze-on-share rule the wview's amortized-copy invariant needs.
//!
//! The handle is `Arc`-refcounted (spec §5: "sviews are refcounted
//! (atomic)") so that two disjoint `Sview`s can be dropped from different
//! threads without a data race on the strong count; the `Wview` tree built
//! on top stays `Rc`-based and single-threaded (spec §3.5 only requires
//! concurrency for disjoint wviews sharing backing bytes, not for editing
//! one tree from multiple threads at once — see DESIGN.md).

use std::cell::{Cell, RefCell};
use std::sync::Arc;

#[derive(Debug)]
enum Storage {
    /// Possibly shared, read-only bytes.
    Owned(Arc<[u8]>),
    /// Exclusively owned by this `Sview`; safe to mutate in place.
    Writable(Vec<u8>),
}

/// The storage behind one or more chunks. Reference-counted via the `Arc`
/// wrapper callers hold ([`SviewHandle`]); `frozen` latches the first time
/// that `Arc`'s strong count is observed to exceed one, per spec §3.5:
/// "Once an sview's refcount has exceeded 1, it is frozen read-only
/// forever, even if the refcount drops back to 1."
#[derive(Debug)]
pub(crate) struct Sview {
    storage: RefCell<Storage>,
    frozen: Cell<bool>,
}

pub(crate) type SviewHandle = Arc<Sview>;

impl Sview {
    pub(crate) fn new_writable(bytes: Vec<u8>) -> SviewHandle {
        Arc::new(Sview { storage: RefCell::new(Storage::Writable(bytes)), frozen: Cell::new(false) })
    }

    pub(crate) fn new_owned(bytes: Vec<u8>) -> SviewHandle {
        Arc::new(Sview { storage: RefCell::new(Storage::Owned(Arc::from(bytes))), frozen: Cell::new(false) })
    }

    pub(crate) fn len(&self) -> usize {
        match &*self.storage.borrow() {
            Storage::Owned(a) => a.len(),
            Storage::Writable(v) => v.len(),
        }
    }

    pub(crate) fn bytes(&self, range: std::ops::Range<usize>) -> Vec<u8> {
        match &*self.storage.borrow() {
            Storage::Owned(a) => a[range].to_vec(),
            Storage::Writable(v) => v[range].to_vec(),
        }
    }

    /// Called whenever a new chunk is about to alias `handle`'s storage
    /// (i.e. whenever a chunk is cloned rather than freshly created).
    /// Observes the handle's current strong count and latches `frozen` the
    /// first time it sees more than one owner.
    pub(crate) fn note_shared(handle: &SviewHandle) {
        if Arc::strong_count(handle) > 1 {
            handle.frozen.set(true);
        }
    }

    fn is_writable(&self) -> bool {
        !self.frozen.get() && matches!(&*self.storage.borrow(), Storage::Writable(_))
    }

    /// Returns a handle guaranteed safe to mutate in place: `handle` itself
    /// if it is writable and unshared, otherwise a fresh clone of
    /// `range`'s bytes (spec §3.6/§9: "Writable mutation first clones").
    pub(crate) fn unshare_for_write(handle: &SviewHandle, range: std::ops::Range<usize>) -> (SviewHandle, usize) {
        if handle.is_writable() && Arc::strong_count(handle) == 1 {
            return (handle.clone(), 0);
        }
        let bytes = handle.bytes(range);
        (Sview::new_writable(bytes), 0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn test_fresh_sview_is_writable() {
        let s = Sview::new_writable(vec![1, 2, 3]);
        assert!(s.is_writable());
    }

    #[test]
    fn test_sharing_freezes_permanently() {
        let s = Sview::new_writable(vec![1, 2, 3]);
        let s2 = s.clone();
        Sview::note_shared(&s);
        assert!(!s.is_writable());
        drop(s2);
        // Refcount dropped back to 1, but it stays frozen.
        assert!(!s.is_writable());
    }

    #[test]
    fn test_unshare_clones_when_frozen() {
        let s = Sview::new_writable(vec![1, 2, 3, 4]);
        let _s2 = s.clone();
        Sview::note_shared(&s);
        let (fresh, _) = Sview::unshare_for_write(&s, 0..s.len());
        assert!(!Arc::ptr_eq(&s, &fresh));
        assert!(fresh.is_writable());
    }
}
