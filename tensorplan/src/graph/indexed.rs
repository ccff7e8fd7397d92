//! Container types with strongly-typed indexes

/// Conversion between an index type and a raw `usize`
pub(crate) trait Index {
    fn new(i: usize) -> Self;
    fn get(&self) -> usize;
}

/// A `Vec<Option<V>>` with strongly-typed indexes and removal
///
/// Slots are never reused, so a handle to a removed value stays invalid
/// forever (rather than silently aliasing a newer value).  Lookups with
/// [`get`](IndexSlab::get) return `None` for removed values; the `Index`
/// operator panics, and is reserved for handles which are known to be live.
#[derive(Clone, Debug)]
pub(crate) struct IndexSlab<V, I> {
    data: Vec<Option<V>>,
    live: usize,
    _phantom: std::marker::PhantomData<fn() -> I>,
}

impl<V, I> Default for IndexSlab<V, I> {
    fn default() -> Self {
        Self {
            data: vec![],
            live: 0,
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<V, I: Index + Copy> IndexSlab<V, I> {
    /// Returns the number of live values
    pub fn len(&self) -> usize {
        self.live
    }

    /// Stores a value, returning a fresh handle
    pub fn insert(&mut self, v: V) -> I {
        let i = I::new(self.data.len());
        self.data.push(Some(v));
        self.live += 1;
        i
    }

    pub fn get(&self, i: I) -> Option<&V> {
        self.data.get(i.get()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, i: I) -> Option<&mut V> {
        self.data.get_mut(i.get()).and_then(Option::as_mut)
    }

    pub fn contains(&self, i: I) -> bool {
        self.get(i).is_some()
    }

    /// Removes a value, returning it if it was live
    pub fn remove(&mut self, i: I) -> Option<V> {
        let out = self.data.get_mut(i.get()).and_then(Option::take);
        if out.is_some() {
            self.live -= 1;
        }
        out
    }
}

impl<V, I: Index + std::fmt::Debug> std::ops::Index<I> for IndexSlab<V, I> {
    type Output = V;
    fn index(&self, i: I) -> &V {
        match self.data.get(i.get()) {
            Some(Some(v)) => v,
            _ => panic!("stale handle {i:?}"),
        }
    }
}

impl<V, I: Index + std::fmt::Debug> std::ops::IndexMut<I> for IndexSlab<V, I> {
    fn index_mut(&mut self, i: I) -> &mut V {
        match self.data.get_mut(i.get()) {
            Some(Some(v)) => v,
            _ => panic!("stale handle {i:?}"),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Defines an index type suitable for use in an [`IndexSlab`].
macro_rules! define_index {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(
            Copy, Clone, Default, Debug, Eq, PartialEq, Hash, Ord, PartialOrd,
        )]
        pub struct $name(usize);
        impl crate::graph::indexed::Index for $name {
            fn new(i: usize) -> Self {
                Self(i)
            }
            fn get(&self) -> usize {
                self.0
            }
        }
    };
}
pub(crate) use define_index;

#[cfg(test)]
mod test {
    use super::*;

    define_index!(Slot, "Test index");

    #[test]
    fn test_remove_does_not_reuse() {
        let mut s: IndexSlab<&str, Slot> = IndexSlab::default();
        let a = s.insert("a");
        let b = s.insert("b");
        assert_eq!(s.len(), 2);
        assert_eq!(s.remove(a), Some("a"));
        assert_eq!(s.remove(a), None);
        assert_eq!(s.len(), 1);

        let c = s.insert("c");
        assert_ne!(a, c);
        assert!(s.get(a).is_none());
        assert_eq!(s[b], "b");
        assert_eq!(s[c], "c");
        assert!(s.contains(c));
    }

    #[test]
    #[should_panic(expected = "stale handle")]
    fn test_stale_index() {
        let mut s: IndexSlab<u32, Slot> = IndexSlab::default();
        let a = s.insert(1);
        s.remove(a);
        let _ = s[a];
    }
}
