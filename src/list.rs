//! Index-based doubly-linked lists.
//!
//! Entries live in an arena owned by someone else (a slice of descriptors); the list only
//! keeps head/tail indices while every entry carries a [`Link`] recording its neighbours and
//! which list it is on. An entry can be on at most one list at a time; inserting a linked
//! entry or unlinking it from the wrong list is a corrupted-state condition and panics.

/// Per-entry link. `K` names the list the entry is currently on.
#[derive(Debug, Clone, Copy)]
pub struct Link<K> {
    prev: Option<usize>,
    next: Option<usize>,
    owner: Option<K>,
}

impl<K> Default for Link<K> {
    fn default() -> Self {
        Self {
            prev: None,
            next: None,
            owner: None,
        }
    }
}

impl<K: Copy + Eq> Link<K> {
    /// The list this entry is on, if any.
    pub fn owner(&self) -> Option<K> {
        self.owner
    }

    /// Whether this entry is on some list.
    pub fn is_linked(&self) -> bool {
        self.owner.is_some()
    }
}

/// Access to the links of an arena.
pub trait LinkStore<K> {
    /// Returns the link of entry `idx`.
    fn link(&self, idx: usize) -> &Link<K>;
    /// Returns the link of entry `idx` mutably.
    fn link_mut(&mut self, idx: usize) -> &mut Link<K>;
}

/// A FIFO list of arena indices.
#[derive(Debug, Clone, Copy)]
pub struct IndexList<K> {
    tag: K,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<K: Copy + Eq + core::fmt::Debug> IndexList<K> {
    /// Create an empty list identified by `tag`.
    pub const fn new(tag: K) -> Self {
        Self {
            tag,
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn tag(&self) -> K {
        self.tag
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn front(&self) -> Option<usize> {
        self.head
    }

    /// Whether `idx` is on this list.
    pub fn contains<S: LinkStore<K>>(&self, store: &S, idx: usize) -> bool {
        store.link(idx).owner == Some(self.tag)
    }

    /// Append `idx` at the tail.
    pub fn push_back<S: LinkStore<K>>(&mut self, store: &mut S, idx: usize) {
        let link = store.link_mut(idx);
        if let Some(owner) = link.owner {
            panic!(
                "entry {} already on list {:?} while adding to {:?}",
                idx, owner, self.tag
            );
        }
        link.owner = Some(self.tag);
        link.prev = self.tail;
        link.next = None;
        match self.tail {
            Some(tail) => store.link_mut(tail).next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
    }

    /// Unlink `idx` from this list.
    pub fn remove<S: LinkStore<K>>(&mut self, store: &mut S, idx: usize) {
        let link = *store.link(idx);
        if link.owner != Some(self.tag) {
            panic!(
                "entry {} is on list {:?}, not {:?}",
                idx, link.owner, self.tag
            );
        }
        match link.prev {
            Some(prev) => store.link_mut(prev).next = link.next,
            None => self.head = link.next,
        }
        match link.next {
            Some(next) => store.link_mut(next).prev = link.prev,
            None => self.tail = link.prev,
        }
        *store.link_mut(idx) = Link::default();
        self.len -= 1;
    }

    /// Remove and return the head.
    pub fn pop_front<S: LinkStore<K>>(&mut self, store: &mut S) -> Option<usize> {
        let head = self.head?;
        self.remove(store, head);
        Some(head)
    }

    /// Snapshot of the entries in list order.
    ///
    /// Callers that relink entries while walking the list iterate over this copy.
    pub fn to_vec<S: LinkStore<K>>(&self, store: &S) -> alloc::vec::Vec<usize> {
        let mut out = alloc::vec::Vec::with_capacity(self.len);
        let mut cur = self.head;
        while let Some(idx) = cur {
            out.push(idx);
            cur = store.link(idx).next;
        }
        out
    }
}
