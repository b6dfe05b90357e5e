//! Persistent ordered map and set with structural sharing.
//!
//! The transaction store snapshots the entire database by cloning these
//! handles, so every operation is path-copying: `insert`/`remove` return a
//! new map and never touch the original. Cloning a map is O(1) (bumping the
//! root's refcount), which is what makes transaction fork O(1) regardless of
//! database size.
//!
//! Implemented as a treap. Priorities are derived from a fixed-seed hash of
//! the key, so the tree shape is a pure function of the key set and
//! iteration order is deterministic across runs.

use std::cmp::Ordering;
use std::hash::Hash;
use std::ops::Bound;
use std::sync::Arc;

use ahash::RandomState;

/// Fixed seeds: tree shape must not vary between processes, otherwise two
/// runs of the same statements could enumerate rows in different orders.
const PRIORITY_SEEDS: (u64, u64, u64, u64) = (0x9e37, 0x79b9, 0x7f4a, 0x7c15);

fn priority<K: Hash>(key: &K) -> u64 {
    use std::hash::BuildHasher;
    let state = RandomState::with_seeds(
        PRIORITY_SEEDS.0,
        PRIORITY_SEEDS.1,
        PRIORITY_SEEDS.2,
        PRIORITY_SEEDS.3,
    );
    state.hash_one(key)
}

#[derive(Debug)]
struct Node<K, V> {
    key: K,
    value: V,
    priority: u64,
    left: Link<K, V>,
    right: Link<K, V>,
}

type Link<K, V> = Option<Arc<Node<K, V>>>;

/// Persistent ordered map.
#[derive(Debug)]
pub struct PMap<K, V> {
    root: Link<K, V>,
    len: usize,
}

impl<K, V> Clone for PMap<K, V> {
    fn clone(&self) -> Self {
        PMap {
            root: self.root.clone(),
            len: self.len,
        }
    }
}

impl<K, V> Default for PMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> PMap<K, V> {
    pub const fn new() -> Self {
        PMap { root: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True if both maps share the same root node.
    ///
    /// This is the identity test the transaction store uses for conflict
    /// detection: a diverged parent necessarily has a different root.
    pub fn same_root(&self, other: &Self) -> bool {
        match (&self.root, &other.root) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl<K, V> PMap<K, V>
where
    K: Ord + Hash + Clone,
    V: Clone,
{
    pub fn get(&self, key: &K) -> Option<&V> {
        let mut node = self.root.as_deref();
        while let Some(n) = node {
            match key.cmp(&n.key) {
                Ordering::Less => node = n.left.as_deref(),
                Ordering::Greater => node = n.right.as_deref(),
                Ordering::Equal => return Some(&n.value),
            }
        }
        None
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Insert, returning the new map. Replaces the value if the key already
    /// exists.
    pub fn insert(&self, key: K, value: V) -> Self {
        let prio = priority(&key);
        let (root, added) = insert_node(&self.root, key, value, prio);
        PMap {
            root: Some(root),
            len: if added { self.len + 1 } else { self.len },
        }
    }

    /// Remove, returning the new map. Returns self unchanged (same root) if
    /// the key is absent.
    pub fn remove(&self, key: &K) -> Self {
        let (root, removed) = remove_node(&self.root, key);
        if !removed {
            return self.clone();
        }
        PMap {
            root,
            len: self.len - 1,
        }
    }

    /// In-order (key order) iteration.
    pub fn iter(&self) -> PMapIter<'_, K, V> {
        PMapIter::new(&self.root, Bound::Unbounded, Bound::Unbounded)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, v)| v)
    }

    /// Key-ordered iteration restricted to the given bounds.
    pub fn range<'a>(&'a self, lo: Bound<&'a K>, hi: Bound<&'a K>) -> PMapIter<'a, K, V> {
        PMapIter::new(&self.root, lo, hi)
    }

    pub fn first(&self) -> Option<(&K, &V)> {
        let mut node = self.root.as_deref()?;
        while let Some(left) = node.left.as_deref() {
            node = left;
        }
        Some((&node.key, &node.value))
    }
}

fn make<K, V>(key: K, value: V, priority: u64, left: Link<K, V>, right: Link<K, V>) -> Arc<Node<K, V>> {
    Arc::new(Node {
        key,
        value,
        priority,
        left,
        right,
    })
}

fn insert_node<K, V>(link: &Link<K, V>, key: K, value: V, prio: u64) -> (Arc<Node<K, V>>, bool)
where
    K: Ord + Clone,
    V: Clone,
{
    let node = match link {
        None => return (make(key, value, prio, None, None), true),
        Some(node) => node,
    };

    match key.cmp(&node.key) {
        Ordering::Equal => (
            make(
                key,
                value,
                node.priority,
                node.left.clone(),
                node.right.clone(),
            ),
            false,
        ),
        Ordering::Less => {
            let (left, added) = insert_node(&node.left, key, value, prio);
            if left.priority > node.priority {
                // Rotate right to restore the heap property.
                let new_right = make(
                    node.key.clone(),
                    node.value.clone(),
                    node.priority,
                    left.right.clone(),
                    node.right.clone(),
                );
                (
                    make(
                        left.key.clone(),
                        left.value.clone(),
                        left.priority,
                        left.left.clone(),
                        Some(new_right),
                    ),
                    added,
                )
            } else {
                (
                    make(
                        node.key.clone(),
                        node.value.clone(),
                        node.priority,
                        Some(left),
                        node.right.clone(),
                    ),
                    added,
                )
            }
        }
        Ordering::Greater => {
            let (right, added) = insert_node(&node.right, key, value, prio);
            if right.priority > node.priority {
                // Rotate left.
                let new_left = make(
                    node.key.clone(),
                    node.value.clone(),
                    node.priority,
                    node.left.clone(),
                    right.left.clone(),
                );
                (
                    make(
                        right.key.clone(),
                        right.value.clone(),
                        right.priority,
                        Some(new_left),
                        right.right.clone(),
                    ),
                    added,
                )
            } else {
                (
                    make(
                        node.key.clone(),
                        node.value.clone(),
                        node.priority,
                        node.left.clone(),
                        Some(right),
                    ),
                    added,
                )
            }
        }
    }
}

fn remove_node<K, V>(link: &Link<K, V>, key: &K) -> (Link<K, V>, bool)
where
    K: Ord + Clone,
    V: Clone,
{
    let node = match link {
        None => return (None, false),
        Some(node) => node,
    };

    match key.cmp(&node.key) {
        Ordering::Equal => (merge(&node.left, &node.right), true),
        Ordering::Less => {
            let (left, removed) = remove_node(&node.left, key);
            if !removed {
                return (link.clone(), false);
            }
            (
                Some(make(
                    node.key.clone(),
                    node.value.clone(),
                    node.priority,
                    left,
                    node.right.clone(),
                )),
                true,
            )
        }
        Ordering::Greater => {
            let (right, removed) = remove_node(&node.right, key);
            if !removed {
                return (link.clone(), false);
            }
            (
                Some(make(
                    node.key.clone(),
                    node.value.clone(),
                    node.priority,
                    node.left.clone(),
                    right,
                )),
                true,
            )
        }
    }
}

/// Merge two treaps where every key in `left` sorts before every key in
/// `right`.
fn merge<K, V>(left: &Link<K, V>, right: &Link<K, V>) -> Link<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    match (left, right) {
        (None, r) => r.clone(),
        (l, None) => l.clone(),
        (Some(l), Some(r)) => {
            if l.priority > r.priority {
                Some(make(
                    l.key.clone(),
                    l.value.clone(),
                    l.priority,
                    l.left.clone(),
                    merge(&l.right, right),
                ))
            } else {
                Some(make(
                    r.key.clone(),
                    r.value.clone(),
                    r.priority,
                    merge(left, &r.left),
                    r.right.clone(),
                ))
            }
        }
    }
}

/// In-order iterator over a bounded key range.
#[derive(Debug)]
pub struct PMapIter<'a, K, V> {
    stack: Vec<&'a Node<K, V>>,
    hi: Bound<&'a K>,
}

impl<'a, K: Ord, V> PMapIter<'a, K, V> {
    fn new(root: &'a Link<K, V>, lo: Bound<&'a K>, hi: Bound<&'a K>) -> Self {
        let mut iter = PMapIter {
            stack: Vec::new(),
            hi,
        };
        iter.push_left(root.as_deref(), &lo);
        iter
    }

    /// Descend the left spine, skipping subtrees entirely below the lower
    /// bound.
    fn push_left(&mut self, mut node: Option<&'a Node<K, V>>, lo: &Bound<&'a K>) {
        while let Some(n) = node {
            let in_range = match lo {
                Bound::Unbounded => true,
                Bound::Included(lo) => n.key >= **lo,
                Bound::Excluded(lo) => n.key > **lo,
            };
            if in_range {
                self.stack.push(n);
                node = n.left.as_deref();
            } else {
                node = n.right.as_deref();
            }
        }
    }
}

impl<'a, K: Ord, V> Iterator for PMapIter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        // Right subtree next; lower bound already satisfied by in-order
        // position.
        let mut child = node.right.as_deref();
        while let Some(n) = child {
            self.stack.push(n);
            child = n.left.as_deref();
        }

        let within = match self.hi {
            Bound::Unbounded => true,
            Bound::Included(hi) => node.key <= *hi,
            Bound::Excluded(hi) => node.key < *hi,
        };
        if !within {
            self.stack.clear();
            return None;
        }
        Some((&node.key, &node.value))
    }
}

/// In-order iterator that owns its path via `Arc`s, so it is not tied to
/// the lifetime of any map handle. Used for lazy enumeration that must
/// outlive the borrow of a transaction snapshot.
#[derive(Debug)]
pub struct PMapOwnedIter<K, V> {
    stack: Vec<Arc<Node<K, V>>>,
    hi: Bound<K>,
}

impl<K, V> PMapOwnedIter<K, V>
where
    K: Ord + Clone,
{
    fn new(root: Link<K, V>, lo: Bound<K>, hi: Bound<K>) -> Self {
        let mut iter = PMapOwnedIter {
            stack: Vec::new(),
            hi,
        };
        iter.push_left(root, &lo);
        iter
    }

    fn push_left(&mut self, mut link: Link<K, V>, lo: &Bound<K>) {
        while let Some(node) = link {
            let in_range = match lo {
                Bound::Unbounded => true,
                Bound::Included(lo) => node.key >= *lo,
                Bound::Excluded(lo) => node.key > *lo,
            };
            if in_range {
                link = node.left.clone();
                self.stack.push(node);
            } else {
                link = node.right.clone();
            }
        }
    }
}

impl<K, V> Iterator for PMapOwnedIter<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        let mut child = node.right.clone();
        while let Some(n) = child {
            child = n.left.clone();
            self.stack.push(n);
        }

        let within = match &self.hi {
            Bound::Unbounded => true,
            Bound::Included(hi) => node.key <= *hi,
            Bound::Excluded(hi) => node.key < *hi,
        };
        if !within {
            self.stack.clear();
            return None;
        }
        Some((node.key.clone(), node.value.clone()))
    }
}

impl<K, V> PMap<K, V>
where
    K: Ord + Hash + Clone,
    V: Clone,
{
    /// Owning in-order iterator over the full key range.
    pub fn iter_owned(&self) -> PMapOwnedIter<K, V> {
        PMapOwnedIter::new(self.root.clone(), Bound::Unbounded, Bound::Unbounded)
    }

    /// Owning in-order iterator over a bounded key range.
    pub fn range_owned(&self, lo: Bound<K>, hi: Bound<K>) -> PMapOwnedIter<K, V> {
        PMapOwnedIter::new(self.root.clone(), lo, hi)
    }
}

/// Persistent ordered set, a thin wrapper over [`PMap`].
#[derive(Debug)]
pub struct PSet<K> {
    map: PMap<K, ()>,
}

impl<K> Clone for PSet<K> {
    fn clone(&self) -> Self {
        PSet {
            map: self.map.clone(),
        }
    }
}

impl<K> Default for PSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> PSet<K> {
    pub const fn new() -> Self {
        PSet { map: PMap::new() }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn same_root(&self, other: &Self) -> bool {
        self.map.same_root(&other.map)
    }
}

impl<K> PSet<K>
where
    K: Ord + Hash + Clone,
{
    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn insert(&self, key: K) -> Self {
        PSet {
            map: self.map.insert(key, ()),
        }
    }

    pub fn remove(&self, key: &K) -> Self {
        PSet {
            map: self.map.remove(key),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &K> {
        self.map.keys()
    }

    /// Owning iterator over members, detached from this handle's lifetime.
    pub fn iter_owned(&self) -> impl Iterator<Item = K> + use<K> {
        self.map.iter_owned().map(|(k, _)| k)
    }

    pub fn first(&self) -> Option<&K> {
        self.map.first().map(|(k, _)| k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let m0: PMap<i32, &str> = PMap::new();
        let m1 = m0.insert(2, "b").insert(1, "a").insert(3, "c");
        assert_eq!(3, m1.len());
        assert_eq!(Some(&"b"), m1.get(&2));
        assert_eq!(None, m0.get(&2));

        let m2 = m1.remove(&2);
        assert_eq!(2, m2.len());
        assert_eq!(None, m2.get(&2));
        // Original untouched.
        assert_eq!(Some(&"b"), m1.get(&2));
    }

    #[test]
    fn replace_keeps_len() {
        let m = PMap::new().insert(1, "a").insert(1, "b");
        assert_eq!(1, m.len());
        assert_eq!(Some(&"b"), m.get(&1));
    }

    #[test]
    fn remove_absent_shares_root() {
        let m = PMap::new().insert(1, "a");
        let same = m.remove(&9);
        assert!(m.same_root(&same));
    }

    #[test]
    fn iter_is_key_ordered() {
        let mut m = PMap::new();
        for k in [5, 1, 9, 3, 7, 2, 8] {
            m = m.insert(k, k * 10);
        }
        let keys: Vec<i32> = m.keys().copied().collect();
        assert_eq!(vec![1, 2, 3, 5, 7, 8, 9], keys);
    }

    #[test]
    fn range_bounds() {
        let mut m = PMap::new();
        for k in 0..20 {
            m = m.insert(k, ());
        }
        let keys: Vec<i32> = m
            .range(Bound::Excluded(&4), Bound::Included(&8))
            .map(|(k, _)| *k)
            .collect();
        assert_eq!(vec![5, 6, 7, 8], keys);

        let keys: Vec<i32> = m
            .range(Bound::Included(&17), Bound::Unbounded)
            .map(|(k, _)| *k)
            .collect();
        assert_eq!(vec![17, 18, 19], keys);
    }

    #[test]
    fn same_root_detects_divergence() {
        let base = PMap::new().insert(1, "a");
        let copy = base.clone();
        assert!(base.same_root(&copy));

        let diverged = base.insert(2, "b");
        assert!(!base.same_root(&diverged));
    }

    #[test]
    fn structural_sharing_is_cheap() {
        let mut m = PMap::new();
        for k in 0..1000 {
            m = m.insert(k, k);
        }
        let snapshot = m.clone();
        let mutated = m.insert(500, -1);
        // Snapshot still sees the old value.
        assert_eq!(Some(&500), snapshot.get(&500));
        assert_eq!(Some(&-1), mutated.get(&500));
    }

    #[test]
    fn owned_iter_outlives_handle() {
        let mut m = PMap::new();
        for k in [3, 1, 2] {
            m = m.insert(k, k * 10);
        }
        let iter = m.iter_owned();
        drop(m);
        let pairs: Vec<(i32, i32)> = iter.collect();
        assert_eq!(vec![(1, 10), (2, 20), (3, 30)], pairs);
    }

    #[test]
    fn owned_range_respects_bounds() {
        let mut m = PMap::new();
        for k in 0..10 {
            m = m.insert(k, ());
        }
        let keys: Vec<i32> = m
            .range_owned(Bound::Included(3), Bound::Excluded(6))
            .map(|(k, _)| k)
            .collect();
        assert_eq!(vec![3, 4, 5], keys);
    }

    #[test]
    fn set_basics() {
        let s = PSet::new().insert("a").insert("b");
        assert!(s.contains(&"a"));
        assert!(!s.contains(&"c"));
        assert_eq!(2, s.len());
        assert_eq!(Some(&"a"), s.first());
    }

    #[test]
    fn owned_set_iterator_outlives_handle() {
        let iter = {
            let s = PSet::new().insert(2).insert(1).insert(3);
            s.iter_owned()
        };
        assert_eq!(vec![1, 2, 3], iter.collect::<Vec<i32>>());
    }
}
