//! Fixed-capacity least-recently-used map.
//!
//! Entries live in a slab (`Vec<Option<Node>>`) and are chained oldest → newest through slab
//! indices, so `get`, `put`, `remove` and `pop_oldest` are all O(1) on top of the hash lookup.
//! The map never holds more than `capacity` entries: inserting a new key into a full map evicts
//! and returns the least recently touched entry.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

const NIL: usize = usize::MAX;

struct Node<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

pub struct BoundedLru<K, V> {
    index: HashMap<K, usize>,
    slab: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    /// Least recently used.
    head: usize,
    /// Most recently used.
    tail: usize,
    capacity: usize,
}

impl<K, V> BoundedLru<K, V>
where
    K: Hash + Eq + Clone,
{
    /// A capacity of zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);

        Self {
            index: HashMap::with_capacity(capacity.min(4096)),
            slab: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.contains_key(key)
    }

    /// Returns the value and marks the entry as most recently used.
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = *self.index.get(key)?;
        self.move_to_tail(idx);
        self.slab[idx].as_ref().map(|node| &node.value)
    }

    /// Returns the value without touching the recency order.
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = *self.index.get(key)?;
        self.slab[idx].as_ref().map(|node| &node.value)
    }

    /// Inserts or replaces `key`, making it the most recently used entry.
    ///
    /// Returns the entry evicted to make room, if any. Replacing an existing key never evicts.
    pub fn put(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&idx) = self.index.get(&key) {
            if let Some(node) = self.slab[idx].as_mut() {
                node.value = value;
            }
            self.move_to_tail(idx);
            return None;
        }

        let evicted = if self.index.len() >= self.capacity {
            self.pop_oldest()
        } else {
            None
        };

        let node = Node {
            key: key.clone(),
            value,
            prev: NIL,
            next: NIL,
        };

        let idx = match self.free.pop() {
            Some(idx) => {
                self.slab[idx] = Some(node);
                idx
            }
            None => {
                self.slab.push(Some(node));
                self.slab.len() - 1
            }
        };

        self.link_tail(idx);
        self.index.insert(key, idx);

        evicted
    }

    /// Removes and returns the least recently used entry.
    pub fn pop_oldest(&mut self) -> Option<(K, V)> {
        if self.head == NIL {
            return None;
        }

        let idx = self.head;
        self.unlink(idx);
        let node = self.slab[idx].take()?;
        self.free.push(idx);
        self.index.remove(&node.key);

        Some((node.key, node.value))
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.index.remove(key)?;
        self.unlink(idx);
        let node = self.slab[idx].take()?;
        self.free.push(idx);

        Some(node.value)
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.slab.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    /// Iterates from the least recently used entry to the most recently used one.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            lru: self,
            cursor: self.head,
        }
    }

    fn move_to_tail(&mut self, idx: usize) {
        if self.tail == idx {
            return;
        }

        self.unlink(idx);
        self.link_tail(idx);
    }

    fn link_tail(&mut self, idx: usize) {
        let old_tail = self.tail;

        if let Some(node) = self.slab[idx].as_mut() {
            node.prev = old_tail;
            node.next = NIL;
        }

        if old_tail == NIL {
            self.head = idx;
        } else if let Some(prev) = self.slab[old_tail].as_mut() {
            prev.next = idx;
        }

        self.tail = idx;
    }

    fn unlink(&mut self, idx: usize) {
        let Some((prev, next)) = self.slab[idx].as_ref().map(|node| (node.prev, node.next)) else {
            return;
        };

        if prev == NIL {
            self.head = next;
        } else if let Some(node) = self.slab[prev].as_mut() {
            node.next = next;
        }

        if next == NIL {
            self.tail = prev;
        } else if let Some(node) = self.slab[next].as_mut() {
            node.prev = prev;
        }

        if let Some(node) = self.slab[idx].as_mut() {
            node.prev = NIL;
            node.next = NIL;
        }
    }
}

pub struct Iter<'a, K, V> {
    lru: &'a BoundedLru<K, V>,
    cursor: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.lru.slab.get(self.cursor)?.as_ref()?;
        self.cursor = node.next;
        Some((&node.key, &node.value))
    }
}

impl<K, V> Extend<(K, V)> for BoundedLru<K, V>
where
    K: Hash + Eq + Clone,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.put(key, value);
        }
    }
}
