use std::{
    collections::{HashMap, VecDeque},
    hash::Hash,
};

/// Bounded least-recently-used map.
///
/// Recency is tracked with a monotonically increasing stamp per entry and a
/// queue of `(key, stamp)` observations; stale observations are discarded
/// lazily during eviction, keeping both `get` and `insert` amortized O(1)
/// without an intrusive list.
pub struct LruMap<K, V> {
    capacity: usize,
    entries: HashMap<K, (V, u64)>,
    order: VecDeque<(K, u64)>,
    clock: u64,
}

impl<K: Hash + Eq + Clone, V: Copy> LruMap<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
            clock: 0,
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        let (value, stamp) = self.entries.get_mut(key)?;
        self.clock += 1;
        *stamp = self.clock;
        let value = *value;
        self.order.push_back((key.clone(), self.clock));
        Some(value)
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.clock += 1;
        self.entries.insert(key.clone(), (value, self.clock));
        self.order.push_back((key, self.clock));
        while self.entries.len() > self.capacity {
            self.evict_one();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_one(&mut self) {
        while let Some((key, stamp)) = self.order.pop_front() {
            match self.entries.get(&key) {
                // Only the newest observation of a key is authoritative.
                Some((_, current)) if *current == stamp => {
                    self.entries.remove(&key);
                    return;
                }
                _ => continue,
            }
        }
    }
}
