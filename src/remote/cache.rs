// Block caches for range reads, kept per URL in a small LRU.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use log::debug;

// ---------------------------------------------------------------------------
// LruCache
// ---------------------------------------------------------------------------

/// Least-recently-used map holding at most `capacity` entries.
#[derive(Debug)]
pub struct LruCache<K, V> {
    capacity: usize,
    map: HashMap<K, V>,
    /// Keys from least to most recently used.
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    fn touch(&mut self, key: &K) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        if self.map.contains_key(key) {
            self.touch(key);
        }
        self.map.get(key)
    }

    /// Insert `value`, evicting the least recently used entry when full.
    /// Returns the evicted entry, if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if self.map.insert(key.clone(), value).is_some() {
            self.touch(&key);
            return None;
        }
        self.order.push_back(key);
        if self.map.len() > self.capacity {
            let oldest = self.order.pop_front()?;
            let value = self.map.remove(&oldest)?;
            return Some((oldest, value));
        }
        None
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let value = self.map.remove(key)?;
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        Some(value)
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }
}

// ---------------------------------------------------------------------------
// BlockCache
// ---------------------------------------------------------------------------

/// Fixed-size blocks of one remote file that have already been fetched.
#[derive(Debug, Clone)]
pub struct BlockCache {
    block_size: u64,
    content_length: Option<u64>,
    blocks: HashMap<u64, Vec<u8>>,
}

impl BlockCache {
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size: block_size.max(1),
            content_length: None,
            blocks: HashMap::new(),
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn set_content_length(&mut self, len: u64) {
        self.content_length = Some(len);
    }

    pub fn block(&self, index: u64) -> Option<&[u8]> {
        self.blocks.get(&index).map(Vec::as_slice)
    }

    pub fn has_block(&self, index: u64) -> bool {
        self.blocks.contains_key(&index)
    }

    pub fn put_block(&mut self, index: u64, data: Vec<u8>) {
        self.blocks.insert(index, data);
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn cached_bytes(&self) -> u64 {
        self.blocks.values().map(|b| b.len() as u64).sum()
    }

    /// Runs of consecutive missing blocks among `first..=last`, as inclusive
    /// block index pairs.
    pub fn missing_runs(&self, first: u64, last: u64) -> Vec<(u64, u64)> {
        let mut runs = Vec::new();
        let mut run_start: Option<u64> = None;
        for index in first..=last {
            match (self.has_block(index), run_start) {
                (false, None) => run_start = Some(index),
                (true, Some(start)) => {
                    runs.push((start, index - 1));
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            runs.push((start, last));
        }
        runs
    }
}

// ---------------------------------------------------------------------------
// RangeCache
// ---------------------------------------------------------------------------

/// Block caches of recently read URLs.
#[derive(Debug)]
pub struct RangeCache {
    block_size: u64,
    entries: LruCache<String, BlockCache>,
}

impl RangeCache {
    pub fn new(capacity: usize, block_size: u64) -> Self {
        Self {
            block_size,
            entries: LruCache::new(capacity),
        }
    }

    /// Take the block cache of `url` out of the LRU, or start an empty one.
    pub fn checkout(&mut self, url: &str) -> BlockCache {
        match self.entries.remove(&url.to_string()) {
            Some(cache) if cache.block_size() == self.block_size => {
                debug!(
                    "range cache hit url={} blocks={}",
                    url,
                    cache.block_count()
                );
                cache
            }
            _ => BlockCache::new(self.block_size),
        }
    }

    /// Return a block cache after use.
    pub fn checkin(&mut self, url: &str, cache: BlockCache) {
        if let Some((evicted, _)) = self.entries.insert(url.to_string(), cache) {
            debug!("range cache evicted url={}", evicted);
        }
    }

    pub fn contains(&self, url: &str) -> bool {
        self.entries.contains(&url.to_string())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_evicts_least_recently_used() {
        let mut lru = LruCache::new(2);
        lru.insert("a", 1);
        lru.insert("b", 2);
        assert_eq!(lru.get(&"a"), Some(&1));
        let evicted = lru.insert("c", 3);
        assert_eq!(evicted, Some(("b", 2)));
        assert!(lru.contains(&"a"));
        assert!(lru.contains(&"c"));
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn lru_reinsert_refreshes_entry() {
        let mut lru = LruCache::new(2);
        lru.insert("a", 1);
        lru.insert("b", 2);
        assert!(lru.insert("a", 10).is_none());
        assert_eq!(lru.insert("c", 3), Some(("b", 2)));
        assert_eq!(lru.get(&"a"), Some(&10));
    }

    #[test]
    fn missing_runs_are_coalesced() {
        let mut cache = BlockCache::new(10);
        cache.put_block(2, vec![0; 10]);
        cache.put_block(3, vec![0; 10]);
        cache.put_block(6, vec![0; 10]);
        assert_eq!(cache.missing_runs(0, 7), vec![(0, 1), (4, 5), (7, 7)]);
        assert!(cache.missing_runs(2, 3).is_empty());
    }

    #[test]
    fn checkout_removes_and_checkin_restores() {
        let mut ranges = RangeCache::new(4, 16);
        let mut blocks = ranges.checkout("u");
        blocks.put_block(0, vec![1; 16]);
        ranges.checkin("u", blocks);
        assert!(ranges.contains("u"));

        let blocks = ranges.checkout("u");
        assert!(!ranges.contains("u"));
        assert!(blocks.has_block(0));
        assert_eq!(blocks.cached_bytes(), 16);
    }
}
