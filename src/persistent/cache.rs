//! Record value cache: LRU, bounded by count, keyed by key hash (spec §4.1.6).

use hashlink::LruCache;

pub struct RecordCache {
    cache: LruCache<Vec<u8>, Vec<u8>>,
    capacity: usize,
}

impl RecordCache {
    pub fn new(capacity: usize) -> Self {
        RecordCache {
            cache: LruCache::new(capacity.max(1)),
            capacity,
        }
    }

    pub fn get(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        if self.capacity == 0 {
            return None;
        }
        self.cache.get(key).cloned()
    }

    pub fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) {
        if self.capacity == 0 {
            return;
        }
        self.cache.insert(key, value);
    }

    pub fn invalidate(&mut self, key: &[u8]) {
        self.cache.remove(key);
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}
