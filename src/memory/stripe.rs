//! A single LRU-ordered stripe (spec §4.2).
//!
//! `hashlink::LinkedHashMap::insert` moves a touched key to the back
//! (MRU end) and `pop_front` evicts the front (LRU end); `replace`
//! updates a value without touching its position, the same distinction
//! the teacher's `FifoStrategy` relies on. Plain `put`/`putcat` use
//! `replace` on an existing key so a touch never reorders it; the
//! "semivolatile" `put3`/`putcat3` variants use `insert` so a touch
//! promotes the key to the MRU end.
//!
//! A stripe has no cap of its own: capacity bounds (`capnum`/`capsiz`)
//! are enforced by `MemDb` across all stripes combined, batched every
//! 256 operations (spec §4.2), not per-insert here.

use hashlink::LinkedHashMap;

pub struct Stripe {
    map: LinkedHashMap<Vec<u8>, Vec<u8>>,
}

impl Stripe {
    pub fn new() -> Self {
        Stripe { map: LinkedHashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn byte_len(&self) -> usize {
        self.map.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.get(key).cloned()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.map.contains_key(key)
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>, semivolatile: bool) {
        if self.map.contains_key(&key) {
            if semivolatile {
                self.map.insert(key, value);
            } else {
                self.map.replace(key, value);
            }
        } else {
            self.map.insert(key, value);
        }
    }

    pub fn putcat(&mut self, key: Vec<u8>, value: &[u8], semivolatile: bool) {
        if let Some(mut existing) = self.map.get(&key).cloned() {
            existing.extend_from_slice(value);
            if semivolatile {
                self.map.insert(key, existing);
            } else {
                self.map.replace(key, existing);
            }
            return;
        }
        self.map.insert(key, value.to_vec());
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.remove(key)
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.map.keys().cloned().collect()
    }

    /// Evict up to `count` entries from the front (the LRU end), for
    /// `cutfront`'s bulk-eviction batches.
    pub fn cut_front(&mut self, count: usize) -> usize {
        let mut cut = 0;
        while cut < count {
            if self.map.pop_front().is_none() {
                break;
            }
            cut += 1;
        }
        cut
    }

    pub fn for_each<F: FnMut(&[u8], &[u8])>(&self, mut f: F) {
        for (k, v) in self.map.iter() {
            f(k, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put3_promotes_touched_key_to_lru_front() {
        let mut s = Stripe::new();
        for i in 0..100u32 {
            s.put(format!("k{i}").into_bytes(), b"v".to_vec(), false);
        }
        // k0 is the LRU-oldest entry; a semivolatile touch (put3) moves
        // it to the MRU end, so a front cut takes k1 instead.
        s.put(b"k0".to_vec(), b"v2".to_vec(), true);
        s.cut_front(1);
        assert!(s.get(b"k0").is_some(), "put3 should have protected k0 from the front cut");
        assert!(s.get(b"k1").is_none(), "k1 should now be the LRU-oldest entry");
    }
}
