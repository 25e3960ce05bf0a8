//! The polymorphic store façade (spec §4.3): one handle type dispatching
//! to whichever back-end a location string selects.

use crate::error::{Error, Result};
use crate::location::{self, Backend};
use crate::memory::{self, MemDb};
use crate::persistent::{Hdb, PutMode as HdbPutMode};

/// The plug for third-party back-ends (spec §4.3's "skeleton" extension
/// point): a store that isn't the built-in in-memory or hash-file
/// implementation, but speaks the same get/put/out/rnum vocabulary.
/// No concrete implementation ships in this crate; `Store::open_external`
/// lets a caller register one without the façade depending on its crate.
pub trait StoreOps: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>>;
    fn put(&self, key: &[u8], value: &[u8], mode: PutMode) -> Result<()>;
    fn out(&self, key: &[u8]) -> Result<()>;
    fn rnum(&self) -> u64;
    fn vanish(&self) -> Result<()>;
    fn foreach(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> bool);
}

enum Kind {
    Memory(MemDb),
    Persistent(Box<Hdb>),
    External(Box<dyn StoreOps>),
}

/// An opened key/value store, backed by either the in-memory striped
/// hash table, the persistent hash file, or a registered external
/// implementation, selected by `Store::open`'s location string.
pub struct Store {
    kind: Kind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    Overwrite,
    Keep,
    Cat,
}

impl Store {
    /// `path#k1=v1#k2=v2#...`; `path == "*"` opens the in-memory store.
    pub fn open(loc: &str) -> Result<Self> {
        let parsed = location::parse(loc);
        let kind = match parsed.backend {
            Backend::Memory => Kind::Memory(MemDb::new(parsed.tuning.capnum, parsed.tuning.capsiz)),
            Backend::Persistent(path) => Kind::Persistent(Box::new(Hdb::open(path, &parsed.tuning)?)),
        };
        Ok(Store { kind })
    }

    /// Registers a third-party back-end (spec §4.3's "skeleton" plug).
    pub fn open_external(store: Box<dyn StoreOps>) -> Self {
        Store { kind: Kind::External(store) }
    }

    pub fn close(&self) -> Result<()> {
        match &self.kind {
            Kind::Memory(_) => Ok(()),
            Kind::Persistent(h) => h.close(),
            Kind::External(_) => Ok(()),
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        match &self.kind {
            Kind::Memory(m) => m.get(key),
            Kind::Persistent(h) => h.get(key),
            Kind::External(s) => s.get(key),
        }
    }

    pub fn vsiz(&self, key: &[u8]) -> Result<usize> {
        self.get(key).map(|v| v.len())
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_mode(key, value, PutMode::Overwrite)
    }

    pub fn putkeep(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_mode(key, value, PutMode::Keep)
    }

    pub fn putcat(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_mode(key, value, PutMode::Cat)
    }

    /// Semivolatile put: on the in-memory back-end, a touched existing
    /// key is promoted to most-recently-used; on the persistent
    /// back-end there is no recency list to promote, so this behaves
    /// exactly like `put`.
    pub fn put3(&self, key: &[u8], value: &[u8]) -> Result<()> {
        match &self.kind {
            Kind::Memory(m) => m.put(key, value, memory::PutMode::Overwrite, true),
            Kind::Persistent(h) => h.put(key, value, HdbPutMode::Overwrite),
            Kind::External(s) => s.put(key, value, PutMode::Overwrite),
        }
    }

    pub fn putcat3(&self, key: &[u8], value: &[u8]) -> Result<()> {
        match &self.kind {
            Kind::Memory(m) => m.put(key, value, memory::PutMode::Cat, true),
            Kind::Persistent(h) => h.put(key, value, HdbPutMode::Cat),
            Kind::External(s) => s.put(key, value, PutMode::Cat),
        }
    }

    pub fn putshl(&self, key: &[u8], value: &[u8], width: usize) -> Result<()> {
        match &self.kind {
            Kind::Memory(m) => {
                let mut combined = m.get(key).unwrap_or_default();
                combined.extend_from_slice(value);
                if combined.len() > width {
                    let start = combined.len() - width;
                    combined.drain(0..start);
                }
                m.put(key, &combined, memory::PutMode::Overwrite, false)
            }
            Kind::Persistent(h) => h.put_shl(key, value, width),
            Kind::External(s) => {
                let mut combined = s.get(key).unwrap_or_default();
                combined.extend_from_slice(value);
                if combined.len() > width {
                    let start = combined.len() - width;
                    combined.drain(0..start);
                }
                s.put(key, &combined, PutMode::Overwrite)
            }
        }
    }

    fn put_mode(&self, key: &[u8], value: &[u8], mode: PutMode) -> Result<()> {
        match &self.kind {
            Kind::Memory(m) => m.put(key, value, to_mem_mode(mode), false),
            Kind::Persistent(h) => h.put(key, value, to_hdb_mode(mode)),
            Kind::External(s) => s.put(key, value, mode),
        }
    }

    pub fn out(&self, key: &[u8]) -> Result<()> {
        match &self.kind {
            Kind::Memory(m) => m.out(key),
            Kind::Persistent(h) => h.out(key),
            Kind::External(s) => s.out(key),
        }
    }

    pub fn rnum(&self) -> u64 {
        match &self.kind {
            Kind::Memory(m) => m.rnum(),
            Kind::Persistent(h) => h.rnum(),
            Kind::External(s) => s.rnum(),
        }
    }

    pub fn fsiz(&self) -> u64 {
        match &self.kind {
            Kind::Memory(_) => 0,
            Kind::Persistent(h) => h.fsiz(),
            Kind::External(_) => 0,
        }
    }

    pub fn sync(&self) -> Result<()> {
        match &self.kind {
            Kind::Memory(_) => Ok(()),
            Kind::Persistent(h) => h.sync(),
            Kind::External(_) => Ok(()),
        }
    }

    pub fn optimize(&self) -> Result<()> {
        match &self.kind {
            Kind::Memory(_) => Ok(()),
            Kind::Persistent(h) => h.optimize(),
            Kind::External(_) => Ok(()),
        }
    }

    pub fn defrag(&self, step: u32) -> Result<u32> {
        match &self.kind {
            Kind::Memory(_) => Err(Error::InvalidOp),
            Kind::Persistent(h) => h.defrag(step),
            Kind::External(_) => Err(Error::InvalidOp),
        }
    }

    pub fn vanish(&self) -> Result<()> {
        match &self.kind {
            Kind::Memory(m) => {
                m.vanish();
                Ok(())
            }
            Kind::Persistent(h) => h.vanish(),
            Kind::External(s) => s.vanish(),
        }
    }

    pub fn cacheclear(&self) {
        if let Kind::Persistent(h) = &self.kind {
            h.cacheclear();
        }
    }

    /// Bulk eviction of `count` least-recently-used in-memory entries.
    /// A no-op (returning 0) on the persistent and external back-ends.
    pub fn cutfront(&self, count: usize) -> usize {
        match &self.kind {
            Kind::Memory(m) => m.cutfront(count),
            Kind::Persistent(_) => 0,
            Kind::External(_) => 0,
        }
    }

    pub fn tran_begin(&self) -> Result<()> {
        match &self.kind {
            Kind::Memory(m) => m.tran_begin(),
            Kind::Persistent(h) => h.tran_begin(),
            Kind::External(_) => Err(Error::InvalidOp),
        }
    }

    pub fn tran_commit(&self) -> Result<()> {
        match &self.kind {
            Kind::Memory(_) => Err(Error::InvalidOp),
            Kind::Persistent(h) => h.tran_commit(),
            Kind::External(_) => Err(Error::InvalidOp),
        }
    }

    pub fn tran_abort(&self) -> Result<()> {
        match &self.kind {
            Kind::Memory(_) => Err(Error::InvalidOp),
            Kind::Persistent(h) => h.tran_abort(),
            Kind::External(_) => Err(Error::InvalidOp),
        }
    }

    pub fn error(&self) -> u8 {
        match &self.kind {
            Kind::Memory(_) => 0,
            Kind::Persistent(h) => h.last_error(),
            Kind::External(_) => 0,
        }
    }

    pub fn iter_init(&self) -> Cursor {
        match &self.kind {
            Kind::Memory(m) => Cursor::Memory(m.iter_init()),
            Kind::Persistent(h) => Cursor::Persistent(h.iter_init()),
            Kind::External(s) => {
                let mut keys = std::collections::VecDeque::new();
                s.foreach(&mut |k, _| {
                    keys.push_back(k.to_vec());
                    true
                });
                Cursor::Memory(memory::Cursor { keys })
            }
        }
    }

    pub fn iter_init_at(&self, key: &[u8]) -> Cursor {
        match &self.kind {
            Kind::Memory(m) => Cursor::Memory(m.iter_init()).skip_to(key),
            Kind::Persistent(h) => Cursor::Persistent(h.iter_init_at(key)),
            Kind::External(_) => self.iter_init().skip_to(key),
        }
    }

    pub fn iter_next(&self, cursor: &mut Cursor) -> Option<(Vec<u8>, Vec<u8>)> {
        match (&self.kind, cursor) {
            (Kind::Memory(m), Cursor::Memory(c)) => m.iter_next(c),
            (Kind::Persistent(h), Cursor::Persistent(c)) => h.iter_next(c),
            (Kind::External(s), Cursor::Memory(c)) => {
                while let Some(key) = c.keys.pop_front() {
                    if let Ok(value) = s.get(&key) {
                        return Some((key, value));
                    }
                }
                None
            }
            _ => None,
        }
    }

    pub fn foreach<F: FnMut(&[u8], &[u8]) -> bool>(&self, mut f: F) {
        match &self.kind {
            Kind::Memory(m) => m.foreach(f),
            Kind::Persistent(h) => h.foreach(f),
            Kind::External(s) => s.foreach(&mut f),
        }
    }

    /// Atomic numeric increment (remote protocol ADDINT, spec §6):
    /// stores the addend as a 4-byte little-endian `i32` when the key is
    /// absent, otherwise decodes the existing value as one, adds, and
    /// writes the sum back. Returns the new total.
    pub fn addint(&self, key: &[u8], delta: i32) -> Result<i32> {
        let existing = match self.get(key) {
            Ok(bytes) => {
                let arr: [u8; 4] = bytes.as_slice().try_into().map_err(|_| Error::Misc("addint: not a 4-byte int value".into()))?;
                i32::from_le_bytes(arr)
            }
            Err(Error::NoRec) => 0,
            Err(e) => return Err(e),
        };
        let sum = existing.wrapping_add(delta);
        self.put(key, &sum.to_le_bytes())?;
        Ok(sum)
    }

    /// Atomic floating-point increment (remote protocol ADDDOUBLE, spec
    /// §6): stored locally as an 8-byte little-endian IEEE-754 `f64`
    /// (the wire protocol's split seconds/fraction encoding is a
    /// collaborator concern, not this store's on-disk representation).
    pub fn adddouble(&self, key: &[u8], delta: f64) -> Result<f64> {
        let existing = match self.get(key) {
            Ok(bytes) => {
                let arr: [u8; 8] = bytes.as_slice().try_into().map_err(|_| Error::Misc("adddouble: not an 8-byte double value".into()))?;
                f64::from_le_bytes(arr)
            }
            Err(Error::NoRec) => 0.0,
            Err(e) => return Err(e),
        };
        let sum = existing + delta;
        self.put(key, &sum.to_le_bytes())?;
        Ok(sum)
    }

    /// Forward-matching key scan (remote protocol FWMKEYS, spec §6):
    /// every live key starting with `prefix`, in iteration order,
    /// capped at `max` (`0` means unbounded).
    pub fn fwmkeys(&self, prefix: &[u8], max: usize) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        self.foreach(|k, _| {
            if k.starts_with(prefix) {
                out.push(k.to_vec());
                if max != 0 && out.len() >= max {
                    return false;
                }
            }
            true
        });
        out
    }
}

fn to_hdb_mode(mode: PutMode) -> HdbPutMode {
    match mode {
        PutMode::Overwrite => HdbPutMode::Overwrite,
        PutMode::Keep => HdbPutMode::Keep,
        PutMode::Cat => HdbPutMode::Cat,
    }
}

fn to_mem_mode(mode: PutMode) -> memory::PutMode {
    match mode {
        PutMode::Overwrite => memory::PutMode::Overwrite,
        PutMode::Keep => memory::PutMode::Keep,
        PutMode::Cat => memory::PutMode::Cat,
    }
}

pub enum Cursor {
    Memory(memory::Cursor),
    Persistent(crate::persistent::iter::Cursor),
}

impl Cursor {
    /// The in-memory store's cursor is an unordered key snapshot; "at
    /// key" positioning there means filtering it down to keys at or
    /// after `key` lexicographically, same best-effort spirit as the
    /// persistent back-end's offset-order scan.
    fn skip_to(self, key: &[u8]) -> Self {
        match self {
            Cursor::Memory(mut c) => {
                c.keys.retain(|k| k.as_slice() >= key);
                Cursor::Memory(c)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn memory_backend_round_trip() {
        let db = Store::open("*").unwrap();
        db.put(b"a", b"1").unwrap();
        assert_eq!(db.get(b"a").unwrap(), b"1");
        db.out(b"a").unwrap();
        assert!(db.get(b"a").is_err());
    }

    struct ToyExternal(Mutex<std::collections::BTreeMap<Vec<u8>, Vec<u8>>>);

    impl StoreOps for ToyExternal {
        fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
            self.0.lock().get(key).cloned().ok_or(Error::NoRec)
        }
        fn put(&self, key: &[u8], value: &[u8], mode: PutMode) -> Result<()> {
            let mut map = self.0.lock();
            if mode == PutMode::Keep && map.contains_key(key) {
                return Err(Error::Keep);
            }
            if mode == PutMode::Cat {
                map.entry(key.to_vec()).or_default().extend_from_slice(value);
            } else {
                map.insert(key.to_vec(), value.to_vec());
            }
            Ok(())
        }
        fn out(&self, key: &[u8]) -> Result<()> {
            self.0.lock().remove(key).map(|_| ()).ok_or(Error::NoRec)
        }
        fn rnum(&self) -> u64 {
            self.0.lock().len() as u64
        }
        fn vanish(&self) -> Result<()> {
            self.0.lock().clear();
            Ok(())
        }
        fn foreach(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> bool) {
            for (k, v) in self.0.lock().iter() {
                if !f(k, v) {
                    break;
                }
            }
        }
    }

    #[test]
    fn external_backend_dispatches_through_store_ops() {
        let db = Store::open_external(Box::new(ToyExternal(Mutex::new(std::collections::BTreeMap::new()))));
        db.put(b"a", b"1").unwrap();
        assert_eq!(db.get(b"a").unwrap(), b"1");
        assert_eq!(db.addint(b"n", 4).unwrap(), 4);
        assert_eq!(db.rnum(), 2);
        db.out(b"a").unwrap();
        assert!(db.get(b"a").is_err());
    }

    #[test]
    fn persistent_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facade.hdb");
        let loc = format!("{}#mode=wc", path.display());
        let db = Store::open(&loc).unwrap();
        db.put(b"a", b"1").unwrap();
        assert_eq!(db.get(b"a").unwrap(), b"1");
        db.close().unwrap();
    }

    #[test]
    fn addint_accumulates_and_creates() {
        let db = Store::open("*").unwrap();
        assert_eq!(db.addint(b"n", 5).unwrap(), 5);
        assert_eq!(db.addint(b"n", 3).unwrap(), 8);
        assert_eq!(db.addint(b"n", -10).unwrap(), -2);
    }

    #[test]
    fn adddouble_accumulates_and_creates() {
        let db = Store::open("*").unwrap();
        assert_eq!(db.adddouble(b"d", 1.5).unwrap(), 1.5);
        assert_eq!(db.adddouble(b"d", 2.25).unwrap(), 3.75);
    }

    #[test]
    fn fwmkeys_matches_prefix_and_caps() {
        let db = Store::open("*").unwrap();
        db.put(b"cat1", b"v").unwrap();
        db.put(b"cat2", b"v").unwrap();
        db.put(b"dog1", b"v").unwrap();
        let mut all = db.fwmkeys(b"cat", 0);
        all.sort();
        assert_eq!(all, vec![b"cat1".to_vec(), b"cat2".to_vec()]);
        assert_eq!(db.fwmkeys(b"cat", 1).len(), 1);
        assert!(db.fwmkeys(b"zzz", 0).is_empty());
    }

    #[test]
    fn iteration_visits_all_keys() {
        let db = Store::open("*").unwrap();
        for i in 0..10u32 {
            db.put(format!("k{i}").as_bytes(), format!("v{i}").as_bytes()).unwrap();
        }
        let mut cursor = db.iter_init();
        let mut count = 0;
        while db.iter_next(&mut cursor).is_some() {
            count += 1;
        }
        assert_eq!(count, 10);
    }
}
