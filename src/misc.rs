//! The uniform bulk/misc command surface (spec §4.4): batched variants of
//! the basic put/get/out family, substring extraction, and key scanning
//! by regular expression.

use regex::Regex;

use crate::error::{Error, Result};
use crate::facade::Store;

/// Apply `put` to every (key, value) pair; stops at the first error.
pub fn putlist(store: &Store, pairs: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
    for (k, v) in pairs {
        store.put(k, v)?;
    }
    Ok(())
}

/// Remove every key in `keys`; returns how many were actually present.
/// Missing keys are tolerated (not an error) since callers typically
/// pass a superset of what they know to exist.
pub fn outlist(store: &Store, keys: &[Vec<u8>]) -> usize {
    keys.iter().filter(|k| store.out(k).is_ok()).count()
}

/// Fetch every key in `keys`, omitting ones that aren't present.
pub fn getlist(store: &Store, keys: &[Vec<u8>]) -> Vec<(Vec<u8>, Vec<u8>)> {
    keys.iter()
        .filter_map(|k| store.get(k).ok().map(|v| (k.clone(), v)))
        .collect()
}

/// A clamped substring of a value: `offset` past the end yields an empty
/// slice; a negative-length sentinel (`len == usize::MAX`) means "to the
/// end", matching the remote-protocol GETPART convention.
pub fn getpart(store: &Store, key: &[u8], offset: usize, len: usize) -> Result<Vec<u8>> {
    let value = store.get(key)?;
    if offset >= value.len() {
        return Ok(Vec::new());
    }
    let end = if len == usize::MAX {
        value.len()
    } else {
        (offset + len).min(value.len())
    };
    Ok(value[offset..end].to_vec())
}

/// Scan keys matching `pattern`, stopping after `max` matches (`0` means
/// unbounded). A leading `*` selects case-insensitive matching, mirroring
/// `tcadb.c`'s convention for its regex-search command.
pub fn regex_keys(store: &Store, pattern: &str, max: usize) -> Result<Vec<Vec<u8>>> {
    let (case_insensitive, pattern) = match pattern.strip_prefix('*') {
        Some(rest) => (true, rest),
        None => (false, pattern),
    };
    let full_pattern = if case_insensitive { format!("(?i){pattern}") } else { pattern.to_string() };
    let re = Regex::new(&full_pattern).map_err(|e| Error::Misc(e.to_string()))?;

    let mut out = Vec::new();
    store.foreach(|k, _| {
        if let Ok(s) = std::str::from_utf8(k) {
            if re.is_match(s) {
                out.push(k.to_vec());
                if max != 0 && out.len() >= max {
                    return false;
                }
            }
        }
        true
    });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn putlist_getlist_outlist() {
        let store = Store::open("*").unwrap();
        let pairs = vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())];
        putlist(&store, &pairs).unwrap();
        let got = getlist(&store, &[b"a".to_vec(), b"b".to_vec(), b"missing".to_vec()]);
        assert_eq!(got.len(), 2);
        let removed = outlist(&store, &[b"a".to_vec(), b"missing".to_vec()]);
        assert_eq!(removed, 1);
    }

    #[test]
    fn getpart_clamps() {
        let store = Store::open("*").unwrap();
        store.put(b"k", b"0123456789").unwrap();
        assert_eq!(getpart(&store, b"k", 2, 3).unwrap(), b"234");
        assert_eq!(getpart(&store, b"k", 8, 10).unwrap(), b"89");
        assert_eq!(getpart(&store, b"k", 20, 5).unwrap(), b"");
    }

    #[test]
    fn regex_finds_matching_keys() {
        let store = Store::open("*").unwrap();
        store.put(b"user:1", b"a").unwrap();
        store.put(b"user:2", b"b").unwrap();
        store.put(b"order:1", b"c").unwrap();
        let mut matches = regex_keys(&store, "^user:", 0).unwrap();
        matches.sort();
        assert_eq!(matches, vec![b"user:1".to_vec(), b"user:2".to_vec()]);
    }
}
