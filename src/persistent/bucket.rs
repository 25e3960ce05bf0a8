//! Per-bucket binary-search-tree ordering (spec §4.1.1).
//!
//! Order key is the secondary hash; ties break by byte-lexicographic
//! key comparison. No rebalancing — nodes are linked purely by natural
//! insertion order, same as the teacher's open-addressing table trades
//! probe-sequence simplicity for load-factor discipline elsewhere.

use std::cmp::Ordering;

/// Where `candidate` falls relative to `at`, the current tree node.
pub fn order(cand_hash: u32, cand_key: &[u8], at_hash: u32, at_key: &[u8]) -> Ordering {
    match cand_hash.cmp(&at_hash) {
        Ordering::Equal => cand_key.cmp(at_key),
        other => other,
    }
}
