//! Best-effort iteration cursor (spec §4.1.9): a plain file offset, not a
//! snapshot. Concurrent writers can cause records to be skipped or (after
//! a relocation) revisited; no isolation is promised.

use crate::persistent::record::Frame;
use crate::persistent::HdbState;

pub struct Cursor {
    next_offset: u64,
}

impl Cursor {
    pub fn new(offset: u64) -> Self {
        Cursor { next_offset: offset }
    }
}

fn free_block_at(st: &HdbState, offset: u64) -> Option<u64> {
    st.free.iter().find(|&(o, _)| o == offset).map(|(_, s)| s)
}

pub(crate) fn next(st: &HdbState, cursor: &mut Cursor) -> Option<(Vec<u8>, Vec<u8>)> {
    loop {
        if cursor.next_offset >= st.header.fsiz {
            return None;
        }
        if let Some(size) = free_block_at(st, cursor.next_offset) {
            cursor.next_offset += size;
            continue;
        }
        match Frame::decode_at(&st.region, cursor.next_offset, st.header.fsiz) {
            Ok(frame) => {
                cursor.next_offset += frame.total_len();
                let value = st.compress.decompress(&frame.value).ok()?;
                return Some((frame.key, value));
            }
            Err(_) => return None,
        }
    }
}

/// Position the cursor at the first record (in ascending file-offset
/// order) whose key compares lexicographically at-or-after `key`. Records
/// are not stored in key order, so this is a linear scan, not a seek —
/// acceptable given the cursor's already-loose consistency guarantees.
pub(crate) fn init_at(st: &HdbState, key: &[u8]) -> Cursor {
    let mut offset = st.header.first_record_offset();
    while offset < st.header.fsiz {
        if let Some(size) = free_block_at(st, offset) {
            offset += size;
            continue;
        }
        match Frame::decode_at(&st.region, offset, st.header.fsiz) {
            Ok(frame) => {
                if frame.key.as_slice() >= key {
                    return Cursor::new(offset);
                }
                offset += frame.total_len();
            }
            Err(_) => break,
        }
    }
    Cursor::new(st.header.fsiz)
}
