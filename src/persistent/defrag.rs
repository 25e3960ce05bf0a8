//! Incremental defragmentation (spec §4.1.7): coalesce the lowest-offset
//! free block with the live record immediately after it by moving that
//! record leftward, one step at a time so a caller can bound the pause.

use crate::error::Result;
use crate::hashfn::secondary_hash;
use crate::persistent::record::Frame;
use crate::persistent::HdbState;

/// Perform up to `step` coalescing moves. Returns how many were done —
/// fewer than `step` means the pool is fully packed (or empty).
pub(crate) fn run(st: &mut HdbState, step: u32) -> Result<u32> {
    let mut done = 0u32;
    while done < step {
        let Some((off, size)) = st.free.lowest() else {
            break;
        };
        let adjacent_offset = off + size;

        if adjacent_offset >= st.header.fsiz {
            // Trailing free space: nothing to move, just shrink the file.
            st.free.remove(off, size);
            st.header.fsiz = off;
            st.region.set_len(off)?;
            done += 1;
            continue;
        }

        let frame = match Frame::decode_at(&st.region, adjacent_offset, st.header.fsiz) {
            Ok(f) => f,
            Err(_) => break, // shouldn't happen if bucket trees and free list agree
        };
        let frame_total = frame.total_len();

        let bytes = Frame::encode(frame.left, frame.right, frame.hash_ext, &frame.key, &frame.value, st.header.apow);
        super::write_frame_logged(st, off, &bytes)?;

        // The combined (free + moved-record) span is unchanged in size;
        // only the split between "live" and "free" within it shifts left.
        st.free.remove(off, size);
        st.free.push(off + frame_total, size);

        let bidx = super::bucket_index_for(st, &frame.key);
        let shash = secondary_hash(&frame.key);
        let loc = super::locate(st, bidx, &frame.key, shash)?;
        super::set_child_pointer(st, loc.insert_attach, off, loc.path)?;

        done += 1;
    }
    Ok(done)
}

#[cfg(test)]
mod tests {
    use crate::location::Tuning;
    use crate::persistent::{Hdb, PutMode};

    #[test]
    fn defrag_reclaims_deleted_space() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("defrag.hdb");
        let tuning = Tuning {
            mode_writer: true,
            mode_create: true,
            ..Tuning::default()
        };
        let db = Hdb::open(&path, &tuning).unwrap();
        for i in 0..50u32 {
            db.put(format!("k{i}").as_bytes(), format!("v{i}").as_bytes(), PutMode::Overwrite).unwrap();
        }
        for i in (0..50u32).step_by(2) {
            db.out(format!("k{i}").as_bytes()).unwrap();
        }
        let before = db.fsiz();
        db.optimize().unwrap();
        let after = db.fsiz();
        assert!(after <= before);
        for i in (1..50u32).step_by(2) {
            assert_eq!(db.get(format!("k{i}").as_bytes()).unwrap(), format!("v{i}").as_bytes());
        }
    }
}
