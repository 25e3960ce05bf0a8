//! Fixed 256-byte file header (spec §6).
//!
//! Unlike the teacher's `shm::layout::Header` (a fixed-slot struct read
//! directly off the mmap via a raw pointer cast), this header is
//! (de)serialized through explicit byte offsets: the rest of the file
//! holds variable-length varint-framed records, so there is no single
//! repr(C) struct that could describe the whole region anyway, and the
//! header is only touched on open/close/sync — not the hot path.

use std::convert::TryInto;

pub const HEADER_SIZE: usize = 256;
pub const MAGIC: [u8; 16] = *b"HVAULT01HASHDB\0\0";

pub const OPT_LARGE: u8 = 1 << 0;
pub const OPT_DEFLATE: u8 = 1 << 1;
pub const OPT_BZIP2: u8 = 1 << 2;
pub const OPT_TCBS: u8 = 1 << 3;

#[derive(Debug, Clone)]
pub struct Header {
    pub version: u16,
    pub opts: u8,
    pub apow: u8,
    pub fpow: u8,
    pub bnum: u64,
    pub rnum: u64,
    pub fsiz: u64,
    pub frec: u64,
    pub opaque: Vec<u8>,
}

impl Header {
    pub fn new(bnum: u64, apow: u8, fpow: u8, opts: u8) -> Self {
        Header {
            version: 1,
            opts,
            apow,
            fpow,
            bnum,
            rnum: 0,
            fsiz: 0,
            frec: 0,
            opaque: vec![0u8; 128],
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..16].copy_from_slice(&MAGIC);
        buf[16..18].copy_from_slice(&self.version.to_le_bytes());
        buf[18] = self.opts;
        buf[19] = self.apow;
        buf[20] = self.fpow;
        // buf[21] reserved
        buf[24..32].copy_from_slice(&self.bnum.to_le_bytes());
        buf[32..40].copy_from_slice(&self.rnum.to_le_bytes());
        buf[40..48].copy_from_slice(&self.fsiz.to_le_bytes());
        buf[48..56].copy_from_slice(&self.frec.to_le_bytes());
        let n = self.opaque.len().min(128);
        buf[56..56 + n].copy_from_slice(&self.opaque[..n]);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> crate::error::Result<Self> {
        if buf.len() < HEADER_SIZE || buf[0..16] != MAGIC {
            return Err(crate::error::Error::Meta);
        }
        let version = u16::from_le_bytes(buf[16..18].try_into().unwrap());
        let opts = buf[18];
        let apow = buf[19];
        let fpow = buf[20];
        let bnum = u64::from_le_bytes(buf[24..32].try_into().unwrap());
        let rnum = u64::from_le_bytes(buf[32..40].try_into().unwrap());
        let fsiz = u64::from_le_bytes(buf[40..48].try_into().unwrap());
        let frec = u64::from_le_bytes(buf[48..56].try_into().unwrap());
        let opaque = buf[56..184].to_vec();
        Ok(Header {
            version,
            opts,
            apow,
            fpow,
            bnum,
            rnum,
            fsiz,
            frec,
            opaque,
        })
    }

    pub fn bucket_array_offset() -> u64 {
        HEADER_SIZE as u64
    }

    pub fn bucket_entry_size(&self) -> u64 {
        if self.opts & OPT_LARGE != 0 {
            8
        } else {
            4
        }
    }

    /// Rounded up to `1 << apow`: every record frame is alignment-sized
    /// (spec §3.2), so the first one must start on an aligned boundary too.
    pub fn first_record_offset(&self) -> u64 {
        let raw = Self::bucket_array_offset() + self.bnum * self.bucket_entry_size();
        let align = 1u64 << self.apow;
        raw.div_ceil(align) * align
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let mut h = Header::new(17, 4, 10, OPT_LARGE);
        h.rnum = 3;
        h.fsiz = 4096;
        let bytes = h.to_bytes();
        let h2 = Header::from_bytes(&bytes).unwrap();
        assert_eq!(h2.bnum, 17);
        assert_eq!(h2.apow, 4);
        assert_eq!(h2.rnum, 3);
        assert_eq!(h2.fsiz, 4096);
        assert_eq!(h2.opts, OPT_LARGE);
    }

    #[test]
    fn first_record_offset_is_aligned() {
        // bucket_array_offset() + bnum*entry_size lands on a non-aligned
        // byte here (HEADER_SIZE=256, 17 buckets * 4 bytes = 324 -> 580,
        // not a multiple of 1<<4=16); the offset must round up to it.
        let h = Header::new(17, 4, 10, 0);
        let offset = h.first_record_offset();
        let align = 1u64 << h.apow;
        assert_eq!(offset % align, 0, "first_record_offset {offset} is not aligned to {align}");
        assert!(offset >= Header::bucket_array_offset() + h.bnum * h.bucket_entry_size());
    }
}
