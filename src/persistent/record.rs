//! Variable-length record frame encode/decode (spec §4.1.2).
//!
//! Each frame: magic(1) | hash-extender(1) | left(varint) | right(varint)
//! | pad-size(varint) | key-size(varint) | value-size(varint) | key |
//! value | padding, rounded up to `2^apow`.

use crate::error::{Error, Result};
use crate::persistent::region::Region;
use crate::varint;

pub const FRAME_MAGIC: u8 = 0xC8;

/// Largest plausible fixed portion of a frame header before we know the
/// true length: magic + ext + 5 varints, each at most 10 bytes.
const PROBE_LEN: usize = 2 + 5 * 10;

#[derive(Debug, Clone)]
pub struct Frame {
    pub left: u64,
    pub right: u64,
    pub hash_ext: u8,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub pad_size: u64,
}

impl Frame {
    /// Raw (unpadded) header+payload length.
    fn unpadded_len(left: u64, right: u64, pad_size: u64, ksiz: usize, vsiz: usize) -> usize {
        2 + varint::encoded_len(left)
            + varint::encoded_len(right)
            + varint::encoded_len(pad_size)
            + varint::encoded_len(ksiz as u64)
            + varint::encoded_len(vsiz as u64)
            + ksiz
            + vsiz
    }

    /// Compute the aligned total frame size and the pad-size value that
    /// makes the varint-prefixed frame fit exactly into that size.
    pub fn aligned_size(left: u64, right: u64, ksiz: usize, vsiz: usize, apow: u8) -> (u64, u64) {
        let align = 1u64 << apow;
        let mut pad: u64 = 0;
        loop {
            let raw = Self::unpadded_len(left, right, pad, ksiz, vsiz) as u64;
            let total = raw.div_ceil(align) * align;
            let new_pad = total - raw;
            if new_pad == pad {
                return (total, pad);
            }
            pad = new_pad;
        }
    }

    /// Encode this frame (header + key + value + zero padding) to bytes.
    pub fn encode(left: u64, right: u64, hash_ext: u8, key: &[u8], value: &[u8], apow: u8) -> Vec<u8> {
        let (total, pad) = Self::aligned_size(left, right, key.len(), value.len(), apow);
        let mut buf = Vec::with_capacity(total as usize);
        buf.push(FRAME_MAGIC);
        buf.push(hash_ext);
        varint::encode(left, &mut buf);
        varint::encode(right, &mut buf);
        varint::encode(pad, &mut buf);
        varint::encode(key.len() as u64, &mut buf);
        varint::encode(value.len() as u64, &mut buf);
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);
        buf.resize(total as usize, 0);
        buf
    }

    pub fn total_len(&self) -> u64 {
        2 + varint::encoded_len(self.left) as u64
            + varint::encoded_len(self.right) as u64
            + varint::encoded_len(self.pad_size) as u64
            + varint::encoded_len(self.key.len() as u64) as u64
            + varint::encoded_len(self.value.len() as u64) as u64
            + self.key.len() as u64
            + self.value.len() as u64
            + self.pad_size
    }

    /// Read and decode the frame located at `offset`. `limit` is the file's
    /// logical end (`Header::fsiz`); the speculative header probe is capped
    /// there since the last record in the file has no trailing bytes to
    /// over-read into.
    pub fn decode_at(region: &Region, offset: u64, limit: u64) -> Result<Self> {
        let probe_len = PROBE_LEN.min(limit.saturating_sub(offset) as usize);
        if probe_len == 0 {
            return Err(Error::RHead);
        }
        let probe = region.read(offset, probe_len)?;
        if probe[0] != FRAME_MAGIC {
            return Err(Error::RHead);
        }
        let hash_ext = probe[1];
        let mut pos = 2usize;
        let (left, n) = varint::decode(&probe[pos..]).ok_or(Error::RHead)?;
        pos += n;
        let (right, n) = varint::decode(&probe[pos..]).ok_or(Error::RHead)?;
        pos += n;
        let (pad_size, n) = varint::decode(&probe[pos..]).ok_or(Error::RHead)?;
        pos += n;
        let (ksiz, n) = varint::decode(&probe[pos..]).ok_or(Error::RHead)?;
        pos += n;
        let (vsiz, n) = varint::decode(&probe[pos..]).ok_or(Error::RHead)?;
        pos += n;

        let payload_needed = ksiz as usize + vsiz as usize;
        let payload = if pos + payload_needed <= probe.len() {
            probe[pos..pos + payload_needed].to_vec()
        } else {
            region.read(offset + pos as u64, payload_needed)?
        };
        let key = payload[..ksiz as usize].to_vec();
        let value = payload[ksiz as usize..].to_vec();

        Ok(Frame {
            left,
            right,
            hash_ext,
            key,
            value,
            pad_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let bytes = Frame::encode(0, 123456, 0xAB, b"k", b"value-bytes", 4);
        assert_eq!(bytes.len() % 16, 0);
    }
}
