//! Optional per-value compression, selected once at creation (spec §4.1.4).

use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::persistent::header::{OPT_BZIP2, OPT_DEFLATE, OPT_TCBS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Deflate,
    Bzip2,
    Custom,
}

impl Compression {
    pub fn from_opts(opts: u8) -> Self {
        if opts & OPT_DEFLATE != 0 {
            Compression::Deflate
        } else if opts & OPT_BZIP2 != 0 {
            Compression::Bzip2
        } else if opts & OPT_TCBS != 0 {
            Compression::Custom
        } else {
            Compression::None
        }
    }

    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Deflate => {
                let mut enc = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
                enc.write_all(data).map_err(|e| Error::Write(e.to_string()))?;
                enc.finish().map_err(|e| Error::Write(e.to_string()))
            }
            Compression::Bzip2 => {
                let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
                enc.write_all(data).map_err(|e| Error::Write(e.to_string()))?;
                enc.finish().map_err(|e| Error::Write(e.to_string()))
            }
            Compression::Custom => Ok(custom_encode(data)),
        }
    }

    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Deflate => {
                let mut dec = flate2::read::DeflateDecoder::new(data);
                let mut out = Vec::new();
                dec.read_to_end(&mut out).map_err(|e| Error::Read(e.to_string()))?;
                Ok(out)
            }
            Compression::Bzip2 => {
                let mut dec = bzip2::read::BzDecoder::new(data);
                let mut out = Vec::new();
                dec.read_to_end(&mut out).map_err(|e| Error::Read(e.to_string()))?;
                Ok(out)
            }
            Compression::Custom => Ok(custom_decode(data)),
        }
    }
}

/// A tiny byte-oriented run-length scheme, standing in for the
/// "custom-byte-coded" compressor option: a self-contained codec with no
/// external dependency, for callers that pick `opts=t`.
fn custom_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let byte = data[i];
        let mut run = 1u8;
        while i + (run as usize) < data.len() && data[i + run as usize] == byte && run < 255 {
            run += 1;
        }
        out.push(run);
        out.push(byte);
        i += run as usize;
    }
    out
}

fn custom_decode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0;
    while i + 1 < data.len() {
        let run = data[i];
        let byte = data[i + 1];
        out.extend(std::iter::repeat_n(byte, run as usize));
        i += 2;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deflate_round_trips() {
        let data = b"hello hello hello hello world";
        let c = Compression::Deflate.compress(data).unwrap();
        let d = Compression::Deflate.decompress(&c).unwrap();
        assert_eq!(d, data);
    }

    #[test]
    fn custom_round_trips() {
        let data = b"aaaabbbccccccccd";
        let c = Compression::Custom.compress(data).unwrap();
        let d = Compression::Custom.decompress(&c).unwrap();
        assert_eq!(d, data);
    }
}
