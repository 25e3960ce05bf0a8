//! File-backed byte region: a bounded mmap window over the file prefix,
//! falling through to positional I/O beyond it (spec §4.1.6).
//!
//! Grounded on the teacher's `shm::region::ShmRegion`, adapted from a
//! single all-or-nothing mmap of the whole cache file to a *bounded*
//! window plus positional read/write fallback, since the persistent
//! store's file grows over time and the window is not meant to track
//! that growth (spec: "the window stays bounded, no remap required").

use std::fs::File;
use std::os::unix::fs::FileExt;

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::error::{Error, Result};

enum Window {
    Write(MmapMut),
    Read(Mmap),
}

pub struct Region {
    file: File,
    writable: bool,
    window: Option<Window>,
    window_len: u64,
}

impl Region {
    pub fn new(file: File, xmsiz: u64, writable: bool) -> Result<Self> {
        let mut region = Region {
            file,
            writable,
            window: None,
            window_len: 0,
        };
        if xmsiz > 0 {
            region.remap(xmsiz)?;
        }
        Ok(region)
    }

    /// (Re)establish the mmap window covering `[0, xmsiz.min(file_len))`.
    /// Only called at open time and after explicit resize events (grow,
    /// truncate on close) — never implicitly on every write. A read-only
    /// handle maps without `PROT_WRITE`, since the underlying fd itself
    /// isn't opened for writing.
    pub fn remap(&mut self, xmsiz: u64) -> Result<()> {
        let file_len = self.file.metadata().map_err(|e| Error::Stat(e.to_string()))?.len();
        let len = xmsiz.min(file_len.max(1));
        if len == 0 {
            self.window = None;
            self.window_len = 0;
            return Ok(());
        }
        let window = if self.writable {
            let mmap = unsafe {
                MmapOptions::new()
                    .len(len as usize)
                    .map_mut(&self.file)
                    .map_err(|e| Error::Mmap(e.to_string()))?
            };
            Window::Write(mmap)
        } else {
            let mmap = unsafe {
                MmapOptions::new()
                    .len(len as usize)
                    .map(&self.file)
                    .map_err(|e| Error::Mmap(e.to_string()))?
            };
            Window::Read(mmap)
        };
        self.window = Some(window);
        self.window_len = len;
        Ok(())
    }

    pub fn set_len(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len).map_err(|e| Error::Trunc(e.to_string()))
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().map_err(|e| Error::Sync(e.to_string()))
    }

    /// Read `len` bytes at `offset`, via the mmap window when wholly inside it.
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset + len as u64 <= self.window_len {
            let start = offset as usize;
            match &self.window {
                Some(Window::Write(m)) => return Ok(m[start..start + len].to_vec()),
                Some(Window::Read(m)) => return Ok(m[start..start + len].to_vec()),
                None => {}
            }
        }
        let mut buf = vec![0u8; len];
        self.file
            .read_exact_at(&mut buf, offset)
            .map_err(|e| Error::Read(e.to_string()))?;
        Ok(buf)
    }

    /// Write-through: inside the window, write both the mapping and the file.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if offset + data.len() as u64 <= self.window_len {
            if let Some(Window::Write(m)) = &mut self.window {
                let start = offset as usize;
                m[start..start + data.len()].copy_from_slice(data);
            }
        }
        self.file
            .write_all_at(data, offset)
            .map_err(|e| Error::Write(e.to_string()))
    }
}
