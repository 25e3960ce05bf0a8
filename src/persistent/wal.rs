//! Write-ahead update log for transactions and crash recovery (spec §4.1.5, §6).
//!
//! Entries are appended as `(1-byte op-code, 4-byte little-endian length,
//! payload)`. `Set` carries the previous bytes at an offset so abort can
//! restore them; `Resize` carries the previous file size so abort can
//! truncate growth away.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::persistent::region::Region;

const OP_SET: u8 = 1;
const OP_RESIZE: u8 = 2;

pub enum LogEntry {
    Set { offset: u64, prev_bytes: Vec<u8> },
    Resize { prev_size: u64 },
}

pub struct Wal {
    path: PathBuf,
    file: File,
}

impl Wal {
    pub fn log_path_for(main_path: &Path) -> PathBuf {
        let mut p = main_path.as_os_str().to_owned();
        p.push(".wal");
        PathBuf::from(p)
    }

    /// Start (or resume) a transaction's log at a fresh generation.
    pub fn begin(main_path: &Path) -> Result<Self> {
        let path = Self::log_path_for(main_path);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::Open(e.to_string()))?;
        Ok(Wal { path, file })
    }

    /// Open the log left behind by a crash, for recovery. Returns `None`
    /// if there is nothing to recover.
    pub fn open_existing(main_path: &Path) -> Result<Option<Self>> {
        let path = Self::log_path_for(main_path);
        if !path.exists() {
            return Ok(None);
        }
        let meta = fs::metadata(&path).map_err(|e| Error::Stat(e.to_string()))?;
        if meta.len() == 0 {
            let _ = fs::remove_file(&path);
            return Ok(None);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::Open(e.to_string()))?;
        Ok(Some(Wal { path, file }))
    }

    pub fn log_set(&mut self, offset: u64, prev_bytes: &[u8]) -> Result<()> {
        let mut payload = Vec::with_capacity(8 + prev_bytes.len());
        payload.extend_from_slice(&offset.to_le_bytes());
        payload.extend_from_slice(prev_bytes);
        self.append(OP_SET, &payload)
    }

    pub fn log_resize(&mut self, prev_size: u64) -> Result<()> {
        self.append(OP_RESIZE, &prev_size.to_le_bytes())
    }

    fn append(&mut self, op: u8, payload: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(5 + payload.len());
        buf.push(op);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);
        self.file.write_all(&buf).map_err(|e| Error::Write(e.to_string()))
    }

    fn read_all(&mut self) -> Result<Vec<LogEntry>> {
        use std::io::Seek;
        self.file.seek(std::io::SeekFrom::Start(0)).map_err(|e| Error::Seek(e.to_string()))?;
        let mut data = Vec::new();
        self.file.read_to_end(&mut data).map_err(|e| Error::Read(e.to_string()))?;

        let mut entries = Vec::new();
        let mut pos = 0;
        while pos + 5 <= data.len() {
            let op = data[pos];
            let len = u32::from_le_bytes(data[pos + 1..pos + 5].try_into().unwrap()) as usize;
            pos += 5;
            if pos + len > data.len() {
                break; // truncated tail from a crash mid-append; stop here
            }
            let payload = &data[pos..pos + len];
            pos += len;
            match op {
                OP_SET => {
                    let offset = u64::from_le_bytes(payload[0..8].try_into().unwrap());
                    entries.push(LogEntry::Set {
                        offset,
                        prev_bytes: payload[8..].to_vec(),
                    });
                }
                OP_RESIZE => {
                    let prev_size = u64::from_le_bytes(payload[0..8].try_into().unwrap());
                    entries.push(LogEntry::Resize { prev_size });
                }
                _ => break,
            }
        }
        Ok(entries)
    }

    /// Commit: caller has already flushed the main file; truncate the log.
    pub fn commit(self) -> Result<()> {
        drop(self.file);
        fs::remove_file(&self.path).map_err(|e| Error::Trunc(e.to_string()))
    }

    /// Abort: replay entries in reverse against `region`, restoring prior state.
    pub fn abort(mut self, region: &mut Region) -> Result<()> {
        let entries = self.read_all()?;
        for entry in entries.into_iter().rev() {
            match entry {
                LogEntry::Set { offset, prev_bytes } => {
                    region.write(offset, &prev_bytes)?;
                }
                LogEntry::Resize { prev_size } => {
                    region.set_len(prev_size)?;
                }
            }
        }
        drop(self.file);
        fs::remove_file(&self.path).map_err(|e| Error::Trunc(e.to_string()))
    }
}
