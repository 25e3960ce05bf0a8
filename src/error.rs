//! Error kinds shared by every back-end, and the handle-global last-error cell.

use std::sync::atomic::{AtomicU8, Ordering};

/// Every failure kind a store operation can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorKind {
    Success = 0,
    Thread,
    InvalidOp,
    NoFile,
    NoPerm,
    Meta,
    RHead,
    Open,
    Close,
    Trunc,
    Sync,
    Stat,
    Seek,
    Read,
    Write,
    Mmap,
    Lock,
    Unlink,
    Rename,
    Mkdir,
    Rmdir,
    Keep,
    NoRec,
    Misc,
}

impl ErrorKind {
    pub fn as_code(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("operation not valid for this back-end")]
    InvalidOp,
    #[error("no such file: {0}")]
    NoFile(String),
    #[error("permission denied: {0}")]
    NoPerm(String),
    #[error("bad magic / corrupt header")]
    Meta,
    #[error("corrupt record header")]
    RHead,
    #[error("open failed: {0}")]
    Open(String),
    #[error("close failed: {0}")]
    Close(String),
    #[error("truncate failed: {0}")]
    Trunc(String),
    #[error("sync failed: {0}")]
    Sync(String),
    #[error("stat failed: {0}")]
    Stat(String),
    #[error("seek failed: {0}")]
    Seek(String),
    #[error("read failed: {0}")]
    Read(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("mmap failed: {0}")]
    Mmap(String),
    #[error("lock held by another writer")]
    Lock,
    #[error("unlink failed: {0}")]
    Unlink(String),
    #[error("rename failed: {0}")]
    Rename(String),
    #[error("record already exists")]
    Keep,
    #[error("record not found")]
    NoRec,
    #[error("misc: {0}")]
    Misc(String),
    #[error("handle is latched after a fatal write failure")]
    Fatal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidOp => ErrorKind::InvalidOp,
            Error::NoFile(_) => ErrorKind::NoFile,
            Error::NoPerm(_) => ErrorKind::NoPerm,
            Error::Meta => ErrorKind::Meta,
            Error::RHead => ErrorKind::RHead,
            Error::Open(_) => ErrorKind::Open,
            Error::Close(_) => ErrorKind::Close,
            Error::Trunc(_) => ErrorKind::Trunc,
            Error::Sync(_) => ErrorKind::Sync,
            Error::Stat(_) => ErrorKind::Stat,
            Error::Seek(_) => ErrorKind::Seek,
            Error::Read(_) => ErrorKind::Read,
            Error::Write(_) => ErrorKind::Write,
            Error::Mmap(_) => ErrorKind::Mmap,
            Error::Lock => ErrorKind::Lock,
            Error::Unlink(_) => ErrorKind::Unlink,
            Error::Rename(_) => ErrorKind::Rename,
            Error::Keep => ErrorKind::Keep,
            Error::NoRec => ErrorKind::NoRec,
            Error::Misc(_) => ErrorKind::Misc,
            Error::Fatal => ErrorKind::InvalidOp,
        }
    }

    /// Business failures that never latch the handle's fatal flag.
    pub fn is_benign(&self) -> bool {
        matches!(self, Error::Keep | Error::NoRec)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Read(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Handle-global last-error cell (spec: "handle-global for the local stores").
#[derive(Debug, Default)]
pub struct LastError {
    code: AtomicU8,
}

impl LastError {
    pub fn new() -> Self {
        Self {
            code: AtomicU8::new(ErrorKind::Success as u8),
        }
    }

    pub fn set(&self, kind: ErrorKind) {
        self.code.store(kind as u8, Ordering::Relaxed);
    }

    pub fn get(&self) -> u8 {
        self.code.load(Ordering::Relaxed)
    }
}
