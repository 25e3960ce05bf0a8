//! Advisory file locking via `flock(2)` (spec §5), in the spirit of the
//! teacher's `shm::lock` reach for POSIX primitives through `libc`.

use std::fs::File;
use std::os::unix::io::AsRawFd;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Takes the advisory lock appropriate for `mode`. `non_blocking` maps to
/// `mode=f` (LOCK_NB, fail fast with `Error::Lock`); `skip` maps to
/// `mode=e` (no lock taken at all).
pub fn flock(file: &File, mode: LockMode, non_blocking: bool, skip: bool) -> Result<()> {
    if skip {
        return Ok(());
    }
    let op = match mode {
        LockMode::Shared => libc::LOCK_SH,
        LockMode::Exclusive => libc::LOCK_EX,
    };
    let op = if non_blocking { op | libc::LOCK_NB } else { op };
    let ret = unsafe { libc::flock(file.as_raw_fd(), op) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        if non_blocking && err.kind() == std::io::ErrorKind::WouldBlock {
            return Err(Error::Lock);
        }
        return Err(Error::Lock);
    }
    Ok(())
}

pub fn unlock(file: &File) {
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}
