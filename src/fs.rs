// This file is part of rvd, a continuous video recording storage engine.
// Copyright (C) 2022 The rvd Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Advisory file locking and block mapping helpers.

use base::{Error, ErrorKind, ResultExt};
use log::warn;
use memmap2::{Mmap, MmapMut, MmapOptions};
use nix::fcntl::FlockArg;
use std::fs::File;
use std::os::unix::io::AsRawFd;

/// A scoped `flock` on a storage file.
///
/// Every public operation on one storage file holds one of these for its full
/// duration: shared for readers, exclusive for writers, deleters, and
/// finalizers. The lock is tied to the open file description, so separate
/// handles to the same file contend as expected while re-locking through the
/// same handle does not. Holds the raw fd rather than a `&File` so the owner
/// can keep mutating its own fields while locked; the guard must not outlive
/// the `File` it was created from.
pub(crate) struct FileLock {
    fd: std::os::unix::io::RawFd,
}

impl FileLock {
    pub(crate) fn exclusive(file: &File) -> Result<Self, Error> {
        let fd = file.as_raw_fd();
        nix::fcntl::flock(fd, FlockArg::LockExclusive).err_kind(ErrorKind::Unknown)?;
        Ok(FileLock { fd })
    }

    pub(crate) fn shared(file: &File) -> Result<Self, Error> {
        let fd = file.as_raw_fd();
        nix::fcntl::flock(fd, FlockArg::LockShared).err_kind(ErrorKind::Unknown)?;
        Ok(FileLock { fd })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = nix::fcntl::flock(self.fd, FlockArg::Unlock) {
            warn!("unable to unlock storage file: {}", e);
        }
    }
}

/// Maps one `block_size`-sized block of the storage file read-only.
pub(crate) fn map_block(file: &File, block: u16, block_size: u32) -> Result<Mmap, Error> {
    let offset = u64::from(block) * u64::from(block_size);
    unsafe {
        MmapOptions::new()
            .offset(offset)
            .len(block_size as usize)
            .map(file)
    }
    .err_kind(ErrorKind::Unknown)
}

/// Maps one block read-write with `MAP_SHARED` semantics, so stores are
/// visible to concurrent read-only mappings of the same file.
pub(crate) fn map_block_mut(file: &File, block: u16, block_size: u32) -> Result<MmapMut, Error> {
    let offset = u64::from(block) * u64::from(block_size);
    unsafe {
        MmapOptions::new()
            .offset(offset)
            .len(block_size as usize)
            .map_mut(file)
    }
    .err_kind(ErrorKind::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_writes_are_shared() {
        let tmpdir = tempfile::tempdir().unwrap();
        let path = tmpdir.path().join("blocks");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        file.set_len(8192).unwrap();
        let mut rw = map_block_mut(&file, 1, 4096).unwrap();
        rw[0] = 0xab;
        let ro = map_block(&file, 1, 4096).unwrap();
        assert_eq!(ro[0], 0xab);
    }

    #[test]
    fn lock_and_relock() {
        let tmpdir = tempfile::tempdir().unwrap();
        let path = tmpdir.path().join("locked");
        let file = std::fs::File::create(&path).unwrap();
        {
            let _l = FileLock::exclusive(&file).unwrap();
        }
        let _l = FileLock::shared(&file).unwrap();
    }
}
