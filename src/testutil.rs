// This file is part of rvd, a continuous video recording storage engine.
// Copyright (C) 2022 The rvd Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Utilities for automated testing of the storage engine.

use crate::writer::StorageFile;
use std::path::PathBuf;
use tempfile::TempDir;

/// A freshly allocated storage file (and sibling ledger) in a temporary
/// directory which is removed on drop.
pub struct TestFile {
    pub tmpdir: TempDir,
    pub path: PathBuf,
}

impl TestFile {
    pub fn new(block_size: usize, num_blocks: usize) -> TestFile {
        let tmpdir = tempfile::Builder::new()
            .prefix("rvd-test")
            .tempdir()
            .unwrap();
        let path = tmpdir.path().join("camera.rvd");
        StorageFile::allocate(&path, block_size, num_blocks).unwrap();
        TestFile { tmpdir, path }
    }
}

/// Small deterministic xorshift generator, so tests that want arbitrary-ish
/// values stay reproducible.
pub struct Rng(u64);

impl Rng {
    pub fn new(seed: u64) -> Rng {
        Rng(seed | 1)
    }

    pub fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    pub fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}
