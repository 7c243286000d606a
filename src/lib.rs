// This file is part of rvd, a continuous video recording storage engine.
// Copyright (C) 2022 The rvd Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Per-camera circular storage: a pre-allocated `.rvd` file holding
//! interleaved video and audio frames in fixed-size blocks, plus a sibling
//! `.sdb` SQLite ledger of recorded time segments.
//!
//! Layering, leaves first: [relblock] packs frames into a GOP's byte region,
//! [indblock] indexes the GOPs within one storage block, [dumbdex] maps GOP
//! head timestamps to block numbers (reusing the oldest block when full),
//! and [writer] and [reader] tie these together with the segment ledger.

use base::bail_t;

mod db;
pub mod dumbdex;
mod fs;
pub mod indblock;
mod raw;
pub mod reader;
pub mod relblock;
pub mod upgrade;
pub mod writer;

// This is only for #[cfg(test)], but it's also used by dependent crates' tests, and it appears
// that #[cfg(test)] is not passed on to dependencies.
pub mod testutil;

pub use crate::reader::{QueryFrame, QueryResult, StorageFileReader};
pub use crate::writer::{StorageFile, WriteContext};

/// The kind of elementary stream a frame belongs to.
///
/// The discriminant is the on-disk `stream_id` of ind-block entries.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum MediaKind {
    Video = 0,
    Audio = 1,
}

impl MediaKind {
    pub(crate) fn stream_id(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_stream_id(id: u8) -> Result<Self, base::Error> {
        match id {
            0 => Ok(MediaKind::Video),
            1 => Ok(MediaKind::Audio),
            _ => bail_t!(DataLoss, "invalid stream id {} on disk", id),
        }
    }
}

/// A query-side stream filter: one kind, or everything in the file.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MediaFilter {
    Video,
    Audio,
    All,
}

impl MediaFilter {
    pub(crate) fn matches(self, kind: MediaKind) -> bool {
        match self {
            MediaFilter::Video => kind == MediaKind::Video,
            MediaFilter::Audio => kind == MediaKind::Audio,
            MediaFilter::All => true,
        }
    }
}

impl From<MediaKind> for MediaFilter {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Video => MediaFilter::Video,
            MediaKind::Audio => MediaFilter::Audio,
        }
    }
}
