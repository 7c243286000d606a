// This file is part of rvd, a continuous video recording storage engine.
// Copyright (C) 2022 The rvd Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Reading frames back out of a storage file.
//!
//! Readers open their own file handle and lock it shared, so they contend
//! with writers (exclusive) but not with each other. Each query walks
//! dumbdex → ind block → rel block, mapping one block at a time.

use crate::db;
use crate::dumbdex::Dumbdex;
use crate::fs::{self, FileLock};
use crate::indblock::{IndBlock, IndEntry};
use crate::raw;
use crate::relblock::RelBlock;
use crate::writer::{self, FileHeader};
use crate::{MediaFilter, MediaKind};
use base::{bail_t, Error, Time};
use memmap2::Mmap;
use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};

/// One frame returned by a query, with its payload copied out of the mapped
/// block.
#[derive(Clone, Debug)]
pub struct QueryFrame {
    pub ts: Time,
    pub key: bool,
    pub kind: MediaKind,

    /// Head timestamp of the GOP this frame belongs to; useful for seeking
    /// back to the enclosing independently decodable group.
    pub gop_ts: Time,

    pub data: Vec<u8>,
}

/// Frames plus the codec strings of the first ind block each stream kind was
/// seen in.
#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub video_codec_name: Option<String>,
    pub video_codec_parameters: Option<String>,
    pub audio_codec_name: Option<String>,
    pub audio_codec_parameters: Option<String>,
    pub frames: Vec<QueryFrame>,
}

impl QueryResult {
    fn note_codecs(&mut self, block: &IndBlock, kind: MediaKind) {
        match kind {
            MediaKind::Video => {
                if self.video_codec_name.is_none() {
                    self.video_codec_name = Some(block.video_codec_name().to_owned());
                    self.video_codec_parameters =
                        Some(block.video_codec_parameters().to_owned());
                }
            }
            MediaKind::Audio => {
                if self.audio_codec_name.is_none() {
                    self.audio_codec_name = Some(block.audio_codec_name().to_owned());
                    self.audio_codec_parameters =
                        Some(block.audio_codec_parameters().to_owned());
                }
            }
        }
    }
}

pub struct StorageFileReader {
    file: File,
    path: PathBuf,
    header: FileHeader,
    block0: Mmap,
}

impl StorageFileReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_owned();
        let file = File::open(&path)
            .map_err(|e| base::format_err_t!(Unknown, "unable to open {}: {}", path.display(), e))?;
        let header = FileHeader::read(&file)?;
        let block0 = fs::map_block(&file, 0, header.block_size)?;
        let reader = StorageFileReader {
            file,
            path,
            header,
            block0,
        };
        reader.dumbdex()?; // validate the index region before first use.
        Ok(reader)
    }

    fn dumbdex(&self) -> Result<Dumbdex, Error> {
        Dumbdex::new(
            &self.block0[writer::STORAGE_FILE_HEADER_SIZE..],
            self.header.num_blocks as u16,
        )
    }

    fn sdb_path(&self) -> PathBuf {
        self.path.with_extension("sdb")
    }

    /// Walks ind-block entries beginning at the block containing (or
    /// preceding) `start_ts`, calling `f` until it returns false or the
    /// index is exhausted. An empty index is not an error; `f` is simply
    /// never called.
    fn for_each_entry(
        &self,
        start_ts: Time,
        f: &mut dyn FnMut(&IndBlock, &IndEntry) -> Result<bool, Error>,
    ) -> Result<(), Error> {
        let dex = self.dumbdex()?;
        let mut fi = dex.find_lower_bound(start_ts);

        // Blocks are keyed by their first frame's timestamp, so unless the
        // lower bound is an exact hit, the requested range begins inside the
        // previous block. The lower bound may also be the end sentinel when
        // the range starts after the last block head; step back once for
        // that too, but not twice.
        let mut moved = false;
        if !fi.valid() {
            moved = fi.prev();
        }
        let (found_ts, _) = match fi.get() {
            None => return Ok(()), // empty file
            Some(e) => e,
        };
        if !moved && found_ts != start_ts {
            fi.prev();
        }
        let (_, mut block_no) = match fi.get() {
            None => return Ok(()),
            Some(e) => e,
        };

        let mut map = fs::map_block(&self.file, block_no, self.header.block_size)?;
        let mut first_block_of_walk = true;
        loop {
            let ind = IndBlock::new(&map[..])?;
            let mut c = if first_block_of_walk {
                ind.find_lower_bound(start_ts)
            } else {
                ind.begin()
            };
            first_block_of_walk = false;
            while let Some(entry) = c.get() {
                if !f(&ind, &entry)? {
                    return Ok(());
                }
                c.next();
            }
            if !fi.next() {
                return Ok(());
            }
            match fi.get() {
                None => return Ok(()),
                Some((_, b)) => block_no = b,
            }
            map = fs::map_block(&self.file, block_no, self.header.block_size)?;
        }
    }

    /// Returns all frames with `start_ts <= ts < end_ts` whose stream
    /// matches `filter`, plus codec strings. An empty or uncovered range
    /// yields an empty result, not an error.
    pub fn query(
        &self,
        filter: MediaFilter,
        start_ts: Time,
        end_ts: Time,
    ) -> Result<QueryResult, Error> {
        if start_ts >= end_ts {
            bail_t!(InvalidArgument, "query range [{}, {}) is empty", start_ts, end_ts);
        }
        let _lock = FileLock::shared(&self.file)?;
        let mut result = QueryResult::default();
        self.for_each_entry(start_ts, &mut |block, entry| {
            if entry.ts >= end_ts {
                return Ok(false);
            }
            let kind = entry.kind()?;
            if filter.matches(kind) {
                result.note_codecs(block, kind);
                let payload = block.payload(entry)?;
                for rec in RelBlock::new(payload).iter() {
                    result.frames.push(QueryFrame {
                        ts: rec.ts,
                        key: rec.is_key(),
                        kind,
                        gop_ts: entry.ts,
                        data: rec.data.to_vec(),
                    });
                }
            }
            Ok(true)
        })?;
        Ok(result)
    }

    /// Returns the first GOP head at or after `ts` whose stream matches
    /// `filter`. Every ind-block entry is a GOP head, so the returned frame
    /// is independently decodable.
    pub fn query_key(&self, filter: MediaFilter, ts: Time) -> Result<QueryResult, Error> {
        if filter == MediaFilter::All {
            bail_t!(InvalidArgument, "query_key requires a single media kind");
        }
        let _lock = FileLock::shared(&self.file)?;
        let mut result = QueryResult::default();
        self.for_each_entry(ts, &mut |block, entry| {
            let kind = entry.kind()?;
            if !filter.matches(kind) {
                return Ok(true);
            }
            result.note_codecs(block, kind);
            let payload = block.payload(entry)?;
            if let Some(rec) = RelBlock::new(payload).iter().next() {
                result.frames.push(QueryFrame {
                    ts: rec.ts,
                    key: rec.is_key(),
                    kind,
                    gop_ts: entry.ts,
                    data: rec.data.to_vec(),
                });
            }
            Ok(false)
        })?;
        if result.frames.is_empty() {
            bail_t!(NotFound, "no {:?} key frame at or after {}", filter, ts);
        }
        Ok(result)
    }

    /// Returns the head timestamps of matching GOPs in `[start_ts, end_ts)`.
    pub fn key_frame_start_times(
        &self,
        filter: MediaFilter,
        start_ts: Time,
        end_ts: Time,
    ) -> Result<Vec<Time>, Error> {
        if start_ts >= end_ts {
            bail_t!(InvalidArgument, "query range [{}, {}) is empty", start_ts, end_ts);
        }
        let _lock = FileLock::shared(&self.file)?;
        let mut times = Vec::new();
        self.for_each_entry(start_ts, &mut |_block, entry| {
            if entry.ts >= end_ts {
                return Ok(false);
            }
            if filter.matches(entry.kind()?) {
                times.push(entry.ts);
            }
            Ok(true)
        })?;
        Ok(times)
    }

    /// Returns recorded segments overlapping `[start_ts, end_ts)`, clipped
    /// to that window. The live segment's open end is reported as `end_ts`.
    pub fn query_segments(&self, start_ts: Time, end_ts: Time) -> Result<Vec<Range<Time>>, Error> {
        if start_ts >= end_ts {
            bail_t!(InvalidArgument, "query range [{}, {}) is empty", start_ts, end_ts);
        }
        let _lock = FileLock::shared(&self.file)?;
        if self.last_ts_unlocked()?.is_none() {
            return Ok(Vec::new());
        }
        let conn = db::open(&self.sdb_path(), db::Mode::ReadOnly)?;
        let rows = raw::list_segments(&conn, &(start_ts..end_ts))?;
        Ok(rows
            .into_iter()
            .map(|s| {
                let start = std::cmp::max(s.start, start_ts);
                let end = if s.end == Time(0) {
                    end_ts
                } else {
                    std::cmp::min(s.end, end_ts)
                };
                start..end
            })
            .collect())
    }

    /// Timestamp of the first frame in the file, or `None` if empty.
    pub fn first_ts(&self) -> Result<Option<Time>, Error> {
        let _lock = FileLock::shared(&self.file)?;
        self.first_ts_unlocked()
    }

    /// Timestamp of the last frame in the file, or `None` if empty.
    pub fn last_ts(&self) -> Result<Option<Time>, Error> {
        let _lock = FileLock::shared(&self.file)?;
        self.last_ts_unlocked()
    }

    /// As [Self::first_ts], for callers already holding the file lock.
    pub(crate) fn first_ts_unlocked(&self) -> Result<Option<Time>, Error> {
        let (_, block_no) = match self.dumbdex()?.begin().get() {
            None => return Ok(None),
            Some(e) => e,
        };
        let map = fs::map_block(&self.file, block_no, self.header.block_size)?;
        let ind = IndBlock::new(&map[..])?;
        let entry = match ind.begin().get() {
            None => return Ok(None),
            Some(e) => e,
        };
        let payload = ind.payload(&entry)?;
        Ok(RelBlock::new(payload).iter().next().map(|r| r.ts))
    }

    /// As [Self::last_ts], for callers already holding the file lock.
    pub(crate) fn last_ts_unlocked(&self) -> Result<Option<Time>, Error> {
        let mut c = self.dumbdex()?.end();
        c.prev();
        let (_, block_no) = match c.get() {
            None => return Ok(None),
            Some(e) => e,
        };
        let map = fs::map_block(&self.file, block_no, self.header.block_size)?;
        let ind = IndBlock::new(&map[..])?;
        let mut ic = ind.end();
        ic.prev();
        let entry = match ic.get() {
            None => return Ok(None),
            Some(e) => e,
        };
        let payload = ind.payload(&entry)?;
        // Records are variable length, so the last timestamp requires a
        // forward walk over the final rel block.
        Ok(RelBlock::new(payload).iter().last().map(|r| r.ts))
    }
}
