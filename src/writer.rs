// This file is part of rvd, a continuous video recording storage engine.
// Copyright (C) 2022 The rvd Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Writing frames into a storage file and deleting old blocks.
//!
//! The writer assembles GOPs in memory, ordered by head timestamp. When the
//! buffered span exceeds 20 seconds and the earliest GOP can no longer
//! grow, that GOP is committed: a block is claimed through the
//! dumbdex (reusing the oldest block once the file is full) and the GOP's
//! rel block is appended to the block's ind index. The sibling `.sdb` ledger
//! tracks contiguous recorded intervals across sessions and deletions.

use crate::db;
use crate::dumbdex::{self, Dumbdex, DumbdexMut};
use crate::fs::{self, FileLock};
use crate::indblock::{self, IndBlockMut};
use crate::raw;
use crate::reader::StorageFileReader;
use crate::relblock;
use crate::upgrade;
use crate::MediaKind;
use base::{bail_t, Duration, Error, ErrorKind, ResultExt as _, Time};
use byteorder::{ByteOrder, LittleEndian};
use log::{info, warn};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt as _;
use std::os::unix::io::AsRawFd as _;
use std::path::{Path, PathBuf};

/// Bytes reserved at the front of block 0 for the file header
/// (`num_blocks:u32 LE`, `block_size:u32 LE`); the dumbdex region runs from
/// here to the end of block 0.
pub const STORAGE_FILE_HEADER_SIZE: usize = 8;

/// Span of buffered GOP head timestamps beyond which the earliest complete
/// GOP is flushed. Bounds writer memory and the jitter tolerated between
/// video and audio arrival.
const MAX_BUFFERED_SPAN: Duration = Duration(20_000);

/// Upper bound on the entry count chosen for a fresh ind block.
const MAX_IND_ENTRIES: usize = 2_000;

const FIFTY_MB: i64 = 52_428_800;

/// The storage file header at the front of block 0. `num_blocks` counts ind
/// blocks only; the file is `num_blocks + 1` blocks long including block 0.
#[derive(Debug)]
pub(crate) struct FileHeader {
    pub num_blocks: u32,
    pub block_size: u32,
}

impl FileHeader {
    pub(crate) fn read(file: &File) -> Result<FileHeader, Error> {
        let mut buf = [0u8; STORAGE_FILE_HEADER_SIZE];
        file.read_exact_at(&mut buf, 0).map_err(|e| {
            base::format_err_t!(FailedPrecondition, "unable to read storage file header: {}", e)
        })?;
        let h = FileHeader {
            num_blocks: LittleEndian::read_u32(&buf[0..4]),
            block_size: LittleEndian::read_u32(&buf[4..8]),
        };
        if h.num_blocks == 0
            || h.num_blocks > u32::from(u16::MAX)
            || (h.block_size as usize)
                < STORAGE_FILE_HEADER_SIZE + dumbdex::region_size(h.num_blocks as usize)
        {
            bail_t!(
                FailedPrecondition,
                "invalid storage file header: {} blocks of {} bytes",
                h.num_blocks,
                h.block_size
            );
        }
        let expected_len = u64::from(h.num_blocks + 1) * u64::from(h.block_size);
        let actual_len = file.metadata().err_kind(ErrorKind::Unknown)?.len();
        if actual_len < expected_len {
            // Catch this now rather than SIGBUS on a mapped access later.
            bail_t!(
                FailedPrecondition,
                "storage file is {} bytes; header implies {}",
                actual_len,
                expected_len
            );
        }
        Ok(h)
    }
}

/// Codec strings recorded into each fresh ind block's header.
#[derive(Clone, Debug, Default)]
pub struct WriteContext {
    pub video_codec_name: String,
    pub video_codec_parameters: String,
    pub audio_codec_name: String,
    pub audio_codec_parameters: String,
}

/// One in-progress GOP: a rel block being accumulated in memory.
#[derive(Debug)]
struct Gop {
    kind: MediaKind,
    ts: Time,
    complete: bool,
    data: Vec<u8>,
}

/// Write handle to one storage file. Single writer per file; concurrent
/// readers go through [StorageFileReader] with their own handles.
#[derive(Debug)]
pub struct StorageFile {
    file: File,
    path: PathBuf,
    header: FileHeader,
    block0: MmapMut,

    /// Buffered GOPs, sorted ascending by `ts`. Equal timestamps keep
    /// insertion order, so the first GOP to arrive at a timestamp flushes
    /// first.
    gop_buffer: Vec<Gop>,

    /// Mapping of the ind block currently accepting GOPs, if any.
    current_block: Option<MmapMut>,

    /// First and last frame timestamps of this write session.
    first_ts: Option<Time>,
    last_ts: Option<Time>,

    /// Ledger row id of the live segment, once successfully opened.
    segment_id: Option<i64>,
}

fn sdb_path(path: &Path) -> PathBuf {
    path.with_extension("sdb")
}

/// Picks the entry count for a fresh ind block from the GOP that prompted
/// it: enough slots for a block full of similarly sized GOPs, while keeping
/// the entry table under a quarter of the block.
fn ind_entries_for(block_size: u32, gop_len: usize) -> u32 {
    let by_payload = block_size as usize / gop_len.max(1);
    let by_table = block_size as usize / (4 * indblock::ENTRY_SIZE);
    by_payload.min(by_table).min(MAX_IND_ENTRIES).max(1) as u32
}

impl StorageFile {
    /// Creates the storage file and its sibling ledger.
    ///
    /// The file is pre-sized to `num_blocks * block_size` bytes: block 0 for
    /// the header and dumbdex, `num_blocks - 1` ind blocks.
    pub fn allocate<P: AsRef<Path>>(
        path: P,
        block_size: usize,
        num_blocks: usize,
    ) -> Result<(), Error> {
        let path = path.as_ref();
        if num_blocks < 2 || num_blocks - 1 > usize::from(u16::MAX) {
            bail_t!(InvalidArgument, "unusable block count {}", num_blocks);
        }
        let usable = num_blocks - 1;
        if block_size < STORAGE_FILE_HEADER_SIZE + dumbdex::region_size(usable)
            || block_size > u32::MAX as usize
        {
            bail_t!(
                InvalidArgument,
                "block size {} can't hold an index of {} blocks",
                block_size,
                usable
            );
        }
        {
            let mut conn = db::open(&sdb_path(path), db::Mode::ReadWrite)?;
            db::init(&mut conn)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| {
                base::format_err_t!(Unknown, "unable to create {}: {}", path.display(), e)
            })?;
        nix::fcntl::posix_fallocate(file.as_raw_fd(), 0, (num_blocks * block_size) as i64)
            .err_kind(ErrorKind::Unknown)?;
        let mut block0 = fs::map_block_mut(&file, 0, block_size as u32)?;
        for b in &mut block0[..STORAGE_FILE_HEADER_SIZE] {
            *b = 0;
        }
        LittleEndian::write_u32(&mut block0[0..4], usable as u32);
        LittleEndian::write_u32(&mut block0[4..8], block_size as u32);
        dumbdex::allocate(&mut block0[STORAGE_FILE_HEADER_SIZE..], usable as u16)?;
        block0.flush().err_kind(ErrorKind::Unknown)?;
        Ok(())
    }

    /// Opens an allocated storage file for writing, upgrading the ledger
    /// schema and (unless `fix_live_segment` is false) running open-time
    /// recovery for a previous writer that died without [Self::finalize].
    pub fn open<P: AsRef<Path>>(path: P, fix_live_segment: bool) -> Result<Self, Error> {
        let path = path.as_ref().to_owned();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                base::format_err_t!(Unknown, "unable to open {}: {}", path.display(), e)
            })?;
        let header = FileHeader::read(&file)?;
        let block0 = fs::map_block_mut(&file, 0, header.block_size)?;
        Dumbdex::new(&block0[STORAGE_FILE_HEADER_SIZE..], header.num_blocks as u16)?;
        let mut this = StorageFile {
            file,
            path,
            header,
            block0,
            gop_buffer: Vec::new(),
            current_block: None,
            first_ts: None,
            last_ts: None,
            segment_id: None,
        };
        this.upgrade_ledger()?;
        if fix_live_segment {
            this.fix_live_segment()?;
        }
        Ok(this)
    }

    /// Pure value constructor for the codec strings written into fresh ind
    /// blocks.
    pub fn create_write_context(
        video_codec_name: &str,
        video_codec_parameters: Option<&str>,
        audio_codec_name: Option<&str>,
        audio_codec_parameters: Option<&str>,
    ) -> WriteContext {
        WriteContext {
            video_codec_name: video_codec_name.to_owned(),
            video_codec_parameters: video_codec_parameters.unwrap_or("").to_owned(),
            audio_codec_name: audio_codec_name.unwrap_or("").to_owned(),
            audio_codec_parameters: audio_codec_parameters.unwrap_or("").to_owned(),
        }
    }

    fn sdb_path(&self) -> PathBuf {
        sdb_path(&self.path)
    }

    /// Opens the ledger read-write and runs `f`, retrying once on failure.
    /// Transient SQLite errors (e.g. a reader holding the database busy past
    /// the timeout) usually clear by the second attempt.
    fn with_ledger<T, F>(&self, mut f: F) -> Result<T, Error>
    where
        F: FnMut(&mut rusqlite::Connection) -> Result<T, Error>,
    {
        let mut conn = db::open(&self.sdb_path(), db::Mode::ReadWrite)?;
        match f(&mut conn) {
            Ok(t) => Ok(t),
            Err(e) => {
                warn!("ledger operation failed, retrying once: {}", e);
                f(&mut conn)
            }
        }
    }

    fn upgrade_ledger(&self) -> Result<(), Error> {
        let mut conn = db::open(&self.sdb_path(), db::Mode::ReadWrite)?;
        let tables: i32 = conn
            .query_row(
                "select count(*) from sqlite_master where name = 'segments'",
                [],
                |row| row.get(0),
            )
            .err_kind(ErrorKind::Internal)?;
        if tables == 0 {
            // Missing or empty ledger (e.g. deleted out from under us);
            // start fresh at the current version rather than failing open.
            warn!("ledger {} has no segments table; initializing", self.sdb_path().display());
            return db::init(&mut conn);
        }
        upgrade::run(&mut conn)
    }

    /// Closes any live ledger row at the file's observed last timestamp,
    /// then drops index entries the ledger no longer covers (a crash between
    /// ledger commit and index update in [Self::remove_blocks] leaves some).
    fn fix_live_segment(&mut self) -> Result<(), Error> {
        let reader = StorageFileReader::open(&self.path)?;
        if let Some(last) = reader.last_ts()? {
            let n = self.with_ledger(|conn| raw::close_live_segments(conn, last))?;
            if n > 0 {
                info!("closed {} live segment(s) at {}", n, last);
            }
        }
        self.remove_orphaned_blocks()
    }

    fn remove_orphaned_blocks(&mut self) -> Result<(), Error> {
        let segments = {
            let conn = db::open(&self.sdb_path(), db::Mode::ReadOnly)?;
            raw::list_segments(&conn, &(Time::MIN..Time::MAX))?
        };
        if segments.is_empty() {
            return Ok(());
        }
        let first_start = segments[0].start;
        let mut live = false;
        let mut last_end = Time::MIN;
        for s in &segments {
            if s.end == Time(0) {
                live = true;
            } else if s.end > last_end {
                last_end = s.end;
            }
        }
        let mut orphans = Vec::new();
        {
            let dex = Dumbdex::new(
                &self.block0[STORAGE_FILE_HEADER_SIZE..],
                self.header.num_blocks as u16,
            )?;
            let mut c = dex.begin();
            while let Some((ts, _)) = c.get() {
                // Only entries strictly inside the ledger's span are
                // considered orphaned; anything before the first segment or
                // past the last close is left alone.
                let in_span = ts >= first_start && (live || ts <= last_end);
                let covered = segments
                    .iter()
                    .any(|s| s.start <= ts && (s.end == Time(0) || ts <= s.end));
                if in_span && !covered {
                    orphans.push(ts);
                }
                c.next();
            }
        }
        if !orphans.is_empty() {
            warn!(
                "removing {} index entries in ledger gaps (incomplete earlier deletion)",
                orphans.len()
            );
            let mut dex = DumbdexMut::new(
                &mut self.block0[STORAGE_FILE_HEADER_SIZE..],
                self.header.num_blocks as u16,
            )?;
            for ts in orphans {
                dex.remove(ts);
            }
        }
        Ok(())
    }

    /// Ingests one frame.
    ///
    /// A key frame completes every older unfinished GOP of its kind and
    /// starts a new one; a non-key frame extends the most recent unfinished
    /// GOP of its kind, failing with `FailedPrecondition` when there is none
    /// (the frame is dropped; the stream recovers at its next key frame).
    /// Frames don't reach disk until their GOP falls out of the buffered
    /// window or [Self::finalize] runs.
    pub fn write_frame(
        &mut self,
        ctx: &WriteContext,
        kind: MediaKind,
        data: &[u8],
        key: bool,
        ts: Time,
    ) -> Result<(), Error> {
        let _lock = FileLock::exclusive(&self.file)?;
        if self.first_ts.is_none() {
            self.first_ts = Some(ts);
        }
        if self.segment_id.is_none() {
            // A failure here is deliberately non-fatal: frames keep being
            // written and the row is opened on a later frame, giving the
            // segment a slightly late start.
            match self.with_ledger(|conn| raw::insert_segment(conn, ts)) {
                Ok(id) => self.segment_id = Some(id),
                Err(e) => warn!("unable to open segment row (will retry): {}", e),
            }
        }
        self.last_ts = Some(ts);

        let record_len = data.len() + relblock::PER_RECORD_OVERHEAD;
        if key {
            for gop in &mut self.gop_buffer {
                if gop.kind == kind && !gop.complete {
                    gop.complete = true;
                }
            }
            if record_len > self.header.block_size as usize {
                bail_t!(
                    ResourceExhausted,
                    "{}-byte key frame at {} exceeds the {}-byte block size",
                    data.len(),
                    ts,
                    self.header.block_size
                );
            }
            let mut buf = Vec::with_capacity(record_len);
            relblock::append(&mut buf, data, ts, relblock::FLAG_KEY);
            // Upper bound keeps the first GOP to arrive at a timestamp ahead
            // of later arrivals at the same timestamp.
            let pos = self.gop_buffer.partition_point(|g| g.ts <= ts);
            self.gop_buffer.insert(
                pos,
                Gop {
                    kind,
                    ts,
                    complete: false,
                    data: buf,
                },
            );
        } else {
            let block_size = self.header.block_size as usize;
            let gop = match self
                .gop_buffer
                .iter_mut()
                .rev()
                .find(|g| g.kind == kind && !g.complete)
            {
                Some(g) => g,
                None => bail_t!(
                    FailedPrecondition,
                    "no unfinished {:?} GOP to accept non-key frame at {}",
                    kind,
                    ts
                ),
            };
            if gop.data.len() + record_len > block_size {
                bail_t!(
                    ResourceExhausted,
                    "GOP at {} grew past the {}-byte block size",
                    gop.ts,
                    block_size
                );
            }
            relblock::append(&mut gop.data, data, ts, 0);
        }

        while self.buffer_full() {
            self.flush_earliest(ctx)?;
        }
        Ok(())
    }

    /// True when the buffered window is long enough to give stragglers up
    /// on the earliest GOP. Requires that GOP to be complete, so an
    /// unfinished tail (e.g. audio that stopped mid-group) can't stall the
    /// flush loop.
    fn buffer_full(&self) -> bool {
        if self.gop_buffer.len() < 2 {
            return false;
        }
        let oldest = &self.gop_buffer[0];
        let newest = &self.gop_buffer[self.gop_buffer.len() - 1];
        newest.ts - oldest.ts > MAX_BUFFERED_SPAN && oldest.complete
    }

    /// Commits the earliest buffered GOP to the current ind block, claiming
    /// and initializing a new block when needed.
    fn flush_earliest(&mut self, ctx: &WriteContext) -> Result<(), Error> {
        let (gop_ts, gop_len) = {
            let gop = match self.gop_buffer.first() {
                Some(g) => g,
                None => bail_t!(Internal, "flush with empty GOP buffer"),
            };
            (gop.ts, gop.data.len())
        };
        let fits = match self.current_block.as_mut() {
            Some(map) => IndBlockMut::new(&mut map[..])?.fits(gop_len),
            None => false,
        };
        if !fits {
            if let Some(old) = self.current_block.take() {
                if let Err(e) = old.flush() {
                    warn!("unable to flush retired ind block: {}", e);
                }
            }
            // Claiming a block is also the moment to drop ledger rows whose
            // data the ring has already reclaimed.
            if let Err(e) = self.prune_reclaimed_segments() {
                warn!("unable to prune reclaimed segments: {}", e);
            }
            let mut map = self.claim_block(ctx, gop_ts, gop_len)?;
            if !IndBlockMut::new(&mut map[..])?.fits(gop_len) {
                bail_t!(
                    Internal,
                    "{}-byte GOP doesn't fit a fresh {}-byte block",
                    gop_len,
                    self.header.block_size
                );
            }
            self.current_block = Some(map);
        }
        let gop = self.gop_buffer.remove(0);
        let map = match self.current_block.as_mut() {
            Some(m) => m,
            None => bail_t!(Internal, "no current block after claim"),
        };
        let r = IndBlockMut::new(&mut map[..])
            .and_then(|mut b| b.append(&gop.data, gop.kind, gop.ts));
        if let Err(e) = r {
            self.gop_buffer.insert(0, gop);
            return Err(e);
        }
        Ok(())
    }

    fn claim_block(&mut self, ctx: &WriteContext, ts: Time, gop_len: usize) -> Result<MmapMut, Error> {
        let block = {
            let mut dex = DumbdexMut::new(
                &mut self.block0[STORAGE_FILE_HEADER_SIZE..],
                self.header.num_blocks as u16,
            )?;
            dex.insert(ts)?
        };
        let mut map = fs::map_block_mut(&self.file, block, self.header.block_size)?;
        indblock::initialize(
            &mut map[..],
            ind_entries_for(self.header.block_size, gop_len),
            ts,
            &ctx.video_codec_name,
            &ctx.video_codec_parameters,
            &ctx.audio_codec_name,
            &ctx.audio_codec_parameters,
        )?;
        Ok(map)
    }

    fn prune_reclaimed_segments(&self) -> Result<(), Error> {
        // The exclusive file lock is already held, so go through the
        // lock-free reader path.
        let reader = StorageFileReader::open(&self.path)?;
        if let Some(first) = reader.first_ts_unlocked()? {
            let conn = db::open(&self.sdb_path(), db::Mode::ReadWrite)?;
            raw::delete_finished_before(&conn, first)?;
        }
        Ok(())
    }

    /// Ends the write session: closes the live ledger row at the last
    /// written timestamp and drains every buffered GOP, oldest first,
    /// without the buffered-window gate.
    pub fn finalize(&mut self, ctx: &WriteContext) -> Result<(), Error> {
        let _lock = FileLock::exclusive(&self.file)?;
        if let Some(id) = self.segment_id.take() {
            let end = self.last_ts.unwrap_or(Time(0));
            self.with_ledger(|conn| raw::close_segment(conn, id, end))?;
        }
        while !self.gop_buffer.is_empty() {
            self.flush_earliest(ctx)?;
        }
        if let Some(map) = self.current_block.as_ref() {
            if let Err(e) = map.flush() {
                warn!("unable to flush final ind block: {}", e);
            }
        }
        Ok(())
    }

    /// Deletes every block whose indexed head timestamp lies in
    /// `[start_ts, end_ts)`, updating the ledger in one transaction before
    /// touching the index. Returns the number of blocks removed.
    ///
    /// Deletion is rounded outward to block boundaries: the effective range
    /// runs from the first indexed head at or after `start_ts` to the first
    /// at or after `end_ts`. Ranges touching fewer than one whole block
    /// remove nothing.
    pub fn remove_blocks(&mut self, start_ts: Time, end_ts: Time) -> Result<usize, Error> {
        if start_ts >= end_ts {
            bail_t!(
                InvalidArgument,
                "remove_blocks range [{}, {}) is empty",
                start_ts,
                end_ts
            );
        }
        let _lock = FileLock::exclusive(&self.file)?;
        let (to_delete, eff) = {
            let dex = Dumbdex::new(
                &self.block0[STORAGE_FILE_HEADER_SIZE..],
                self.header.num_blocks as u16,
            )?;
            let mut start = dex.find_lower_bound(start_ts);
            let end = dex.find_lower_bound(end_ts);
            if !start.valid() || !end.valid() || start == end {
                return Ok(0);
            }
            let mut to_delete = Vec::new();
            while start != end {
                match start.get() {
                    Some((ts, _)) => to_delete.push(ts),
                    None => break,
                }
                start.next();
            }
            let eff_end = match end.get() {
                Some((ts, _)) => ts,
                None => bail_t!(Internal, "remove_blocks end cursor went invalid"),
            };
            let eff_start = match to_delete.first() {
                Some(&ts) => ts,
                None => return Ok(0),
            };
            (to_delete, eff_start..eff_end)
        };
        // Ledger first: a crash after the commit but before the index
        // catches up is repaired by the next open's recovery scan.
        self.with_ledger(|conn| raw::delete_range(conn, &eff))?;
        let mut dex = DumbdexMut::new(
            &mut self.block0[STORAGE_FILE_HEADER_SIZE..],
            self.header.num_blocks as u16,
        )?;
        for ts in &to_delete {
            dex.remove(*ts);
        }
        Ok(to_delete.len())
    }

    /// Sizes a storage file for the given retention and stream byte rate:
    /// `(block count, block size)`. The 50 MiB block size keeps mappings
    /// aligned for platforms that require 65536-byte multiples; two extra
    /// blocks cover the header block and in-flight reuse.
    pub fn required_file_size_for_retention_hours(
        retention_hours: i64,
        byte_rate: i64,
    ) -> (i64, i64) {
        const FUDGE_BLOCKS: i64 = 2;
        let natural_byte_size = byte_rate * 60 * 60 * retention_hours;
        (natural_byte_size / FIFTY_MB + FUDGE_BLOCKS, FIFTY_MB)
    }
}
