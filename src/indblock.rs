// This file is part of rvd, a continuous video recording storage engine.
// Copyright (C) 2022 The rvd Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Ind blocks: one per storage block, a fixed-count index of GOP entries
//! (each pointing at a rel block later in the same storage block) plus the
//! codec metadata needed to decode them.
//!
//! On-disk layout:
//!
//! ```text
//! n_entries:u32 | n_valid:u32 | base_time:i64
//! len:u16 + video codec name | len:u16 + video codec parameters
//! len:u16 + audio codec name | len:u16 + audio codec parameters
//! entry[0] .. entry[n_entries-1]     (18 bytes each, zeroed until valid)
//! rel block payload, growing upward
//! ```
//!
//! Entries are `ts:i64 | offset:u32 | size:u32 | stream_id:u8 | flags:u8`,
//! appended in timestamp order; `offset` is relative to the block start.

use crate::relblock;
use crate::MediaKind;
use base::{bail_t, Error, Time};
use byteorder::{ByteOrder, LittleEndian};

/// Size of one index entry on disk.
pub const ENTRY_SIZE: usize = 18;

const FIXED_HEADER_SIZE: usize = 16;

/// One index entry, decoded.
#[derive(Copy, Clone, Debug)]
pub struct IndEntry {
    pub ts: Time,
    pub offset: u32,
    pub size: u32,
    pub stream_id: u8,
    pub flags: u8,
}

impl IndEntry {
    pub fn kind(&self) -> Result<MediaKind, Error> {
        MediaKind::from_stream_id(self.stream_id)
    }

    pub fn is_key(&self) -> bool {
        self.flags & relblock::FLAG_KEY != 0
    }
}

/// Writes a fresh ind-block header into `buf`, zeroing the entry table.
///
/// `buf` must be a full storage block; fails with `InvalidArgument` when the
/// header and entry table would not leave any payload room.
pub fn initialize(
    buf: &mut [u8],
    n_entries: u32,
    base_time: Time,
    video_codec_name: &str,
    video_codec_parameters: &str,
    audio_codec_name: &str,
    audio_codec_parameters: &str,
) -> Result<(), Error> {
    let strings = [
        video_codec_name,
        video_codec_parameters,
        audio_codec_name,
        audio_codec_parameters,
    ];
    for s in &strings {
        if s.len() > usize::from(u16::MAX) {
            bail_t!(InvalidArgument, "codec string of {} bytes too long", s.len());
        }
    }
    let entries_off =
        FIXED_HEADER_SIZE + strings.iter().map(|s| 2 + s.len()).sum::<usize>();
    let payload_off = entries_off + n_entries as usize * ENTRY_SIZE;
    if n_entries == 0 || payload_off >= buf.len() {
        bail_t!(
            InvalidArgument,
            "{} entries and {} bytes of codec strings don't fit a {}-byte block",
            n_entries,
            entries_off - FIXED_HEADER_SIZE,
            buf.len()
        );
    }
    LittleEndian::write_u32(&mut buf[0..4], n_entries);
    LittleEndian::write_u32(&mut buf[4..8], 0); // n_valid
    LittleEndian::write_i64(&mut buf[8..16], base_time.0);
    let mut pos = FIXED_HEADER_SIZE;
    for s in &strings {
        LittleEndian::write_u16(&mut buf[pos..pos + 2], s.len() as u16);
        pos += 2;
        buf[pos..pos + s.len()].copy_from_slice(s.as_bytes());
        pos += s.len();
    }
    for b in &mut buf[entries_off..payload_off] {
        *b = 0;
    }
    Ok(())
}

fn read_str<'a>(buf: &'a [u8], pos: &mut usize) -> Result<&'a str, Error> {
    if *pos + 2 > buf.len() {
        bail_t!(DataLoss, "ind block header truncated at offset {}", *pos);
    }
    let len = LittleEndian::read_u16(&buf[*pos..*pos + 2]) as usize;
    *pos += 2;
    if *pos + len > buf.len() {
        bail_t!(DataLoss, "ind block codec string overruns block");
    }
    let s = std::str::from_utf8(&buf[*pos..*pos + len])
        .map_err(|_| base::format_err_t!(DataLoss, "ind block codec string is not UTF-8"))?;
    *pos += len;
    Ok(s)
}

/// Header fields common to the read and write views, validated once at
/// construction.
#[derive(Copy, Clone, Debug)]
struct Header {
    n_entries: u32,
    n_valid: u32,
    base_time: Time,
    entries_off: usize,
}

fn read_header(buf: &[u8]) -> Result<Header, Error> {
    if buf.len() < FIXED_HEADER_SIZE {
        bail_t!(DataLoss, "ind block of {} bytes too short", buf.len());
    }
    let n_entries = LittleEndian::read_u32(&buf[0..4]);
    let n_valid = LittleEndian::read_u32(&buf[4..8]);
    let base_time = Time(LittleEndian::read_i64(&buf[8..16]));
    let mut pos = FIXED_HEADER_SIZE;
    for _ in 0..4 {
        read_str(buf, &mut pos)?;
    }
    let entries_off = pos;
    if n_valid > n_entries {
        bail_t!(
            DataLoss,
            "ind block claims {} valid of {} entries",
            n_valid,
            n_entries
        );
    }
    if entries_off + n_entries as usize * ENTRY_SIZE > buf.len() {
        bail_t!(DataLoss, "ind block entry table overruns block");
    }
    Ok(Header {
        n_entries,
        n_valid,
        base_time,
        entries_off,
    })
}

fn decode_entry(buf: &[u8], entries_off: usize, i: u32) -> IndEntry {
    let off = entries_off + i as usize * ENTRY_SIZE;
    let e = &buf[off..off + ENTRY_SIZE];
    IndEntry {
        ts: Time(LittleEndian::read_i64(&e[0..8])),
        offset: LittleEndian::read_u32(&e[8..12]),
        size: LittleEndian::read_u32(&e[12..16]),
        stream_id: e[16],
        flags: e[17],
    }
}

/// Binary search for the first valid entry with `ts >= want`; ties resolve
/// to the lowest index. Returns `n_valid` when there is none.
fn lower_bound(buf: &[u8], h: &Header, want: Time) -> u32 {
    let (mut lo, mut hi) = (0, h.n_valid);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if decode_entry(buf, h.entries_off, mid).ts < want {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// A read-only view of one ind block.
#[derive(Copy, Clone, Debug)]
pub struct IndBlock<'a> {
    buf: &'a [u8],
    header: Header,
    strings: [&'a str; 4],
}

impl<'a> IndBlock<'a> {
    /// Validates the header and entry table bounds; `DataLoss` on failure.
    pub fn new(buf: &'a [u8]) -> Result<Self, Error> {
        let header = read_header(buf)?;
        let mut pos = FIXED_HEADER_SIZE;
        let strings = [
            read_str(buf, &mut pos)?,
            read_str(buf, &mut pos)?,
            read_str(buf, &mut pos)?,
            read_str(buf, &mut pos)?,
        ];
        Ok(IndBlock {
            buf,
            header,
            strings,
        })
    }

    pub fn n_entries(&self) -> u32 {
        self.header.n_entries
    }

    pub fn n_valid(&self) -> u32 {
        self.header.n_valid
    }

    pub fn base_time(&self) -> Time {
        self.header.base_time
    }

    pub fn video_codec_name(&self) -> &'a str {
        self.strings[0]
    }

    pub fn video_codec_parameters(&self) -> &'a str {
        self.strings[1]
    }

    pub fn audio_codec_name(&self) -> &'a str {
        self.strings[2]
    }

    pub fn audio_codec_parameters(&self) -> &'a str {
        self.strings[3]
    }

    fn entry(&self, i: u32) -> IndEntry {
        decode_entry(self.buf, self.header.entries_off, i)
    }

    /// Returns the rel-block payload of `e`, checking that its region lies
    /// inside the block and after the entry table.
    pub fn payload(&self, e: &IndEntry) -> Result<&'a [u8], Error> {
        let start = e.offset as usize;
        let end = start + e.size as usize;
        let payload_base = self.header.entries_off + self.header.n_entries as usize * ENTRY_SIZE;
        if start < payload_base || end > self.buf.len() {
            bail_t!(
                DataLoss,
                "ind entry region [{}, {}) escapes block of {} bytes",
                start,
                end,
                self.buf.len()
            );
        }
        Ok(&self.buf[start..end])
    }

    pub fn begin(&self) -> IndCursor<'a> {
        IndCursor {
            block: *self,
            pos: 0,
        }
    }

    pub fn end(&self) -> IndCursor<'a> {
        IndCursor {
            block: *self,
            pos: self.header.n_valid,
        }
    }

    pub fn find_lower_bound(&self, ts: Time) -> IndCursor<'a> {
        IndCursor {
            block: *self,
            pos: lower_bound(self.buf, &self.header, ts),
        }
    }
}

/// A bidirectional cursor over an ind block's valid entries.
///
/// The position one past the last valid entry is the end sentinel: reachable
/// by `next`, not valid, and `prev` steps back off it. `prev` at the first
/// entry fails and stays put.
pub struct IndCursor<'a> {
    block: IndBlock<'a>,
    pos: u32,
}

impl<'a> IndCursor<'a> {
    pub fn valid(&self) -> bool {
        self.pos < self.block.header.n_valid
    }

    pub fn next(&mut self) -> bool {
        if self.pos < self.block.header.n_valid {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub fn prev(&mut self) -> bool {
        if self.pos > 0 {
            self.pos -= 1;
            true
        } else {
            false
        }
    }

    pub fn get(&self) -> Option<IndEntry> {
        if self.valid() {
            Some(self.block.entry(self.pos))
        } else {
            None
        }
    }
}

/// A mutable view of one ind block, for the writer's current block.
pub struct IndBlockMut<'a> {
    buf: &'a mut [u8],
    header: Header,
}

impl<'a> IndBlockMut<'a> {
    pub fn new(buf: &'a mut [u8]) -> Result<Self, Error> {
        let header = read_header(buf)?;
        Ok(IndBlockMut { buf, header })
    }

    /// First byte past the last appended payload.
    fn payload_cursor(&self) -> usize {
        let payload_base = self.header.entries_off + self.header.n_entries as usize * ENTRY_SIZE;
        if self.header.n_valid == 0 {
            payload_base
        } else {
            let last = decode_entry(self.buf, self.header.entries_off, self.header.n_valid - 1);
            last.offset as usize + last.size as usize
        }
    }

    /// True iff a `bytes`-sized rel block can still be appended: an entry
    /// slot remains and the payload region has room.
    pub fn fits(&self, bytes: usize) -> bool {
        self.header.n_valid < self.header.n_entries
            && self.buf.len().saturating_sub(self.payload_cursor()) >= bytes
    }

    /// Appends one rel block as a new entry. The entry's key flag mirrors
    /// the first record of the payload.
    pub fn append(&mut self, payload: &[u8], kind: MediaKind, ts: Time) -> Result<(), Error> {
        if !self.fits(payload.len()) {
            bail_t!(
                ResourceExhausted,
                "ind block full: {} of {} entries, {} payload bytes don't fit",
                self.header.n_valid,
                self.header.n_entries,
                payload.len()
            );
        }
        let offset = self.payload_cursor();
        self.buf[offset..offset + payload.len()].copy_from_slice(payload);
        let flags = if payload.len() > 8 {
            payload[8] & relblock::FLAG_KEY
        } else {
            0
        };
        let eoff = self.header.entries_off + self.header.n_valid as usize * ENTRY_SIZE;
        let e = &mut self.buf[eoff..eoff + ENTRY_SIZE];
        LittleEndian::write_i64(&mut e[0..8], ts.0);
        LittleEndian::write_u32(&mut e[8..12], offset as u32);
        LittleEndian::write_u32(&mut e[12..16], payload.len() as u32);
        e[16] = kind.stream_id();
        e[17] = flags;
        self.header.n_valid += 1;
        LittleEndian::write_u32(&mut self.buf[4..8], self.header.n_valid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relblock;
    use base::ErrorKind;

    fn rel(data: &[u8], ts: Time, flags: u8) -> Vec<u8> {
        let mut buf = Vec::new();
        relblock::append(&mut buf, data, ts, flags);
        buf
    }

    #[test]
    fn initialize_and_getters() {
        let mut buf = vec![0u8; 8192];
        initialize(&mut buf, 16, Time(123456789), "h264", "prof", "aac", "cfg").unwrap();
        let blk = IndBlock::new(&buf).unwrap();
        assert_eq!(blk.n_entries(), 16);
        assert_eq!(blk.n_valid(), 0);
        assert_eq!(blk.base_time(), Time(123456789));
        assert_eq!(blk.video_codec_name(), "h264");
        assert_eq!(blk.video_codec_parameters(), "prof");
        assert_eq!(blk.audio_codec_name(), "aac");
        assert_eq!(blk.audio_codec_parameters(), "cfg");
        assert!(!blk.begin().valid());
    }

    #[test]
    fn append_and_iterate() {
        let mut buf = vec![0u8; 1 << 20];
        initialize(&mut buf, 8, Time(0), "h264", "", "aac", "").unwrap();
        let payload: Vec<Vec<u8>> = (1..=8)
            .map(|i| rel(&vec![i as u8; 1024], Time(i), relblock::FLAG_KEY))
            .collect();
        {
            let mut blk = IndBlockMut::new(&mut buf).unwrap();
            for (i, p) in payload.iter().enumerate() {
                blk.append(p, MediaKind::Video, Time(i as i64 + 1)).unwrap();
            }
        }
        let blk = IndBlock::new(&buf).unwrap();
        assert_eq!(blk.n_valid(), 8);
        let mut c = blk.begin();
        for (i, p) in payload.iter().enumerate() {
            assert!(c.valid());
            let e = c.get().unwrap();
            assert_eq!(e.ts, Time(i as i64 + 1));
            assert_eq!(e.kind().unwrap(), MediaKind::Video);
            assert!(e.is_key());
            assert_eq!(blk.payload(&e).unwrap(), &p[..]);
            c.next();
        }
        // Moving onto the end sentinel is allowed; standing on it is not valid.
        assert!(!c.valid());
        assert!(!c.next());
        assert!(c.prev());
        assert!(c.valid());
        assert_eq!(c.get().unwrap().ts, Time(8));
        // Stepping before the first entry fails and stays put.
        let mut b = blk.begin();
        assert!(!b.prev());
        assert!(b.valid());
    }

    #[test]
    fn find_lower_bound_cases() {
        let mut buf = vec![0u8; 1 << 20];
        initialize(&mut buf, 8, Time(0), "h264", "", "", "").unwrap();
        {
            let mut blk = IndBlockMut::new(&mut buf).unwrap();
            for ts in (10..=80).step_by(10) {
                let p = rel(&[0u8; 512], Time(ts), relblock::FLAG_KEY);
                blk.append(&p, MediaKind::Video, Time(ts)).unwrap();
            }
        }
        let blk = IndBlock::new(&buf).unwrap();
        assert_eq!(blk.find_lower_bound(Time(10)).get().unwrap().ts, Time(10));
        assert_eq!(blk.find_lower_bound(Time(80)).get().unwrap().ts, Time(80));
        assert_eq!(blk.find_lower_bound(Time(50)).get().unwrap().ts, Time(50));
        assert_eq!(blk.find_lower_bound(Time(45)).get().unwrap().ts, Time(50));
        assert_eq!(blk.find_lower_bound(Time(9)).get().unwrap().ts, Time(10));
        assert!(!blk.find_lower_bound(Time(81)).valid());
    }

    #[test]
    fn capacity() {
        let mut buf = vec![0u8; 4096];
        initialize(&mut buf, 2, Time(0), "h264", "", "", "").unwrap();
        let mut blk = IndBlockMut::new(&mut buf).unwrap();
        let p = rel(&[0u8; 1024], Time(1), relblock::FLAG_KEY);
        assert!(blk.fits(p.len()));
        blk.append(&p, MediaKind::Video, Time(1)).unwrap();
        blk.append(&p, MediaKind::Video, Time(2)).unwrap();
        // Out of entry slots.
        assert!(!blk.fits(p.len()));
        let e = blk.append(&p, MediaKind::Video, Time(3)).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::ResourceExhausted);
    }

    #[test]
    fn payload_space_exhausted() {
        let mut buf = vec![0u8; 2048];
        initialize(&mut buf, 8, Time(0), "h264", "", "", "").unwrap();
        let mut blk = IndBlockMut::new(&mut buf).unwrap();
        let p = rel(&[0u8; 1000], Time(1), relblock::FLAG_KEY);
        blk.append(&p, MediaKind::Video, Time(1)).unwrap();
        // An entry slot remains but the payload region is too full.
        assert!(!blk.fits(p.len()));
    }

    #[test]
    fn oversized_header_rejected() {
        let mut buf = vec![0u8; 256];
        let e = initialize(&mut buf, 64, Time(0), "h264", "", "", "").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn corrupt_header_rejected() {
        let mut buf = vec![0u8; 4096];
        initialize(&mut buf, 4, Time(0), "h264", "", "", "").unwrap();
        // n_valid > n_entries
        LittleEndian::write_u32(&mut buf[4..8], 5);
        let e = IndBlock::new(&buf).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::DataLoss);
    }
}
