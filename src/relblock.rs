// This file is part of rvd, a continuous video recording storage engine.
// Copyright (C) 2022 The rvd Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Rel blocks: the packed frame records inside one ind-block entry.
//!
//! A rel block is an append-only sequence of variable-length records, one per
//! frame, holding a complete GOP (key frame plus followers) or one audio
//! buffer group. Records are `ts:i64 LE | flags:u8 | size:u32 LE |
//! data[size]`. Within one rel block the first record is a key frame and
//! timestamps are non-decreasing.

use base::Time;
use byteorder::{ByteOrder, LittleEndian};
use log::error;

/// Bytes of framing prepended to every record.
pub const PER_RECORD_OVERHEAD: usize = 13;

/// Bit 0 of a record's `flags`: the frame is independently decodable.
/// All other bits are reserved zero.
pub const FLAG_KEY: u8 = 1;

/// Appends one record to `buf`. The caller sizes the buffer; this only ever
/// grows it by `data.len() + PER_RECORD_OVERHEAD`.
pub fn append(buf: &mut Vec<u8>, data: &[u8], ts: Time, flags: u8) {
    let mut framing = [0u8; PER_RECORD_OVERHEAD];
    LittleEndian::write_i64(&mut framing[0..8], ts.0);
    framing[8] = flags;
    LittleEndian::write_u32(&mut framing[9..13], data.len() as u32);
    buf.extend_from_slice(&framing);
    buf.extend_from_slice(data);
}

/// One decoded record, borrowing its payload from the block.
#[derive(Copy, Clone, Debug)]
pub struct RelRecord<'a> {
    pub ts: Time,
    pub flags: u8,
    pub data: &'a [u8],
}

impl<'a> RelRecord<'a> {
    pub fn is_key(&self) -> bool {
        self.flags & FLAG_KEY != 0
    }
}

/// A view of one rel block's bytes.
#[derive(Copy, Clone)]
pub struct RelBlock<'a> {
    buf: &'a [u8],
}

impl<'a> RelBlock<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        RelBlock { buf }
    }

    pub fn iter(&self) -> RelIter<'a> {
        RelIter {
            buf: self.buf,
            pos: 0,
        }
    }
}

/// Forward cursor over a rel block's records.
///
/// Records are variable length, so there's no random access; callers that
/// need to revisit a position should remember it while walking forward. A
/// record whose framing or payload extends past the block end is a decode
/// error: it is logged and iteration ends, as if the block were exhausted.
pub struct RelIter<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for RelIter<'a> {
    type Item = RelRecord<'a>;

    fn next(&mut self) -> Option<RelRecord<'a>> {
        if self.pos == self.buf.len() {
            return None;
        }
        if self.pos + PER_RECORD_OVERHEAD > self.buf.len() {
            error!(
                "rel block truncated mid-framing at offset {} of {}",
                self.pos,
                self.buf.len()
            );
            self.pos = self.buf.len();
            return None;
        }
        let framing = &self.buf[self.pos..self.pos + PER_RECORD_OVERHEAD];
        let ts = Time(LittleEndian::read_i64(&framing[0..8]));
        let flags = framing[8];
        let size = LittleEndian::read_u32(&framing[9..13]) as usize;
        let data_start = self.pos + PER_RECORD_OVERHEAD;
        if data_start + size > self.buf.len() {
            error!(
                "rel block record at offset {} claims {} bytes but only {} remain",
                self.pos,
                size,
                self.buf.len() - data_start
            );
            self.pos = self.buf.len();
            return None;
        }
        self.pos = data_start + size;
        Some(RelRecord {
            ts,
            flags,
            data: &self.buf[data_start..data_start + size],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_framing() {
        let src: Vec<u8> = (0..=255).collect();
        let mut buf = Vec::new();
        append(&mut buf, &src, Time(10), FLAG_KEY);
        assert_eq!(buf.len(), src.len() + PER_RECORD_OVERHEAD);
        assert_eq!(LittleEndian::read_i64(&buf[0..8]), 10);
        assert_eq!(buf[8], 1);
        assert_eq!(LittleEndian::read_u32(&buf[9..13]), 256);
        let before = buf.len();
        append(&mut buf, &src, Time(20), 0);
        assert_eq!(buf.len() - before, src.len() + PER_RECORD_OVERHEAD);
        assert_eq!(LittleEndian::read_i64(&buf[before..before + 8]), 20);
        assert_eq!(buf[before + 8], 0);
    }

    #[test]
    fn round_trip() {
        let src: Vec<u8> = (0..=255).collect();
        let mut buf = Vec::new();
        for (i, ts) in (10..=80).step_by(10).enumerate() {
            append(
                &mut buf,
                &src,
                Time(ts),
                if i % 4 == 0 { FLAG_KEY } else { 0 },
            );
        }
        let recs: Vec<_> = RelBlock::new(&buf).iter().collect();
        assert_eq!(recs.len(), 8);
        for (i, r) in recs.iter().enumerate() {
            assert_eq!(r.ts, Time(10 + 10 * i as i64));
            assert_eq!(r.is_key(), i % 4 == 0);
            assert_eq!(r.data, &src[..]);
        }
    }

    #[test]
    fn truncated_payload_stops_iteration() {
        let mut buf = Vec::new();
        append(&mut buf, b"abcdef", Time(1), FLAG_KEY);
        append(&mut buf, b"ghijkl", Time(2), 0);
        // Chop the second record's payload short.
        buf.truncate(buf.len() - 3);
        let recs: Vec<_> = RelBlock::new(&buf).iter().collect();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].data, b"abcdef");
    }

    #[test]
    fn truncated_framing_stops_iteration() {
        let mut buf = Vec::new();
        append(&mut buf, b"abcdef", Time(1), FLAG_KEY);
        buf.extend_from_slice(&[0u8; 5]); // partial framing only
        let recs: Vec<_> = RelBlock::new(&buf).iter().collect();
        assert_eq!(recs.len(), 1);
    }

    #[test]
    fn empty_block() {
        assert!(RelBlock::new(&[]).iter().next().is_none());
    }
}
