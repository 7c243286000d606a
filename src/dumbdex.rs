// This file is part of rvd, a continuous video recording storage engine.
// Copyright (C) 2022 The rvd Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The dumbdex: an ordered map from GOP head timestamp to storage block
//! number, plus a free-list stack, both living in block 0 of the storage
//! file.
//!
//! Region layout (all little-endian):
//!
//! ```text
//! index_len:u32 | max_indexes slots of (first_ts:i64, block_no:u16)
//! free_len:u32  | max_indexes slots of (block_no:u16, 8 reserved bytes)
//! ```
//!
//! The index is kept strictly sorted ascending by `first_ts`. Every block
//! number lives in exactly one of the two structures. When the free list is
//! empty, an insert evicts the smallest-timestamp entry and reuses its block
//! number, which is what makes the storage file circular.

use base::{bail_t, Error, Time};
use byteorder::{ByteOrder, LittleEndian};

/// Size of one index slot on disk.
pub const INDEX_ENTRY_SIZE: usize = 10;

/// Size of one free-list slot on disk. Kept equal to the index slot size so
/// a region sized for `n` indexes holds `n` free slots too.
pub const FREEDEX_ENTRY_SIZE: usize = 10;

/// The number of indexes a region of `region_bytes` can hold: two `u32`
/// lengths plus one index slot and one free slot per block.
pub fn max_indexes_within(region_bytes: usize) -> usize {
    region_bytes.saturating_sub(8) / (INDEX_ENTRY_SIZE + FREEDEX_ENTRY_SIZE)
}

/// Bytes required to hold `max_indexes` indexes.
pub fn region_size(max_indexes: usize) -> usize {
    8 + max_indexes * (INDEX_ENTRY_SIZE + FREEDEX_ENTRY_SIZE)
}

fn index_slot(i: usize) -> usize {
    4 + i * INDEX_ENTRY_SIZE
}

fn free_len_off(max_indexes: usize) -> usize {
    4 + max_indexes * INDEX_ENTRY_SIZE
}

fn free_slot(max_indexes: usize, i: usize) -> usize {
    free_len_off(max_indexes) + 4 + i * FREEDEX_ENTRY_SIZE
}

fn read_entry(buf: &[u8], i: usize) -> (Time, u16) {
    let off = index_slot(i);
    (
        Time(LittleEndian::read_i64(&buf[off..off + 8])),
        LittleEndian::read_u16(&buf[off + 8..off + 10]),
    )
}

fn write_entry(buf: &mut [u8], i: usize, ts: Time, block: u16) {
    let off = index_slot(i);
    LittleEndian::write_i64(&mut buf[off..off + 8], ts.0);
    LittleEndian::write_u16(&mut buf[off + 8..off + 10], block);
}

/// First index position with `first_ts >= want`, or `len` if none.
fn lower_bound(buf: &[u8], len: usize, want: Time) -> usize {
    let (mut lo, mut hi) = (0, len);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if read_entry(buf, mid).0 < want {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

fn check_region(buf: &[u8], max_indexes: usize) -> Result<(usize, usize), Error> {
    if buf.len() < region_size(max_indexes) {
        bail_t!(
            DataLoss,
            "dumbdex region of {} bytes can't hold {} indexes",
            buf.len(),
            max_indexes
        );
    }
    let index_len = LittleEndian::read_u32(&buf[0..4]) as usize;
    let free_len = LittleEndian::read_u32(&buf[free_len_off(max_indexes)..][..4]) as usize;
    if index_len > max_indexes || free_len > max_indexes {
        bail_t!(
            DataLoss,
            "dumbdex lengths {}/{} exceed capacity {}",
            index_len,
            free_len,
            max_indexes
        );
    }
    Ok((index_len, free_len))
}

/// Initializes an empty dumbdex: no index entries, and a free list holding
/// all of `1..=max_indexes` arranged so the first insert pops block 1.
pub fn allocate(buf: &mut [u8], max_indexes: u16) -> Result<(), Error> {
    let n = max_indexes as usize;
    if buf.len() < region_size(n) {
        bail_t!(
            InvalidArgument,
            "dumbdex region of {} bytes can't hold {} indexes",
            buf.len(),
            n
        );
    }
    for b in &mut buf[..region_size(n)] {
        *b = 0;
    }
    LittleEndian::write_u32(&mut buf[0..4], 0);
    LittleEndian::write_u32(&mut buf[free_len_off(n)..][..4], max_indexes as u32);
    for i in 0..n {
        let off = free_slot(n, i);
        LittleEndian::write_u16(&mut buf[off..off + 2], (n - i) as u16);
    }
    Ok(())
}

/// A read-only view of a dumbdex region.
#[derive(Copy, Clone)]
pub struct Dumbdex<'a> {
    buf: &'a [u8],
    len: usize,
}

impl<'a> Dumbdex<'a> {
    pub fn new(buf: &'a [u8], max_indexes: u16) -> Result<Self, Error> {
        let (len, _) = check_region(buf, max_indexes as usize)?;
        Ok(Dumbdex { buf, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn begin(&self) -> Cursor<'a> {
        Cursor { dex: *self, pos: 0 }
    }

    pub fn end(&self) -> Cursor<'a> {
        Cursor {
            dex: *self,
            pos: self.len,
        }
    }

    pub fn find_lower_bound(&self, ts: Time) -> Cursor<'a> {
        Cursor {
            dex: *self,
            pos: lower_bound(self.buf, self.len, ts),
        }
    }
}

/// A bidirectional cursor over the sorted index. The position `len` is the
/// end sentinel; `prev` from it lands on the last entry, `prev` from the
/// first entry fails and stays put.
#[derive(Copy, Clone)]
pub struct Cursor<'a> {
    dex: Dumbdex<'a>,
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn valid(&self) -> bool {
        self.pos < self.dex.len
    }

    pub fn next(&mut self) -> bool {
        if self.pos < self.dex.len {
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

    pub fn get(&self) -> Option<(Time, u16)> {
        if self.valid() {
            Some(read_entry(self.dex.buf, self.pos))
        } else {
            None
        }
    }
}

impl<'a> PartialEq for Cursor<'a> {
    fn eq(&self, other: &Self) -> bool {
        self.pos == other.pos
    }
}

impl<'a> Eq for Cursor<'a> {}

/// A mutable view of a dumbdex region. Lengths are re-read from the mapped
/// bytes on every operation, so interleaving with read views stays coherent.
pub struct DumbdexMut<'a> {
    buf: &'a mut [u8],
    max_indexes: usize,
}

impl<'a> DumbdexMut<'a> {
    pub fn new(buf: &'a mut [u8], max_indexes: u16) -> Result<Self, Error> {
        check_region(buf, max_indexes as usize)?;
        Ok(DumbdexMut {
            buf,
            max_indexes: max_indexes as usize,
        })
    }

    fn index_len(&self) -> usize {
        LittleEndian::read_u32(&self.buf[0..4]) as usize
    }

    fn set_index_len(&mut self, len: usize) {
        LittleEndian::write_u32(&mut self.buf[0..4], len as u32);
    }

    fn free_len(&self) -> usize {
        LittleEndian::read_u32(&self.buf[free_len_off(self.max_indexes)..][..4]) as usize
    }

    fn set_free_len(&mut self, len: usize) {
        let off = free_len_off(self.max_indexes);
        LittleEndian::write_u32(&mut self.buf[off..off + 4], len as u32);
    }

    fn pop_free(&mut self) -> Option<u16> {
        let len = self.free_len();
        if len == 0 {
            return None;
        }
        let off = free_slot(self.max_indexes, len - 1);
        let block = LittleEndian::read_u16(&self.buf[off..off + 2]);
        self.set_free_len(len - 1);
        Some(block)
    }

    fn push_free(&mut self, block: u16) {
        let len = self.free_len();
        let off = free_slot(self.max_indexes, len);
        LittleEndian::write_u16(&mut self.buf[off..off + 2], block);
        self.set_free_len(len + 1);
    }

    /// Shifts index slots `[from, len)` one position toward the front.
    fn shift_down(&mut self, from: usize, len: usize) {
        self.buf
            .copy_within(index_slot(from)..index_slot(len), index_slot(from - 1));
    }

    /// Shifts index slots `[from, len)` one position toward the back.
    fn shift_up(&mut self, from: usize, len: usize) {
        self.buf
            .copy_within(index_slot(from)..index_slot(len), index_slot(from + 1));
    }

    /// Maps `first_ts` to a block number, claiming one for it if needed.
    ///
    /// An exact-timestamp match returns the already-assigned block, making
    /// retries idempotent. Otherwise a block is popped from the free list,
    /// or, when the index is full, the smallest-timestamp entry is evicted
    /// and its block reused. Eviction is normal wrap-around operation, not
    /// an error.
    pub fn insert(&mut self, first_ts: Time) -> Result<u16, Error> {
        let mut len = self.index_len();
        let pos = lower_bound(self.buf, len, first_ts);
        if pos < len {
            let (ts, block) = read_entry(self.buf, pos);
            if ts == first_ts {
                return Ok(block);
            }
        }
        let block = match self.pop_free() {
            Some(b) => b,
            None => {
                if len == 0 {
                    bail_t!(Internal, "dumbdex has no blocks at all");
                }
                let (_, b) = read_entry(self.buf, 0);
                self.shift_down(1, len);
                len -= 1;
                b
            }
        };
        // The eviction above may have invalidated `pos`; find it again.
        let pos = lower_bound(self.buf, len, first_ts);
        self.shift_up(pos, len);
        write_entry(self.buf, pos, first_ts, block);
        self.set_index_len(len + 1);
        Ok(block)
    }

    /// Removes the entry with exactly `first_ts`, returning its block to the
    /// free list. No-op if absent.
    pub fn remove(&mut self, first_ts: Time) {
        let len = self.index_len();
        let pos = lower_bound(self.buf, len, first_ts);
        if pos >= len {
            return;
        }
        let (ts, block) = read_entry(self.buf, pos);
        if ts != first_ts {
            return;
        }
        self.shift_down(pos + 1, len);
        self.set_index_len(len - 1);
        self.push_free(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_INDEXES: u16 = 8;

    fn entries(buf: &[u8]) -> Vec<(i64, u16)> {
        let d = Dumbdex::new(buf, MAX_INDEXES).unwrap();
        let mut c = d.begin();
        let mut v = Vec::new();
        while let Some((ts, block)) = c.get() {
            v.push((ts.0, block));
            c.next();
        }
        v
    }

    fn new_region() -> Vec<u8> {
        let mut buf = vec![0u8; region_size(MAX_INDEXES as usize)];
        allocate(&mut buf, MAX_INDEXES).unwrap();
        buf
    }

    #[test]
    fn size_bookkeeping() {
        assert_eq!(INDEX_ENTRY_SIZE, FREEDEX_ENTRY_SIZE);
        assert_eq!(INDEX_ENTRY_SIZE, 10);
        assert_eq!(max_indexes_within(1024), 50);
        assert_eq!(max_indexes_within(region_size(8)), 8);
        assert_eq!(max_indexes_within(0), 0);
    }

    #[test]
    fn consistency() {
        let mut buf = new_region();
        let mut d = DumbdexMut::new(&mut buf, MAX_INDEXES).unwrap();
        for (i, ts) in (10..=60).step_by(10).enumerate() {
            assert_eq!(d.insert(Time(ts)).unwrap(), i as u16 + 1);
        }
        assert_eq!(
            entries(&buf),
            vec![(10, 1), (20, 2), (30, 3), (40, 4), (50, 5), (60, 6)]
        );

        let mut d = DumbdexMut::new(&mut buf, MAX_INDEXES).unwrap();
        d.remove(Time(10));
        assert_eq!(
            entries(&buf),
            vec![(20, 2), (30, 3), (40, 4), (50, 5), (60, 6)]
        );

        // Block 1 just went back on the stack; a new insert reuses it.
        let mut d = DumbdexMut::new(&mut buf, MAX_INDEXES).unwrap();
        assert_eq!(d.insert(Time(35)).unwrap(), 1);
        assert_eq!(
            entries(&buf),
            vec![(20, 2), (30, 3), (35, 1), (40, 4), (50, 5), (60, 6)]
        );

        let mut d = DumbdexMut::new(&mut buf, MAX_INDEXES).unwrap();
        assert_eq!(d.insert(Time(70)).unwrap(), 7);
        assert_eq!(d.insert(Time(80)).unwrap(), 8);

        // Full: inserting evicts the smallest entry (20, block 2) and
        // reuses its block.
        assert_eq!(d.insert(Time(75)).unwrap(), 2);
        assert_eq!(
            entries(&buf),
            vec![
                (30, 3),
                (35, 1),
                (40, 4),
                (50, 5),
                (60, 6),
                (70, 7),
                (75, 2),
                (80, 8)
            ]
        );

        // Still full; an insert below every existing key evicts (30, 3) and
        // lands at the front.
        let mut d = DumbdexMut::new(&mut buf, MAX_INDEXES).unwrap();
        assert_eq!(d.insert(Time(10)).unwrap(), 3);
        assert_eq!(
            entries(&buf),
            vec![
                (10, 3),
                (35, 1),
                (40, 4),
                (50, 5),
                (60, 6),
                (70, 7),
                (75, 2),
                (80, 8)
            ]
        );
    }

    #[test]
    fn idempotent_insert() {
        let mut buf = new_region();
        let mut d = DumbdexMut::new(&mut buf, MAX_INDEXES).unwrap();
        let b1 = d.insert(Time(100)).unwrap();
        let b2 = d.insert(Time(100)).unwrap();
        assert_eq!(b1, b2);
        assert_eq!(entries(&buf), vec![(100, b1)]);
    }

    #[test]
    fn free_list_is_a_stack() {
        let mut buf = new_region();
        let mut d = DumbdexMut::new(&mut buf, MAX_INDEXES).unwrap();
        for ts in (10..=80).step_by(10) {
            d.insert(Time(ts)).unwrap();
        }
        // Free blocks come back in remove order, most recent on top.
        d.remove(Time(30)); // block 3
        d.remove(Time(60)); // block 6
        assert_eq!(d.insert(Time(100)).unwrap(), 6);
        assert_eq!(d.insert(Time(110)).unwrap(), 3);
    }

    #[test]
    fn wrap_around() {
        let mut buf = new_region();
        let mut d = DumbdexMut::new(&mut buf, MAX_INDEXES).unwrap();
        for (i, ts) in (1000..1080).step_by(10).enumerate() {
            assert_eq!(d.insert(Time(ts)).unwrap(), i as u16 + 1);
        }
        // Full; each further insert recycles the oldest block, cycling
        // through 1, 2, 3, ... again.
        for (i, ts) in (2000..2080).step_by(10).enumerate() {
            assert_eq!(d.insert(Time(ts)).unwrap(), i as u16 + 1);
        }
        assert_eq!(entries(&buf).len(), 8);
        assert_eq!(entries(&buf)[0].0, 2000);
    }

    #[test]
    fn find_lower_bound_edges() {
        let mut buf = new_region();
        let mut d = DumbdexMut::new(&mut buf, MAX_INDEXES).unwrap();
        for ts in (10..=50).step_by(10) {
            d.insert(Time(ts)).unwrap();
        }
        let d = Dumbdex::new(&buf, MAX_INDEXES).unwrap();
        assert_eq!(d.find_lower_bound(Time(10)).get().unwrap().0, Time(10));
        assert_eq!(d.find_lower_bound(Time(5)).get().unwrap().0, Time(10));
        assert_eq!(d.find_lower_bound(Time(31)).get().unwrap().0, Time(40));
        assert!(d.find_lower_bound(Time(51)) == d.end());
        assert!(!d.find_lower_bound(Time(51)).valid());
    }

    #[test]
    fn cursor_stepping() {
        let mut buf = new_region();
        let mut d = DumbdexMut::new(&mut buf, MAX_INDEXES).unwrap();
        d.insert(Time(10)).unwrap();
        d.insert(Time(20)).unwrap();
        let d = Dumbdex::new(&buf, MAX_INDEXES).unwrap();
        let mut c = d.begin();
        assert!(!c.prev());
        assert!(c.next());
        assert_eq!(c.get().unwrap().0, Time(20));
        assert!(c.next());
        assert!(!c.valid());
        assert!(!c.next());
        assert!(c.prev());
        assert_eq!(c.get().unwrap().0, Time(20));
        let mut e = d.end();
        assert!(e.prev());
        assert_eq!(e.get().unwrap().0, Time(20));
    }

    #[test]
    fn remove_absent_is_noop() {
        let mut buf = new_region();
        let mut d = DumbdexMut::new(&mut buf, MAX_INDEXES).unwrap();
        d.insert(Time(10)).unwrap();
        d.remove(Time(11));
        assert_eq!(entries(&buf), vec![(10, 1)]);
    }

    #[test]
    fn allocate_needs_room() {
        let mut buf = vec![0u8; 16];
        assert_eq!(
            allocate(&mut buf, 8).unwrap_err().kind(),
            base::ErrorKind::InvalidArgument
        );
    }
}
