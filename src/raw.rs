// This file is part of rvd, a continuous video recording storage engine.
// Copyright (C) 2022 The rvd Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Raw ledger access: SQLite statements over the `segments` table which do
//! not touch any cached state.

use base::{Error, ErrorKind, ResultExt as _, Time};
use rusqlite::{named_params, params, Connection};
use std::ops::Range;

const LIST_SEGMENTS_SQL: &str = r#"
    select
      id,
      start_ts,
      end_ts
    from
      segments
    where
      (end_ts >= :start_ts or end_ts = 0) and
      start_ts < :end_ts
    order by
      start_ts
"#;

const LIST_COVERING_SEGMENTS_SQL: &str = r#"
    select
      id,
      start_ts,
      end_ts
    from
      segments
    where
      start_ts < :start_ts and
      end_ts > :end_ts
"#;

const LIST_ENDING_WITHIN_SQL: &str = r#"
    select
      id,
      start_ts,
      end_ts
    from
      segments
    where
      end_ts >= :start_ts and
      end_ts < :end_ts
"#;

/// One `segments` row. `end == 0` is the live segment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct SegmentRow {
    pub id: i64,
    pub start: Time,
    pub end: Time,
}

fn list_rows(conn: &Connection, sql: &str, range: &Range<Time>) -> Result<Vec<SegmentRow>, Error> {
    let mut stmt = conn.prepare_cached(sql).err_kind(ErrorKind::Internal)?;
    let mut rows = stmt
        .query(named_params! {
            ":start_ts": range.start.0,
            ":end_ts": range.end.0,
        })
        .err_kind(ErrorKind::Internal)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
        out.push(SegmentRow {
            id: row.get(0).err_kind(ErrorKind::Internal)?,
            start: Time(row.get(1).err_kind(ErrorKind::Internal)?),
            end: Time(row.get(2).err_kind(ErrorKind::Internal)?),
        });
    }
    Ok(out)
}

/// Lists segments overlapping `[desired.start, desired.end)` in ascending
/// `start_ts` order. Live rows always overlap the upper bound.
pub(crate) fn list_segments(
    conn: &Connection,
    desired: &Range<Time>,
) -> Result<Vec<SegmentRow>, Error> {
    list_rows(conn, LIST_SEGMENTS_SQL, desired)
}

/// Opens a new live segment starting at `start_ts`, returning its row id.
pub(crate) fn insert_segment(conn: &Connection, start_ts: Time) -> Result<i64, Error> {
    let mut stmt = conn
        .prepare_cached("insert into segments (start_ts, end_ts) values (:start_ts, 0)")
        .err_kind(ErrorKind::Internal)?;
    stmt.execute(named_params! {":start_ts": start_ts.0})
        .err_kind(ErrorKind::Internal)?;
    Ok(conn.last_insert_rowid())
}

/// Closes the segment row `id` at `end_ts`.
pub(crate) fn close_segment(conn: &Connection, id: i64, end_ts: Time) -> Result<(), Error> {
    let mut stmt = conn
        .prepare_cached("update segments set end_ts = :end_ts where id = :id")
        .err_kind(ErrorKind::Internal)?;
    stmt.execute(named_params! {":end_ts": end_ts.0, ":id": id})
        .err_kind(ErrorKind::Internal)?;
    Ok(())
}

/// Closes every live row at `end_ts`; used by open-time recovery when a
/// previous writer died without `finalize`.
pub(crate) fn close_live_segments(conn: &Connection, end_ts: Time) -> Result<usize, Error> {
    let mut stmt = conn
        .prepare_cached("update segments set end_ts = :end_ts where end_ts = 0")
        .err_kind(ErrorKind::Internal)?;
    stmt.execute(named_params! {":end_ts": end_ts.0})
        .err_kind(ErrorKind::Internal)
}

/// Deletes finished segments which start before `ts`, i.e. segments whose
/// blocks have been reclaimed by the circular index.
pub(crate) fn delete_finished_before(conn: &Connection, ts: Time) -> Result<usize, Error> {
    let mut stmt = conn
        .prepare_cached("delete from segments where end_ts <> 0 and start_ts < :ts")
        .err_kind(ErrorKind::Internal)?;
    stmt.execute(named_params! {":ts": ts.0})
        .err_kind(ErrorKind::Internal)
}

/// Applies a block-range deletion `[eff.start, eff.end)` to the ledger in
/// one transaction.
///
/// If exactly one segment strictly covers the deleted range it is split in
/// two. Otherwise segments ending within the range are truncated (or
/// dropped, if they start within it too) and segments starting within the
/// range begin at `eff.end` afterward.
pub(crate) fn delete_range(conn: &mut Connection, eff: &Range<Time>) -> Result<(), Error> {
    let tx = conn.transaction().err_kind(ErrorKind::Internal)?;
    let covering = list_rows(&tx, LIST_COVERING_SEGMENTS_SQL, eff)?;
    if covering.len() == 1 {
        let seg = &covering[0];
        tx.execute(
            "update segments set end_ts = ? where id = ?",
            params![eff.start.0, seg.id],
        )
        .err_kind(ErrorKind::Internal)?;
        tx.execute(
            "insert into segments (start_ts, end_ts) values (?, ?)",
            params![eff.end.0, seg.end.0],
        )
        .err_kind(ErrorKind::Internal)?;
    } else {
        for seg in list_rows(&tx, LIST_ENDING_WITHIN_SQL, eff)? {
            if seg.start < eff.start {
                tx.execute(
                    "update segments set end_ts = ? where id = ?",
                    params![eff.start.0, seg.id],
                )
                .err_kind(ErrorKind::Internal)?;
            } else {
                tx.execute("delete from segments where id = ?", params![seg.id])
                    .err_kind(ErrorKind::Internal)?;
            }
        }
        tx.execute(
            "update segments set start_ts = :end_ts \
             where start_ts >= :start_ts and start_ts < :end_ts",
            named_params! {":start_ts": eff.start.0, ":end_ts": eff.end.0},
        )
        .err_kind(ErrorKind::Internal)?;
    }
    tx.commit().err_kind(ErrorKind::Internal)
}

/// Reads the ledger's schema version from `pragma user_version`.
pub(crate) fn get_user_version(conn: &Connection) -> Result<i32, Error> {
    conn.query_row("pragma user_version", [], |row| row.get(0))
        .err_kind(ErrorKind::Internal)
}

pub(crate) fn set_user_version(conn: &Connection, version: i32) -> Result<(), Error> {
    // `pragma` doesn't accept bound parameters.
    conn.execute_batch(&format!("pragma user_version = {}", version))
        .err_kind(ErrorKind::Internal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        db::init(&mut conn).unwrap();
        conn
    }

    fn all(conn: &Connection) -> Vec<(i64, i64)> {
        list_segments(conn, &(Time::MIN..Time::MAX))
            .unwrap()
            .into_iter()
            .map(|s| (s.start.0, s.end.0))
            .collect()
    }

    #[test]
    fn open_close_list() {
        let c = conn();
        let id = insert_segment(&c, Time(10)).unwrap();
        assert_eq!(all(&c), vec![(10, 0)]);
        close_segment(&c, id, Time(140)).unwrap();
        assert_eq!(all(&c), vec![(10, 140)]);
        // A second session.
        insert_segment(&c, Time(200)).unwrap();
        assert_eq!(close_live_segments(&c, Time(250)).unwrap(), 1);
        assert_eq!(all(&c), vec![(10, 140), (200, 250)]);
    }

    #[test]
    fn list_overlap_bounds() {
        let c = conn();
        let id = insert_segment(&c, Time(10)).unwrap();
        close_segment(&c, id, Time(140)).unwrap();
        assert_eq!(
            list_segments(&c, &(Time(140)..Time(150))).unwrap().len(),
            1
        );
        assert_eq!(list_segments(&c, &(Time(141)..Time(150))).unwrap().len(), 0);
        assert_eq!(list_segments(&c, &(Time(0)..Time(10))).unwrap().len(), 0);
        // Live rows overlap any upper bound.
        insert_segment(&c, Time(200)).unwrap();
        assert_eq!(
            list_segments(&c, &(Time(1_000)..Time(2_000))).unwrap().len(),
            1
        );
    }

    #[test]
    fn delete_range_split() {
        let mut c = conn();
        let id = insert_segment(&c, Time(10)).unwrap();
        close_segment(&c, id, Time(140)).unwrap();
        delete_range(&mut c, &(Time(60)..Time(70))).unwrap();
        assert_eq!(all(&c), vec![(10, 60), (70, 140)]);
    }

    #[test]
    fn delete_range_truncate() {
        let mut c = conn();
        let a = insert_segment(&c, Time(10)).unwrap();
        close_segment(&c, a, Time(30)).unwrap();
        let b = insert_segment(&c, Time(40)).unwrap();
        close_segment(&c, b, Time(110)).unwrap();
        let d = insert_segment(&c, Time(120)).unwrap();
        close_segment(&c, d, Time(140)).unwrap();
        delete_range(&mut c, &(Time(40)..Time(130))).unwrap();
        assert_eq!(all(&c), vec![(10, 30), (130, 140)]);
    }

    #[test]
    fn delete_range_truncates_tail_of_overlapping_row() {
        let mut c = conn();
        let a = insert_segment(&c, Time(10)).unwrap();
        close_segment(&c, a, Time(100)).unwrap();
        let b = insert_segment(&c, Time(110)).unwrap();
        close_segment(&c, b, Time(200)).unwrap();
        // Spans the end of row a and the start of row b: no single covering
        // row, so both are truncated.
        delete_range(&mut c, &(Time(50)..Time(150))).unwrap();
        assert_eq!(all(&c), vec![(10, 50), (150, 200)]);
    }

    #[test]
    fn prune() {
        let c = conn();
        let a = insert_segment(&c, Time(10)).unwrap();
        close_segment(&c, a, Time(100)).unwrap();
        insert_segment(&c, Time(110)).unwrap();
        // The live row survives pruning even when it starts in the past.
        assert_eq!(delete_finished_before(&c, Time(120)).unwrap(), 1);
        assert_eq!(all(&c), vec![(110, 0)]);
    }

    #[test]
    fn user_version() {
        let c = conn();
        assert_eq!(get_user_version(&c).unwrap(), 1);
        set_user_version(&c, 2).unwrap();
        assert_eq!(get_user_version(&c).unwrap(), 2);
    }
}
