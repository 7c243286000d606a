// This file is part of rvd, a continuous video recording storage engine.
// Copyright (C) 2022 The rvd Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Upgrades a version 0 ledger (no surrogate key on `segments`) to version
//! 1 by rebuilding the table with an autoincrement `id`, preserving rows in
//! insertion order.

use base::{Error, ErrorKind, ResultExt as _};
use rusqlite::Connection;

pub fn run(conn: &mut Connection) -> Result<(), Error> {
    let tx = conn.transaction().err_kind(ErrorKind::Internal)?;
    tx.execute_batch(
        r#"
        create table new_segments (
          id integer primary key autoincrement,
          start_ts integer,
          end_ts integer
        );
        insert into new_segments (start_ts, end_ts) select start_ts, end_ts from segments;
        drop table segments;
        alter table new_segments rename to segments;
        create index segments_start_ts_idx on segments (start_ts);
        "#,
    )
    .err_kind(ErrorKind::Internal)?;
    tx.commit().err_kind(ErrorKind::Internal)
}
