// This file is part of rvd, a continuous video recording storage engine.
// Copyright (C) 2022 The rvd Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Segment ledger connection management.
//!
//! The ledger is opened per mutating operation and closed at the end, to
//! avoid holding a write lock across long-running reads from other handles.
//! Opens are retried with a growing sleep because another process's
//! checkpoint can hold the database exclusively for a moment.

use base::{Error, ErrorKind, ResultExt};
use log::{info, warn};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;

const MAX_OPEN_RETRIES: u32 = 5;
const OPEN_RETRY_SLEEP: std::time::Duration = std::time::Duration::from_millis(500);
const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

#[derive(Copy, Clone, Eq, PartialEq)]
pub(crate) enum Mode {
    ReadOnly,
    ReadWrite,
}

/// Opens the ledger at `path`, creating it in `ReadWrite` mode if absent.
pub(crate) fn open(path: &Path, mode: Mode) -> Result<Connection, Error> {
    let flags = match mode {
        Mode::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        Mode::ReadWrite => {
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
        }
    };
    let mut attempt = 0;
    loop {
        match Connection::open_with_flags(path, flags) {
            Ok(conn) => {
                conn.busy_timeout(BUSY_TIMEOUT)
                    .err_kind(ErrorKind::Internal)?;
                if mode == Mode::ReadWrite {
                    set_journal_mode(&conn, "wal")?;
                }
                return Ok(conn);
            }
            Err(e) => {
                attempt += 1;
                if attempt >= MAX_OPEN_RETRIES {
                    return Err(e).err_kind(ErrorKind::Unavailable);
                }
                warn!(
                    "unable to open ledger {} (attempt {}): {}",
                    path.display(),
                    attempt,
                    e
                );
                std::thread::sleep(OPEN_RETRY_SLEEP * attempt);
            }
        }
    }
}

pub(crate) fn set_journal_mode(conn: &Connection, requested: &str) -> Result<(), Error> {
    assert!(!requested.contains(';')); // quick check for accidental sql injection.
    let actual = conn
        .query_row(&format!("pragma journal_mode = {}", requested), [], |row| {
            row.get::<_, String>(0)
        })
        .err_kind(ErrorKind::Internal)?;
    if actual != requested {
        // Harmless: e.g. in-memory databases always report "memory".
        info!(
            "ledger in journal_mode {} (requested {})",
            actual, requested
        );
    }
    Ok(())
}

/// Initializes a fresh ledger at the current schema version.
pub(crate) fn init(conn: &mut Connection) -> Result<(), Error> {
    let tx = conn.transaction().err_kind(ErrorKind::Internal)?;
    tx.execute_batch(include_str!("schema.sql"))
        .err_kind(ErrorKind::Internal)?;
    tx.commit().err_kind(ErrorKind::Internal)?;
    crate::upgrade::set_version(conn, crate::upgrade::EXPECTED_VERSION)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_reopen() {
        let tmpdir = tempfile::tempdir().unwrap();
        let path = tmpdir.path().join("ledger.sdb");
        let mut conn = open(&path, Mode::ReadWrite).unwrap();
        init(&mut conn).unwrap();
        drop(conn);
        let conn = open(&path, Mode::ReadOnly).unwrap();
        let n: i64 = conn
            .query_row("select count(*) from segments", [], |row| row.get(0))
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(
            crate::upgrade::get_version(&conn).unwrap(),
            crate::upgrade::EXPECTED_VERSION
        );
    }
}
