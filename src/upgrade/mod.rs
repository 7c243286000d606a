// This file is part of rvd, a continuous video recording storage engine.
// Copyright (C) 2022 The rvd Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Upgrades the segment ledger schema.
//!
//! The schema version is the SQLite `user_version` pragma. Version 0 ledgers
//! (written before the `segments` table had a surrogate key) are upgraded in
//! place on open.

use base::{bail_t, Error};
use log::info;
use rusqlite::Connection;

mod v0_to_v1;

/// The current ledger schema version.
pub const EXPECTED_VERSION: i32 = 1;

pub fn get_version(conn: &Connection) -> Result<i32, Error> {
    crate::raw::get_user_version(conn)
}

pub fn set_version(conn: &Connection, version: i32) -> Result<(), Error> {
    crate::raw::set_user_version(conn, version)
}

/// Brings `conn`'s schema up to [EXPECTED_VERSION].
///
/// Fails with `FailedPrecondition` when the ledger was written by a newer
/// version of this library.
pub fn run(conn: &mut Connection) -> Result<(), Error> {
    let upgraders = [v0_to_v1::run];

    assert_eq!(upgraders.len(), EXPECTED_VERSION as usize);
    let old_ver = get_version(conn)?;
    if old_ver > EXPECTED_VERSION {
        bail_t!(
            FailedPrecondition,
            "ledger is at schema version {}, later than expected {}",
            old_ver,
            EXPECTED_VERSION
        );
    } else if old_ver < 0 {
        bail_t!(FailedPrecondition, "ledger is at negative version {}", old_ver);
    }
    for ver in old_ver..EXPECTED_VERSION {
        info!("upgrading ledger from version {} to {}", ver, ver + 1);
        upgraders[ver as usize](conn)?;
        set_version(conn, ver + 1)?;
    }
    Ok(())
}
