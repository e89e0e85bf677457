/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::db::PracticeDb;
use crate::error::*;
use parking_lot::{Mutex, MutexGuard};
use std::path::Path;

/// The handle UI code and the sync engine share. All database access goes
/// through the mutex; sync cycles additionally serialize on `sync_lock` so
/// at most one cycle runs at a time while row writes keep interleaving.
pub struct PracticeStore {
    db: Mutex<PracticeDb>,
    sync_lock: Mutex<()>,
}

impl PracticeStore {
    pub fn new(path: impl AsRef<Path>, device_id: &str) -> Result<Self> {
        Ok(Self::from_db(PracticeDb::open(path, device_id)?))
    }

    pub fn new_in_memory(device_id: &str) -> Result<Self> {
        Ok(Self::from_db(PracticeDb::open_in_memory(device_id)?))
    }

    pub fn from_db(db: PracticeDb) -> Self {
        Self {
            db: Mutex::new(db),
            sync_lock: Mutex::new(()),
        }
    }

    pub fn lock_db(&self) -> MutexGuard<'_, PracticeDb> {
        self.db.lock()
    }

    pub(crate) fn sync_lock(&self) -> &Mutex<()> {
        &self.sync_lock
    }
}
