// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application bookkeeping.
//!
//! An application is the unit a task location table belongs to: every task
//! spawned from the same binary shares one `Application`, and the location
//! table is only freed once the last task referencing it is gone. Migration
//! does not change this -- a migrated task keeps referring to the same
//! `Application` it was allocated against, wherever its TCB now lives.

use crate::loctable::LocationTable;

/// One application present on this tile.
pub struct Application {
    id: u8,
    loc_table: LocationTable,
    refcount: u16,
}

impl Application {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            loc_table: LocationTable::new(),
            refcount: 0,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn loc_table(&self) -> &LocationTable {
        &self.loc_table
    }

    pub fn loc_table_mut(&mut self) -> &mut LocationTable {
        &mut self.loc_table
    }

    pub fn refcount(&self) -> u16 {
        self.refcount
    }

    /// Called when a TCB naming this application is created. Every
    /// referring TCB must eventually call `app_derefer` exactly once.
    pub fn app_refer(&mut self) {
        self.refcount += 1;
    }

    /// Called when a TCB naming this application is removed (abort, normal
    /// exit, or migrated away). Returns `true` if this was the last
    /// reference, in which case the caller should drop the `Application`
    /// and free its location table.
    pub fn app_derefer(&mut self) -> bool {
        debug_assert!(self.refcount > 0);
        self.refcount = self.refcount.saturating_sub(1);
        self.refcount == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derefer_reports_last_reference() {
        let mut app = Application::new(3);
        app.app_refer();
        app.app_refer();
        assert!(!app.app_derefer());
        assert!(app.app_derefer());
    }

    #[test]
    fn new_app_has_own_id_and_empty_table() {
        let app = Application::new(7);
        assert_eq!(app.id(), 7);
        assert_eq!(app.refcount(), 0);
        assert_eq!(app.loc_table().len(), 0);
    }
}
