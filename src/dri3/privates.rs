// SPDX-License-Identifier: GPL-3.0-only

//! Out-of-band data attached to pixmaps.
//!
//! Entries are keyed by [`PixmapId`] and hold no reference to the pixmap.
//! An entry is set when the pixmap is created and consumed once when the
//! pixmap is destroyed. The table is never scanned or expired on its own.

use std::collections::{HashMap, TryReserveError};

use crate::screen::PixmapId;

#[derive(Debug)]
pub struct PixmapPrivates<T> {
    entries: HashMap<PixmapId, T>,
}

impl<T> Default for PixmapPrivates<T> {
    fn default() -> Self {
        PixmapPrivates {
            entries: HashMap::new(),
        }
    }
}

impl<T> PixmapPrivates<T> {
    pub fn try_with_capacity(capacity: usize) -> Result<Self, TryReserveError> {
        let mut entries = HashMap::new();
        entries.try_reserve(capacity)?;
        Ok(PixmapPrivates { entries })
    }

    /// Attaches `value` to the pixmap, returning what was attached before.
    pub fn set(&mut self, id: PixmapId, value: T) -> Option<T> {
        self.entries.insert(id, value)
    }

    pub fn get(&self, id: PixmapId) -> Option<&T> {
        self.entries.get(&id)
    }

    pub fn take(&mut self, id: PixmapId) -> Option<T> {
        self.entries.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consumes the table at screen teardown.
    pub(super) fn into_entries(self) -> impl Iterator<Item = (PixmapId, T)> {
        self.entries.into_iter()
    }
}
