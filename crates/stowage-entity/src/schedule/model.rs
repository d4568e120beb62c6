//! Schedule entity model.

use serde::{Deserialize, Serialize};

/// A backup schedule. Only the fields the storage lifecycle touches are
/// modelled here; the cron side lives with the external scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    /// Unique schedule identifier.
    pub id: i64,
    /// Human-readable name.
    pub name: String,
    /// Whether the schedule fires.
    pub active: bool,
    /// Storages each scheduled package is queued for.
    pub storage_ids: Vec<i64>,
}

impl Schedule {
    /// Drop a storage from this schedule. A schedule left without any
    /// storage is deactivated. Returns `true` when anything changed.
    pub fn detach_storage(&mut self, storage_id: i64) -> bool {
        let before = self.storage_ids.len();
        self.storage_ids.retain(|id| *id != storage_id);
        let changed = self.storage_ids.len() != before;
        if changed && self.storage_ids.is_empty() {
            self.active = false;
        }
        changed
    }
}
