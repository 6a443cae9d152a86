//! Timetable cell editing: assignment, removal, moves and batch edits.
//!
//! The engine is backend-agnostic; it is handed a [`ClassStore`] when built
//! and issues every store call sequentially.

mod assign;
mod batch;
mod remove;
mod transfer;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::groups;
use crate::model::{ClassRecord, ScheduleSlot};
use crate::slot::SlotAddress;
use crate::store::{ClassStore, SlotRemoval, StoreResult};

pub use batch::CellEdit;
pub use transfer::MovedClass;

/// Resource tag refreshed by every mutating call.
pub const CLASSES_TAG: &str = "classes";

/// Receiver of cache-invalidation signals.
pub trait InvalidationSink: Send + Sync {
    fn invalidate(&self, tag: &str);
}

/// Collects invalidated tags until the caller drains them.
#[derive(Debug, Default)]
pub struct PendingInvalidations {
    tags: Mutex<BTreeSet<String>>,
}

impl PendingInvalidations {
    pub fn drain(&self) -> Vec<String> {
        match self.tags.lock() {
            Ok(mut tags) => std::mem::take(&mut *tags).into_iter().collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl InvalidationSink for PendingInvalidations {
    fn invalidate(&self, tag: &str) {
        if let Ok(mut tags) = self.tags.lock() {
            tags.insert(tag.to_string());
        }
    }
}

pub struct Engine {
    store: Arc<dyn ClassStore>,
    invalidations: Arc<dyn InvalidationSink>,
}

impl Engine {
    pub fn new(store: Arc<dyn ClassStore>, invalidations: Arc<dyn InvalidationSink>) -> Self {
        Self {
            store,
            invalidations,
        }
    }

    pub fn store(&self) -> &dyn ClassStore {
        self.store.as_ref()
    }

    fn invalidate(&self) {
        self.invalidations.invalidate(CLASSES_TAG);
    }

    /// Find the active class a cell edit refers to.
    ///
    /// Class names are unique within a subject, so a class that has been
    /// moved into another teacher's column is still found by name.
    async fn locate(&self, class_name: &str, teacher_id: &str) -> StoreResult<Option<ClassRecord>> {
        if let Some(rec) = self
            .store
            .find_by_name_and_teacher(class_name, teacher_id)
            .await?
        {
            return Ok(Some(rec));
        }
        self.store.find_by_name(class_name).await
    }

    /// Take the cell's slot out of one class.
    ///
    /// A class that is retired by this leaves its group; a class that keeps
    /// other slots leaves only the group belonging to this cell.
    async fn vacate(&self, class_id: &str, cell: &SlotAddress) -> StoreResult<SlotRemoval> {
        let Some(rec) = self.store.get(class_id).await? else {
            return Ok(SlotRemoval::Absent);
        };
        let slot = ScheduleSlot::of(cell);
        let group_id = rec.class_group_id.clone();
        let outcome = self.store.remove_slot(&rec, &slot).await?;
        match (outcome, group_id) {
            (SlotRemoval::Deactivated, Some(gid)) => {
                debug!(class_id, %cell, "class retired with empty schedule");
                groups::leave(self.store(), class_id, &gid).await?;
            }
            (SlotRemoval::Deactivated, None) => {
                debug!(class_id, %cell, "class retired with empty schedule");
            }
            (SlotRemoval::Removed, Some(gid)) if gid == cell.group_id() => {
                groups::detach(self.store(), class_id).await?;
            }
            _ => {}
        }
        Ok(outcome)
    }
}
