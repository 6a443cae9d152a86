//! Storage strategies for class records.
//!
//! The engine only ever talks to [`ClassStore`]. Two implementations exist:
//!
//! - [`DraftStore`]: an in-memory scenario snapshot, mutated synchronously.
//! - [`LiveStore`]: subject-scoped collections in a [`DocumentStore`].
//!
//! The strategy is picked when the engine is constructed.

mod documents;
mod draft;
mod live;
#[cfg(test)]
pub mod testing;

use async_trait::async_trait;

use crate::model::{ClassGroup, ClassPatch, ClassRecord, ScheduleSlot};

pub use documents::{Document, DocumentStore, Filter, SqliteDocuments, WriteOp, MAX_BATCH_WRITES};
#[cfg(test)]
pub use documents::WriteBatch;
pub use draft::DraftStore;
#[cfg(test)]
pub use draft::DraftState;
pub use live::{
    class_document, group_document, LiveStore, CLASSES, CLASS_GROUPS, ENROLLMENTS, SCENARIOS,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("malformed document {collection}/{id}: {source}")]
    Malformed {
        collection: String,
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("write batch of {len} operations exceeds limit of {limit}")]
    BatchTooLarge { len: usize, limit: usize },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store lock poisoned")]
    Poisoned,

    /// Raised by test doubles standing in for a failing backend.
    #[cfg(test)]
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of taking one slot out of a class schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRemoval {
    /// The class did not hold the slot.
    Absent,
    /// The slot was removed; the class still has other slots.
    Removed,
    /// The slot was the last one; the class is now inactive.
    Deactivated,
}

#[async_trait]
pub trait ClassStore: Send + Sync {
    /// Subject every query of this store is scoped to.
    fn subject(&self) -> &str;

    async fn get(&self, id: &str) -> StoreResult<Option<ClassRecord>>;

    async fn find_by_name_and_teacher(
        &self,
        class_name: &str,
        teacher_id: &str,
    ) -> StoreResult<Option<ClassRecord>>;

    async fn find_by_name(&self, class_name: &str) -> StoreResult<Option<ClassRecord>>;

    /// Inactive class with this name, if one was retired earlier.
    async fn find_retired(&self, class_name: &str) -> StoreResult<Option<ClassRecord>>;

    /// Active classes currently sitting in the (teacher, day, period) cell.
    async fn find_at_slot(
        &self,
        teacher_id: &str,
        day: &str,
        period_id: &str,
    ) -> StoreResult<Vec<ClassRecord>>;

    /// Merge `patch` into class `id`, or create a class when `id` is `None`
    /// or unknown. Returns the id written.
    async fn upsert(&self, id: Option<&str>, patch: ClassPatch) -> StoreResult<String>;

    async fn group(&self, group_id: &str) -> StoreResult<Option<ClassGroup>>;

    async fn put_group(&self, group_id: &str, group: ClassGroup) -> StoreResult<()>;

    async fn delete_group(&self, group_id: &str) -> StoreResult<()>;

    /// All classes of the subject, active or not.
    async fn list(&self) -> StoreResult<Vec<ClassRecord>>;

    /// Take `slot` out of the class, retiring it when the schedule empties.
    async fn remove_slot(
        &self,
        record: &ClassRecord,
        slot: &ScheduleSlot,
    ) -> StoreResult<SlotRemoval> {
        match slot_removal_patch(record, slot) {
            None => Ok(SlotRemoval::Absent),
            Some((patch, outcome)) => {
                self.upsert(Some(&record.id), patch).await?;
                Ok(outcome)
            }
        }
    }
}

/// Patch that removes `slot` from `record`, or `None` when it is not there.
pub fn slot_removal_patch(
    record: &ClassRecord,
    slot: &ScheduleSlot,
) -> Option<(ClassPatch, SlotRemoval)> {
    if !record.has_slot(slot) {
        return None;
    }
    let schedule: Vec<ScheduleSlot> = record
        .schedule
        .iter()
        .filter(|s| *s != slot)
        .cloned()
        .collect();
    if schedule.is_empty() {
        return Some((ClassPatch::retire(), SlotRemoval::Deactivated));
    }

    let key = slot.key();
    let mut slot_rooms = record.slot_rooms.clone();
    slot_rooms.remove(&key);
    let mut slot_teachers = record.slot_teachers.clone();
    slot_teachers.remove(&key);
    let mut slot_underlines = record.slot_underlines.clone();
    slot_underlines.remove(&key);

    let patch = ClassPatch {
        schedule: Some(schedule),
        slot_rooms: Some(slot_rooms),
        slot_teachers: Some(slot_teachers),
        slot_underlines: Some(slot_underlines),
        ..ClassPatch::touch()
    };
    Some((patch, SlotRemoval::Removed))
}
