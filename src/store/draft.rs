use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

use super::{ClassStore, StoreError, StoreResult};
use crate::model::{ClassGroup, ClassPatch, ClassRecord, ScenarioSnapshot, ScheduleSlot};

/// Classes and groups of a scenario, as edited by the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DraftState {
    pub classes: BTreeMap<String, ClassRecord>,
    pub groups: BTreeMap<String, ClassGroup>,
}

impl DraftState {
    fn active(&self) -> impl Iterator<Item = &ClassRecord> {
        self.classes.values().filter(|c| c.is_active)
    }
}

/// In-memory store over a caller-owned scenario snapshot.
///
/// Every operation is a synchronous function of the state; the async
/// signatures only exist to share [`ClassStore`] with the live backend.
pub struct DraftStore {
    subject: String,
    state: Mutex<DraftState>,
}

impl DraftStore {
    pub fn new(subject: impl Into<String>, state: DraftState) -> Self {
        Self {
            subject: subject.into(),
            state: Mutex::new(state),
        }
    }

    pub fn from_snapshot(subject: impl Into<String>, snapshot: &ScenarioSnapshot) -> Self {
        Self::new(
            subject,
            DraftState {
                classes: snapshot.classes.clone(),
                groups: snapshot.groups.clone(),
            },
        )
    }

    /// Run `f` with exclusive access to the draft state.
    pub fn update<R>(&self, f: impl FnOnce(&mut DraftState) -> R) -> StoreResult<R> {
        let mut guard = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&mut guard))
    }

    pub fn state(&self) -> StoreResult<DraftState> {
        self.update(|s| s.clone())
    }

    /// Write the draft classes and groups back into `snapshot`.
    pub fn write_into(&self, snapshot: &mut ScenarioSnapshot) -> StoreResult<()> {
        let state = self.state()?;
        snapshot.classes = state.classes;
        snapshot.groups = state.groups;
        Ok(())
    }
}

#[async_trait]
impl ClassStore for DraftStore {
    fn subject(&self) -> &str {
        &self.subject
    }

    async fn get(&self, id: &str) -> StoreResult<Option<ClassRecord>> {
        self.update(|s| s.classes.get(id).cloned())
    }

    async fn find_by_name_and_teacher(
        &self,
        class_name: &str,
        teacher_id: &str,
    ) -> StoreResult<Option<ClassRecord>> {
        self.update(|s| {
            s.active()
                .find(|c| c.class_name == class_name && c.teacher_id == teacher_id)
                .cloned()
        })
    }

    async fn find_by_name(&self, class_name: &str) -> StoreResult<Option<ClassRecord>> {
        self.update(|s| s.active().find(|c| c.class_name == class_name).cloned())
    }

    async fn find_retired(&self, class_name: &str) -> StoreResult<Option<ClassRecord>> {
        self.update(|s| {
            s.classes
                .values()
                .find(|c| !c.is_active && c.class_name == class_name)
                .cloned()
        })
    }

    async fn find_at_slot(
        &self,
        teacher_id: &str,
        day: &str,
        period_id: &str,
    ) -> StoreResult<Vec<ClassRecord>> {
        let slot = ScheduleSlot::new(day, period_id);
        self.update(|s| {
            s.active()
                .filter(|c| c.has_slot(&slot) && c.slot_teacher(&slot) == teacher_id)
                .cloned()
                .collect()
        })
    }

    async fn upsert(&self, id: Option<&str>, patch: ClassPatch) -> StoreResult<String> {
        let subject = self.subject.clone();
        self.update(|s| {
            let id = id
                .map(str::to_string)
                .unwrap_or_else(|| format!("draft_{}", Uuid::new_v4().simple()));
            let record = s
                .classes
                .entry(id.clone())
                .or_insert_with(|| ClassRecord::blank(id.clone(), subject));
            patch.apply(record);
            id
        })
    }

    async fn group(&self, group_id: &str) -> StoreResult<Option<ClassGroup>> {
        self.update(|s| s.groups.get(group_id).cloned())
    }

    async fn put_group(&self, group_id: &str, group: ClassGroup) -> StoreResult<()> {
        self.update(|s| {
            s.groups.insert(group_id.to_string(), group);
        })
    }

    async fn delete_group(&self, group_id: &str) -> StoreResult<()> {
        self.update(|s| {
            s.groups.remove(group_id);
        })
    }

    async fn list(&self) -> StoreResult<Vec<ClassRecord>> {
        self.update(|s| s.classes.values().cloned().collect())
    }
}
