//! Store wrappers used by unit tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{ClassStore, DraftState, DraftStore, StoreError, StoreResult};
use crate::model::{ClassGroup, ClassPatch, ClassRecord};

/// Forwards to a draft store and keeps every upsert payload.
/// Can be told to fail one upsert after a number of successful ones.
pub struct RecordingStore {
    pub inner: DraftStore,
    pub patches: Mutex<Vec<(Option<String>, ClassPatch)>>,
    upserts: AtomicUsize,
    fail_after: Mutex<Option<usize>>,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: DraftStore::new("english", DraftState::default()),
            patches: Mutex::new(Vec::new()),
            upserts: AtomicUsize::new(0),
            fail_after: Mutex::new(None),
        })
    }

    /// Let `n` more upserts succeed, then fail the next one once.
    pub fn fail_after(&self, n: usize) {
        let done = self.upserts.load(Ordering::SeqCst);
        *self.fail_after.lock().unwrap() = Some(done + n);
    }

    pub fn recorded(&self) -> Vec<(Option<String>, ClassPatch)> {
        self.patches.lock().unwrap().clone()
    }

    pub fn clear_recorded(&self) {
        self.patches.lock().unwrap().clear();
    }

    pub fn state(&self) -> DraftState {
        self.inner.state().unwrap()
    }

    pub fn class_named(&self, name: &str) -> ClassRecord {
        self.state()
            .classes
            .into_values()
            .find(|c| c.class_name == name)
            .unwrap_or_else(|| panic!("no class named {name}"))
    }
}

#[async_trait]
impl ClassStore for RecordingStore {
    fn subject(&self) -> &str {
        self.inner.subject()
    }

    async fn get(&self, id: &str) -> StoreResult<Option<ClassRecord>> {
        self.inner.get(id).await
    }

    async fn find_by_name_and_teacher(
        &self,
        class_name: &str,
        teacher_id: &str,
    ) -> StoreResult<Option<ClassRecord>> {
        self.inner.find_by_name_and_teacher(class_name, teacher_id).await
    }

    async fn find_by_name(&self, class_name: &str) -> StoreResult<Option<ClassRecord>> {
        self.inner.find_by_name(class_name).await
    }

    async fn find_retired(&self, class_name: &str) -> StoreResult<Option<ClassRecord>> {
        self.inner.find_retired(class_name).await
    }

    async fn find_at_slot(
        &self,
        teacher_id: &str,
        day: &str,
        period_id: &str,
    ) -> StoreResult<Vec<ClassRecord>> {
        self.inner.find_at_slot(teacher_id, day, period_id).await
    }

    async fn upsert(&self, id: Option<&str>, patch: ClassPatch) -> StoreResult<String> {
        let n = self.upserts.fetch_add(1, Ordering::SeqCst);
        {
            let mut limit = self.fail_after.lock().unwrap();
            if *limit == Some(n) {
                *limit = None;
                return Err(StoreError::Unavailable("injected failure".into()));
            }
        }
        self.patches
            .lock()
            .unwrap()
            .push((id.map(str::to_string), patch.clone()));
        self.inner.upsert(id, patch).await
    }

    async fn group(&self, group_id: &str) -> StoreResult<Option<ClassGroup>> {
        self.inner.group(group_id).await
    }

    async fn put_group(&self, group_id: &str, group: ClassGroup) -> StoreResult<()> {
        self.inner.put_group(group_id, group).await
    }

    async fn delete_group(&self, group_id: &str) -> StoreResult<()> {
        self.inner.delete_group(group_id).await
    }

    async fn list(&self) -> StoreResult<Vec<ClassRecord>> {
        self.inner.list().await
    }
}
