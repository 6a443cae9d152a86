use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use super::{ClassStore, Document, DocumentStore, Filter, StoreError, StoreResult};
use crate::model::{ClassGroup, ClassPatch, ClassRecord, Enrollment, StoredEnrollment};
use crate::slot::SlotAddress;

pub const CLASSES: &str = "classes";
pub const CLASS_GROUPS: &str = "class_groups";
pub const ENROLLMENTS: &str = "enrollments";
pub const SCENARIOS: &str = "scenarios";

fn decode<T: DeserializeOwned>(collection: &str, id: &str, data: Value) -> StoreResult<T> {
    serde_json::from_value(data).map_err(|source| StoreError::Malformed {
        collection: collection.to_string(),
        id: id.to_string(),
        source,
    })
}

fn decode_class(doc: Document) -> StoreResult<ClassRecord> {
    let mut record: ClassRecord = decode(CLASSES, &doc.id, doc.data)?;
    record.id = doc.id;
    Ok(record)
}

/// Stored form of a group table entry.
pub fn group_document(subject: &str, group: &ClassGroup) -> Value {
    json!({
        "subject": subject,
        "leaderId": group.leader_id,
        "memberIds": group.member_ids,
    })
}

/// Stored form of a class record; the id lives in the document key.
pub fn class_document(record: &ClassRecord) -> StoreResult<Value> {
    let mut data = serde_json::to_value(record)?;
    if let Some(obj) = data.as_object_mut() {
        obj.remove("id");
    }
    Ok(data)
}

/// Subject-scoped view of the live document collections.
pub struct LiveStore<D> {
    docs: Arc<D>,
    subject: String,
}

impl<D: DocumentStore> LiveStore<D> {
    pub fn new(docs: Arc<D>, subject: impl Into<String>) -> Self {
        Self {
            docs,
            subject: subject.into(),
        }
    }

    fn scoped(&self, extra: &[Filter]) -> Vec<Filter> {
        let mut filters = vec![Filter::eq("subject", self.subject.as_str())];
        filters.extend_from_slice(extra);
        filters
    }

    async fn first_class(&self, filters: &[Filter]) -> StoreResult<Option<ClassRecord>> {
        let docs = self.docs.query(CLASSES, &self.scoped(filters)).await?;
        docs.into_iter().next().map(decode_class).transpose()
    }

    async fn classes(&self, filters: &[Filter]) -> StoreResult<Vec<ClassRecord>> {
        let docs = self.docs.query(CLASSES, &self.scoped(filters)).await?;
        docs.into_iter().map(decode_class).collect()
    }

    /// Group table entries of this subject.
    pub async fn groups(&self) -> StoreResult<BTreeMap<String, ClassGroup>> {
        let docs = self.docs.query(CLASS_GROUPS, &self.scoped(&[])).await?;
        docs.into_iter()
            .map(|d| {
                let group: ClassGroup = decode(CLASS_GROUPS, &d.id, d.data)?;
                Ok((d.id, group))
            })
            .collect()
    }

    pub async fn enrollments(&self, student_id: Option<&str>) -> StoreResult<Vec<StoredEnrollment>> {
        let mut extra = Vec::new();
        if let Some(sid) = student_id {
            extra.push(Filter::eq("studentId", sid));
        }
        let docs = self.docs.query(ENROLLMENTS, &self.scoped(&extra)).await?;
        docs.into_iter()
            .map(|d| {
                let enrollment: Enrollment = decode(ENROLLMENTS, &d.id, d.data)?;
                Ok(StoredEnrollment {
                    id: d.id,
                    enrollment,
                })
            })
            .collect()
    }

    pub async fn active_enrollments(&self) -> StoreResult<Vec<StoredEnrollment>> {
        let all = self.enrollments(None).await?;
        Ok(all
            .into_iter()
            .filter(|e| e.enrollment.is_active())
            .collect())
    }

    /// Write an enrollment of this subject; a fresh id is minted when `id` is `None`.
    pub async fn put_enrollment(
        &self,
        id: Option<&str>,
        mut enrollment: Enrollment,
    ) -> StoreResult<String> {
        enrollment.subject = self.subject.clone();
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.docs
            .set(ENROLLMENTS, &id, serde_json::to_value(&enrollment)?)
            .await?;
        Ok(id)
    }
}

#[async_trait]
impl<D: DocumentStore> ClassStore for LiveStore<D> {
    fn subject(&self) -> &str {
        &self.subject
    }

    async fn get(&self, id: &str) -> StoreResult<Option<ClassRecord>> {
        match self.docs.get(CLASSES, id).await? {
            Some(data) => decode_class(Document {
                id: id.to_string(),
                data,
            })
            .map(Some),
            None => Ok(None),
        }
    }

    async fn find_by_name_and_teacher(
        &self,
        class_name: &str,
        teacher_id: &str,
    ) -> StoreResult<Option<ClassRecord>> {
        self.first_class(&[
            Filter::eq("className", class_name),
            Filter::eq("teacherId", teacher_id),
            Filter::eq("isActive", true),
        ])
        .await
    }

    async fn find_by_name(&self, class_name: &str) -> StoreResult<Option<ClassRecord>> {
        self.first_class(&[
            Filter::eq("className", class_name),
            Filter::eq("isActive", true),
        ])
        .await
    }

    async fn find_retired(&self, class_name: &str) -> StoreResult<Option<ClassRecord>> {
        self.first_class(&[
            Filter::eq("className", class_name),
            Filter::eq("isActive", false),
        ])
        .await
    }

    async fn find_at_slot(
        &self,
        teacher_id: &str,
        day: &str,
        period_id: &str,
    ) -> StoreResult<Vec<ClassRecord>> {
        let addr = SlotAddress::new(teacher_id, period_id, day);
        let active = self.classes(&[Filter::eq("isActive", true)]).await?;
        Ok(active.into_iter().filter(|c| c.occupies(&addr)).collect())
    }

    async fn upsert(&self, id: Option<&str>, patch: ClassPatch) -> StoreResult<String> {
        if let Some(id) = id {
            if self.docs.get(CLASSES, id).await?.is_some() {
                self.docs
                    .merge(CLASSES, id, serde_json::to_value(&patch)?)
                    .await?;
                return Ok(id.to_string());
            }
        }

        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut record = ClassRecord::blank(id.clone(), self.subject.clone());
        patch.apply(&mut record);
        record.subject = self.subject.clone();
        self.docs.set(CLASSES, &id, class_document(&record)?).await?;
        Ok(id)
    }

    async fn group(&self, group_id: &str) -> StoreResult<Option<ClassGroup>> {
        match self.docs.get(CLASS_GROUPS, group_id).await? {
            Some(data) => decode(CLASS_GROUPS, group_id, data).map(Some),
            None => Ok(None),
        }
    }

    async fn put_group(&self, group_id: &str, group: ClassGroup) -> StoreResult<()> {
        self.docs
            .set(CLASS_GROUPS, group_id, group_document(&self.subject, &group))
            .await
    }

    async fn delete_group(&self, group_id: &str) -> StoreResult<()> {
        self.docs.delete(CLASS_GROUPS, group_id).await
    }

    async fn list(&self) -> StoreResult<Vec<ClassRecord>> {
        self.classes(&[]).await
    }
}
