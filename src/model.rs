use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::slot::{slot_key, SlotAddress};

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSlot {
    pub day: String,
    pub period_id: String,
}

impl ScheduleSlot {
    pub fn new(day: impl Into<String>, period_id: impl Into<String>) -> Self {
        Self {
            day: day.into(),
            period_id: period_id.into(),
        }
    }

    pub fn of(addr: &SlotAddress) -> Self {
        Self::new(addr.day.clone(), addr.period_id.clone())
    }

    pub fn key(&self) -> String {
        slot_key(&self.day, &self.period_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRecord {
    #[serde(default)]
    pub id: String,
    pub class_name: String,
    #[serde(default)]
    pub teacher_id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub schedule: Vec<ScheduleSlot>,
    #[serde(default)]
    pub slot_rooms: BTreeMap<String, String>,
    #[serde(default)]
    pub slot_teachers: BTreeMap<String, String>,
    #[serde(default)]
    pub slot_underlines: BTreeMap<String, bool>,
    #[serde(default)]
    pub class_group_id: Option<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl ClassRecord {
    pub fn blank(id: impl Into<String>, subject: impl Into<String>) -> Self {
        let now = now_rfc3339();
        Self {
            id: id.into(),
            class_name: String::new(),
            teacher_id: String::new(),
            subject: subject.into(),
            room: String::new(),
            is_active: false,
            schedule: Vec::new(),
            slot_rooms: BTreeMap::new(),
            slot_teachers: BTreeMap::new(),
            slot_underlines: BTreeMap::new(),
            class_group_id: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn has_slot(&self, slot: &ScheduleSlot) -> bool {
        self.schedule.iter().any(|s| s == slot)
    }

    /// Teacher column the class sits in for the given slot.
    pub fn slot_teacher(&self, slot: &ScheduleSlot) -> &str {
        self.slot_teachers
            .get(&slot.key())
            .map(String::as_str)
            .unwrap_or(&self.teacher_id)
    }

    pub fn occupies(&self, addr: &SlotAddress) -> bool {
        let slot = ScheduleSlot::of(addr);
        self.is_active && self.has_slot(&slot) && self.slot_teacher(&slot) == addr.teacher_id
    }
}

/// Partial update of a class. `None` fields are left untouched; for
/// `class_group_id`, `Some(None)` clears the group.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teacher_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Vec<ScheduleSlot>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot_rooms: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot_teachers: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot_underlines: Option<BTreeMap<String, bool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_group_id: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl ClassPatch {
    pub fn touch() -> Self {
        Self {
            updated_at: Some(now_rfc3339()),
            ..Self::default()
        }
    }

    /// Patch that overwrites every field with the values of `record`.
    pub fn overwrite(record: &ClassRecord) -> Self {
        Self {
            class_name: Some(record.class_name.clone()),
            teacher_id: Some(record.teacher_id.clone()),
            subject: Some(record.subject.clone()),
            room: Some(record.room.clone()),
            is_active: Some(record.is_active),
            schedule: Some(record.schedule.clone()),
            slot_rooms: Some(record.slot_rooms.clone()),
            slot_teachers: Some(record.slot_teachers.clone()),
            slot_underlines: Some(record.slot_underlines.clone()),
            class_group_id: Some(record.class_group_id.clone()),
            created_at: Some(record.created_at.clone()),
            updated_at: Some(now_rfc3339()),
        }
    }

    /// Patch that soft-deletes a class.
    pub fn retire() -> Self {
        Self {
            is_active: Some(false),
            schedule: Some(Vec::new()),
            slot_rooms: Some(BTreeMap::new()),
            slot_teachers: Some(BTreeMap::new()),
            slot_underlines: Some(BTreeMap::new()),
            class_group_id: Some(None),
            ..Self::touch()
        }
    }

    pub fn group(group_id: Option<String>) -> Self {
        Self {
            class_group_id: Some(group_id),
            ..Self::touch()
        }
    }

    pub fn apply(&self, record: &mut ClassRecord) {
        if let Some(v) = &self.class_name {
            record.class_name = v.clone();
        }
        if let Some(v) = &self.teacher_id {
            record.teacher_id = v.clone();
        }
        if let Some(v) = &self.subject {
            record.subject = v.clone();
        }
        if let Some(v) = &self.room {
            record.room = v.clone();
        }
        if let Some(v) = self.is_active {
            record.is_active = v;
        }
        if let Some(v) = &self.schedule {
            record.schedule = v.clone();
        }
        if let Some(v) = &self.slot_rooms {
            record.slot_rooms = v.clone();
        }
        if let Some(v) = &self.slot_teachers {
            record.slot_teachers = v.clone();
        }
        if let Some(v) = &self.slot_underlines {
            record.slot_underlines = v.clone();
        }
        if let Some(v) = &self.class_group_id {
            record.class_group_id = v.clone();
        }
        if let Some(v) = &self.created_at {
            record.created_at = v.clone();
        }
        if let Some(v) = &self.updated_at {
            record.updated_at = v.clone();
        }
    }
}

/// Entry of the group table: one leader plus the other members, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassGroup {
    pub leader_id: String,
    #[serde(default)]
    pub member_ids: Vec<String>,
}

impl ClassGroup {
    pub fn contains(&self, class_id: &str) -> bool {
        self.leader_id == class_id || self.member_ids.iter().any(|m| m == class_id)
    }

    pub fn participants(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.member_ids.len() + 1);
        out.push(self.leader_id.clone());
        out.extend(self.member_ids.iter().cloned());
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedPlacement {
    pub class_name: String,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub underline: Option<bool>,
}

/// What the caller wants to see in a cell.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    #[serde(default)]
    pub class_name: Option<String>,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub teacher_id: Option<String>,
    #[serde(default)]
    pub merged: Vec<MergedPlacement>,
    #[serde(default)]
    pub underline: Option<bool>,
}

impl Placement {
    #[cfg(test)]
    pub fn named(class_name: impl Into<String>) -> Self {
        Self {
            class_name: Some(class_name.into()),
            ..Self::default()
        }
    }
}

/// Class listing entry with the derived group view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassView {
    #[serde(flatten)]
    pub record: ClassRecord,
    pub is_group_leader: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_members: Option<Vec<String>>,
}

impl ClassView {
    pub fn new(record: ClassRecord, group: Option<&ClassGroup>) -> Self {
        let is_group_leader = group.map(|g| g.leader_id == record.id).unwrap_or(false);
        let group_members = group
            .filter(|_| is_group_leader)
            .map(|g| g.member_ids.clone());
        Self {
            record,
            is_group_leader,
            group_members,
        }
    }
}

/// One student's enrollment in one subject's class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    pub student_id: String,
    pub subject: String,
    pub class_name: String,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teacher_id: Option<String>,
    #[serde(default)]
    pub days: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Enrollment {
    pub fn is_active(&self) -> bool {
        self.end_date.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEnrollment {
    pub id: String,
    #[serde(flatten)]
    pub enrollment: Enrollment,
}

/// Scenario-side payload for a student placed in a class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teacher_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A whole subject's timetable held in memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioSnapshot {
    #[serde(default)]
    pub classes: BTreeMap<String, ClassRecord>,
    #[serde(default)]
    pub groups: BTreeMap<String, ClassGroup>,
    /// className -> studentId -> payload
    #[serde(default)]
    pub enrollments: BTreeMap<String, BTreeMap<String, EnrollmentDraft>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_serializes_only_present_fields() {
        let patch = ClassPatch {
            room: Some("201".into()),
            class_group_id: Some(None),
            ..ClassPatch::default()
        };
        let v = serde_json::to_value(&patch).expect("serialize");
        assert_eq!(v, serde_json::json!({ "room": "201", "classGroupId": null }));
    }

    #[test]
    fn occupancy_follows_slot_teacher() {
        let mut rec = ClassRecord::blank("c1", "english");
        rec.class_name = "A".into();
        rec.teacher_id = "t1".into();
        rec.is_active = true;
        rec.schedule.push(ScheduleSlot::new("mon", "p1"));
        assert!(rec.occupies(&SlotAddress::new("t1", "p1", "mon")));

        rec.slot_teachers.insert("mon-p1".into(), "t2".into());
        assert!(!rec.occupies(&SlotAddress::new("t1", "p1", "mon")));
        assert!(rec.occupies(&SlotAddress::new("t2", "p1", "mon")));
    }

    #[test]
    fn enrollment_keeps_unknown_fields() {
        let raw = serde_json::json!({
            "studentId": "s1",
            "subject": "english",
            "className": "A-1",
            "startDate": "2026-03-02",
            "endDate": null,
            "onHold": true
        });
        let e: Enrollment = serde_json::from_value(raw).expect("parse");
        assert!(e.is_active());
        assert_eq!(e.extra.get("onHold"), Some(&serde_json::json!(true)));
        let back = serde_json::to_value(&e).expect("serialize");
        assert_eq!(back["onHold"], serde_json::json!(true));
        assert!(back["endDate"].is_null());
    }
}
