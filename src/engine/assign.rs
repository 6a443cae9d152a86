use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, instrument};

use super::Engine;
use crate::groups;
use crate::model::{now_rfc3339, ClassPatch, ClassRecord, Placement, ScheduleSlot};
use crate::slot::SlotAddress;
use crate::store::StoreResult;

/// Patch that puts an existing class into `cell`.
///
/// The schedule is only part of the patch when the slot is new to the class.
pub(crate) fn placement_patch(
    rec: &ClassRecord,
    cell: &SlotAddress,
    room: Option<&str>,
    underline: Option<bool>,
) -> ClassPatch {
    let slot = ScheduleSlot::of(cell);
    let key = slot.key();
    let mut patch = ClassPatch::touch();

    if !rec.has_slot(&slot) {
        let mut schedule = rec.schedule.clone();
        schedule.push(slot);
        patch.schedule = Some(schedule);
    }

    let mut slot_rooms = rec.slot_rooms.clone();
    slot_rooms.insert(key.clone(), room.unwrap_or_default().to_string());
    let mut slot_teachers = rec.slot_teachers.clone();
    slot_teachers.insert(key.clone(), cell.teacher_id.clone());
    let mut slot_underlines = rec.slot_underlines.clone();
    match underline {
        Some(v) => {
            slot_underlines.insert(key, v);
        }
        None => {
            slot_underlines.remove(&key);
        }
    }
    patch.slot_rooms = Some(slot_rooms);
    patch.slot_teachers = Some(slot_teachers);
    patch.slot_underlines = Some(slot_underlines);
    patch
}

/// Patch for a class that starts life (or comes back) in `cell`.
fn fresh_patch(
    subject: &str,
    cell: &SlotAddress,
    class_name: &str,
    teacher_id: &str,
    room: Option<&str>,
    underline: Option<bool>,
) -> ClassPatch {
    let key = cell.slot_key();
    let room = room.unwrap_or_default().to_string();
    let now = now_rfc3339();
    ClassPatch {
        class_name: Some(class_name.to_string()),
        teacher_id: Some(teacher_id.to_string()),
        subject: Some(subject.to_string()),
        room: Some(room.clone()),
        is_active: Some(true),
        schedule: Some(vec![ScheduleSlot::of(cell)]),
        slot_rooms: Some(BTreeMap::from([(key.clone(), room)])),
        slot_teachers: Some(BTreeMap::from([(key.clone(), cell.teacher_id.clone())])),
        slot_underlines: Some(underline.map(|v| (key, v)).into_iter().collect()),
        class_group_id: Some(None),
        created_at: Some(now.clone()),
        updated_at: Some(now),
    }
}

impl Engine {
    /// Place `placement` (and its merged companions) into the cell at `address`.
    ///
    /// Invalid addresses and placements without a class name are ignored.
    #[instrument(skip(self, placement), fields(cell = %address))]
    pub async fn assign(&self, address: &str, placement: &Placement) -> StoreResult<()> {
        let Some(cell) = SlotAddress::parse(address) else {
            debug!("ignoring assignment to invalid cell");
            return Ok(());
        };
        let Some(class_name) = placement.class_name.as_deref().filter(|n| !n.is_empty()) else {
            debug!("ignoring assignment without class name");
            return Ok(());
        };
        self.place(&cell, class_name, placement).await?;
        self.invalidate();
        Ok(())
    }

    /// Returns the id of the primary class.
    pub(crate) async fn place(
        &self,
        cell: &SlotAddress,
        class_name: &str,
        placement: &Placement,
    ) -> StoreResult<String> {
        let mut requested: BTreeSet<&str> = BTreeSet::from([class_name]);
        requested.extend(placement.merged.iter().map(|m| m.class_name.as_str()));

        let occupants = self
            .store
            .find_at_slot(&cell.teacher_id, &cell.day, &cell.period_id)
            .await?;
        for occupant in occupants {
            if !requested.contains(occupant.class_name.as_str()) {
                debug!(class = %occupant.class_name, "evicting occupant");
                self.vacate(&occupant.id, cell).await?;
            }
        }

        let primary_id = self
            .put_in_cell(
                cell,
                class_name,
                placement.teacher_id.as_deref(),
                placement.room.as_deref(),
                placement.underline,
            )
            .await?;

        let companions: Vec<_> = placement
            .merged
            .iter()
            .filter(|m| !m.class_name.is_empty())
            .collect();
        if !companions.is_empty() {
            let mut member_ids = Vec::with_capacity(companions.len());
            for m in companions {
                let id = self
                    .put_in_cell(cell, &m.class_name, None, m.room.as_deref(), m.underline)
                    .await?;
                member_ids.push(id);
            }
            groups::form(self.store(), &cell.group_id(), &primary_id, &member_ids).await?;
        }

        Ok(primary_id)
    }

    async fn put_in_cell(
        &self,
        cell: &SlotAddress,
        class_name: &str,
        teacher_id: Option<&str>,
        room: Option<&str>,
        underline: Option<bool>,
    ) -> StoreResult<String> {
        if let Some(rec) = self.locate(class_name, &cell.teacher_id).await? {
            let patch = placement_patch(&rec, cell, room, underline);
            return self.store.upsert(Some(&rec.id), patch).await;
        }

        let teacher_id = teacher_id.unwrap_or(&cell.teacher_id);
        let patch = fresh_patch(
            self.store.subject(),
            cell,
            class_name,
            teacher_id,
            room,
            underline,
        );
        match self.store.find_retired(class_name).await? {
            Some(retired) => {
                debug!(class = class_name, id = %retired.id, "reactivating retired class");
                let patch = ClassPatch {
                    created_at: None,
                    ..patch
                };
                self.store.upsert(Some(&retired.id), patch).await
            }
            None => self.store.upsert(None, patch).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{assert_groups_consistent, engine_over, group_of};
    use crate::model::MergedPlacement;
    use crate::store::testing::RecordingStore;
    use crate::store::ClassStore;

    fn merged(names: &[&str]) -> Vec<MergedPlacement> {
        names
            .iter()
            .map(|n| MergedPlacement {
                class_name: n.to_string(),
                ..MergedPlacement::default()
            })
            .collect()
    }

    #[tokio::test]
    async fn creates_class_with_single_slot() {
        let store = RecordingStore::new();
        let engine = engine_over(&store);
        let placement = Placement {
            room: Some("301".into()),
            underline: Some(true),
            ..Placement::named("A")
        };
        engine.assign("t1-p1-mon", &placement).await.expect("assign");

        let a = store.class_named("A");
        assert!(a.is_active);
        assert_eq!(a.teacher_id, "t1");
        assert_eq!(a.subject, "english");
        assert_eq!(a.schedule, vec![ScheduleSlot::new("mon", "p1")]);
        assert_eq!(a.slot_rooms.get("mon-p1").map(String::as_str), Some("301"));
        assert_eq!(a.slot_teachers.get("mon-p1").map(String::as_str), Some("t1"));
        assert_eq!(a.slot_underlines.get("mon-p1"), Some(&true));
        assert_eq!(a.class_group_id, None);
    }

    #[tokio::test]
    async fn invalid_input_is_a_no_op() {
        let store = RecordingStore::new();
        let engine = engine_over(&store);
        engine
            .assign("t1-p1", &Placement::named("A"))
            .await
            .expect("assign");
        engine
            .assign("t1-p1-mon", &Placement::default())
            .await
            .expect("assign");
        assert!(store.state().classes.is_empty());
        assert!(store.recorded().is_empty());
    }

    #[tokio::test]
    async fn repeated_assignment_is_idempotent() {
        let store = RecordingStore::new();
        let engine = engine_over(&store);
        let placement = Placement {
            room: Some("301".into()),
            ..Placement::named("A")
        };
        engine.assign("t1-p1-mon", &placement).await.expect("first");
        let before = store.class_named("A");
        store.clear_recorded();

        engine.assign("t1-p1-mon", &placement).await.expect("second");
        let after = store.class_named("A");
        assert_eq!(after.schedule, before.schedule);
        assert_eq!(after.schedule.len(), 1);

        let recorded = store.recorded();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0.as_deref(), Some(before.id.as_str()));
        assert!(recorded[0].1.schedule.is_none());
        let payload = serde_json::to_value(&recorded[0].1).expect("serialize");
        assert!(payload.get("schedule").is_none());
    }

    #[tokio::test]
    async fn adds_second_slot_to_existing_class() {
        let store = RecordingStore::new();
        let engine = engine_over(&store);
        engine
            .assign("t1-p1-mon", &Placement::named("A"))
            .await
            .expect("mon");
        engine
            .assign("t1-p2-wed", &Placement::named("A"))
            .await
            .expect("wed");
        let a = store.class_named("A");
        assert_eq!(store.state().classes.len(), 1);
        assert_eq!(
            a.schedule,
            vec![ScheduleSlot::new("mon", "p1"), ScheduleSlot::new("wed", "p2")]
        );
    }

    #[tokio::test]
    async fn merged_placement_forms_one_group() {
        let store = RecordingStore::new();
        let engine = engine_over(&store);
        let placement = Placement {
            merged: merged(&["B", "C"]),
            ..Placement::named("A")
        };
        engine.assign("t1-p1-mon", &placement).await.expect("assign");

        let (a, b, c) = (
            store.class_named("A"),
            store.class_named("B"),
            store.class_named("C"),
        );
        let group = group_of(&store, "group_t1-p1-mon").expect("group");
        assert_eq!(group.leader_id, a.id);
        assert_eq!(group.member_ids, vec![b.id.clone(), c.id.clone()]);
        for rec in [&a, &b, &c] {
            assert_eq!(rec.class_group_id.as_deref(), Some("group_t1-p1-mon"));
            assert!(rec.has_slot(&ScheduleSlot::new("mon", "p1")));
        }
        assert_groups_consistent(&store);
    }

    #[tokio::test]
    async fn unnamed_occupants_are_evicted() {
        let store = RecordingStore::new();
        let engine = engine_over(&store);
        engine
            .assign("t1-p1-mon", &Placement::named("OLD"))
            .await
            .expect("old");
        engine
            .assign("t1-p1-mon", &Placement::named("NEW"))
            .await
            .expect("new");

        let old = store.class_named("OLD");
        assert!(!old.is_active);
        assert!(old.schedule.is_empty());
        let at_slot = store
            .find_at_slot("t1", "mon", "p1")
            .await
            .expect("occupants");
        assert_eq!(at_slot.len(), 1);
        assert_eq!(at_slot[0].class_name, "NEW");
    }

    #[tokio::test]
    async fn dropping_companion_shrinks_group() {
        let store = RecordingStore::new();
        let engine = engine_over(&store);
        engine
            .assign(
                "t1-p1-mon",
                &Placement {
                    merged: merged(&["B", "C"]),
                    ..Placement::named("A")
                },
            )
            .await
            .expect("three");
        engine
            .assign(
                "t1-p1-mon",
                &Placement {
                    merged: merged(&["B"]),
                    ..Placement::named("A")
                },
            )
            .await
            .expect("two");

        let group = group_of(&store, "group_t1-p1-mon").expect("group");
        assert_eq!(group.member_ids, vec![store.class_named("B").id]);
        let c = store.class_named("C");
        assert!(!c.is_active);
        assert_eq!(c.class_group_id, None);
        assert_groups_consistent(&store);
    }

    #[tokio::test]
    async fn retired_class_is_reactivated_under_same_id() {
        let store = RecordingStore::new();
        let engine = engine_over(&store);
        engine
            .assign("t1-p1-mon", &Placement::named("A"))
            .await
            .expect("assign");
        let id = store.class_named("A").id;
        engine.remove("t1-p1-mon", "A").await.expect("remove");
        assert!(!store.class_named("A").is_active);

        engine
            .assign("t2-p3-fri", &Placement::named("A"))
            .await
            .expect("again");
        let a = store.class_named("A");
        assert_eq!(a.id, id);
        assert!(a.is_active);
        assert_eq!(a.teacher_id, "t2");
        assert_eq!(a.schedule, vec![ScheduleSlot::new("fri", "p3")]);
        assert_eq!(store.state().classes.len(), 1);
    }
}
