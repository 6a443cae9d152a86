use tracing::{debug, instrument};

use super::Engine;
use crate::slot::SlotAddress;
use crate::store::StoreResult;

impl Engine {
    /// Take `class_name` out of the cell at `address`.
    ///
    /// When the class leads a group, members sitting in the same cell are
    /// taken out too.
    #[instrument(skip(self), fields(cell = %address))]
    pub async fn remove(&self, address: &str, class_name: &str) -> StoreResult<()> {
        let Some(cell) = SlotAddress::parse(address) else {
            debug!("ignoring removal from invalid cell");
            return Ok(());
        };
        self.take_out(&cell, class_name, true).await?;
        self.invalidate();
        Ok(())
    }

    /// Empty the cell at `address`, regardless of grouping.
    #[instrument(skip(self), fields(cell = %address))]
    pub async fn remove_all(&self, address: &str) -> StoreResult<()> {
        let Some(cell) = SlotAddress::parse(address) else {
            debug!("ignoring removal from invalid cell");
            return Ok(());
        };
        let occupants = self
            .store
            .find_at_slot(&cell.teacher_id, &cell.day, &cell.period_id)
            .await?;
        for occupant in occupants {
            self.vacate(&occupant.id, &cell).await?;
        }
        self.invalidate();
        Ok(())
    }

    /// Returns false when no such class exists.
    pub(crate) async fn take_out(
        &self,
        cell: &SlotAddress,
        class_name: &str,
        cascade: bool,
    ) -> StoreResult<bool> {
        let Some(rec) = self.locate(class_name, &cell.teacher_id).await? else {
            debug!(class = class_name, "no class to remove");
            return Ok(false);
        };

        let led = match (&rec.class_group_id, cascade) {
            (Some(gid), true) => self
                .store
                .group(gid)
                .await?
                .filter(|g| g.leader_id == rec.id),
            _ => None,
        };

        self.vacate(&rec.id, cell).await?;

        if let Some(group) = led {
            for member_id in &group.member_ids {
                let Some(member) = self.store.get(member_id).await? else {
                    continue;
                };
                if member.occupies(cell) {
                    debug!(class = %member.class_name, "removing group member with leader");
                    self.vacate(&member.id, cell).await?;
                }
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::tests::{assert_groups_consistent, engine_over, group_of};
    use crate::model::{MergedPlacement, Placement, ScheduleSlot};
    use crate::store::testing::RecordingStore;

    fn with_companions(primary: &str, names: &[&str]) -> Placement {
        Placement {
            merged: names
                .iter()
                .map(|n| MergedPlacement {
                    class_name: n.to_string(),
                    ..MergedPlacement::default()
                })
                .collect(),
            ..Placement::named(primary)
        }
    }

    #[tokio::test]
    async fn assign_then_remove_restores_class() {
        let store = RecordingStore::new();
        let engine = engine_over(&store);
        engine
            .assign(
                "t1-p1-mon",
                &Placement {
                    room: Some("101".into()),
                    ..Placement::named("A")
                },
            )
            .await
            .expect("mon");
        let before = store.class_named("A");

        engine
            .assign(
                "t1-p2-tue",
                &Placement {
                    room: Some("202".into()),
                    underline: Some(true),
                    ..Placement::named("A")
                },
            )
            .await
            .expect("tue");
        engine.remove("t1-p2-tue", "A").await.expect("remove");

        let after = store.class_named("A");
        assert_eq!(after.schedule, before.schedule);
        assert_eq!(after.slot_rooms, before.slot_rooms);
        assert_eq!(after.slot_teachers, before.slot_teachers);
        assert_eq!(after.slot_underlines, before.slot_underlines);
        assert_eq!(after.is_active, before.is_active);
    }

    #[tokio::test]
    async fn removing_unknown_class_is_a_no_op() {
        let store = RecordingStore::new();
        let engine = engine_over(&store);
        engine.remove("t1-p1-mon", "ghost").await.expect("remove");
        engine.remove("garbage", "ghost").await.expect("remove");
        assert!(store.recorded().is_empty());
    }

    #[tokio::test]
    async fn leader_removal_dissolves_cell_merge() {
        let store = RecordingStore::new();
        let engine = engine_over(&store);
        engine
            .assign("t1-p1-mon", &with_companions("A", &["B", "C"]))
            .await
            .expect("assign");
        engine.remove("t1-p1-mon", "A").await.expect("remove");

        for name in ["A", "B", "C"] {
            let rec = store.class_named(name);
            assert!(!rec.is_active, "{name} still active");
            assert_eq!(rec.class_group_id, None);
        }
        assert!(group_of(&store, "group_t1-p1-mon").is_none());
        assert_groups_consistent(&store);
    }

    #[tokio::test]
    async fn members_elsewhere_keep_their_other_slots() {
        let store = RecordingStore::new();
        let engine = engine_over(&store);
        engine
            .assign("t1-p2-wed", &Placement::named("B"))
            .await
            .expect("b elsewhere");
        engine
            .assign("t1-p1-mon", &with_companions("A", &["B"]))
            .await
            .expect("merge");
        engine.remove("t1-p1-mon", "A").await.expect("remove");

        let b = store.class_named("B");
        assert!(b.is_active);
        assert_eq!(b.schedule, vec![ScheduleSlot::new("wed", "p2")]);
        assert_eq!(b.class_group_id, None);
        assert_groups_consistent(&store);
    }

    #[tokio::test]
    async fn member_removal_keeps_rest_of_group() {
        let store = RecordingStore::new();
        let engine = engine_over(&store);
        engine
            .assign("t1-p1-mon", &with_companions("A", &["B", "C"]))
            .await
            .expect("assign");
        engine.remove("t1-p1-mon", "C").await.expect("remove");

        let group = group_of(&store, "group_t1-p1-mon").expect("group");
        assert_eq!(group.leader_id, store.class_named("A").id);
        assert_eq!(group.member_ids, vec![store.class_named("B").id]);
        assert!(store.class_named("A").is_active);
        assert_groups_consistent(&store);
    }

    #[tokio::test]
    async fn merged_pair_then_remove_all_leaves_both_retired() {
        let store = RecordingStore::new();
        let engine = engine_over(&store);
        engine
            .assign("t1-p1-mon", &with_companions("A", &["B"]))
            .await
            .expect("assign");
        engine.remove_all("t1-p1-mon").await.expect("remove all");

        for name in ["A", "B"] {
            let rec = store.class_named(name);
            assert!(!rec.is_active);
            assert!(rec.schedule.is_empty());
            assert!(rec.slot_rooms.is_empty());
            assert_eq!(rec.class_group_id, None);
        }
        assert!(store.state().groups.is_empty());
    }
}
