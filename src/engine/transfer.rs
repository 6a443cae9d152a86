//! Moves between cells, run as a saga.
//!
//! Each phase is preceded by a checkpoint holding copies of every class and
//! group entry the phase can reach. When a phase fails, checkpoints are
//! restored newest first and the phase's error is returned.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use tracing::{debug, error, instrument, warn};

use super::Engine;
use crate::groups;
use crate::model::{ClassGroup, ClassPatch, ClassRecord, MergedPlacement, Placement};
use crate::slot::SlotAddress;
use crate::store::{StoreError, StoreResult};

/// One class taking part in a selective move.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovedClass {
    pub class_name: String,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub underline: Option<bool>,
}

struct Checkpoint {
    phase: &'static str,
    classes: Vec<ClassRecord>,
    groups: Vec<(String, Option<ClassGroup>)>,
    /// Names without any record when the checkpoint was taken.
    absent: Vec<String>,
}

fn unchanged(before: &ClassRecord, now: &ClassRecord) -> bool {
    let mut before = before.clone();
    before.updated_at.clone_from(&now.updated_at);
    before == *now
}

impl Engine {
    /// Remove `class_name` from `source` and assign it at `target`.
    #[instrument(skip(self, merged), fields(%source, %target))]
    pub async fn move_class(
        &self,
        source: &str,
        target: &str,
        class_name: &str,
        room: Option<&str>,
        merged: &[MergedPlacement],
    ) -> StoreResult<()> {
        let (Some(src), Some(dst)) = (SlotAddress::parse(source), SlotAddress::parse(target))
        else {
            debug!("ignoring move with invalid cell");
            return Ok(());
        };
        if class_name.is_empty() {
            return Ok(());
        }

        let mut names = vec![class_name];
        names.extend(merged.iter().map(|m| m.class_name.as_str()));
        let cells = [&src, &dst];
        let mut saga = Vec::new();

        self.phase(
            &mut saga,
            "remove",
            &cells,
            &names,
            self.take_out(&src, class_name, true),
        )
        .await?;

        let placement = Placement {
            class_name: Some(class_name.to_string()),
            room: room.map(str::to_string),
            teacher_id: Some(dst.teacher_id.clone()),
            merged: merged.to_vec(),
            underline: None,
        };
        self.phase(
            &mut saga,
            "assign",
            &cells,
            &names,
            self.place(&dst, class_name, &placement),
        )
        .await?;

        self.invalidate();
        Ok(())
    }

    /// Split a cell: `to_move` goes to `target` as one placement, `to_keep`
    /// stays at `source` and is regrouped there.
    #[instrument(skip(self, to_move, to_keep), fields(%source, %target))]
    pub async fn move_selected_classes(
        &self,
        source: &str,
        target: &str,
        to_move: &[MovedClass],
        to_keep: &[MovedClass],
    ) -> StoreResult<()> {
        let (Some(src), Some(dst)) = (SlotAddress::parse(source), SlotAddress::parse(target))
        else {
            debug!("ignoring move with invalid cell");
            return Ok(());
        };

        let names: Vec<&str> = to_move
            .iter()
            .chain(to_keep)
            .map(|c| c.class_name.as_str())
            .filter(|n| !n.is_empty())
            .collect();
        let cells = [&src, &dst];
        let mut saga = Vec::new();

        self.phase(&mut saga, "detach", &cells, &names, async {
            for moved in to_move {
                self.take_out(&src, &moved.class_name, false).await?;
            }
            Ok(())
        })
        .await?;

        if let Some((first, rest)) = to_move.split_first() {
            let placement = Placement {
                class_name: Some(first.class_name.clone()),
                room: first.room.clone(),
                teacher_id: Some(dst.teacher_id.clone()),
                merged: rest
                    .iter()
                    .map(|m| MergedPlacement {
                        class_name: m.class_name.clone(),
                        room: m.room.clone(),
                        underline: m.underline,
                    })
                    .collect(),
                underline: first.underline,
            };
            self.phase(
                &mut saga,
                "assign",
                &cells,
                &names,
                self.place(&dst, &first.class_name, &placement),
            )
            .await?;
        }

        self.phase(
            &mut saga,
            "regroup",
            &cells,
            &names,
            self.regroup(&src, to_keep),
        )
        .await?;

        self.invalidate();
        Ok(())
    }

    async fn regroup(&self, cell: &SlotAddress, to_keep: &[MovedClass]) -> StoreResult<()> {
        let mut ids = Vec::with_capacity(to_keep.len());
        for kept in to_keep {
            match self.locate(&kept.class_name, &cell.teacher_id).await? {
                Some(rec) => ids.push(rec.id),
                None => debug!(class = %kept.class_name, "kept class not found"),
            }
        }
        match ids.split_first() {
            Some((leader, members)) if !members.is_empty() => {
                groups::form(self.store(), &cell.group_id(), leader, members).await
            }
            Some((only, _)) => groups::detach(self.store(), only).await,
            None => Ok(()),
        }
    }

    async fn phase<T>(
        &self,
        saga: &mut Vec<Checkpoint>,
        phase: &'static str,
        cells: &[&SlotAddress],
        names: &[&str],
        work: impl Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        match self.checkpoint(phase, cells, names).await {
            Ok(cp) => saga.push(cp),
            Err(err) => return Err(self.compensate(saga, err).await),
        }
        match work.await {
            Ok(v) => Ok(v),
            Err(err) => Err(self.compensate(saga, err).await),
        }
    }

    async fn checkpoint(
        &self,
        phase: &'static str,
        cells: &[&SlotAddress],
        names: &[&str],
    ) -> StoreResult<Checkpoint> {
        let mut classes: BTreeMap<String, ClassRecord> = BTreeMap::new();
        let mut group_ids: BTreeSet<String> = cells.iter().map(|c| c.group_id()).collect();
        let mut absent = Vec::new();

        for cell in cells {
            for rec in self
                .store
                .find_at_slot(&cell.teacher_id, &cell.day, &cell.period_id)
                .await?
            {
                classes.insert(rec.id.clone(), rec);
            }
        }
        for name in names {
            let found = match self.store.find_by_name(name).await? {
                Some(rec) => Some(rec),
                None => self.store.find_retired(name).await?,
            };
            match found {
                Some(rec) => {
                    classes.insert(rec.id.clone(), rec);
                }
                None => absent.push(name.to_string()),
            }
        }

        group_ids.extend(classes.values().filter_map(|c| c.class_group_id.clone()));
        let mut groups = Vec::with_capacity(group_ids.len());
        for gid in group_ids {
            let entry = self.store.group(&gid).await?;
            if let Some(g) = &entry {
                for id in g.participants() {
                    if classes.contains_key(&id) {
                        continue;
                    }
                    if let Some(rec) = self.store.get(&id).await? {
                        classes.insert(id, rec);
                    }
                }
            }
            groups.push((gid, entry));
        }

        Ok(Checkpoint {
            phase,
            classes: classes.into_values().collect(),
            groups,
            absent,
        })
    }

    async fn compensate(&self, saga: &mut Vec<Checkpoint>, err: StoreError) -> StoreError {
        warn!(error = %err, phases = saga.len(), "move failed, rolling back");
        while let Some(cp) = saga.pop() {
            if let Err(e) = self.restore(&cp).await {
                error!(phase = cp.phase, error = %e, "rollback failed");
            }
        }
        err
    }

    async fn restore(&self, cp: &Checkpoint) -> StoreResult<()> {
        for name in &cp.absent {
            if let Some(created) = self.store.find_by_name(name).await? {
                debug!(class = %name, "retiring class created by failed move");
                self.store
                    .upsert(Some(&created.id), ClassPatch::retire())
                    .await?;
            }
        }
        for before in &cp.classes {
            let now = self.store.get(&before.id).await?;
            if matches!(&now, Some(now) if unchanged(before, now)) {
                continue;
            }
            self.store
                .upsert(Some(&before.id), ClassPatch::overwrite(before))
                .await?;
        }
        for (gid, entry) in &cp.groups {
            match entry {
                Some(g) => self.store.put_group(gid, g.clone()).await?,
                None => self.store.delete_group(gid).await?,
            }
        }
        Ok(())
    }
}
