use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

use super::Engine;
use crate::model::Placement;
use crate::store::StoreResult;

/// One grid edit: a placement to write, or `None` to clear the cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellEdit {
    pub address: String,
    #[serde(default)]
    pub data: Option<Placement>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub assigned: usize,
    pub removed: usize,
    pub skipped: usize,
}

impl Engine {
    /// Apply `edits` in order.
    ///
    /// A cleared cell needs `current` to know which class sat there; without
    /// it the edit is skipped. Edits are not atomic as a whole: on error the
    /// earlier ones stay written.
    #[instrument(skip_all, fields(edits = edits.len()))]
    pub async fn batch_update(
        &self,
        edits: &[CellEdit],
        current: Option<&BTreeMap<String, Placement>>,
    ) -> StoreResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for edit in edits {
            match &edit.data {
                Some(placement) if placement.class_name.as_deref().is_some_and(|n| !n.is_empty()) => {
                    self.assign(&edit.address, placement).await?;
                    outcome.assigned += 1;
                }
                Some(_) => outcome.skipped += 1,
                None => {
                    let previous = current
                        .and_then(|snapshot| snapshot.get(&edit.address))
                        .and_then(|p| p.class_name.as_deref());
                    match previous {
                        Some(class_name) => {
                            self.remove(&edit.address, class_name).await?;
                            outcome.removed += 1;
                        }
                        None => {
                            debug!(address = %edit.address, "no previous class for cleared cell");
                            outcome.skipped += 1;
                        }
                    }
                }
            }
        }
        info!(
            assigned = outcome.assigned,
            removed = outcome.removed,
            skipped = outcome.skipped,
            "batch applied"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::engine_over;
    use crate::store::testing::RecordingStore;

    fn edit(address: &str, class_name: Option<&str>) -> CellEdit {
        CellEdit {
            address: address.into(),
            data: class_name.map(Placement::named),
        }
    }

    #[tokio::test]
    async fn mixed_edits_are_counted() {
        let store = RecordingStore::new();
        let engine = engine_over(&store);
        engine
            .assign("t1-p1-mon", &Placement::named("OLD"))
            .await
            .expect("seed");

        let current = BTreeMap::from([("t1-p1-mon".to_string(), Placement::named("OLD"))]);
        let edits = vec![
            edit("t1-p1-mon", None),
            edit("t1-p2-mon", Some("A")),
            edit("t1-p3-mon", None),
            CellEdit {
                address: "t1-p4-mon".into(),
                data: Some(Placement::default()),
            },
        ];
        let outcome = engine
            .batch_update(&edits, Some(&current))
            .await
            .expect("batch");

        assert_eq!(
            outcome,
            BatchOutcome {
                assigned: 1,
                removed: 1,
                skipped: 2
            }
        );
        assert!(!store.class_named("OLD").is_active);
        assert!(store.class_named("A").is_active);
    }

    #[tokio::test]
    async fn cleared_cells_skip_without_snapshot() {
        let store = RecordingStore::new();
        let engine = engine_over(&store);
        engine
            .assign("t1-p1-mon", &Placement::named("A"))
            .await
            .expect("seed");
        let outcome = engine
            .batch_update(&[edit("t1-p1-mon", None)], None)
            .await
            .expect("batch");
        assert_eq!(outcome.skipped, 1);
        assert!(store.class_named("A").is_active);
    }

    #[tokio::test]
    async fn failure_keeps_earlier_edits() {
        let store = RecordingStore::new();
        let engine = engine_over(&store);
        store.fail_after(1);
        let edits = vec![edit("t1-p1-mon", Some("A")), edit("t1-p2-mon", Some("B"))];
        engine
            .batch_update(&edits, None)
            .await
            .expect_err("second edit fails");
        assert!(store.class_named("A").is_active);
        assert!(store.state().classes.values().all(|c| c.class_name != "B"));
    }
}
