//! Group table maintenance.
//!
//! A merged cell is one [`ClassGroup`] entry (leader plus members) keyed by
//! group id; each participating class carries only that id. All edits of
//! group membership go through this module so that the entry and the ids on
//! the classes never disagree.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::model::{ClassGroup, ClassPatch, ClassRecord};
use crate::store::{ClassStore, StoreResult};

async fn clear_membership(store: &dyn ClassStore, class_id: &str, group_id: &str) -> StoreResult<()> {
    if let Some(rec) = store.get(class_id).await? {
        if rec.class_group_id.as_deref() == Some(group_id) {
            store.upsert(Some(class_id), ClassPatch::group(None)).await?;
        }
    }
    Ok(())
}

/// Remove `class_id` from the entry of `group_id`, keeping the entry valid.
///
/// A departing leader hands over to the first member. A group left with a
/// single class is dissolved and that class loses its group id. The departing
/// class's own group id is not touched.
pub async fn leave(store: &dyn ClassStore, class_id: &str, group_id: &str) -> StoreResult<()> {
    let Some(mut group) = store.group(group_id).await? else {
        return Ok(());
    };

    if group.leader_id == class_id {
        let mut rest: Vec<String> = group
            .member_ids
            .into_iter()
            .filter(|m| m != class_id)
            .collect();
        match rest.len() {
            0 => store.delete_group(group_id).await?,
            1 => {
                store.delete_group(group_id).await?;
                clear_membership(store, &rest[0], group_id).await?;
            }
            _ => {
                let leader_id = rest.remove(0);
                debug!(group_id, %leader_id, "group leader handed over");
                store
                    .put_group(
                        group_id,
                        ClassGroup {
                            leader_id,
                            member_ids: rest,
                        },
                    )
                    .await?;
            }
        }
    } else if group.member_ids.iter().any(|m| m == class_id) {
        group.member_ids.retain(|m| m != class_id);
        if group.member_ids.is_empty() {
            store.delete_group(group_id).await?;
            clear_membership(store, &group.leader_id, group_id).await?;
        } else {
            store.put_group(group_id, group).await?;
        }
    }
    Ok(())
}

/// Take a class out of whatever group it belongs to.
pub async fn detach(store: &dyn ClassStore, class_id: &str) -> StoreResult<()> {
    let Some(rec) = store.get(class_id).await? else {
        return Ok(());
    };
    let Some(group_id) = rec.class_group_id else {
        return Ok(());
    };
    leave(store, class_id, &group_id).await?;
    store.upsert(Some(class_id), ClassPatch::group(None)).await?;
    Ok(())
}

/// Make `leader_id` and `member_ids` exactly the participants of `group_id`.
///
/// Former participants of `group_id` that are not named lose the id; named
/// classes that belong to another group leave it first.
pub async fn form(
    store: &dyn ClassStore,
    group_id: &str,
    leader_id: &str,
    member_ids: &[String],
) -> StoreResult<()> {
    let mut seen = BTreeSet::from([leader_id.to_string()]);
    let members: Vec<String> = member_ids
        .iter()
        .filter(|m| seen.insert(m.to_string()))
        .cloned()
        .collect();
    if members.is_empty() {
        return Ok(());
    }

    if let Some(old) = store.group(group_id).await? {
        for id in old.participants() {
            if !seen.contains(&id) {
                clear_membership(store, &id, group_id).await?;
            }
        }
    }

    let mut participants = vec![leader_id.to_string()];
    participants.extend(members.iter().cloned());
    for id in &participants {
        let Some(rec) = store.get(id).await? else {
            continue;
        };
        match rec.class_group_id.as_deref() {
            Some(current) if current == group_id => {}
            Some(other) => {
                let other = other.to_string();
                leave(store, id, &other).await?;
                store
                    .upsert(Some(id), ClassPatch::group(Some(group_id.to_string())))
                    .await?;
            }
            None => {
                store
                    .upsert(Some(id), ClassPatch::group(Some(group_id.to_string())))
                    .await?;
            }
        }
    }

    store
        .put_group(
            group_id,
            ClassGroup {
                leader_id: leader_id.to_string(),
                member_ids: members,
            },
        )
        .await
}

/// Check that group entries and class group ids agree.
///
/// Returns one message per violation; an empty list means consistent.
pub fn violations(
    classes: &BTreeMap<String, ClassRecord>,
    groups: &BTreeMap<String, ClassGroup>,
) -> Vec<String> {
    let mut out = Vec::new();
    for (group_id, group) in groups {
        if group.member_ids.is_empty() {
            out.push(format!("{group_id}: group has no members"));
        }
        for id in group.participants() {
            match classes.get(&id) {
                Some(c) if c.class_group_id.as_deref() == Some(group_id.as_str()) => {}
                Some(_) => out.push(format!("{group_id}: {id} does not carry the group id")),
                None => out.push(format!("{group_id}: unknown class {id}")),
            }
        }
    }
    for (id, class) in classes {
        if let Some(group_id) = &class.class_group_id {
            match groups.get(group_id) {
                Some(g) if g.contains(id) => {}
                _ => out.push(format!("{id}: not listed in {group_id}")),
            }
            if !class.is_active {
                out.push(format!("{id}: inactive class keeps group {group_id}"));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DraftState, DraftStore};

    async fn seeded(names: &[&str]) -> DraftStore {
        let store = DraftStore::new("english", DraftState::default());
        for name in names {
            store
                .upsert(
                    Some(*name),
                    ClassPatch {
                        class_name: Some(name.to_string()),
                        is_active: Some(true),
                        ..ClassPatch::touch()
                    },
                )
                .await
                .expect("seed");
        }
        store
    }

    fn assert_consistent(store: &DraftStore) {
        let state = store.state().expect("state");
        let v = violations(&state.classes, &state.groups);
        assert!(v.is_empty(), "violations: {v:?}");
    }

    #[tokio::test]
    async fn form_sets_ids_and_entry() {
        let store = seeded(&["a", "b", "c"]).await;
        form(&store, "g1", "a", &["b".into(), "c".into(), "b".into()])
            .await
            .expect("form");
        let g = store.group("g1").await.expect("group").expect("present");
        assert_eq!(g.leader_id, "a");
        assert_eq!(g.member_ids, vec!["b".to_string(), "c".to_string()]);
        assert_consistent(&store);
    }

    #[tokio::test]
    async fn leader_leaving_hands_over() {
        let store = seeded(&["a", "b", "c"]).await;
        form(&store, "g1", "a", &["b".into(), "c".into()]).await.expect("form");
        detach(&store, "a").await.expect("detach");
        let g = store.group("g1").await.expect("group").expect("present");
        assert_eq!(g.leader_id, "b");
        assert_eq!(g.member_ids, vec!["c".to_string()]);
        assert_consistent(&store);
    }

    #[tokio::test]
    async fn pair_dissolves_when_one_leaves() {
        let store = seeded(&["a", "b"]).await;
        form(&store, "g1", "a", &["b".into()]).await.expect("form");
        detach(&store, "b").await.expect("detach");
        assert!(store.group("g1").await.expect("group").is_none());
        let a = store.get("a").await.expect("get").expect("a");
        assert_eq!(a.class_group_id, None);
        assert_consistent(&store);
    }

    #[tokio::test]
    async fn reforming_moves_classes_between_groups() {
        let store = seeded(&["a", "b", "c"]).await;
        form(&store, "g1", "a", &["b".into()]).await.expect("form g1");
        form(&store, "g2", "c", &["b".into()]).await.expect("form g2");
        assert!(store.group("g1").await.expect("group").is_none());
        let g2 = store.group("g2").await.expect("group").expect("g2");
        assert_eq!(g2.leader_id, "c");
        assert_consistent(&store);
    }
}
