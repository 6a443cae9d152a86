use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{params, workspace_docs};
use crate::engine::{CellEdit, Engine, MovedClass, PendingInvalidations};
use crate::ipc::error::{ok, ok_invalidating, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::model::{ClassView, MergedPlacement, Placement};
use crate::scenario::{self, Scenario};
use crate::store::{ClassStore, DraftStore, LiveStore, SqliteDocuments};

const BATCH_UPDATE_MAX_EDITS: usize = 5000;

/// One request's engine, over live data or over a scenario's draft.
struct Session {
    engine: Engine,
    pending: Arc<PendingInvalidations>,
    docs: Arc<SqliteDocuments>,
    draft: Option<(Scenario, Arc<DraftStore>)>,
}

impl Session {
    async fn open(state: &AppState, scenario_id: Option<&str>) -> Result<Self, HandlerErr> {
        let docs = workspace_docs(state)?;
        let pending = Arc::new(PendingInvalidations::default());
        let mut draft = None;
        let store: Arc<dyn ClassStore> = match scenario_id {
            Some(id) => {
                let scenario = scenario::load_required(docs.as_ref(), id).await?;
                let store = Arc::new(DraftStore::from_snapshot(
                    scenario.subject.as_str(),
                    &scenario.snapshot,
                ));
                draft = Some((scenario, store.clone()));
                store
            }
            None => Arc::new(LiveStore::new(
                docs.clone(),
                state.settings.subject.as_str(),
            )),
        };
        Ok(Self {
            engine: Engine::new(store, pending.clone()),
            pending,
            docs,
            draft,
        })
    }

    /// Persist a draft session and hand back the tags to invalidate.
    async fn finish(self) -> Result<Vec<String>, HandlerErr> {
        if let Some((mut scenario, store)) = self.draft {
            store.write_into(&mut scenario.snapshot)?;
            scenario::save(self.docs.as_ref(), &mut scenario).await?;
        }
        Ok(self.pending.drain())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Target {
    #[serde(default)]
    scenario_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignParams {
    address: String,
    placement: Placement,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoveParams {
    address: String,
    #[serde(default)]
    class_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoveParams {
    source: String,
    target: String,
    class_name: String,
    #[serde(default)]
    room: Option<String>,
    #[serde(default)]
    merged: Vec<MergedPlacement>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoveSelectedParams {
    source: String,
    target: String,
    #[serde(default)]
    to_move: Vec<MovedClass>,
    #[serde(default)]
    to_keep: Vec<MovedClass>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchParams {
    edits: Vec<CellEdit>,
    #[serde(default)]
    current: Option<BTreeMap<String, Placement>>,
}

async fn open(state: &AppState, req: &Request) -> Result<Session, HandlerErr> {
    let target: Target = params(req)?;
    Session::open(state, target.scenario_id.as_deref()).await
}

async fn handle_assign(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: AssignParams = params(req)?;
    let session = open(state, req).await?;
    session.engine.assign(&p.address, &p.placement).await?;
    let tags = session.finish().await?;
    Ok(ok_invalidating(&req.id, json!({ "address": p.address }), &tags))
}

async fn handle_remove(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: RemoveParams = params(req)?;
    let Some(class_name) = p.class_name.filter(|n| !n.is_empty()) else {
        return Err(HandlerErr::bad_params("missing className"));
    };
    let session = open(state, req).await?;
    session.engine.remove(&p.address, &class_name).await?;
    let tags = session.finish().await?;
    Ok(ok_invalidating(&req.id, json!({ "address": p.address }), &tags))
}

async fn handle_remove_all(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: RemoveParams = params(req)?;
    let session = open(state, req).await?;
    session.engine.remove_all(&p.address).await?;
    let tags = session.finish().await?;
    Ok(ok_invalidating(&req.id, json!({ "address": p.address }), &tags))
}

async fn handle_move(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: MoveParams = params(req)?;
    let session = open(state, req).await?;
    session
        .engine
        .move_class(&p.source, &p.target, &p.class_name, p.room.as_deref(), &p.merged)
        .await?;
    let tags = session.finish().await?;
    Ok(ok_invalidating(&req.id, json!({ "target": p.target }), &tags))
}

async fn handle_move_selected(
    state: &AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let p: MoveSelectedParams = params(req)?;
    let session = open(state, req).await?;
    session
        .engine
        .move_selected_classes(&p.source, &p.target, &p.to_move, &p.to_keep)
        .await?;
    let tags = session.finish().await?;
    Ok(ok_invalidating(
        &req.id,
        json!({ "moved": p.to_move.len(), "kept": p.to_keep.len() }),
        &tags,
    ))
}

async fn handle_batch_update(
    state: &AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let received = req
        .params
        .get("edits")
        .and_then(|v| v.as_array())
        .map(|a| a.len())
        .unwrap_or(0);
    if received > BATCH_UPDATE_MAX_EDITS {
        return Err(HandlerErr::new(
            "too_many_edits",
            format!("batch exceeds max edits: {received} > {BATCH_UPDATE_MAX_EDITS}"),
        )
        .with_details(json!({ "received": received, "limit": BATCH_UPDATE_MAX_EDITS })));
    }

    let p: BatchParams = params(req)?;
    let session = open(state, req).await?;
    let outcome = session
        .engine
        .batch_update(&p.edits, p.current.as_ref())
        .await?;
    let tags = session.finish().await?;
    Ok(ok_invalidating(&req.id, json!(outcome), &tags))
}

async fn handle_classes(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let session = open(state, req).await?;
    let store = session.engine.store();
    let mut views = Vec::new();
    for record in store.list().await? {
        let group = match &record.class_group_id {
            Some(gid) => store.group(gid).await?,
            None => None,
        };
        views.push(ClassView::new(record, group.as_ref()));
    }
    Ok(ok(&req.id, json!({ "classes": views })))
}

pub async fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let outcome = match req.method.as_str() {
        "schedule.assign" => handle_assign(state, req).await,
        "schedule.remove" => handle_remove(state, req).await,
        "schedule.removeAll" => handle_remove_all(state, req).await,
        "schedule.move" => handle_move(state, req).await,
        "schedule.moveSelected" => handle_move_selected(state, req).await,
        "schedule.batchUpdate" => handle_batch_update(state, req).await,
        "schedule.classes" => handle_classes(state, req).await,
        _ => return None,
    };
    Some(respond(&req.id, outcome))
}
