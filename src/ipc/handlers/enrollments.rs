use serde::Deserialize;
use serde_json::json;

use super::{params, workspace_docs};
use crate::ipc::error::{ok, ok_invalidating, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::model::Enrollment;
use crate::store::{LiveStore, ENROLLMENTS};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    #[serde(default)]
    student_id: Option<String>,
    #[serde(default)]
    active_only: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpsertParams {
    #[serde(default)]
    id: Option<String>,
    enrollment: Enrollment,
}

async fn handle_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: ListParams = params(req)?;
    let live = LiveStore::new(workspace_docs(state)?, state.settings.subject.as_str());
    let mut enrollments = live.enrollments(p.student_id.as_deref()).await?;
    if p.active_only {
        enrollments.retain(|e| e.enrollment.is_active());
    }
    Ok(ok(&req.id, json!({ "enrollments": enrollments })))
}

async fn handle_upsert(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: UpsertParams = params(req)?;
    if p.enrollment.student_id.trim().is_empty() || p.enrollment.class_name.trim().is_empty() {
        return Err(HandlerErr::bad_params(
            "enrollment needs studentId and className",
        ));
    }
    let live = LiveStore::new(workspace_docs(state)?, state.settings.subject.as_str());
    let id = live.put_enrollment(p.id.as_deref(), p.enrollment).await?;
    Ok(ok_invalidating(
        &req.id,
        json!({ "id": id }),
        &[ENROLLMENTS.to_string()],
    ))
}

pub async fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let outcome = match req.method.as_str() {
        "enrollments.list" => handle_list(state, req).await,
        "enrollments.upsert" => handle_upsert(state, req).await,
        _ => return None,
    };
    Some(respond(&req.id, outcome))
}
