use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;

use super::{params, today_or, workspace_docs};
use crate::engine::CLASSES_TAG;
use crate::ipc::error::{ok, ok_invalidating, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::model::EnrollmentDraft;
use crate::scenario::{self, Scenario};
use crate::store::{ClassStore, LiveStore, SqliteDocuments, ENROLLMENTS};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateParams {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    created_by: Option<String>,
}

#[derive(Deserialize)]
struct IdParams {
    id: String,
}

#[derive(Deserialize)]
struct UpdateParams {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenameClassParams {
    id: String,
    old_name: String,
    new_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StudentParams {
    id: String,
    class_name: String,
    student_id: String,
    #[serde(default)]
    payload: Option<EnrollmentDraft>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoveStudentParams {
    id: String,
    from: String,
    to: String,
    student_id: String,
}

#[derive(Deserialize)]
struct ScheduleParams {
    id: String,
    date: NaiveDate,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApplyParams {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    today: Option<NaiveDate>,
    #[serde(default)]
    applied_by: Option<String>,
}

fn summary(s: &Scenario) -> serde_json::Value {
    json!({
        "id": s.id,
        "name": s.name,
        "subject": s.subject,
        "checksum": s.checksum,
        "classCount": s.snapshot.classes.len(),
        "studentCount": s.snapshot.enrollments.values().map(|m| m.len()).sum::<usize>(),
        "scheduledApplyDate": s.scheduled_apply_date,
        "applyStatus": s.apply_status,
    })
}

/// Load a scenario, edit its snapshot, and save it back.
async fn edit_snapshot<T>(
    docs: &SqliteDocuments,
    id: &str,
    edit: impl FnOnce(&mut Scenario) -> T,
) -> Result<(Scenario, T), HandlerErr> {
    let mut s = scenario::load_required(docs, id).await?;
    let out = edit(&mut s);
    scenario::save(docs, &mut s).await?;
    Ok((s, out))
}

async fn handle_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: CreateParams = params(req)?;
    if p.name.trim().is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    let docs = workspace_docs(state)?;
    let created_by = p.created_by.unwrap_or_else(|| "unknown".to_string());
    let s = scenario::create(
        &docs,
        &state.settings.subject,
        p.name.trim(),
        &p.description,
        &created_by,
    )
    .await?;
    Ok(ok(&req.id, json!({ "scenario": summary(&s) })))
}

async fn handle_get(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: IdParams = params(req)?;
    let docs = workspace_docs(state)?;
    let s = scenario::load_required(docs.as_ref(), &p.id).await?;
    Ok(ok(&req.id, json!({ "scenario": s })))
}

async fn handle_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let docs = workspace_docs(state)?;
    let all = scenario::list(docs.as_ref(), &state.settings.subject).await?;
    let items: Vec<_> = all.iter().map(summary).collect();
    Ok(ok(&req.id, json!({ "scenarios": items })))
}

async fn handle_update(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: UpdateParams = params(req)?;
    let name = p.name.as_deref().map(str::trim);
    if name.is_some_and(str::is_empty) {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    let docs = workspace_docs(state)?;
    let s = scenario::update_details(docs.as_ref(), &p.id, name, p.description.as_deref()).await?;
    Ok(ok(&req.id, json!({ "scenario": summary(&s) })))
}

async fn handle_delete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: IdParams = params(req)?;
    let docs = workspace_docs(state)?;
    scenario::delete(docs.as_ref(), &p.id).await?;
    Ok(ok(&req.id, json!({ "deleted": p.id })))
}

async fn handle_refresh(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: IdParams = params(req)?;
    let docs = workspace_docs(state)?;
    let s = scenario::refresh(&docs, &p.id).await?;
    Ok(ok(&req.id, json!({ "scenario": summary(&s) })))
}

async fn handle_rename_class(
    state: &AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let p: RenameClassParams = params(req)?;
    if p.new_name.trim().is_empty() {
        return Err(HandlerErr::bad_params("newName must not be empty"));
    }
    let docs = workspace_docs(state)?;
    let (s, renamed) = edit_snapshot(&docs, &p.id, |s| {
        s.snapshot.rename_class(&p.old_name, p.new_name.trim())
    })
    .await?;
    Ok(ok(&req.id, json!({ "renamed": renamed, "checksum": s.checksum })))
}

async fn handle_add_student(
    state: &AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let p: StudentParams = params(req)?;
    let docs = workspace_docs(state)?;
    let payload = p.payload.unwrap_or_default();
    let (s, ()) = edit_snapshot(&docs, &p.id, |s| {
        s.snapshot.add_student(&p.class_name, &p.student_id, payload)
    })
    .await?;
    Ok(ok(&req.id, json!({ "added": true, "checksum": s.checksum })))
}

async fn handle_remove_student(
    state: &AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let p: StudentParams = params(req)?;
    let docs = workspace_docs(state)?;
    let (s, removed) = edit_snapshot(&docs, &p.id, |s| {
        s.snapshot.remove_student(&p.class_name, &p.student_id)
    })
    .await?;
    Ok(ok(&req.id, json!({ "removed": removed, "checksum": s.checksum })))
}

async fn handle_move_student(
    state: &AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let p: MoveStudentParams = params(req)?;
    let docs = workspace_docs(state)?;
    let (s, moved) = edit_snapshot(&docs, &p.id, |s| {
        s.snapshot.move_student(&p.from, &p.to, &p.student_id)
    })
    .await?;
    Ok(ok(&req.id, json!({ "moved": moved, "checksum": s.checksum })))
}

async fn handle_schedule(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: ScheduleParams = params(req)?;
    let docs = workspace_docs(state)?;
    let s = scenario::schedule_apply(docs.as_ref(), &p.id, p.date).await?;
    Ok(ok(&req.id, json!({ "scenario": summary(&s) })))
}

async fn handle_plan(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: ApplyParams = params(req)?;
    let Some(id) = p.id else {
        return Err(HandlerErr::bad_params("missing id"));
    };
    let docs = workspace_docs(state)?;
    let s = scenario::load_required(docs.as_ref(), &id).await?;
    let live = LiveStore::new(docs.clone(), s.subject.as_str());
    let plan = scenario::plan(
        &s.subject,
        &s.snapshot,
        &live.list().await?,
        &live.groups().await?,
        &live.active_enrollments().await?,
        today_or(p.today),
    );
    Ok(ok(
        &req.id,
        json!({
            "classes": plan.classes.len(),
            "groups": plan.groups.len(),
            "staleGroups": plan.stale_groups,
            "ungrouped": plan.ungrouped,
            "renamedClasses": plan.renamed_classes,
            "endDated": plan.end_dated.len(),
            "renamed": plan.renamed.len(),
            "transferred": plan.transferred.len(),
            "enrolled": plan.enrolled.len(),
            "enrollmentWrites": plan.enrollment_writes(),
            "warnings": plan.warnings,
        }),
    ))
}

async fn handle_apply(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: ApplyParams = params(req)?;
    let Some(id) = p.id else {
        return Err(HandlerErr::bad_params("missing id"));
    };
    let docs = workspace_docs(state)?;
    let applied_by = p
        .applied_by
        .unwrap_or_else(|| state.settings.applied_by.clone());
    let (status, result) = scenario::apply(
        &docs,
        &id,
        &state.settings,
        &applied_by,
        today_or(p.today),
    )
    .await?;
    Ok(ok_invalidating(
        &req.id,
        json!({ "status": status, "result": result }),
        &[CLASSES_TAG.to_string(), ENROLLMENTS.to_string()],
    ))
}

async fn handle_run_due(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: ApplyParams = params(req)?;
    let docs = workspace_docs(state)?;
    let applied_by = p
        .applied_by
        .unwrap_or_else(|| state.settings.applied_by.clone());
    let summary = scenario::run_due(&docs, &state.settings, today_or(p.today), &applied_by).await?;
    // A failed apply may still have committed some batches.
    let mut tags = Vec::new();
    if !summary.applied.is_empty() || !summary.failed.is_empty() {
        tags.push(CLASSES_TAG.to_string());
        tags.push(ENROLLMENTS.to_string());
    }
    Ok(ok_invalidating(&req.id, json!(summary), &tags))
}

pub async fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let outcome = match req.method.as_str() {
        "scenario.create" => handle_create(state, req).await,
        "scenario.get" => handle_get(state, req).await,
        "scenario.list" => handle_list(state, req).await,
        "scenario.update" => handle_update(state, req).await,
        "scenario.delete" => handle_delete(state, req).await,
        "scenario.refresh" => handle_refresh(state, req).await,
        "scenario.renameClass" => handle_rename_class(state, req).await,
        "scenario.addStudent" => handle_add_student(state, req).await,
        "scenario.removeStudent" => handle_remove_student(state, req).await,
        "scenario.moveStudent" => handle_move_student(state, req).await,
        "scenario.schedule" => handle_schedule(state, req).await,
        "scenario.plan" => handle_plan(state, req).await,
        "scenario.apply" => handle_apply(state, req).await,
        "scenario.runDue" => handle_run_due(state, req).await,
        _ => return None,
    };
    Some(respond(&req.id, outcome))
}
