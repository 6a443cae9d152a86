pub mod core;
pub mod enrollments;
pub mod scenario;
pub mod schedule;
pub mod settings;

use chrono::{NaiveDate, Utc};
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::ipc::error::HandlerErr;
use crate::ipc::types::{AppState, Request};
use crate::store::SqliteDocuments;

fn params<T: DeserializeOwned>(req: &Request) -> Result<T, HandlerErr> {
    // A request without params reads as an empty object.
    let raw = match &req.params {
        serde_json::Value::Null => serde_json::json!({}),
        other => other.clone(),
    };
    serde_json::from_value(raw).map_err(|e| HandlerErr::bad_params(e.to_string()))
}

fn workspace_docs(state: &AppState) -> Result<Arc<SqliteDocuments>, HandlerErr> {
    state
        .docs
        .clone()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

fn today_or(date: Option<NaiveDate>) -> NaiveDate {
    date.unwrap_or_else(|| Utc::now().date_naive())
}
