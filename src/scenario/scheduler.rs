use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::{execute, list, record_result, ApplyStatus};
use crate::config::EngineSettings;
use crate::store::{DocumentStore, StoreResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedApply {
    pub id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub applied: Vec<String>,
    pub failed: Vec<FailedApply>,
}

/// Apply every pending scenario of the configured subject whose date has come,
/// earliest date first. A failing scenario does not stop the run.
#[instrument(skip(docs, settings), fields(subject = %settings.subject))]
pub async fn run_due<D: DocumentStore>(
    docs: &Arc<D>,
    settings: &EngineSettings,
    today: NaiveDate,
    applied_by: &str,
) -> StoreResult<RunSummary> {
    let mut due: Vec<_> = list(docs.as_ref(), &settings.subject)
        .await?
        .into_iter()
        .filter(|s| s.is_due(&settings.subject, today))
        .collect();
    due.sort_by(|a, b| {
        a.scheduled_apply_date
            .cmp(&b.scheduled_apply_date)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });

    let mut summary = RunSummary::default();
    for scenario in &due {
        let (status, result) = execute(docs, scenario, settings, applied_by, today).await;
        if let Err(e) = record_result(docs.as_ref(), &scenario.id, status, &result).await {
            warn!(id = %scenario.id, error = %e, "could not record apply status");
        }
        match status {
            ApplyStatus::Applied => summary.applied.push(scenario.id.clone()),
            _ => summary.failed.push(FailedApply {
                id: scenario.id.clone(),
                error: result.error.unwrap_or_default(),
            }),
        }
    }
    info!(
        applied = summary.applied.len(),
        failed = summary.failed.len(),
        "scheduled apply run finished"
    );
    Ok(summary)
}
