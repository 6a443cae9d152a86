//! Scenarios: whole-timetable drafts that are applied to live data later.

mod edits;
pub mod reconcile;
pub mod scheduler;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::config::EngineSettings;
use crate::model::{now_rfc3339, ScenarioSnapshot};
use crate::store::{ClassStore, DocumentStore, Filter, LiveStore, StoreError, StoreResult, SCENARIOS};

pub use reconcile::{commit, plan, ReconcileReport};
pub use scheduler::run_due;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyStatus {
    Pending,
    Applied,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResult {
    pub applied_at: String,
    pub applied_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<ReconcileReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub subject: String,
    #[serde(default)]
    pub snapshot: ScenarioSnapshot,
    #[serde(default)]
    pub checksum: String,
    pub created_at: String,
    #[serde(default)]
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_apply_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_status: Option<ApplyStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_result: Option<ApplyResult>,
}

impl Scenario {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        subject: impl Into<String>,
        snapshot: ScenarioSnapshot,
        created_by: impl Into<String>,
    ) -> Self {
        let mut scenario = Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            subject: subject.into(),
            snapshot,
            checksum: String::new(),
            created_at: now_rfc3339(),
            created_by: created_by.into(),
            scheduled_apply_date: None,
            apply_status: None,
            apply_result: None,
        };
        scenario.checksum = checksum(&scenario.snapshot);
        scenario
    }

    pub fn is_due(&self, subject: &str, today: NaiveDate) -> bool {
        self.subject == subject
            && self.apply_status == Some(ApplyStatus::Pending)
            && self.scheduled_apply_date.is_some_and(|d| d <= today)
    }
}

/// SHA-256 over the snapshot's JSON. Every map in the snapshot is ordered,
/// so equal snapshots hash equally.
pub fn checksum(snapshot: &ScenarioSnapshot) -> String {
    let bytes = serde_json::to_vec(snapshot).unwrap_or_default();
    format!("sha256:{}", hex::encode(Sha256::digest(&bytes)))
}

pub async fn load<D: DocumentStore + ?Sized>(docs: &D, id: &str) -> StoreResult<Option<Scenario>> {
    match docs.get(SCENARIOS, id).await? {
        Some(data) => serde_json::from_value(data)
            .map(Some)
            .map_err(|source| StoreError::Malformed {
                collection: SCENARIOS.to_string(),
                id: id.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

pub async fn load_required<D: DocumentStore + ?Sized>(docs: &D, id: &str) -> StoreResult<Scenario> {
    load(docs, id)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("scenario {id}")))
}

/// Persist `scenario`, refreshing its checksum.
pub async fn save<D: DocumentStore + ?Sized>(docs: &D, scenario: &mut Scenario) -> StoreResult<()> {
    scenario.checksum = checksum(&scenario.snapshot);
    docs.set(SCENARIOS, &scenario.id, serde_json::to_value(&*scenario)?)
        .await
}

pub async fn list<D: DocumentStore + ?Sized>(docs: &D, subject: &str) -> StoreResult<Vec<Scenario>> {
    let found = docs
        .query(SCENARIOS, &[Filter::eq("subject", subject)])
        .await?;
    found
        .into_iter()
        .map(|d| {
            serde_json::from_value(d.data).map_err(|source| StoreError::Malformed {
                collection: SCENARIOS.to_string(),
                id: d.id,
                source,
            })
        })
        .collect()
}

/// Copy the live timetable of the store's subject into a snapshot.
pub async fn snapshot_live<D: DocumentStore>(live: &LiveStore<D>) -> StoreResult<ScenarioSnapshot> {
    let classes = live
        .list()
        .await?
        .into_iter()
        .map(|c| (c.id.clone(), c))
        .collect();
    let groups = live.groups().await?;
    let enrollments = reconcile::draft_enrollments(&live.active_enrollments().await?);
    Ok(ScenarioSnapshot {
        classes,
        groups,
        enrollments,
    })
}

/// Start a scenario from the current live data.
pub async fn create<D: DocumentStore>(
    docs: &Arc<D>,
    subject: &str,
    name: &str,
    description: &str,
    created_by: &str,
) -> StoreResult<Scenario> {
    let live = LiveStore::new(docs.clone(), subject);
    let snapshot = snapshot_live(&live).await?;
    let id = format!("scenario_{}", uuid::Uuid::new_v4().simple());
    let mut scenario = Scenario::new(id, name, subject, snapshot, created_by);
    scenario.description = description.to_string();
    save(docs.as_ref(), &mut scenario).await?;
    info!(id = %scenario.id, classes = scenario.snapshot.classes.len(), "scenario created");
    Ok(scenario)
}

/// Change a scenario's name and description; `None` keeps the current value.
pub async fn update_details<D: DocumentStore + ?Sized>(
    docs: &D,
    id: &str,
    name: Option<&str>,
    description: Option<&str>,
) -> StoreResult<Scenario> {
    let mut scenario = load_required(docs, id).await?;
    if let Some(name) = name {
        scenario.name = name.to_string();
    }
    if let Some(description) = description {
        scenario.description = description.to_string();
    }
    save(docs, &mut scenario).await?;
    Ok(scenario)
}

/// Delete a scenario or a backup.
pub async fn delete<D: DocumentStore + ?Sized>(docs: &D, id: &str) -> StoreResult<()> {
    load_required(docs, id).await?;
    docs.delete(SCENARIOS, id).await?;
    info!(id, "scenario deleted");
    Ok(())
}

/// Overwrite a scenario's snapshot with the live data of its subject.
pub async fn refresh<D: DocumentStore>(docs: &Arc<D>, id: &str) -> StoreResult<Scenario> {
    let mut scenario = load_required(docs.as_ref(), id).await?;
    let live = LiveStore::new(docs.clone(), scenario.subject.as_str());
    scenario.snapshot = snapshot_live(&live).await?;
    save(docs.as_ref(), &mut scenario).await?;
    info!(id, classes = scenario.snapshot.classes.len(), "scenario refreshed");
    Ok(scenario)
}

/// Mark a scenario for the scheduler.
pub async fn schedule_apply<D: DocumentStore + ?Sized>(
    docs: &D,
    id: &str,
    date: NaiveDate,
) -> StoreResult<Scenario> {
    let mut scenario = load_required(docs, id).await?;
    scenario.scheduled_apply_date = Some(date);
    scenario.apply_status = Some(ApplyStatus::Pending);
    scenario.apply_result = None;
    save(docs, &mut scenario).await?;
    Ok(scenario)
}

pub async fn record_result<D: DocumentStore + ?Sized>(
    docs: &D,
    id: &str,
    status: ApplyStatus,
    result: &ApplyResult,
) -> StoreResult<()> {
    docs.merge(
        SCENARIOS,
        id,
        serde_json::json!({
            "applyStatus": status,
            "applyResult": result,
        }),
    )
    .await
}

async fn backup_live<D: DocumentStore>(
    docs: &Arc<D>,
    subject: &str,
    applied_by: &str,
    source_id: &str,
) -> StoreResult<String> {
    let live = LiveStore::new(docs.clone(), subject);
    let snapshot = snapshot_live(&live).await?;
    let now = Utc::now();
    let id = format!(
        "backup_{}_{}",
        now.timestamp_millis(),
        uuid::Uuid::new_v4().simple()
    );
    let mut backup = Scenario::new(
        id.clone(),
        format!("backup {}", now.format("%Y-%m-%d %H:%M:%S")),
        subject,
        snapshot,
        format!("{applied_by} (auto)"),
    );
    backup.description = format!("automatic backup before applying {source_id}");
    save(docs.as_ref(), &mut backup).await?;
    Ok(id)
}

async fn reconcile_into_live<D: DocumentStore>(
    docs: &Arc<D>,
    scenario: &Scenario,
    settings: &EngineSettings,
    today: NaiveDate,
) -> Result<ReconcileReport, String> {
    let live = LiveStore::new(docs.clone(), scenario.subject.as_str());
    let classes = live.list().await.map_err(|e| e.to_string())?;
    let groups = live.groups().await.map_err(|e| e.to_string())?;
    let enrollments = live.active_enrollments().await.map_err(|e| e.to_string())?;
    let p = plan(
        &scenario.subject,
        &scenario.snapshot,
        &classes,
        &groups,
        &enrollments,
        today,
    );
    commit(&p, docs.as_ref(), settings)
        .await
        .map_err(|e| e.to_string())
}

/// Back up (when configured) and reconcile one scenario.
///
/// Never fails: the outcome is described by the returned status and result.
#[instrument(skip_all, fields(id = %scenario.id))]
pub async fn execute<D: DocumentStore>(
    docs: &Arc<D>,
    scenario: &Scenario,
    settings: &EngineSettings,
    applied_by: &str,
    today: NaiveDate,
) -> (ApplyStatus, ApplyResult) {
    let mut result = ApplyResult {
        applied_at: now_rfc3339(),
        applied_by: applied_by.to_string(),
        error: None,
        report: None,
        backup_id: None,
    };

    if settings.backup_before_apply {
        match backup_live(docs, &scenario.subject, applied_by, &scenario.id).await {
            Ok(id) => result.backup_id = Some(id),
            Err(e) => {
                warn!(error = %e, "backup failed, scenario not applied");
                result.error = Some(format!("backup failed: {e}"));
                return (ApplyStatus::Failed, result);
            }
        }
    }

    match reconcile_into_live(docs, scenario, settings, today).await {
        Ok(report) => {
            result.report = Some(report);
            (ApplyStatus::Applied, result)
        }
        Err(e) => {
            warn!(error = %e, "scenario apply failed");
            result.error = Some(e);
            (ApplyStatus::Failed, result)
        }
    }
}

/// Apply scenario `id` now and record the outcome on it.
pub async fn apply<D: DocumentStore>(
    docs: &Arc<D>,
    id: &str,
    settings: &EngineSettings,
    applied_by: &str,
    today: NaiveDate,
) -> StoreResult<(ApplyStatus, ApplyResult)> {
    let scenario = load_required(docs.as_ref(), id).await?;
    let (status, result) = execute(docs, &scenario, settings, applied_by, today).await;
    record_result(docs.as_ref(), id, status, &result).await?;
    Ok((status, result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClassPatch, Enrollment, EnrollmentDraft};
    use crate::store::{SqliteDocuments, ENROLLMENTS};
    use serde_json::json;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    async fn seed_live(docs: &Arc<SqliteDocuments>) -> String {
        let live = LiveStore::new(docs.clone(), "english");
        let id = live
            .upsert(
                None,
                ClassPatch {
                    class_name: Some("A-1".into()),
                    teacher_id: Some("t1".into()),
                    is_active: Some(true),
                    ..ClassPatch::touch()
                },
            )
            .await
            .unwrap();
        live.put_enrollment(
            Some("e1"),
            Enrollment {
                student_id: "s1".into(),
                subject: "english".into(),
                class_name: "A-1".into(),
                start_date: Some(day("2026-03-02")),
                end_date: None,
                teacher_id: Some("t1".into()),
                days: vec!["mon".into()],
                extra: Default::default(),
            },
        )
        .await
        .unwrap();
        id
    }

    #[test]
    fn checksum_follows_content() {
        let mut a = ScenarioSnapshot::default();
        let b = a.clone();
        assert_eq!(checksum(&a), checksum(&b));
        a.enrollments
            .entry("A".into())
            .or_default()
            .insert("s1".into(), EnrollmentDraft::default());
        assert_ne!(checksum(&a), checksum(&b));
        assert!(checksum(&a).starts_with("sha256:"));
    }

    #[test]
    fn due_only_when_pending_and_dated() {
        let mut s = Scenario::new("x", "x", "english", ScenarioSnapshot::default(), "me");
        let today = day("2026-10-16");
        assert!(!s.is_due("english", today));
        s.apply_status = Some(ApplyStatus::Pending);
        s.scheduled_apply_date = Some(day("2026-10-17"));
        assert!(!s.is_due("english", today));
        s.scheduled_apply_date = Some(today);
        assert!(s.is_due("english", today));
        assert!(!s.is_due("math", today));
    }

    #[tokio::test]
    async fn create_snapshots_live_data() {
        let docs = Arc::new(SqliteDocuments::in_memory());
        let class_id = seed_live(&docs).await;
        let scenario = create(&docs, "english", "autumn", "", "admin").await.unwrap();

        assert!(scenario.snapshot.classes.contains_key(&class_id));
        assert!(scenario.snapshot.enrollments["A-1"].contains_key("s1"));
        let loaded = load_required(docs.as_ref(), &scenario.id).await.unwrap();
        assert_eq!(loaded.checksum, checksum(&loaded.snapshot));
        assert_eq!(loaded, scenario);
    }

    #[tokio::test]
    async fn apply_renamed_class_with_backup() {
        let docs = Arc::new(SqliteDocuments::in_memory());
        let class_id = seed_live(&docs).await;
        let mut scenario = create(&docs, "english", "rename", "", "admin").await.unwrap();
        assert!(scenario.snapshot.rename_class("A-1", "A-2"));
        save(docs.as_ref(), &mut scenario).await.unwrap();

        let settings = EngineSettings::default();
        let (status, result) = apply(&docs, &scenario.id, &settings, "admin", day("2026-10-16"))
            .await
            .unwrap();
        assert_eq!(status, ApplyStatus::Applied, "{result:?}");
        let report = result.report.expect("report");
        assert_eq!(report.renamed_enrollments, 1);

        let live = LiveStore::new(docs.clone(), "english");
        assert_eq!(live.get(&class_id).await.unwrap().unwrap().class_name, "A-2");
        let enrollments = live.enrollments(Some("s1")).await.unwrap();
        assert_eq!(enrollments.len(), 1);
        assert_eq!(enrollments[0].enrollment.class_name, "A-2");
        assert_eq!(enrollments[0].enrollment.start_date, Some(day("2026-03-02")));
        assert_eq!(enrollments[0].enrollment.end_date, None);

        let backup_id = result.backup_id.expect("backup");
        let backup = load_required(docs.as_ref(), &backup_id).await.unwrap();
        assert!(backup.snapshot.enrollments.contains_key("A-1"));

        let stored = load_required(docs.as_ref(), &scenario.id).await.unwrap();
        assert_eq!(stored.apply_status, Some(ApplyStatus::Applied));
    }

    #[tokio::test]
    async fn apply_without_backup_when_disabled() {
        let docs = Arc::new(SqliteDocuments::in_memory());
        seed_live(&docs).await;
        let mut scenario = create(&docs, "english", "drop", "", "admin").await.unwrap();
        assert!(scenario.snapshot.remove_student("A-1", "s1"));
        save(docs.as_ref(), &mut scenario).await.unwrap();

        let settings = EngineSettings {
            backup_before_apply: false,
            ..EngineSettings::default()
        };
        let (status, result) = apply(&docs, &scenario.id, &settings, "admin", day("2026-10-16"))
            .await
            .unwrap();
        assert_eq!(status, ApplyStatus::Applied);
        assert_eq!(result.backup_id, None);
        assert_eq!(list(docs.as_ref(), "english").await.unwrap().len(), 1);

        let e1 = docs.get(ENROLLMENTS, "e1").await.unwrap().unwrap();
        assert_eq!(e1["endDate"], json!("2026-10-16"));
    }

    #[tokio::test]
    async fn details_update_keeps_snapshot() {
        let docs = Arc::new(SqliteDocuments::in_memory());
        seed_live(&docs).await;
        let created = create(&docs, "english", "autumn", "first", "admin").await.unwrap();

        let renamed = update_details(docs.as_ref(), &created.id, Some("winter"), None)
            .await
            .unwrap();
        assert_eq!(renamed.name, "winter");
        assert_eq!(renamed.description, "first");
        assert_eq!(renamed.snapshot, created.snapshot);

        let described = update_details(docs.as_ref(), &created.id, None, Some("second"))
            .await
            .unwrap();
        assert_eq!(described.name, "winter");
        assert_eq!(described.description, "second");
    }

    #[tokio::test]
    async fn refresh_replaces_snapshot_with_live_data() {
        let docs = Arc::new(SqliteDocuments::in_memory());
        seed_live(&docs).await;
        let mut scenario = create(&docs, "english", "autumn", "", "admin").await.unwrap();
        assert!(scenario.snapshot.rename_class("A-1", "Z-9"));
        scenario.scheduled_apply_date = Some(day("2026-11-01"));
        scenario.apply_status = Some(ApplyStatus::Pending);
        save(docs.as_ref(), &mut scenario).await.unwrap();

        let refreshed = refresh(&docs, &scenario.id).await.unwrap();
        assert!(refreshed.snapshot.enrollments.contains_key("A-1"));
        assert!(!refreshed.snapshot.enrollments.contains_key("Z-9"));
        assert_ne!(refreshed.checksum, scenario.checksum);
        assert_eq!(refreshed.name, "autumn");
        assert_eq!(refreshed.scheduled_apply_date, Some(day("2026-11-01")));
        assert_eq!(refreshed.apply_status, Some(ApplyStatus::Pending));
        assert_eq!(load_required(docs.as_ref(), &scenario.id).await.unwrap(), refreshed);
    }

    #[tokio::test]
    async fn delete_removes_scenario_once() {
        let docs = Arc::new(SqliteDocuments::in_memory());
        let scenario = create(&docs, "english", "gone", "", "admin").await.unwrap();
        delete(docs.as_ref(), &scenario.id).await.unwrap();
        assert_eq!(load(docs.as_ref(), &scenario.id).await.unwrap(), None);
        let err = delete(docs.as_ref(), &scenario.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn unknown_scenario_is_not_found() {
        let docs = Arc::new(SqliteDocuments::in_memory());
        let err = apply(
            &docs,
            "missing",
            &EngineSettings::default(),
            "admin",
            day("2026-10-16"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
