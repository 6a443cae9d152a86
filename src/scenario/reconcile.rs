//! Diff a scenario against live data, then write the difference.
//!
//! [`plan`] decides every write from plain data; [`commit`] performs them in
//! bounded atomic batches: classes and groups first, then end-dates, then
//! rename pairs (delete + create), then new enrollments.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::groups;
use crate::model::{
    now_rfc3339, ClassGroup, ClassRecord, Enrollment, EnrollmentDraft, ScenarioSnapshot,
    StoredEnrollment,
};
use crate::store::{
    class_document, group_document, DocumentStore, StoreError, WriteOp, CLASSES, CLASS_GROUPS,
    ENROLLMENTS,
};

/// Fields owned by the enrollment itself; a draft payload never overrides them.
const RESERVED_FIELDS: [&str; 7] = [
    "studentId",
    "subject",
    "className",
    "startDate",
    "endDate",
    "teacherId",
    "days",
];

/// A renamed class's enrollment: the old document is replaced by a new one.
#[derive(Debug, Clone, PartialEq)]
pub struct RenamedEnrollment {
    pub old_id: String,
    pub enrollment: Enrollment,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilePlan {
    pub subject: String,
    pub today: NaiveDate,
    pub classes: Vec<ClassRecord>,
    pub groups: Vec<(String, ClassGroup)>,
    pub stale_groups: Vec<String>,
    /// Live classes outside the draft whose group will not hold them any more.
    pub ungrouped: Vec<String>,
    /// Old className -> new className, for classes whose id survived.
    pub renamed_classes: BTreeMap<String, String>,
    /// Ids of live enrollments that end today.
    pub end_dated: Vec<String>,
    pub renamed: Vec<RenamedEnrollment>,
    /// New enrollments replacing one that was end-dated.
    pub transferred: Vec<Enrollment>,
    /// Enrollments of students with no active enrollment.
    pub enrolled: Vec<Enrollment>,
    /// Group table problems found in the draft.
    pub warnings: Vec<String>,
}

impl ReconcilePlan {
    pub fn enrollment_writes(&self) -> usize {
        self.end_dated.len() + 2 * self.renamed.len() + self.transferred.len() + self.enrolled.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub classes_written: usize,
    pub groups_written: usize,
    pub groups_deleted: usize,
    #[serde(default)]
    pub classes_ungrouped: usize,
    pub renamed_classes: usize,
    pub end_dated: usize,
    pub renamed_enrollments: usize,
    pub transferred: usize,
    pub enrolled: usize,
    pub batches: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("reconciliation stopped after {committed} committed batches: {source}")]
pub struct CommitError {
    pub committed: usize,
    #[source]
    pub source: StoreError,
}

fn payload_extra(extra: &Map<String, Value>) -> Map<String, Value> {
    extra
        .iter()
        .filter(|(k, _)| !RESERVED_FIELDS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn fresh_enrollment(
    subject: &str,
    student_id: &str,
    class_name: &str,
    payload: &EnrollmentDraft,
    today: NaiveDate,
) -> Enrollment {
    Enrollment {
        student_id: student_id.to_string(),
        subject: subject.to_string(),
        class_name: class_name.to_string(),
        start_date: Some(today),
        end_date: None,
        teacher_id: payload.teacher_id.clone(),
        days: payload.days.clone().unwrap_or_default(),
        extra: payload_extra(&payload.extra),
    }
}

/// The live enrollment under its new class name. Fields the payload carries
/// win; everything else, including the start date, is kept.
fn renamed_enrollment(live: &Enrollment, class_name: &str, payload: &EnrollmentDraft) -> Enrollment {
    let mut out = live.clone();
    out.class_name = class_name.to_string();
    out.end_date = None;
    if let Some(teacher_id) = &payload.teacher_id {
        out.teacher_id = Some(teacher_id.clone());
    }
    if let Some(days) = &payload.days {
        out.days = days.clone();
    }
    out.extra.extend(payload_extra(&payload.extra));
    out
}

/// Compute every write needed to make live data match `draft`.
///
/// All inputs belong to `subject`; `live_enrollments` holds only active
/// enrollments.
pub fn plan(
    subject: &str,
    draft: &ScenarioSnapshot,
    live_classes: &[ClassRecord],
    live_groups: &BTreeMap<String, ClassGroup>,
    live_enrollments: &[StoredEnrollment],
    today: NaiveDate,
) -> ReconcilePlan {
    let live_by_id: BTreeMap<&str, &ClassRecord> =
        live_classes.iter().map(|c| (c.id.as_str(), c)).collect();
    let renamed_classes: BTreeMap<String, String> = draft
        .classes
        .iter()
        .filter_map(|(id, class)| {
            let live = live_by_id.get(id.as_str())?;
            (live.class_name != class.class_name)
                .then(|| (live.class_name.clone(), class.class_name.clone()))
        })
        .collect();

    let classes = draft
        .classes
        .iter()
        .map(|(id, class)| ClassRecord {
            id: id.clone(),
            subject: subject.to_string(),
            ..class.clone()
        })
        .collect();
    let groups = draft
        .groups
        .iter()
        .map(|(id, g)| (id.clone(), g.clone()))
        .collect();
    let stale_groups = live_groups
        .keys()
        .filter(|id| !draft.groups.contains_key(*id))
        .cloned()
        .collect();
    let ungrouped = live_classes
        .iter()
        .filter(|c| !draft.classes.contains_key(&c.id))
        .filter(|c| {
            c.class_group_id.as_ref().is_some_and(|gid| {
                !draft
                    .groups
                    .get(gid)
                    .is_some_and(|g| g.contains(&c.id))
            })
        })
        .map(|c| c.id.clone())
        .collect();

    // studentId -> (className, payload); the first class wins for a student
    // listed twice.
    let mut wanted: BTreeMap<&str, (&str, &EnrollmentDraft)> = BTreeMap::new();
    for (class_name, students) in &draft.enrollments {
        for (student_id, payload) in students {
            wanted
                .entry(student_id.as_str())
                .or_insert((class_name.as_str(), payload));
        }
    }

    let mut current: BTreeMap<&str, Vec<&StoredEnrollment>> = BTreeMap::new();
    for e in live_enrollments.iter().filter(|e| e.enrollment.is_active()) {
        current
            .entry(e.enrollment.student_id.as_str())
            .or_default()
            .push(e);
    }

    let mut end_dated = Vec::new();
    let mut renamed = Vec::new();
    let mut transferred = Vec::new();
    for (student_id, entries) in &current {
        let Some((class_name, payload)) = wanted.get(student_id) else {
            end_dated.extend(entries.iter().map(|e| e.id.clone()));
            continue;
        };
        let mut placed = entries.iter().any(|e| e.enrollment.class_name == *class_name);
        for e in entries {
            if e.enrollment.class_name == *class_name {
                continue;
            }
            if placed {
                end_dated.push(e.id.clone());
                continue;
            }
            placed = true;
            let is_rename = renamed_classes
                .get(&e.enrollment.class_name)
                .is_some_and(|new| new.as_str() == *class_name);
            if is_rename {
                renamed.push(RenamedEnrollment {
                    old_id: e.id.clone(),
                    enrollment: renamed_enrollment(&e.enrollment, class_name, payload),
                });
            } else {
                end_dated.push(e.id.clone());
                transferred.push(fresh_enrollment(subject, student_id, class_name, payload, today));
            }
        }
    }

    let enrolled = wanted
        .iter()
        .filter(|(student_id, _)| !current.contains_key(*student_id))
        .map(|(student_id, (class_name, payload))| {
            fresh_enrollment(subject, student_id, class_name, payload, today)
        })
        .collect();

    ReconcilePlan {
        subject: subject.to_string(),
        today,
        classes,
        groups,
        stale_groups,
        ungrouped,
        renamed_classes,
        end_dated,
        renamed,
        transferred,
        enrolled,
        warnings: groups::violations(&draft.classes, &draft.groups),
    }
}

fn enrollment_doc(e: &Enrollment) -> Result<Value, StoreError> {
    Ok(serde_json::to_value(e)?)
}

/// Write `plan` to live data in batches no larger than the configured limits.
///
/// Batches already committed stay committed when a later one fails.
#[instrument(skip_all, fields(subject = %plan.subject))]
pub async fn commit<D: DocumentStore + ?Sized>(
    plan: &ReconcilePlan,
    docs: &D,
    settings: &EngineSettings,
) -> Result<ReconcileReport, CommitError> {
    for w in &plan.warnings {
        warn!(problem = %w, "draft group table is inconsistent");
    }

    let per_batch = settings.batch_writes();
    let mut report = ReconcileReport {
        renamed_classes: plan.renamed_classes.len(),
        ..ReconcileReport::default()
    };
    let fail = |committed: usize| move |source: StoreError| CommitError { committed, source };

    let mut ops = Vec::new();
    for class in &plan.classes {
        let data = class_document(class).map_err(fail(report.batches))?;
        ops.push(WriteOp::Merge {
            collection: CLASSES.to_string(),
            id: class.id.clone(),
            data,
        });
    }
    for (id, group) in &plan.groups {
        ops.push(WriteOp::Set {
            collection: CLASS_GROUPS.to_string(),
            id: id.clone(),
            data: group_document(&plan.subject, group),
        });
    }
    let ungroup = json!({ "classGroupId": null, "updatedAt": now_rfc3339() });
    for id in &plan.ungrouped {
        ops.push(WriteOp::Merge {
            collection: CLASSES.to_string(),
            id: id.clone(),
            data: ungroup.clone(),
        });
    }
    for id in &plan.stale_groups {
        ops.push(WriteOp::Delete {
            collection: CLASS_GROUPS.to_string(),
            id: id.clone(),
        });
    }
    report.batches += commit_chunks(docs, &ops, per_batch)
        .await
        .map_err(|(done, e)| fail(report.batches + done)(e))?;
    report.classes_written = plan.classes.len();
    report.groups_written = plan.groups.len();
    report.groups_deleted = plan.stale_groups.len();
    report.classes_ungrouped = plan.ungrouped.len();

    let end_date = json!({ "endDate": plan.today });
    let ops: Vec<WriteOp> = plan
        .end_dated
        .iter()
        .map(|id| WriteOp::Merge {
            collection: ENROLLMENTS.to_string(),
            id: id.clone(),
            data: end_date.clone(),
        })
        .collect();
    report.batches += commit_chunks(docs, &ops, per_batch)
        .await
        .map_err(|(done, e)| fail(report.batches + done)(e))?;
    report.end_dated = plan.end_dated.len();

    let mut ops = Vec::with_capacity(plan.renamed.len() * 2);
    for r in &plan.renamed {
        ops.push(WriteOp::Delete {
            collection: ENROLLMENTS.to_string(),
            id: r.old_id.clone(),
        });
        ops.push(WriteOp::Set {
            collection: ENROLLMENTS.to_string(),
            id: Uuid::new_v4().to_string(),
            data: enrollment_doc(&r.enrollment).map_err(fail(report.batches))?,
        });
    }
    let pair_batch = (settings.rename_pairs() * 2).min(per_batch - per_batch % 2).max(2);
    report.batches += commit_chunks(docs, &ops, pair_batch)
        .await
        .map_err(|(done, e)| fail(report.batches + done)(e))?;
    report.renamed_enrollments = plan.renamed.len();

    let mut ops = Vec::with_capacity(plan.transferred.len() + plan.enrolled.len());
    for e in plan.transferred.iter().chain(&plan.enrolled) {
        ops.push(WriteOp::Set {
            collection: ENROLLMENTS.to_string(),
            id: Uuid::new_v4().to_string(),
            data: enrollment_doc(e).map_err(fail(report.batches))?,
        });
    }
    report.batches += commit_chunks(docs, &ops, per_batch)
        .await
        .map_err(|(done, e)| fail(report.batches + done)(e))?;
    report.transferred = plan.transferred.len();
    report.enrolled = plan.enrolled.len();

    info!(
        batches = report.batches,
        end_dated = report.end_dated,
        renamed = report.renamed_enrollments,
        transferred = report.transferred,
        enrolled = report.enrolled,
        "scenario reconciled"
    );
    Ok(report)
}

/// Returns the number of batches committed, or that number with the error.
async fn commit_chunks<D: DocumentStore + ?Sized>(
    docs: &D,
    ops: &[WriteOp],
    per_batch: usize,
) -> Result<usize, (usize, StoreError)> {
    let mut done = 0;
    for chunk in ops.chunks(per_batch.max(1)) {
        docs.commit(chunk.iter().cloned().collect())
            .await
            .map_err(|e| (done, e))?;
        done += 1;
    }
    Ok(done)
}

/// Students by class for a set of live enrollments, as a scenario holds them.
pub fn draft_enrollments(
    enrollments: &[StoredEnrollment],
) -> BTreeMap<String, BTreeMap<String, EnrollmentDraft>> {
    let mut out: BTreeMap<String, BTreeMap<String, EnrollmentDraft>> = BTreeMap::new();
    for e in enrollments.iter().filter(|e| e.enrollment.is_active()) {
        let e = &e.enrollment;
        out.entry(e.class_name.clone()).or_default().insert(
            e.student_id.clone(),
            EnrollmentDraft {
                teacher_id: e.teacher_id.clone(),
                days: Some(e.days.clone()),
                start_date: e.start_date,
                extra: e.extra.clone(),
            },
        );
    }
    out
}
