//! Mark update engine: validation, authorization and idempotent merge of
//! score submissions into mark records.

use crate::directory::{StudentDirectory, TeacherDirectory};
use crate::error::MarksError;
use crate::model::{
    Breakdown, EntryView, ExamEntry, ExamPolicy, ExamPolicyTable, MarkRecord, Outcome, Principal,
    Role, ScoreInput, Student, ABSENT_MARKER,
};
use crate::store::{MarkStore, RecordFilter};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

pub const SUBMIT_MAX_ITEMS: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    LastWriteWins,
    /// Existing records are written through the version-checked update.
    Optimistic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// Create the entry or replace it in place.
    Merge,
    /// Existing (subject, teacher) entries are a conflict.
    Create,
}

impl SubmitMode {
    pub fn parse(raw: Option<&str>) -> Result<Self, MarksError> {
        match raw.map(|s| s.to_ascii_lowercase()).as_deref() {
            None | Some("merge") => Ok(SubmitMode::Merge),
            Some("create") => Ok(SubmitMode::Create),
            Some(other) => Err(MarksError::validation(format!(
                "mode must be one of: merge, create (got {})",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub student_id: String,
    pub exam_type: String,
    pub year: String,
    pub subject_name: String,
    pub teacher_id: String,
    pub score: ScoreInput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryAction {
    Created,
    Updated,
    Unchanged,
    Removed,
    RecordDeleted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryResult {
    pub record_id: String,
    pub version: i64,
    pub action: EntryAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<EntryView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemError {
    pub code: &'static str,
    pub message: String,
}

impl From<&MarksError> for ItemError {
    fn from(e: &MarksError) -> Self {
        Self {
            code: e.code(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemResult {
    pub index: usize,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<EntryResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ItemError>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub succeeded: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub limit_exceeded: bool,
    /// Set when the batch was rejected as a whole; `items` is then empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_error: Option<ItemError>,
    pub items: Vec<BatchItemResult>,
}

fn required_field(obj: &serde_json::Map<String, Value>, key: &str) -> Result<String, MarksError> {
    match obj.get(key).and_then(|v| v.as_str()).map(str::trim) {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => Err(MarksError::validation(format!("missing {}", key))),
    }
}

/// `"ABSENT"` (any case) or `{q1, q2, q3, q4}` of non-negative integers.
pub fn parse_score_input(raw: Option<&Value>) -> Result<ScoreInput, MarksError> {
    let Some(raw) = raw else {
        return Err(MarksError::validation("missing scores"));
    };
    if let Some(s) = raw.as_str() {
        if s.trim().eq_ignore_ascii_case(ABSENT_MARKER) {
            return Ok(ScoreInput::Absent);
        }
        return Err(MarksError::validation(format!(
            "scores must be an object or \"{}\"",
            ABSENT_MARKER
        )));
    }
    let Some(obj) = raw.as_object() else {
        return Err(MarksError::validation(format!(
            "scores must be an object or \"{}\"",
            ABSENT_MARKER
        )));
    };

    let component = |key: &str| -> Result<i64, MarksError> {
        let Some(v) = obj.get(key) else {
            return Err(MarksError::validation(format!("missing scores.{}", key)));
        };
        let Some(n) = v.as_i64() else {
            return Err(MarksError::validation(format!(
                "scores.{} must be an integer",
                key
            )));
        };
        if n < 0 {
            return Err(MarksError::validation(format!(
                "scores.{} must not be negative",
                key
            )));
        }
        Ok(n)
    };

    Ok(ScoreInput::Graded(Breakdown {
        q1: component("q1")?,
        q2: component("q2")?,
        q3: component("q3")?,
        q4: component("q4")?,
    }))
}

pub fn parse_submission(raw: &Value) -> Result<Submission, MarksError> {
    let Some(obj) = raw.as_object() else {
        return Err(MarksError::validation("item must be an object"));
    };
    Ok(Submission {
        student_id: required_field(obj, "studentId")?,
        exam_type: required_field(obj, "examType")?,
        year: required_field(obj, "year")?,
        subject_name: required_field(obj, "subjectName")?,
        teacher_id: required_field(obj, "teacherId")?,
        score: parse_score_input(obj.get("scores"))?,
    })
}

fn check_score(input: ScoreInput, policy: &ExamPolicy) -> Result<(), MarksError> {
    let ScoreInput::Graded(b) = input else {
        return Ok(());
    };
    for (name, v) in ["q1", "q2", "q3", "q4"].iter().zip(b.components()) {
        if v < 0 {
            return Err(MarksError::validation(format!(
                "scores.{} must not be negative",
                name
            )));
        }
        if v > policy.total_marks {
            return Err(MarksError::validation(format!(
                "scores.{} exceeds {} marks",
                name, policy.total_marks
            )));
        }
    }
    let Some(total) = b.checked_total() else {
        return Err(MarksError::validation("scores overflow when summed"));
    };
    if total > policy.total_marks {
        return Err(MarksError::validation(format!(
            "total {} exceeds {} marks for {}",
            total, policy.total_marks, policy.exam_type
        )));
    }
    Ok(())
}

/// Re-derives stored outcomes for every exam type whose policy differs
/// between `previous` and `current`. Each record is rewritten through the
/// version check. Returns the number of records rewritten.
pub fn reapply_policies<S: MarkStore>(
    store: &S,
    previous: &ExamPolicyTable,
    current: &ExamPolicyTable,
) -> Result<usize, MarksError> {
    let mut rewritten = 0;
    for policy in current.policies() {
        if previous.get(&policy.exam_type) == Some(&policy) {
            continue;
        }
        let filter = RecordFilter {
            exam_type: Some(policy.exam_type.clone()),
            ..RecordFilter::default()
        };
        for mut record in store.get_many(&filter)? {
            let mut changed = false;
            for entry in &mut record.entries {
                if let Some(total) = entry.outcome.graded_total() {
                    if total > policy.total_marks {
                        return Err(MarksError::validation(format!(
                            "totalMarks {} for {} is below a stored total of {} (record {})",
                            policy.total_marks, policy.exam_type, total, record.id
                        )));
                    }
                }
                let next = entry.outcome.reapply(&policy);
                if next != entry.outcome {
                    entry.outcome = next;
                    changed = true;
                }
            }
            if !changed {
                continue;
            }
            store
                .update_if_version(&record, record.version)?
                .ok_or_else(|| {
                    MarksError::conflict(format!(
                        "mark record {} was modified concurrently",
                        record.id
                    ))
                })?;
            rewritten += 1;
        }
        debug!(exam_type = %policy.exam_type, "stored outcomes re-derived");
    }
    Ok(rewritten)
}

pub struct MarkUpdateEngine<'a, S, D> {
    store: &'a S,
    directory: &'a D,
    policies: &'a ExamPolicyTable,
    write_mode: WriteMode,
}

impl<'a, S, D> MarkUpdateEngine<'a, S, D>
where
    S: MarkStore,
    D: StudentDirectory + TeacherDirectory,
{
    pub fn new(
        store: &'a S,
        directory: &'a D,
        policies: &'a ExamPolicyTable,
        write_mode: WriteMode,
    ) -> Self {
        Self {
            store,
            directory,
            policies,
            write_mode,
        }
    }

    fn policy(&self, exam_type: &str) -> Result<&'a ExamPolicy, MarksError> {
        self.policies
            .get(exam_type)
            .ok_or_else(|| MarksError::validation(format!("unknown examType {}", exam_type)))
    }

    fn student(&self, student_id: &str) -> Result<Student, MarksError> {
        self.directory
            .lookup_student(student_id)?
            .ok_or_else(|| MarksError::not_found(format!("student {} not found", student_id)))
    }

    fn authorize(
        &self,
        principal: &Principal,
        teacher_id: &str,
        subject_name: &str,
        student: &Student,
    ) -> Result<(), MarksError> {
        let teacher = self
            .directory
            .lookup_teacher(teacher_id)?
            .ok_or_else(|| MarksError::not_found(format!("teacher {} not found", teacher_id)))?;
        match principal.role {
            Role::Admin => Ok(()),
            Role::Teacher => {
                if principal.id != teacher.teacher_id {
                    return Err(MarksError::unauthorized(format!(
                        "{} cannot grade on behalf of teacher {}",
                        principal.id, teacher.teacher_id
                    )));
                }
                if !teacher.teaches(subject_name, &student.year, &student.division) {
                    return Err(MarksError::unauthorized(format!(
                        "teacher {} is not assigned {} for {}-{}",
                        teacher.teacher_id, subject_name, student.year, student.division
                    )));
                }
                Ok(())
            }
        }
    }

    fn persist(
        &self,
        record: &MarkRecord,
        existed: bool,
    ) -> Result<MarkRecord, MarksError> {
        if existed && self.write_mode == WriteMode::Optimistic {
            return self
                .store
                .update_if_version(record, record.version)?
                .ok_or_else(|| {
                    warn!(record_id = %record.id, "stale mark record write rejected");
                    MarksError::conflict(format!(
                        "mark record {} was modified concurrently",
                        record.id
                    ))
                });
        }
        Ok(self.store.upsert(record)?)
    }

    pub fn submit_one(
        &self,
        principal: &Principal,
        sub: &Submission,
        mode: SubmitMode,
    ) -> Result<EntryResult, MarksError> {
        let policy = self.policy(&sub.exam_type)?;
        check_score(sub.score, policy)?;

        let student = self.student(&sub.student_id)?;
        if student.year != sub.year {
            return Err(MarksError::validation(format!(
                "student {} is enrolled in year {}, not {}",
                student.student_id, student.year, sub.year
            )));
        }
        self.authorize(principal, &sub.teacher_id, &sub.subject_name, &student)?;

        let existing = self.store.get(&sub.student_id, &sub.exam_type, &sub.year)?;
        let existed = existing.is_some();
        let mut record = existing
            .unwrap_or_else(|| MarkRecord::new(&sub.student_id, &sub.exam_type, &sub.year));

        let outcome = Outcome::from_input(sub.score, policy);
        let action = match record.find_entry(&sub.subject_name, &sub.teacher_id) {
            Some(_) if mode == SubmitMode::Create => {
                return Err(MarksError::conflict(format!(
                    "entry for {} / {} already exists in record {}",
                    sub.subject_name, sub.teacher_id, record.id
                )));
            }
            Some(i) if record.entries[i].outcome == outcome => {
                return Ok(EntryResult {
                    record_id: record.id.clone(),
                    version: record.version,
                    action: EntryAction::Unchanged,
                    entry: Some(record.entries[i].view()),
                });
            }
            Some(i) => {
                record.entries[i].outcome = outcome;
                EntryAction::Updated
            }
            None => {
                record.entries.push(ExamEntry {
                    subject_name: sub.subject_name.clone(),
                    teacher_id: sub.teacher_id.clone(),
                    outcome,
                });
                EntryAction::Created
            }
        };

        let stored = self.persist(&record, existed)?;
        let entry = stored
            .find_entry(&sub.subject_name, &sub.teacher_id)
            .map(|i| stored.entries[i].view());
        Ok(EntryResult {
            record_id: stored.id,
            version: stored.version,
            action,
            entry,
        })
    }

    /// Applies each item on its own; one failure never stops the rest.
    pub fn submit_batch(
        &self,
        principal: &Principal,
        items: &[Value],
        mode: SubmitMode,
    ) -> BatchResult {
        if items.len() > SUBMIT_MAX_ITEMS {
            warn!(items = items.len(), "mark batch over limit");
            return BatchResult {
                succeeded: 0,
                failed: items.len(),
                limit_exceeded: true,
                batch_error: Some(ItemError {
                    code: "too_many_items",
                    message: format!(
                        "batch exceeds max items: {} > {}",
                        items.len(),
                        SUBMIT_MAX_ITEMS
                    ),
                }),
                items: Vec::new(),
            };
        }

        let mut out = Vec::with_capacity(items.len());
        let mut succeeded = 0;
        for (index, raw) in items.iter().enumerate() {
            let res = parse_submission(raw).and_then(|sub| self.submit_one(principal, &sub, mode));
            match res {
                Ok(r) => {
                    succeeded += 1;
                    out.push(BatchItemResult {
                        index,
                        ok: true,
                        result: Some(r),
                        error: None,
                    });
                }
                Err(e) => {
                    debug!(index, code = e.code(), error = %e, "mark item rejected");
                    out.push(BatchItemResult {
                        index,
                        ok: false,
                        result: None,
                        error: Some(ItemError::from(&e)),
                    });
                }
            }
        }

        let failed = out.len() - succeeded;
        info!(principal = %principal.id, succeeded, failed, "mark batch applied");
        BatchResult {
            succeeded,
            failed,
            limit_exceeded: false,
            batch_error: None,
            items: out,
        }
    }

    fn load_entry(
        &self,
        principal: &Principal,
        record_id: &str,
        subject_name: &str,
        teacher_id: &str,
    ) -> Result<(MarkRecord, usize), MarksError> {
        let record = self
            .store
            .get_by_id(record_id)?
            .ok_or_else(|| MarksError::not_found(format!("mark record {} not found", record_id)))?;
        let idx = record.find_entry(subject_name, teacher_id).ok_or_else(|| {
            MarksError::not_found(format!(
                "no entry for {} / {} in record {}",
                subject_name, teacher_id, record_id
            ))
        })?;
        let student = self.student(&record.student_id)?;
        self.authorize(principal, teacher_id, subject_name, &student)?;
        Ok((record, idx))
    }

    pub fn update_entry(
        &self,
        principal: &Principal,
        record_id: &str,
        subject_name: &str,
        teacher_id: &str,
        input: ScoreInput,
    ) -> Result<EntryResult, MarksError> {
        let (mut record, idx) = self.load_entry(principal, record_id, subject_name, teacher_id)?;
        let policy = self.policy(&record.exam_type)?;
        check_score(input, policy)?;

        let outcome = Outcome::from_input(input, policy);
        if record.entries[idx].outcome == outcome {
            return Ok(EntryResult {
                record_id: record.id.clone(),
                version: record.version,
                action: EntryAction::Unchanged,
                entry: Some(record.entries[idx].view()),
            });
        }
        record.entries[idx].outcome = outcome;

        let stored = self.persist(&record, true)?;
        Ok(EntryResult {
            entry: Some(stored.entries[idx].view()),
            record_id: stored.id,
            version: stored.version,
            action: EntryAction::Updated,
        })
    }

    pub fn remove_entry(
        &self,
        principal: &Principal,
        record_id: &str,
        subject_name: &str,
        teacher_id: &str,
    ) -> Result<EntryResult, MarksError> {
        let (mut record, idx) = self.load_entry(principal, record_id, subject_name, teacher_id)?;
        record.entries.remove(idx);

        // The emptied write and the delete commit together.
        let (stored, deleted) = self.store.atomically(|| {
            let stored = self.persist(&record, true)?;
            let deleted = stored.entries.is_empty() && self.store.delete_if_empty(&stored.id)?;
            Ok::<_, MarksError>((stored, deleted))
        })?;
        if deleted {
            info!(record_id = %stored.id, "mark record deleted after last entry removed");
        }
        Ok(EntryResult {
            record_id: stored.id,
            version: stored.version,
            action: if deleted {
                EntryAction::RecordDeleted
            } else {
                EntryAction::Removed
            },
            entry: None,
        })
    }
}
