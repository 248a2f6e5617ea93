//! Aggregation engine.
//!
//! Everything here is read-only and recomputed per call. Reads are not
//! transactional: while a batch submission is being applied a dashboard may
//! see some of its items and not others.

use crate::directory::StudentDirectory;
use crate::error::MarksError;
use crate::model::{EntryView, Outcome, Status, Student};
use crate::store::{MarkStore, RecordFilter};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

pub const RANK_SLICE: usize = 3;

/// Running sum/count over graded totals. Absences are tallied separately and
/// never touch the mean.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TotalAccumulator {
    pub sum: i64,
    pub graded_count: usize,
    pub absent_count: usize,
    pub pass_count: usize,
    pub fail_count: usize,
}

impl TotalAccumulator {
    pub fn add(&mut self, outcome: &Outcome) {
        match outcome.status() {
            Status::Absent => self.absent_count += 1,
            Status::Pass => self.pass_count += 1,
            Status::Fail => self.fail_count += 1,
        }
        if let Some(t) = outcome.graded_total() {
            self.add_total(t);
        }
    }

    /// Counts a graded value that has no pass/fail of its own (a single
    /// score component, a grand total).
    pub fn add_total(&mut self, total: i64) {
        self.sum += total;
        self.graded_count += 1;
    }

    pub fn average(&self) -> Option<f64> {
        if self.graded_count == 0 {
            None
        } else {
            Some(self.sum as f64 / self.graded_count as f64)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Performance {
    pub average: Option<f64>,
    pub sum: i64,
    pub graded_count: usize,
    pub absent_count: usize,
    pub pass_count: usize,
    pub fail_count: usize,
}

impl From<TotalAccumulator> for Performance {
    fn from(acc: TotalAccumulator) -> Self {
        Self {
            average: acc.average(),
            sum: acc.sum,
            graded_count: acc.graded_count,
            absent_count: acc.absent_count,
            pass_count: acc.pass_count,
            fail_count: acc.fail_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectPerformance {
    pub subject_name: String,
    #[serde(flatten)]
    pub performance: Performance,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamPerformance {
    pub exam_type: String,
    #[serde(flatten)]
    pub performance: Performance,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedStudent {
    pub rank: usize,
    pub student_id: String,
    pub roll_no: String,
    pub name: String,
    pub average: f64,
    pub graded_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassDashboard {
    pub year: String,
    pub division: String,
    pub student_count: usize,
    pub subject_performance: Vec<SubjectPerformance>,
    pub exam_performance: Vec<ExamPerformance>,
    pub ranked_students: Vec<RankedStudent>,
    pub top_students: Vec<RankedStudent>,
    pub bottom_students: Vec<RankedStudent>,
    /// Students with no graded entry at all.
    pub unranked: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptFilters {
    pub exam_type: Option<String>,
    pub year: Option<String>,
    pub subject_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptExam {
    pub record_id: String,
    pub exam_type: String,
    pub year: String,
    pub entries: Vec<EntryView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    pub student_id: String,
    pub roll_no: String,
    pub name: String,
    pub exams: Vec<TranscriptExam>,
}

/// Roster for a class; an empty or unknown class fails the whole query.
pub fn class_roster<D: StudentDirectory>(
    directory: &D,
    year: &str,
    division: &str,
) -> Result<Vec<Student>, MarksError> {
    let roster = directory.list_students(year, division)?;
    if roster.is_empty() {
        return Err(MarksError::not_found(format!(
            "no students enrolled in {}-{}",
            year, division
        )));
    }
    Ok(roster)
}

/// Ranked by average descending, ties by student id ascending.
pub fn rank_students(mut rows: Vec<(Student, TotalAccumulator)>) -> (Vec<RankedStudent>, Vec<String>) {
    let mut unranked: Vec<String> = Vec::new();
    rows.retain(|(s, acc)| {
        if acc.graded_count == 0 {
            unranked.push(s.student_id.clone());
            false
        } else {
            true
        }
    });
    unranked.sort();

    rows.sort_by(|(sa, a), (sb, b)| {
        let av = a.average().unwrap_or(0.0);
        let bv = b.average().unwrap_or(0.0);
        bv.partial_cmp(&av)
            .unwrap_or(Ordering::Equal)
            .then_with(|| sa.student_id.cmp(&sb.student_id))
    });

    let ranked = rows
        .into_iter()
        .enumerate()
        .map(|(i, (s, acc))| RankedStudent {
            rank: i + 1,
            student_id: s.student_id,
            roll_no: s.roll_no,
            name: s.name,
            average: acc.average().unwrap_or(0.0),
            graded_count: acc.graded_count,
        })
        .collect();
    (ranked, unranked)
}

pub fn class_dashboard<S, D>(
    store: &S,
    directory: &D,
    year: &str,
    division: &str,
) -> Result<ClassDashboard, MarksError>
where
    S: MarkStore,
    D: StudentDirectory,
{
    let roster = class_roster(directory, year, division)?;
    let roster_ids: HashSet<&str> = roster.iter().map(|s| s.student_id.as_str()).collect();

    let records = store.get_many(&RecordFilter {
        year: Some(year.to_string()),
        ..RecordFilter::default()
    })?;

    let mut by_subject: BTreeMap<String, TotalAccumulator> = BTreeMap::new();
    let mut by_exam: BTreeMap<String, TotalAccumulator> = BTreeMap::new();
    let mut by_student: HashMap<String, TotalAccumulator> = HashMap::new();

    for record in records
        .iter()
        .filter(|r| roster_ids.contains(r.student_id.as_str()))
    {
        for entry in &record.entries {
            by_subject
                .entry(entry.subject_name.clone())
                .or_default()
                .add(&entry.outcome);
            by_exam
                .entry(record.exam_type.clone())
                .or_default()
                .add(&entry.outcome);
            by_student
                .entry(record.student_id.clone())
                .or_default()
                .add(&entry.outcome);
        }
    }

    let student_count = roster.len();
    let rows: Vec<(Student, TotalAccumulator)> = roster
        .into_iter()
        .map(|s| {
            let acc = by_student.get(&s.student_id).copied().unwrap_or_default();
            (s, acc)
        })
        .collect();
    let (ranked, unranked) = rank_students(rows);

    let top: Vec<RankedStudent> = ranked.iter().take(RANK_SLICE).cloned().collect();
    let bottom: Vec<RankedStudent> = ranked
        .iter()
        .skip(ranked.len().saturating_sub(RANK_SLICE))
        .cloned()
        .collect();

    Ok(ClassDashboard {
        year: year.to_string(),
        division: division.to_string(),
        student_count,
        subject_performance: by_subject
            .into_iter()
            .map(|(subject_name, acc)| SubjectPerformance {
                subject_name,
                performance: acc.into(),
            })
            .collect(),
        exam_performance: by_exam
            .into_iter()
            .map(|(exam_type, acc)| ExamPerformance {
                exam_type,
                performance: acc.into(),
            })
            .collect(),
        ranked_students: ranked,
        top_students: top,
        bottom_students: bottom,
        unranked,
    })
}

/// studentId → entry for one subject and exam type. Absent entries keep the
/// sentinel scores. With a class given, only that roster is included.
pub fn subject_view<S, D>(
    store: &S,
    directory: &D,
    subject_name: &str,
    exam_type: &str,
    year: Option<&str>,
    division: Option<&str>,
) -> Result<BTreeMap<String, EntryView>, MarksError>
where
    S: MarkStore,
    D: StudentDirectory,
{
    let roster: Option<HashSet<String>> = match (year, division) {
        (Some(y), Some(d)) => Some(
            class_roster(directory, y, d)?
                .into_iter()
                .map(|s| s.student_id)
                .collect(),
        ),
        (None, Some(_)) => {
            return Err(MarksError::validation("division requires year"));
        }
        _ => None,
    };

    let records = store.get_many(&RecordFilter {
        exam_type: Some(exam_type.to_string()),
        year: year.map(str::to_string),
        subject_name: Some(subject_name.to_string()),
        ..RecordFilter::default()
    })?;

    let mut out = BTreeMap::new();
    for record in records {
        if let Some(r) = &roster {
            if !r.contains(&record.student_id) {
                continue;
            }
        }
        // One entry per student; with several teachers on a subject the
        // first stored entry wins.
        if let Some(entry) = record.entries.first() {
            out.entry(record.student_id.clone())
                .or_insert_with(|| entry.view());
        }
    }
    Ok(out)
}

pub fn transcript<S, D>(
    store: &S,
    directory: &D,
    student_id: &str,
    filters: &TranscriptFilters,
) -> Result<Transcript, MarksError>
where
    S: MarkStore,
    D: StudentDirectory,
{
    let student = directory
        .lookup_student(student_id)?
        .ok_or_else(|| MarksError::not_found(format!("student {} not found", student_id)))?;

    let records = store.get_many(&RecordFilter {
        student_id: Some(student_id.to_string()),
        exam_type: filters.exam_type.clone(),
        year: filters.year.clone(),
        subject_name: filters.subject_name.clone(),
        ..RecordFilter::default()
    })?;

    let exams = records
        .into_iter()
        .map(|r| TranscriptExam {
            entries: r.entries.iter().map(|e| e.view()).collect(),
            record_id: r.id,
            exam_type: r.exam_type,
            year: r.year,
        })
        .collect();

    Ok(Transcript {
        student_id: student.student_id,
        roll_no: student.roll_no,
        name: student.name,
        exams,
    })
}

pub fn parse_transcript_filters(
    raw: Option<&serde_json::Value>,
) -> Result<TranscriptFilters, MarksError> {
    let Some(raw) = raw else {
        return Ok(TranscriptFilters::default());
    };
    if raw.is_null() {
        return Ok(TranscriptFilters::default());
    }
    let Some(obj) = raw.as_object() else {
        return Err(MarksError::validation("filters must be an object"));
    };
    let field = |key: &str| -> Result<Option<String>, MarksError> {
        match obj.get(key) {
            None => Ok(None),
            Some(v) if v.is_null() => Ok(None),
            Some(v) => {
                let Some(s) = v.as_str() else {
                    return Err(MarksError::validation(format!(
                        "filters.{} must be string or null",
                        key
                    )));
                };
                let t = s.trim();
                if t.is_empty() || t.eq_ignore_ascii_case("ALL") {
                    Ok(None)
                } else {
                    Ok(Some(t.to_string()))
                }
            }
        }
    };
    Ok(TranscriptFilters {
        exam_type: field("examType")?,
        year: field("year")?,
        subject_name: field("subjectName")?,
    })
}
