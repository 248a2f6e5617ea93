use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reserved score/total value for an absent student. Distinct from a score
/// of zero and never part of an aggregate.
pub const ABSENT_SENTINEL: i64 = -1;

/// Wire marker accepted in place of a score object.
pub const ABSENT_MARKER: &str = "ABSENT";

/// Upper bound on any exam type's totalMarks.
pub const MAX_TOTAL_MARKS: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Pass,
    Fail,
    Absent,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pass => "Pass",
            Status::Fail => "Fail",
            Status::Absent => "Absent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamPolicy {
    pub exam_type: String,
    pub threshold: i64,
    pub total_marks: i64,
}

/// Pass thresholds and denominators keyed by exam type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExamPolicyTable {
    policies: BTreeMap<String, ExamPolicy>,
}

impl Default for ExamPolicyTable {
    fn default() -> Self {
        let policies = [("unit1", 12, 30), ("unit2", 12, 30), ("term", 28, 70)]
            .into_iter()
            .map(|(exam_type, threshold, total_marks)| {
                (
                    exam_type.to_string(),
                    ExamPolicy {
                        exam_type: exam_type.to_string(),
                        threshold,
                        total_marks,
                    },
                )
            })
            .collect();
        Self { policies }
    }
}

impl ExamPolicyTable {
    pub fn from_policies(policies: Vec<ExamPolicy>) -> Result<Self, String> {
        if policies.is_empty() {
            return Err("at least one exam type is required".into());
        }
        let mut map = BTreeMap::new();
        for p in policies {
            let key = p.exam_type.trim().to_string();
            if key.is_empty() {
                return Err("examType must not be empty".into());
            }
            if p.total_marks <= 0 || p.total_marks > MAX_TOTAL_MARKS {
                return Err(format!(
                    "totalMarks for {} must be within 1..={}",
                    key, MAX_TOTAL_MARKS
                ));
            }
            if p.threshold < 0 || p.threshold > p.total_marks {
                return Err(format!(
                    "threshold for {} must be within 0..={}",
                    key, p.total_marks
                ));
            }
            if map.contains_key(&key) {
                return Err(format!("duplicate examType {}", key));
            }
            map.insert(
                key.clone(),
                ExamPolicy {
                    exam_type: key,
                    threshold: p.threshold,
                    total_marks: p.total_marks,
                },
            );
        }
        Ok(Self { policies: map })
    }

    pub fn get(&self, exam_type: &str) -> Option<&ExamPolicy> {
        self.policies.get(exam_type)
    }

    pub fn policies(&self) -> Vec<ExamPolicy> {
        self.policies.values().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakdown {
    pub q1: i64,
    pub q2: i64,
    pub q3: i64,
    pub q4: i64,
}

impl Breakdown {
    pub const ABSENT: Breakdown = Breakdown {
        q1: ABSENT_SENTINEL,
        q2: ABSENT_SENTINEL,
        q3: ABSENT_SENTINEL,
        q4: ABSENT_SENTINEL,
    };

    /// `None` when the components do not fit in an i64 sum.
    pub fn checked_total(&self) -> Option<i64> {
        self.q1
            .checked_add(self.q2)?
            .checked_add(self.q3)?
            .checked_add(self.q4)
    }

    pub fn total(&self) -> i64 {
        self.components()
            .into_iter()
            .fold(0i64, |acc, v| acc.saturating_add(v))
    }

    pub fn components(&self) -> [i64; 4] {
        [self.q1, self.q2, self.q3, self.q4]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradedScore {
    pub breakdown: Breakdown,
    pub total: i64,
    pub total_marks: i64,
    pub status: Status,
}

impl GradedScore {
    /// Total and status are derived here and nowhere else.
    pub fn derive(breakdown: Breakdown, policy: &ExamPolicy) -> Self {
        let total = breakdown.total();
        let status = if total >= policy.threshold {
            Status::Pass
        } else {
            Status::Fail
        };
        Self {
            breakdown,
            total,
            total_marks: policy.total_marks,
            status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Outcome {
    Graded(GradedScore),
    #[serde(rename_all = "camelCase")]
    Absent { total_marks: i64 },
}

/// Caller input for one entry, before policy is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreInput {
    Graded(Breakdown),
    Absent,
}

impl Outcome {
    pub fn from_input(input: ScoreInput, policy: &ExamPolicy) -> Self {
        match input {
            ScoreInput::Graded(b) => Outcome::Graded(GradedScore::derive(b, policy)),
            ScoreInput::Absent => Outcome::Absent {
                total_marks: policy.total_marks,
            },
        }
    }

    /// Same outcome re-derived under `policy`, for when the exam-type table
    /// changes after the entry was written.
    pub fn reapply(&self, policy: &ExamPolicy) -> Self {
        match self {
            Outcome::Graded(g) => Outcome::Graded(GradedScore::derive(g.breakdown, policy)),
            Outcome::Absent { .. } => Outcome::Absent {
                total_marks: policy.total_marks,
            },
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Outcome::Graded(g) => g.status,
            Outcome::Absent { .. } => Status::Absent,
        }
    }

    pub fn breakdown(&self) -> Breakdown {
        match self {
            Outcome::Graded(g) => g.breakdown,
            Outcome::Absent { .. } => Breakdown::ABSENT,
        }
    }

    pub fn total(&self) -> i64 {
        match self {
            Outcome::Graded(g) => g.total,
            Outcome::Absent { .. } => ABSENT_SENTINEL,
        }
    }

    pub fn total_marks(&self) -> i64 {
        match self {
            Outcome::Graded(g) => g.total_marks,
            Outcome::Absent { total_marks } => *total_marks,
        }
    }

    /// Total for aggregation; `None` keeps absences out of sums and counts.
    pub fn graded_total(&self) -> Option<i64> {
        match self {
            Outcome::Graded(g) => Some(g.total),
            Outcome::Absent { .. } => None,
        }
    }

    pub fn percentage(&self) -> Option<i64> {
        match self {
            Outcome::Graded(g) if g.total_marks > 0 => {
                Some((g.total as f64 / g.total_marks as f64 * 100.0).round() as i64)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamEntry {
    pub subject_name: String,
    pub teacher_id: String,
    pub outcome: Outcome,
}

impl ExamEntry {
    pub fn matches(&self, subject_name: &str, teacher_id: &str) -> bool {
        self.subject_name == subject_name && self.teacher_id == teacher_id
    }

    pub fn view(&self) -> EntryView {
        EntryView {
            subject_name: self.subject_name.clone(),
            teacher_id: self.teacher_id.clone(),
            scores: self.outcome.breakdown(),
            total: self.outcome.total(),
            total_marks: self.outcome.total_marks(),
            percentage: self.outcome.percentage(),
            status: self.outcome.status(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkRecord {
    pub id: String,
    pub student_id: String,
    pub exam_type: String,
    pub year: String,
    /// 0 for a record that has never been written.
    pub version: i64,
    pub updated_at: Option<String>,
    pub entries: Vec<ExamEntry>,
}

impl MarkRecord {
    pub fn new(student_id: &str, exam_type: &str, year: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            student_id: student_id.to_string(),
            exam_type: exam_type.to_string(),
            year: year.to_string(),
            version: 0,
            updated_at: None,
            entries: Vec::new(),
        }
    }

    pub fn find_entry(&self, subject_name: &str, teacher_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.matches(subject_name, teacher_id))
    }

    pub fn view(&self) -> RecordView {
        RecordView {
            id: self.id.clone(),
            student_id: self.student_id.clone(),
            exam_type: self.exam_type.clone(),
            year: self.year.clone(),
            version: self.version,
            updated_at: self.updated_at.clone(),
            entries: self.entries.iter().map(ExamEntry::view).collect(),
        }
    }
}

/// Read-side shape of an entry. Absent entries carry the sentinel in every
/// score and in `total`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryView {
    pub subject_name: String,
    pub teacher_id: String,
    pub scores: Breakdown,
    pub total: i64,
    pub total_marks: i64,
    pub percentage: Option<i64>,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordView {
    pub id: String,
    pub student_id: String,
    pub exam_type: String,
    pub year: String,
    pub version: i64,
    pub updated_at: Option<String>,
    pub entries: Vec<EntryView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub student_id: String,
    pub roll_no: String,
    pub name: String,
    pub year: String,
    pub division: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRef {
    pub year: String,
    pub division: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAssignment {
    pub name: String,
    pub year: String,
    pub division: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Teacher {
    pub teacher_id: String,
    pub name: String,
    #[serde(default)]
    pub department: String,
    #[serde(default)]
    pub assigned_class: Option<ClassRef>,
    #[serde(default)]
    pub subjects: Vec<SubjectAssignment>,
}

impl Teacher {
    pub fn teaches(&self, subject_name: &str, year: &str, division: &str) -> bool {
        self.subjects
            .iter()
            .any(|s| s.name == subject_name && s.year == year && s.division == division)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Teacher,
    Admin,
}

/// Authenticated caller, supplied by the identity layer on every mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub role: Role,
}
