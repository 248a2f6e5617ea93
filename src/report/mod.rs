//! Report view models.
//!
//! Every number a report prints is computed here, once. The document and
//! spreadsheet serializers only lay out the cells they are given, which is
//! what keeps the two formats numerically identical.

pub mod export;
pub mod pdf;
pub mod xlsx;

use crate::calc::{class_roster, TotalAccumulator};
use crate::directory::StudentDirectory;
use crate::error::MarksError;
use crate::model::{ExamEntry, Outcome, Status};
use crate::store::{MarkStore, RecordFilter};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Subject,
    Class,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Document,
    Spreadsheet,
}

impl ReportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ReportFormat::Document => "pdf",
            ReportFormat::Spreadsheet => "xlsx",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportFilter {
    pub year: String,
    pub division: String,
    pub exam_type: String,
    #[serde(default)]
    pub subject_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Align {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportColumn {
    pub key: String,
    pub title: String,
    /// Width hint in character units.
    pub width: u16,
    pub align: Align,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "t", content = "v", rename_all = "lowercase")]
pub enum Cell {
    Text(String),
    Int(i64),
    /// Already rounded to two places.
    Decimal(f64),
    Absent,
    Blank,
}

pub const ABSENT_TEXT: &str = "AB";
pub const BLANK_TEXT: &str = "-";

impl Cell {
    pub fn decimal(v: f64) -> Self {
        Cell::Decimal(round_2(v))
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Cell::Int(_) | Cell::Decimal(_))
    }

    /// The one textual form of a cell, shared by both serializers.
    pub fn display(&self) -> String {
        match self {
            Cell::Text(s) => s.clone(),
            Cell::Int(n) => n.to_string(),
            Cell::Decimal(v) => format!("{:.2}", v),
            Cell::Absent => ABSENT_TEXT.to_string(),
            Cell::Blank => BLANK_TEXT.to_string(),
        }
    }
}

pub fn round_2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub cells: Vec<Cell>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportViewModel {
    pub kind: ReportKind,
    pub title: String,
    pub subtitle: String,
    pub generated_at: String,
    pub columns: Vec<ReportColumn>,
    pub rows: Vec<ReportRow>,
    /// Aggregate rows printed after the student rows.
    pub summary: Vec<ReportRow>,
    pub digest: String,
}

impl ReportViewModel {
    fn new(
        kind: ReportKind,
        title: String,
        subtitle: String,
        columns: Vec<ReportColumn>,
        rows: Vec<ReportRow>,
        summary: Vec<ReportRow>,
    ) -> Self {
        let digest = content_digest(&columns, &rows, &summary);
        Self {
            kind,
            title,
            subtitle,
            generated_at: chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            columns,
            rows,
            summary,
            digest,
        }
    }

    pub fn all_rows(&self) -> impl Iterator<Item = (&ReportRow, bool)> {
        self.rows
            .iter()
            .map(|r| (r, false))
            .chain(self.summary.iter().map(|r| (r, true)))
    }
}

fn content_digest(columns: &[ReportColumn], rows: &[ReportRow], summary: &[ReportRow]) -> String {
    let mut hasher = Sha256::new();
    let payload = serde_json::json!({
        "columns": columns,
        "rows": rows,
        "summary": summary,
    });
    hasher.update(payload.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

fn text_col(key: &str, title: &str, width: u16) -> ReportColumn {
    ReportColumn {
        key: key.to_string(),
        title: title.to_string(),
        width,
        align: Align::Left,
    }
}

fn num_col(key: &str, title: &str, width: u16) -> ReportColumn {
    ReportColumn {
        key: key.to_string(),
        title: title.to_string(),
        width,
        align: Align::Right,
    }
}

fn first_entry_for<'r>(entries: &'r [ExamEntry], subject_name: &str) -> Option<&'r ExamEntry> {
    entries.iter().find(|e| e.subject_name == subject_name)
}

fn average_cell(acc: &TotalAccumulator) -> Cell {
    acc.average().map(Cell::decimal).unwrap_or(Cell::Blank)
}

pub fn build_report<S, D>(
    store: &S,
    directory: &D,
    kind: ReportKind,
    filter: &ReportFilter,
) -> Result<ReportViewModel, MarksError>
where
    S: MarkStore,
    D: StudentDirectory,
{
    match kind {
        ReportKind::Subject => build_subject_report(store, directory, filter),
        ReportKind::Class => build_class_report(store, directory, filter),
    }
}

/// One row per student: the four components, total and status for a single
/// subject.
pub fn build_subject_report<S, D>(
    store: &S,
    directory: &D,
    filter: &ReportFilter,
) -> Result<ReportViewModel, MarksError>
where
    S: MarkStore,
    D: StudentDirectory,
{
    let Some(subject_name) = filter.subject_name.as_deref() else {
        return Err(MarksError::validation("subject report requires subjectName"));
    };
    let roster = class_roster(directory, &filter.year, &filter.division)?;
    let records = store.get_many(&RecordFilter {
        exam_type: Some(filter.exam_type.clone()),
        year: Some(filter.year.clone()),
        subject_name: Some(subject_name.to_string()),
        ..RecordFilter::default()
    })?;
    let by_student: HashMap<&str, &[ExamEntry]> = records
        .iter()
        .map(|r| (r.student_id.as_str(), r.entries.as_slice()))
        .collect();

    let columns = vec![
        text_col("rollNo", "Roll No", 8),
        text_col("name", "Name", 26),
        num_col("q1", "Q1", 6),
        num_col("q2", "Q2", 6),
        num_col("q3", "Q3", 6),
        num_col("q4", "Q4", 6),
        num_col("total", "Total", 8),
        text_col("status", "Status", 8),
    ];

    let mut component_accs = [TotalAccumulator::default(); 4];
    let mut total_acc = TotalAccumulator::default();
    let mut highest: [Option<i64>; 5] = [None; 5];
    let mut rows = Vec::with_capacity(roster.len());

    for s in &roster {
        let mut cells = vec![Cell::Text(s.roll_no.clone()), Cell::Text(s.name.clone())];
        let entry = by_student
            .get(s.student_id.as_str())
            .and_then(|entries| first_entry_for(entries, subject_name));
        match entry.map(|e| &e.outcome) {
            Some(outcome @ Outcome::Graded(g)) => {
                for (i, v) in g.breakdown.components().into_iter().enumerate() {
                    cells.push(Cell::Int(v));
                    component_accs[i].add_total(v);
                    highest[i] = Some(highest[i].map_or(v, |h| h.max(v)));
                }
                cells.push(Cell::Int(g.total));
                highest[4] = Some(highest[4].map_or(g.total, |h| h.max(g.total)));
                cells.push(Cell::Text(g.status.as_str().to_string()));
                total_acc.add(outcome);
            }
            Some(outcome @ Outcome::Absent { .. }) => {
                cells.extend(std::iter::repeat(Cell::Absent).take(5));
                cells.push(Cell::Text(Status::Absent.as_str().to_string()));
                total_acc.add(outcome);
            }
            None => {
                cells.extend(std::iter::repeat(Cell::Blank).take(6));
            }
        }
        rows.push(ReportRow { cells });
    }

    let mut avg_cells = vec![Cell::Blank, Cell::Text("Average".into())];
    avg_cells.extend(component_accs.iter().map(average_cell));
    avg_cells.push(average_cell(&total_acc));
    avg_cells.push(Cell::Text(format!(
        "{}P/{}F/{}A",
        total_acc.pass_count, total_acc.fail_count, total_acc.absent_count
    )));

    let mut high_cells = vec![Cell::Blank, Cell::Text("Highest".into())];
    high_cells.extend(highest.iter().map(|h| h.map(Cell::Int).unwrap_or(Cell::Blank)));
    high_cells.push(Cell::Blank);

    Ok(ReportViewModel::new(
        ReportKind::Subject,
        format!("{} - {}", subject_name, filter.exam_type),
        format!("Year {} / Division {}", filter.year, filter.division),
        columns,
        rows,
        vec![
            ReportRow { cells: avg_cells },
            ReportRow { cells: high_cells },
        ],
    ))
}

/// One row per student: one column per subject plus the grand total.
pub fn build_class_report<S, D>(
    store: &S,
    directory: &D,
    filter: &ReportFilter,
) -> Result<ReportViewModel, MarksError>
where
    S: MarkStore,
    D: StudentDirectory,
{
    let roster = class_roster(directory, &filter.year, &filter.division)?;
    let records = store.get_many(&RecordFilter {
        exam_type: Some(filter.exam_type.clone()),
        year: Some(filter.year.clone()),
        ..RecordFilter::default()
    })?;
    let by_student: HashMap<&str, &[ExamEntry]> = records
        .iter()
        .map(|r| (r.student_id.as_str(), r.entries.as_slice()))
        .collect();

    let subjects: Vec<String> = roster
        .iter()
        .filter_map(|s| by_student.get(s.student_id.as_str()))
        .flat_map(|entries| entries.iter().map(|e| e.subject_name.clone()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut columns = vec![text_col("rollNo", "Roll No", 8), text_col("name", "Name", 26)];
    for s in &subjects {
        columns.push(num_col(&format!("subject:{}", s), s, 10));
    }
    columns.push(num_col("grandTotal", "Grand Total", 11));

    let mut subject_accs = vec![TotalAccumulator::default(); subjects.len()];
    let mut grand_acc = TotalAccumulator::default();
    let mut rows = Vec::with_capacity(roster.len());

    for s in &roster {
        let entries = by_student
            .get(s.student_id.as_str())
            .copied()
            .unwrap_or(&[]);
        let mut cells = vec![Cell::Text(s.roll_no.clone()), Cell::Text(s.name.clone())];
        let mut grand: Option<i64> = None;
        for (i, subject) in subjects.iter().enumerate() {
            match first_entry_for(entries, subject).map(|e| &e.outcome) {
                Some(outcome @ Outcome::Graded(g)) => {
                    cells.push(Cell::Int(g.total));
                    subject_accs[i].add(outcome);
                    grand = Some(grand.unwrap_or(0) + g.total);
                }
                Some(outcome @ Outcome::Absent { .. }) => {
                    cells.push(Cell::Absent);
                    subject_accs[i].add(outcome);
                }
                None => cells.push(Cell::Blank),
            }
        }
        match grand {
            Some(g) => {
                cells.push(Cell::Int(g));
                grand_acc.add_total(g);
            }
            None => cells.push(Cell::Blank),
        }
        rows.push(ReportRow { cells });
    }

    let mut avg_cells = vec![Cell::Blank, Cell::Text("Average".into())];
    avg_cells.extend(subject_accs.iter().map(average_cell));
    avg_cells.push(average_cell(&grand_acc));

    let sum_cell = |acc: &TotalAccumulator| {
        if acc.graded_count == 0 {
            Cell::Blank
        } else {
            Cell::Int(acc.sum)
        }
    };
    let mut total_cells = vec![Cell::Blank, Cell::Text("Total".into())];
    total_cells.extend(subject_accs.iter().map(sum_cell));
    total_cells.push(sum_cell(&grand_acc));

    Ok(ReportViewModel::new(
        ReportKind::Class,
        format!("Class results - {}", filter.exam_type),
        format!("Year {} / Division {}", filter.year, filter.division),
        columns,
        rows,
        vec![
            ReportRow { cells: avg_cells },
            ReportRow { cells: total_cells },
        ],
    ))
}
