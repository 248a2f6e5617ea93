//! Mark record persistence.
//!
//! Each record is one row keyed by (student, exam type, year) with its entry
//! list embedded as JSON. No business rules live here beyond entry
//! uniqueness.

use crate::model::{ExamEntry, MarkRecord};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("mark record not found: {0}")]
    NotFound(String),

    #[error("duplicate entry for subject {subject_name} / teacher {teacher_id}")]
    DuplicateEntry {
        subject_name: String,
        teacher_id: String,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub student_id: Option<String>,
    pub exam_type: Option<String>,
    pub year: Option<String>,
    pub subject_name: Option<String>,
    pub teacher_id: Option<String>,
}

impl RecordFilter {
    fn filters_entries(&self) -> bool {
        self.subject_name.is_some() || self.teacher_id.is_some()
    }

    fn keeps_entry(&self, e: &ExamEntry) -> bool {
        let subject_ok = self
            .subject_name
            .as_deref()
            .map(|s| e.subject_name == s)
            .unwrap_or(true);
        let teacher_ok = self
            .teacher_id
            .as_deref()
            .map(|t| e.teacher_id == t)
            .unwrap_or(true);
        subject_ok && teacher_ok
    }
}

pub trait MarkStore {
    fn get(
        &self,
        student_id: &str,
        exam_type: &str,
        year: &str,
    ) -> Result<Option<MarkRecord>, StoreError>;

    fn get_by_id(&self, record_id: &str) -> Result<Option<MarkRecord>, StoreError>;

    fn get_many(&self, filter: &RecordFilter) -> Result<Vec<MarkRecord>, StoreError>;

    /// Last-write-wins insert or replace. Returns the stored record with its
    /// new version.
    fn upsert(&self, record: &MarkRecord) -> Result<MarkRecord, StoreError>;

    /// Replaces the record only if its stored version still equals
    /// `expected_version`. `Ok(None)` means another writer got there first.
    fn update_if_version(
        &self,
        record: &MarkRecord,
        expected_version: i64,
    ) -> Result<Option<MarkRecord>, StoreError>;

    /// Deletes the record if it holds no entries. Unknown ids are an error.
    fn delete_if_empty(&self, record_id: &str) -> Result<bool, StoreError>;

    /// Runs `f` as one unit: every store write inside it lands or none does.
    fn atomically<T, E>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>;
}

pub struct SqliteMarkStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteMarkStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

const RECORD_COLUMNS: &str = "id, student_id, exam_type, year, version, entries_json, updated_at";

fn read_row(row: &Row<'_>) -> rusqlite::Result<(MarkRecord, String)> {
    Ok((
        MarkRecord {
            id: row.get(0)?,
            student_id: row.get(1)?,
            exam_type: row.get(2)?,
            year: row.get(3)?,
            version: row.get(4)?,
            entries: Vec::new(),
            updated_at: row.get(6)?,
        },
        row.get(5)?,
    ))
}

fn decode(pair: (MarkRecord, String)) -> Result<MarkRecord, StoreError> {
    let (mut record, entries_json) = pair;
    record.entries = serde_json::from_str(&entries_json)?;
    Ok(record)
}

fn check_unique_entries(record: &MarkRecord) -> Result<(), StoreError> {
    let mut seen: HashSet<(&str, &str)> = HashSet::new();
    for e in &record.entries {
        if !seen.insert((e.subject_name.as_str(), e.teacher_id.as_str())) {
            return Err(StoreError::DuplicateEntry {
                subject_name: e.subject_name.clone(),
                teacher_id: e.teacher_id.clone(),
            });
        }
    }
    Ok(())
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl MarkStore for SqliteMarkStore<'_> {
    fn get(
        &self,
        student_id: &str,
        exam_type: &str,
        year: &str,
    ) -> Result<Option<MarkRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM mark_records WHERE student_id = ? AND exam_type = ? AND year = ?",
            RECORD_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, (student_id, exam_type, year), read_row)
            .optional()?;
        row.map(decode).transpose()
    }

    fn get_by_id(&self, record_id: &str) -> Result<Option<MarkRecord>, StoreError> {
        let sql = format!("SELECT {} FROM mark_records WHERE id = ?", RECORD_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, [record_id], read_row)
            .optional()?;
        row.map(decode).transpose()
    }

    fn get_many(&self, filter: &RecordFilter) -> Result<Vec<MarkRecord>, StoreError> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut binds: Vec<Value> = Vec::new();
        if let Some(v) = &filter.student_id {
            clauses.push("student_id = ?");
            binds.push(Value::Text(v.clone()));
        }
        if let Some(v) = &filter.exam_type {
            clauses.push("exam_type = ?");
            binds.push(Value::Text(v.clone()));
        }
        if let Some(v) = &filter.year {
            clauses.push("year = ?");
            binds.push(Value::Text(v.clone()));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {} FROM mark_records {} ORDER BY year, exam_type, student_id",
            RECORD_COLUMNS, where_sql
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(binds), read_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(rows.len());
        for pair in rows {
            let mut record = decode(pair)?;
            if filter.filters_entries() {
                record.entries.retain(|e| filter.keeps_entry(e));
                if record.entries.is_empty() {
                    continue;
                }
            }
            out.push(record);
        }
        Ok(out)
    }

    fn upsert(&self, record: &MarkRecord) -> Result<MarkRecord, StoreError> {
        check_unique_entries(record)?;
        let entries_json = serde_json::to_string(&record.entries)?;
        let updated_at = now_rfc3339();
        // Keyed on the natural key so a concurrent first submission for the
        // same student/exam/year lands on one row.
        let (id, version): (String, i64) = self.conn.query_row(
            "INSERT INTO mark_records(id, student_id, exam_type, year, version, entries_json, updated_at)
             VALUES(?, ?, ?, ?, 1, ?, ?)
             ON CONFLICT(student_id, exam_type, year) DO UPDATE SET
               version = mark_records.version + 1,
               entries_json = excluded.entries_json,
               updated_at = excluded.updated_at
             RETURNING id, version",
            (
                &record.id,
                &record.student_id,
                &record.exam_type,
                &record.year,
                &entries_json,
                &updated_at,
            ),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(MarkRecord {
            id,
            version,
            updated_at: Some(updated_at),
            ..record.clone()
        })
    }

    fn update_if_version(
        &self,
        record: &MarkRecord,
        expected_version: i64,
    ) -> Result<Option<MarkRecord>, StoreError> {
        check_unique_entries(record)?;
        let entries_json = serde_json::to_string(&record.entries)?;
        let updated_at = now_rfc3339();
        let changed = self.conn.execute(
            "UPDATE mark_records
             SET version = version + 1, entries_json = ?, updated_at = ?
             WHERE id = ? AND version = ?",
            (&entries_json, &updated_at, &record.id, expected_version),
        )?;
        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(MarkRecord {
            version: expected_version + 1,
            updated_at: Some(updated_at),
            ..record.clone()
        }))
    }

    fn delete_if_empty(&self, record_id: &str) -> Result<bool, StoreError> {
        let deleted = self.conn.execute(
            "DELETE FROM mark_records WHERE id = ? AND json_array_length(entries_json) = 0",
            [record_id],
        )?;
        if deleted > 0 {
            return Ok(true);
        }
        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM mark_records WHERE id = ?",
                [record_id],
                |r| r.get(0),
            )
            .optional()?;
        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(record_id.to_string())),
        }
    }

    fn atomically<T, E>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(StoreError::from)?;
        let out = f()?;
        tx.commit().map_err(StoreError::from)?;
        Ok(out)
    }
}
