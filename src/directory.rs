//! Student and teacher directories.
//!
//! Both are owned by other services; the traits are the contract this
//! subsystem consumes. The SQLite implementation backs the sidecar's own
//! `students.*` and `teachers.*` methods.

use crate::model::{ClassRef, Student, SubjectAssignment, Teacher};
use crate::store::StoreError;
use rusqlite::{Connection, OptionalExtension};

pub trait StudentDirectory {
    fn lookup_student(&self, student_id: &str) -> Result<Option<Student>, StoreError>;

    /// Roster in roll-number order.
    fn list_students(&self, year: &str, division: &str) -> Result<Vec<Student>, StoreError>;
}

pub trait TeacherDirectory {
    fn lookup_teacher(&self, teacher_id: &str) -> Result<Option<Teacher>, StoreError>;
}

pub struct SqliteDirectory<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteDirectory<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn upsert_student(&self, s: &Student) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO students(id, roll_no, name, year, division, updated_at)
             VALUES(?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               roll_no = excluded.roll_no,
               name = excluded.name,
               year = excluded.year,
               division = excluded.division,
               updated_at = excluded.updated_at",
            (
                &s.student_id,
                &s.roll_no,
                &s.name,
                &s.year,
                &s.division,
                chrono::Utc::now().to_rfc3339(),
            ),
        )?;
        Ok(())
    }

    /// Replaces the teacher row and the full subject assignment list.
    pub fn upsert_teacher(&self, t: &Teacher) -> Result<(), StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO teachers(id, name, department, assigned_year, assigned_division, updated_at)
             VALUES(?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               name = excluded.name,
               department = excluded.department,
               assigned_year = excluded.assigned_year,
               assigned_division = excluded.assigned_division,
               updated_at = excluded.updated_at",
            (
                &t.teacher_id,
                &t.name,
                &t.department,
                t.assigned_class.as_ref().map(|c| c.year.as_str()),
                t.assigned_class.as_ref().map(|c| c.division.as_str()),
                chrono::Utc::now().to_rfc3339(),
            ),
        )?;
        tx.execute(
            "DELETE FROM teacher_subjects WHERE teacher_id = ?",
            [&t.teacher_id],
        )?;
        for (i, s) in t.subjects.iter().enumerate() {
            tx.execute(
                "INSERT OR IGNORE INTO teacher_subjects(teacher_id, subject_name, year, division, sort_order)
                 VALUES(?, ?, ?, ?, ?)",
                (&t.teacher_id, &s.name, &s.year, &s.division, i as i64),
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

impl StudentDirectory for SqliteDirectory<'_> {
    fn lookup_student(&self, student_id: &str) -> Result<Option<Student>, StoreError> {
        let s = self
            .conn
            .query_row(
                "SELECT id, roll_no, name, year, division FROM students WHERE id = ?",
                [student_id],
                |r| {
                    Ok(Student {
                        student_id: r.get(0)?,
                        roll_no: r.get(1)?,
                        name: r.get(2)?,
                        year: r.get(3)?,
                        division: r.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(s)
    }

    fn list_students(&self, year: &str, division: &str) -> Result<Vec<Student>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, roll_no, name, year, division
             FROM students
             WHERE year = ? AND division = ?
             ORDER BY roll_no, id",
        )?;
        let rows = stmt
            .query_map((year, division), |r| {
                Ok(Student {
                    student_id: r.get(0)?,
                    roll_no: r.get(1)?,
                    name: r.get(2)?,
                    year: r.get(3)?,
                    division: r.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl TeacherDirectory for SqliteDirectory<'_> {
    fn lookup_teacher(&self, teacher_id: &str) -> Result<Option<Teacher>, StoreError> {
        let row: Option<(String, String, String, Option<String>, Option<String>)> = self
            .conn
            .query_row(
                "SELECT id, name, department, assigned_year, assigned_division
                 FROM teachers WHERE id = ?",
                [teacher_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
            )
            .optional()?;
        let Some((id, name, department, assigned_year, assigned_division)) = row else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT subject_name, year, division
             FROM teacher_subjects
             WHERE teacher_id = ?
             ORDER BY sort_order",
        )?;
        let subjects = stmt
            .query_map([&id], |r| {
                Ok(SubjectAssignment {
                    name: r.get(0)?,
                    year: r.get(1)?,
                    division: r.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let assigned_class = match (assigned_year, assigned_division) {
            (Some(year), Some(division)) => Some(ClassRef { year, division }),
            _ => None,
        };

        Ok(Some(Teacher {
            teacher_id: id,
            name,
            department,
            assigned_class,
            subjects,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;

    #[test]
    fn teacher_upsert_replaces_subjects() {
        let conn = open_in_memory();
        let dir = SqliteDirectory::new(&conn);
        let mut t = Teacher {
            teacher_id: "t1".into(),
            name: "Asha Rao".into(),
            department: "Science".into(),
            assigned_class: Some(ClassRef {
                year: "SE".into(),
                division: "A".into(),
            }),
            subjects: vec![SubjectAssignment {
                name: "Physics".into(),
                year: "SE".into(),
                division: "A".into(),
            }],
        };
        dir.upsert_teacher(&t).unwrap();
        t.subjects = vec![SubjectAssignment {
            name: "Chemistry".into(),
            year: "SE".into(),
            division: "B".into(),
        }];
        dir.upsert_teacher(&t).unwrap();

        let loaded = dir.lookup_teacher("t1").unwrap().expect("teacher");
        assert_eq!(loaded, t);
        assert!(loaded.teaches("Chemistry", "SE", "B"));
        assert!(!loaded.teaches("Physics", "SE", "A"));
        assert!(dir.lookup_teacher("missing").unwrap().is_none());
    }

    #[test]
    fn roster_is_ordered_by_roll_no() {
        let conn = open_in_memory();
        let dir = SqliteDirectory::new(&conn);
        for (id, roll) in [("s2", "02"), ("s1", "01"), ("s3", "03")] {
            dir.upsert_student(&Student {
                student_id: id.into(),
                roll_no: roll.into(),
                name: format!("Student {}", id),
                year: "SE".into(),
                division: "A".into(),
            })
            .unwrap();
        }
        let roster = dir.list_students("SE", "A").unwrap();
        assert_eq!(
            roster.iter().map(|s| s.roll_no.as_str()).collect::<Vec<_>>(),
            vec!["01", "02", "03"]
        );
        assert!(dir.list_students("SE", "B").unwrap().is_empty());
    }
}
