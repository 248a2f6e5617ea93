use crate::directory::{SqliteDirectory, StudentDirectory, TeacherDirectory};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::model::{Student, Teacher};
use rusqlite::Connection;
use serde_json::{json, Value};

const STUDENTS_UPSERT_MAX: usize = 5000;

fn non_empty(field: &str, value: &str) -> Result<(), HandlerErr> {
    if value.trim().is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn parse_student(raw: &Value) -> Result<Student, HandlerErr> {
    let s: Student = serde_json::from_value(raw.clone())
        .map_err(|e| HandlerErr::bad_params(format!("invalid student: {}", e)))?;
    non_empty("studentId", &s.student_id)?;
    non_empty("rollNo", &s.roll_no)?;
    non_empty("year", &s.year)?;
    non_empty("division", &s.division)?;
    Ok(s)
}

fn students_upsert(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let Some(arr) = params.get("students").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing students[]"));
    };
    if arr.len() > STUDENTS_UPSERT_MAX {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!(
                "too many students: {} > {}",
                arr.len(),
                STUDENTS_UPSERT_MAX
            ),
            details: None,
        });
    }
    let students = arr.iter().map(parse_student).collect::<Result<Vec<_>, _>>()?;

    let dir = SqliteDirectory::new(conn);
    for s in &students {
        dir.upsert_student(s)?;
    }
    Ok(json!({ "upserted": students.len() }))
}

fn students_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let year = required_str(params, "year")?;
    let division = required_str(params, "division")?;
    let students = SqliteDirectory::new(conn).list_students(&year, &division)?;
    Ok(json!({ "students": students }))
}

fn teachers_upsert(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let Some(raw) = params.get("teacher") else {
        return Err(HandlerErr::bad_params("missing teacher"));
    };
    let teacher: Teacher = serde_json::from_value(raw.clone())
        .map_err(|e| HandlerErr::bad_params(format!("invalid teacher: {}", e)))?;
    non_empty("teacherId", &teacher.teacher_id)?;
    for s in &teacher.subjects {
        non_empty("subjects[].name", &s.name)?;
    }
    SqliteDirectory::new(conn).upsert_teacher(&teacher)?;
    Ok(json!({ "teacherId": teacher.teacher_id, "subjects": teacher.subjects.len() }))
}

fn teachers_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let teacher_id = required_str(params, "teacherId")?;
    match SqliteDirectory::new(conn).lookup_teacher(&teacher_id)? {
        Some(t) => Ok(json!({ "teacher": t })),
        None => Err(HandlerErr {
            code: "not_found",
            message: format!("teacher {} not found", teacher_id),
            details: None,
        }),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let handler: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "students.upsert" => students_upsert,
        "students.list" => students_list,
        "teachers.upsert" => teachers_upsert,
        "teachers.get" => teachers_get,
        _ => return None,
    };
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    Some(match handler(conn, &req.params) {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
