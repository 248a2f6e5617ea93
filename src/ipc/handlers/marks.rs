use crate::calc::{parse_transcript_filters, subject_view, transcript};
use crate::directory::SqliteDirectory;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::setup::load_exam_policies;
use crate::ipc::helpers::{get_str, principal, required_str, write_mode, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::marks::{parse_score_input, MarkUpdateEngine, SubmitMode};
use crate::store::{MarkStore, RecordFilter, SqliteMarkStore};
use rusqlite::Connection;
use serde_json::{json, Value};

fn marks_submit(conn: &Connection, params: &Value, optimistic: bool) -> Result<Value, HandlerErr> {
    let principal = principal(params)?;
    let Some(items) = params.get("items").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing items[]"));
    };
    let mode = SubmitMode::parse(get_str(params, "mode"))?;

    let policies = load_exam_policies(conn)?;
    let store = SqliteMarkStore::new(conn);
    let dir = SqliteDirectory::new(conn);
    let engine = MarkUpdateEngine::new(&store, &dir, &policies, write_mode(optimistic));
    let result = engine.submit_batch(&principal, items, mode);
    Ok(json!(result))
}

fn marks_update_entry(
    conn: &Connection,
    params: &Value,
    optimistic: bool,
) -> Result<Value, HandlerErr> {
    let principal = principal(params)?;
    let record_id = required_str(params, "recordId")?;
    let subject_name = required_str(params, "subjectName")?;
    let teacher_id = required_str(params, "teacherId")?;
    let input = parse_score_input(params.get("scores"))?;

    let policies = load_exam_policies(conn)?;
    let store = SqliteMarkStore::new(conn);
    let dir = SqliteDirectory::new(conn);
    let engine = MarkUpdateEngine::new(&store, &dir, &policies, write_mode(optimistic));
    let result = engine.update_entry(&principal, &record_id, &subject_name, &teacher_id, input)?;
    Ok(json!(result))
}

fn marks_remove_entry(
    conn: &Connection,
    params: &Value,
    optimistic: bool,
) -> Result<Value, HandlerErr> {
    let principal = principal(params)?;
    let record_id = required_str(params, "recordId")?;
    let subject_name = required_str(params, "subjectName")?;
    let teacher_id = required_str(params, "teacherId")?;

    let policies = load_exam_policies(conn)?;
    let store = SqliteMarkStore::new(conn);
    let dir = SqliteDirectory::new(conn);
    let engine = MarkUpdateEngine::new(&store, &dir, &policies, write_mode(optimistic));
    let result = engine.remove_entry(&principal, &record_id, &subject_name, &teacher_id)?;
    Ok(json!(result))
}

fn parse_record_filter(params: &Value) -> Result<RecordFilter, HandlerErr> {
    let raw = match params.get("filter") {
        None => return Ok(RecordFilter::default()),
        Some(v) if v.is_null() => return Ok(RecordFilter::default()),
        Some(v) if v.is_object() => v,
        Some(_) => return Err(HandlerErr::bad_params("filter must be an object")),
    };
    let field = |key: &str| get_str(raw, key).map(str::to_string);
    Ok(RecordFilter {
        student_id: field("studentId"),
        exam_type: field("examType"),
        year: field("year"),
        subject_name: field("subjectName"),
        teacher_id: field("teacherId"),
    })
}

fn marks_query(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let filter = parse_record_filter(params)?;
    let records = SqliteMarkStore::new(conn).get_many(&filter)?;
    let views: Vec<_> = records.iter().map(|r| r.view()).collect();
    Ok(json!({ "records": views }))
}

fn marks_subject_view(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let subject_name = required_str(params, "subjectName")?;
    let exam_type = required_str(params, "examType")?;
    let year = get_str(params, "year");
    let division = get_str(params, "division");

    let store = SqliteMarkStore::new(conn);
    let dir = SqliteDirectory::new(conn);
    let students = subject_view(&store, &dir, &subject_name, &exam_type, year, division)?;
    Ok(json!({
        "subjectName": subject_name,
        "examType": exam_type,
        "students": students,
    }))
}

fn marks_transcript(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let filters = parse_transcript_filters(params.get("filters"))?;

    let store = SqliteMarkStore::new(conn);
    let dir = SqliteDirectory::new(conn);
    let t = transcript(&store, &dir, &student_id, &filters)?;
    Ok(json!(t))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let method = req.method.as_str();
    if !matches!(
        method,
        "marks.submit"
            | "marks.updateEntry"
            | "marks.removeEntry"
            | "marks.query"
            | "marks.subjectView"
            | "marks.transcript"
    ) {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    let optimistic = state.config.optimistic_writes;
    let res = match method {
        "marks.submit" => marks_submit(conn, &req.params, optimistic),
        "marks.updateEntry" => marks_update_entry(conn, &req.params, optimistic),
        "marks.removeEntry" => marks_remove_entry(conn, &req.params, optimistic),
        "marks.query" => marks_query(conn, &req.params),
        "marks.subjectView" => marks_subject_view(conn, &req.params),
        _ => marks_transcript(conn, &req.params),
    };
    Some(match res {
        Ok(v) => ok(&req.id, v),
        Err(e) => {
            tracing::debug!(method, code = e.code, "request failed");
            e.response(&req.id)
        }
    })
}
