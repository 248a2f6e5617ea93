use crate::db;
use crate::error::MarksError;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::HandlerErr;
use crate::ipc::types::{AppState, Request};
use crate::marks::reapply_policies;
use crate::model::{ExamPolicy, ExamPolicyTable};
use crate::store::{MarkStore, SqliteMarkStore};
use rusqlite::Connection;
use serde_json::{json, Value};

pub const EXAM_TYPES_KEY: &str = "marks.examTypes";

/// The workspace's exam-type table, or the built-in defaults when none has
/// been saved.
pub fn load_exam_policies(conn: &Connection) -> Result<ExamPolicyTable, HandlerErr> {
    let Some(raw) = db::settings_get_json(conn, EXAM_TYPES_KEY)? else {
        return Ok(ExamPolicyTable::default());
    };
    let policies: Vec<ExamPolicy> = serde_json::from_value(raw).map_err(|e| HandlerErr {
        code: "storage_failed",
        message: format!("stored {} is unreadable: {}", EXAM_TYPES_KEY, e),
        details: None,
    })?;
    ExamPolicyTable::from_policies(policies).map_err(|e| HandlerErr {
        code: "storage_failed",
        message: format!("stored {} is invalid: {}", EXAM_TYPES_KEY, e),
        details: None,
    })
}

fn exam_types_get(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let table = load_exam_policies(conn)?;
    Ok(json!({ "examTypes": table.policies() }))
}

fn exam_types_set(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let Some(raw) = params.get("examTypes").filter(|v| v.is_array()) else {
        return Err(HandlerErr::bad_params("missing examTypes[]"));
    };
    let policies: Vec<ExamPolicy> = serde_json::from_value(raw.clone())
        .map_err(|e| HandlerErr::bad_params(format!("invalid examTypes: {}", e)))?;
    let table = ExamPolicyTable::from_policies(policies).map_err(MarksError::validation)?;
    let previous = load_exam_policies(conn)?;

    // Settings write and outcome rewrite commit together.
    let store = SqliteMarkStore::new(conn);
    let rewritten = store.atomically(|| {
        db::settings_set_json(conn, EXAM_TYPES_KEY, &json!(table.policies()))?;
        Ok::<_, HandlerErr>(reapply_policies(&store, &previous, &table)?)
    })?;
    tracing::info!(
        count = table.policies().len(),
        records = rewritten,
        "exam-type table replaced"
    );
    Ok(json!({ "examTypes": table.policies(), "recordsUpdated": rewritten }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let handler: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "settings.examTypes.get" => exam_types_get,
        "settings.examTypes.set" => exam_types_set,
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
