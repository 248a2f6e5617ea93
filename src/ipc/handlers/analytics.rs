use crate::calc::class_dashboard;
use crate::directory::SqliteDirectory;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::store::SqliteMarkStore;
use rusqlite::Connection;
use serde_json::{json, Value};

fn dashboard_class(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let year = required_str(params, "year")?;
    let division = required_str(params, "division")?;
    let store = SqliteMarkStore::new(conn);
    let dir = SqliteDirectory::new(conn);
    let dashboard = class_dashboard(&store, &dir, &year, &division)?;
    Ok(json!(dashboard))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    if req.method != "dashboard.class" {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    Some(match dashboard_class(conn, &req.params) {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
