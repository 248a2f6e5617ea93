use crate::directory::SqliteDirectory;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_str, required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::report::export::export_report;
use crate::report::pdf::PageLayout;
use crate::report::{build_report, ReportFilter, ReportFormat, ReportKind, ReportViewModel};
use crate::store::SqliteMarkStore;
use rusqlite::Connection;
use serde_json::{json, Value};
use std::path::PathBuf;

fn parse_kind(params: &Value) -> Result<ReportKind, HandlerErr> {
    match get_str(params, "kind").map(|s| s.to_ascii_lowercase()).as_deref() {
        Some("subject") => Ok(ReportKind::Subject),
        Some("class") => Ok(ReportKind::Class),
        _ => Err(HandlerErr::bad_params("kind must be one of: subject, class")),
    }
}

fn parse_format(params: &Value) -> Result<ReportFormat, HandlerErr> {
    match get_str(params, "format").map(|s| s.to_ascii_lowercase()).as_deref() {
        Some("document") | Some("pdf") => Ok(ReportFormat::Document),
        Some("spreadsheet") | Some("xlsx") => Ok(ReportFormat::Spreadsheet),
        _ => Err(HandlerErr::bad_params(
            "format must be one of: document, spreadsheet",
        )),
    }
}

fn parse_filter(params: &Value) -> Result<ReportFilter, HandlerErr> {
    let Some(raw) = params.get("filter").filter(|v| v.is_object()) else {
        return Err(HandlerErr::bad_params("missing filter"));
    };
    Ok(ReportFilter {
        year: required_str(raw, "year")?,
        division: required_str(raw, "division")?,
        exam_type: required_str(raw, "examType")?,
        subject_name: get_str(raw, "subjectName").map(str::to_string),
    })
}

fn view_model(conn: &Connection, params: &Value) -> Result<ReportViewModel, HandlerErr> {
    let kind = parse_kind(params)?;
    let filter = parse_filter(params)?;
    let store = SqliteMarkStore::new(conn);
    let dir = SqliteDirectory::new(conn);
    Ok(build_report(&store, &dir, kind, &filter)?)
}

fn reports_model(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let vm = view_model(conn, params)?;
    Ok(json!(vm))
}

fn reports_export(state: &AppState, conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let format = parse_format(params)?;
    let out_path = PathBuf::from(required_str(params, "outPath")?);
    let vm = view_model(conn, params)?;

    let layout = PageLayout {
        rows_per_page: state.config.page_rows,
        ..PageLayout::default()
    };
    tracing::info!(
        kind = ?vm.kind,
        format = format.extension(),
        rows = vm.rows.len(),
        "exporting report"
    );
    let summary = export_report(vm, format, &out_path, state.config.report_timeout, layout)?;
    Ok(json!(summary))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    if !matches!(req.method.as_str(), "reports.model" | "reports.export") {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    let res = if req.method == "reports.model" {
        reports_model(conn, &req.params)
    } else {
        reports_export(state, conn, &req.params)
    };
    Some(match res {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
