//! Writes a report to disk under a time bound.
//!
//! Rendering runs on a worker thread into `<out>.partial`. The file is
//! renamed into place only after the renderer finishes; on failure or
//! timeout the partial file is removed, so a caller never sees a truncated
//! report at `out_path`.

use super::pdf::{render_document, PageLayout, RenderStats};
use super::xlsx::render_spreadsheet;
use super::{ReportFormat, ReportViewModel};
use crate::error::MarksError;
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    pub out_path: String,
    pub format: ReportFormat,
    pub bytes: u64,
    pub rows: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pages: Option<usize>,
    pub digest: String,
}

fn partial_path(out_path: &Path) -> PathBuf {
    let mut p = out_path.as_os_str().to_owned();
    p.push(".partial");
    PathBuf::from(p)
}

pub fn export_report(
    vm: ReportViewModel,
    format: ReportFormat,
    out_path: &Path,
    timeout: Duration,
    layout: PageLayout,
) -> Result<ExportSummary, MarksError> {
    let digest = vm.digest.clone();
    let summary = run_with_deadline(out_path, timeout, move |partial, cancel| {
        let file = File::create(partial)?;
        match format {
            ReportFormat::Document => {
                render_document(&vm, BufWriter::new(file), &layout, cancel)
            }
            ReportFormat::Spreadsheet => render_spreadsheet(&vm, BufWriter::new(file), cancel),
        }
    })?;
    Ok(ExportSummary {
        out_path: out_path.to_string_lossy().to_string(),
        format,
        bytes: summary.0,
        rows: summary.1.rows,
        pages: summary.1.pages,
        digest,
    })
}

fn run_with_deadline<F>(
    out_path: &Path,
    timeout: Duration,
    render: F,
) -> Result<(u64, RenderStats), MarksError>
where
    F: FnOnce(&Path, &AtomicBool) -> Result<RenderStats, MarksError> + Send + 'static,
{
    if out_path.as_os_str().is_empty() {
        return Err(MarksError::validation("missing outPath"));
    }
    if let Some(parent) = out_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let partial = partial_path(out_path);
    let cancel = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    let started = Instant::now();

    let worker = {
        let partial = partial.clone();
        let cancel = Arc::clone(&cancel);
        std::thread::spawn(move || {
            let res = render(&partial, &cancel);
            let _ = tx.send(res);
        })
    };

    let res = match rx.recv_timeout(timeout) {
        Ok(Ok(stats)) => {
            let _ = worker.join();
            std::fs::rename(&partial, out_path)
                .and_then(|_| std::fs::metadata(out_path))
                .map(|m| (m.len(), stats))
                .map_err(MarksError::from)
        }
        Ok(Err(e)) => {
            let _ = worker.join();
            Err(e)
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            cancel.store(true, Ordering::Relaxed);
            let _ = worker.join();
            Err(MarksError::Timeout(timeout))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            let _ = worker.join();
            Err(MarksError::Render("report worker exited without a result".into()))
        }
    };

    match &res {
        Ok((bytes, stats)) => tracing::info!(
            out = %out_path.display(),
            bytes,
            rows = stats.rows,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "report written"
        ),
        Err(e) => {
            let _ = std::fs::remove_file(&partial);
            tracing::warn!(out = %out_path.display(), error = %e, "report export failed");
        }
    }
    res
}
