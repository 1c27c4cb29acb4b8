//! Markdown session reports written after each run.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;
use sq_core::persist;
use tracing::info;

use crate::coordinator::RunReport;

/// Render `report` as a markdown document.
pub fn render_session(report: &RunReport, instance_id: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Squadron session report");
    let _ = writeln!(out);
    let _ = writeln!(out, "- **Instance:** {instance_id}");
    let _ = writeln!(out, "- **Request:** {}", report.request);
    let _ = writeln!(out, "- **Mode:** {}", report.mode.as_str());
    let _ = writeln!(out, "- **Outcome:** {}", report.outcome.as_str());
    let _ = writeln!(out, "- **Elapsed:** {:.1}s", report.elapsed.as_secs_f64());
    let _ = writeln!(
        out,
        "- **Tasks:** {} total, {} completed, {} failed",
        report.stats.total, report.stats.completed, report.stats.failed
    );
    let _ = writeln!(out);

    let _ = writeln!(out, "## Tasks");
    let _ = writeln!(out);
    let _ = writeln!(out, "| Id | Title | Agent | Status | Hours | Error |");
    let _ = writeln!(out, "|---|---|---|---|---|---|");
    for task in &report.tasks {
        let agent = task
            .metadata
            .get("agent")
            .and_then(|v| v.as_str())
            .unwrap_or("-");
        let hours = task
            .actual_hours
            .map(|h| format!("{h:.3}"))
            .unwrap_or_else(|| "-".to_string());
        let error = task.error.as_deref().unwrap_or("").replace('|', "\\|");
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} | {} | {} |",
            task.short_id(),
            task.title.replace('|', "\\|"),
            agent,
            task.status,
            hours,
            error.lines().next().unwrap_or("")
        );
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "## Files modified");
    let _ = writeln!(out);
    if report.files_modified.is_empty() {
        let _ = writeln!(out, "_none reported_");
    }
    for file in &report.files_modified {
        let _ = writeln!(out, "- `{file}`");
    }
    out
}

/// Write the session report under `dir`. Returns the file path.
pub async fn write_session(dir: &Path, report: &RunReport, instance_id: &str) -> std::io::Result<PathBuf> {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let path = dir.join(format!("session-{instance_id}-{stamp}.md"));
    let body = render_session(report, instance_id).into_bytes();
    persist::write_atomic(&path, body).await?;
    info!(path = %path.display(), "session report written");
    Ok(path)
}
