use crate::checkpoint::{RecordingTask, StatusCounts};
use crate::errors::SongbirdError;
use crate::logging::append_run_log;
use crate::types::SessionState;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BreakdownKey {
    pub speaker: String,
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTaskLine {
    pub task_id: String,
    pub speaker: String,
    pub mode: String,
    pub source_file: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub started_at: String,
    pub finished_at: String,
    pub duration: Duration,
    pub state: SessionState,
    pub termination_reason: Option<String>,
    pub hardware_attempts: u32,
    pub skipped: usize,
    pub demoted: usize,
    pub counts: StatusCounts,
    pub by_speaker: BTreeMap<String, StatusCounts>,
    pub by_mode: BTreeMap<String, StatusCounts>,
    pub breakdown: BTreeMap<BreakdownKey, StatusCounts>,
    pub failures: Vec<FailedTaskLine>,
}

/// Per-session numbers the orchestrator knows but the checkpoint does not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFacts {
    pub started_at: String,
    pub finished_at: String,
    pub duration: Duration,
    pub state: SessionState,
    pub termination_reason: Option<String>,
    pub hardware_attempts: u32,
    pub skipped: usize,
    pub demoted: usize,
}

pub fn build_report(tasks: &[&RecordingTask], facts: SessionFacts) -> SessionReport {
    let mut counts = StatusCounts::default();
    let mut by_speaker: BTreeMap<String, StatusCounts> = BTreeMap::new();
    let mut by_mode: BTreeMap<String, StatusCounts> = BTreeMap::new();
    let mut breakdown: BTreeMap<BreakdownKey, StatusCounts> = BTreeMap::new();
    let mut failures = Vec::new();

    for task in tasks {
        counts.add(task.status);
        by_speaker
            .entry(task.speaker.clone())
            .or_default()
            .add(task.status);
        by_mode.entry(task.mode.clone()).or_default().add(task.status);
        breakdown
            .entry(BreakdownKey {
                speaker: task.speaker.clone(),
                mode: task.mode.clone(),
            })
            .or_default()
            .add(task.status);
        if task.status == crate::types::TaskStatus::Failed {
            failures.push(FailedTaskLine {
                task_id: task.task_id.clone(),
                speaker: task.speaker.clone(),
                mode: task.mode.clone(),
                source_file: task.source_file.clone(),
                error: task.last_error.clone().unwrap_or_default(),
            });
        }
    }

    SessionReport {
        started_at: facts.started_at,
        finished_at: facts.finished_at,
        duration: facts.duration,
        state: facts.state,
        termination_reason: facts.termination_reason,
        hardware_attempts: facts.hardware_attempts,
        skipped: facts.skipped,
        demoted: facts.demoted,
        counts,
        by_speaker,
        by_mode,
        breakdown,
        failures,
    }
}

pub fn render_markdown(report: &SessionReport) -> String {
    let mut out = String::new();
    out.push_str("# Songbird Session Report\n\n");
    out.push_str(&format!("- State: {}\n", report.state.as_str()));
    if let Some(reason) = &report.termination_reason {
        out.push_str(&format!("- Termination: {}\n", sanitize_cell(reason)));
    }
    out.push_str(&format!("- Started: {}\n", report.started_at));
    out.push_str(&format!("- Finished: {}\n", report.finished_at));
    out.push_str(&format!("- Duration: {}\n", format_duration(report.duration)));
    out.push_str(&format!(
        "- Hardware validation attempts: {}\n",
        report.hardware_attempts
    ));
    out.push_str(&format!(
        "- Skipped (already complete): {}\n",
        report.skipped
    ));
    out.push_str(&format!(
        "- Demoted on re-validation: {}\n\n",
        report.demoted
    ));

    out.push_str("## Totals\n\n");
    out.push_str(&counts_header("Scope"));
    out.push_str(&counts_row("all", &report.counts));

    out.push_str("\n## By speaker\n\n");
    out.push_str(&counts_header("Speaker"));
    for (speaker, counts) in &report.by_speaker {
        out.push_str(&counts_row(speaker, counts));
    }

    out.push_str("\n## By mode\n\n");
    out.push_str(&counts_header("Mode"));
    for (mode, counts) in &report.by_mode {
        out.push_str(&counts_row(mode, counts));
    }

    out.push_str("\n## By speaker and mode\n\n");
    out.push_str(&counts_header("Speaker / mode"));
    for (key, counts) in &report.breakdown {
        out.push_str(&counts_row(&format!("{} / {}", key.speaker, key.mode), counts));
    }

    if !report.failures.is_empty() {
        out.push_str("\n## Failed tasks\n\n");
        out.push_str("| Task ID | Speaker | Mode | Source | Error |\n");
        out.push_str("| --- | --- | --- | --- | --- |\n");
        for failure in &report.failures {
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} |\n",
                failure.task_id,
                sanitize_cell(&failure.speaker),
                sanitize_cell(&failure.mode),
                sanitize_cell(&failure.source_file),
                sanitize_cell(&failure.error)
            ));
        }
    }
    out
}

pub fn console_summary(report: &SessionReport) -> Vec<String> {
    let mut lines = vec![format!(
        "Session {}: {} completed, {} failed, {} pending of {} tasks in {}",
        report.state.as_str(),
        report.counts.completed,
        report.counts.failed,
        report.counts.pending + report.counts.running,
        report.counts.total(),
        format_duration(report.duration)
    )];
    for failure in &report.failures {
        lines.push(format!(
            "  failed {} {} {}: {}",
            failure.speaker, failure.mode, failure.source_file, failure.error
        ));
    }
    if report.counts.failed > 0 {
        lines.push("Run again with --resume to retry failed tasks.".to_string());
    }
    lines
}

pub fn write_report(report: &SessionReport, output: &Path) -> Result<String, SongbirdError> {
    let rendered = render_markdown(report);
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SongbirdError::Io(e.to_string()))?;
    }
    std::fs::write(output, rendered.as_bytes()).map_err(|e| SongbirdError::Io(e.to_string()))?;
    append_run_log(
        "info",
        "session.report.written",
        json!({
            "path": output.display().to_string(),
            "completed": report.counts.completed,
            "failed": report.counts.failed,
            "state": report.state.as_str(),
        }),
    );
    Ok(rendered)
}

fn counts_header(label: &str) -> String {
    format!("| {label} | Completed | Failed | Pending | Total |\n| --- | --- | --- | --- | --- |\n")
}

fn counts_row(label: &str, counts: &StatusCounts) -> String {
    format!(
        "| {} | {} | {} | {} | {} |\n",
        sanitize_cell(label),
        counts.completed,
        counts.failed,
        counts.pending + counts.running,
        counts.total()
    )
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}h {:02}m {:02}s", secs / 3600, (secs / 60) % 60, secs % 60)
}

fn sanitize_cell(value: &str) -> String {
    value.replace('|', "\\|").replace('\n', " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskStatus;
    use std::path::PathBuf;

    fn task(speaker: &str, mode: &str, source: &str, status: TaskStatus) -> RecordingTask {
        RecordingTask {
            task_id: crate::task_identity::compute_task_id(speaker, mode, source),
            speaker: speaker.to_string(),
            mode: mode.to_string(),
            source_file: source.to_string(),
            output_path: PathBuf::from(format!("/r/{speaker}/{source}_{mode}.wav")),
            status,
            last_error: (status == TaskStatus::Failed).then(|| "recorder | exit 1".to_string()),
            completed_at: None,
            updated_at: "2024-01-01T00:00:00Z".to_string(),
            attempts: 1,
            validation: None,
        }
    }

    fn facts(state: SessionState) -> SessionFacts {
        SessionFacts {
            started_at: "2024-01-01T00:00:00Z".to_string(),
            finished_at: "2024-01-01T01:02:03Z".to_string(),
            duration: Duration::from_secs(3723),
            state,
            termination_reason: None,
            hardware_attempts: 2,
            skipped: 0,
            demoted: 0,
        }
    }

    #[test]
    fn breakdown_counts_per_speaker_and_mode() {
        let tasks = [
            task("21525", "noise", "a", TaskStatus::Completed),
            task("21525", "pitch", "a", TaskStatus::Failed),
            task("23723", "noise", "a", TaskStatus::Completed),
        ];
        let refs = tasks.iter().collect::<Vec<_>>();
        let report = build_report(&refs, facts(SessionState::Completed));

        assert_eq!(report.counts.completed, 2);
        assert_eq!(report.by_mode["noise"].completed, 2);
        assert_eq!(report.by_speaker["21525"].failed, 1);
        let key = BreakdownKey {
            speaker: "21525".to_string(),
            mode: "pitch".to_string(),
        };
        assert_eq!(report.breakdown[&key].failed, 1);
        assert_eq!(report.failures.len(), 1);
    }

    #[test]
    fn markdown_renders_tables_and_escapes_cells() {
        let tasks = [
            task("21525", "noise", "a", TaskStatus::Completed),
            task("21525", "pitch", "a", TaskStatus::Failed),
        ];
        let refs = tasks.iter().collect::<Vec<_>>();
        let rendered = render_markdown(&build_report(&refs, facts(SessionState::TerminatedEarly)));

        assert!(rendered.contains("# Songbird Session Report"));
        assert!(rendered.contains("- State: terminated_early"));
        assert!(rendered.contains("- Duration: 1h 02m 03s"));
        assert!(rendered.contains("| 21525 / noise | 1 | 0 | 0 | 1 |"));
        assert!(rendered.contains("recorder \\| exit 1"));
    }

    #[test]
    fn console_summary_points_at_resume_when_tasks_failed() {
        let tasks = [task("s", "warp", "a", TaskStatus::Failed)];
        let refs = tasks.iter().collect::<Vec<_>>();
        let lines = console_summary(&build_report(&refs, facts(SessionState::Completed)));
        assert!(lines[0].starts_with("Session completed: 0 completed, 1 failed"));
        assert!(lines.last().is_some_and(|line| line.contains("--resume")));
    }
}
