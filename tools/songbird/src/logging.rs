use crate::errors::SongbirdError;
use crate::log_retention::enforce_total_budget;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

pub const DEFAULT_DISK_BUDGET_BYTES: u64 = 50 * 1024 * 1024;

static RUN_LOGGER: OnceLock<Mutex<Option<JsonlLogger>>> = OnceLock::new();
static VERBOSE: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: 4096,
            budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
        }
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), SongbirdError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| SongbirdError::Io(e.to_string()))?;
        }
        let truncated = truncate_json(event.payload.clone(), self.max_payload_bytes);
        let line = serde_json::to_string(&LogEvent {
            level: event.level,
            event_type: event.event_type,
            payload: truncated,
        })
        .map_err(|e| SongbirdError::Io(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| SongbirdError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| SongbirdError::Io(e.to_string()))?;
        file.write_all(b"\n")
            .map_err(|e| SongbirdError::Io(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            let _ = enforce_total_budget(parent, self.budget_bytes, Some(&self.path))?;
        }

        Ok(())
    }
}

/// Routes `append_run_log` to `path` for the rest of the process.
pub fn init_run_log(path: impl AsRef<Path>, budget_bytes: u64) {
    let mut logger = JsonlLogger::new(path);
    logger.budget_bytes = budget_bytes;
    let slot = RUN_LOGGER.get_or_init(|| Mutex::new(None));
    if let Ok(mut guard) = slot.lock() {
        *guard = Some(logger);
    }
}

pub fn set_verbose(verbose: bool) {
    VERBOSE.store(verbose, Ordering::Relaxed);
}

pub fn run_log_path() -> Option<PathBuf> {
    RUN_LOGGER
        .get()
        .and_then(|slot| slot.lock().ok())
        .and_then(|guard| guard.as_ref().map(|logger| logger.path.clone()))
}

/// Best-effort structured event. Logging failures never interrupt a session.
pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    if VERBOSE.load(Ordering::Relaxed) {
        eprintln!(
            "{}",
            structured_fallback_line(level, event_type, &payload.to_string())
        );
    }
    let Some(slot) = RUN_LOGGER.get() else {
        return;
    };
    let Ok(guard) = slot.lock() else {
        return;
    };
    if let Some(logger) = guard.as_ref() {
        let _ = logger.append(&LogEvent {
            level,
            event_type,
            payload,
        });
    }
}

pub fn structured_fallback_line(level: &str, event_type: &str, message: &str) -> String {
    format!(
        "level={level} event={event_type} message={} ",
        message.replace('\n', "\\n")
    )
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}

#[cfg(test)]
mod tests {
    use super::{structured_fallback_line, JsonlLogger, LogEvent};
    use serde_json::json;

    #[test]
    fn logger_truncates_large_payloads_and_writes_jsonl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.jsonl");
        let mut logger = JsonlLogger::new(&path);
        logger.max_payload_bytes = 20;
        logger.budget_bytes = 1024;

        logger
            .append(&LogEvent {
                level: "info",
                event_type: "task.completed",
                payload: json!({"output": "abcdefghijklmnopqrstuvwxyz"}),
            })
            .expect("append");

        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.contains("\"event_type\":\"task.completed\""));
        assert!(text.contains("..."));
    }

    #[test]
    fn fallback_line_is_deterministic() {
        let line = structured_fallback_line("warn", "hardware.attempt", "no device\nfound");
        assert_eq!(
            line,
            "level=warn event=hardware.attempt message=no device\\nfound "
        );
    }
}
