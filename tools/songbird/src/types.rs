use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One signal modification the effects device can apply, selected by a single ASCII byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeSpec {
    pub name: String,
    pub command: char,
}

impl ModeSpec {
    pub fn new(name: &str, command: char) -> Self {
        Self {
            name: name.to_string(),
            command,
        }
    }

    pub fn command_byte(&self) -> u8 {
        // validate_config guarantees ASCII
        self.command as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Fresh,
    Running,
    Completed,
    TerminatedEarly,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::TerminatedEarly => "terminated_early",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioDirection {
    Input,
    Output,
}

impl AudioDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

/// Absolute locations for one session, resolved from config against the working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub working_dir: PathBuf,
    pub source_dir: PathBuf,
    pub results_dir: PathBuf,
    pub checkpoint_path: PathBuf,
    pub backup_dir: PathBuf,
    pub log_dir: PathBuf,
    pub probe_dir: PathBuf,
    pub report_path: PathBuf,
}

/// Last measured properties of a recording, kept in the checkpoint for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingMeasurement {
    pub size_bytes: u64,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
}
