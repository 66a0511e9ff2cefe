use crate::errors::SongbirdError;
use crate::runtime::FileSystem;
use crate::types::{ModeSpec, SessionPaths};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "songbird.toml";

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub modes: Vec<ModeSpec>,
    pub device: DeviceConfig,
    pub audio: AudioConfig,
    pub validation: ValidationConfig,
    pub backup: BackupConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    pub working_dir: Option<PathBuf>,
    pub source_dir: PathBuf,
    pub results_dir: PathBuf,
    pub checkpoint_file: Option<PathBuf>,
    pub report_file: String,
    pub speakers: Vec<String>,
    pub segment_seconds: f64,
    pub duration_tolerance_seconds: f64,
    pub record_margin_seconds: f64,
    pub min_recording_bytes: u64,
    pub expected_sample_rate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceConfig {
    pub audio_device_name: String,
    pub usb_query_command: Vec<String>,
    pub vendor_signature: String,
    pub serial_globs: Vec<String>,
    pub scan_dir: PathBuf,
    pub scan_prefixes: Vec<String>,
    pub baud_rate: u32,
    pub write_timeout_ms: u64,
    pub command_settle_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudioConfig {
    pub switch_command: String,
    pub play_command: Vec<String>,
    pub record_command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationConfig {
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub tone_seconds: f64,
    pub tone_frequency_hz: f64,
    pub min_probe_bytes: u64,
    pub routing_test: bool,
    pub continue_on_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupConfig {
    pub dir: PathBuf,
    pub retention: usize,
    pub checksums: bool,
    pub target_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PipelineConfig {
    pub enabled: bool,
    pub stages: Vec<PipelineStageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineStageConfig {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub budget_bytes: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig {
                working_dir: None,
                source_dir: PathBuf::from("audio/source"),
                results_dir: PathBuf::from("audio/recordings"),
                checkpoint_file: None,
                report_file: "session-report.md".to_string(),
                speakers: vec!["speaker1".to_string()],
                segment_seconds: 10.0,
                duration_tolerance_seconds: 2.0,
                record_margin_seconds: 5.0,
                min_recording_bytes: 1024,
                expected_sample_rate: 44_100,
            },
            modes: vec![
                ModeSpec::new("clean", 'c'),
                ModeSpec::new("noise", 'n'),
                ModeSpec::new("pitch", 'p'),
                ModeSpec::new("warp", 'w'),
            ],
            device: DeviceConfig {
                audio_device_name: "Songbird".to_string(),
                usb_query_command: vec![
                    "ioreg".to_string(),
                    "-p".to_string(),
                    "IOUSB".to_string(),
                    "-l".to_string(),
                ],
                vendor_signature: "Songbird".to_string(),
                serial_globs: vec![
                    "/dev/cu.usbmodem*".to_string(),
                    "/dev/ttyACM*".to_string(),
                ],
                scan_dir: PathBuf::from("/dev"),
                scan_prefixes: vec![
                    "cu.usbmodem".to_string(),
                    "ttyACM".to_string(),
                    "ttyUSB".to_string(),
                ],
                baud_rate: 115_200,
                write_timeout_ms: 2000,
                command_settle_ms: 500,
            },
            audio: AudioConfig {
                switch_command: "SwitchAudioSource".to_string(),
                play_command: vec!["play".to_string(), "-q".to_string(), "{input}".to_string()],
                record_command: vec![
                    "rec".to_string(),
                    "-q".to_string(),
                    "-c".to_string(),
                    "1".to_string(),
                    "-r".to_string(),
                    "44100".to_string(),
                    "-b".to_string(),
                    "16".to_string(),
                    "{output}".to_string(),
                    "trim".to_string(),
                    "0".to_string(),
                    "{seconds}".to_string(),
                ],
            },
            validation: ValidationConfig {
                max_retries: 3,
                retry_delay_seconds: 5,
                tone_seconds: 2.0,
                tone_frequency_hz: 440.0,
                min_probe_bytes: 8192,
                routing_test: true,
                continue_on_failure: false,
            },
            backup: BackupConfig {
                dir: PathBuf::from("backups"),
                retention: 5,
                checksums: true,
                target_name: "recordings".to_string(),
            },
            pipeline: PipelineConfig::default(),
            logging: LoggingConfig {
                dir: PathBuf::from(".songbird/logs"),
                budget_bytes: crate::logging::DEFAULT_DISK_BUDGET_BYTES,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialAppConfig {
    session: Option<PartialSessionConfig>,
    modes: Option<Vec<ModeSpec>>,
    device: Option<PartialDeviceConfig>,
    audio: Option<PartialAudioConfig>,
    validation: Option<PartialValidationConfig>,
    backup: Option<PartialBackupConfig>,
    pipeline: Option<PartialPipelineConfig>,
    logging: Option<PartialLoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialSessionConfig {
    working_dir: Option<PathBuf>,
    source_dir: Option<PathBuf>,
    results_dir: Option<PathBuf>,
    checkpoint_file: Option<PathBuf>,
    report_file: Option<String>,
    speakers: Option<Vec<String>>,
    segment_seconds: Option<f64>,
    duration_tolerance_seconds: Option<f64>,
    record_margin_seconds: Option<f64>,
    min_recording_bytes: Option<u64>,
    expected_sample_rate: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialDeviceConfig {
    audio_device_name: Option<String>,
    usb_query_command: Option<Vec<String>>,
    vendor_signature: Option<String>,
    serial_globs: Option<Vec<String>>,
    scan_dir: Option<PathBuf>,
    scan_prefixes: Option<Vec<String>>,
    baud_rate: Option<u32>,
    write_timeout_ms: Option<u64>,
    command_settle_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialAudioConfig {
    switch_command: Option<String>,
    play_command: Option<Vec<String>>,
    record_command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialValidationConfig {
    max_retries: Option<u32>,
    retry_delay_seconds: Option<u64>,
    tone_seconds: Option<f64>,
    tone_frequency_hz: Option<f64>,
    min_probe_bytes: Option<u64>,
    routing_test: Option<bool>,
    continue_on_failure: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialBackupConfig {
    dir: Option<PathBuf>,
    retention: Option<usize>,
    checksums: Option<bool>,
    target_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialPipelineConfig {
    enabled: Option<bool>,
    stages: Option<Vec<PipelineStageConfig>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    dir: Option<PathBuf>,
    budget_bytes: Option<u64>,
}

/// Loads defaults, merges the config file (explicit `--config` or `songbird.toml` in `process_cwd`),
/// validates, and resolves session paths.
pub fn load_config(
    overrides: &CliOverrides,
    process_cwd: &Path,
    fs: &dyn FileSystem,
) -> Result<(AppConfig, SessionPaths), SongbirdError> {
    let mut cfg = AppConfig::default();

    let config_path = match &overrides.config_path {
        Some(path) => Some(absolutize_path(process_cwd, path)),
        None => {
            let candidate = process_cwd.join(DEFAULT_CONFIG_FILE);
            fs.exists(&candidate).then_some(candidate)
        }
    };

    if let Some(path) = config_path {
        let file_contents = fs.read_to_string(&path)?;
        let partial = parse_partial(&file_contents)?;
        merge_partial_config(&mut cfg, partial);
    }

    validate_config(&cfg)?;
    let paths = resolve_paths(process_cwd, &cfg);
    validate_paths(&paths)?;
    Ok((cfg, paths))
}

pub fn parse_config_str(contents: &str) -> Result<AppConfig, SongbirdError> {
    let mut cfg = AppConfig::default();
    merge_partial_config(&mut cfg, parse_partial(contents)?);
    validate_config(&cfg)?;
    Ok(cfg)
}

fn parse_partial(contents: &str) -> Result<PartialAppConfig, SongbirdError> {
    toml::from_str(contents).map_err(|e| SongbirdError::ConfigParse(e.to_string()))
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(session) = partial.session {
        if let Some(value) = session.working_dir {
            cfg.session.working_dir = Some(value);
        }
        if let Some(value) = session.source_dir {
            cfg.session.source_dir = value;
        }
        if let Some(value) = session.results_dir {
            cfg.session.results_dir = value;
        }
        if let Some(value) = session.checkpoint_file {
            cfg.session.checkpoint_file = Some(value);
        }
        if let Some(value) = session.report_file {
            cfg.session.report_file = value;
        }
        if let Some(value) = session.speakers {
            cfg.session.speakers = value;
        }
        if let Some(value) = session.segment_seconds {
            cfg.session.segment_seconds = value;
        }
        if let Some(value) = session.duration_tolerance_seconds {
            cfg.session.duration_tolerance_seconds = value;
        }
        if let Some(value) = session.record_margin_seconds {
            cfg.session.record_margin_seconds = value;
        }
        if let Some(value) = session.min_recording_bytes {
            cfg.session.min_recording_bytes = value;
        }
        if let Some(value) = session.expected_sample_rate {
            cfg.session.expected_sample_rate = value;
        }
    }

    if let Some(modes) = partial.modes {
        cfg.modes = modes;
    }

    if let Some(device) = partial.device {
        if let Some(value) = device.audio_device_name {
            cfg.device.audio_device_name = value;
        }
        if let Some(value) = device.usb_query_command {
            cfg.device.usb_query_command = value;
        }
        if let Some(value) = device.vendor_signature {
            cfg.device.vendor_signature = value;
        }
        if let Some(value) = device.serial_globs {
            cfg.device.serial_globs = value;
        }
        if let Some(value) = device.scan_dir {
            cfg.device.scan_dir = value;
        }
        if let Some(value) = device.scan_prefixes {
            cfg.device.scan_prefixes = value;
        }
        if let Some(value) = device.baud_rate {
            cfg.device.baud_rate = value;
        }
        if let Some(value) = device.write_timeout_ms {
            cfg.device.write_timeout_ms = value;
        }
        if let Some(value) = device.command_settle_ms {
            cfg.device.command_settle_ms = value;
        }
    }

    if let Some(audio) = partial.audio {
        if let Some(value) = audio.switch_command {
            cfg.audio.switch_command = value;
        }
        if let Some(value) = audio.play_command {
            cfg.audio.play_command = value;
        }
        if let Some(value) = audio.record_command {
            cfg.audio.record_command = value;
        }
    }

    if let Some(validation) = partial.validation {
        if let Some(value) = validation.max_retries {
            cfg.validation.max_retries = value;
        }
        if let Some(value) = validation.retry_delay_seconds {
            cfg.validation.retry_delay_seconds = value;
        }
        if let Some(value) = validation.tone_seconds {
            cfg.validation.tone_seconds = value;
        }
        if let Some(value) = validation.tone_frequency_hz {
            cfg.validation.tone_frequency_hz = value;
        }
        if let Some(value) = validation.min_probe_bytes {
            cfg.validation.min_probe_bytes = value;
        }
        if let Some(value) = validation.routing_test {
            cfg.validation.routing_test = value;
        }
        if let Some(value) = validation.continue_on_failure {
            cfg.validation.continue_on_failure = value;
        }
    }

    if let Some(backup) = partial.backup {
        if let Some(value) = backup.dir {
            cfg.backup.dir = value;
        }
        if let Some(value) = backup.retention {
            cfg.backup.retention = value;
        }
        if let Some(value) = backup.checksums {
            cfg.backup.checksums = value;
        }
        if let Some(value) = backup.target_name {
            cfg.backup.target_name = value;
        }
    }

    if let Some(pipeline) = partial.pipeline {
        if let Some(value) = pipeline.enabled {
            cfg.pipeline.enabled = value;
        }
        if let Some(value) = pipeline.stages {
            cfg.pipeline.stages = value;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(value) = logging.dir {
            cfg.logging.dir = value;
        }
        if let Some(value) = logging.budget_bytes {
            cfg.logging.budget_bytes = value;
        }
    }
}

pub fn resolve_paths(process_cwd: &Path, cfg: &AppConfig) -> SessionPaths {
    let working_dir = cfg
        .session
        .working_dir
        .as_ref()
        .map(|dir| absolutize_path(process_cwd, dir))
        .unwrap_or_else(|| process_cwd.to_path_buf());
    let results_dir = absolutize_path(&working_dir, &cfg.session.results_dir);
    let checkpoint_path = cfg
        .session
        .checkpoint_file
        .as_ref()
        .map(|file| absolutize_path(&working_dir, file))
        .unwrap_or_else(|| results_dir.join(".songbird-checkpoint.json"));

    SessionPaths {
        source_dir: absolutize_path(&working_dir, &cfg.session.source_dir),
        report_path: results_dir.join(&cfg.session.report_file),
        checkpoint_path,
        backup_dir: absolutize_path(&working_dir, &cfg.backup.dir),
        log_dir: absolutize_path(&working_dir, &cfg.logging.dir),
        probe_dir: working_dir.join(".songbird/probe"),
        results_dir,
        working_dir,
    }
}

fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

/// A fresh session deletes the results directory after backing it up, so nothing that must
/// outlive it may live underneath.
fn validate_paths(paths: &SessionPaths) -> Result<(), SongbirdError> {
    let results = lexical_normalize(&paths.results_dir);
    for (key, dir) in [("backup.dir", &paths.backup_dir), ("logging.dir", &paths.log_dir)] {
        if lexical_normalize(dir).starts_with(&results) {
            return Err(SongbirdError::InvalidConfig(format!(
                "{key} ({}) must not be inside session.results_dir ({})",
                dir.display(),
                paths.results_dir.display()
            )));
        }
    }
    Ok(())
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

fn validate_config(cfg: &AppConfig) -> Result<(), SongbirdError> {
    if cfg.session.speakers.is_empty() {
        return Err(SongbirdError::InvalidConfig(
            "session.speakers must list at least one speaker".to_string(),
        ));
    }
    if cfg.session.speakers.iter().any(|s| s.trim().is_empty()) {
        return Err(SongbirdError::InvalidConfig(
            "session.speakers entries must be non-empty".to_string(),
        ));
    }
    if cfg.session.segment_seconds <= 0.0 {
        return Err(SongbirdError::InvalidConfig(
            "session.segment_seconds must be greater than zero".to_string(),
        ));
    }
    if cfg.session.duration_tolerance_seconds < 0.0 || cfg.session.record_margin_seconds < 0.0 {
        return Err(SongbirdError::InvalidConfig(
            "session tolerances must not be negative".to_string(),
        ));
    }
    if cfg.modes.is_empty() {
        return Err(SongbirdError::InvalidConfig(
            "at least one [[modes]] entry is required".to_string(),
        ));
    }

    let mut names = BTreeSet::new();
    let mut commands = BTreeSet::new();
    for mode in &cfg.modes {
        if mode.name.trim().is_empty() {
            return Err(SongbirdError::InvalidConfig(
                "mode names must be non-empty".to_string(),
            ));
        }
        if !mode.command.is_ascii() || mode.command.is_ascii_control() {
            return Err(SongbirdError::InvalidConfig(format!(
                "mode {} command must be a printable ASCII character",
                mode.name
            )));
        }
        if !names.insert(mode.name.as_str()) {
            return Err(SongbirdError::InvalidConfig(format!(
                "duplicate mode name {}",
                mode.name
            )));
        }
        if !commands.insert(mode.command) {
            return Err(SongbirdError::InvalidConfig(format!(
                "duplicate mode command {:?}",
                mode.command
            )));
        }
    }

    if cfg.validation.max_retries == 0 {
        return Err(SongbirdError::InvalidConfig(
            "validation.max_retries must be greater than zero".to_string(),
        ));
    }
    if cfg.validation.tone_seconds <= 0.0 {
        return Err(SongbirdError::InvalidConfig(
            "validation.tone_seconds must be greater than zero".to_string(),
        ));
    }
    if cfg.backup.retention == 0 {
        return Err(SongbirdError::InvalidConfig(
            "backup.retention must be greater than zero".to_string(),
        ));
    }
    if cfg.audio.play_command.is_empty() || cfg.audio.record_command.is_empty() {
        return Err(SongbirdError::InvalidConfig(
            "audio.play_command and audio.record_command must not be empty".to_string(),
        ));
    }
    for stage in &cfg.pipeline.stages {
        if stage.program.trim().is_empty() {
            return Err(SongbirdError::InvalidConfig(format!(
                "pipeline stage {} has no program",
                stage.name
            )));
        }
    }

    Ok(())
}
