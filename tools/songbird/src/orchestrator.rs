use crate::audio_routing::{AudioRoutingGuard, AudioSwitcher};
use crate::backup::BackupManager;
use crate::cancel::CancelToken;
use crate::capture::{play_and_record, CaptureOutcome};
use crate::checkpoint::CheckpointStore;
use crate::config::AppConfig;
use crate::device::DeviceLocator;
use crate::errors::{SongbirdError, EXIT_FAILURE, EXIT_SUCCESS};
use crate::hardware::{HardwareValidationResult, HardwareValidator, ValidationStage};
use crate::logging::append_run_log;
use crate::pipeline::run_pipeline;
use crate::recording_validation::RecordingValidator;
use crate::runtime::{format_rfc3339, Runtime};
use crate::session_report::{build_report, console_summary, write_report, SessionFacts, SessionReport};
use crate::task_identity::compute_task_id;
use crate::types::{ModeSpec, RecordingMeasurement, SessionPaths, SessionState};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const INTERRUPTED_TASK_DETAIL: &str = "interrupted";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionOptions {
    pub resume: bool,
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub report: SessionReport,
    pub exit_code: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub file_name: String,
    pub stem: String,
}

#[derive(Debug, Default)]
struct LoopStats {
    skipped: usize,
    demoted: usize,
}

/// `{results_dir}/{speaker}/{source_stem}_{mode}.wav`
pub fn output_path_for(results_dir: &Path, speaker: &str, source: &SourceFile, mode: &str) -> PathBuf {
    results_dir
        .join(speaker)
        .join(format!("{}_{mode}.wav", source.stem))
}

/// Sorted `*.wav` files directly inside `dir`.
pub fn enumerate_sources(dir: &Path) -> Result<Vec<SourceFile>, SongbirdError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| SongbirdError::Recording(format!("source directory {}: {e}", dir.display())))?;
    let mut sources = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"))
        })
        .filter_map(|path| {
            let file_name = path.file_name()?.to_str()?.to_string();
            let stem = path.file_stem()?.to_str()?.to_string();
            Some(SourceFile {
                path,
                file_name,
                stem,
            })
        })
        .collect::<Vec<_>>();
    sources.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    if sources.is_empty() {
        return Err(SongbirdError::Recording(format!(
            "no .wav source files in {}",
            dir.display()
        )));
    }
    Ok(sources)
}

/// Drives one recording session from hardware gate to report.
pub struct RecordingOrchestrator<'a> {
    pub cfg: &'a AppConfig,
    pub paths: &'a SessionPaths,
    pub runtime: &'a Runtime,
    pub cancel: &'a CancelToken,
}

impl<'a> RecordingOrchestrator<'a> {
    fn switcher(&self) -> AudioSwitcher {
        AudioSwitcher::new(
            self.cfg.audio.switch_command.clone(),
            self.runtime.process_runner.clone(),
            self.runtime.clock.clone(),
        )
    }

    fn validator(&self) -> HardwareValidator<'_> {
        HardwareValidator {
            cfg: self.cfg,
            locator: DeviceLocator::from_config(&self.cfg.device),
            channel: self.runtime.control_channel.as_ref(),
            switcher: self.switcher(),
            runner: self.runtime.process_runner.as_ref(),
            clock: self.runtime.clock.as_ref(),
            file_system: self.runtime.file_system.as_ref(),
            terminal: self.runtime.terminal.as_ref(),
            cancel: self.cancel,
            probe_dir: self.paths.probe_dir.clone(),
        }
    }

    fn say(&self, line: &str) -> Result<(), SongbirdError> {
        self.runtime.terminal.write_line(line)
    }

    pub fn run(&self, options: SessionOptions) -> Result<SessionOutcome, SongbirdError> {
        let started = self.runtime.clock.now();
        append_run_log(
            "info",
            "session.started",
            json!({
                "resume": options.resume,
                "force": options.force,
                "results_dir": self.paths.results_dir.display().to_string(),
                "speakers": self.cfg.session.speakers,
                "modes": self.cfg.modes.iter().map(|m| m.name.clone()).collect::<Vec<_>>(),
            }),
        );

        let validator = self.validator();
        let hardware = validator.validate(
            self.cfg.validation.max_retries,
            Duration::from_secs(self.cfg.validation.retry_delay_seconds),
        )?;
        let device_path = self.gate_on_hardware(&hardware)?;

        self.setup_results_dir(options)?;

        let mut store = CheckpointStore::open(
            &self.paths.checkpoint_path,
            self.runtime.file_system.clone(),
            self.runtime.clock.clone(),
        )?;
        store.begin_session()?;

        let mut stats = LoopStats::default();
        let result = self.execute(&mut store, &validator, device_path, &mut stats);

        let (state, reason) = match &result {
            Ok(()) => (SessionState::Completed, None),
            Err(SongbirdError::Cancelled(reason)) => {
                (SessionState::TerminatedEarly, Some(format!("cancelled by {reason}")))
            }
            Err(err) => (SessionState::TerminatedEarly, Some(err.to_string())),
        };
        if let Err(err) = store.set_session_state(state) {
            append_run_log(
                "error",
                "session.state.persist_failed",
                json!({ "error": err.to_string() }),
            );
        }

        let finished = self.runtime.clock.now();
        let report = build_report(
            &store.tasks(),
            SessionFacts {
                started_at: format_rfc3339(started),
                finished_at: format_rfc3339(finished),
                duration: finished.duration_since(started).unwrap_or_default(),
                state,
                termination_reason: reason,
                hardware_attempts: hardware.attempts,
                skipped: stats.skipped,
                demoted: stats.demoted,
            },
        );
        write_report(&report, &self.paths.report_path)?;
        for line in console_summary(&report) {
            self.say(&line)?;
        }
        append_run_log(
            "info",
            "session.finished",
            json!({
                "state": state.as_str(),
                "completed": report.counts.completed,
                "failed": report.counts.failed,
                "skipped": stats.skipped,
                "demoted": stats.demoted,
            }),
        );

        result?;

        let all_done = report.counts.failed == 0 && report.counts.completed == report.counts.total();
        if self.cfg.pipeline.enabled && all_done {
            run_pipeline(
                &self.cfg.pipeline.stages,
                self.paths,
                self.runtime.process_runner.as_ref(),
                self.runtime.clock.as_ref(),
                self.cancel,
            )?;
        }

        let exit_code = if report.counts.failed > 0 {
            EXIT_FAILURE
        } else {
            EXIT_SUCCESS
        };
        Ok(SessionOutcome { report, exit_code })
    }

    fn gate_on_hardware(&self, hardware: &HardwareValidationResult) -> Result<PathBuf, SongbirdError> {
        if hardware.overall_pass {
            if let Some(path) = &hardware.device_path {
                return Ok(path.clone());
            }
        }
        let stage = hardware
            .failed_stage
            .map(ValidationStage::as_str)
            .unwrap_or("unknown");
        let detail = format!(
            "hardware validation failed at stage {stage} after {} attempt(s): {}",
            hardware.attempts,
            hardware.failure.as_deref().unwrap_or("no detail")
        );
        match (&hardware.device_path, self.cfg.validation.continue_on_failure) {
            (Some(path), true) => {
                append_run_log(
                    "warn",
                    "hardware.validation.overridden",
                    json!({ "detail": detail }),
                );
                self.say(&format!("Warning: {detail}; continuing as configured"))?;
                Ok(path.clone())
            }
            _ => Err(SongbirdError::Hardware(detail)),
        }
    }

    /// Fresh runs protect existing results with a backup before clearing them.
    fn setup_results_dir(&self, options: SessionOptions) -> Result<(), SongbirdError> {
        let results = &self.paths.results_dir;
        if options.resume {
            std::fs::create_dir_all(results).map_err(|e| SongbirdError::Io(e.to_string()))?;
            return Ok(());
        }

        let has_content = results.is_dir()
            && std::fs::read_dir(results)
                .map_err(|e| SongbirdError::Io(e.to_string()))?
                .next()
                .is_some();
        if has_content {
            if !options.force {
                if !self.runtime.terminal.stdin_is_tty() {
                    return Err(SongbirdError::Cli(format!(
                        "{} already has recordings; rerun with --resume to continue or --force to back up and start over",
                        results.display()
                    )));
                }
                let prompt = format!(
                    "{} already has recordings. Back them up and start a fresh session?",
                    results.display()
                );
                if !self.runtime.terminal.confirm(&prompt)? {
                    return Err(SongbirdError::Cli("fresh session declined".to_string()));
                }
            }

            let backups = BackupManager::new(
                &self.paths.backup_dir,
                self.cfg.backup.retention,
                self.cfg.backup.checksums,
                self.runtime.clock.clone(),
            );
            let record = backups.create_backup(results, &self.cfg.backup.target_name)?;
            if let Some(record) = &record {
                self.say(&format!(
                    "Backed up {} files to {}",
                    record.file_count,
                    record.path.display()
                ))?;
            }
            std::fs::remove_dir_all(results).map_err(|e| SongbirdError::Io(e.to_string()))?;
            append_run_log(
                "info",
                "session.results_cleared",
                json!({ "results_dir": results.display().to_string() }),
            );
        }

        if self.runtime.file_system.exists(&self.paths.checkpoint_path) {
            self.runtime
                .file_system
                .remove_file(&self.paths.checkpoint_path)?;
        }
        std::fs::create_dir_all(results).map_err(|e| SongbirdError::Io(e.to_string()))
    }

    fn execute(
        &self,
        store: &mut CheckpointStore,
        validator: &HardwareValidator<'_>,
        mut device_path: PathBuf,
        stats: &mut LoopStats,
    ) -> Result<(), SongbirdError> {
        let sources = enumerate_sources(&self.paths.source_dir)?;
        for speaker in &self.cfg.session.speakers {
            std::fs::create_dir_all(self.paths.results_dir.join(speaker))
                .map_err(|e| SongbirdError::Io(e.to_string()))?;
            for source in &sources {
                for mode in &self.cfg.modes {
                    let output =
                        output_path_for(&self.paths.results_dir, speaker, source, &mode.name);
                    store.register_task(speaker, &mode.name, &source.file_name, &output)?;
                }
            }
        }

        let recordings = RecordingValidator::from_session(&self.cfg.session);
        let total = self.cfg.session.speakers.len() * sources.len() * self.cfg.modes.len();
        let mut guard = AudioRoutingGuard::divert(self.switcher(), &self.cfg.device.audio_device_name)?;
        let mut index = 0;

        for speaker in &self.cfg.session.speakers {
            for source in &sources {
                for mode in &self.cfg.modes {
                    index += 1;
                    self.cancel.check()?;
                    let task_id = compute_task_id(speaker, &mode.name, &source.file_name);
                    let output =
                        output_path_for(&self.paths.results_dir, speaker, source, &mode.name);

                    if store.is_completed(speaker, &mode.name, &source.file_name) {
                        let check = recordings.validate(&output);
                        if check.is_valid() {
                            stats.skipped += 1;
                            continue;
                        }
                        let detail = format!("re-validation failed: {}", check.error_summary());
                        append_run_log(
                            "warn",
                            "task.demoted",
                            json!({ "task_id": task_id, "detail": detail }),
                        );
                        store.mark_failed(&task_id, &detail)?;
                        stats.demoted += 1;
                    }

                    self.say(&format!(
                        "[{index}/{total}] {speaker} {} {}",
                        source.file_name, mode.name
                    ))?;
                    store.mark_running(&task_id)?;
                    append_run_log(
                        "info",
                        "task.started",
                        json!({
                            "task_id": task_id,
                            "speaker": speaker,
                            "mode": mode.name,
                            "source": source.file_name,
                        }),
                    );

                    match self.record_task(&device_path, mode, &source.path, &output, &recordings) {
                        Ok(measurement) => {
                            store.mark_completed(&task_id, Some(measurement))?;
                            append_run_log("info", "task.completed", json!({ "task_id": task_id }));
                        }
                        Err(SongbirdError::Cancelled(reason)) => {
                            store.mark_failed(&task_id, INTERRUPTED_TASK_DETAIL)?;
                            append_run_log(
                                "warn",
                                "task.interrupted",
                                json!({ "task_id": task_id, "reason": reason }),
                            );
                            let _ = guard.restore();
                            return Err(SongbirdError::Cancelled(reason));
                        }
                        Err(err) => {
                            store.mark_failed(&task_id, &err.to_string())?;
                            append_run_log(
                                "error",
                                "task.failed",
                                json!({ "task_id": task_id, "error": err.to_string() }),
                            );
                            self.say(&format!("  failed: {err}"))?;
                            device_path = self.check_hardware(validator, device_path)?;
                        }
                    }
                }
            }
        }

        guard.restore()
    }

    /// After a task failure: keep the device if it still answers, otherwise rediscover it.
    fn check_hardware(
        &self,
        validator: &HardwareValidator<'_>,
        device_path: PathBuf,
    ) -> Result<PathBuf, SongbirdError> {
        let Err(check_err) = validator.quick_check(&device_path) else {
            return Ok(device_path);
        };
        append_run_log(
            "warn",
            "hardware.quick_check.failed",
            json!({ "error": check_err.to_string() }),
        );
        match validator.recover() {
            Ok(path) => {
                self.say(&format!("Recovered device at {}", path.display()))?;
                Ok(path)
            }
            Err(err) => Err(SongbirdError::Hardware(format!(
                "device lost mid-session ({check_err}) and recovery failed: {err}"
            ))),
        }
    }

    fn record_task(
        &self,
        device_path: &Path,
        mode: &ModeSpec,
        source: &Path,
        output: &Path,
        recordings: &RecordingValidator,
    ) -> Result<RecordingMeasurement, SongbirdError> {
        if output.exists() {
            std::fs::remove_file(output).map_err(|e| SongbirdError::Io(e.to_string()))?;
        }
        self.runtime
            .control_channel
            .send_command(device_path, mode.command_byte())?;
        self.runtime
            .clock
            .sleep_for(Duration::from_millis(self.cfg.device.command_settle_ms))?;
        self.cancel.check()?;

        let outcome = play_and_record(
            self.runtime.process_runner.as_ref(),
            self.runtime.clock.as_ref(),
            self.cancel,
            &self.cfg.audio,
            source,
            output,
            self.cfg.session.segment_seconds,
            self.cfg.session.record_margin_seconds,
        )?;
        // Children killed by the signal handler exit before the token is observed.
        self.cancel.check()?;

        match outcome {
            CaptureOutcome::Completed => {}
            CaptureOutcome::Cancelled => {
                return Err(SongbirdError::Cancelled(
                    self.cancel
                        .reason()
                        .unwrap_or_else(|| "interrupted".to_string()),
                ))
            }
            CaptureOutcome::TimedOut => {
                return Err(SongbirdError::Recording(format!(
                    "recording did not finish within {}s",
                    self.cfg.session.segment_seconds + self.cfg.session.record_margin_seconds
                )))
            }
            CaptureOutcome::PlaybackFailed(detail) => {
                return Err(SongbirdError::Recording(format!("playback failed: {detail}")))
            }
            CaptureOutcome::RecorderFailed(detail) => {
                return Err(SongbirdError::Recording(format!("recorder failed: {detail}")))
            }
        }

        let check = recordings.validate(output);
        for warning in &check.warnings {
            append_run_log(
                "warn",
                "recording.validation.warning",
                json!({ "output": output.display().to_string(), "warning": warning }),
            );
        }
        if !check.is_valid() {
            return Err(SongbirdError::Recording(check.error_summary()));
        }
        check
            .measurement
            .ok_or_else(|| SongbirdError::Recording("recording produced no measurement".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_paths_follow_speaker_stem_mode_layout() {
        let source = SourceFile {
            path: PathBuf::from("/src/clip01.wav"),
            file_name: "clip01.wav".to_string(),
            stem: "clip01".to_string(),
        };
        assert_eq!(
            output_path_for(Path::new("/results"), "21525", &source, "noise"),
            PathBuf::from("/results/21525/clip01_noise.wav")
        );
    }

    #[test]
    fn sources_are_sorted_wav_files_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["b.wav", "a.WAV", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").expect("write");
        }
        std::fs::create_dir(dir.path().join("nested.wav")).expect("mkdir");
        let names = enumerate_sources(dir.path())
            .expect("sources")
            .into_iter()
            .map(|source| source.file_name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a.WAV", "b.wav"]);
    }

    #[test]
    fn empty_source_dir_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            enumerate_sources(dir.path()),
            Err(SongbirdError::Recording(_))
        ));
    }
}
