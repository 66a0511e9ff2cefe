use crate::audio_routing::{AudioRoutingGuard, AudioSwitcher};
use crate::cancel::CancelToken;
use crate::capture::{play_and_record, write_tone, CaptureOutcome};
use crate::config::AppConfig;
use crate::device::DeviceLocator;
use crate::errors::SongbirdError;
use crate::logging::append_run_log;
use crate::runtime::{Clock, FileSystem, ProcessRunner, Terminal};
use crate::serial::ControlChannel;
use crate::types::{AudioDirection, ModeSpec};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const TONE_SAMPLE_RATE: u32 = 44_100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStage {
    Discover,
    SerialProbe,
    SerialConfigure,
    AudioPresence,
    Routing,
    ModeSweep,
}

impl ValidationStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discover => "discover",
            Self::SerialProbe => "serial_probe",
            Self::SerialConfigure => "serial_configure",
            Self::AudioPresence => "audio_presence",
            Self::Routing => "routing",
            Self::ModeSweep => "mode_sweep",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModeProbeResult {
    pub passed: bool,
    pub recorded_bytes: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct HardwareValidationResult {
    pub device_path: Option<PathBuf>,
    pub serial_ok: bool,
    pub audio_device_ok: bool,
    /// `None` when the routing test is disabled.
    pub routing_ok: Option<bool>,
    pub mode_results: BTreeMap<String, ModeProbeResult>,
    pub overall_pass: bool,
    pub attempts: u32,
    pub failed_stage: Option<ValidationStage>,
    pub failure: Option<String>,
}

impl HardwareValidationResult {
    fn fail(&mut self, stage: ValidationStage, detail: impl Into<String>) {
        self.failed_stage = Some(stage);
        self.failure = Some(detail.into());
        self.overall_pass = false;
    }
}

/// Gates a session on the effects device being reachable, routed and responsive.
pub struct HardwareValidator<'a> {
    pub cfg: &'a AppConfig,
    pub locator: DeviceLocator,
    pub channel: &'a dyn ControlChannel,
    pub switcher: AudioSwitcher,
    pub runner: &'a dyn ProcessRunner,
    pub clock: &'a dyn Clock,
    pub file_system: &'a dyn FileSystem,
    pub terminal: &'a dyn Terminal,
    pub cancel: &'a CancelToken,
    pub probe_dir: PathBuf,
}

impl<'a> HardwareValidator<'a> {
    /// Runs the stage machine up to `max_retries` times, sleeping `retry_delay` between attempts.
    pub fn validate(
        &self,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Result<HardwareValidationResult, SongbirdError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.cancel.check()?;
            append_run_log(
                "info",
                "hardware.attempt.started",
                json!({ "attempt": attempt, "max_retries": max_retries }),
            );

            let mut result = self.run_attempt()?;
            result.attempts = attempt;

            if result.overall_pass {
                append_run_log(
                    "info",
                    "hardware.validation.passed",
                    json!({
                        "attempt": attempt,
                        "device_path": result.device_path.as_ref().map(|p| p.display().to_string()),
                    }),
                );
                return Ok(result);
            }

            append_run_log(
                "warn",
                "hardware.attempt.failed",
                json!({
                    "attempt": attempt,
                    "stage": result.failed_stage.map(ValidationStage::as_str),
                    "detail": result.failure,
                    "mode_results": result.mode_results,
                }),
            );

            if attempt >= max_retries {
                self.print_checklist(&result)?;
                return Ok(result);
            }
            self.clock.sleep_for(retry_delay)?;
        }
    }

    fn run_attempt(&self) -> Result<HardwareValidationResult, SongbirdError> {
        let mut result = HardwareValidationResult::default();

        let Some(discovery) = self.locator.locate(self.runner, self.file_system) else {
            result.fail(ValidationStage::Discover, "no effects device found");
            return Ok(result);
        };
        let path = discovery.path;
        result.device_path = Some(path.clone());

        let timeout = Duration::from_millis(self.cfg.device.write_timeout_ms);
        if let Err(err) = self.channel.probe(&path, timeout) {
            result.fail(ValidationStage::SerialProbe, err.to_string());
            return Ok(result);
        }
        if let Err(err) = self.channel.configure(&path, self.cfg.device.baud_rate) {
            result.fail(ValidationStage::SerialConfigure, err.to_string());
            return Ok(result);
        }
        result.serial_ok = true;

        if let Err(err) = self.check_audio_presence() {
            result.fail(ValidationStage::AudioPresence, err.to_string());
            return Ok(result);
        }
        result.audio_device_ok = true;

        let tone = self.probe_dir.join("tone.wav");
        if let Err(err) = write_tone(
            &tone,
            self.cfg.validation.tone_seconds,
            self.cfg.validation.tone_frequency_hz,
            TONE_SAMPLE_RATE,
        ) {
            result.fail(ValidationStage::Routing, format!("probe tone: {err}"));
            return Ok(result);
        }
        let mut guard =
            match AudioRoutingGuard::divert(self.switcher.clone(), &self.cfg.device.audio_device_name)
            {
                Ok(guard) => guard,
                Err(err) => {
                    result.fail(ValidationStage::Routing, err.to_string());
                    return Ok(result);
                }
            };

        if self.cfg.validation.routing_test {
            let probe = self.probe(&tone, &self.probe_dir.join("routing.wav"))?;
            result.routing_ok = Some(probe.passed);
            if !probe.passed {
                let detail = probe
                    .error
                    .unwrap_or_else(|| format!("routing probe recorded {} bytes", probe.recorded_bytes));
                result.fail(ValidationStage::Routing, detail);
                let _ = guard.restore();
                return Ok(result);
            }
        }

        for mode in &self.cfg.modes {
            let probe = self.probe_mode(&path, mode, &tone)?;
            result.mode_results.insert(mode.name.clone(), probe);
        }
        let _ = guard.restore();

        let failed_modes = result
            .mode_results
            .iter()
            .filter(|(_, probe)| !probe.passed)
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();
        if failed_modes.is_empty() {
            result.overall_pass = true;
        } else {
            result.fail(
                ValidationStage::ModeSweep,
                format!("modes without response: {}", failed_modes.join(", ")),
            );
        }
        Ok(result)
    }

    fn probe_mode(
        &self,
        path: &Path,
        mode: &ModeSpec,
        tone: &Path,
    ) -> Result<ModeProbeResult, SongbirdError> {
        if let Err(err) = self.channel.send_command(path, mode.command_byte()) {
            return Ok(ModeProbeResult {
                passed: false,
                recorded_bytes: 0,
                error: Some(err.to_string()),
            });
        }
        self.clock
            .sleep_for(Duration::from_millis(self.cfg.device.command_settle_ms))?;
        self.cancel.check()?;
        let probe = self.probe(tone, &self.probe_dir.join(format!("mode_{}.wav", mode.name)))?;
        append_run_log(
            "info",
            "hardware.mode.probed",
            json!({
                "mode": mode.name,
                "passed": probe.passed,
                "recorded_bytes": probe.recorded_bytes,
            }),
        );
        Ok(probe)
    }

    /// Plays the tone while recording; responsive when the recording reaches the byte threshold.
    fn probe(&self, tone: &Path, output: &Path) -> Result<ModeProbeResult, SongbirdError> {
        let _ = std::fs::remove_file(output);
        let outcome = match play_and_record(
            self.runner,
            self.clock,
            self.cancel,
            &self.cfg.audio,
            tone,
            output,
            self.cfg.validation.tone_seconds,
            self.cfg.session.record_margin_seconds,
        ) {
            Ok(outcome) => outcome,
            Err(err @ SongbirdError::Cancelled(_)) => return Err(err),
            Err(err) => {
                return Ok(ModeProbeResult {
                    passed: false,
                    recorded_bytes: 0,
                    error: Some(err.to_string()),
                })
            }
        };
        if outcome == CaptureOutcome::Cancelled {
            return Err(SongbirdError::Cancelled(
                self.cancel
                    .reason()
                    .unwrap_or_else(|| "interrupted".to_string()),
            ));
        }
        let recorded_bytes = std::fs::metadata(output).map(|m| m.len()).unwrap_or(0);
        let error = match &outcome {
            CaptureOutcome::Completed => None,
            other => Some(format!("{other:?}")),
        };
        Ok(ModeProbeResult {
            passed: error.is_none() && recorded_bytes >= self.cfg.validation.min_probe_bytes,
            recorded_bytes,
            error,
        })
    }

    fn check_audio_presence(&self) -> Result<(), SongbirdError> {
        let name = &self.cfg.device.audio_device_name;
        for direction in [AudioDirection::Input, AudioDirection::Output] {
            if self.switcher.find_device(direction, name)?.is_none() {
                return Err(SongbirdError::Hardware(format!(
                    "no {} audio device matching {name}",
                    direction.as_str()
                )));
            }
        }
        Ok(())
    }

    /// Cheap mid-session check: the control path still exists and the audio device is listed.
    pub fn quick_check(&self, device_path: &Path) -> Result<(), SongbirdError> {
        if !self.file_system.exists(device_path) {
            return Err(SongbirdError::Hardware(format!(
                "device path {} disappeared",
                device_path.display()
            )));
        }
        self.check_audio_presence()
    }

    /// Rediscovers the device and reconfigures the serial link. Returns the new control path.
    pub fn recover(&self) -> Result<PathBuf, SongbirdError> {
        let discovery = self
            .locator
            .locate(self.runner, self.file_system)
            .ok_or_else(|| SongbirdError::Hardware("device not found during recovery".to_string()))?;
        self.channel
            .configure(&discovery.path, self.cfg.device.baud_rate)?;
        self.check_audio_presence()?;
        append_run_log(
            "info",
            "hardware.recovered",
            json!({ "device_path": discovery.path.display().to_string() }),
        );
        Ok(discovery.path)
    }

    fn print_checklist(&self, result: &HardwareValidationResult) -> Result<(), SongbirdError> {
        let stage = result
            .failed_stage
            .map(ValidationStage::as_str)
            .unwrap_or("unknown");
        let lines = [
            format!(
                "Hardware validation failed after {} attempt(s) at stage {stage}: {}",
                result.attempts,
                result.failure.as_deref().unwrap_or("no detail")
            ),
            "Check before retrying:".to_string(),
            "  [ ] USB cable connected and the effects device powered".to_string(),
            "  [ ] Firmware running in command mode, not the bootloader".to_string(),
            "  [ ] Line out to device input, device output to line in".to_string(),
            format!(
                "  [ ] The OS lists an audio device matching \"{}\"",
                self.cfg.device.audio_device_name
            ),
        ];
        for line in lines {
            self.terminal.write_line(&line)?;
        }
        Ok(())
    }
}
