use crate::cancel::CancelToken;
use crate::config::AudioConfig;
use crate::errors::SongbirdError;
use crate::logging::append_run_log;
use crate::runtime::{wait_with_deadline, Clock, ProcessRequest, ProcessRunner, WaitOutcome};
use serde_json::json;
use std::f64::consts::PI;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Completed,
    PlaybackFailed(String),
    RecorderFailed(String),
    TimedOut,
    Cancelled,
}

/// Expands `{input}`, `{output}` and `{seconds}` inside each template argument.
pub fn render_template(
    template: &[String],
    input: &Path,
    output: &Path,
    seconds: f64,
) -> Result<ProcessRequest, SongbirdError> {
    let input = input.display().to_string();
    let output = output.display().to_string();
    let seconds = seconds.to_string();
    let mut rendered = template.iter().map(|arg| {
        arg.replace("{input}", &input)
            .replace("{output}", &output)
            .replace("{seconds}", &seconds)
    });
    let program = rendered
        .next()
        .ok_or_else(|| SongbirdError::InvalidConfig("empty command template".to_string()))?;
    Ok(ProcessRequest::new(program, rendered))
}

/// Starts the recorder, then playback, and waits for both within `seconds + margin`.
/// Children still running at the deadline or on cancellation are killed.
#[allow(clippy::too_many_arguments)]
pub fn play_and_record(
    runner: &dyn ProcessRunner,
    clock: &dyn Clock,
    cancel: &CancelToken,
    audio: &AudioConfig,
    input: &Path,
    output: &Path,
    seconds: f64,
    margin_seconds: f64,
) -> Result<CaptureOutcome, SongbirdError> {
    cancel.check()?;
    let record = render_template(&audio.record_command, input, output, seconds)?;
    let play = render_template(&audio.play_command, input, output, seconds)?;
    let deadline = clock.now() + Duration::from_secs_f64(seconds + margin_seconds);

    append_run_log(
        "debug",
        "capture.started",
        json!({
            "record": record.display(),
            "play": play.display(),
            "seconds": seconds,
        }),
    );

    let recorder = runner.spawn(record)?;
    let player = match runner.spawn(play) {
        Ok(handle) => handle,
        Err(err) => {
            let _ = runner.kill(recorder);
            let _ = runner.wait(recorder);
            return Ok(CaptureOutcome::PlaybackFailed(err.to_string()));
        }
    };

    let play_outcome = wait_with_deadline(runner, clock, player, deadline, cancel)?;
    if !matches!(play_outcome, WaitOutcome::Exited(_)) {
        let _ = runner.kill(recorder);
        let _ = runner.wait(recorder);
    }
    let record_outcome = match play_outcome {
        WaitOutcome::Exited(_) => wait_with_deadline(runner, clock, recorder, deadline, cancel)?,
        WaitOutcome::TimedOut => WaitOutcome::TimedOut,
        WaitOutcome::Cancelled => WaitOutcome::Cancelled,
    };

    let outcome = match (play_outcome, record_outcome) {
        (_, WaitOutcome::Cancelled) | (WaitOutcome::Cancelled, _) => CaptureOutcome::Cancelled,
        (_, WaitOutcome::TimedOut) | (WaitOutcome::TimedOut, _) => CaptureOutcome::TimedOut,
        (WaitOutcome::Exited(play), WaitOutcome::Exited(_)) if !play.success() => {
            CaptureOutcome::PlaybackFailed(format!(
                "exit {}: {}",
                play.exit_code,
                play.stderr.trim()
            ))
        }
        (WaitOutcome::Exited(_), WaitOutcome::Exited(rec)) if !rec.success() => {
            CaptureOutcome::RecorderFailed(format!("exit {}: {}", rec.exit_code, rec.stderr.trim()))
        }
        (WaitOutcome::Exited(_), WaitOutcome::Exited(_)) => CaptureOutcome::Completed,
    };

    append_run_log(
        "debug",
        "capture.finished",
        json!({ "outcome": format!("{outcome:?}"), "output": output.display().to_string() }),
    );
    Ok(outcome)
}

/// Writes a mono 16-bit sine tone used to probe routing and mode response.
pub fn write_tone(
    path: &Path,
    seconds: f64,
    frequency_hz: f64,
    sample_rate: u32,
) -> Result<(), SongbirdError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SongbirdError::Io(e.to_string()))?;
    }
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer =
        hound::WavWriter::create(path, spec).map_err(|e| SongbirdError::Io(e.to_string()))?;
    let total = (seconds * f64::from(sample_rate)).round() as u64;
    let amplitude = f64::from(i16::MAX) * 0.5;
    for n in 0..total {
        let t = n as f64 / f64::from(sample_rate);
        let sample = (amplitude * (2.0 * PI * frequency_hz * t).sin()) as i16;
        writer
            .write_sample(sample)
            .map_err(|e| SongbirdError::Io(e.to_string()))?;
    }
    writer
        .finalize()
        .map_err(|e| SongbirdError::Io(e.to_string()))
}
