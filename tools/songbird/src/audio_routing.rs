use crate::cancel::CancelToken;
use crate::errors::SongbirdError;
use crate::logging::append_run_log;
use crate::runtime::{wait_with_deadline, Clock, ProcessRequest, ProcessRunner, WaitOutcome};
use crate::types::AudioDirection;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const SWITCHER_TIMEOUT: Duration = Duration::from_secs(10);

/// Thin client over the OS audio switching utility.
#[derive(Clone)]
pub struct AudioSwitcher {
    program: String,
    runner: Arc<dyn ProcessRunner>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl AudioSwitcher {
    pub fn new(
        program: impl Into<String>,
        runner: Arc<dyn ProcessRunner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            program: program.into(),
            runner,
            clock,
            timeout: SWITCHER_TIMEOUT,
        }
    }

    fn run(&self, args: Vec<String>) -> Result<String, SongbirdError> {
        let request = ProcessRequest::new(self.program.clone(), args);
        append_run_log(
            "debug",
            "audio.switcher.started",
            json!({ "command": request.display() }),
        );
        let handle = self.runner.spawn(request)?;
        let deadline = self.clock.now() + self.timeout;
        // Restores run after an interrupt too, so the session token is not consulted here.
        let outcome = wait_with_deadline(
            self.runner.as_ref(),
            self.clock.as_ref(),
            handle,
            deadline,
            &CancelToken::new(),
        )?;
        let WaitOutcome::Exited(output) = outcome else {
            append_run_log(
                "warn",
                "audio.switcher.timed_out",
                json!({ "timeout_seconds": self.timeout.as_secs() }),
            );
            return Err(SongbirdError::Process(format!(
                "{} did not finish within {}s",
                self.program,
                self.timeout.as_secs()
            )));
        };
        if !output.success() {
            append_run_log(
                "warn",
                "audio.switcher.failed",
                json!({ "exit_code": output.exit_code, "stderr": output.stderr }),
            );
            return Err(SongbirdError::Process(format!(
                "{} exited {}: {}",
                self.program,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    pub fn list_devices(&self, direction: AudioDirection) -> Result<Vec<String>, SongbirdError> {
        let stdout = self.run(vec![
            "-a".to_string(),
            "-t".to_string(),
            direction.as_str().to_string(),
        ])?;
        Ok(stdout
            .lines()
            .map(|line| strip_direction_suffix(line.trim()).to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    pub fn current(&self, direction: AudioDirection) -> Result<String, SongbirdError> {
        let stdout = self.run(vec![
            "-c".to_string(),
            "-t".to_string(),
            direction.as_str().to_string(),
        ])?;
        Ok(strip_direction_suffix(stdout.trim()).to_string())
    }

    pub fn set(&self, direction: AudioDirection, name: &str) -> Result<(), SongbirdError> {
        self.run(vec![
            "-s".to_string(),
            name.to_string(),
            "-t".to_string(),
            direction.as_str().to_string(),
        ])?;
        append_run_log(
            "info",
            "audio.routing.set",
            json!({ "direction": direction.as_str(), "device": name }),
        );
        Ok(())
    }

    /// First device whose name contains `fragment`, ignoring case.
    pub fn find_device(
        &self,
        direction: AudioDirection,
        fragment: &str,
    ) -> Result<Option<String>, SongbirdError> {
        let needle = fragment.to_lowercase();
        Ok(self
            .list_devices(direction)?
            .into_iter()
            .find(|name| name.to_lowercase().contains(&needle)))
    }
}

fn strip_direction_suffix(line: &str) -> &str {
    line.strip_suffix("(input)")
        .or_else(|| line.strip_suffix("(output)"))
        .map(str::trim_end)
        .unwrap_or(line)
}

/// Holds the OS routing that was active before a session diverted it to the effects device.
/// Restores both directions exactly once, on `restore` or on drop.
pub struct AudioRoutingGuard {
    switcher: AudioSwitcher,
    original_input: String,
    original_output: String,
    restored: bool,
}

impl AudioRoutingGuard {
    /// Captures the current input and output, then routes both through `device_fragment`.
    pub fn divert(switcher: AudioSwitcher, device_fragment: &str) -> Result<Self, SongbirdError> {
        let original_input = switcher.current(AudioDirection::Input)?;
        let original_output = switcher.current(AudioDirection::Output)?;
        append_run_log(
            "info",
            "audio.routing.captured",
            json!({ "input": original_input, "output": original_output }),
        );

        let target_input = switcher
            .find_device(AudioDirection::Input, device_fragment)?
            .ok_or_else(|| {
                SongbirdError::Hardware(format!("no input device matching {device_fragment}"))
            })?;
        let target_output = switcher
            .find_device(AudioDirection::Output, device_fragment)?
            .ok_or_else(|| {
                SongbirdError::Hardware(format!("no output device matching {device_fragment}"))
            })?;

        let guard = Self {
            switcher,
            original_input,
            original_output,
            restored: false,
        };
        // A failure below drops the guard, which puts back whatever was changed.
        guard.switcher.set(AudioDirection::Input, &target_input)?;
        guard.switcher.set(AudioDirection::Output, &target_output)?;
        Ok(guard)
    }

    pub fn original_input(&self) -> &str {
        &self.original_input
    }

    pub fn original_output(&self) -> &str {
        &self.original_output
    }

    pub fn is_restored(&self) -> bool {
        self.restored
    }

    /// Attempts both directions even if the first fails. Later calls are no-ops.
    pub fn restore(&mut self) -> Result<(), SongbirdError> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;

        let input = self
            .switcher
            .set(AudioDirection::Input, &self.original_input);
        let output = self
            .switcher
            .set(AudioDirection::Output, &self.original_output);

        let failures = [("input", input), ("output", output)]
            .into_iter()
            .filter_map(|(direction, result)| result.err().map(|err| (direction, err)))
            .collect::<Vec<_>>();

        if failures.is_empty() {
            append_run_log(
                "info",
                "audio.routing.restored",
                json!({ "input": self.original_input, "output": self.original_output }),
            );
            return Ok(());
        }

        let detail = failures
            .iter()
            .map(|(direction, err)| format!("{direction}: {err}"))
            .collect::<Vec<_>>()
            .join("; ");
        append_run_log(
            "error",
            "audio.routing.restore_failed",
            json!({ "detail": detail }),
        );
        Err(SongbirdError::Hardware(format!(
            "audio routing restore incomplete: {detail}"
        )))
    }
}

impl Drop for AudioRoutingGuard {
    fn drop(&mut self) {
        let _ = self.restore();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{FakeClock, FakeProcess, FakeProcessRunner, ProcessOutput};

    fn switcher_over(runner: &FakeProcessRunner) -> AudioSwitcher {
        AudioSwitcher::new(
            "SwitchAudioSource",
            Arc::new(runner.clone()),
            Arc::new(FakeClock::default()),
        )
    }

    fn switcher_runner(fail_output_set: bool) -> FakeProcessRunner {
        FakeProcessRunner::with_handler(move |request| {
            let args = request.args.join(" ");
            let stdout = match args.as_str() {
                "-c -t input" => "MacBook Microphone\n",
                "-c -t output" => "MacBook Speakers\n",
                "-a -t input" => "MacBook Microphone (input)\nSongbird FX (input)\n",
                "-a -t output" => "MacBook Speakers (output)\nSongbird FX (output)\n",
                other if other.starts_with("-s") => {
                    if fail_output_set && other.ends_with("output") {
                        return FakeProcess::Exit(ProcessOutput::failed(1, "device busy"));
                    }
                    ""
                }
                _ => "",
            };
            FakeProcess::Exit(ProcessOutput::ok(stdout))
        })
    }

    fn set_calls(runner: &FakeProcessRunner) -> Vec<String> {
        runner
            .spawned()
            .into_iter()
            .map(|request| request.args.join(" "))
            .filter(|args| args.starts_with("-s"))
            .collect()
    }

    #[test]
    fn divert_then_restore_exactly_once() {
        let runner = switcher_runner(false);
        let switcher = switcher_over(&runner);

        let mut guard = AudioRoutingGuard::divert(switcher, "songbird").expect("divert");
        assert_eq!(guard.original_input(), "MacBook Microphone");
        guard.restore().expect("restore");
        guard.restore().expect("second restore is a no-op");
        drop(guard);

        assert_eq!(
            set_calls(&runner),
            vec![
                "-s Songbird FX -t input",
                "-s Songbird FX -t output",
                "-s MacBook Microphone -t input",
                "-s MacBook Speakers -t output",
            ]
        );
    }

    #[test]
    fn drop_restores_when_session_exits_early() {
        let runner = switcher_runner(false);
        let switcher = switcher_over(&runner);
        {
            let _guard = AudioRoutingGuard::divert(switcher, "Songbird").expect("divert");
        }
        let calls = set_calls(&runner);
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[3], "-s MacBook Speakers -t output");
    }

    #[test]
    fn restore_attempts_both_directions_when_one_fails() {
        let runner = switcher_runner(false);
        let switcher = switcher_over(&runner);
        let mut guard = AudioRoutingGuard::divert(switcher, "Songbird").expect("divert");

        let failing = switcher_runner(true);
        guard.switcher = switcher_over(&failing);
        let err = guard.restore().expect_err("output restore fails");
        assert!(err.to_string().contains("output"));
        assert_eq!(set_calls(&failing).len(), 2);
        assert!(guard.is_restored());
    }

    #[test]
    fn missing_device_fails_without_touching_routing() {
        let runner = switcher_runner(false);
        let switcher = switcher_over(&runner);
        assert!(AudioRoutingGuard::divert(switcher, "Focusrite").is_err());
        assert!(set_calls(&runner).is_empty());
    }

    #[test]
    fn hung_switcher_is_killed_at_the_timeout() {
        let runner = FakeProcessRunner::with_handler(|_| FakeProcess::Hang);
        let clock = FakeClock::default();
        let start = clock.now();
        let switcher = AudioSwitcher::new(
            "SwitchAudioSource",
            Arc::new(runner.clone()),
            Arc::new(clock.clone()),
        );

        let err = switcher
            .current(AudioDirection::Input)
            .expect_err("hung switcher");
        assert!(err.to_string().contains("did not finish within 10s"));
        assert_eq!(runner.kills().len(), 1);
        assert!(clock.now() >= start + SWITCHER_TIMEOUT);
    }
}
