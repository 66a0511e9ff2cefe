use songbird::backup::BackupManager;
use songbird::cancel::CancelToken;
use songbird::checkpoint::CheckpointStore;
use songbird::errors::{SongbirdError, EXIT_CANCELLED};
use songbird::run_with_runtime;
use songbird::runtime::{
    FakeClock, FakeProcess, FakeProcessRunner, FakeTerminal, ProcessOutput, ProcessRequest,
    ProductionFileSystem, Runtime,
};
use songbird::serial::{ChannelCall, FakeControlChannel};
use songbird::types::{SessionState, TaskStatus};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const BUILT_IN_INPUT: &str = "Built-in Microphone";
const BUILT_IN_OUTPUT: &str = "Built-in Output";
const DEVICE_NAME: &str = "Songbird FX";
const SAMPLE_RATE: u32 = 8000;

/// Mutable behaviour of the simulated bench, shared with the fake process handler.
struct RigState {
    dev_dir: PathBuf,
    usb_queries: AtomicUsize,
    plug_on_query: Mutex<Option<usize>>,
    fail_once: Mutex<Vec<String>>,
    interrupt_on: Mutex<Option<String>>,
    unplug_on: Mutex<Option<(String, Option<String>)>>,
    current_input: Mutex<String>,
    current_output: Mutex<String>,
}

impl RigState {
    fn plug(&self, node: &str) {
        std::fs::create_dir_all(&self.dev_dir).expect("dev dir");
        std::fs::write(self.dev_dir.join(node), b"").expect("plug");
    }
}

struct Bench {
    dir: tempfile::TempDir,
    clock: FakeClock,
    runner: FakeProcessRunner,
    channel: FakeControlChannel,
    cancel: CancelToken,
    rig: Arc<RigState>,
}

fn write_wav(path: &Path, seconds: f64) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).expect("wav writer");
    let samples = (seconds * f64::from(SAMPLE_RATE)) as usize;
    for i in 0..samples {
        writer
            .write_sample(((i % 64) as i16 - 32) * 256)
            .expect("sample");
    }
    writer.finalize().expect("finalize");
}

fn path_ends_with(path: &str, suffix: &str) -> bool {
    Path::new(path).ends_with(suffix)
}

fn bench_handler(
    rig: Arc<RigState>,
    cancel: CancelToken,
) -> impl Fn(&ProcessRequest) -> FakeProcess + Send + Sync + 'static {
    move |request| match request.program.as_str() {
        "lsusb" => {
            let count = rig.usb_queries.fetch_add(1, Ordering::SeqCst) + 1;
            if *rig.plug_on_query.lock().expect("plug lock") == Some(count) {
                rig.plug("ttyACM0");
            }
            FakeProcess::Exit(ProcessOutput::ok("Bus 001 Device 002: ID 05ac:8006 Apple Hub\n"))
        }
        "SwitchAudioSource" => {
            let args = request.args.iter().map(String::as_str).collect::<Vec<_>>();
            let stdout = match args.as_slice() {
                ["-a", "-t", "input"] => format!("{BUILT_IN_INPUT} (input)\n{DEVICE_NAME} (input)\n"),
                ["-a", "-t", "output"] => {
                    format!("{BUILT_IN_OUTPUT} (output)\n{DEVICE_NAME} (output)\n")
                }
                ["-c", "-t", "input"] => rig.current_input.lock().expect("input lock").clone(),
                ["-c", "-t", "output"] => rig.current_output.lock().expect("output lock").clone(),
                ["-s", name, "-t", "input"] => {
                    *rig.current_input.lock().expect("input lock") = name.to_string();
                    String::new()
                }
                ["-s", name, "-t", "output"] => {
                    *rig.current_output.lock().expect("output lock") = name.to_string();
                    String::new()
                }
                _ => String::new(),
            };
            FakeProcess::Exit(ProcessOutput::ok(stdout))
        }
        "rec" => {
            let Some(output) = request.args.first().cloned() else {
                return FakeProcess::Exit(ProcessOutput::failed(2, "no output"));
            };
            if output.contains(".songbird") {
                std::fs::write(&output, vec![0u8; 4096]).expect("probe write");
                return FakeProcess::Exit(ProcessOutput::ok(""));
            }

            let interrupt = rig.interrupt_on.lock().expect("interrupt lock").clone();
            if interrupt.is_some_and(|suffix| path_ends_with(&output, &suffix)) {
                cancel.cancel("SIGINT");
                return FakeProcess::Hang;
            }

            let unplug = rig.unplug_on.lock().expect("unplug lock").clone();
            if let Some((suffix, replacement)) = unplug {
                if path_ends_with(&output, &suffix) {
                    let _ = std::fs::remove_file(rig.dev_dir.join("ttyACM0"));
                    if let Some(node) = replacement {
                        rig.plug(&node);
                    }
                    std::fs::write(&output, b"RIFF").expect("truncated write");
                    return FakeProcess::Exit(ProcessOutput::ok(""));
                }
            }

            let mut fail_once = rig.fail_once.lock().expect("fail lock");
            if let Some(index) = fail_once
                .iter()
                .position(|suffix| path_ends_with(&output, suffix))
            {
                fail_once.remove(index);
                std::fs::write(&output, vec![0u8; 10]).expect("short write");
                return FakeProcess::Exit(ProcessOutput::ok(""));
            }
            drop(fail_once);

            write_wav(Path::new(&output), 1.0);
            FakeProcess::Exit(ProcessOutput::ok(""))
        }
        _ => FakeProcess::Exit(ProcessOutput::ok("")),
    }
}

impl Bench {
    fn new(speakers: &[&str], clips: &[&str], extra_toml: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("audio/source");
        std::fs::create_dir_all(&source).expect("source dir");
        for clip in clips {
            write_wav(&source.join(clip), 0.5);
        }
        std::fs::write(source.join("README.txt"), "not audio").expect("readme");

        let dev_dir = dir.path().join("dev");
        let speakers = speakers
            .iter()
            .map(|speaker| format!("\"{speaker}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let config = format!(
            r#"
[session]
speakers = [{speakers}]
segment_seconds = 1.0
duration_tolerance_seconds = 0.5
record_margin_seconds = 2.0
min_recording_bytes = 1024
expected_sample_rate = {SAMPLE_RATE}

[device]
audio_device_name = "Songbird"
usb_query_command = ["lsusb"]
serial_globs = ["{glob}"]
scan_prefixes = []
command_settle_ms = 50

[audio]
play_command = ["play", "{{input}}"]
record_command = ["rec", "{{output}}", "{{seconds}}"]

[validation]
max_retries = 3
retry_delay_seconds = 1
tone_seconds = 0.05
min_probe_bytes = 100
{extra_toml}
"#,
            glob = dev_dir.join("ttyACM*").display(),
        );
        std::fs::write(dir.path().join("songbird.toml"), config).expect("config");

        let cancel = CancelToken::new();
        let rig = Arc::new(RigState {
            dev_dir,
            usb_queries: AtomicUsize::new(0),
            plug_on_query: Mutex::new(None),
            fail_once: Mutex::new(Vec::new()),
            interrupt_on: Mutex::new(None),
            unplug_on: Mutex::new(None),
            current_input: Mutex::new(BUILT_IN_INPUT.to_string()),
            current_output: Mutex::new(BUILT_IN_OUTPUT.to_string()),
        });
        let runner = FakeProcessRunner::with_handler(bench_handler(rig.clone(), cancel.clone()));
        Self {
            dir,
            clock: FakeClock::default(),
            runner,
            channel: FakeControlChannel::default(),
            cancel,
            rig,
        }
    }

    /// Device present before the first validation attempt.
    fn plugged(speakers: &[&str], clips: &[&str], extra_toml: &str) -> Self {
        let bench = Self::new(speakers, clips, extra_toml);
        bench.rig.plug("ttyACM0");
        bench
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn results(&self) -> PathBuf {
        self.root().join("audio/recordings")
    }

    fn run(&self, flags: &[&str], terminal: &FakeTerminal) -> Result<i32, SongbirdError> {
        let runtime = Runtime {
            clock: Arc::new(self.clock.clone()),
            file_system: Arc::new(ProductionFileSystem),
            process_runner: Arc::new(self.runner.clone()),
            terminal: Arc::new(terminal.clone()),
            control_channel: Arc::new(self.channel.clone()),
        };
        let mut args = vec![OsString::from("songbird")];
        args.extend(flags.iter().map(OsString::from));
        run_with_runtime(&args, self.root(), &runtime, &self.cancel)
    }

    fn checkpoint(&self) -> CheckpointStore {
        CheckpointStore::open(
            self.results().join(".songbird-checkpoint.json"),
            Arc::new(ProductionFileSystem),
            Arc::new(self.clock.clone()),
        )
        .expect("checkpoint")
    }

    fn report(&self) -> String {
        std::fs::read_to_string(self.results().join("session-report.md")).expect("report")
    }

    fn session_recordings(&self) -> usize {
        self.runner
            .spawned()
            .into_iter()
            .filter(|request| request.program == "rec")
            .filter(|request| request.args.first().is_some_and(|out| !out.contains(".songbird")))
            .count()
    }

    fn routing_is_built_in(&self) -> bool {
        *self.rig.current_input.lock().expect("input lock") == BUILT_IN_INPUT
            && *self.rig.current_output.lock().expect("output lock") == BUILT_IN_OUTPUT
    }
}

#[test]
fn late_device_then_two_failures_then_resume_completes_all_24_tasks() {
    let bench = Bench::new(&["s1", "s2", "s3"], &["clip_a.wav", "clip_b.wav"], "");
    *bench.rig.plug_on_query.lock().expect("plug lock") = Some(2);
    *bench.rig.fail_once.lock().expect("fail lock") = vec![
        "s2/clip_a_noise.wav".to_string(),
        "s3/clip_b_warp.wav".to_string(),
    ];
    let terminal = FakeTerminal::new(false);

    let code = bench.run(&[], &terminal).expect("first session");
    assert_eq!(code, 1);

    let store = bench.checkpoint();
    let counts = store.summary();
    assert_eq!(counts.total(), 24);
    assert_eq!(counts.completed, 22);
    assert_eq!(counts.failed, 2);
    let failed = store
        .failed_tasks()
        .into_iter()
        .map(|task| format!("{}/{}/{}", task.speaker, task.source_file, task.mode))
        .collect::<Vec<_>>();
    assert_eq!(failed, vec!["s2/clip_a.wav/noise", "s3/clip_b.wav/warp"]);
    assert!(store
        .failed_tasks()
        .iter()
        .all(|task| task.last_error.as_deref().is_some_and(|e| e.contains("too small"))));
    assert_eq!(store.metadata().session_state, SessionState::Completed);

    let report = bench.report();
    assert!(report.contains("- Hardware validation attempts: 2"));
    assert!(report.contains("| all | 22 | 2 | 0 | 24 |"));
    assert!(report.contains("| s2 / noise | 1 | 1 | 0 | 2 |"));
    assert!(terminal
        .written_lines()
        .iter()
        .any(|line| line.contains("--resume")));
    assert_eq!(bench.session_recordings(), 24);
    assert!(bench.routing_is_built_in());

    let resume_terminal = FakeTerminal::new(false);
    let code = bench.run(&["--resume"], &resume_terminal).expect("resume");
    assert_eq!(code, 0);

    let store = bench.checkpoint();
    assert_eq!(store.summary().completed, 24);
    assert_eq!(store.metadata().sessions_started, 2);
    assert_eq!(bench.session_recordings(), 26);
    let retried = store
        .tasks()
        .into_iter()
        .filter(|task| task.attempts == 2)
        .count();
    assert_eq!(retried, 2);
    let report = bench.report();
    assert!(report.contains("- Skipped (already complete): 22"));
    assert!(report.contains("| all | 24 | 0 | 0 | 24 |"));
}

#[test]
fn mode_bytes_are_sent_before_each_recording() {
    let bench = Bench::plugged(&["s1"], &["clip_a.wav"], "");
    bench.run(&[], &FakeTerminal::new(false)).expect("session");

    // Validation sweep first, then one byte per recording.
    assert_eq!(bench.channel.commands(), "cnpwcnpw");
    let outputs = ["clean", "noise", "pitch", "warp"]
        .iter()
        .map(|mode| bench.results().join(format!("s1/clip_a_{mode}.wav")))
        .collect::<Vec<_>>();
    assert!(outputs.iter().all(|path| path.is_file()));
}

#[test]
fn interrupt_marks_current_task_failed_and_restores_routing() {
    let bench = Bench::plugged(&["s1"], &["clip_a.wav", "clip_b.wav"], "");
    *bench.rig.interrupt_on.lock().expect("interrupt lock") = Some("s1/clip_a_pitch.wav".to_string());

    let err = bench
        .run(&[], &FakeTerminal::new(false))
        .expect_err("cancelled");
    assert!(matches!(&err, SongbirdError::Cancelled(reason) if reason == "SIGINT"));
    assert_eq!(err.exit_code(), EXIT_CANCELLED);

    let store = bench.checkpoint();
    let statuses = store
        .tasks()
        .into_iter()
        .filter(|task| task.source_file == "clip_a.wav")
        .map(|task| (task.mode.clone(), task.status))
        .collect::<Vec<_>>();
    assert!(statuses.contains(&("clean".to_string(), TaskStatus::Completed)));
    assert!(statuses.contains(&("noise".to_string(), TaskStatus::Completed)));
    assert!(statuses.contains(&("pitch".to_string(), TaskStatus::Failed)));
    assert!(statuses.contains(&("warp".to_string(), TaskStatus::Pending)));
    let summary = store.summary();
    assert_eq!((summary.completed, summary.failed, summary.pending), (2, 1, 5));
    assert_eq!(store.metadata().session_state, SessionState::TerminatedEarly);
    assert!(store
        .failed_tasks()
        .iter()
        .all(|task| task.last_error.as_deref() == Some("interrupted")));

    assert!(!bench.runner.kills().is_empty());
    assert!(bench.routing_is_built_in());
    let report = bench.report();
    assert!(report.contains("- State: terminated_early"));
    assert!(report.contains("cancelled by SIGINT"));
}

#[test]
fn missing_device_aborts_before_touching_results() {
    let bench = Bench::new(&["s1"], &["clip_a.wav"], "");
    let start = bench.clock.sleeps().len();
    let terminal = FakeTerminal::new(false);

    let err = bench.run(&[], &terminal).expect_err("no device");
    assert!(matches!(&err, SongbirdError::Hardware(msg) if msg.contains("discover")));
    assert_eq!(err.exit_code(), 1);
    assert!(!bench.results().exists());
    assert_eq!(bench.clock.sleeps().len() - start, 2);
    assert!(terminal
        .written_lines()
        .iter()
        .any(|line| line.contains("Check before retrying")));
}

#[test]
fn existing_results_need_resume_or_force_when_not_interactive() {
    let bench = Bench::plugged(&["s1"], &["clip_a.wav"], "");
    assert_eq!(bench.run(&[], &FakeTerminal::new(false)).expect("first"), 0);
    let marker = bench.results().join("s1/clip_a_clean.wav");
    let before = std::fs::read(&marker).expect("recording");

    let err = bench
        .run(&[], &FakeTerminal::new(false))
        .expect_err("refuses");
    assert!(matches!(&err, SongbirdError::Cli(msg) if msg.contains("--resume")));
    assert_eq!(std::fs::read(&marker).expect("still there"), before);
    assert!(!bench.root().join("backups").exists());
}

#[test]
fn fresh_run_backs_up_previous_results_before_clearing() {
    let bench = Bench::plugged(&["s1"], &["clip_a.wav"], "");
    assert_eq!(bench.run(&[], &FakeTerminal::new(false)).expect("first"), 0);
    std::fs::write(bench.results().join("s1/notes.txt"), "keep me").expect("notes");

    let terminal = FakeTerminal::answering(true, true);
    assert_eq!(bench.run(&[], &terminal).expect("second"), 0);
    assert_eq!(terminal.prompts().len(), 1);

    assert!(!bench.results().join("s1/notes.txt").exists());
    let backups = BackupManager::new(
        bench.root().join("backups"),
        5,
        true,
        Arc::new(bench.clock.clone()),
    );
    let records = backups.list_backups(Some("recordings")).expect("list");
    assert_eq!(records.len(), 1);
    assert!(records[0].path.join("s1/notes.txt").is_file());
    assert!(records[0].path.join("s1/clip_a_warp.wav").is_file());
    assert_eq!(bench.checkpoint().metadata().sessions_started, 1);
}

#[test]
fn declined_confirmation_keeps_results() {
    let bench = Bench::plugged(&["s1"], &["clip_a.wav"], "");
    bench.run(&[], &FakeTerminal::new(false)).expect("first");

    let err = bench
        .run(&[], &FakeTerminal::answering(true, false))
        .expect_err("declined");
    assert!(matches!(err, SongbirdError::Cli(_)));
    assert!(bench.results().join("s1/clip_a_clean.wav").is_file());
}

#[test]
fn failing_backup_leaves_results_untouched() {
    let bench = Bench::plugged(&["s1"], &["clip_a.wav"], "\n[backup]\ndir = \"blocker\"\n");
    bench.run(&[], &FakeTerminal::new(false)).expect("first");
    std::fs::write(bench.root().join("blocker"), "a file, not a directory").expect("blocker");

    let err = bench
        .run(&["--force"], &FakeTerminal::new(false))
        .expect_err("backup fails");
    assert!(matches!(err, SongbirdError::Backup(_)));
    assert!(bench.results().join("s1/clip_a_clean.wav").is_file());
    assert!(bench.results().join(".songbird-checkpoint.json").is_file());
}

#[test]
fn lost_device_is_recovered_under_a_new_path() {
    let bench = Bench::plugged(&["s1"], &["clip_a.wav"], "");
    *bench.rig.unplug_on.lock().expect("unplug lock") =
        Some(("s1/clip_a_noise.wav".to_string(), Some("ttyACM1".to_string())));

    let code = bench.run(&[], &FakeTerminal::new(false)).expect("session");
    assert_eq!(code, 1);

    let summary = bench.checkpoint().summary();
    assert_eq!((summary.completed, summary.failed), (3, 1));
    let recovered = bench.rig.dev_dir.join("ttyACM1");
    let calls = bench.channel.calls();
    assert!(calls.contains(&ChannelCall::Configure(recovered.clone(), 115_200)));
    assert!(calls.contains(&ChannelCall::Command(recovered, b'w')));
}

#[test]
fn unrecoverable_device_loss_ends_the_session() {
    let bench = Bench::plugged(&["s1"], &["clip_a.wav"], "");
    *bench.rig.unplug_on.lock().expect("unplug lock") = Some(("s1/clip_a_noise.wav".to_string(), None));

    let err = bench
        .run(&[], &FakeTerminal::new(false))
        .expect_err("device gone");
    assert!(matches!(&err, SongbirdError::Hardware(msg) if msg.contains("recovery failed")));

    let store = bench.checkpoint();
    assert_eq!(store.metadata().session_state, SessionState::TerminatedEarly);
    let summary = store.summary();
    assert_eq!((summary.completed, summary.failed, summary.pending), (1, 1, 2));
    assert!(bench.routing_is_built_in());
}

#[test]
fn demoted_recording_is_recorded_again_on_resume() {
    let bench = Bench::plugged(&["s1"], &["clip_a.wav"], "");
    assert_eq!(bench.run(&[], &FakeTerminal::new(false)).expect("first"), 0);
    std::fs::write(bench.results().join("s1/clip_a_pitch.wav"), b"corrupt").expect("corrupt");

    assert_eq!(bench.run(&["--resume"], &FakeTerminal::new(false)).expect("resume"), 0);
    let store = bench.checkpoint();
    assert_eq!(store.summary().completed, 4);
    assert_eq!(bench.session_recordings(), 5);
    let report = bench.report();
    assert!(report.contains("- Demoted on re-validation: 1"));
    assert!(report.contains("- Skipped (already complete): 3"));
}

#[test]
fn recording_truncated_on_disk_is_recorded_again_on_resume() {
    let bench = Bench::plugged(&["s1"], &["clip_a.wav"], "");
    assert_eq!(bench.run(&[], &FakeTerminal::new(false)).expect("first"), 0);
    let clipped = bench.results().join("s1/clip_a_noise.wav");
    std::fs::OpenOptions::new()
        .write(true)
        .open(&clipped)
        .and_then(|file| file.set_len(2000))
        .expect("truncate");

    assert_eq!(bench.run(&["--resume"], &FakeTerminal::new(false)).expect("resume"), 0);
    assert_eq!(bench.session_recordings(), 5);
    assert!(std::fs::metadata(&clipped).expect("re-recorded").len() > 2000);
    assert!(bench.report().contains("- Demoted on re-validation: 1"));
}

#[test]
fn backup_dir_inside_results_is_refused_before_recording() {
    let bench = Bench::plugged(
        &["s1"],
        &["clip_a.wav"],
        "\n[backup]\ndir = \"audio/recordings/backups\"\n",
    );
    let err = bench
        .run(&[], &FakeTerminal::new(false))
        .expect_err("nested backups");
    assert!(matches!(&err, SongbirdError::InvalidConfig(msg) if msg.contains("backup.dir")));
    assert!(bench.runner.spawned().is_empty());
    assert!(!bench.results().exists());
}

#[test]
fn pipeline_runs_after_a_fully_completed_session() {
    let bench = Bench::plugged(
        &["s1"],
        &["clip_a.wav"],
        r#"
[pipeline]
enabled = true

[[pipeline.stages]]
name = "features"
program = "automfcc"
args = ["{results_dir}", "features.csv"]

[[pipeline.stages]]
name = "train"
program = "train"
args = ["features.csv", "model.bin"]
"#,
    );
    assert_eq!(bench.run(&[], &FakeTerminal::new(false)).expect("session"), 0);

    let stages = bench
        .runner
        .spawned()
        .into_iter()
        .filter(|request| request.program == "automfcc" || request.program == "train")
        .collect::<Vec<_>>();
    assert_eq!(stages.len(), 2);
    assert_eq!(
        stages[0].args,
        vec![bench.results().display().to_string(), "features.csv".to_string()]
    );
    assert_eq!(stages[1].cwd, Some(bench.root().to_path_buf()));
}

#[test]
fn pipeline_is_skipped_when_tasks_failed() {
    let bench = Bench::plugged(
        &["s1"],
        &["clip_a.wav"],
        "\n[pipeline]\nenabled = true\n\n[[pipeline.stages]]\nname = \"features\"\nprogram = \"automfcc\"\n",
    );
    *bench.rig.fail_once.lock().expect("fail lock") = vec!["s1/clip_a_clean.wav".to_string()];
    assert_eq!(bench.run(&[], &FakeTerminal::new(false)).expect("session"), 1);
    assert!(!bench.runner.spawned_programs().iter().any(|p| p == "automfcc"));
}
