use crate::cancel::CancelToken;
use crate::errors::SongbirdError;
use crate::serial::{ControlChannel, SerialControlChannel};
use std::collections::HashMap;
use std::io::{BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl ProcessRequest {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
        }
    }

    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
    fn sleep_until(&self, deadline: SystemTime) -> Result<(), SongbirdError>;

    fn sleep_for(&self, duration: Duration) -> Result<(), SongbirdError> {
        self.sleep_until(self.now() + duration)
    }
}

/// `2024-01-01T00:00:00Z`
pub fn format_rfc3339(time: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(time).to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// `20240101_000000`, used in backup directory names.
pub fn format_compact(time: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(time)
        .format("%Y%m%d_%H%M%S")
        .to_string()
}

pub trait ProcessRunner: Send + Sync {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, SongbirdError>;
    fn try_wait(&self, handle: u64) -> Result<Option<ProcessOutput>, SongbirdError>;
    fn wait(&self, handle: u64) -> Result<ProcessOutput, SongbirdError>;
    fn kill(&self, handle: u64) -> Result<(), SongbirdError>;
    /// Kills every child still tracked by the runner and returns how many were signalled.
    fn kill_all(&self) -> usize;

    fn run(&self, request: ProcessRequest) -> Result<ProcessOutput, SongbirdError> {
        let handle = self.spawn(request)?;
        self.wait(handle)
    }
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, SongbirdError>;
    fn write_string(&self, path: &Path, contents: &str) -> Result<(), SongbirdError>;
    fn create_dir_all(&self, path: &Path) -> Result<(), SongbirdError>;
    fn remove_file(&self, path: &Path) -> Result<(), SongbirdError>;
    fn rename(&self, from: &Path, to: &Path) -> Result<(), SongbirdError>;
    fn exists(&self, path: &Path) -> bool;
    /// Direct children of `path`, sorted.
    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>, SongbirdError>;
}

pub trait Terminal: Send + Sync {
    fn stdin_is_tty(&self) -> bool;
    fn write_line(&self, line: &str) -> Result<(), SongbirdError>;
    /// Asks a yes/no question. Non-interactive terminals always answer no.
    fn confirm(&self, prompt: &str) -> Result<bool, SongbirdError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(ProcessOutput),
    TimedOut,
    Cancelled,
}

/// Polls `handle` until it exits, `deadline` passes, or `cancel` fires.
/// Timed-out and cancelled children are killed and reaped before returning.
pub fn wait_with_deadline(
    runner: &dyn ProcessRunner,
    clock: &dyn Clock,
    handle: u64,
    deadline: SystemTime,
    cancel: &CancelToken,
) -> Result<WaitOutcome, SongbirdError> {
    loop {
        if let Some(output) = runner.try_wait(handle)? {
            return Ok(WaitOutcome::Exited(output));
        }
        if cancel.is_cancelled() {
            reap_killed(runner, handle);
            return Ok(WaitOutcome::Cancelled);
        }
        let now = clock.now();
        if now >= deadline {
            reap_killed(runner, handle);
            return Ok(WaitOutcome::TimedOut);
        }
        let next = now + WAIT_POLL_INTERVAL;
        clock.sleep_until(next.min(deadline))?;
    }
}

fn reap_killed(runner: &dyn ProcessRunner, handle: u64) {
    let _ = runner.kill(handle);
    let _ = runner.wait(handle);
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), SongbirdError> {
        let now = SystemTime::now();
        if let Ok(duration) = deadline.duration_since(now) {
            std::thread::sleep(duration);
        }
        Ok(())
    }
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, SongbirdError> {
        std::fs::read_to_string(path).map_err(|e| SongbirdError::Io(e.to_string()))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), SongbirdError> {
        let mut file =
            std::fs::File::create(path).map_err(|e| SongbirdError::Io(e.to_string()))?;
        file.write_all(contents.as_bytes())
            .map_err(|e| SongbirdError::Io(e.to_string()))?;
        file.sync_all()
            .map_err(|e| SongbirdError::Io(e.to_string()))
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), SongbirdError> {
        std::fs::create_dir_all(path).map_err(|e| SongbirdError::Io(e.to_string()))
    }

    fn remove_file(&self, path: &Path) -> Result<(), SongbirdError> {
        std::fs::remove_file(path).map_err(|e| SongbirdError::Io(e.to_string()))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), SongbirdError> {
        std::fs::rename(from, to).map_err(|e| SongbirdError::Io(e.to_string()))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>, SongbirdError> {
        let mut entries = std::fs::read_dir(path)
            .map_err(|e| SongbirdError::Io(format!("{}: {e}", path.display())))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .collect::<Vec<_>>();
        entries.sort();
        Ok(entries)
    }
}

struct RunningChild {
    child: std::process::Child,
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

impl RunningChild {
    fn into_output(self, exit_code: i32) -> ProcessOutput {
        ProcessOutput {
            exit_code,
            stdout: join_pipe(self.stdout),
            stderr: join_pipe(self.stderr),
        }
    }
}

fn drain_pipe<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buffer = Vec::new();
            let _ = pipe.read_to_end(&mut buffer);
            buffer
        })
    })
}

fn join_pipe(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
        .unwrap_or_default()
}

#[derive(Default)]
struct ProcessState {
    next_handle: u64,
    children: HashMap<u64, RunningChild>,
}

pub struct ProductionProcessRunner {
    state: Mutex<ProcessState>,
}

impl ProductionProcessRunner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProcessState::default()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ProcessState>, SongbirdError> {
        self.state
            .lock()
            .map_err(|_| SongbirdError::Process("process lock poisoned".to_string()))
    }
}

impl Default for ProductionProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner for ProductionProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, SongbirdError> {
        let mut cmd = std::process::Command::new(&request.program);
        cmd.args(&request.args);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| SongbirdError::Process(format!("{}: {e}", request.program)))?;
        let running = RunningChild {
            stdout: drain_pipe(child.stdout.take()),
            stderr: drain_pipe(child.stderr.take()),
            child,
        };
        let mut state = self.lock()?;
        let handle = state.next_handle;
        state.next_handle += 1;
        state.children.insert(handle, running);
        Ok(handle)
    }

    fn try_wait(&self, handle: u64) -> Result<Option<ProcessOutput>, SongbirdError> {
        let finished = {
            let mut state = self.lock()?;
            let running = state
                .children
                .get_mut(&handle)
                .ok_or_else(|| SongbirdError::Process(format!("unknown handle {handle}")))?;
            match running.child.try_wait() {
                Ok(Some(status)) => state
                    .children
                    .remove(&handle)
                    .map(|running| (running, status.code().unwrap_or(-1))),
                Ok(None) => None,
                Err(e) => return Err(SongbirdError::Process(e.to_string())),
            }
        };
        Ok(finished.map(|(running, code)| running.into_output(code)))
    }

    fn wait(&self, handle: u64) -> Result<ProcessOutput, SongbirdError> {
        loop {
            if let Some(output) = self.try_wait(handle)? {
                return Ok(output);
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    fn kill(&self, handle: u64) -> Result<(), SongbirdError> {
        let mut state = self.lock()?;
        let running = state
            .children
            .get_mut(&handle)
            .ok_or_else(|| SongbirdError::Process(format!("unknown handle {handle}")))?;
        running
            .child
            .kill()
            .map_err(|e| SongbirdError::Process(e.to_string()))
    }

    fn kill_all(&self) -> usize {
        let Ok(mut state) = self.state.lock() else {
            return 0;
        };
        state
            .children
            .values_mut()
            .filter_map(|running| running.child.kill().ok())
            .count()
    }
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn stdin_is_tty(&self) -> bool {
        std::io::IsTerminal::is_terminal(&std::io::stdin())
    }

    fn write_line(&self, line: &str) -> Result<(), SongbirdError> {
        let mut out = std::io::stdout();
        writeln!(out, "{line}").map_err(|e| SongbirdError::Io(e.to_string()))
    }

    fn confirm(&self, prompt: &str) -> Result<bool, SongbirdError> {
        if !self.stdin_is_tty() {
            return Ok(false);
        }
        let mut out = std::io::stdout();
        write!(out, "{prompt} [y/N] ").map_err(|e| SongbirdError::Io(e.to_string()))?;
        out.flush().map_err(|e| SongbirdError::Io(e.to_string()))?;
        let mut answer = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut answer)
            .map_err(|e| SongbirdError::Io(e.to_string()))?;
        Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
    }
}

pub struct Runtime {
    pub clock: Arc<dyn Clock>,
    pub file_system: Arc<dyn FileSystem>,
    pub process_runner: Arc<dyn ProcessRunner>,
    pub terminal: Arc<dyn Terminal>,
    pub control_channel: Arc<dyn ControlChannel>,
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(ProductionClock),
            file_system: Arc::new(ProductionFileSystem),
            process_runner: Arc::new(ProductionProcessRunner::new()),
            terminal: Arc::new(ProductionTerminal),
            control_channel: Arc::new(SerialControlChannel::default()),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
    sleeps: Arc<Mutex<Vec<SystemTime>>>,
}

impl FakeClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn sleeps(&self) -> Vec<SystemTime> {
        self.sleeps.lock().expect("sleep lock").clone()
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += by;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        // 2024-01-01T00:00:00Z keeps rendered timestamps readable in tests.
        Self::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_704_067_200))
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().expect("clock lock")
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), SongbirdError> {
        self.sleeps.lock().expect("sleep lock").push(deadline);
        let mut now = self.now.lock().expect("clock lock");
        if deadline > *now {
            *now = deadline;
        }
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
    dirs: Arc<Mutex<Vec<PathBuf>>>,
    fail_next: Arc<Mutex<Option<SongbirdError>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        fs.files
            .lock()
            .expect("files lock")
            .insert(path.into(), contents.into());
        fs
    }

    pub fn set_fail_next(&self, error: SongbirdError) {
        *self.fail_next.lock().expect("fail lock") = Some(error);
    }

    pub fn file_names(&self) -> Vec<PathBuf> {
        let mut names = self
            .files
            .lock()
            .expect("files lock")
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    fn maybe_fail(&self) -> Result<(), SongbirdError> {
        if let Some(err) = self.fail_next.lock().expect("fail lock").take() {
            return Err(err);
        }
        Ok(())
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, SongbirdError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .get(path)
            .cloned()
            .ok_or_else(|| SongbirdError::Io(format!("missing file {}", path.display())))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), SongbirdError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), SongbirdError> {
        self.maybe_fail()?;
        self.dirs
            .lock()
            .expect("dirs lock")
            .push(path.to_path_buf());
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<(), SongbirdError> {
        self.maybe_fail()?;
        self.files.lock().expect("files lock").remove(path);
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), SongbirdError> {
        self.maybe_fail()?;
        let mut files = self.files.lock().expect("files lock");
        let contents = files
            .remove(from)
            .ok_or_else(|| SongbirdError::Io(format!("missing file {}", from.display())))?;
        files.insert(to.to_path_buf(), contents);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().expect("files lock").contains_key(path)
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>, SongbirdError> {
        self.maybe_fail()?;
        let mut entries = self
            .files
            .lock()
            .expect("files lock")
            .keys()
            .filter(|file| file.parent() == Some(path))
            .cloned()
            .collect::<Vec<_>>();
        entries.sort();
        Ok(entries)
    }
}

#[derive(Default, Clone)]
pub struct FakeTerminal {
    pub is_tty: bool,
    pub confirm_answer: bool,
    writes: Arc<Mutex<Vec<String>>>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn new(is_tty: bool) -> Self {
        Self {
            is_tty,
            ..Self::default()
        }
    }

    pub fn answering(is_tty: bool, confirm_answer: bool) -> Self {
        Self {
            is_tty,
            confirm_answer,
            ..Self::default()
        }
    }

    pub fn written_lines(&self) -> Vec<String> {
        self.writes.lock().expect("writes lock").clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }
}

impl Terminal for FakeTerminal {
    fn stdin_is_tty(&self) -> bool {
        self.is_tty
    }

    fn write_line(&self, line: &str) -> Result<(), SongbirdError> {
        self.writes
            .lock()
            .expect("writes lock")
            .push(line.to_string());
        Ok(())
    }

    fn confirm(&self, prompt: &str) -> Result<bool, SongbirdError> {
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(prompt.to_string());
        Ok(self.is_tty && self.confirm_answer)
    }
}

/// What a scripted fake child does once spawned.
#[derive(Debug, Clone)]
pub enum FakeProcess {
    Exit(ProcessOutput),
    /// Never exits on its own; only `kill` ends it.
    Hang,
    SpawnError(String),
}

type FakeHandler = dyn Fn(&ProcessRequest) -> FakeProcess + Send + Sync;

#[derive(Debug, Clone)]
enum FakeChild {
    Done(ProcessOutput),
    Running,
    Killed,
}

#[derive(Default, Clone)]
pub struct FakeProcessRunner {
    handler: Arc<Mutex<Option<Arc<FakeHandler>>>>,
    responses: Arc<Mutex<Vec<Result<ProcessOutput, SongbirdError>>>>,
    spawned: Arc<Mutex<Vec<ProcessRequest>>>,
    children: Arc<Mutex<HashMap<u64, FakeChild>>>,
    kills: Arc<Mutex<Vec<u64>>>,
    next_handle: Arc<Mutex<u64>>,
}

impl FakeProcessRunner {
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&ProcessRequest) -> FakeProcess + Send + Sync + 'static,
    {
        let runner = Self::default();
        runner.set_handler(handler);
        runner
    }

    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&ProcessRequest) -> FakeProcess + Send + Sync + 'static,
    {
        *self.handler.lock().expect("handler lock") = Some(Arc::new(handler));
    }

    pub fn push_response(&self, output: Result<ProcessOutput, SongbirdError>) {
        self.responses.lock().expect("responses lock").push(output);
    }

    pub fn spawned(&self) -> Vec<ProcessRequest> {
        self.spawned.lock().expect("spawned lock").clone()
    }

    pub fn spawned_programs(&self) -> Vec<String> {
        self.spawned()
            .into_iter()
            .map(|request| request.program)
            .collect()
    }

    pub fn kills(&self) -> Vec<u64> {
        self.kills.lock().expect("kills lock").clone()
    }

    fn scripted(&self, request: &ProcessRequest) -> Result<FakeChild, SongbirdError> {
        let handler = self.handler.lock().expect("handler lock").clone();
        if let Some(handler) = handler {
            return match handler(request) {
                FakeProcess::Exit(output) => Ok(FakeChild::Done(output)),
                FakeProcess::Hang => Ok(FakeChild::Running),
                FakeProcess::SpawnError(message) => Err(SongbirdError::Process(message)),
            };
        }
        let mut responses = self.responses.lock().expect("responses lock");
        if responses.is_empty() {
            return Err(SongbirdError::Process(
                "no fake response queued".to_string(),
            ));
        }
        responses.remove(0).map(FakeChild::Done)
    }
}

impl ProcessRunner for FakeProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, SongbirdError> {
        self.spawned
            .lock()
            .expect("spawned lock")
            .push(request.clone());
        let child = self.scripted(&request)?;
        let mut next = self.next_handle.lock().expect("next lock");
        let handle = *next;
        *next += 1;
        self.children
            .lock()
            .expect("children lock")
            .insert(handle, child);
        Ok(handle)
    }

    fn try_wait(&self, handle: u64) -> Result<Option<ProcessOutput>, SongbirdError> {
        let mut children = self.children.lock().expect("children lock");
        match children.get(&handle).cloned() {
            None => Err(SongbirdError::Process(format!("unknown handle {handle}"))),
            Some(FakeChild::Running) => Ok(None),
            Some(FakeChild::Done(output)) => {
                children.remove(&handle);
                Ok(Some(output))
            }
            Some(FakeChild::Killed) => {
                children.remove(&handle);
                Ok(Some(ProcessOutput::failed(-9, "killed")))
            }
        }
    }

    fn wait(&self, handle: u64) -> Result<ProcessOutput, SongbirdError> {
        self.try_wait(handle)?.ok_or_else(|| {
            SongbirdError::Process(format!("fake process {handle} is still running"))
        })
    }

    fn kill(&self, handle: u64) -> Result<(), SongbirdError> {
        self.kills.lock().expect("kills lock").push(handle);
        let mut children = self.children.lock().expect("children lock");
        if let Some(child) = children.get_mut(&handle) {
            if matches!(child, FakeChild::Running) {
                *child = FakeChild::Killed;
            }
        }
        Ok(())
    }

    fn kill_all(&self) -> usize {
        let mut children = self.children.lock().expect("children lock");
        let mut killed = 0;
        for (handle, child) in children.iter_mut() {
            if matches!(child, FakeChild::Running) {
                *child = FakeChild::Killed;
                self.kills.lock().expect("kills lock").push(*handle);
                killed += 1;
            }
        }
        killed
    }
}
