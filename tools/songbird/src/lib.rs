pub mod admin;
pub mod audio_routing;
pub mod backup;
pub mod cancel;
pub mod capture;
pub mod checkpoint;
pub mod config;
pub mod device;
pub mod errors;
pub mod hardware;
pub mod log_retention;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod recording_validation;
pub mod runtime;
pub mod serial;
pub mod session_report;
pub mod task_identity;
pub mod types;

use cancel::{install_interrupt_handler, CancelToken};
use clap::{error::ErrorKind, Parser};
use config::{load_config, AppConfig, CliOverrides};
use errors::SongbirdError;
use logging::{append_run_log, init_run_log, set_verbose};
use orchestrator::{RecordingOrchestrator, SessionOptions};
use runtime::Runtime;
use serde_json::json;
use types::SessionPaths;

#[derive(Debug, Clone, Parser)]
#[command(name = "songbird")]
#[command(about = "Records reference clips through the Songbird effects device, one task per speaker, clip and mode")]
pub struct Cli {
    /// TOML configuration file. Defaults to ./songbird.toml when present.
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,
    /// Keep existing recordings and the checkpoint; retry only unfinished tasks.
    #[arg(long, default_value_t = false)]
    pub resume: bool,
    /// Skip the confirmation before backing up and clearing existing recordings.
    #[arg(long, default_value_t = false)]
    pub force: bool,
    /// Echo every run-log event to stderr.
    #[arg(long, default_value_t = false)]
    pub verbose: bool,
}

pub fn run() -> Result<i32, SongbirdError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| SongbirdError::Io(e.to_string()))?;
    let runtime = Runtime::new();
    let cancel = CancelToken::new();
    install_interrupt_handler(cancel.clone(), runtime.process_runner.clone())?;
    run_with_runtime(&args, &cwd, &runtime, &cancel)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    cwd: &std::path::Path,
    runtime: &Runtime,
    cancel: &CancelToken,
) -> Result<i32, SongbirdError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(SongbirdError::Cli(error.to_string())),
        },
    };

    let overrides = CliOverrides {
        config_path: cli.config.clone(),
    };
    let (cfg, paths) = load_config(&overrides, cwd, runtime.file_system.as_ref())?;
    start_run_log(&cfg, &paths, runtime, cli.verbose)?;
    append_run_log(
        "info",
        "cli.parsed",
        json!({
            "config": cli.config.as_ref().map(|path| path.display().to_string()),
            "resume": cli.resume,
            "force": cli.force,
            "verbose": cli.verbose,
        }),
    );

    let orchestrator = RecordingOrchestrator {
        cfg: &cfg,
        paths: &paths,
        runtime,
        cancel,
    };
    let outcome = orchestrator.run(SessionOptions {
        resume: cli.resume,
        force: cli.force,
    });
    match outcome {
        Ok(outcome) => Ok(outcome.exit_code),
        Err(err) => {
            append_run_log(
                "error",
                "session.aborted",
                json!({ "error": err.to_string(), "exit_code": err.exit_code() }),
            );
            Err(err)
        }
    }
}

/// Shared by both binaries: routes the process-wide run log under `logging.dir`.
pub fn start_run_log(
    cfg: &AppConfig,
    paths: &SessionPaths,
    runtime: &Runtime,
    verbose: bool,
) -> Result<(), SongbirdError> {
    runtime.file_system.create_dir_all(&paths.log_dir)?;
    init_run_log(paths.log_dir.join("run.jsonl"), cfg.logging.budget_bytes);
    set_verbose(verbose);
    Ok(())
}
