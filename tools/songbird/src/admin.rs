use crate::backup::BackupManager;
use crate::checkpoint::CheckpointStore;
use crate::config::{load_config, CliOverrides};
use crate::errors::SongbirdError;
use crate::logging::append_run_log;
use crate::runtime::Runtime;
use crate::start_run_log;
use clap::{error::ErrorKind, Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};

/// Maintenance commands for backups and the recording checkpoint
#[derive(Debug, Clone, Parser)]
#[command(name = "songbird-admin")]
#[command(about = "Backup and checkpoint maintenance for songbird sessions")]
pub struct AdminCli {
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: AdminCommand,
}

#[derive(Debug, Clone, Subcommand)]
pub enum AdminCommand {
    /// Results directory snapshots
    #[command(subcommand)]
    Backup(BackupCommand),
    /// Recording checkpoint
    #[command(subcommand)]
    Checkpoint(CheckpointCommand),
}

#[derive(Debug, Clone, Subcommand)]
pub enum BackupCommand {
    /// List snapshots, oldest first
    List {
        #[arg(long)]
        name: Option<String>,
    },
    /// Totals per snapshot name
    Stats,
    /// Snapshot the results directory now
    Create {
        #[arg(long)]
        name: Option<String>,
    },
    /// Replace the results directory with the newest snapshot
    Restore {
        #[arg(long)]
        name: Option<String>,
        /// Do not ask for confirmation
        #[arg(long, default_value_t = false)]
        force: bool,
    },
}

#[derive(Debug, Clone, Subcommand)]
pub enum CheckpointCommand {
    /// Task counts by status
    Summary,
    /// Move every failed task back to pending
    ResetFailed,
    /// Delete the checkpoint file
    Clean,
    /// Write the pipe-delimited progress file
    ExportLegacy { path: PathBuf },
}

pub fn run() -> Result<i32, SongbirdError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| SongbirdError::Io(e.to_string()))?;
    run_with_runtime(&args, &cwd, &Runtime::new())
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    cwd: &Path,
    runtime: &Runtime,
) -> Result<i32, SongbirdError> {
    let cli = match AdminCli::try_parse_from(args) {
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
    start_run_log(&cfg, &paths, runtime, false)?;
    append_run_log(
        "info",
        "admin.command",
        json!({ "command": format!("{:?}", cli.command) }),
    );
    let say = |line: String| runtime.terminal.write_line(&line);

    match cli.command {
        AdminCommand::Backup(command) => {
            let backups = BackupManager::new(
                &paths.backup_dir,
                cfg.backup.retention,
                cfg.backup.checksums,
                runtime.clock.clone(),
            );
            let default_name = cfg.backup.target_name.clone();
            match command {
                BackupCommand::List { name } => {
                    let records = backups.list_backups(name.as_deref())?;
                    if records.is_empty() {
                        say("no backups".to_string())?;
                    }
                    for record in records {
                        say(format!(
                            "{}\t{}\t{} files\t{} bytes\t{}",
                            record.name,
                            record.created_at,
                            record.file_count,
                            record.size_bytes,
                            record.path.display()
                        ))?;
                    }
                }
                BackupCommand::Stats => {
                    let stats = backups.stats()?;
                    say(format!(
                        "{} backups, {} bytes under {}",
                        stats.total_backups,
                        stats.total_bytes,
                        backups.root().display()
                    ))?;
                    for (name, entry) in stats.by_name {
                        say(format!(
                            "{name}: {} backups, {} bytes, newest {}",
                            entry.count,
                            entry.size_bytes,
                            entry.newest.as_deref().unwrap_or("-")
                        ))?;
                    }
                }
                BackupCommand::Create { name } => {
                    let name = name.unwrap_or(default_name);
                    match backups.create_backup(&paths.results_dir, &name)? {
                        Some(record) => say(format!(
                            "created {} ({} files)",
                            record.path.display(),
                            record.file_count
                        ))?,
                        None => say(format!(
                            "nothing to back up in {}",
                            paths.results_dir.display()
                        ))?,
                    }
                }
                BackupCommand::Restore { name, force } => {
                    let name = name.unwrap_or(default_name);
                    let record = backups.restore_backup(
                        &name,
                        &paths.results_dir,
                        force,
                        runtime.terminal.as_ref(),
                    )?;
                    say(format!(
                        "restored {} into {}",
                        record.path.display(),
                        paths.results_dir.display()
                    ))?;
                }
            }
        }
        AdminCommand::Checkpoint(command) => {
            if !runtime.file_system.exists(&paths.checkpoint_path) {
                say(format!("no checkpoint at {}", paths.checkpoint_path.display()))?;
                return Ok(0);
            }
            let mut store = CheckpointStore::open(
                &paths.checkpoint_path,
                runtime.file_system.clone(),
                runtime.clock.clone(),
            )?;
            match command {
                CheckpointCommand::Summary => {
                    let counts = store.summary();
                    let metadata = store.metadata();
                    say(format!(
                        "session {} (runs: {}, updated {})",
                        metadata.session_state.as_str(),
                        metadata.sessions_started,
                        metadata.last_updated
                    ))?;
                    say(format!(
                        "{} tasks: {} completed, {} failed, {} pending, {} running",
                        counts.total(),
                        counts.completed,
                        counts.failed,
                        counts.pending,
                        counts.running
                    ))?;
                    for task in store.failed_tasks() {
                        say(format!(
                            "  failed {} {} {} {}: {}",
                            task.task_id,
                            task.speaker,
                            task.mode,
                            task.source_file,
                            task.last_error.as_deref().unwrap_or("")
                        ))?;
                    }
                }
                CheckpointCommand::ResetFailed => {
                    let reset = store.reset_failed()?;
                    say(format!("reset {reset} failed tasks to pending"))?;
                }
                CheckpointCommand::Clean => {
                    store.clean()?;
                    say(format!("removed {}", paths.checkpoint_path.display()))?;
                }
                CheckpointCommand::ExportLegacy { path } => {
                    let target = if path.is_absolute() {
                        path
                    } else {
                        cwd.join(path)
                    };
                    let written = store.export_legacy(&target)?;
                    say(format!("wrote {written} tasks to {}", target.display()))?;
                }
            }
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_subcommands() {
        let cli = AdminCli::try_parse_from([
            "songbird-admin",
            "backup",
            "restore",
            "--name",
            "recordings",
            "--force",
        ])
        .expect("parse");
        assert!(matches!(
            cli.command,
            AdminCommand::Backup(BackupCommand::Restore { force: true, .. })
        ));

        let cli = AdminCli::try_parse_from([
            "songbird-admin",
            "checkpoint",
            "export-legacy",
            "progress.txt",
            "--config",
            "rig.toml",
        ])
        .expect("parse");
        assert_eq!(cli.config, Some(PathBuf::from("rig.toml")));
        assert!(matches!(
            cli.command,
            AdminCommand::Checkpoint(CheckpointCommand::ExportLegacy { .. })
        ));
    }

    #[test]
    fn reset_failed_and_export_legacy_operate_on_the_session_checkpoint() {
        use crate::runtime::{FakeClock, FakeProcessRunner, FakeTerminal, ProductionFileSystem};
        use crate::serial::FakeControlChannel;
        use std::sync::Arc;

        let temp = tempfile::tempdir().expect("tempdir");
        let checkpoint = temp.path().join("audio/recordings/.songbird-checkpoint.json");
        let clock = FakeClock::default();
        let terminal = FakeTerminal::new(false);
        let runtime = Runtime {
            clock: Arc::new(clock.clone()),
            file_system: Arc::new(ProductionFileSystem),
            process_runner: Arc::new(FakeProcessRunner::default()),
            terminal: Arc::new(terminal.clone()),
            control_channel: Arc::new(FakeControlChannel::default()),
        };
        {
            let mut store = CheckpointStore::open(
                &checkpoint,
                runtime.file_system.clone(),
                runtime.clock.clone(),
            )
            .expect("open");
            let id = store
                .register_task("s1", "noise", "a.wav", Path::new("/r/s1/a_noise.wav"))
                .expect("register");
            store.mark_running(&id).expect("running");
            store.mark_failed(&id, "file too small").expect("failed");
        }

        let args = |rest: &[&str]| {
            std::iter::once("songbird-admin")
                .chain(rest.iter().copied())
                .map(std::ffi::OsString::from)
                .collect::<Vec<_>>()
        };
        run_with_runtime(&args(&["checkpoint", "reset-failed"]), temp.path(), &runtime)
            .expect("reset");
        run_with_runtime(
            &args(&["checkpoint", "export-legacy", "progress.txt"]),
            temp.path(),
            &runtime,
        )
        .expect("export");

        let lines = terminal.written_lines();
        assert!(lines.contains(&"reset 1 failed tasks to pending".to_string()));
        let exported = std::fs::read_to_string(temp.path().join("progress.txt")).expect("export");
        assert!(exported.contains("s1|noise|a.wav|/r/s1/a_noise.wav|pending|"));
    }

    #[test]
    fn missing_subcommand_is_a_cli_error() {
        let err = run_with_runtime(
            &["songbird-admin".into()],
            Path::new("/"),
            &Runtime::new(),
        )
        .expect_err("no subcommand");
        assert!(matches!(err, SongbirdError::Cli(_)));
    }
}
