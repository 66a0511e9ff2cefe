use crate::cancel::CancelToken;
use crate::config::PipelineStageConfig;
use crate::errors::SongbirdError;
use crate::logging::append_run_log;
use crate::runtime::{wait_with_deadline, Clock, ProcessRequest, ProcessRunner, WaitOutcome};
use crate::types::SessionPaths;
use serde_json::json;
use std::time::Duration;

/// Upper bound for stages without an explicit timeout.
const UNBOUNDED_STAGE: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome {
    pub name: String,
    pub exit_code: i32,
}

fn expand(arg: &str, paths: &SessionPaths) -> String {
    arg.replace("{working_dir}", &paths.working_dir.display().to_string())
        .replace("{results_dir}", &paths.results_dir.display().to_string())
}

/// Runs each external stage in order from the working directory. The first non-zero
/// exit stops the pipeline.
pub fn run_pipeline(
    stages: &[PipelineStageConfig],
    paths: &SessionPaths,
    runner: &dyn ProcessRunner,
    clock: &dyn Clock,
    cancel: &CancelToken,
) -> Result<Vec<StageOutcome>, SongbirdError> {
    let mut outcomes = Vec::new();
    for stage in stages {
        cancel.check()?;
        let mut request = ProcessRequest::new(
            stage.program.clone(),
            stage.args.iter().map(|arg| expand(arg, paths)),
        );
        request.cwd = Some(paths.working_dir.clone());
        append_run_log(
            "info",
            "pipeline.stage.started",
            json!({ "stage": stage.name, "command": request.display() }),
        );

        let limit = stage
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(UNBOUNDED_STAGE);
        let handle = runner
            .spawn(request)
            .map_err(|e| SongbirdError::Pipeline(format!("{} failed to start: {e}", stage.name)))?;
        let output = match wait_with_deadline(runner, clock, handle, clock.now() + limit, cancel)? {
            WaitOutcome::Exited(output) => output,
            WaitOutcome::TimedOut => {
                return Err(SongbirdError::Pipeline(format!(
                    "{} timed out after {}s",
                    stage.name,
                    limit.as_secs()
                )))
            }
            WaitOutcome::Cancelled => {
                return Err(SongbirdError::Cancelled(
                    cancel.reason().unwrap_or_else(|| "interrupted".to_string()),
                ))
            }
        };

        append_run_log(
            if output.success() { "info" } else { "error" },
            "pipeline.stage.finished",
            json!({ "stage": stage.name, "exit_code": output.exit_code }),
        );
        if !output.success() {
            return Err(SongbirdError::Pipeline(format!(
                "{} exited {}: {}",
                stage.name,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        outcomes.push(StageOutcome {
            name: stage.name.clone(),
            exit_code: output.exit_code,
        });
    }
    Ok(outcomes)
}
