/// Job Pipeline - From Queue Payload to Stored Response
///
/// **Flow:**
/// 1. Stage the workspace (directories, marker, script, request, input image)
/// 2. Run the script on the process's sandbox backend
/// 3. Log the outcome (failure taxonomy, retry-chain session)
/// 4. Build the [`JobResponse`] for the caller
///
/// **Invariant:**
/// The workspace's `.active` marker is held by a guard that lives until the
/// result is computed, so it disappears on every path. The directory itself
/// stays for the caller to collect outputs and is reclaimed by the sweep.

use crate::metrics;
use crate::runtime::Runtime;
use crate::sandbox::{run_in_sandbox, SandboxJob};
use crate::workspace::{ActiveMarker, JobWorkspace, WorkspaceManager};
use anyhow::{Context, Result};
use scriptbox_common::classify::{self, ErrorCategory};
use scriptbox_common::execution_log::{
    ExecutionLogStore, FailureRecord, LoggedAttempt, SuccessRecord,
};
use scriptbox_common::types::{
    ExecutionResult, ExecutionStatus, JobRequest, JobResponse, NO_EXIT_CODE,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Everything a job needs, shared by all in-flight jobs.
pub struct JobContext {
    pub runtime: Runtime,
    pub workspaces: WorkspaceManager,
    pub logs: Arc<ExecutionLogStore>,
    pub default_timeout: Duration,
}

/// Max characters of error output quoted in a failure's message.
const ERROR_EXCERPT_CHARS: usize = 200;

#[instrument(skip(ctx, job), fields(job_id = %job.id, runtime = %ctx.runtime.kind()))]
pub async fn process_job(ctx: Arc<JobContext>, job: JobRequest) -> JobResponse {
    let started = Instant::now();
    let timeout = job
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(ctx.default_timeout);

    info!(
        code_size = job.code.len(),
        timeout_secs = timeout.as_secs(),
        session_id = job.session_id.as_deref().unwrap_or(""),
        "Processing job"
    );

    let (result, output_files) = match stage(&ctx, &job).await {
        Ok((workspace, marker)) => {
            let request_json = request_json(&job);
            let sandbox_job = SandboxJob::new(job.id, &workspace, job.code.clone(), request_json);
            let result = run_in_sandbox(ctx.runtime.backend(), &sandbox_job, timeout).await;
            let output_files = workspace.output_files();
            drop(marker);
            (result, output_files)
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "Failed to stage job workspace");
            (
                ExecutionResult::failed(format!("Failed to prepare job workspace: {:#}", e)),
                Vec::new(),
            )
        }
    };

    let elapsed = started.elapsed();
    let execution_ms = elapsed.as_millis() as u64;
    info!(
        status = %result.status,
        exit_code = result.exit_code,
        execution_ms,
        output_files = output_files.len(),
        "Execution completed"
    );

    let (logged, error_category) =
        record_outcome(&ctx, &job, &result, &output_files, elapsed).await;

    metrics::record_job(
        ctx.runtime.kind().as_str(),
        &result.status.to_string(),
        elapsed.as_secs_f64(),
    );

    JobResponse {
        job_id: job.id,
        runtime: ctx.runtime.kind().to_string(),
        log_id: logged.as_ref().map(|l| l.log_id.clone()),
        session_id: logged.map(|l| l.session_id),
        error_category: error_category.map(|c| c.to_string()),
        result,
        output_files,
        execution_time_ms: execution_ms,
    }
}

/// Create the workspace, mark it active, write the inputs. Blocking I/O runs
/// off the async executor. A workspace that fails to stage is removed.
async fn stage(ctx: &JobContext, job: &JobRequest) -> Result<(JobWorkspace, ActiveMarker)> {
    let workspaces = ctx.workspaces.clone();
    let job = job.clone();
    tokio::task::spawn_blocking(move || -> Result<(JobWorkspace, ActiveMarker)> {
        let workspace = workspaces.create(&job.id)?;
        let staged = workspace.mark_active().and_then(|marker| {
            workspace.write_script(&job.code)?;
            workspace.write_request(&request_json(&job))?;
            if let Some(image) = &job.input_image {
                workspace.stage_input_image(image)?;
            }
            Ok(marker)
        });
        match staged {
            Ok(marker) => {
                debug!(dir = %workspace.dir().display(), "Workspace staged");
                Ok((workspace, marker))
            }
            Err(e) => {
                // Nothing will run here, so the half-staged tree can go now
                if let Err(cleanup) = workspace.teardown() {
                    warn!(error = %format!("{:#}", cleanup), "Failed to remove half-staged workspace");
                }
                Err(e)
            }
        }
    })
    .await
    .context("Workspace staging task panicked")?
}

/// The request context handed to the script; `{}` when the caller sent none.
fn request_json(job: &JobRequest) -> String {
    if job.request_context.is_null() {
        return "{}".to_string();
    }
    serde_json::to_string_pretty(&job.request_context).unwrap_or_else(|_| "{}".to_string())
}

/// Message recorded for a script that exited non-zero.
pub fn failure_message(exit_code: i64, error_text: &str) -> String {
    let excerpt: String = error_text.chars().take(ERROR_EXCERPT_CHARS).collect();
    format!("Script exited with code {}. Error: {}", exit_code, excerpt)
}

async fn record_outcome(
    ctx: &JobContext,
    job: &JobRequest,
    result: &ExecutionResult,
    output_files: &[String],
    elapsed: Duration,
) -> (Option<LoggedAttempt>, Option<ErrorCategory>) {
    let image_filename = job
        .input_image
        .as_ref()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned());

    let (record, category) = match result.status {
        ExecutionStatus::Success => (
            Outcome::Success(SuccessRecord {
                code: job.code.clone(),
                output_files: output_files.to_vec(),
                session_id: job.session_id.clone(),
                previous_attempt_id: job.previous_attempt_id.clone(),
                stdout: Some(result.stdout.clone()),
                execution_time_seconds: Some(elapsed.as_secs_f64()),
                user_prompt: job.user_prompt.clone(),
                ai_model: job.ai_model.clone(),
                image_filename,
                tags: None,
            }),
            None,
        ),
        ExecutionStatus::Timeout | ExecutionStatus::Failed => {
            // Combined-only logs (Kubernetes) carry runner output and echoed
            // source; only the failure tail is treated as error text.
            let streams_split = !result.stderr.trim().is_empty();
            let stderr = if streams_split {
                result.stderr.clone()
            } else {
                classify::failure_excerpt(&result.logs).to_string()
            };
            let stdout = if streams_split || !result.stdout.is_empty() {
                result.stdout.clone()
            } else {
                result.logs.clone()
            };
            let (error_message, category) = if result.status == ExecutionStatus::Timeout {
                (result.stderr.clone(), ErrorCategory::Timeout)
            } else if result.exit_code == NO_EXIT_CODE {
                // Host-side failure: the script never produced an exit code
                (stderr.clone(), classify::classify_error(&stderr, &stderr))
            } else {
                let message = failure_message(result.exit_code, &stderr);
                let category = classify::classify_error(&message, &stderr);
                (message, category)
            };
            (
                Outcome::Failure(FailureRecord {
                    code: job.code.clone(),
                    error_message,
                    stderr,
                    return_code: result.exit_code,
                    session_id: job.session_id.clone(),
                    previous_attempt_id: job.previous_attempt_id.clone(),
                    error_category: Some(category),
                    stdout: Some(stdout),
                    user_prompt: job.user_prompt.clone(),
                    ai_model: job.ai_model.clone(),
                    image_filename,
                    tags: None,
                }),
                Some(category),
            )
        }
    };

    let store = Arc::clone(&ctx.logs);
    let logged = tokio::task::spawn_blocking(move || match record {
        Outcome::Success(record) => store.log_success(record),
        Outcome::Failure(record) => store.log_failure(record),
    })
    .await;

    match logged {
        Ok(Ok(attempt)) => (Some(attempt), category),
        Ok(Err(e)) => {
            warn!(error = %format!("{:#}", e), "Failed to write execution log");
            (None, category)
        }
        Err(e) => {
            warn!(error = %e, "Execution log task panicked");
            (None, category)
        }
    }
}

enum Outcome {
    Success(SuccessRecord),
    Failure(FailureRecord),
}
