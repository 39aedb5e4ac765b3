//! Build Worker Pool (spec.md §4.3).
//!
//! One worker per build slot pulls a `(WorkItem, distro)` pair off the
//! Build Queue, runs the distro's build script under a 30 minute deadline,
//! classifies the exit code, and feeds the result back through
//! `WorkItem::update_build_status`. Grounded on `mybuilder.py`'s exit-code
//! handling and the teacher's worker-loop shape in `test.rs`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use lazy_static::lazy_static;
use log::{info, warn};
use regex::Regex;
use tokio::process::Command;

use crate::external::build_annotations;
use crate::process::{run_with_deadline, DeadlineOutcome, OutputExt};
use crate::work_item::{truncate_excerpt, WorkItem};

/// Hard wall-clock limit on a single distro build (spec.md §4.3).
pub const BUILD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const MAX_CAPTURE_GRAPHEMES: usize = 8000;

/// Exit-code taxonomy (spec.md §4.3 verbatim): 0 success; 10 (git-checkout
/// error) and anything else unrecognised are retryable -- re-enqueue the
/// same job rather than reporting it as a patch defect; 12 is a terminal
/// configure error; 14 is a terminal compile error whose stderr gets
/// parsed into per-file per-line review annotations. A deadline expiry is
/// tracked separately (`Timeout`), also terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildExit {
    Success,
    ConfigureError,
    CompileError,
    Retryable(i32),
    Timeout,
}

impl BuildExit {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => BuildExit::Success,
            12 => BuildExit::ConfigureError,
            14 => BuildExit::CompileError,
            other => BuildExit::Retryable(other),
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, BuildExit::Success)
    }

    /// Whether this outcome should be reported to `UpdateBuildStatus` at
    /// all, vs re-enqueued as the same job (spec.md §4.3).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildExit::Retryable(_))
    }
}

lazy_static! {
    /// `path:line: severity: message` compiler diagnostic line, per
    /// `mybuilder.py`'s annotation extraction.
    static ref COMPILE_ERROR_RE: Regex =
        Regex::new(r"(?m)^([^:\n]+):(\d+):\s*(error|warning):\s*(.+)$").unwrap();
}

/// Parses compiler diagnostics out of raw build stderr (spec.md §4.3 step
/// 3). Paths are resolved against the change's file list by
/// `external::build_annotations`.
pub fn parse_compile_errors(
    stderr: &str,
    changed_files: &[String],
) -> Vec<crate::work_item::ReviewAnnotation> {
    let raw = COMPILE_ERROR_RE
        .captures_iter(stderr)
        .filter_map(|c| {
            let line: u32 = c[2].parse().ok()?;
            Some((c[1].to_string(), line, c[3].to_string(), c[4].to_string()))
        })
        .collect();
    build_annotations(raw, changed_files)
}

/// One unit of build work: a distro to build against a Work Item's
/// change, resolved to a concrete build script invocation.
pub struct BuildJob {
    pub item: Arc<WorkItem>,
    pub distro: String,
    pub build_script: PathBuf,
    pub worktree: PathBuf,
}

/// Runs a single build job to completion, updating `item`'s build record.
/// Returns the classified exit outcome for the caller's retry/abort logic.
pub async fn run_build_job(job: BuildJob) -> Result<BuildExit> {
    if job.item.is_aborted() {
        return Ok(BuildExit::Success);
    }

    let mut cmd = Command::new(&job.build_script);
    cmd.arg(&job.distro).current_dir(&job.worktree);

    let outcome = run_with_deadline(cmd, BUILD_TIMEOUT).await?;

    let (exit, stdout, stderr) = match outcome {
        DeadlineOutcome::TimedOut => (BuildExit::Timeout, None, None),
        DeadlineOutcome::Completed(output) => {
            let code = output.code_not_killed().unwrap_or(-1);
            let stdout = truncate_excerpt(
                &String::from_utf8_lossy(&output.stdout),
                MAX_CAPTURE_GRAPHEMES,
            );
            let stderr = truncate_excerpt(
                &String::from_utf8_lossy(&output.stderr),
                MAX_CAPTURE_GRAPHEMES,
            );
            (BuildExit::from_code(code), Some(stdout), Some(stderr))
        }
    };

    info!(
        "build {} for change {} distro {}: {:?}",
        job.item
            .build_number()
            .map(|n| n.to_string())
            .unwrap_or_else(|| "?".to_string()),
        job.item.change_id().change_number,
        job.distro,
        exit
    );

    if !exit.is_terminal() {
        // Retryable: leave the BuildRecord untouched for the caller to
        // re-enqueue the same job, rather than reporting a patch defect.
        return Ok(exit);
    }

    let changed_files = job.item.state.lock().change.changed_files.clone();
    let annotations = stderr
        .as_deref()
        .map(|s| parse_compile_errors(s, &changed_files))
        .unwrap_or_default();

    let message = match exit {
        BuildExit::Success => "build succeeded".to_string(),
        BuildExit::CompileError => "build failed: compile error".to_string(),
        BuildExit::ConfigureError => "build failed: configure error".to_string(),
        BuildExit::Timeout => format!("build timed out after {:?}", BUILD_TIMEOUT),
        BuildExit::Retryable(_) => unreachable!("retryable handled above"),
    };

    if exit.is_failure() {
        warn!("build failure annotations: {} found", annotations.len());
    }

    job.item.update_build_status(
        &job.distro,
        message,
        exit.is_failure(),
        matches!(exit, BuildExit::Timeout),
        stdout,
        stderr,
        annotations,
    );

    Ok(exit)
}
