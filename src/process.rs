//! Subprocess execution helpers.
//!
//! The teacher's `git.rs`/`test.rs` reference `crate::process::{CommandExt,
//! OutputExt, SyncCommandExt}` but that module isn't present in this
//! retrieval snapshot. Rebuilt here in the same idiom: thin extension
//! traits over `tokio::process::Command`/`std::process::Output`, plus the
//! "run with a deadline, SIGINT on expiry" helper spec.md §4.3/§4.4 need
//! for build and test jobs.

use std::pin::pin;
use std::process::{ExitStatus, Output};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::future::{self, Either};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::time::sleep;

/// Extension for `std::process::Output`/`ExitStatus`: get an exit code
/// without silently treating "killed by signal" as success.
pub trait OutputExt {
    fn code_not_killed(&self) -> Result<i32>;
}

impl OutputExt for Output {
    fn code_not_killed(&self) -> Result<i32> {
        self.status.code_not_killed()
    }
}

impl OutputExt for ExitStatus {
    fn code_not_killed(&self) -> Result<i32> {
        self.code()
            .ok_or_else(|| anyhow!("process was killed by a signal"))
    }
}

/// Extension for `tokio::process::Command`: spawn-and-wait with a single
/// call, capturing output.
pub trait CommandExt {
    async fn execute(&mut self) -> Result<Output>;
}

impl CommandExt for Command {
    async fn execute(&mut self) -> Result<Output> {
        let output = self.output().await.context("spawning process")?;
        Ok(output)
    }
}

/// The outcome of running a job with a deadline.
#[derive(Debug)]
pub enum DeadlineOutcome {
    Completed(Output),
    TimedOut,
}

/// Runs `cmd`, killing it with SIGINT if `deadline` elapses first. Used by
/// the Build Worker's hard 30 minute timeout and the Test Worker's
/// whole-job/single-subtest deadlines (spec.md §4.3, §4.4).
pub async fn run_with_deadline(cmd: Command, deadline: Duration) -> Result<DeadlineOutcome> {
    let (child, pid) = spawn_with_pid(cmd)?;
    let child_fut = pin!(child.wait_with_output());
    let deadline_fut = pin!(sleep(deadline));
    match future::select(child_fut, deadline_fut).await {
        Either::Left((result, _)) => Ok(DeadlineOutcome::Completed(
            result.context("waiting for child process")?,
        )),
        Either::Right((_, child_fut)) => {
            interrupt(pid).ok();
            // Still need to reap the child so it doesn't become a zombie.
            let _ = child_fut.await;
            Ok(DeadlineOutcome::TimedOut)
        }
    }
}

/// Spawns a child and returns it along with its PID, for callers (build
/// and test workers) that need to interrupt it cooperatively on
/// cancellation/timeout rather than just waiting.
pub fn spawn_with_pid(mut cmd: Command) -> Result<(Child, Pid)> {
    let child = cmd.spawn().context("spawning child process")?;
    let pid = Pid::from_raw(
        child
            .id()
            .ok_or_else(|| anyhow!("no PID for spawned child"))?
            .try_into()
            .context("PID out of range")?,
    );
    Ok((child, pid))
}

pub fn interrupt(pid: Pid) -> Result<()> {
    kill(pid, Signal::SIGINT).context("sending SIGINT to child")
}

pub fn force_kill(pid: Pid) -> Result<()> {
    kill(pid, Signal::SIGKILL).context("sending SIGKILL to child")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execute_captures_output() {
        let mut cmd = Command::new("echo");
        cmd.arg("hello");
        let output = cmd.execute().await.unwrap();
        assert_eq!(output.code_not_killed().unwrap(), 0);
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
    }

    #[tokio::test]
    async fn deadline_completes_fast_jobs() {
        let cmd = Command::new("true");
        let outcome = run_with_deadline(cmd, Duration::from_secs(5))
            .await
            .unwrap();
        match outcome {
            DeadlineOutcome::Completed(out) => assert_eq!(out.code_not_killed().unwrap(), 0),
            DeadlineOutcome::TimedOut => panic!("should not time out"),
        }
    }

    #[tokio::test]
    async fn deadline_fires_on_slow_jobs() {
        let mut cmd = Command::new("sleep");
        cmd.arg("10");
        let outcome = run_with_deadline(cmd, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(matches!(outcome, DeadlineOutcome::TimedOut));
    }
}
