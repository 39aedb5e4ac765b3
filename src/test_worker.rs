//! Test Worker Pool (spec.md §4.4).
//!
//! One worker owns a two-node VM cluster slot drawn from a `Pool`. It
//! boots the server and client (external hypervisor-invocation commands,
//! per the non-goal "running the tests itself... delegates to external
//! executables"), drives the test harness over an external `ssh`
//! invocation, watches both consoles for crash/kdump markers via
//! [`crate::console`], and on exit parses `results.yml` -- falling back
//! to [`sanitize_results_yaml`] once, grounded on `myyamlsanitizer.py` --
//! before calling `UpdateTestStatus`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use itertools::Itertools;
use log::{info, warn};
use regex::Regex;
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::sleep;

use crate::crash_analyzer::{CrashJob, CrashOutcomeKind};
use crate::external::CrashDatabase;
use crate::pool::Pool;
use crate::process::spawn_with_pid;
use crate::queue::WorkQueue;
use crate::work_item::{SubtestResults, TestAxes, TestOutcome, WorkItem};

/// One entry from `console_errors_lookup.json`/`suite_errors_lookup.json`
/// (spec.md §6, §4.4 step 7).
#[derive(Debug, Clone, Deserialize)]
pub struct WarningEntry {
    pub error: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub fatal: Option<bool>,
    #[serde(default)]
    pub warn: Option<bool>,
}

/// Finds every warning-catalogue entry whose `error` substring appears
/// in `text`, rendering each as its configured message (or the raw
/// pattern if it has none).
fn scan_for_warnings(text: &str, catalogue: &[WarningEntry]) -> Vec<String> {
    catalogue
        .iter()
        .filter(|e| text.contains(e.error.as_str()))
        .map(|e| e.message.clone().unwrap_or_else(|| e.error.clone()))
        .collect()
}

/// Exponential backoff for retryable failures: starts at 15s, doubles
/// each attempt, caps at 10 minutes (spec.md §4.4 "Retry discipline").
pub fn retry_backoff(attempt: u32) -> Duration {
    let secs = 15u64.saturating_mul(1u64 << attempt.min(20));
    Duration::from_secs(secs.min(600))
}

/// Bound on a test's per-work-item retry counter; exceeding it retires
/// the test as failed (spec.md §4.4).
pub const MAX_RETRIES: u32 = 30;

/// A two-node cluster slot: the external commands used to boot each
/// node, and their identities for SSH/env composition.
#[derive(Debug, Clone)]
pub struct ClusterSlot {
    pub server_boot_cmd: Vec<String>,
    pub client_boot_cmd: Vec<String>,
    pub server_hostname: String,
    pub client_hostname: String,
}

/// Paths to the kernel/initrd/rootfs artifacts a test job needs present
/// before it can boot a cluster (spec.md §4.4 step 1).
#[derive(Debug, Clone)]
pub struct Artifacts {
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    pub rootfs: PathBuf,
}

impl Artifacts {
    pub fn all_exist(&self) -> bool {
        self.kernel.exists() && self.initrd.exists() && self.rootfs.exists()
    }
}

/// One unit of test work (spec.md §4.4).
pub struct TestJob {
    pub item: Arc<WorkItem>,
    pub script: String,
    pub axes: TestAxes,
    pub artifacts: Artifacts,
    pub results_dir: PathBuf,
    pub whole_job_timeout: Duration,
    pub subtest_timeout: Duration,
    pub extra_env: HashMap<String, String>,
    pub test_command: String,
    /// Forwarded verbatim to a `CrashJob` on a crash/timeout sighting
    /// (spec.md §4.5 step 1).
    pub decoder_cmd: Vec<String>,
    /// Loaded once at startup from `console_errors_lookup.json` /
    /// `suite_errors_lookup.json` (spec.md §4.4 step 7, §6).
    pub warning_catalogue: Arc<Vec<WarningEntry>>,
}

/// Why a test job ended, driving the retry-vs-terminal decision (spec.md
/// §4.4 steps 3/5/10, "Retryable infrastructure failure").
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed {
        /// Unclassified subtest buckets straight off `results.yml`;
        /// `record_outcome` cross-checks `failing` against the historical
        /// DB before the Work Item ever sees new-vs-known (spec.md §4.4
        /// step 6).
        passed: Vec<String>,
        skipped: Vec<String>,
        failing: Vec<String>,
        failed: bool,
        message: String,
    },
    Crashed { message: String },
    TimedOut,
    Retryable { reason: String },
    MissingArtifacts,
    Aborted,
}

const LOGIN_PROMPT: &str = "login:";
const EMERGENCY_SHELL: &str = "Entering emergency mode. Exit the shell to continue";
const NBD_CONFLICT: &str = "nbd: nbd0 already in use";
const KDUMP_START: &str = "irqpoll nr_cpus=1 reset_devices";
const KDUMP_END: &str = "kdump: saving vmcore complete";
const TEST_MARKER: &str = "Lustre: DEBUG MARKER: == ";

const LOGIN_DEADLINE: Duration = Duration::from_secs(300);
const KDUMP_DEADLINE: Duration = Duration::from_secs(300);

/// Waits for a node's console log to show a login prompt, an emergency
/// shell, or a known port conflict, polling every second up to
/// `LOGIN_DEADLINE` (spec.md §4.4 step 3).
async fn wait_for_login(console_path: &PathBuf) -> Result<()> {
    let deadline = tokio::time::Instant::now() + LOGIN_DEADLINE;
    loop {
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("timed out waiting for login prompt");
        }
        if let Ok(content) = tokio::fs::read_to_string(console_path).await {
            if content.contains(EMERGENCY_SHELL) {
                anyhow::bail!("emergency shell detected");
            }
            if content.contains(NBD_CONFLICT) {
                anyhow::bail!("nbd0 already in use");
            }
            if content.contains(LOGIN_PROMPT) {
                return Ok(());
            }
        }
        sleep(Duration::from_secs(1)).await;
    }
}

/// Scans a console log tail for the kdump start marker, then (if found)
/// polls for the completion marker up to `KDUMP_DEADLINE` (spec.md §4.4
/// step 5).
async fn watch_for_kdump(console_path: &PathBuf) -> Option<bool> {
    let content = tokio::fs::read_to_string(console_path).await.ok()?;
    if !content.contains(KDUMP_START) {
        return None;
    }
    let deadline = tokio::time::Instant::now() + KDUMP_DEADLINE;
    loop {
        if tokio::time::Instant::now() >= deadline {
            return Some(false);
        }
        if let Ok(content) = tokio::fs::read_to_string(console_path).await {
            if content.contains(KDUMP_END) {
                return Some(true);
            }
        }
        sleep(Duration::from_secs(5)).await;
    }
}

/// Boots one node, writing its console output to `console_path`, and
/// returns once the login prompt (or a fatal boot condition) is seen.
async fn boot_node(boot_cmd: &[String], console_path: &PathBuf) -> Result<tokio::process::Child> {
    let console_file = std::fs::File::create(console_path).context("creating console log")?;
    let mut cmd = Command::new(&boot_cmd[0]);
    cmd.args(&boot_cmd[1..])
        .stdout(console_file.try_clone().context("cloning console fd")?)
        .stderr(console_file);
    let (child, _pid) = spawn_with_pid(cmd)?;
    wait_for_login(console_path).await?;
    Ok(child)
}

/// Runs a single test job end to end against a VM cluster slot (spec.md
/// §4.4 steps 1-10).
pub async fn run_test_job(
    job: TestJob,
    cluster_pool: &Pool<ClusterSlot>,
    crash_db: &Arc<dyn CrashDatabase>,
    crash_queue: &Arc<WorkQueue<CrashJob>>,
) -> Result<JobOutcome> {
    if job.item.is_aborted() {
        return Ok(JobOutcome::Aborted);
    }
    if !job.artifacts.all_exist() {
        return Ok(JobOutcome::MissingArtifacts);
    }

    std::fs::create_dir_all(&job.results_dir).context("creating results dir")?;
    job.item
        .acquire_results_dir(&job.script, job.axes, job.results_dir.clone());

    let slot = cluster_pool.get().await;
    let server_console = job.results_dir.join("server-console.txt");
    let client_console = job.results_dir.join("client-console.txt");

    let mut server = match boot_node(&slot.server_boot_cmd, &server_console).await {
        Ok(child) => child,
        Err(e) => return Ok(JobOutcome::Retryable { reason: format!("server boot: {e}") }),
    };
    let mut client = match boot_node(&slot.client_boot_cmd, &client_console).await {
        Ok(child) => child,
        Err(e) => {
            let _ = server.kill().await;
            return Ok(JobOutcome::Retryable { reason: format!("client boot: {e}") });
        }
    };

    let mut env_args: Vec<String> = Vec::new();
    env_args.push(format!("FSTYPE={}", job.axes_fstype_placeholder()));
    for (k, v) in &job.extra_env {
        env_args.push(format!("{k}={v}"));
    }

    let mut harness_cmd = Command::new("ssh");
    harness_cmd
        .arg(&slot.client_hostname)
        .arg(format!(
            "systemctl start kdump; mkdir -p /tmp/testlogs; {} {}",
            env_args.join(" "),
            job.test_command
        ))
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    let (mut harness_child, _harness_pid) = match spawn_with_pid(harness_cmd) {
        Ok(c) => c,
        Err(e) => {
            let _ = server.kill().await;
            let _ = client.kill().await;
            return Ok(JobOutcome::Retryable { reason: format!("spawning harness: {e}") });
        }
    };

    let outcome = poll_job(
        &job,
        &mut harness_child,
        &server_console,
        &client_console,
    )
    .await;

    let _ = server.kill().await;
    let _ = client.kill().await;
    let _ = harness_child.kill().await;

    let outcome = match outcome {
        Ok(o) => o,
        Err(e) => JobOutcome::Retryable { reason: e.to_string() },
    };

    record_outcome(&job, &outcome, crash_db, crash_queue).await;
    Ok(outcome)
}

impl TestJob {
    fn axes_fstype_placeholder(&self) -> &str {
        // The actual fs-type lives on the TestRecord; this mirrors the
        // compose-env step without duplicating TestRecord state here.
        if self.axes.dne { "dne" } else { "plain" }
    }
}

/// Races harness completion against the whole-job deadline, the
/// single-subtest deadline (reset by a console test-progress marker),
/// and a crash sighting on either console -- watched via
/// [`crate::console::watch_console`]'s debounced tail stream rather
/// than a periodic full reread, so a crash is noticed as soon as the
/// console is next quiet instead of up to 5 s late (spec.md §4.4 step
/// 5). kdump detection still needs its own full-file poll: it watches
/// for a start *and* a completion marker over time, which a single
/// crash-starter stream sighting can't express.
async fn poll_job(
    job: &TestJob,
    harness: &mut tokio::process::Child,
    server_console: &PathBuf,
    client_console: &PathBuf,
) -> Result<JobOutcome> {
    let mut last_progress = tokio::time::Instant::now();
    let job_deadline = tokio::time::Instant::now() + job.whole_job_timeout;

    let (_server_watcher, server_stream) = crate::console::watch_console(server_console)?;
    let (_client_watcher, client_stream) = crate::console::watch_console(client_console)?;
    let mut server_stream = pin!(server_stream);
    let mut client_stream = pin!(client_stream);

    loop {
        if job.item.is_aborted() {
            return Ok(JobOutcome::Aborted);
        }
        let now = tokio::time::Instant::now();
        if now >= job_deadline {
            return Ok(JobOutcome::TimedOut);
        }
        if now >= last_progress + job.subtest_timeout {
            return Ok(JobOutcome::TimedOut);
        }

        for console in [server_console, client_console] {
            if let Some(completed) = watch_for_kdump(console).await {
                if !completed {
                    warn!("kdump did not complete within deadline");
                }
                return Ok(JobOutcome::Crashed {
                    message: "kdump triggered".to_string(),
                });
            }
            if let Ok(content) = tokio::fs::read_to_string(console).await {
                if content.contains(TEST_MARKER) {
                    last_progress = tokio::time::Instant::now();
                }
            }
        }

        let remaining = (job_deadline.min(last_progress + job.subtest_timeout))
            .saturating_duration_since(tokio::time::Instant::now())
            .min(Duration::from_secs(5));

        let wait_fut = pin!(harness.wait());
        let tick = pin!(sleep(remaining));
        tokio::select! {
            status = wait_fut => {
                let status = status.context("waiting for harness")?;
                return finish_job(job, status.code().unwrap_or(-1)).await;
            }
            Some(Ok(alert)) = server_stream.next() => {
                warn!("crash pattern in server console: {}", alert.matched_pattern);
                return Ok(JobOutcome::Crashed {
                    message: format!("crash: {}", alert.matched_pattern),
                });
            }
            Some(Ok(alert)) = client_stream.next() => {
                warn!("crash pattern in client console: {}", alert.matched_pattern);
                return Ok(JobOutcome::Crashed {
                    message: format!("crash: {}", alert.matched_pattern),
                });
            }
            () = tick => continue,
        }
    }
}

async fn finish_job(job: &TestJob, exit_code: i32) -> Result<JobOutcome> {
    let yaml_path = job.results_dir.join("results.yml");
    let parsed = if yaml_path.exists() {
        let content = tokio::fs::read_to_string(&yaml_path)
            .await
            .context("reading results.yml")?;
        Some(parse_results_yaml(&content, &job.script)?)
    } else {
        None
    };

    let (subtests_raw, mut failed, mut message) = match parsed {
        Some(p) => (p.subtests, p.failure, p.message),
        None => (Vec::new(), exit_code != 0, String::new()),
    };

    if exit_code != 0 {
        failed = true;
        message = format!("{message} test script terminated with error {exit_code}")
            .trim()
            .to_string();
    } else if !failed && message.is_empty() {
        message = "Success".to_string();
    }

    let (passed, skipped, failing) = split_subtests(subtests_raw);

    Ok(JobOutcome::Completed {
        passed,
        skipped,
        failing,
        failed,
        message,
    })
}

/// Buckets raw `results.yml` subtests into pass/skip/fail, with no
/// historical-DB awareness -- that cross-check happens in
/// [`classify_against_history`] once a `CrashDatabase` handle is
/// available (spec.md §4.4 step 6).
fn split_subtests(raw: Vec<RawSubtest>) -> (Vec<String>, Vec<String>, Vec<String>) {
    let mut passed = Vec::new();
    let mut skipped = Vec::new();
    let mut failing = Vec::new();
    for sub in raw {
        match sub.status.as_str() {
            "PASS" => passed.push(sub.name),
            "SKIP" => skipped.push(sub.name),
            _ => failing.push(sub.name),
        }
    }
    (passed, skipped, failing)
}

/// Cross-checks `failing` against the historical DB, splitting it into
/// `new_failures` (unseen in 30d, not blacklisted) and `known_failures`
/// (with an aggregate sighting count); a blacklisted name is dropped
/// from the report entirely (spec.md §4.4 step 6, §4.5).
async fn classify_against_history(
    crash_db: &Arc<dyn CrashDatabase>,
    branch: &str,
    passed: Vec<String>,
    skipped: Vec<String>,
    failing: Vec<String>,
) -> SubtestResults {
    let mut results = SubtestResults {
        passed,
        skipped,
        new_failures: Vec::new(),
        known_failures: Vec::new(),
    };
    if failing.is_empty() {
        return results;
    }
    match crash_db.classify_failures(branch, &failing).await {
        Ok(classified) => {
            for name in failing {
                match classified.get(&name) {
                    Some(Some(count)) => results.known_failures.push((name, *count)),
                    Some(None) => results.new_failures.push(name),
                    None => {} // blacklisted: excluded from the report
                }
            }
        }
        Err(e) => {
            warn!("classify_failures lookup failed: {e}; treating all failures as new");
            results.new_failures = failing;
        }
    }
    results
}

/// Parsed `results.yml` shape from the external harness (spec.md §4.4
/// step 6).
#[derive(Debug, Deserialize)]
struct YamlResults {
    #[serde(rename = "Tests", default)]
    tests: Vec<YamlTest>,
}

#[derive(Debug, Deserialize)]
struct YamlTest {
    name: String,
    #[serde(default)]
    status: String,
    #[serde(rename = "SubTests", default)]
    subtests: Vec<YamlSubtest>,
}

#[derive(Debug, Deserialize)]
struct YamlSubtest {
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    return_code: Option<i32>,
}

struct RawSubtest {
    name: String,
    status: String,
}

struct ParsedResults {
    subtests: Vec<RawSubtest>,
    failure: bool,
    message: String,
}

/// Parses `results.yml`, falling back to [`sanitize_results_yaml`] once
/// on a parse error (spec.md §4.4 step 6, `mytester.py`'s
/// `yaml.safe_load`/sanitize-and-retry).
fn parse_results_yaml(content: &str, test_script: &str) -> Result<ParsedResults> {
    let parsed: YamlResults = match serde_yaml::from_str(content) {
        Ok(p) => p,
        Err(_) => serde_yaml::from_str(&sanitize_results_yaml(content))
            .context("results.yml unparseable even after sanitising")?,
    };

    let mut subtests = Vec::new();
    let mut failure = false;
    let mut message = String::new();
    for test in parsed.tests {
        if test.name != test_script {
            continue;
        }
        match test.status.as_str() {
            "FAIL" => {
                failure = true;
                message = "Failure".to_string();
            }
            "SKIP" => message = "Skipped".to_string(),
            _ => {}
        }
        for sub in test.subtests {
            let mut status = sub.status.clone();
            if status.is_empty() {
                status = "FAIL".to_string();
            }
            subtests.push(RawSubtest {
                name: sub.name,
                status,
            });
            let _ = sub.error;
            let _ = sub.return_code;
        }
    }
    Ok(ParsedResults {
        subtests,
        failure,
        message,
    })
}

/// Quotes the free-text part of `error:` fields so a results.yml with
/// unescaped quotes/backslashes still parses as YAML, grounded on
/// `myyamlsanitizer.py::sanitize`.
pub fn sanitize_results_yaml(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ERROR_FIELD: Regex = Regex::new(r"(error:)\s*(.*)").unwrap();
    }
    input
        .lines()
        .map(|line| {
            if line.contains("error:") {
                let cleaned = line.replace('\\', "").replace('"', "");
                ERROR_FIELD
                    .replace(&cleaned, |caps: &regex::Captures| {
                        format!("{} \"{}\"", &caps[1], &caps[2])
                    })
                    .into_owned()
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Updates the Work Item with the terminal outcome, or -- on a crash or
/// timeout -- hands the job to the Crash Analyzer Pool instead, which
/// then owns reporting and returning the item to the Manager (spec.md
/// §4.4 steps 5, 9-10; §4.5 step 6).
async fn record_outcome(
    job: &TestJob,
    outcome: &JobOutcome,
    crash_db: &Arc<dyn CrashDatabase>,
    crash_queue: &Arc<WorkQueue<CrashJob>>,
) {
    match outcome {
        JobOutcome::Completed { passed, skipped, failing, failed, message } => {
            let branch = job.item.state.lock().change.branch.clone();
            let subtests = classify_against_history(
                crash_db,
                &branch,
                passed.clone(),
                skipped.clone(),
                failing.clone(),
            )
            .await;
            let warnings = scan_warnings(job, &branch, crash_db).await;
            let test_outcome = if *failed { TestOutcome::Failed } else { TestOutcome::Passed };
            info!("test {} outcome {:?} failed={}", job.script, test_outcome, failed);
            job.item.update_test_status(
                &job.script,
                job.axes,
                test_outcome,
                Some(message.clone()),
                None,
                None,
                Some(subtests),
                warnings,
            );
        }
        JobOutcome::Crashed { .. } | JobOutcome::TimedOut => {
            let kind = if matches!(outcome, JobOutcome::TimedOut) {
                CrashOutcomeKind::TimedOut
            } else {
                CrashOutcomeKind::Crashed
            };
            info!("test {} dispatched to crash analyzer pool ({kind:?})", job.script);
            crash_queue.push(CrashJob {
                item: job.item.clone(),
                script: job.script.clone(),
                axes: job.axes,
                kind,
                console_paths: vec![
                    job.results_dir.join("server-console.txt"),
                    job.results_dir.join("client-console.txt"),
                ],
                decoder_cmd: job.decoder_cmd.clone(),
            });
        }
        JobOutcome::Aborted => {
            job.item.update_test_status(
                &job.script,
                job.axes,
                TestOutcome::Aborted,
                None,
                None,
                None,
                None,
                Vec::new(),
            );
        }
        JobOutcome::Retryable { .. } | JobOutcome::MissingArtifacts => {}
    }
}

/// Scans both consoles for warning-catalogue matches and records each
/// one to the historical DB (spec.md §4.4 step 7).
async fn scan_warnings(
    job: &TestJob,
    branch: &str,
    crash_db: &Arc<dyn CrashDatabase>,
) -> Vec<String> {
    let mut texts = Vec::new();
    for name in ["server-console.txt", "client-console.txt"] {
        if let Ok(content) = tokio::fs::read_to_string(job.results_dir.join(name)).await {
            texts.extend(scan_for_warnings(&content, &job.warning_catalogue));
        }
    }
    texts.sort();
    let texts: Vec<String> = texts.into_iter().unique().collect();

    let mut recorded = Vec::new();
    for text in texts {
        match crash_db.record_warning(branch, &text).await {
            Ok(_) => recorded.push(text),
            Err(e) => warn!("record_warning failed: {e}"),
        }
    }
    recorded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_starts_at_15s_and_caps_at_10min() {
        assert_eq!(retry_backoff(0), Duration::from_secs(15));
        assert_eq!(retry_backoff(1), Duration::from_secs(30));
        assert_eq!(retry_backoff(10), Duration::from_secs(600));
        assert_eq!(retry_backoff(30), Duration::from_secs(600));
    }

    #[test]
    fn sanitizer_quotes_unescaped_error_fields() {
        let input = r#"error: could not run "sanity" test\foo"#;
        let sanitized = sanitize_results_yaml(input);
        assert!(sanitized.contains("error: \""));
        assert!(!sanitized.contains('\\'));
    }

    #[test]
    fn parses_clean_results_yaml() {
        let yaml = "Tests:\n  - name: sanity\n    status: FAIL\n    SubTests:\n      - name: test_1\n        status: PASS\n      - name: test_2\n        status: FAIL\n        error: boom\n        return_code: 1\n";
        let parsed = parse_results_yaml(yaml, "sanity").unwrap();
        assert!(parsed.failure);
        assert_eq!(parsed.subtests.len(), 2);
    }

    #[test]
    fn falls_back_to_sanitizer_on_malformed_yaml() {
        let yaml = "Tests:\n  - name: sanity\n    status: FAIL\n    SubTests:\n      - name: test_1\n        status: FAIL\n        error: bad \"quote\" and \\backslash\n";
        // The unsanitised version would fail to parse because of the
        // embedded quote inside an unquoted scalar; the sanitizer strips
        // both backslashes and quotes before re-attempting.
        let parsed = parse_results_yaml(yaml, "sanity");
        assert!(parsed.is_ok());
    }

    #[test]
    fn split_subtests_buckets_by_status() {
        let raw = vec![
            RawSubtest { name: "a".to_string(), status: "PASS".to_string() },
            RawSubtest { name: "b".to_string(), status: "SKIP".to_string() },
            RawSubtest { name: "c".to_string(), status: "FAIL".to_string() },
        ];
        let (passed, skipped, failing) = split_subtests(raw);
        assert_eq!(passed, vec!["a"]);
        assert_eq!(skipped, vec!["b"]);
        assert_eq!(failing, vec!["c"]);
    }

    #[tokio::test]
    async fn classify_against_history_splits_new_known_and_blacklisted() {
        use crate::external::fakes::FakeCrashDatabase;

        let db = FakeCrashDatabase::default();
        db.known_failures.lock().insert("known_fail".to_string(), 7);
        db.blacklisted.lock().insert("flaky_fail".to_string());
        let db: Arc<dyn CrashDatabase> = Arc::new(db);

        let results = classify_against_history(
            &db,
            "master",
            vec!["ok".to_string()],
            vec!["skip".to_string()],
            vec!["known_fail".to_string(), "new_fail".to_string(), "flaky_fail".to_string()],
        )
        .await;

        assert_eq!(results.passed, vec!["ok"]);
        assert_eq!(results.skipped, vec!["skip"]);
        assert_eq!(results.new_failures, vec!["new_fail"]);
        assert_eq!(results.known_failures, vec![("known_fail".to_string(), 7)]);
    }

    #[test]
    fn scan_for_warnings_matches_catalogue_entries() {
        let catalogue = vec![
            WarningEntry {
                error: "LustreError: slow start_recovery".to_string(),
                message: Some("slow recovery detected".to_string()),
                fatal: None,
                warn: Some(true),
            },
            WarningEntry {
                error: "unrelated pattern".to_string(),
                message: None,
                fatal: None,
                warn: Some(true),
            },
        ];
        let text = "[1.0] LustreError: slow start_recovery on mdt0\n";
        let matched = scan_for_warnings(text, &catalogue);
        assert_eq!(matched, vec!["slow recovery detected"]);
    }

    #[tokio::test]
    async fn crashed_outcome_dispatches_to_crash_queue_not_update_test_status() {
        use crate::external::fakes::FakeCrashDatabase;
        use crate::work_item::{ChangeRecord, TestRecord};

        let dir = tempfile::tempdir().unwrap();
        let results_dir = dir.path().to_path_buf();
        std::fs::write(results_dir.join("server-console.txt"), "boot ok\n").unwrap();
        std::fs::write(results_dir.join("client-console.txt"), "boot ok\n").unwrap();

        let change = ChangeRecord {
            change_number: 1,
            revision: "1".to_string(),
            branch: "master".to_string(),
            ref_spec: "refs/changes/1/1/1".to_string(),
            commit_message: "x".to_string(),
            changed_files: vec![],
            branchwide: false,
            subject: "x".to_string(),
        };
        let item = Arc::new(WorkItem::new(change, vec!["centos7".to_string()], false));
        item.state.lock().tests.push(TestRecord::new("sanity", "sanity", "ldiskfs", 600));

        let job = TestJob {
            item: item.clone(),
            script: "sanity".to_string(),
            axes: TestAxes::default(),
            artifacts: Artifacts {
                kernel: PathBuf::new(),
                initrd: PathBuf::new(),
                rootfs: PathBuf::new(),
            },
            results_dir,
            whole_job_timeout: Duration::from_secs(600),
            subtest_timeout: Duration::from_secs(600),
            extra_env: HashMap::new(),
            test_command: "true".to_string(),
            decoder_cmd: Vec::new(),
            warning_catalogue: Arc::new(Vec::new()),
        };

        let crash_db: Arc<dyn CrashDatabase> = Arc::new(FakeCrashDatabase::default());
        let crash_queue: Arc<WorkQueue<CrashJob>> = Arc::new(WorkQueue::new());

        record_outcome(
            &job,
            &JobOutcome::Crashed { message: "crash: kernel BUG at ".to_string() },
            &crash_db,
            &crash_queue,
        )
        .await;

        assert_eq!(crash_queue.len(), 1);
        // Outcome is still Running: the Crash Analyzer job, not this
        // worker, owns the eventual `update_test_status` call.
        assert_eq!(item.state.lock().tests[0].outcome, TestOutcome::Running);
    }
}
