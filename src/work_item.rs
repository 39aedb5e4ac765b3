//! Durable record of one patch revision's whole CI run (spec.md §3).
//!
//! Field names follow the original Python `GerritWorkItem` deliberately
//! (`BuildDone`, `InitialTestingStarted`, ...) are renamed to idiomatic
//! Rust `snake_case` but keep identical semantics; the `buiildnr` typo in
//! the source is not reproduced (§9 Open Question).

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

/// Stable, monotonic, process-wide build number. Never reused, never
/// gapped except by process crash (recovered from `LASTBUILD_ID`).
pub type BuildNumber = u64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChangeId {
    pub change_number: u64,
    pub revision: String,
}

/// The originating change record: id, revision, branch, commit message,
/// changed files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub change_number: u64,
    pub revision: String,
    pub branch: String,
    pub ref_spec: String,
    pub commit_message: String,
    pub changed_files: Vec<String>,
    pub branchwide: bool,
    pub subject: String,
}

impl ChangeRecord {
    pub fn id(&self) -> ChangeId {
        ChangeId {
            change_number: self.change_number,
            revision: self.revision.clone(),
        }
    }
}

/// One per target distro per Work Item (spec.md "Build Record").
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BuildRecord {
    pub distro: String,
    pub started: bool,
    pub finished: bool,
    pub failed: bool,
    pub timeout: bool,
    pub message: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// Per-file review annotations parsed out of compile-error output.
    pub annotations: Vec<ReviewAnnotation>,
    /// Per-work-item retry counter for this distro's build (spec.md §4.3
    /// "others → retryable", bounded like the test retry counter).
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewAnnotation {
    pub path: String,
    pub line: u32,
    pub severity: String,
    pub message: String,
}

/// DNE / SSK / SELINUX axes (glossary).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TestAxes {
    pub dne: bool,
    pub ssk: bool,
    pub selinux: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TestOutcome {
    #[default]
    Running,
    Passed,
    Failed,
    /// Tracked separately from `TimedOut` even though the historical
    /// implementation conflates them in places (§9 Open Question).
    Crashed,
    TimedOut,
    Skipped,
    Aborted,
}

impl TestOutcome {
    pub fn is_finished(&self) -> bool {
        !matches!(self, TestOutcome::Running)
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TestOutcome::Failed | TestOutcome::Crashed | TestOutcome::TimedOut
        )
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestOutcome::Running => "Running",
            TestOutcome::Passed => "Success",
            TestOutcome::Failed => "Failed",
            TestOutcome::Crashed => "Crashed",
            TestOutcome::TimedOut => "Timed Out",
            TestOutcome::Skipped => "Skipped",
            TestOutcome::Aborted => "Aborted",
        };
        write!(f, "{s}")
    }
}

/// A test's subtest classification against the historical DB.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SubtestResults {
    pub passed: Vec<String>,
    pub skipped: Vec<String>,
    /// Failures unseen on this branch in the last 30 days and not
    /// blacklisted.
    pub new_failures: Vec<String>,
    /// Failures with a known, aggregate count in the historical DB.
    pub known_failures: Vec<(String, u64)>,
}

/// One subtest record inside a Work Item (spec.md "Test Record").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRecord {
    pub script: String,
    pub display_name: String,
    pub fs_type: String,
    pub axes: TestAxes,
    pub timeout_secs: u64,
    pub extra_env: HashMap<String, String>,
    pub priority: i64,
    pub forced: bool,
    pub disabled: bool,

    pub outcome: TestOutcome,
    /// Set when the test actually starts running; the sole handshake
    /// between "queued" and "running" (spec.md "Test Record").
    pub results_dir: Option<PathBuf>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub subtests: SubtestResults,
    pub warnings: Vec<String>,
    pub new_warnings: Vec<String>,
    pub status_message: Option<String>,
    pub aborted: bool,
    /// Per-work-item retry counter for this test (§4.4 "Retry discipline",
    /// bounded at 30).
    pub retry_count: u32,
}

impl TestRecord {
    pub fn new(script: &str, display_name: &str, fs_type: &str, timeout_secs: u64) -> Self {
        Self {
            script: script.to_string(),
            display_name: display_name.to_string(),
            fs_type: fs_type.to_string(),
            axes: TestAxes::default(),
            timeout_secs,
            extra_env: HashMap::new(),
            priority: 0,
            forced: false,
            disabled: false,
            outcome: TestOutcome::Running,
            results_dir: None,
            stdout: None,
            stderr: None,
            subtests: SubtestResults::default(),
            warnings: Vec::new(),
            new_warnings: Vec::new(),
            status_message: None,
            aborted: false,
            retry_count: 0,
        }
    }

    /// "Running" iff a results dir has been acquired but the test hasn't
    /// finished yet (spec.md "Test Record" ResultsDir handshake).
    pub fn is_running(&self) -> bool {
        self.results_dir.is_some() && !self.outcome.is_finished()
    }

    pub fn is_queued(&self) -> bool {
        self.results_dir.is_none() && !self.outcome.is_finished()
    }

    pub fn label(&self) -> String {
        let mut s = format!("{}@{}", self.display_name, self.fs_type);
        if self.axes.dne {
            s.push_str("+DNE");
        }
        if self.axes.ssk {
            s.push_str("+SharedKey");
        }
        if self.axes.selinux {
            s.push_str("+SELinux");
        }
        s
    }
}

/// Boolean phase flags (spec.md "Work Item").
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PhaseFlags {
    pub build_done: bool,
    pub build_error: bool,
    pub initial_testing_started: bool,
    pub initial_testing_done: bool,
    pub initial_testing_error: bool,
    pub testing_started: bool,
    pub testing_done: bool,
    pub testing_error: bool,
    pub aborted: bool,
    pub abort_done: bool,
    pub final_report_posted: bool,
    pub added_test_failure: bool,
}

impl PhaseFlags {
    /// Checks the monotonicity invariants from spec.md §3.
    pub fn check_invariants(&self) -> Result<(), &'static str> {
        if self.initial_testing_done && !self.build_done {
            return Err("InitialTestingDone without BuildDone");
        }
        if self.testing_done && !(self.initial_testing_done || self.initial_testing_error) {
            return Err("TestingDone without InitialTestingDone or InitialTestingError");
        }
        Ok(())
    }
}

/// The serialisable state of a Work Item. The lock itself is a runtime
/// affordance dropped on persistence and rebuilt on recovery (§9,
/// "serialisable live state with a lock").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItemState {
    pub build_number: Option<BuildNumber>,
    pub change: ChangeRecord,
    pub distro_builds: Vec<BuildRecord>,
    pub initial_tests: Vec<TestRecord>,
    pub tests: Vec<TestRecord>,
    pub flags: PhaseFlags,
    pub retest_iteration: u32,
    pub artifacts_dir: Option<PathBuf>,
    pub crash_ids_reported: Vec<u64>,
    pub created_at: DateTime<Utc>,
    pub high_priority: bool,
}

/// A Work Item, with its per-item lock. Shared between the Scheduler and
/// whichever worker currently holds it (spec.md §5 "Shared-resource
/// policy").
pub struct WorkItem {
    pub state: Mutex<WorkItemState>,
}

impl WorkItem {
    pub fn new(change: ChangeRecord, distros: Vec<String>, high_priority: bool) -> Self {
        let distro_builds = distros
            .into_iter()
            .map(|distro| BuildRecord {
                distro,
                ..Default::default()
            })
            .collect();
        Self {
            state: Mutex::new(WorkItemState {
                build_number: None,
                change,
                distro_builds,
                initial_tests: Vec::new(),
                tests: Vec::new(),
                flags: PhaseFlags::default(),
                retest_iteration: 0,
                artifacts_dir: None,
                crash_ids_reported: Vec::new(),
                created_at: Utc::now(),
                high_priority,
            }),
        }
    }

    pub fn from_state(state: WorkItemState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn change_id(&self) -> ChangeId {
        self.state.lock().change.id()
    }

    pub fn build_number(&self) -> Option<BuildNumber> {
        self.state.lock().build_number
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().flags.aborted
    }

    /// Marks this item Aborted. Returns true if this call is the one that
    /// transitions it (so the caller knows to post the one-time abort
    /// notice, spec.md §4.1 "Abort discipline").
    pub fn mark_aborted(&self) -> bool {
        let mut st = self.state.lock();
        if st.flags.aborted {
            return false;
        }
        st.flags.aborted = true;
        true
    }

    /// `UpdateBuildStatus` (spec.md §4.3 step 4 / GerritWorkItem.py).
    pub fn update_build_status(
        &self,
        distro: &str,
        message: String,
        failed: bool,
        timeout: bool,
        stdout: Option<String>,
        stderr: Option<String>,
        annotations: Vec<ReviewAnnotation>,
    ) {
        let mut st = self.state.lock();
        let (build_finished, failed_or_timeout) = {
            let Some(build) = st.distro_builds.iter_mut().find(|b| b.distro == distro) else {
                return;
            };
            build.message = Some(message);
            let mut failed = failed;
            build.finished = true;
            if timeout {
                build.timeout = true;
                failed = true;
            }
            build.failed = failed;
            if let Some(out) = stdout {
                build.stdout = Some(out);
            }
            if let Some(err) = stderr {
                build.stderr = Some(err);
            }
            build.annotations = annotations;
            (build.finished, failed || timeout)
        };

        if failed_or_timeout {
            st.flags.build_error = true;
        }

        if build_finished && st.distro_builds.iter().all(|b| b.finished) {
            st.flags.build_done = true;
        }
    }

    /// `UpdateTestStatus` (spec.md §4.4 step 9 / GerritWorkItem.py).
    /// `acquire_results_dir` handles the "start" handshake; otherwise this
    /// records a terminal outcome.
    pub fn acquire_results_dir(&self, script: &str, axes: TestAxes, dir: PathBuf) {
        let mut st = self.state.lock();
        let worklist = Self::active_worklist_mut(&mut st);
        if let Some(t) = worklist
            .iter_mut()
            .find(|t| t.script == script && t.axes == axes && t.results_dir.is_none())
        {
            t.results_dir = Some(dir);
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_test_status(
        &self,
        script: &str,
        axes: TestAxes,
        outcome: TestOutcome,
        message: Option<String>,
        stdout: Option<String>,
        stderr: Option<String>,
        subtests: Option<SubtestResults>,
        warnings: Vec<String>,
    ) -> bool {
        let mut st = self.state.lock();
        let aborted = st.flags.aborted;
        let initial_active = st.flags.initial_testing_started && !st.flags.initial_testing_done;
        let worklist = Self::active_worklist_mut(&mut st);
        let Some(t) = worklist
            .iter_mut()
            .find(|t| t.script == script && t.axes == axes)
        else {
            return false;
        };

        t.outcome = outcome.clone();
        if let Some(m) = message {
            if t.status_message.as_deref() != Some(m.as_str()) {
                t.status_message = Some(m);
            }
        }
        if let Some(out) = stdout {
            t.stdout = Some(out);
        }
        if let Some(err) = stderr {
            t.stderr = Some(err);
        }
        if let Some(sub) = subtests {
            t.subtests = sub;
        }
        if !warnings.is_empty() {
            t.new_warnings.extend(warnings.clone());
            t.warnings.extend(warnings);
        }
        if aborted {
            t.aborted = true;
        }

        let finished = t.outcome.is_finished();
        if finished && outcome.is_failure() {
            if initial_active {
                st.flags.initial_testing_error = true;
            } else {
                st.flags.testing_error = true;
            }
            st.flags.added_test_failure = true;
        }

        if !finished {
            return false;
        }

        let worklist = if initial_active {
            &st.initial_tests
        } else {
            &st.tests
        };
        let all_done = worklist.iter().all(|t| t.outcome.is_finished());
        if !all_done {
            return false;
        }
        if initial_active {
            st.flags.initial_testing_done = true;
        } else if st.flags.testing_started {
            st.flags.testing_done = true;
        }
        true
    }

    fn active_worklist_mut(st: &mut WorkItemState) -> &mut Vec<TestRecord> {
        if st.flags.initial_testing_started && !st.flags.initial_testing_done {
            &mut st.initial_tests
        } else if st.flags.testing_started && !st.flags.testing_done {
            &mut st.tests
        } else {
            // Late/aborted completion for a phase that's already closed out;
            // fall back to whichever list still references it.
            &mut st.tests
        }
    }

    /// Composes the final review message body (grounded on
    /// `GerritWorkItem.test_status_output`).
    pub fn compose_report(&self, base_url: &str) -> String {
        let st = self.state.lock();
        let mut out = String::new();
        let all_tests: Vec<&TestRecord> = st
            .initial_tests
            .iter()
            .chain(st.tests.iter())
            .filter(|t| !t.disabled)
            .collect();

        let new_failures: Vec<String> = all_tests
            .iter()
            .filter(|t| !t.subtests.new_failures.is_empty())
            .map(|t| format!("- {}: {}", t.label(), t.subtests.new_failures.join(", ")))
            .collect();
        if !new_failures.is_empty() {
            out.push_str("IMPORTANT: these tests appear to be new failures unique to this patch\n");
            out.push_str(&new_failures.join("\n"));
            out.push_str("\n\n");
        }

        let failed: Vec<String> = all_tests
            .iter()
            .filter(|t| t.outcome.is_failure())
            .map(|t| {
                let reason = t
                    .status_message
                    .clone()
                    .unwrap_or_else(|| t.outcome.to_string());
                format!("> {} {}", t.label(), reason)
            })
            .collect();
        if !failed.is_empty() {
            out.push('\n');
            out.push_str(&failed.join("\n"));
            out.push('\n');
        }

        let warned: Vec<String> = all_tests
            .iter()
            .filter(|t| !t.new_warnings.is_empty())
            .map(|t| format!("{}({})", t.label(), t.new_warnings.join(",")))
            .collect();
        if !warned.is_empty() {
            out.push_str("\nTests with NEW Warning messages:\n- ");
            out.push_str(&warned.join(" "));
            out.push('\n');
        }

        let passed: Vec<String> = all_tests
            .iter()
            .filter(|t| t.outcome == TestOutcome::Passed)
            .map(|t| t.label())
            .collect();
        if !passed.is_empty() {
            out.push_str("\nSucceeded:\n- ");
            out.push_str(&passed.join(" "));
            out.push('\n');
        }

        let skipped: Vec<String> = all_tests
            .iter()
            .filter(|t| t.outcome == TestOutcome::Skipped)
            .map(|t| t.label())
            .collect();
        if !skipped.is_empty() {
            out.push_str("\nSkipped:\n- ");
            out.push_str(&skipped.join(" "));
            out.push('\n');
        }

        out.push_str(&format!(
            "\n({}) All results and logs: {}/{}",
            st.distro_builds
                .first()
                .map(|b| b.distro.as_str())
                .unwrap_or("?"),
            base_url,
            results_filename(st.retest_iteration)
        ));
        out
    }

    /// Composes the one-time abort notice (spec.md §4.1 "Aborted ∧
    /// ¬AbortDone" transition), distinct from `compose_report`: a superseded
    /// item never reaches a final pass/fail verdict, so it gets a terse
    /// notice instead of a results table.
    pub fn compose_abort_notice(&self) -> String {
        let st = self.state.lock();
        format!(
            "Build {} aborted: superseded by a newer revision of this change.",
            st.build_number.unwrap_or(0)
        )
    }

    /// Rate-limited posting guard (spec.md §4.5 step 5): returns true the
    /// first time `crash_id` is seen for this item.
    pub fn note_crash_reported(&self, crash_id: u64) -> bool {
        let mut st = self.state.lock();
        if st.crash_ids_reported.contains(&crash_id) {
            false
        } else {
            st.crash_ids_reported.push(crash_id);
            true
        }
    }
}

pub fn results_filename(retest_iteration: u32) -> String {
    if retest_iteration == 0 {
        "results.html".to_string()
    } else {
        format!("results-retry{retest_iteration}.html")
    }
}

/// Truncates captured stdout/stderr to a grapheme-safe excerpt before it
/// is attached to a review comment (SPEC_FULL.md, ambient presentation).
pub fn truncate_excerpt(s: &str, max_graphemes: usize) -> String {
    let graphemes: Vec<&str> = s.graphemes(true).collect();
    if graphemes.len() <= max_graphemes {
        s.to_string()
    } else {
        let mut out: String = graphemes[..max_graphemes].concat();
        out.push_str("\n... [truncated]");
        out
    }
}
