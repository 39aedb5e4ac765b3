//! The Orchestrator (spec.md §9 "Global mutable state").
//!
//! The source keeps the WorkList, the four queues and their condition
//! variables, the current build number, and a handful of feature flags
//! (`StopOnIdle`, `DrainQueueAndStop`, forced topic) as module-level
//! globals. This struct reifies them instead and is threaded into the
//! Scheduler, the worker pools, and the Review Poller, per the spec's
//! explicit redesign note.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{info, warn};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::process::Command;

use crate::build_worker::{run_build_job, BuildExit, BuildJob};
use crate::config::{BuilderEntry, FsConfig, TestNodeEntry};
use crate::crash_analyzer::{run_crash_analyzer_job, CrashJob};
use crate::external::{CrashDatabase, MetricsSink, ReviewClient, StatusPublisher};
use crate::persistence::Store;
use crate::pool::Pool;
use crate::queue::{test_priority, PriorityQueue, WorkQueue};
use crate::scheduler::{BuildDispatch, Scheduler, TestDispatch};
use crate::test_worker::{
    run_test_job, Artifacts, ClusterSlot, JobOutcome, TestJob, WarningEntry, MAX_RETRIES,
};
use crate::work_item::{BuildNumber, TestAxes, TestOutcome, WorkItem};

/// Everything that used to be a module-level global (spec.md §9).
pub struct Orchestrator {
    pub config: FsConfig,
    pub store: Arc<Store>,
    pub review_client: Arc<dyn ReviewClient>,
    pub crash_db: Arc<dyn CrashDatabase>,
    pub metrics: Arc<dyn MetricsSink>,
    pub status_publisher: Arc<dyn StatusPublisher>,
    pub scheduler: Arc<Scheduler>,
    pub manager_queue: Arc<WorkQueue<Arc<WorkItem>>>,
    pub build_queue: Arc<WorkQueue<BuildDispatch>>,
    pub test_queue: Arc<PriorityQueue<TestDispatch>>,
    pub crash_queue: Arc<WorkQueue<CrashJob>>,
    pub cluster_pool: Arc<Pool<ClusterSlot>>,
    pub builders: Mutex<Vec<BuilderEntry>>,
    pub file_lists_dir: PathBuf,
    pub catalogs_dir: PathBuf,
    /// Loaded once from `console_errors_lookup.json` /
    /// `suite_errors_lookup.json` alongside the test catalogues (spec.md
    /// §4.4 step 7, §6).
    pub warning_catalogue: Arc<Vec<WarningEntry>>,
    /// External decoder invocation for Crash Analyzer jobs (spec.md §4.5
    /// step 1); empty skips patch correlation.
    pub decoder_cmd: Vec<String>,
    pub commands_dir: PathBuf,
    pub branches_dir: PathBuf,
    /// `{idlestop}` command-channel flag: exit cleanly (code 0) once the
    /// Work-Item set empties out.
    pub stop_on_idle: AtomicBool,
    /// `{drain-and-stop}`: stop admitting new Review-Poller work but keep
    /// draining what's in flight.
    pub drain_and_stop: AtomicBool,
    /// `{forcetopic}` / `{removetopic}`.
    pub forced_topic: Mutex<Option<String>>,
    /// Bounds concurrent post-job artifact compression (spec.md §5 "J
    /// Compressors").
    pub compress_semaphore: Arc<Semaphore>,
    seen_changes: Mutex<HashSet<(u64, String)>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: FsConfig,
        store: Arc<Store>,
        review_client: Arc<dyn ReviewClient>,
        crash_db: Arc<dyn CrashDatabase>,
        metrics: Arc<dyn MetricsSink>,
        status_publisher: Arc<dyn StatusPublisher>,
        builders: Vec<BuilderEntry>,
        test_nodes: Vec<TestNodeEntry>,
        file_lists_dir: PathBuf,
        catalogs_dir: PathBuf,
        commands_dir: PathBuf,
        branches_dir: PathBuf,
    ) -> Self {
        let build_queue = Arc::new(WorkQueue::new());
        let test_queue = Arc::new(PriorityQueue::new());
        let manager_queue = Arc::new(WorkQueue::new());
        let crash_queue = Arc::new(WorkQueue::new());

        let mut warning_catalogue =
            crate::config::load_warning_catalogue(&catalogs_dir.join("console_errors_lookup.json"))
                .unwrap_or_default();
        warning_catalogue.extend(
            crate::config::load_warning_catalogue(&catalogs_dir.join("suite_errors_lookup.json"))
                .unwrap_or_default(),
        );
        let warning_catalogue = Arc::new(warning_catalogue);
        let decoder_cmd = config.decoder_cmd.clone();

        let mut distros: Vec<String> = builders.iter().map(|b| b.distro.clone()).collect();
        distros.sort();
        distros.dedup();

        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            build_queue.clone(),
            test_queue.clone(),
            review_client.clone(),
            config.http_base_url.clone(),
            distros,
        ));

        let cluster_pool = Arc::new(Pool::new(test_nodes.into_iter().map(ClusterSlot::from)));
        let compress_semaphore = Arc::new(Semaphore::new(config.compressors.max(1)));
        let seen_changes = store.load_review_history_keys().unwrap_or_default();

        Self {
            config,
            store,
            review_client,
            crash_db,
            metrics,
            status_publisher,
            scheduler,
            manager_queue,
            build_queue,
            test_queue,
            crash_queue,
            cluster_pool,
            builders: Mutex::new(builders),
            file_lists_dir,
            catalogs_dir,
            warning_catalogue,
            decoder_cmd,
            commands_dir,
            branches_dir,
            stop_on_idle: AtomicBool::new(false),
            drain_and_stop: AtomicBool::new(false),
            forced_topic: Mutex::new(None),
            compress_semaphore,
            seen_changes: Mutex::new(seen_changes),
        }
    }

    /// True the first time this `(change, revision)` pair is seen this
    /// process lifetime, used by the Review Poller's dedup (spec.md §4.6).
    pub fn mark_change_seen(&self, change_number: u64, revision: &str) -> bool {
        self.seen_changes
            .lock()
            .insert((change_number, revision.to_string()))
    }

    /// Reloads in-flight items from `savedstate/` and re-enqueues every
    /// unfinished subtest of the active phase -- whether it had already
    /// acquired a results dir when the process died, or was still merely
    /// queued and never got to run at all (spec.md §8 "Recovery after
    /// crash": "remaining unfinished tests are re-enqueued"). Either way
    /// its results-dir handshake is cleared and it's pushed back onto the
    /// Test Queue, rather than re-running the whole phase.
    pub fn recover(&self) -> Result<usize> {
        let in_flight = self.store.load_in_flight()?;
        let mut recovered = 0;
        for state in in_flight {
            let initial_active = state.flags.initial_testing_started && !state.flags.initial_testing_done;
            let testing_active = state.flags.testing_started && !state.flags.testing_done;
            let build_number = state.build_number.unwrap_or(0);
            let high_priority = state.high_priority;
            let item = Arc::new(WorkItem::from_state(state));

            let mut pending: Vec<(String, TestAxes, u64)> = Vec::new();
            {
                let mut st = item.state.lock();
                let worklist = if initial_active {
                    &mut st.initial_tests
                } else {
                    &mut st.tests
                };
                for t in worklist.iter_mut() {
                    if !t.outcome.is_finished() {
                        t.results_dir = None;
                        pending.push((t.script.clone(), t.axes, t.timeout_secs));
                    }
                }
            }

            for (script, axes, timeout_secs) in pending {
                let priority = if initial_active {
                    0
                } else {
                    test_priority(false, high_priority, build_number, timeout_secs)
                };
                self.test_queue.push(
                    priority,
                    TestDispatch {
                        item: item.clone(),
                        script,
                        axes,
                    },
                );
            }

            if !initial_active && !testing_active {
                // No open phase at all (e.g. still waiting on a build):
                // the manager will figure out the next step on its own.
            }

            self.scheduler.readmit(item.clone());
            self.manager_queue.push(item);
            recovered += 1;
        }
        if recovered > 0 {
            info!("recovered {recovered} in-flight work item(s) from savedstate/");
        }
        Ok(recovered)
    }

    /// Spawns the Scheduler thread, the Build/Test Worker pools, and the
    /// Review Poller (spec.md §5 "all long-lived, all joined at
    /// shutdown"). Returns once every spawned task has exited, which only
    /// happens on process shutdown.
    pub async fn run(self: Arc<Self>) {
        let mut handles = Vec::new();

        {
            let orch = self.clone();
            handles.push(tokio::spawn(async move {
                orch.scheduler.run(orch.manager_queue.clone()).await;
            }));
        }

        for idx in 0..self.config.build_workers.max(1) {
            let orch = self.clone();
            handles.push(tokio::spawn(async move { orch.build_worker_loop(idx).await }));
        }

        for idx in 0..self.config.test_clusters.max(1) {
            let orch = self.clone();
            handles.push(tokio::spawn(async move { orch.test_worker_loop(idx).await }));
        }

        for idx in 0..self.config.crash_analyzers.max(1) {
            let orch = self.clone();
            handles.push(tokio::spawn(async move { orch.crash_analyzer_loop(idx).await }));
        }

        {
            let orch = self.clone();
            handles.push(tokio::spawn(async move {
                crate::review_poller::run(orch).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn build_worker_loop(self: Arc<Self>, idx: usize) {
        loop {
            let dispatch = self.build_queue.pop().await;
            let builder = self
                .builders
                .lock()
                .iter()
                .find(|b| b.distro == dispatch.distro)
                .cloned();
            let Some(builder) = builder else {
                warn!("build worker {idx}: no builder configured for distro {}", dispatch.distro);
                self.manager_queue.push(dispatch.item);
                continue;
            };
            let job = BuildJob {
                item: dispatch.item.clone(),
                distro: dispatch.distro.clone(),
                build_script: builder.build_script,
                worktree: builder.worktree,
            };
            match run_build_job(job).await {
                Ok(BuildExit::Retryable(code)) => {
                    self.requeue_build_retryable(dispatch, code, idx);
                }
                Ok(_) => {
                    self.manager_queue.push(dispatch.item);
                }
                Err(e) => {
                    warn!("build worker {idx}: {e}");
                    self.manager_queue.push(dispatch.item);
                }
            }
        }
    }

    /// Bumps the per-distro build retry counter and either re-enqueues
    /// after a backoff or gives up as a terminal failure past
    /// `MAX_RETRIES` (spec.md §4.3 "others → retryable", mirroring
    /// `requeue_retryable`'s test-retry discipline).
    fn requeue_build_retryable(&self, dispatch: BuildDispatch, code: i32, idx: usize) {
        let BuildDispatch { item, distro } = dispatch;
        let retry_count = {
            let mut st = item.state.lock();
            let Some(build) = st.distro_builds.iter_mut().find(|b| b.distro == distro) else {
                return;
            };
            build.retry_count += 1;
            build.retry_count
        };

        warn!("build worker {idx}: retryable exit code {code} for distro {distro}, attempt {retry_count}");

        if retry_count >= MAX_RETRIES {
            item.update_build_status(
                &distro,
                format!("exceeded {MAX_RETRIES} retries: exit code {code}"),
                true,
                false,
                None,
                None,
                Vec::new(),
            );
            self.manager_queue.push(item);
            return;
        }

        let build_queue = self.build_queue.clone();
        let delay = crate::test_worker::retry_backoff(retry_count);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            build_queue.push(BuildDispatch { item, distro });
        });
    }

    async fn test_worker_loop(self: Arc<Self>, idx: usize) {
        loop {
            let dispatch = self.test_queue.pop().await;
            let Some(job) = self.compose_test_job(&dispatch) else {
                self.manager_queue.push(dispatch.item);
                continue;
            };

            let results_dir = job.results_dir.clone();
            let outcome = run_test_job(job, &self.cluster_pool, &self.crash_db, &self.crash_queue).await;

            match outcome {
                Ok(JobOutcome::Retryable { reason }) => {
                    self.requeue_retryable(dispatch, &reason, idx);
                }
                Ok(JobOutcome::MissingArtifacts) => {
                    self.requeue_retryable(dispatch, "artifacts not yet present", idx);
                }
                Ok(JobOutcome::Crashed { .. }) | Ok(JobOutcome::TimedOut) => {
                    // Ownership of update_test_status and the manager-queue
                    // push transfers to the Crash Analyzer pool.
                    self.compress_results(results_dir);
                }
                Ok(_) => {
                    self.compress_results(results_dir);
                    self.manager_queue.push(dispatch.item);
                }
                Err(e) => {
                    warn!("test worker {idx}: {e}");
                    self.manager_queue.push(dispatch.item);
                }
            }
        }
    }

    async fn crash_analyzer_loop(self: Arc<Self>, idx: usize) {
        loop {
            let job = self.crash_queue.pop().await;
            if let Err(e) =
                run_crash_analyzer_job(job, &self.crash_db, &self.review_client, &self.manager_queue).await
            {
                warn!("crash analyzer {idx}: {e}");
            }
        }
    }

    fn compose_test_job(&self, dispatch: &TestDispatch) -> Option<TestJob> {
        let (record, build_number, retest_iteration, distro) = {
            let st = dispatch.item.state.lock();
            let record = st
                .initial_tests
                .iter()
                .chain(st.tests.iter())
                .find(|t| t.script == dispatch.script && t.axes == dispatch.axes)
                .cloned()?;
            (
                record,
                st.build_number.unwrap_or(0),
                st.retest_iteration,
                st.distro_builds.first().map(|b| b.distro.clone()).unwrap_or_default(),
            )
        };

        let artifacts = Artifacts {
            kernel: self.config.artifacts_dir.join(&distro).join("vmlinuz"),
            initrd: self.config.artifacts_dir.join(&distro).join("initrd.img"),
            rootfs: self.config.artifacts_dir.join(&distro).join("rootfs.img"),
        };
        let results_dir = self
            .config
            .outputs_dir
            .join(build_number.to_string())
            .join(format!("retry{retest_iteration}"))
            .join(sanitize_label(&record.label()));

        Some(TestJob {
            item: dispatch.item.clone(),
            script: dispatch.script.clone(),
            axes: dispatch.axes,
            artifacts,
            results_dir,
            whole_job_timeout: Duration::from_secs(record.timeout_secs),
            subtest_timeout: Duration::from_secs(record.timeout_secs.min(1800)),
            extra_env: record.extra_env,
            test_command: record.script,
            decoder_cmd: self.decoder_cmd.clone(),
            warning_catalogue: self.warning_catalogue.clone(),
        })
    }

    /// Bumps the per-test retry counter and either re-enqueues after a
    /// backoff or gives up as a terminal failure past `MAX_RETRIES`
    /// (spec.md §4.4 "Retry discipline", §7 "Retryable infrastructure
    /// failure").
    fn requeue_retryable(&self, dispatch: TestDispatch, reason: &str, idx: usize) {
        let TestDispatch { item, script, axes } = dispatch;
        let (retry_count, initial_active, build_number, high_priority, timeout_secs) = {
            let mut st = item.state.lock();
            let initial_active = st.flags.initial_testing_started && !st.flags.initial_testing_done;
            let build_number = st.build_number.unwrap_or(0);
            let high_priority = st.high_priority;
            let worklist = if initial_active {
                &mut st.initial_tests
            } else {
                &mut st.tests
            };
            let Some(t) = worklist.iter_mut().find(|t| t.script == script && t.axes == axes) else {
                return;
            };
            t.retry_count += 1;
            t.results_dir = None;
            (t.retry_count, initial_active, build_number, high_priority, t.timeout_secs)
        };

        warn!("test worker {idx}: retryable failure for {script} ({reason}), attempt {retry_count}");

        if retry_count >= MAX_RETRIES {
            item.update_test_status(
                &script,
                axes,
                TestOutcome::Failed,
                Some(format!("exceeded {MAX_RETRIES} retries: {reason}")),
                None,
                None,
                None,
                Vec::new(),
            );
            self.manager_queue.push(item);
            return;
        }

        let priority = if initial_active {
            0
        } else {
            test_priority(false, high_priority, build_number, timeout_secs)
        };
        let test_queue = self.test_queue.clone();
        let delay = crate::test_worker::retry_backoff(retry_count);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            test_queue.push(priority, TestDispatch { item, script, axes });
        });
    }

    /// Fires a bounded-concurrency `gzip` pass over a finished job's
    /// console logs (spec.md §5 "J Compressors").
    fn compress_results(&self, results_dir: PathBuf) {
        let semaphore = self.compress_semaphore.clone();
        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else { return };
            for name in ["server-console.txt", "client-console.txt"] {
                let path = results_dir.join(name);
                if path.exists() {
                    let _ = Command::new("gzip").arg("-f").arg(&path).status().await;
                }
            }
        });
    }
}

fn sanitize_label(label: &str) -> String {
    label.chars().map(|c| if c.is_alphanumeric() { c } else { '-' }).collect()
}
