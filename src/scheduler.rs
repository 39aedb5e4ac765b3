//! Scheduler / Manager (spec.md §4.1).
//!
//! Pops Work Items off the Manager Queue and walks an ordered chain of
//! guards deciding what happens next -- dispatch a build, enqueue
//! initial/comprehensive tests, or retire the item -- exactly mirroring
//! `gerrit_build-and-test-new.py::run_workitem_manager`'s `if`-chain.
//! Every popped item is checkpointed before dispatch (spec.md §4.1,
//! `persistence::Store::checkpoint`); a review is only posted at a
//! terminal transition -- build failure, initial-testing failure, the
//! final report, or a one-time abort notice -- never on an intermediate
//! pass through the guard chain.

use std::sync::Arc;

use anyhow::Result;
use log::{info, warn};
use parking_lot::Mutex;

use crate::external::{ReviewClient, ReviewPost};
use crate::persistence::Store;
use crate::queue::{test_priority, PriorityQueue, WorkQueue};
use crate::work_item::{BuildNumber, TestAxes, WorkItem};

/// One distro's build request, pushed to the Build Queue (spec.md §4.3).
pub struct BuildDispatch {
    pub item: Arc<WorkItem>,
    pub distro: String,
}

/// One subtest's test request, pushed to the priority Test Queue
/// (spec.md §4.4).
pub struct TestDispatch {
    pub item: Arc<WorkItem>,
    pub script: String,
    pub axes: TestAxes,
}

/// What the dispatcher decided to do with a popped item, exposed mostly
/// so tests can assert on the guard that fired (spec.md §4.1's ordered
/// `if`-chain).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    NewBuildStarted,
    AbortDoneDiscarded,
    Aborted,
    BuildFailed,
    NoInitialTests,
    InitialTestingDispatched,
    InitialTestingPartial,
    InitialTestingFailed,
    NoFullTests,
    FullTestingDispatched,
    TestingDone,
    WaitingOnTesting,
}

pub struct Scheduler {
    pub store: Arc<Store>,
    pub build_queue: Arc<WorkQueue<BuildDispatch>>,
    pub test_queue: Arc<PriorityQueue<TestDispatch>>,
    pub review_client: Arc<dyn ReviewClient>,
    pub base_url: String,
    pub distros: Vec<String>,
    work_list: Mutex<Vec<Arc<WorkItem>>>,
    next_build_number: Mutex<BuildNumber>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        build_queue: Arc<WorkQueue<BuildDispatch>>,
        test_queue: Arc<PriorityQueue<TestDispatch>>,
        review_client: Arc<dyn ReviewClient>,
        base_url: String,
        distros: Vec<String>,
    ) -> Self {
        let next_build_number = store.load_next_build_number();
        Self {
            store,
            build_queue,
            test_queue,
            review_client,
            base_url,
            distros,
            work_list: Mutex::new(Vec::new()),
            next_build_number: Mutex::new(next_build_number),
        }
    }

    /// Marks every other in-flight item for the same change Aborted
    /// (spec.md §4.1 "Abort discipline": a newer revision supersedes
    /// earlier ones), grounded on `find_and_abort_duplicates`.
    fn abort_duplicates(&self, item: &Arc<WorkItem>) {
        let change_number = item.state.lock().change.change_number;
        let work_list = self.work_list.lock();
        for other in work_list.iter() {
            if Arc::ptr_eq(other, item) {
                continue;
            }
            if other.state.lock().change.change_number != change_number {
                continue;
            }
            if other.mark_aborted() {
                info!(
                    "aborted build {:?} for change {} (superseded)",
                    other.build_number(),
                    change_number
                );
            }
        }
    }

    /// Posts the final review (spec.md §4.1: exactly one of build-failure,
    /// initial-testing-failure, or final report, fired at the terminal
    /// transition that retires the item -- never on an intermediate pass).
    async fn post_review(&self, item: &Arc<WorkItem>) {
        let message = item.compose_report(&self.base_url);
        let score = {
            let st = item.state.lock();
            if st.flags.build_error || st.flags.initial_testing_error || st.flags.testing_error {
                -1
            } else {
                1
            }
        };
        self.post_message(item, message, score).await;
    }

    /// Posts the one-time abort notice (spec.md §4.1 "Aborted ∧ ¬AbortDone":
    /// post abort notice; mark AbortDone), distinct from the regular report.
    async fn post_abort_notice(&self, item: &Arc<WorkItem>) {
        let message = item.compose_abort_notice();
        self.post_message(item, message, 0).await;
    }

    async fn post_message(&self, item: &Arc<WorkItem>, message: String, score: i32) {
        let (change_number, revision) = {
            let st = item.state.lock();
            (st.change.change_number, st.change.revision.clone())
        };
        let review = ReviewPost {
            message,
            score,
            inline_comments: Vec::new(),
        };
        if let Err(e) = self
            .review_client
            .post_review(change_number, &revision, review)
            .await
        {
            warn!("posting review for change {change_number} failed: {e}");
            let body = serde_json::json!({"change": change_number, "revision": revision}).to_string();
            let _ = self.store.record_failed_post(change_number, &revision, &body);
        }
        let _ = self.store.append_review_history(Some(change_number), Some(&revision), score);
    }

    fn checkpoint(&self, item: &Arc<WorkItem>) {
        let st = item.state.lock().clone();
        if let Err(e) = self.store.checkpoint(&st) {
            warn!("checkpointing build {:?} failed: {e}", st.build_number);
        }
    }

    fn retire(&self, item: &Arc<WorkItem>) {
        let st = item.state.lock().clone();
        if let Err(e) = self.store.retire(&st) {
            warn!("retiring build {:?} failed: {e}", st.build_number);
        }
        self.work_list.lock().retain(|i| !Arc::ptr_eq(i, item));
    }

    /// Marks the in-flight item with this build number Aborted, if it's
    /// still on the worklist (spec.md §6 command channel `{abort: N}`).
    pub fn abort_by_build_number(&self, build_number: BuildNumber) -> bool {
        let work_list = self.work_list.lock();
        work_list
            .iter()
            .find(|item| item.build_number() == Some(build_number))
            .map(|item| item.mark_aborted())
            .unwrap_or(false)
    }

    /// Pushes an already-built item back onto the worklist and manager
    /// queue, used after a `retest-item` command rebuilds its test lists
    /// (spec.md §6 command-channel protocol).
    pub fn readmit(&self, item: Arc<WorkItem>) {
        self.work_list.lock().push(item);
    }

    /// Snapshot of every in-flight item, for the status page (spec.md §6
    /// "Published HTML").
    pub fn in_flight(&self) -> Vec<Arc<WorkItem>> {
        self.work_list.lock().clone()
    }

    /// Runs the ordered guard chain for one popped item (spec.md §4.1).
    pub async fn dispatch_one(&self, item: Arc<WorkItem>) -> DispatchOutcome {
        let is_new = item.build_number().is_none();
        if is_new {
            let build_number = {
                let mut next = self.next_build_number.lock();
                let assigned = *next;
                *next += 1;
                let _ = self.store.save_next_build_number(*next);
                assigned
            };
            item.state.lock().build_number = Some(build_number);
            self.abort_duplicates(&item);
            self.work_list.lock().push(item.clone());
            self.checkpoint(&item);

            for distro in &self.distros {
                self.build_queue.push(BuildDispatch {
                    item: item.clone(),
                    distro: distro.clone(),
                });
            }
            info!("build {build_number} dispatched for building");
            return DispatchOutcome::NewBuildStarted;
        }

        if item.state.lock().flags.abort_done {
            return DispatchOutcome::AbortDoneDiscarded;
        }

        self.checkpoint(&item);

        if item.is_aborted() {
            self.retire(&item);
            item.state.lock().flags.abort_done = true;
            self.post_abort_notice(&item).await;
            return DispatchOutcome::Aborted;
        }

        let (build_done, build_error, initial_started, initial_done, initial_error, testing_started, testing_done) = {
            let st = item.state.lock();
            (
                st.flags.build_done,
                st.flags.build_error,
                st.flags.initial_testing_started,
                st.flags.initial_testing_done,
                st.flags.initial_testing_error,
                st.flags.testing_started,
                st.flags.testing_done,
            )
        };

        if build_done && build_error {
            self.retire(&item);
            self.post_review(&item).await;
            return DispatchOutcome::BuildFailed;
        }

        if build_done && item.state.lock().initial_tests.is_empty() {
            self.retire(&item);
            self.post_review(&item).await;
            return DispatchOutcome::NoInitialTests;
        }

        if build_done && !initial_started {
            item.state.lock().flags.initial_testing_started = true;
            let tests: Vec<(String, TestAxes)> = item
                .state
                .lock()
                .initial_tests
                .iter()
                .map(|t| (t.script.clone(), t.axes))
                .collect();
            for (script, axes) in tests {
                self.test_queue.push(
                    0,
                    TestDispatch {
                        item: item.clone(),
                        script,
                        axes,
                    },
                );
            }
            return DispatchOutcome::InitialTestingDispatched;
        }

        if initial_started && !initial_done {
            return DispatchOutcome::InitialTestingPartial;
        }

        if initial_done && initial_error {
            self.retire(&item);
            self.post_review(&item).await;
            return DispatchOutcome::InitialTestingFailed;
        }

        if initial_done && item.state.lock().tests.is_empty() {
            self.retire(&item);
            self.post_review(&item).await;
            return DispatchOutcome::NoFullTests;
        }

        if initial_done && !testing_started {
            item.state.lock().flags.testing_started = true;
            let (build_number, high_priority, tests): (BuildNumber, bool, Vec<(String, TestAxes, u64)>) = {
                let st = item.state.lock();
                (
                    st.build_number.unwrap_or(0),
                    st.high_priority,
                    st.tests.iter().map(|t| (t.script.clone(), t.axes, t.timeout_secs)).collect(),
                )
            };
            for (script, axes, timeout_secs) in tests {
                let priority = test_priority(false, high_priority, build_number, timeout_secs);
                self.test_queue.push(
                    priority,
                    TestDispatch {
                        item: item.clone(),
                        script,
                        axes,
                    },
                );
            }
            return DispatchOutcome::FullTestingDispatched;
        }

        if testing_done {
            self.retire(&item);
            self.post_review(&item).await;
            return DispatchOutcome::TestingDone;
        }

        DispatchOutcome::WaitingOnTesting
    }

    /// Drains the Manager Queue forever, dispatching each popped item
    /// (spec.md §4.1). Exits only when the queue is dropped.
    pub async fn run(&self, manager_queue: Arc<WorkQueue<Arc<WorkItem>>>) {
        loop {
            let item = manager_queue.pop().await;
            let outcome = self.dispatch_one(item).await;
            info!("dispatch outcome: {outcome:?}");
        }
    }
}
