//! Review Poller (spec.md §4.6).
//!
//! Periodically fetches open changes from the code-review server, resolves
//! a test list for each one not already in the local review-history file,
//! and hands a freshly-built Work Item to the Manager. Every tick also
//! drains the out-of-band command channel: two file-drop directories for
//! imperative operator actions and branch-tip regression sweeps.

use std::fs;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use serde::Deserialize;

use crate::catalog::{self, Catalogs, FileLists};
use crate::config::{load_builders, load_test_nodes};
use crate::orchestrator::Orchestrator;
use crate::work_item::{BuildNumber, ChangeRecord, WorkItem};

/// One parsed command-channel JSON file (spec.md §6 "Command-channel
/// protocol"). `untagged` because the wire format has no type tag; each
/// variant is distinguished by which fields are present.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RetestItem {
    #[serde(rename = "retest-item")]
    pub retest_item: BuildNumber,
    #[serde(default)]
    pub testlist: Option<String>,
    #[serde(default)]
    pub distro: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged, deny_unknown_fields)]
pub enum Command {
    RetestItem(RetestItem),
    Abort {
        abort: BuildNumber,
    },
    TestRef {
        #[serde(rename = "test-ref")]
        test_ref: String,
    },
    TestCommit {
        #[serde(rename = "test-commit")]
        test_commit: String,
        branch: String,
    },
    TestList {
        testlist: String,
        #[serde(default, rename = "DNE")]
        dne: Option<bool>,
        #[serde(default)]
        zfs: Option<bool>,
        #[serde(default)]
        ldiskfs: Option<bool>,
        #[serde(default)]
        distro: Option<String>,
    },
    AddBuilders {
        #[serde(rename = "add-builders")]
        add_builders: String,
    },
    DelBuilders {
        #[serde(rename = "del-builders")]
        del_builders: String,
    },
    AddWorkers {
        #[serde(rename = "add-workers")]
        add_workers: String,
    },
    DelWorkers {
        #[serde(rename = "del-workers")]
        del_workers: String,
    },
    IdleStop {
        idlestop: bool,
    },
    DrainAndStop {
        #[serde(rename = "drain-and-stop")]
        drain_and_stop: bool,
    },
    ForceTopic {
        forcetopic: String,
    },
    RemoveTopic {
        removetopic: bool,
    },
}

/// Runs forever, ticking every `review_poll_interval_secs` (default 120s,
/// spec.md §4.6).
pub async fn run(orchestrator: Arc<Orchestrator>) {
    let interval = Duration::from_secs(
        orchestrator
            .config
            .review_poll_interval_secs
            .unwrap_or(120),
    );
    loop {
        if let Err(e) = poll_once(&orchestrator).await {
            warn!("review poller tick failed: {e}");
        }
        tokio::time::sleep(interval).await;
    }
}

/// One poll tick: fetch open changes, build Work Items for unseen ones,
/// then drain the command channel and the branches directory.
pub async fn poll_once(orchestrator: &Orchestrator) -> Result<()> {
    match orchestrator.review_client.open_changes().await {
        Ok(mut changes) => {
            changes.sort_by(|a, b| b.change_number.cmp(&a.change_number));
            for change in changes {
                if !orchestrator.mark_change_seen(change.change_number, &change.revision) {
                    continue;
                }
                match build_work_item(orchestrator, change) {
                    Ok(Some(item)) => {
                        info!("review poller admitted change {}", item.change_id().change_number);
                        orchestrator.manager_queue.push(item);
                    }
                    Ok(None) => {}
                    Err(e) => warn!("resolving test list failed: {e}"),
                }
            }
        }
        Err(e) => warn!("fetching open changes failed: {e}"),
    }

    drain_commands(orchestrator).await;
    drain_branches(orchestrator);
    Ok(())
}

/// Runs the Test-List Resolver against `change` and, unless it says to do
/// nothing at all, builds a fresh Work Item ready for the Manager queue
/// (spec.md §4.2, §4.6).
fn build_work_item(orchestrator: &Orchestrator, change: ChangeRecord) -> Result<Option<Arc<WorkItem>>> {
    let file_lists = FileLists::load(&orchestrator.file_lists_dir)?;
    let catalogs = Catalogs::load(&orchestrator.catalogs_dir)?;
    let resolved = catalog::resolve(&change, &file_lists, &catalogs, change.branchwide);
    if resolved.do_nothing {
        return Ok(None);
    }
    let distros: Vec<String> = orchestrator.builders.lock().iter().map(|b| b.distro.clone()).collect();
    let item = Arc::new(WorkItem::new(change, distros, false));
    {
        let mut st = item.state.lock();
        st.initial_tests = resolved.initial;
        st.tests = resolved.comprehensive;
    }
    Ok(Some(item))
}

async fn drain_commands(orchestrator: &Orchestrator) {
    let dir = &orchestrator.commands_dir;
    if !dir.exists() {
        return;
    }
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!("reading commands directory {dir:?}: {e}");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!("reading command file {path:?}: {e}");
                continue;
            }
        };
        // Read then unlink, per spec.md §4.6 "Each command file is read
        // then unlinked atomically".
        let _ = fs::remove_file(&path);
        match serde_json::from_str::<Command>(&content) {
            Ok(cmd) => dispatch_command(orchestrator, cmd).await,
            Err(e) => warn!("malformed command file {path:?}: {e}"),
        }
    }
}

/// Branch-tip regression sweeps: each filename in the branches directory
/// is itself the git reference to test wholesale (spec.md §4.6).
fn drain_branches(orchestrator: &Orchestrator) {
    let dir = &orchestrator.branches_dir;
    if !dir.exists() {
        return;
    }
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!("reading branches directory {dir:?}: {e}");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let change = ChangeRecord {
            change_number: 0,
            revision: name.to_string(),
            branch: name.to_string(),
            ref_spec: name.to_string(),
            commit_message: String::new(),
            changed_files: Vec::new(),
            branchwide: true,
            subject: format!("branch-tip regression sweep: {name}"),
        };
        match build_work_item(orchestrator, change) {
            Ok(Some(item)) => orchestrator.manager_queue.push(item),
            Ok(None) => {}
            Err(e) => warn!("branch sweep {name}: {e}"),
        }
        let _ = fs::remove_file(&path);
    }
}

async fn dispatch_command(orchestrator: &Orchestrator, cmd: Command) {
    match cmd {
        Command::RetestItem(req) => {
            if let Err(e) = retest_item(orchestrator, req.retest_item, req.testlist) {
                warn!("retest-item {}: {e}", req.retest_item);
            }
        }
        Command::Abort { abort } => {
            if orchestrator.scheduler.abort_by_build_number(abort) {
                info!("aborted build {abort} via command channel");
            } else {
                warn!("abort {abort}: no matching in-flight build");
            }
        }
        Command::TestRef { test_ref } => {
            if let Err(e) = test_ref_command(orchestrator, &test_ref).await {
                warn!("test-ref {test_ref}: {e}");
            }
        }
        Command::TestCommit { test_commit, branch } => {
            let change = ChangeRecord {
                change_number: 0,
                revision: test_commit.clone(),
                branch,
                ref_spec: test_commit.clone(),
                commit_message: String::new(),
                changed_files: Vec::new(),
                branchwide: true,
                subject: format!("ad hoc commit test: {test_commit}"),
            };
            match build_work_item(orchestrator, change) {
                Ok(Some(item)) => orchestrator.manager_queue.push(item),
                Ok(None) => {}
                Err(e) => warn!("test-commit {test_commit}: {e}"),
            }
        }
        Command::TestList { testlist, .. } => {
            let change = ChangeRecord {
                change_number: 0,
                revision: "adhoc".to_string(),
                branch: "master".to_string(),
                ref_spec: "adhoc".to_string(),
                commit_message: format!("testlist={testlist}"),
                changed_files: Vec::new(),
                branchwide: false,
                subject: format!("ad hoc test list: {testlist}"),
            };
            match build_work_item(orchestrator, change) {
                Ok(Some(item)) => orchestrator.manager_queue.push(item),
                Ok(None) => {}
                Err(e) => warn!("testlist {testlist}: {e}"),
            }
        }
        Command::AddBuilders { add_builders } => match load_builders(Path::new(&add_builders)) {
            Ok(mut entries) => orchestrator.builders.lock().append(&mut entries),
            Err(e) => warn!("add-builders {add_builders}: {e}"),
        },
        Command::DelBuilders { del_builders } => match load_builders(Path::new(&del_builders)) {
            Ok(entries) => {
                let distros: std::collections::HashSet<String> =
                    entries.into_iter().map(|e| e.distro).collect();
                orchestrator.builders.lock().retain(|b| !distros.contains(&b.distro));
            }
            Err(e) => warn!("del-builders {del_builders}: {e}"),
        },
        Command::AddWorkers { add_workers } => match load_test_nodes(Path::new(&add_workers)) {
            Ok(nodes) => {
                for node in nodes {
                    orchestrator.cluster_pool.add(node.into()).await;
                }
            }
            Err(e) => warn!("add-workers {add_workers}: {e}"),
        },
        Command::DelWorkers { del_workers } => match load_test_nodes(Path::new(&del_workers)) {
            Ok(nodes) => {
                for _ in nodes {
                    let _ = orchestrator.cluster_pool.take_one().await;
                }
            }
            Err(e) => warn!("del-workers {del_workers}: {e}"),
        },
        Command::IdleStop { idlestop } => {
            orchestrator.stop_on_idle.store(idlestop, Ordering::SeqCst);
        }
        Command::DrainAndStop { drain_and_stop } => {
            orchestrator.drain_and_stop.store(drain_and_stop, Ordering::SeqCst);
        }
        Command::ForceTopic { forcetopic } => {
            *orchestrator.forced_topic.lock() = Some(forcetopic);
        }
        Command::RemoveTopic { removetopic } => {
            if removetopic {
                *orchestrator.forced_topic.lock() = None;
            }
        }
    }
}

/// `test-ref`: schedule one specific open change immediately, bypassing
/// the review-history dedup (spec.md §6 "test-a-specific-change").
async fn test_ref_command(orchestrator: &Orchestrator, test_ref: &str) -> Result<()> {
    let changes = orchestrator.review_client.open_changes().await?;
    let change = changes
        .into_iter()
        .find(|c| c.ref_spec == test_ref || c.change_number.to_string() == test_ref)
        .with_context(|| format!("no open change matching {test_ref}"))?;
    if let Some(item) = build_work_item(orchestrator, change)? {
        orchestrator.manager_queue.push(item);
    }
    Ok(())
}

/// `retest-item`: reloads the retired record, regenerates its test list
/// with the current rule-set (unless an explicit list is supplied, per
/// §9's Open-Question resolution), and readmits it starting directly at
/// the testing phase -- the build artifacts are reused, not rebuilt
/// (glossary "Retest iteration").
fn retest_item(orchestrator: &Orchestrator, build_number: BuildNumber, testlist: Option<String>) -> Result<()> {
    let mut state = orchestrator
        .store
        .load_done(build_number, 0)?
        .with_context(|| format!("no retired record for build {build_number}"))?;

    if let Some(csv) = testlist {
        state.change.commit_message = format!("testlist={csv}");
    }
    let file_lists = FileLists::load(&orchestrator.file_lists_dir)?;
    let catalogs = Catalogs::load(&orchestrator.catalogs_dir)?;
    let resolved = catalog::resolve(&state.change, &file_lists, &catalogs, state.change.branchwide);
    state.initial_tests = resolved.initial;
    state.tests = resolved.comprehensive;

    state.retest_iteration = orchestrator.store.next_retest_iteration(build_number);
    state.flags.initial_testing_started = false;
    state.flags.initial_testing_done = false;
    state.flags.initial_testing_error = false;
    state.flags.testing_started = false;
    state.flags.testing_done = false;
    state.flags.testing_error = false;
    state.flags.aborted = false;
    state.flags.abort_done = false;
    state.flags.added_test_failure = false;
    // build_done/build_error are deliberately left as-is: a retest reuses
    // the existing build artifacts rather than rebuilding.

    let item = Arc::new(WorkItem::from_state(state));
    orchestrator.scheduler.readmit(item.clone());
    orchestrator.manager_queue.push(item);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuilderEntry, FsConfig};
    use crate::external::fakes::{FakeCrashDatabase, FakeMetricsSink, FakeReviewClient, FakeStatusPublisher};
    use crate::persistence::Store;
    use std::path::PathBuf;

    fn write_json(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    fn fixture_dirs(root: &Path) -> (PathBuf, PathBuf) {
        let file_lists = root.join("filelists");
        let catalogs = root.join("catalogs");
        fs::create_dir_all(&file_lists).unwrap();
        fs::create_dir_all(&catalogs).unwrap();
        write_json(&file_lists, "ignore.json", "[]");
        write_json(&file_lists, "buildonly.json", "[]");
        write_json(&file_lists, "ldiskfs.json", "[]");
        write_json(&file_lists, "zfs.json", "[]");
        write_json(&file_lists, "lnet.json", "[]");
        write_json(
            &catalogs,
            "initial.json",
            r#"[{"test": "sanity", "timeout": 600}]"#,
        );
        write_json(&catalogs, "comprehensive.json", "[]");
        write_json(&catalogs, "lnet.json", "[]");
        write_json(&catalogs, "zfs.json", "[]");
        write_json(&catalogs, "ldiskfs.json", "[]");
        (file_lists, catalogs)
    }

    fn config(dir: &Path) -> FsConfig {
        FsConfig {
            outputs_dir: dir.join("outputs"),
            artifacts_dir: dir.join("artifacts"),
            syslog_dir: dir.join("syslog"),
            crashdumps_dir: dir.join("crashdumps"),
            logs_dir: dir.join("logs"),
            http_base_url: "http://status".to_string(),
            url_prefix_sub: None,
            owner_uid: 1000,
            default_distro: "centos7".to_string(),
            build_workers: 1,
            test_clusters: 1,
            crash_analyzers: 1,
            compressors: 1,
            review_poll_interval_secs: None,
            callbacks: Default::default(),
            decoder_cmd: Vec::new(),
        }
    }

    fn orchestrator(dir: &Path) -> Arc<Orchestrator> {
        orchestrator_with_review_client(dir, Arc::new(FakeReviewClient::default()))
    }

    fn orchestrator_with_review_client(
        dir: &Path,
        review_client: Arc<FakeReviewClient>,
    ) -> Arc<Orchestrator> {
        let (file_lists, catalogs) = fixture_dirs(dir);
        let store = Arc::new(Store::open(dir.join("store")).unwrap());
        Arc::new(Orchestrator::new(
            config(dir),
            store,
            review_client,
            Arc::new(FakeCrashDatabase::default()),
            Arc::new(FakeMetricsSink::default()),
            Arc::new(FakeStatusPublisher::default()),
            vec![BuilderEntry {
                distro: "centos7".to_string(),
                build_script: PathBuf::from("/bin/true"),
                worktree: dir.to_path_buf(),
                env: Default::default(),
            }],
            vec![],
            file_lists,
            catalogs,
            dir.join("commands"),
            dir.join("branches"),
        ))
    }

    fn change(n: u64) -> ChangeRecord {
        ChangeRecord {
            change_number: n,
            revision: "1".to_string(),
            branch: "master".to_string(),
            ref_spec: format!("refs/changes/{n}/{n}/1"),
            commit_message: "fix something".to_string(),
            changed_files: vec!["lustre/llite/file.c".to_string()],
            branchwide: false,
            subject: "fix something".to_string(),
        }
    }

    #[test]
    fn parses_retest_item_command() {
        let cmd: Command = serde_json::from_str(r#"{"retest-item": 42}"#).unwrap();
        assert_eq!(
            cmd,
            Command::RetestItem(RetestItem { retest_item: 42, testlist: None, distro: None })
        );
    }

    #[test]
    fn parses_abort_command() {
        let cmd: Command = serde_json::from_str(r#"{"abort": 7}"#).unwrap();
        assert_eq!(cmd, Command::Abort { abort: 7 });
    }

    #[test]
    fn parses_testlist_command_with_axes() {
        let cmd: Command =
            serde_json::from_str(r#"{"testlist": "sanity,sanityn", "DNE": true}"#).unwrap();
        match cmd {
            Command::TestList { testlist, dne, .. } => {
                assert_eq!(testlist, "sanity,sanityn");
                assert_eq!(dne, Some(true));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn parses_drain_and_stop_command() {
        let cmd: Command = serde_json::from_str(r#"{"drain-and-stop": true}"#).unwrap();
        assert_eq!(cmd, Command::DrainAndStop { drain_and_stop: true });
    }

    #[tokio::test]
    async fn poll_once_admits_unseen_change_once() {
        let dir = tempfile::tempdir().unwrap();
        let fake_client = Arc::new(FakeReviewClient::default());
        fake_client.changes.lock().push(change(1));
        let orch = orchestrator_with_review_client(dir.path(), fake_client);

        poll_once(&orch).await.unwrap();
        assert_eq!(orch.manager_queue.len(), 1);

        // A second tick with the same open change must not re-admit it.
        poll_once(&orch).await.unwrap();
        assert_eq!(orch.manager_queue.len(), 1);
    }

    #[tokio::test]
    async fn drain_commands_processes_and_removes_abort_file() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        fs::create_dir_all(&orch.commands_dir).unwrap();
        let path = orch.commands_dir.join("1.json");
        fs::write(&path, r#"{"idlestop": true}"#).unwrap();

        poll_once(&orch).await.unwrap();
        assert!(!path.exists());
        assert!(orch.stop_on_idle.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn drain_branches_builds_a_wholesale_work_item() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        fs::create_dir_all(&orch.branches_dir).unwrap();
        fs::write(orch.branches_dir.join("refs-heads-master"), "").unwrap();

        poll_once(&orch).await.unwrap();
        assert_eq!(orch.manager_queue.len(), 1);
        assert!(fs::read_dir(&orch.branches_dir).unwrap().next().is_none());
    }
}
