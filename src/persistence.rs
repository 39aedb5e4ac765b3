//! Checkpoint & recovery (spec.md §6 "Durable state layout").
//!
//! Grounded on `GerritWorkItem.save`/`save_WorkItem`/`donewith_WorkItem`
//! and `LASTBUILD_ID` handling in `gerrit_build-and-test-new.py`. Every
//! popped Work Item is checkpointed before dispatch and moved to the
//! done store on retirement (spec.md §4.1).

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;

use crate::work_item::{BuildNumber, WorkItemState};

/// File-backed store matching spec.md's `savedstate/`, `donewith/`,
/// `LASTBUILD_ID`, `failed_posts/` and `REVIEW_HISTORY` layout.
pub struct Store {
    root: PathBuf,
    /// Last 100 retired items, kept in memory for the status page
    /// (spec.md §6 "last 100 kept in memory").
    recent_done: Mutex<VecDeque<WorkItemState>>,
}

fn saved_name(build_number: BuildNumber, retest_iteration: u32) -> String {
    if retest_iteration == 0 {
        build_number.to_string()
    } else {
        format!("{build_number}-{retest_iteration}")
    }
}

impl Store {
    pub fn open(root: PathBuf) -> Result<Self> {
        for sub in ["savedstate", "donewith", "failed_posts"] {
            fs::create_dir_all(root.join(sub))
                .with_context(|| format!("creating {sub} directory"))?;
        }
        Ok(Self {
            root,
            recent_done: Mutex::new(VecDeque::with_capacity(100)),
        })
    }

    fn savedstate_path(&self, build_number: BuildNumber, retest_iteration: u32) -> PathBuf {
        self.root
            .join("savedstate")
            .join(saved_name(build_number, retest_iteration))
    }

    fn donewith_path(&self, build_number: BuildNumber, retest_iteration: u32) -> PathBuf {
        self.root
            .join("donewith")
            .join(saved_name(build_number, retest_iteration))
    }

    /// Checkpoints an in-flight item before dispatch (spec.md §4.1
    /// "Every popped item is checkpointed to the savedstate directory
    /// before dispatch").
    pub fn checkpoint(&self, state: &WorkItemState) -> Result<()> {
        let Some(build_number) = state.build_number else {
            return Ok(());
        };
        let path = self.savedstate_path(build_number, state.retest_iteration);
        let json = serde_json::to_vec_pretty(state).context("serialising work item state")?;
        fs::write(&path, json).with_context(|| format!("writing {path:?}"))
    }

    /// Retires an item: deletes it from `savedstate/`, writes it into
    /// `donewith/`, and keeps it in the in-memory ring for the status
    /// page (spec.md §6 "moved to the done directory on retirement").
    pub fn retire(&self, state: &WorkItemState) -> Result<()> {
        let Some(build_number) = state.build_number else {
            return Ok(());
        };
        let saved = self.savedstate_path(build_number, state.retest_iteration);
        let _ = fs::remove_file(&saved);

        let done = self.donewith_path(build_number, state.retest_iteration);
        let json = serde_json::to_vec_pretty(state).context("serialising work item state")?;
        fs::write(&done, json).with_context(|| format!("writing {done:?}"))?;

        let mut recent = self.recent_done.lock();
        recent.push_back(state.clone());
        if recent.len() > 100 {
            recent.pop_front();
        }
        Ok(())
    }

    /// All in-flight items from `savedstate/`, for crash recovery.
    pub fn load_in_flight(&self) -> Result<Vec<WorkItemState>> {
        let mut out = Vec::new();
        let dir = self.root.join("savedstate");
        for entry in fs::read_dir(&dir).with_context(|| format!("reading {dir:?}"))? {
            let entry = entry?;
            let content = fs::read(entry.path())
                .with_context(|| format!("reading {:?}", entry.path()))?;
            out.push(
                serde_json::from_slice(&content)
                    .with_context(|| format!("parsing {:?}", entry.path()))?,
            );
        }
        Ok(out)
    }

    pub fn recent_done(&self) -> Vec<WorkItemState> {
        self.recent_done.lock().iter().cloned().collect()
    }

    /// Loads one retired item back off disk, used to service a
    /// `retest-item` command (spec.md §6 command-channel protocol).
    pub fn load_done(
        &self,
        build_number: BuildNumber,
        retest_iteration: u32,
    ) -> Result<Option<WorkItemState>> {
        let path = self.donewith_path(build_number, retest_iteration);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read(&path).with_context(|| format!("reading {path:?}"))?;
        Ok(Some(
            serde_json::from_slice(&content).with_context(|| format!("parsing {path:?}"))?,
        ))
    }

    /// True if a retired record already exists at this build number and
    /// retest iteration, used to find the next free iteration number.
    pub fn done_exists(&self, build_number: BuildNumber, retest_iteration: u32) -> bool {
        self.donewith_path(build_number, retest_iteration).exists()
    }

    /// The next free retest iteration for `build_number`: a retest
    /// "writes a fresh HTML results file, leaving the prior one intact"
    /// (spec.md §8), so each retest claims the next unused slot.
    pub fn next_retest_iteration(&self, build_number: BuildNumber) -> u32 {
        let mut n = 1;
        while self.done_exists(build_number, n) {
            n += 1;
        }
        n
    }

    fn last_build_id_path(&self) -> PathBuf {
        self.root.join("LASTBUILD_ID")
    }

    /// Recovers the next build number (spec.md §8 "Build number
    /// uniqueness across process restarts when LASTBUILD_ID is intact").
    pub fn load_next_build_number(&self) -> BuildNumber {
        fs::read_to_string(self.last_build_id_path())
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(1)
    }

    pub fn save_next_build_number(&self, next: BuildNumber) -> Result<()> {
        fs::write(self.last_build_id_path(), next.to_string())
            .context("writing LASTBUILD_ID")
    }

    /// Persists a review POST the code-review server refused, for
    /// offline retry (spec.md §7 "Post failure").
    pub fn record_failed_post(&self, change_number: u64, revision: &str, body: &str) -> Result<()> {
        let filename = format!(
            "{}-{}-{}.json",
            change_number,
            revision,
            Utc::now().timestamp_millis()
        );
        let path = self.root.join("failed_posts").join(filename);
        fs::write(&path, body).with_context(|| format!("writing {path:?}"))
    }

    fn review_history_path(&self) -> PathBuf {
        self.root.join("REVIEW_HISTORY")
    }

    /// Appends a line `<epoch> <change-id|-> <revision|-> <score>`
    /// (spec.md §6 REVIEW_HISTORY format).
    pub fn append_review_history(
        &self,
        change_number: Option<u64>,
        revision: Option<&str>,
        score: i32,
    ) -> Result<()> {
        use std::io::Write;
        let line = format!(
            "{} {} {} {}\n",
            Utc::now().timestamp(),
            change_number.map(|n| n.to_string()).unwrap_or_else(|| "-".to_string()),
            revision.unwrap_or("-"),
            score
        );
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.review_history_path())
            .context("opening REVIEW_HISTORY")?;
        file.write_all(line.as_bytes())
            .context("appending REVIEW_HISTORY")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reads back every `(change, revision)` pair that's ever had a
    /// review posted, used by the Review Poller to skip changes already
    /// handled in a prior process lifetime (spec.md §4.6 "not in the
    /// local review-history file").
    pub fn load_review_history_keys(&self) -> Result<std::collections::HashSet<(u64, String)>> {
        let mut out = std::collections::HashSet::new();
        let Ok(content) = fs::read_to_string(self.review_history_path()) else {
            return Ok(out);
        };
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            let _epoch = parts.next();
            let change = parts.next();
            let revision = parts.next();
            if let (Some(change), Some(revision)) = (change, revision) {
                if let (Ok(change), false) = (change.parse::<u64>(), revision == "-") {
                    out.insert((change, revision.to_string()));
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work_item::{ChangeRecord, PhaseFlags};

    fn state(build_number: BuildNumber) -> WorkItemState {
        WorkItemState {
            build_number: Some(build_number),
            change: ChangeRecord {
                change_number: 1,
                revision: "1".to_string(),
                branch: "master".to_string(),
                ref_spec: "refs/changes/1/1/1".to_string(),
                commit_message: "x".to_string(),
                changed_files: vec![],
                branchwide: false,
                subject: "x".to_string(),
            },
            distro_builds: vec![],
            initial_tests: vec![],
            tests: vec![],
            flags: PhaseFlags::default(),
            retest_iteration: 0,
            artifacts_dir: None,
            crash_ids_reported: vec![],
            created_at: Utc::now(),
            high_priority: false,
        }
    }

    #[test]
    fn checkpoint_then_retire_moves_between_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().to_path_buf()).unwrap();
        let st = state(42);
        store.checkpoint(&st).unwrap();
        assert!(dir.path().join("savedstate/42").exists());

        store.retire(&st).unwrap();
        assert!(!dir.path().join("savedstate/42").exists());
        assert!(dir.path().join("donewith/42").exists());
        assert_eq!(store.recent_done().len(), 1);
    }

    #[test]
    fn load_in_flight_recovers_checkpointed_items() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().to_path_buf()).unwrap();
        store.checkpoint(&state(1)).unwrap();
        store.checkpoint(&state(2)).unwrap();
        let recovered = store.load_in_flight().unwrap();
        assert_eq!(recovered.len(), 2);
    }

    #[test]
    fn build_number_recovery_defaults_to_one_without_lastbuild_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(store.load_next_build_number(), 1);
        store.save_next_build_number(43).unwrap();
        assert_eq!(store.load_next_build_number(), 43);
    }

    #[test]
    fn review_history_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().to_path_buf()).unwrap();
        store.append_review_history(Some(7), Some("1"), 1).unwrap();
        store.append_review_history(None, None, -1).unwrap();
        let content = fs::read_to_string(dir.path().join("REVIEW_HISTORY")).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.lines().next().unwrap().ends_with("7 1 1"));
    }

    #[test]
    fn next_retest_iteration_skips_existing_done_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(store.next_retest_iteration(7), 1);

        let mut st = state(7);
        st.retest_iteration = 1;
        store.retire(&st).unwrap();
        assert_eq!(store.next_retest_iteration(7), 2);

        st.retest_iteration = 2;
        store.retire(&st).unwrap();
        assert_eq!(store.next_retest_iteration(7), 3);
    }

    #[test]
    fn load_review_history_keys_reads_back_appended_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().to_path_buf()).unwrap();
        store.append_review_history(Some(7), Some("abc123"), 1).unwrap();
        store.append_review_history(Some(8), Some("def456"), -1).unwrap();
        store.append_review_history(None, None, -1).unwrap();

        let keys = store.load_review_history_keys().unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&(7, "abc123".to_string())));
        assert!(keys.contains(&(8, "def456".to_string())));
    }
}
