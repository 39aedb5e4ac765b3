//! External collaborator traits (spec.md §1 "out of scope", §6
//! "Externalised dependencies"). The core only consumes these interfaces;
//! real implementations (a Gerrit-style REST client, a SQL-backed crash
//! store, an InfluxDB metrics sink per `mystatswriter.py`) live outside
//! this crate's scope.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::work_item::{ChangeRecord, ReviewAnnotation};

/// A single inline review comment attached to a line of a file (spec.md
/// §4.5 step 5, "Crash ID N in test T").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineComment {
    pub path: String,
    pub line: u32,
    pub message: String,
}

/// Review to post for one change/revision (spec.md §6 POST
/// `/changes/<id>/revisions/<rev>/review`).
#[derive(Debug, Clone)]
pub struct ReviewPost {
    pub message: String,
    pub score: i32,
    pub inline_comments: Vec<InlineComment>,
}

/// The code-review server API client (out of scope per spec.md §1).
#[async_trait]
pub trait ReviewClient: Send + Sync {
    async fn open_changes(&self) -> Result<Vec<ChangeRecord>>;
    async fn post_review(
        &self,
        change_number: u64,
        revision: &str,
        review: ReviewPost,
    ) -> Result<()>;
}

/// One row's worth of known-crash lookup result (spec.md §4.5 step 3).
#[derive(Debug, Clone)]
pub struct KnownCrash {
    pub bug_id: u64,
    pub extra_info: Option<String>,
}

/// Key used to correlate crashes (spec.md §4.5 steps 3-4).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CrashKey {
    pub trigger: String,
    pub function: String,
    pub backtrace_prefix: String,
    pub test_line: Option<String>,
    pub in_logs: Option<String>,
}

/// The SQL store recording known crashes and historical failures (out of
/// scope per spec.md §1; tables `known_crashes`, `new_crashes`, `triage`,
/// `failures`, `warnings`, `blacklisted` per §6).
#[async_trait]
pub trait CrashDatabase: Send + Sync {
    async fn lookup_known(&self, key: &CrashKey) -> Result<Option<KnownCrash>>;
    /// Looks up (or inserts) an untriaged crash by its exact backtrace.
    /// Returns the assigned id and whether it is new.
    async fn record_untriaged(&self, key: &CrashKey, exact_backtrace_hash: &str)
        -> Result<(u64, bool, u64)>;
    /// Classifies subtest names as new-failure (unseen in 30d, not
    /// blacklisted) or known (with an aggregate count), per §4.4 step 6.
    async fn classify_failures(
        &self,
        branch: &str,
        subtest_names: &[String],
    ) -> Result<HashMap<String, Option<u64>>>;
    async fn record_warning(&self, branch: &str, text: &str) -> Result<bool>;
}

/// Periodic pool gauges (queue depth, busy/idle/dead worker counts),
/// grounded on `mystatswriter.py`. Out of scope as a collaborator, but the
/// core still calls it (SPEC_FULL.md "ambient concerns carried").
pub trait MetricsSink: Send + Sync {
    fn pool_gauges(&self, pool_name: &str, total: u64, busy: u64, idle: u64, queue_depth: u64);
}

/// Renders the per-build HTML results page (spec.md §6 "Published HTML").
pub trait StatusPublisher: Send + Sync {
    fn publish(&self, build_number: u64, html: &str) -> Result<()>;
}

/// Compile-error parser output, used by the Build Worker to translate
/// stderr into review annotations (spec.md §4.3).
pub fn resolve_annotation_path(raw_path: &str, changed_files: &[String]) -> Option<String> {
    if changed_files.iter().any(|f| f == raw_path) {
        return Some(raw_path.to_string());
    }
    // Source emits basename-only paths sometimes; resolve against the
    // change's file list, dropping unresolvable paths (spec.md §4.3).
    let basename = raw_path.rsplit('/').next().unwrap_or(raw_path);
    let matches: Vec<&String> = changed_files
        .iter()
        .filter(|f| f.rsplit('/').next() == Some(basename))
        .collect();
    match matches.as_slice() {
        [only] => Some((*only).clone()),
        _ => None,
    }
}

/// Turns parsed `(path, line, severity, message)` compile-error lines into
/// `ReviewAnnotation`s, dropping those whose path doesn't resolve.
pub fn build_annotations(
    raw: Vec<(String, u32, String, String)>,
    changed_files: &[String],
) -> Vec<ReviewAnnotation> {
    raw.into_iter()
        .filter_map(|(path, line, severity, message)| {
            resolve_annotation_path(&path, changed_files).map(|path| ReviewAnnotation {
                path,
                line,
                severity,
                message,
            })
        })
        .collect()
}

#[cfg(any(test, feature = "test-fakes"))]
pub mod fakes {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct FakeReviewClient {
        pub changes: Mutex<Vec<ChangeRecord>>,
        pub posted: Mutex<Vec<(u64, String, ReviewPost)>>,
    }

    #[async_trait]
    impl ReviewClient for FakeReviewClient {
        async fn open_changes(&self) -> Result<Vec<ChangeRecord>> {
            Ok(self.changes.lock().clone())
        }

        async fn post_review(
            &self,
            change_number: u64,
            revision: &str,
            review: ReviewPost,
        ) -> Result<()> {
            self.posted
                .lock()
                .push((change_number, revision.to_string(), review));
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeCrashDatabase {
        pub known: Mutex<HashMap<CrashKey, KnownCrash>>,
        pub untriaged: Mutex<HashMap<String, (u64, u64)>>,
        pub next_id: Mutex<u64>,
        pub blacklisted: Mutex<std::collections::HashSet<String>>,
        pub known_failures: Mutex<HashMap<String, u64>>,
    }

    #[async_trait]
    impl CrashDatabase for FakeCrashDatabase {
        async fn lookup_known(&self, key: &CrashKey) -> Result<Option<KnownCrash>> {
            Ok(self.known.lock().get(key).cloned())
        }

        async fn record_untriaged(
            &self,
            _key: &CrashKey,
            exact_backtrace_hash: &str,
        ) -> Result<(u64, bool, u64)> {
            let mut untriaged = self.untriaged.lock();
            if let Some((id, count)) = untriaged.get_mut(exact_backtrace_hash) {
                *count += 1;
                return Ok((*id, false, *count));
            }
            let mut next_id = self.next_id.lock();
            *next_id += 1;
            let id = *next_id;
            untriaged.insert(exact_backtrace_hash.to_string(), (id, 1));
            Ok((id, true, 1))
        }

        async fn classify_failures(
            &self,
            _branch: &str,
            subtest_names: &[String],
        ) -> Result<HashMap<String, Option<u64>>> {
            let blacklisted = self.blacklisted.lock();
            let known = self.known_failures.lock();
            Ok(subtest_names
                .iter()
                .filter(|name| !blacklisted.contains(*name))
                .map(|name| (name.clone(), known.get(name).copied()))
                .collect())
        }

        async fn record_warning(&self, _branch: &str, _text: &str) -> Result<bool> {
            Ok(true)
        }
    }

    #[derive(Default)]
    pub struct FakeMetricsSink {
        pub samples: Mutex<Vec<(String, u64, u64, u64, u64)>>,
    }

    impl MetricsSink for FakeMetricsSink {
        fn pool_gauges(&self, pool_name: &str, total: u64, busy: u64, idle: u64, queue_depth: u64) {
            self.samples
                .lock()
                .push((pool_name.to_string(), total, busy, idle, queue_depth));
        }
    }

    #[derive(Default)]
    pub struct FakeStatusPublisher {
        pub pages: Mutex<HashMap<u64, String>>,
    }

    impl StatusPublisher for FakeStatusPublisher {
        fn publish(&self, build_number: u64, html: &str) -> Result<()> {
            self.pages.lock().insert(build_number, html.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_exact_path() {
        let files = vec!["lustre/llite/file.c".to_string()];
        assert_eq!(
            resolve_annotation_path("lustre/llite/file.c", &files),
            Some("lustre/llite/file.c".to_string())
        );
    }

    #[test]
    fn resolves_basename_only_path() {
        let files = vec!["lustre/llite/file.c".to_string()];
        assert_eq!(
            resolve_annotation_path("file.c", &files),
            Some("lustre/llite/file.c".to_string())
        );
    }

    #[test]
    fn drops_unresolvable_path() {
        let files = vec!["lustre/llite/file.c".to_string()];
        assert_eq!(resolve_annotation_path("other.c", &files), None);
    }

    #[test]
    fn drops_ambiguous_basename() {
        let files = vec![
            "a/file.c".to_string(),
            "b/file.c".to_string(),
        ];
        assert_eq!(resolve_annotation_path("file.c", &files), None);
    }
}
