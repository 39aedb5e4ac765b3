//! Test Definition Loader / Resolver (spec.md §4.2).
//!
//! Catalogues and filelists are reloaded from JSON at every invocation
//! (spec.md §9 "dynamic catalogues reloaded from JSON per invocation") --
//! the core keeps no compiled-in list.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use glob::Pattern;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::work_item::{ChangeRecord, TestAxes, TestRecord};

/// Ordered classification of a changed file (spec.md §4.2 step 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileClass {
    Ignore,
    BuildOnly,
    LdiskfsOnly,
    ZfsOnly,
    LnetOnly,
    TestScript,
    Unclassified,
}

/// fnmatch-style pattern lists loaded from `filelists/*.json` (spec.md §6).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FileLists {
    pub ignore: Vec<String>,
    pub build_only: Vec<String>,
    pub ldiskfs: Vec<String>,
    pub zfs: Vec<String>,
    pub lnet: Vec<String>,
    pub test_script: Vec<String>,
}

impl FileLists {
    pub fn load(dir: &Path) -> Result<Self> {
        let load_one = |name: &str| -> Result<Vec<String>> {
            let path = dir.join(format!("{name}.json"));
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading filelist {path:?}"))?;
            serde_json::from_str(&content).with_context(|| format!("parsing filelist {path:?}"))
        };
        Ok(Self {
            ignore: load_one("ignore")?,
            build_only: load_one("buildonly")?,
            ldiskfs: load_one("ldiskfs")?,
            zfs: load_one("zfs")?,
            lnet: load_one("lnet")?,
            test_script: load_one("test_script").unwrap_or_default(),
        })
    }

    pub fn classify(&self, path: &str) -> FileClass {
        let matches = |patterns: &[String]| {
            patterns
                .iter()
                .filter_map(|p| Pattern::new(p).ok())
                .any(|p| p.matches(path))
        };
        if matches(&self.ignore) {
            FileClass::Ignore
        } else if matches(&self.build_only) {
            FileClass::BuildOnly
        } else if matches(&self.ldiskfs) {
            FileClass::LdiskfsOnly
        } else if matches(&self.zfs) {
            FileClass::ZfsOnly
        } else if matches(&self.lnet) {
            FileClass::LnetOnly
        } else if matches(&self.test_script) {
            FileClass::TestScript
        } else {
            FileClass::Unclassified
        }
    }
}

/// Directives parsed out of the commit message (spec.md §4.2 step 2).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitDirectives {
    pub trivial: bool,
    pub force_build_only: bool,
    pub force_test_only: bool,
    pub requested_tests: Vec<String>,
}

lazy_static! {
    static ref TRIVIAL_RE: Regex = Regex::new(r"(?m)^Test-Parameters:.*\btrivial\b").unwrap();
    static ref BUILDONLY_RE: Regex =
        Regex::new(r"(?m)^Test-Parameters:.*\bforbuildonly\b").unwrap();
    static ref TESTONLY_RE: Regex =
        Regex::new(r"(?m)^Test-Parameters:.*\bfortestonly\b").unwrap();
    static ref TESTLIST_RE: Regex = Regex::new(r"testlist=([A-Za-z0-9_,\-]+)").unwrap();
}

pub fn parse_commit_directives(message: &str) -> CommitDirectives {
    let requested_tests = TESTLIST_RE
        .captures(message)
        .map(|c| c[1].split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default();
    CommitDirectives {
        trivial: TRIVIAL_RE.is_match(message),
        force_build_only: BUILDONLY_RE.is_match(message),
        force_test_only: TESTONLY_RE.is_match(message),
        requested_tests,
    }
}

/// The feature vector computed from changed-file classification and
/// commit directives (spec.md §4.2 step 3).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureVector {
    pub ldiskfs: bool,
    pub zfs: bool,
    pub lnet: bool,
    pub build_only: bool,
    pub full: bool,
    pub requested_test_set: Vec<String>,
}

pub fn compute_feature_vector(
    file_classes: &[FileClass],
    directives: &CommitDirectives,
    is_merge_commit: bool,
    force_full: bool,
) -> FeatureVector {
    let mut fv = FeatureVector {
        requested_test_set: directives.requested_tests.clone(),
        ..Default::default()
    };

    let mut any_unclassified = false;
    let mut any_non_ignore = false;
    for class in file_classes {
        match class {
            FileClass::Ignore => {}
            FileClass::BuildOnly => any_non_ignore = true,
            FileClass::LdiskfsOnly => {
                fv.ldiskfs = true;
                any_non_ignore = true;
            }
            FileClass::ZfsOnly => {
                fv.zfs = true;
                any_non_ignore = true;
            }
            FileClass::LnetOnly => {
                fv.lnet = true;
                any_non_ignore = true;
            }
            FileClass::TestScript => any_non_ignore = true,
            FileClass::Unclassified => {
                any_unclassified = true;
                any_non_ignore = true;
            }
        }
    }

    if is_merge_commit || force_full || any_unclassified {
        fv.full = true;
    }
    if directives.force_build_only
        || (!any_non_ignore && !directives.force_test_only)
    {
        fv.build_only = true;
    }
    // A LNet-only change volunteers a ZFS smoke run for integration
    // coverage (spec.md §4.2 step 3).
    if fv.lnet && !fv.zfs {
        fv.zfs = true;
    }
    fv
}

/// One entry from a `tests/*.json` catalogue (spec.md §6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogEntry {
    pub test: String,
    #[serde(default)]
    pub name: Option<String>,
    pub timeout: u64,
    #[serde(default)]
    pub testparam: Option<String>,
    #[serde(default)]
    pub dne: bool,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub ssk: bool,
    #[serde(default)]
    pub selinux: bool,
    #[serde(default)]
    pub fstype: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub onlybranch: Option<String>,
}

impl CatalogEntry {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.test)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Catalogs {
    pub initial: Vec<CatalogEntry>,
    pub comprehensive: Vec<CatalogEntry>,
    pub lnet: Vec<CatalogEntry>,
    pub zfs: Vec<CatalogEntry>,
    pub ldiskfs: Vec<CatalogEntry>,
}

impl Catalogs {
    pub fn load(dir: &Path) -> Result<Self> {
        let load_one = |name: &str| -> Result<Vec<CatalogEntry>> {
            let path = dir.join(format!("{name}.json"));
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading catalog {path:?}"))?;
            serde_json::from_str(&content).with_context(|| format!("parsing catalog {path:?}"))
        };
        Ok(Self {
            initial: load_one("initial")?,
            comprehensive: load_one("comprehensive")?,
            lnet: load_one("lnet")?,
            zfs: load_one("zfs")?,
            ldiskfs: load_one("ldiskfs")?,
        })
    }
}

/// Output of the resolver: whether to do nothing at all, plus the initial
/// and comprehensive test lists (spec.md §4.2).
pub struct ResolvedTests {
    pub do_nothing: bool,
    pub initial: Vec<TestRecord>,
    pub comprehensive: Vec<TestRecord>,
}

fn entry_to_record(entry: &CatalogEntry, fs_type: &str, dne: bool, forced: bool) -> TestRecord {
    let mut record = TestRecord::new(
        &entry.test,
        entry.display_name(),
        fs_type,
        entry.timeout,
    );
    record.axes.dne = dne;
    record.axes.ssk = entry.ssk;
    record.axes.selinux = entry.selinux;
    record.extra_env = entry.env.clone();
    record.forced = forced;
    record.disabled = entry.disabled;
    record
}

/// Derives the test name a `TestScript`-classified file names, e.g.
/// `lustre/tests/sanity.sh` -> `sanity` (spec.md §4.2 step 1 / §8 scenario
/// 3 "test-script-only patch").
fn test_name_from_script_path(path: &str) -> Option<String> {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
}

/// Force-schedules one catalogue entry across the full {ldiskfs, zfs} x
/// {DNE, non-DNE} matrix, ignoring the feature vector and the entry's own
/// `dne`/`fstype` narrowing -- used when a test's own script changed and
/// every variant needs exercising (spec.md §8 scenario 3: "force=true").
fn force_schedule_matrix(entry: &CatalogEntry, branch: &str) -> Vec<TestRecord> {
    if let Some(only) = &entry.onlybranch {
        if only != branch {
            return Vec::new();
        }
    }
    if entry.disabled {
        return Vec::new();
    }
    let mut out = Vec::new();
    for fs_type in ["ldiskfs", "zfs"] {
        for dne in [false, true] {
            out.push(entry_to_record(entry, fs_type, dne, true));
        }
    }
    out
}

/// Expands catalogue entries across the {ldiskfs, zfs} x {DNE, non-DNE}
/// matrix per the feature vector (spec.md §4.2 step 6).
fn expand_matrix(entries: &[CatalogEntry], fv: &FeatureVector, branch: &str) -> Vec<TestRecord> {
    let mut out = Vec::new();
    for entry in entries {
        if entry.disabled {
            continue;
        }
        if let Some(only) = &entry.onlybranch {
            if only != branch {
                continue;
            }
        }
        let fs_types: Vec<&str> = if let Some(fixed) = &entry.fstype {
            vec![fixed.as_str()]
        } else {
            let mut v = Vec::new();
            if fv.ldiskfs {
                v.push("ldiskfs");
            }
            if fv.zfs {
                v.push("zfs");
            }
            if v.is_empty() {
                v.push("ldiskfs");
            }
            v
        };
        let dne_options: Vec<bool> = if entry.dne { vec![false, true] } else { vec![false] };
        for fs_type in &fs_types {
            for dne in &dne_options {
                out.push(entry_to_record(entry, fs_type, *dne, false));
            }
        }
    }
    out
}

/// Runs the full resolver algorithm (spec.md §4.2 steps 1-6).
pub fn resolve(
    change: &ChangeRecord,
    file_lists: &FileLists,
    catalogs: &Catalogs,
    is_merge_commit: bool,
) -> ResolvedTests {
    let classes: Vec<FileClass> = change
        .changed_files
        .iter()
        .map(|f| file_lists.classify(f))
        .collect();
    let directives = parse_commit_directives(&change.commit_message);
    let fv = compute_feature_vector(&classes, &directives, is_merge_commit, false);

    if fv.build_only {
        return ResolvedTests {
            do_nothing: false,
            initial: Vec::new(),
            comprehensive: Vec::new(),
        };
    }

    let mut initial = expand_matrix(&catalogs.initial, &fv, &change.branch);
    let mut comprehensive = if directives.force_test_only || fv.full {
        expand_matrix(&catalogs.comprehensive, &fv, &change.branch)
    } else {
        Vec::new()
    };
    if fv.lnet {
        comprehensive.extend(expand_matrix(&catalogs.lnet, &fv, &change.branch));
    }
    if fv.zfs {
        comprehensive.extend(expand_matrix(&catalogs.zfs, &fv, &change.branch));
    }
    if fv.ldiskfs {
        comprehensive.extend(expand_matrix(&catalogs.ldiskfs, &fv, &change.branch));
    }

    // Explicitly requested tests (testlist= directive): find in any
    // catalogue and force-schedule them into the comprehensive run
    // regardless of what the feature vector would otherwise pick
    // (spec.md §4.2 step 5).
    for name in &fv.requested_test_set {
        for catalog in [
            &catalogs.initial,
            &catalogs.comprehensive,
            &catalogs.lnet,
            &catalogs.zfs,
            &catalogs.ldiskfs,
        ] {
            if let Some(entry) = catalog.iter().find(|e| e.display_name() == name) {
                for fs_type in ["ldiskfs", "zfs"] {
                    comprehensive.push(entry_to_record(entry, fs_type, false, true));
                }
            }
        }
    }

    // A changed test script forces its own test across the full matrix,
    // independent of the rest of the feature vector (spec.md §8 scenario
    // 3: "the Test-List Resolver schedules `sanity` ... with force=true").
    let script_names: Vec<String> = change
        .changed_files
        .iter()
        .zip(&classes)
        .filter(|(_, class)| **class == FileClass::TestScript)
        .filter_map(|(path, _)| test_name_from_script_path(path))
        .collect();
    for name in &script_names {
        for catalog in [
            &catalogs.initial,
            &catalogs.comprehensive,
            &catalogs.lnet,
            &catalogs.zfs,
            &catalogs.ldiskfs,
        ] {
            if let Some(entry) = catalog.iter().find(|e| &e.test == name) {
                comprehensive.extend(force_schedule_matrix(entry, &change.branch));
            }
        }
    }

    ResolvedTests {
        do_nothing: initial.is_empty() && comprehensive.is_empty(),
        initial,
        comprehensive,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change_with_files(files: &[&str], message: &str) -> ChangeRecord {
        ChangeRecord {
            change_number: 1,
            revision: "1".to_string(),
            branch: "master".to_string(),
            ref_spec: "refs/changes/1/1/1".to_string(),
            commit_message: message.to_string(),
            changed_files: files.iter().map(|s| s.to_string()).collect(),
            branchwide: false,
            subject: "x".to_string(),
        }
    }

    fn file_lists() -> FileLists {
        FileLists {
            ignore: vec!["*.md".to_string()],
            build_only: vec!["lustre/tests/build-only/**".to_string()],
            ldiskfs: vec!["lustre/ldiskfs/**".to_string()],
            zfs: vec!["lustre/osd-zfs/**".to_string()],
            lnet: vec!["lnet/**".to_string()],
            test_script: vec!["lustre/tests/*.sh".to_string()],
        }
    }

    #[test]
    fn classifies_ignore_and_build_only() {
        let fl = file_lists();
        assert_eq!(fl.classify("README.md"), FileClass::Ignore);
        assert_eq!(
            fl.classify("lustre/tests/build-only/x.c"),
            FileClass::BuildOnly
        );
        assert_eq!(fl.classify("lustre/osc/osc_io.c"), FileClass::Unclassified);
    }

    #[test]
    fn parses_trivial_and_testlist_directives() {
        let d = parse_commit_directives("fix\n\nTest-Parameters: trivial testlist=sanity,sanityn");
        assert!(d.trivial);
        assert_eq!(d.requested_tests, vec!["sanity", "sanityn"]);
    }

    #[test]
    fn build_only_patch_sets_feature_vector_build_only() {
        let change = change_with_files(&["lustre/tests/build-only/x.c"], "trivial fix");
        let classes: Vec<_> = change
            .changed_files
            .iter()
            .map(|f| file_lists().classify(f))
            .collect();
        let fv = compute_feature_vector(&classes, &CommitDirectives::default(), false, false);
        assert!(fv.build_only);
    }

    #[test]
    fn unclassified_file_forces_full() {
        let change = change_with_files(&["lustre/osc/osc_io.c"], "trivial fix");
        let classes: Vec<_> = change
            .changed_files
            .iter()
            .map(|f| file_lists().classify(f))
            .collect();
        let fv = compute_feature_vector(&classes, &CommitDirectives::default(), false, false);
        assert!(fv.full);
        assert!(!fv.build_only);
    }

    #[test]
    fn lnet_only_volunteers_zfs() {
        let change = change_with_files(&["lnet/lnet/api-ni.c"], "fix lnet");
        let classes: Vec<_> = change
            .changed_files
            .iter()
            .map(|f| file_lists().classify(f))
            .collect();
        let fv = compute_feature_vector(&classes, &CommitDirectives::default(), false, false);
        assert!(fv.lnet);
        assert!(fv.zfs);
    }

    fn sample_catalogs() -> Catalogs {
        Catalogs {
            initial: vec![CatalogEntry {
                test: "sanity".to_string(),
                name: None,
                timeout: 600,
                testparam: None,
                dne: true,
                env: HashMap::new(),
                ssk: false,
                selinux: false,
                fstype: None,
                disabled: false,
                onlybranch: None,
            }],
            comprehensive: vec![CatalogEntry {
                test: "sanityn".to_string(),
                name: None,
                timeout: 2000,
                testparam: None,
                dne: false,
                env: HashMap::new(),
                ssk: false,
                selinux: false,
                fstype: None,
                disabled: false,
                onlybranch: None,
            }],
            lnet: vec![],
            zfs: vec![],
            ldiskfs: vec![],
        }
    }

    #[test]
    fn build_only_change_schedules_nothing() {
        let change = change_with_files(&["lustre/tests/build-only/x.c"], "fix");
        let resolved = resolve(&change, &file_lists(), &sample_catalogs(), false);
        assert!(resolved.do_nothing);
        assert!(resolved.initial.is_empty());
        assert!(resolved.comprehensive.is_empty());
    }

    #[test]
    fn unclassified_change_schedules_initial_and_comprehensive() {
        let change = change_with_files(&["lustre/osc/osc_io.c"], "fix real code");
        let resolved = resolve(&change, &file_lists(), &sample_catalogs(), false);
        assert!(!resolved.initial.is_empty());
        assert!(!resolved.comprehensive.is_empty());
        // sanity has dne=true: expect both ldiskfs non-DNE and DNE variants.
        assert_eq!(resolved.initial.len(), 2);
    }

    #[test]
    fn test_script_only_change_schedules_only_that_test() {
        let change = change_with_files(&["lustre/tests/sanity.sh"], "touch up sanity.sh");
        let resolved = resolve(&change, &file_lists(), &sample_catalogs(), false);
        // sanity.sh changing forces `sanity` across the full {ldiskfs,
        // zfs} x {DNE, non-DNE} matrix into comprehensive (spec.md §8
        // scenario 3), even though `sanity` otherwise only lives in the
        // initial catalogue; nothing else shows up in comprehensive.
        assert_eq!(resolved.comprehensive.len(), 4);
        assert!(resolved
            .comprehensive
            .iter()
            .all(|t| t.script == "sanity" && t.forced));
        let variants: std::collections::HashSet<(String, bool)> = resolved
            .comprehensive
            .iter()
            .map(|t| (t.fs_type.clone(), t.axes.dne))
            .collect();
        assert_eq!(variants.len(), 4);
        assert!(variants.contains(&("ldiskfs".to_string(), false)));
        assert!(variants.contains(&("ldiskfs".to_string(), true)));
        assert!(variants.contains(&("zfs".to_string(), false)));
        assert!(variants.contains(&("zfs".to_string(), true)));
    }
}
