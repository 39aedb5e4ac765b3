//! Configuration files (spec.md §6 "Configuration files").
//!
//! `fsconfig` is the daemon's own human-authored config, loaded once at
//! startup -- same role and format (`toml`) as the teacher's `Config`.
//! `test-nodes-config` and `builders-<arch>` are arrays of descriptors
//! the teacher's `Resource`/`Command` pair doesn't have an equivalent
//! for, so those are modelled fresh but loaded the same way.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::test_worker::ClusterSlot;

/// External callback executables, invoked with fixed positional argv and
/// whose exit codes are ignored (spec.md §6 "Callbacks").
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Callbacks {
    pub power_cb: Option<PathBuf>,
    pub testsetdone_cb: Option<PathBuf>,
    pub testdone_cb: Option<PathBuf>,
    pub completion_cb: Option<PathBuf>,
}

/// The daemon's main configuration file (spec.md §6 "fsconfig").
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FsConfig {
    pub outputs_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub syslog_dir: PathBuf,
    pub crashdumps_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub http_base_url: String,
    #[serde(default)]
    pub url_prefix_sub: Option<(String, String)>,
    pub owner_uid: u32,
    pub default_distro: String,
    pub build_workers: usize,
    pub test_clusters: usize,
    pub crash_analyzers: usize,
    pub compressors: usize,
    #[serde(default)]
    pub review_poll_interval_secs: Option<u64>,
    #[serde(default)]
    pub callbacks: Callbacks,
    /// External decoder invocation producing `<core>-dmesg.txt` /
    /// `<core>-decoded-bt.txt` for the Crash Analyzer pool (spec.md
    /// §4.5 step 1); empty skips patch correlation.
    #[serde(default)]
    pub decoder_cmd: Vec<String>,
}

impl FsConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading fsconfig {path:?}"))?;
        toml::from_str(&content).with_context(|| format!("parsing fsconfig {path:?}"))
    }

    /// Rewrites a URL according to `url_prefix_sub`, used when the
    /// code-review server and the worker fleet disagree about the
    /// reachable hostname for artifact URLs.
    pub fn substitute_url(&self, url: &str) -> String {
        match &self.url_prefix_sub {
            Some((from, to)) if url.starts_with(from.as_str()) => {
                format!("{to}{}", &url[from.len()..])
            }
            _ => url.to_string(),
        }
    }

    /// Applies §6 "non-zero on fatal misconfiguration (missing owner
    /// uid)": `owner_uid` is a required TOML field, so the only thing
    /// left to check here is that it isn't the sentinel "unset" value 0.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.owner_uid != 0, "fsconfig: owner_uid must be set");
        Ok(())
    }
}

/// One test-cluster descriptor from `test-nodes-config` (spec.md §6
/// "array of test-cluster descriptors").
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestNodeEntry {
    pub server_boot_cmd: Vec<String>,
    pub client_boot_cmd: Vec<String>,
    pub server_hostname: String,
    pub client_hostname: String,
    pub server_arch: String,
    pub client_arch: String,
}

impl From<TestNodeEntry> for ClusterSlot {
    fn from(e: TestNodeEntry) -> Self {
        ClusterSlot {
            server_boot_cmd: e.server_boot_cmd,
            client_boot_cmd: e.client_boot_cmd,
            server_hostname: e.server_hostname,
            client_hostname: e.client_hostname,
        }
    }
}

pub fn load_test_nodes(path: &Path) -> Result<Vec<TestNodeEntry>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading test-nodes-config {path:?}"))?;
    serde_json::from_str(&content).with_context(|| format!("parsing test-nodes-config {path:?}"))
}

/// One builder descriptor from `builders-<arch>` (spec.md §6 "array of
/// builder descriptors").
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuilderEntry {
    pub distro: String,
    pub build_script: PathBuf,
    pub worktree: PathBuf,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

pub fn load_builders(path: &Path) -> Result<Vec<BuilderEntry>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading builders config {path:?}"))?;
    serde_json::from_str(&content).with_context(|| format!("parsing builders config {path:?}"))
}

pub fn builders_filename(arch: &str) -> String {
    format!("builders-{arch}")
}

/// Loads one warning-catalogue file (`console_errors_lookup.json` or
/// `suite_errors_lookup.json`, spec.md §6). Missing files contribute no
/// entries rather than erroring, since a daemon may configure only one
/// of the two.
pub fn load_warning_catalogue(path: &Path) -> Result<Vec<crate::test_worker::WarningEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading warning catalogue {path:?}"))?;
    serde_json::from_str(&content).with_context(|| format!("parsing warning catalogue {path:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn parses_fsconfig_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "fsconfig.toml",
            r#"
                outputs_dir = "/var/ci/outputs"
                artifacts_dir = "/var/ci/artifacts"
                syslog_dir = "/var/ci/syslog"
                crashdumps_dir = "/var/ci/crashdumps"
                logs_dir = "/var/ci/logs"
                http_base_url = "http://ci.example.com"
                owner_uid = 1000
                default_distro = "el8"
                build_workers = 4
                test_clusters = 8
                crash_analyzers = 2
                compressors = 1
            "#,
        );
        let cfg = FsConfig::load(&path).unwrap();
        assert_eq!(cfg.owner_uid, 1000);
        assert_eq!(cfg.build_workers, 4);
        cfg.validate().unwrap();
    }

    #[test]
    fn missing_owner_uid_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "fsconfig.toml",
            r#"
                outputs_dir = "/o"
                artifacts_dir = "/a"
                syslog_dir = "/s"
                crashdumps_dir = "/c"
                logs_dir = "/l"
                http_base_url = "http://ci"
                owner_uid = 0
                default_distro = "el8"
                build_workers = 1
                test_clusters = 1
                crash_analyzers = 1
                compressors = 1
            "#,
        );
        let cfg = FsConfig::load(&path).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn url_prefix_substitution() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "fsconfig.toml",
            r#"
                outputs_dir = "/o"
                artifacts_dir = "/a"
                syslog_dir = "/s"
                crashdumps_dir = "/c"
                logs_dir = "/l"
                http_base_url = "http://ci"
                url_prefix_sub = ["http://internal", "http://public"]
                owner_uid = 1
                default_distro = "el8"
                build_workers = 1
                test_clusters = 1
                crash_analyzers = 1
                compressors = 1
            "#,
        );
        let cfg = FsConfig::load(&path).unwrap();
        assert_eq!(
            cfg.substitute_url("http://internal/x/y"),
            "http://public/x/y"
        );
        assert_eq!(cfg.substitute_url("http://other/x"), "http://other/x");
    }

    #[test]
    fn loads_test_nodes_and_builders_json() {
        let dir = tempfile::tempdir().unwrap();
        let nodes_path = write(
            dir.path(),
            "test-nodes-config",
            r#"[{
                "server_boot_cmd": ["qemu", "server"],
                "client_boot_cmd": ["qemu", "client"],
                "server_hostname": "srv1",
                "client_hostname": "cli1",
                "server_arch": "x86_64",
                "client_arch": "x86_64"
            }]"#,
        );
        let nodes = load_test_nodes(&nodes_path).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].server_hostname, "srv1");
        let slot: ClusterSlot = nodes[0].clone().into();
        assert_eq!(slot.server_hostname, "srv1");

        let builders_path = write(
            dir.path(),
            &builders_filename("x86_64"),
            r#"[{"distro": "el8", "build_script": "/bin/build.sh", "worktree": "/srv/worktree"}]"#,
        );
        let builders = load_builders(&builders_path).unwrap();
        assert_eq!(builders.len(), 1);
        assert_eq!(builders[0].distro, "el8");
    }
}
