//! Daemon entry point (spec.md §6 "Configuration files", "Exit codes").
//!
//! Loads `fsconfig`, the test-node/builder descriptor arrays, and the
//! file-lists/catalogs directories, then runs the Orchestrator until it
//! is told to stop (`{idlestop}`) or interrupted. Real `ReviewClient`/
//! `CrashDatabase`/`MetricsSink`/`StatusPublisher` implementations are
//! outside this crate's scope (spec.md §1, §6 "Externalised
//! dependencies"), so this binary wires the in-memory fakes; a real
//! deployment links `fsci` as a library and supplies its own
//! collaborators to `Orchestrator::new`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use directories::ProjectDirs;
use fsci::config::{builders_filename, load_builders, load_test_nodes, BuilderEntry, FsConfig};
use fsci::external::fakes::{FakeCrashDatabase, FakeMetricsSink, FakeReviewClient, FakeStatusPublisher};
use fsci::orchestrator::Orchestrator;
use fsci::persistence::Store;
use fsci::status;
use log::{error, info};

/// fsci -- autonomous CI orchestrator for a kernel-level distributed
/// filesystem (spec.md §1).
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the fsconfig TOML file.
    #[arg(long, default_value = "fsconfig.toml")]
    fsconfig: PathBuf,

    /// Path to the test-nodes-config JSON array.
    #[arg(long, default_value = "test-nodes-config")]
    test_nodes: PathBuf,

    /// Architectures to load `builders-<arch>` descriptors for.
    #[arg(long, value_delimiter = ',', default_value = "x86_64")]
    arches: Vec<String>,

    /// Directory containing `{ignore,buildonly,ldiskfs,zfs,lnet}.json`.
    #[arg(long, default_value = "filelists")]
    file_lists_dir: PathBuf,

    /// Directory containing `{initial,comprehensive,lnet,zfs,ldiskfs}.json`.
    #[arg(long, default_value = "tests")]
    catalogs_dir: PathBuf,

    /// Directory polled for command-channel JSON files.
    #[arg(long, default_value = "commands")]
    commands_dir: PathBuf,

    /// Directory polled for branch-tip regression sweep drop files.
    #[arg(long, default_value = "branches")]
    branches_dir: PathBuf,

    /// Directory under which `savedstate/`, `donewith/` etc. live; falls
    /// back to the platform state directory if unset.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Bind address for the HTML status page (spec.md §6 "Published HTML").
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: std::net::SocketAddr,
}

fn state_dir(args: &Args) -> PathBuf {
    if let Some(dir) = &args.state_dir {
        return dir.clone();
    }
    ProjectDirs::from("", "", "fsci")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./fsci-state"))
}

fn load_builder_entries(args: &Args) -> anyhow::Result<Vec<BuilderEntry>> {
    let mut builders = Vec::new();
    for arch in &args.arches {
        let path = PathBuf::from(builders_filename(arch));
        if !path.exists() {
            info!("no builders file for arch {arch} at {path:?}, skipping");
            continue;
        }
        builders.extend(load_builders(&path)?);
    }
    Ok(builders)
}

/// Polls `stop_on_idle`/the work-item set and returns once the daemon has
/// drained cleanly (spec.md §6 "0 on clean idle-stop").
async fn wait_for_idle_stop(orchestrator: Arc<Orchestrator>) {
    loop {
        tokio::time::sleep(Duration::from_secs(5)).await;
        if orchestrator.stop_on_idle.load(Ordering::SeqCst)
            && orchestrator.scheduler.in_flight().is_empty()
            && orchestrator.manager_queue.is_empty()
            && orchestrator.build_queue.is_empty()
            && orchestrator.test_queue.is_empty()
        {
            return;
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = FsConfig::load(&args.fsconfig)?;
    config.validate()?;

    let builders = load_builder_entries(&args)?;
    let test_nodes = if args.test_nodes.exists() {
        load_test_nodes(&args.test_nodes)?
    } else {
        info!("no test-nodes-config at {:?}, starting with an empty cluster pool", args.test_nodes);
        Vec::new()
    };

    let store = Arc::new(Store::open(state_dir(&args))?);

    let review_client = Arc::new(FakeReviewClient::default());
    let crash_db = Arc::new(FakeCrashDatabase::default());
    let metrics = Arc::new(FakeMetricsSink::default());
    let status_publisher = Arc::new(FakeStatusPublisher::default());

    let orchestrator = Arc::new(Orchestrator::new(
        config,
        store,
        review_client,
        crash_db,
        metrics,
        status_publisher,
        builders,
        test_nodes,
        args.file_lists_dir,
        args.catalogs_dir,
        args.commands_dir,
        args.branches_dir,
    ));

    let recovered = orchestrator.recover()?;
    if recovered > 0 {
        info!("recovered {recovered} in-flight work item(s)");
    }

    let run_handle = tokio::spawn(orchestrator.clone().run());
    let status_handle = tokio::spawn(status::serve(orchestrator.clone(), args.listen));

    tokio::select! {
        _ = wait_for_idle_stop(orchestrator.clone()) => {
            info!("idle-stop requested and work-item set drained, shutting down");
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            anyhow::bail!("interrupted");
        }
        res = run_handle => {
            res?;
            Ok(())
        }
        res = status_handle => {
            res??;
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{} {e}", "failed to start tokio runtime:".red());
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run(args)) {
        Ok(()) => {
            println!("{}", "fsci exiting cleanly (idle-stop)".green());
            ExitCode::SUCCESS
        }
        Err(e) if e.to_string() == "interrupted" => {
            println!("{}", "fsci interrupted".yellow());
            ExitCode::from(1)
        }
        Err(e) => {
            error!("fatal: {e}");
            eprintln!("{} {e}", "fsci failed:".red());
            ExitCode::from(2)
        }
    }
}
