// Bootcache - Checkpointed Guest Test Harness
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::Context;
use bootcache_config::SuiteManifest;
use bootcache_core::cpu::StackMonitor;
use bootcache_core::net::PacketLog;
use bootcache_core::realtime::RealtimeConfig;
use bootcache_core::report::{CaseStatus, SuiteReport};
use bootcache_core::runner::TestRunner;
use bootcache_core::snapshot::MachineSnapshot;
use bootcache_core::MachineBlueprint;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

/// Exit code for configuration and setup errors, as opposed to failing tests.
const EXIT_SETUP_ERROR: u8 = 2;

/// How many lines of the boot transcript to show.
const BOOT_TAIL: usize = 5;

/// How many packet log entries to print after a networked run.
const PACKET_LOG_TAIL: usize = 60;

#[derive(Parser, Debug)]
#[command(name = "bootcache", author, version, about, long_about = None)]
struct Cli {
    /// Enable debug-level logging (per batch and per chunk detail)
    #[arg(short, long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Boot once, snapshot, and run every test case of a suite
    Run(RunArgs),
    /// Boot once and write the post-boot snapshot to a file
    Snapshot(SnapshotArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to the suite manifest (YAML)
    #[arg(long)]
    suite: PathBuf,

    /// Only run tests whose name contains this string
    #[arg(long)]
    filter: Option<String>,

    /// Skip the boot and restore from a saved snapshot instead
    #[arg(long)]
    snapshot_in: Option<PathBuf>,

    /// Save the post-boot snapshot here
    #[arg(long)]
    snapshot_out: Option<PathBuf>,

    /// Directory for result.json and junit.xml
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Write a JUnit XML report to this path
    #[arg(long)]
    junit: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SnapshotArgs {
    /// Path to the suite manifest (YAML)
    #[arg(long)]
    suite: PathBuf,

    /// Where to write the snapshot
    #[arg(long)]
    out: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.trace {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Run(args) => run(args),
        Commands::Snapshot(args) => snapshot(args),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(EXIT_SETUP_ERROR)
        }
    }
}

fn load_suite(path: &Path) -> anyhow::Result<(SuiteManifest, MachineBlueprint)> {
    let manifest = SuiteManifest::from_file(path)
        .with_context(|| format!("Failed to load suite {}", path.display()))?;
    let blueprint = MachineBlueprint::from_config(&manifest.machine)
        .context("Invalid machine configuration")?;
    blueprint.validate()?;
    Ok((manifest, blueprint))
}

fn boot_snapshot(
    manifest: &SuiteManifest,
    blueprint: &MachineBlueprint,
) -> anyhow::Result<Arc<MachineSnapshot>> {
    info!("Booting guest ({} boot lines)", manifest.boot.lines.len());
    let boot = TestRunner::<StackMonitor>::boot(blueprint, &manifest.boot)
        .context("Boot did not complete")?;
    for line in boot.tail(BOOT_TAIL) {
        info!("boot: {}", line);
    }
    let errors = boot.load_errors();
    if !errors.is_empty() {
        warn!("{} errors during load:", errors.len());
        for line in errors {
            warn!("  {}", line);
        }
    }
    info!(
        "Guest ready after {} steps (cycle {}), snapshot digest {}",
        boot.outcome.steps,
        boot.snapshot.cpu().cycle_count(),
        boot.snapshot.digest()
    );
    Ok(boot.snapshot)
}

fn snapshot(args: SnapshotArgs) -> anyhow::Result<ExitCode> {
    let (manifest, blueprint) = load_suite(&args.suite)?;
    let snapshot = boot_snapshot(&manifest, &blueprint)?;
    snapshot
        .save(&args.out)
        .with_context(|| format!("Failed to write snapshot {}", args.out.display()))?;
    println!("{}", snapshot.digest());
    Ok(ExitCode::SUCCESS)
}

fn run(args: RunArgs) -> anyhow::Result<ExitCode> {
    let (manifest, blueprint) = load_suite(&args.suite)?;

    let packet_log = match (&manifest.network, manifest.needs_network()) {
        (Some(network), true) => Some(network_precheck(&network.interface)?),
        _ => None,
    };

    let snapshot = match &args.snapshot_in {
        Some(path) => Arc::new(
            MachineSnapshot::load(path)
                .with_context(|| format!("Failed to load snapshot {}", path.display()))?,
        ),
        None => boot_snapshot(&manifest, &blueprint)?,
    };
    if let Some(path) = &args.snapshot_out {
        snapshot
            .save(path)
            .with_context(|| format!("Failed to write snapshot {}", path.display()))?;
    }

    let mut runner = TestRunner::<StackMonitor>::new(blueprint, snapshot)
        .with_limits(manifest.limits.clone())
        .with_realtime(RealtimeConfig::from_tuning(&manifest.realtime));
    if let (Some(network), Some(log)) = (&manifest.network, &packet_log) {
        runner = runner.with_backend_factory(tap_factory(network.interface.clone(), log.clone()));
    }

    let report = runner
        .run_all(&manifest.tests, args.filter.as_deref())
        .context("Test battery aborted")?;

    print_report(&report);
    if let Some(log) = &packet_log {
        print_packet_log(log);
    }

    let suite_name = args
        .suite
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "bootcache".to_string());
    if let Some(dir) = &args.output_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
        report.write_json(&dir.join("result.json"))?;
        report.write_junit(&dir.join("junit.xml"), &suite_name)?;
    }
    if let Some(path) = &args.junit {
        report.write_junit(path, &suite_name)?;
    }

    Ok(ExitCode::from(report.exit_code() as u8))
}

#[cfg(target_os = "linux")]
fn network_precheck(interface: &str) -> anyhow::Result<PacketLog> {
    bootcache_core::net::tap::require_interface(interface).with_context(|| {
        format!(
            "Real-time tests need a TAP device. Create it with:\n  \
             sudo ip tuntap add dev {0} mode tap user $USER\n  \
             sudo ip addr add 10.64.0.1/24 dev {0}\n  \
             sudo ip link set {0} up",
            interface
        )
    })?;
    Ok(PacketLog::new())
}

#[cfg(not(target_os = "linux"))]
fn network_precheck(interface: &str) -> anyhow::Result<PacketLog> {
    anyhow::bail!("Real-time tests need a Linux TAP device ({interface})")
}

#[cfg(target_os = "linux")]
fn tap_factory(interface: String, log: PacketLog) -> bootcache_core::runner::BackendFactory {
    use bootcache_core::net::tap::TapBackend;
    use bootcache_core::net::LoggingBackend;

    Box::new(move || {
        let tap = TapBackend::open(&interface)?;
        tracing::debug!("Opened a fresh TAP handle on {}", tap.name());
        let backend: bootcache_core::NicBackend = Box::new(LoggingBackend::new(tap, log.clone()));
        Ok(backend)
    })
}

#[cfg(not(target_os = "linux"))]
fn tap_factory(interface: String, _log: PacketLog) -> bootcache_core::runner::BackendFactory {
    Box::new(move || Err(bootcache_core::HarnessError::MissingInterface(interface.clone())))
}

fn print_report(report: &SuiteReport) {
    for result in &report.results {
        println!("  {:<4}  {}", result.status.label(), result.name);
        match &result.status {
            CaseStatus::Pass => {}
            CaseStatus::Fail { reason } => println!("        {}", reason),
            CaseStatus::Error { message } => println!("        {}", message),
        }
    }

    println!();
    println!(
        "Results: {} passed, {} failed, {} errors",
        report.passed(),
        report.failed(),
        report.errored()
    );
    let failing = report.failing_names();
    if !failing.is_empty() {
        println!("Failures: {}", failing.join(", "));
    }
}

fn print_packet_log(log: &PacketLog) {
    let tail = log.tail(PACKET_LOG_TAIL);
    println!();
    println!("Packet log (last {} of {}):", tail.len(), log.len());
    for entry in tail {
        println!("  {}", entry.summary);
    }
}
