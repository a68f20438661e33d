//! contentsync - Keep a local mirror of a published content tree in sync.
//!
//! Usage:
//!   contentsync scan DIR [--export FILE]       Summarize a local tree
//!   contentsync plan --remote DOC DIR          Show what a sync would change
//!   contentsync sync --config FILE [--apply]   Download changes into staging
//!   contentsync apply --config FILE            Apply staged changes
//!   contentsync unpack --config FILE           Seed an empty content root
//!   contentsync --help                         Show help

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Context, Result, bail};
use tracing_subscriber::EnvFilter;

use contentsync_core::{
    DocumentParser, JsonDocumentParser, PlanEntry, ScanConfig, Snapshot, SyncConfig, SyncPlan,
    SyncPolicy, compute_sync_plan, is_text_file,
};
use contentsync_engine::{SyncEvent, SyncListener, SyncOrchestrator, SyncStatus};
use contentsync_scan::LocalScanner;

#[derive(Parser)]
#[command(
    name = "contentsync",
    version,
    about = "Keep a local mirror of a published content tree in sync",
    long_about = "contentsync compares a local directory against a remote content \
                  document, downloads what changed into a staging area and applies \
                  it in one step."
)]
struct Cli {
    /// Log debug output (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan a directory and show a summary
    Scan {
        /// Directory to scan
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Write the snapshot as a content document to this file
        #[arg(short, long)]
        export: Option<PathBuf>,

        /// Glob patterns to leave out
        #[arg(short, long)]
        ignore: Vec<String>,
    },

    /// Compare a directory against a remote content document
    Plan {
        /// Content document (JSON) describing the remote tree
        #[arg(short, long)]
        remote: PathBuf,

        /// Local directory
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Treat every remote file as modified
        #[arg(short, long)]
        force: bool,

        /// Report whether the directory layout changed
        #[arg(short, long)]
        structure: bool,
    },

    /// Fetch the remote documents and download changes into staging
    Sync {
        /// Configuration file (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Apply the staged changes once downloads succeed
        #[arg(short, long)]
        apply: bool,

        /// Re-download every remote file
        #[arg(short, long)]
        force: bool,
    },

    /// Apply staged changes to the content root
    Apply {
        /// Configuration file (TOML)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Unpack the bootstrap archive into an empty content root
    Unpack {
        /// Configuration file (TOML)
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Scan {
            path,
            export,
            ignore,
        } => run_scan(&path, export.as_deref(), ignore)?,
        Command::Plan {
            remote,
            path,
            force,
            structure,
        } => run_plan(&remote, &path, force, structure)?,
        Command::Sync {
            config,
            apply,
            force,
        } => run_sync(&config, apply, force).await?,
        Command::Apply { config } => run_apply(&config).await?,
        Command::Unpack { config } => run_unpack(&config).await?,
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "contentsync=debug"
    } else {
        "contentsync=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Scan a directory and print a summary.
fn run_scan(path: &Path, export: Option<&Path>, ignore: Vec<String>) -> Result<()> {
    eprintln!("Scanning {}...", path.display());

    let config = ScanConfig {
        ignore_patterns: ignore,
        ..ScanConfig::new(path)
    };
    let snapshot = LocalScanner::new().scan(&config).context("Scan failed")?;

    println!();
    println!("{}", "─".repeat(60));
    println!(" {} - {}", path.display(), format_size(snapshot.total_size()));
    println!(
        " {} files, {} directories, {} symlinks",
        snapshot.list_files().len(),
        snapshot.list_directories().len(),
        snapshot.list_symlinks().len()
    );
    println!("{}", "─".repeat(60));

    if let Some(export) = export {
        let json = snapshot.to_document().to_json_pretty()?;
        std::fs::write(export, json)
            .with_context(|| format!("Cannot write {}", export.display()))?;
        eprintln!("Exported to {}", export.display());
    }

    Ok(())
}

/// Diff a local directory against a document on disk.
fn run_plan(remote: &Path, path: &Path, force: bool, structure: bool) -> Result<()> {
    let bytes =
        std::fs::read(remote).with_context(|| format!("Cannot read {}", remote.display()))?;
    let remote_snapshot: Snapshot = JsonDocumentParser
        .parse(&bytes)
        .context("Invalid content document")?;
    let local = LocalScanner::new()
        .scan(&ScanConfig::new(path))
        .context("Scan failed")?;

    let policy = SyncPolicy::new().force_sync(force).compare_structure(structure);
    let plan = compute_sync_plan(&local, &remote_snapshot, &policy);
    print_plan(&plan);
    Ok(())
}

fn print_plan(plan: &SyncPlan) {
    if plan.is_empty() {
        println!("Up to date.");
        return;
    }

    print_section("Add", plan.additions());
    print_section("Modify", plan.modifications());
    print_section("Remove", plan.removals());
    print_section("Create directory", plan.directories_to_create());
    print_section("Link", plan.symlinks_to_create());

    println!();
    println!(
        " {} downloads ({}), {} items to apply, {} symlinks",
        plan.total_items_to_download(),
        format_size(plan.remaining_bytes()),
        plan.total_items_to_apply(),
        plan.total_symlinks_to_apply()
    );
    if let Some(changed) = plan.structure_changed() {
        println!(
            " Directory layout {}",
            if changed { "changed" } else { "unchanged" }
        );
    }
}

fn print_section<'a>(label: &str, entries: impl Iterator<Item = &'a PlanEntry>) {
    for entry in entries {
        match entry.symlink_target() {
            Some(target) => println!(" {:<17} {} -> {}", label, entry.path, target),
            None if entry.file().is_some() && is_text_file(&entry.name) => {
                println!(" {:<17} {} (text)", label, entry.path)
            }
            None => println!(" {:<17} {}", label, entry.path),
        }
    }
}

async fn run_sync(config_path: &Path, apply: bool, force: bool) -> Result<()> {
    let mut config = load_config(config_path)?;
    config.force_sync |= force;
    let orchestrator = open(config)?;

    if orchestrator.unpack_contents().await? {
        eprintln!("Seeded content root from bootstrap archive");
    }

    let status = sync_once(&orchestrator).await?;
    if apply && orchestrator.has_sync_items_to_apply() {
        apply_staged(&orchestrator).await?;
    }
    if status != SyncStatus::Ok {
        bail!("Sync finished with status {status}");
    }
    Ok(())
}

/// Apply whatever is staged. Runs a sync first so the plan matches the
/// current remote; staged files are reused, not downloaded again. Items
/// whose download failed are skipped.
async fn run_apply(config_path: &Path) -> Result<()> {
    let orchestrator = open(load_config(config_path)?)?;
    let status = sync_once(&orchestrator).await?;
    if !orchestrator.has_sync_items_to_apply() {
        println!("Nothing to apply. Last update: {}", orchestrator.last_update_string());
    } else {
        apply_staged(&orchestrator).await?;
    }
    if status != SyncStatus::Ok {
        bail!("Sync finished with status {status}");
    }
    Ok(())
}

async fn run_unpack(config_path: &Path) -> Result<()> {
    let orchestrator = open(load_config(config_path)?)?;
    if orchestrator.unpack_contents().await? {
        println!("Unpacked bootstrap archive");
    } else {
        println!("Nothing to unpack");
    }
    Ok(())
}

fn load_config(path: &Path) -> Result<SyncConfig> {
    SyncConfig::from_toml_file(path)
        .with_context(|| format!("Cannot load config {}", path.display()))
}

fn open(config: SyncConfig) -> Result<SyncOrchestrator> {
    let orchestrator = SyncOrchestrator::with_defaults(config).context("Invalid configuration")?;
    orchestrator.register_listener(Arc::new(ConsoleListener));
    Ok(orchestrator)
}

async fn sync_once(orchestrator: &SyncOrchestrator) -> Result<SyncStatus> {
    let status = orchestrator.perform_sync()?.wait().await;
    match status {
        SyncStatus::Ok => {}
        SyncStatus::Cancelled => eprintln!("Sync cancelled"),
        SyncStatus::Failed if orchestrator.has_sync_items_to_apply() => {
            eprintln!("Some downloads failed, the rest can be applied:");
            for error in orchestrator.download_errors() {
                eprintln!("  {error}");
            }
        }
        _ => {
            for error in orchestrator.download_errors() {
                eprintln!("  {error}");
            }
            if let Some(error) = orchestrator.last_error() {
                bail!("Sync failed ({status}): {error}");
            }
            bail!("Sync failed ({status})");
        }
    }
    Ok(status)
}

async fn apply_staged(orchestrator: &SyncOrchestrator) -> Result<()> {
    let complete = orchestrator
        .apply_changes()
        .await
        .context("Apply failed")?;
    println!("{}", complete.summary());
    for error in &complete.errors {
        eprintln!("  {error}");
    }
    Ok(())
}

/// Prints sync events to the terminal.
struct ConsoleListener;

impl SyncListener for ConsoleListener {
    fn on_event(&self, event: &SyncEvent) {
        match event {
            SyncEvent::SyncStarted { full_sync } => {
                eprintln!("{}", if *full_sync { "Full sync..." } else { "Syncing..." });
            }
            SyncEvent::PlanReady {
                additions,
                modifications,
                removals,
                symlinks,
                downloads,
                bytes,
            } => {
                eprintln!(
                    "Plan: +{additions} ~{modifications} -{removals}, {symlinks} symlinks, \
                     {downloads} downloads ({})",
                    format_size(*bytes)
                );
            }
            SyncEvent::StructureChanged => eprintln!("Directory layout changed"),
            SyncEvent::SyncProgress {
                completed,
                total,
                bytes_transferred,
                bytes_total,
                current: Some(current),
            } => {
                eprintln!(
                    "[{completed}/{total}] {current} ({} of {})",
                    format_size(*bytes_transferred),
                    format_size(*bytes_total)
                );
            }
            SyncEvent::SyncProgress { .. } => {}
            SyncEvent::SyncCompleted { status } => eprintln!("Sync finished: {status}"),
            SyncEvent::ApplyStarted { total } => eprintln!("Applying {total} changes..."),
            SyncEvent::ApplyProgress { .. } => {}
            SyncEvent::ApplyCompleted { succeeded, failed } => {
                eprintln!("Applied {succeeded}, failed {failed}");
            }
            SyncEvent::UnpackDetected { archive } => {
                eprintln!("Unpacking {}...", archive.display());
            }
            SyncEvent::UnpackTotal { entries } => eprintln!("{entries} entries"),
            SyncEvent::UnpackProgress { done, total } => {
                if done == total {
                    eprintln!("Unpacked {done}/{total}");
                }
            }
            SyncEvent::UnpackCompleted { success } => {
                if !success {
                    eprintln!("Unpack failed");
                }
            }
        }
    }
}

/// Format size in human-readable form.
fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}
