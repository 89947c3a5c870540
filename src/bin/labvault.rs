//! # labvault CLI
//!
//! Command-line access to a vault's storage operations.
//!
//! ## Usage
//! ```bash
//! # Initialize a vault
//! labvault --base-dir /data/labvault init
//!
//! # Ingest two raw files for raw data 3
//! labvault ingest raw_data 3 raw_data a.fastq b.fastq --filetype raw_forward_seqs
//!
//! # See what orphan collection would remove, then remove it
//! labvault purge --dry-run
//! labvault purge
//!
//! # Bundle the public studies
//! labvault release --visibility public
//! ```
//!
//! Without `--base-dir` or `--config`, the configuration file named by
//! `LABVAULT_CONFIG_FP` is used.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use labvault::utils::format_bytes;
use labvault::{
    Category, FiletypeRef, OwnerKind, TransferMode, Vault, VaultBuilder, VaultConfig, VaultError,
    Visibility,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// labvault CLI - transactional filepath storage
#[derive(Parser)]
#[command(name = "labvault")]
#[command(version)]
#[command(about = "Keep stored files and their catalog in lockstep")]
#[command(long_about = None)]
struct Cli {
    /// Storage base directory
    #[arg(short, long, global = true)]
    base_dir: Option<PathBuf>,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a vault
    Init {
        /// Do not create default mountpoints
        #[arg(long)]
        no_default_mountpoints: bool,
    },

    /// List mountpoints
    #[command(alias = "mp")]
    Mountpoints {
        /// Only this category, active generation first
        category: Option<String>,

        /// Include inactive generations
        #[arg(long)]
        all: bool,
    },

    /// Register a new storage generation
    AddMountpoint {
        /// Category served
        category: String,

        /// Root directory, relative to the storage base
        root: PathBuf,

        /// Store files under <root>/<owner id>/
        #[arg(long)]
        subdirectory: bool,

        /// Register without activating
        #[arg(long)]
        inactive: bool,
    },

    /// Make a generation the active one of its category
    ActivateMountpoint {
        /// Mountpoint id
        id: i64,
    },

    /// Ingest files for an owner
    #[command(alias = "add")]
    Ingest {
        /// Owner kind (artifact, raw_data, sample_template, ...)
        owner_kind: String,

        /// Owner id
        owner_id: i64,

        /// Storage category
        category: String,

        /// Files to ingest
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Filepath type of every file
        #[arg(short, long, default_value = "plain_text")]
        filetype: String,

        /// Copy instead of moving
        #[arg(long)]
        copy: bool,
    },

    /// Show where a filepath is stored
    Locate {
        /// Filepath id
        id: i64,
    },

    /// Remove filepaths no entity references
    #[command(alias = "gc")]
    Purge {
        /// Dry run
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete files in the upload trash folders
    EmptyTrash {
        /// Dry run
        #[arg(long)]
        dry_run: bool,
    },

    /// Verify stored checksums
    Verify {
        /// Filepath id; every filepath when omitted
        id: Option<i64>,
    },

    /// Write a release bundle
    Release {
        /// Study visibility to export
        #[arg(long, default_value = "public")]
        visibility: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        match e.downcast_ref::<VaultError>() {
            Some(inner) if e.chain().count() == 1 => {
                eprintln!("{}: {}", "Error".red().bold(), inner.user_message())
            }
            _ => eprintln!("{}: {:#}", "Error".red().bold(), e),
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = resolve_config(cli.base_dir.as_deref(), cli.config.as_deref())?;

    match cli.command {
        Commands::Init { no_default_mountpoints } => cmd_init(config, no_default_mountpoints),
        Commands::Mountpoints { category, all } => cmd_mountpoints(config, category, all),
        Commands::AddMountpoint {
            category,
            root,
            subdirectory,
            inactive,
        } => cmd_add_mountpoint(config, &category, &root, subdirectory, !inactive),
        Commands::ActivateMountpoint { id } => cmd_activate_mountpoint(config, id),
        Commands::Ingest {
            owner_kind,
            owner_id,
            category,
            files,
            filetype,
            copy,
        } => cmd_ingest(config, &owner_kind, owner_id, &category, files, filetype, copy),
        Commands::Locate { id } => cmd_locate(config, id),
        Commands::Purge { dry_run } => cmd_purge(config, dry_run),
        Commands::EmptyTrash { dry_run } => cmd_empty_trash(config, dry_run),
        Commands::Verify { id } => cmd_verify(config, id),
        Commands::Release { visibility } => cmd_release(config, &visibility),
    }
}

/// `--config` wins, then `--base-dir`, then `LABVAULT_CONFIG_FP`
fn resolve_config(base_dir: Option<&Path>, config: Option<&Path>) -> Result<VaultConfig> {
    if let Some(path) = config {
        return VaultConfig::load(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()));
    }
    match base_dir {
        Some(dir) if dir.is_absolute() => Ok(VaultConfig::new(dir)),
        Some(dir) => Ok(VaultConfig::new(std::env::current_dir()?.join(dir))),
        None => VaultConfig::from_env().context("No --base-dir or --config given"),
    }
}

fn open_vault(config: VaultConfig) -> Result<Vault> {
    if !config.database_path.exists() {
        return Err(VaultError::StorageNotInitialized(config.base_data_dir).into());
    }
    let base = config.base_data_dir.clone();
    Vault::open_with_config(config)
        .with_context(|| format!("Failed to open vault at {}", base.display()))
}

fn spinner(message: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .context("Invalid spinner template")?,
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(message.to_string());
    Ok(pb)
}

fn cmd_init(config: VaultConfig, no_default_mountpoints: bool) -> Result<()> {
    println!("{}", "Initializing vault...".blue().bold());
    let vault = VaultBuilder::new()
        .seed_default_mountpoints(!no_default_mountpoints)
        .init(config)?;

    println!("{} Initialized vault", "✓".green().bold());
    println!("  Base: {}", vault.base_dir().display().to_string().cyan());
    println!(
        "  Database: {}",
        vault.config().database_path.display().to_string().cyan()
    );
    println!("  Mountpoints: {}", vault.list_mountpoints()?.len());
    Ok(())
}

fn cmd_mountpoints(config: VaultConfig, category: Option<String>, all: bool) -> Result<()> {
    let vault = open_vault(config)?;
    let mountpoints = match category {
        Some(category) => {
            let category: Category = category.parse()?;
            let mut tx = vault.transaction()?;
            vault.mountpoints().resolve(&mut tx, category, all)?
        }
        None => vault
            .list_mountpoints()?
            .into_iter()
            .filter(|mp| all || mp.active)
            .collect(),
    };
    if mountpoints.is_empty() {
        println!("{}", "No mountpoints registered".dimmed());
        return Ok(());
    }
    println!("{}", "Mountpoints:".bold());
    for mp in mountpoints {
        let state = if mp.active {
            "active".green()
        } else {
            "inactive".dimmed()
        };
        let layout = if mp.subdirectory { "per-owner" } else { "flat" };
        println!(
            "  {:>4}  {:<18} {:<9} {:<9} {}",
            mp.id.to_string().yellow(),
            mp.category.to_string(),
            state,
            layout,
            mp.root.display()
        );
    }
    Ok(())
}

fn cmd_add_mountpoint(
    config: VaultConfig,
    category: &str,
    root: &Path,
    subdirectory: bool,
    active: bool,
) -> Result<()> {
    let vault = open_vault(config)?;
    let category: Category = category.parse()?;
    let mp = vault.add_mountpoint(category, root, subdirectory, active)?;
    println!(
        "{} Registered mountpoint {} for {} at {}",
        "✓".green().bold(),
        mp.id.to_string().yellow(),
        mp.category,
        mp.root.display().to_string().cyan()
    );
    Ok(())
}

fn cmd_activate_mountpoint(config: VaultConfig, id: i64) -> Result<()> {
    let vault = open_vault(config)?;
    let mp = vault.activate_mountpoint(id)?;
    println!(
        "{} Mountpoint {} is now active for {}",
        "✓".green().bold(),
        mp.id.to_string().yellow(),
        mp.category
    );
    Ok(())
}

fn cmd_ingest(
    config: VaultConfig,
    owner_kind: &str,
    owner_id: i64,
    category: &str,
    files: Vec<PathBuf>,
    filetype: String,
    copy: bool,
) -> Result<()> {
    let vault = open_vault(config)?;
    let kind: OwnerKind = owner_kind.parse()?;
    let category: Category = category.parse()?;
    let mode = if copy {
        TransferMode::Copy
    } else {
        TransferMode::Move
    };

    let mut total_bytes = 0;
    for file in &files {
        total_bytes += fs::metadata(file).map(|m| m.len()).unwrap_or(0);
    }
    let entries: Vec<(PathBuf, FiletypeRef)> = files
        .into_iter()
        .map(|f| (f, FiletypeRef::from(filetype.as_str())))
        .collect();

    let start = Instant::now();
    let pb = spinner(&format!("Ingesting {} files...", entries.len()))?;
    let result = vault.ingest(&entries, kind, owner_id, category, mode);
    pb.finish_and_clear();
    let ids = result?;

    println!(
        "{} Ingested {} files ({}) in {}",
        "✓".green().bold(),
        ids.len(),
        format_bytes(total_bytes),
        format_duration(Duration::from_millis(start.elapsed().as_millis() as u64))
    );
    for id in ids {
        let stored = vault.locate(id)?;
        println!(
            "  {:>6}  {}  crc32 {}",
            id.to_string().yellow(),
            stored.path.display(),
            stored.checksum.to_string().dimmed()
        );
    }
    Ok(())
}

fn cmd_locate(config: VaultConfig, id: i64) -> Result<()> {
    let vault = open_vault(config)?;
    let stored = vault.locate(id)?;
    println!("{}", stored.path.display());
    println!("  Type: {}", stored.filepath_type);
    println!("  Checksum: {}", stored.checksum);
    println!("  Mountpoint: {}", stored.mountpoint_id);
    Ok(())
}

fn cmd_purge(config: VaultConfig, dry_run: bool) -> Result<()> {
    let vault = open_vault(config)?;
    let start = Instant::now();

    if dry_run {
        println!("{}", "Analyzing orphaned filepaths (dry run)...".blue().bold());
    } else {
        println!("{}", "Collecting orphaned filepaths...".blue().bold());
    }
    let report = vault.purge_filepaths(!dry_run)?;

    println!("\n{}", "Collection Results:".bold());
    println!("  Filepaths examined: {}", report.rows_examined);
    println!(
        "  Orphaned filepaths: {}",
        report.orphans.len().to_string().yellow()
    );
    for orphan in report.orphans.iter().take(10) {
        let missing = if orphan.exists { "" } else { " (missing)" };
        println!(
            "  - {} {}{}",
            orphan.id.to_string().dimmed(),
            orphan.path.display(),
            missing.red()
        );
    }
    if report.orphans.len() > 10 {
        println!(
            "  ... and {} more",
            (report.orphans.len() - 10).to_string().dimmed()
        );
    }

    if report.files_missing > 0 {
        println!(
            "  Already missing on disk: {}",
            report.files_missing.to_string().red()
        );
    }

    if dry_run {
        println!("\n{}", "No changes made (dry run)".dimmed());
    } else {
        println!(
            "\n{} Deleted {} rows, removed {} files",
            "✓".green().bold(),
            report.rows_deleted.to_string().green(),
            report
                .files_scheduled
                .saturating_sub(report.hook_failures.len())
                .to_string()
                .green()
        );
        for failure in &report.hook_failures {
            println!(
                "  {} {}: {}",
                "⚠".yellow().bold(),
                failure.label,
                failure.message
            );
        }
    }

    println!(
        "\n{}",
        format!("Total time: {}", format_duration(start.elapsed())).dimmed()
    );
    Ok(())
}

fn cmd_empty_trash(config: VaultConfig, dry_run: bool) -> Result<()> {
    let vault = open_vault(config)?;
    let report = vault.empty_trash_upload_folder(!dry_run)?;
    for file in &report.files {
        println!("  - {}", file.display());
    }
    if dry_run {
        println!(
            "{} files in trash folders\n{}",
            report.files.len().to_string().yellow(),
            "No changes made (dry run)".dimmed()
        );
    } else {
        println!(
            "{} Removed {} files from trash folders",
            "✓".green().bold(),
            report
                .files
                .len()
                .saturating_sub(report.hook_failures.len())
                .to_string()
                .green()
        );
    }
    Ok(())
}

fn cmd_verify(config: VaultConfig, id: Option<i64>) -> Result<()> {
    let vault = open_vault(config)?;

    if let Some(id) = id {
        println!(
            "{} {}",
            "Verifying filepath".blue().bold(),
            id.to_string().yellow()
        );
        let check = vault.verify(id)?;
        println!("\n{}", "Verification Report:".bold());
        println!("  Path: {}", check.path.display());
        println!(
            "  Exists: {}",
            if check.exists { "✓ Yes".green() } else { "✗ No".red() }
        );
        println!(
            "  Checksum: {}",
            if check.is_valid() {
                "✓ Valid".green()
            } else {
                "✗ Invalid".red()
            }
        );
        if let Some(error) = &check.error {
            println!("  Error: {}", error.red());
        }
        return Ok(());
    }

    println!("{}", "Verifying all filepaths...".blue().bold());
    let pb = spinner("Computing checksums...")?;
    let result = vault.verify_all();
    pb.finish_and_clear();
    let report = result?;

    println!("\n{}", "Verification Report:".bold());
    println!("  Total filepaths: {}", report.total_files_checked);
    println!("  Valid: {}", report.files_valid.to_string().green());
    println!(
        "  Invalid: {}",
        (report.total_files_checked - report.files_valid)
            .to_string()
            .red()
    );
    for error in &report.errors {
        println!("  {} {}", "✗".red(), error);
    }
    println!("  Verification time: {}ms", report.verification_time_ms);
    println!("\n{}", report.summary());
    Ok(())
}

fn cmd_release(config: VaultConfig, visibility: &str) -> Result<()> {
    let vault = open_vault(config)?;
    let visibility: Visibility = visibility.parse()?;

    let pb = spinner(&format!("Bundling {} studies...", visibility))?;
    let result = vault.release(visibility);
    pb.finish_and_clear();
    let bundle = result?;

    let size = fs::metadata(&bundle.archive_path)
        .map(|m| m.len())
        .unwrap_or(0);
    println!(
        "{} Wrote release with {} entries",
        "✓".green().bold(),
        bundle.entries.len().to_string().green()
    );
    println!(
        "  Archive: {} ({})",
        bundle.archive_path.display().to_string().cyan(),
        format_bytes(size)
    );
    println!(
        "  Manifest: {}",
        bundle.manifest_path.display().to_string().cyan()
    );
    Ok(())
}
