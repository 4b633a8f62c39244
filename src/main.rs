// src/main.rs
//
// =============================================================================
// COWFS: OPERATOR CLI & ENTRY POINT
// =============================================================================
//
// Companion command-line tool for a COWFS storage directory.
//
// Commands:
// - history / stats / log: inspect versions, usage and activity.
// - restore / diff:        work with a single file's history.
// - snapshot:              create, list, show, restore, delete.
// - gc:                    prune version history and reclaim blobs.
//
// Every command takes --json for machine-readable output. The storage
// directory comes from --storage or the COWFS_STORAGE environment variable.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use cowfs::engine::{DiffReport, Engine, GcPolicy};

// ============================================================================
// 1. CLI DEFINITION
// ============================================================================

#[derive(Parser)]
#[command(name = "cowfs", version, about = "COWFS — Copy-on-Write Filesystem Manager")]
struct Cli {
    /// Storage backend directory (default: $COWFS_STORAGE).
    #[arg(long, short = 's', global = true)]
    storage: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version history of a file.
    History {
        /// File path inside the filesystem (e.g. /doc.txt).
        path: String,
        #[arg(long)]
        json: bool,
    },

    /// Show storage statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Restore a file to an earlier version.
    Restore {
        path: String,
        /// 1-based version number (see `history`).
        #[arg(long)]
        version: Option<i64>,
        /// Latest version at or before this UTC timestamp.
        #[arg(long, value_parser = parse_timestamp)]
        before: Option<String>,
        /// Show the plan without applying it.
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },

    /// Diff two versions of a file.
    Diff {
        path: String,
        /// Left side of an explicit version pair.
        #[arg(long)]
        v1: Option<i64>,
        /// Right side of an explicit version pair.
        #[arg(long)]
        v2: Option<i64>,
        /// Compare the current version against this one.
        #[arg(long)]
        version: Option<i64>,
        #[arg(long)]
        json: bool,
    },

    /// Manage named snapshots.
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommands,
    },

    /// Prune version history and reclaim unreferenced objects.
    Gc {
        /// Keep only the N most recent versions per file.
        #[arg(long)]
        keep_last: Option<u32>,
        /// Prune versions older than this UTC timestamp (current versions
        /// are always kept).
        #[arg(long, value_parser = parse_timestamp)]
        before: Option<String>,
        /// Report what would be reclaimed without changing anything.
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },

    /// Show the activity log.
    Log {
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, value_parser = parse_timestamp)]
        since: Option<String>,
        #[arg(long, value_parser = parse_timestamp)]
        until: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// Capture the current version of every live file.
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List snapshots with file counts.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show the entries of one snapshot.
    Show {
        name: String,
        #[arg(long)]
        json: bool,
    },
    /// Roll live state back to a snapshot.
    Restore {
        name: String,
        /// Keep files created after the snapshot instead of soft-deleting them.
        #[arg(long)]
        keep_new: bool,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    /// Delete a snapshot (history and objects are untouched).
    Delete {
        name: String,
        #[arg(long)]
        json: bool,
    },
}

// ============================================================================
// 2. ENTRY POINT
// ============================================================================

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let engine = open_engine(cli.storage)?;
    match cli.command {
        Commands::History { path, json } => cmd_history(&engine, &path, json),
        Commands::Stats { json } => cmd_stats(&engine, json),
        Commands::Restore {
            path,
            version,
            before,
            dry_run,
            json,
        } => cmd_restore(&engine, &path, version, before.as_deref(), dry_run, json),
        Commands::Diff {
            path,
            v1,
            v2,
            version,
            json,
        } => cmd_diff(&engine, &path, v1, v2, version, json),
        Commands::Snapshot { command } => cmd_snapshot(&engine, command),
        Commands::Gc {
            keep_last,
            before,
            dry_run,
            json,
        } => cmd_gc(&engine, keep_last, before, dry_run, json),
        Commands::Log {
            limit,
            since,
            until,
            json,
        } => cmd_log(&engine, limit, since.as_deref(), until.as_deref(), json),
    }
}

fn open_engine(storage: Option<PathBuf>) -> Result<Engine> {
    let dir = storage
        .or_else(|| std::env::var("COWFS_STORAGE").ok().map(PathBuf::from))
        .ok_or_else(|| anyhow!("no storage directory; pass --storage or set COWFS_STORAGE"))?;
    if !dir.is_dir() {
        bail!("storage directory not found: {}", dir.display());
    }
    Engine::open(&dir).with_context(|| format!("failed to open storage at {}", dir.display()))
}

// ============================================================================
// 3. COMMANDS
// ============================================================================

fn cmd_history(engine: &Engine, path: &str, json: bool) -> Result<()> {
    let path = normalize_path(path);
    let entries = engine.history(&path)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    println!("Version history: {path}");
    for entry in &entries {
        let marker = if entry.current { " *" } else { "  " };
        println!(
            "  {:>3}{} {} {:>10}  {}...",
            entry.version,
            marker,
            entry.created_at,
            human_size(entry.size_bytes),
            &entry.hash[..12]
        );
    }
    Ok(())
}

fn cmd_stats(engine: &Engine, json: bool) -> Result<()> {
    let stats = engine.stats()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    println!("COWFS Storage Statistics");
    println!("  Hash algorithm:   {}", stats.hash_algo);
    println!("  Logical size:     {}", human_size(stats.logical_size_bytes));
    println!("  Actual size:      {}", human_size(stats.actual_size_bytes));
    println!(
        "  Dedup savings:    {} ({:.1}%)",
        human_size(stats.dedup_savings_bytes),
        stats.dedup_percentage
    );
    println!("  Total files:      {}", stats.total_files);
    println!("  Total versions:   {}", stats.total_versions);
    println!("  Total objects:    {}", stats.total_objects);
    println!("  Orphaned objects: {}", stats.orphaned_objects);
    Ok(())
}

fn cmd_restore(
    engine: &Engine,
    path: &str,
    version: Option<i64>,
    before: Option<&str>,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let path = normalize_path(path);
    let plan = engine.restore_file(&path, version, before, dry_run)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }
    let verb = if plan.dry_run { "Would restore" } else { "Restored" };
    println!(
        "{} {} to v{} ({}, {})",
        verb,
        plan.path,
        plan.restored_from_version,
        human_size(plan.size_bytes),
        plan.created_at
    );
    if plan.was_deleted && !plan.dry_run {
        println!("  File undeleted.");
    }
    Ok(())
}

fn cmd_diff(
    engine: &Engine,
    path: &str,
    v1: Option<i64>,
    v2: Option<i64>,
    version: Option<i64>,
    json: bool,
) -> Result<()> {
    let path = normalize_path(path);
    let report = engine.diff(&path, v1, v2, version)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    match &report {
        DiffReport::Text { diff, .. } => {
            for line in diff {
                println!("{line}");
            }
        }
        DiffReport::Binary {
            left_version,
            right_version,
            left_size,
            right_size,
            size_delta,
            identical,
        } => {
            println!("Binary diff v{left_version} -> v{right_version}");
            println!("  Left size:  {}", human_size(*left_size));
            println!("  Right size: {}", human_size(*right_size));
            println!("  Delta:      {size_delta} bytes");
            println!("  Identical:  {identical}");
        }
    }
    Ok(())
}

fn cmd_snapshot(engine: &Engine, command: SnapshotCommands) -> Result<()> {
    match command {
        SnapshotCommands::Create {
            name,
            description,
            json,
        } => {
            let created = engine.snapshot_create(&name, description.as_deref())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&created)?);
            } else {
                println!(
                    "Snapshot '{}' created ({} files).",
                    created.name, created.file_count
                );
            }
        }
        SnapshotCommands::List { json } => {
            let snapshots = engine.snapshot_list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshots)?);
            } else {
                for snap in &snapshots {
                    println!(
                        "  {:<20} {} {:>6} files  {}",
                        snap.name,
                        snap.created_at,
                        snap.file_count,
                        snap.description.as_deref().unwrap_or("")
                    );
                }
            }
        }
        SnapshotCommands::Show { name, json } => {
            let entries = engine.snapshot_show(&name)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                println!("Snapshot: {name}");
                for entry in &entries {
                    println!(
                        "  {:<40} {:>10}  {}...",
                        entry.path,
                        human_size(entry.size_bytes),
                        &entry.hash[..12]
                    );
                }
            }
        }
        SnapshotCommands::Restore {
            name,
            keep_new,
            dry_run,
            json,
        } => {
            let report = engine.snapshot_restore(&name, keep_new, dry_run)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let verb = if report.dry_run { "Would restore" } else { "Restored" };
                println!(
                    "{} snapshot '{}': {} files restored, {} soft-deleted, {} skipped.",
                    verb,
                    report.snapshot,
                    report.files_restored,
                    report.files_soft_deleted,
                    report.entries_skipped
                );
            }
        }
        SnapshotCommands::Delete { name, json } => {
            let deleted = engine.snapshot_delete(&name)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&deleted)?);
            } else {
                println!("Snapshot '{}' deleted.", deleted.name);
            }
        }
    }
    Ok(())
}

fn cmd_gc(
    engine: &Engine,
    keep_last: Option<u32>,
    before: Option<String>,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let policy = match (keep_last, before) {
        (Some(_), Some(_)) => bail!("--keep-last and --before cannot be combined"),
        (Some(k), None) => GcPolicy::KeepLast(k),
        (None, Some(ts)) => GcPolicy::Before(ts),
        (None, None) => GcPolicy::None,
    };
    let report = engine.gc(policy, dry_run)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    let verb = if report.dry_run { "Would reclaim" } else { "Reclaimed" };
    println!(
        "{} {} from {} objects ({} versions pruned).",
        verb,
        human_size(report.reclaimed_bytes),
        report.processed_objects,
        report.versions_pruned
    );
    if report.skipped_referenced > 0 {
        println!("  Skipped (still referenced): {}", report.skipped_referenced);
    }
    if report.missing_blobs > 0 {
        println!("  Blobs already missing:      {}", report.missing_blobs);
    }
    Ok(())
}

fn cmd_log(
    engine: &Engine,
    limit: usize,
    since: Option<&str>,
    until: Option<&str>,
    json: bool,
) -> Result<()> {
    let events = engine.activity(limit, since, until)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }
    for event in &events {
        println!(
            "  {} {:<17} {}",
            event.created_at,
            event.action,
            event.path.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

// ============================================================================
// 4. HELPERS
// ============================================================================

fn parse_timestamp(s: &str) -> std::result::Result<String, String> {
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|_| s.to_string())
        .map_err(|e| format!("expected 'YYYY-MM-DD HH:MM:SS' (UTC): {e}"))
}

fn normalize_path(path: &str) -> String {
    let mut normalized = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

fn human_size(size_bytes: i64) -> String {
    if size_bytes == 0 {
        return "0 B".to_string();
    }
    let mut size = size_bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if size.abs() < 1024.0 {
            return if unit == "B" {
                format!("{size_bytes} B")
            } else {
                format!("{size:.1} {unit}")
            };
        }
        size /= 1024.0;
    }
    format!("{size:.1} PB")
}
