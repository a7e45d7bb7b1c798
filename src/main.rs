//! tiercache - operator tool for on-disk tiered caches
//!
//! ```text
//! tiercache --cache-dir <dir> inspect            list persisted entries
//! tiercache --cache-dir <dir> invalidate <re>    remove matching keys
//! tiercache --cache-dir <dir> migrate            run the schema version guard
//! tiercache --cache-dir <dir> purge              drop records past policy TTL
//! tiercache key <domain> ...                     print a canonical key
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::cache::{
    keys, CacheConfig, CacheKey, CacheLayout, JsonFileFlatStore, ScoreKind, TieredCache, VersionGuard,
};
use tiercache::Result;

// =============================================================================
// CLI Arguments
// =============================================================================

/// tiercache - inspect and maintain tiered cache directories
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cache directory
    #[arg(long, env = "TIERCACHE_DIR", default_value = ".tiercache")]
    cache_dir: PathBuf,

    /// YAML configuration file
    #[arg(long, env = "TIERCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the schema version from the configuration
    #[arg(long, env = "TIERCACHE_SCHEMA_VERSION")]
    schema_version: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List persisted entries and structured records
    Inspect,
    /// Remove every key matching a pattern ("*" or an anchored regex)
    Invalidate { pattern: String },
    /// Clear the cache if its schema marker differs from the current version
    Migrate,
    /// Delete structured records past their policy TTL
    Purge,
    /// Print the canonical key for a value
    Key {
        #[command(subcommand)]
        key: KeyCommand,
    },
}

#[derive(Subcommand, Debug)]
enum KeyCommand {
    /// Activities for the last N days
    Activities { days_back: u32 },
    /// Streams of one activity
    Streams { activity_id: u64 },
    /// Daily score (recovery, sleep, strain)
    Score { kind: ScoreKind, date: NaiveDate },
    /// Physiological samples of a metric
    Samples { metric: String, date: NaiveDate },
    /// Wellness batch over a date range
    Wellness { start: NaiveDate, end: NaiveDate },
    /// Daily aggregate
    Daily { date: NaiveDate },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    if let Command::Key { key } = &args.command {
        println!("{}", canonical_key(key)?);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => CacheConfig::from_file(path)?,
        None => CacheConfig::default(),
    };
    if let Some(version) = args.schema_version {
        config.schema_version = version;
    }

    info!(dir = %args.cache_dir.display(), schema_version = config.schema_version, "Opening cache");

    match &args.command {
        Command::Inspect => inspect(&args, config).await,
        Command::Invalidate { pattern } => {
            let cache = TieredCache::open(&args.cache_dir, config).await?;
            let removed = cache.invalidate_matching(pattern).await?;
            println!("removed {removed} entries matching {pattern}");
            Ok(())
        }
        Command::Migrate => migrate(&args, config).await,
        Command::Purge => {
            let cache = TieredCache::open(&args.cache_dir, config).await?;
            let purged = cache.purge_expired().await?;
            println!("purged {purged} expired records");
            Ok(())
        }
        Command::Key { .. } => Ok(()),
    }
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

// =============================================================================
// Commands
// =============================================================================

fn canonical_key(command: &KeyCommand) -> Result<CacheKey> {
    Ok(match command {
        KeyCommand::Activities { days_back } => keys::activities(*days_back),
        KeyCommand::Streams { activity_id } => keys::activity_streams(*activity_id),
        KeyCommand::Score { kind, date } => keys::score(*kind, *date),
        KeyCommand::Samples { metric, date } => keys::samples(metric, *date)?,
        KeyCommand::Wellness { start, end } => keys::wellness_batch(*start, *end),
        KeyCommand::Daily { date } => keys::daily_aggregate(*date),
    })
}

/// Read-only listing; does not run the version guard
async fn inspect(args: &Args, config: CacheConfig) -> Result<()> {
    let current = config.schema_version;
    let cache = TieredCache::open(&args.cache_dir, config).await?;
    let now = Utc::now();

    let entries = cache.persisted_entries().await?;
    println!("{:<48} {:<5} {:>7} {:>9} {:>10}  TYPE", "KEY", "MECH", "SCHEMA", "AGE", "BYTES");
    for entry in &entries {
        let (schema, age, declared) = match &entry.header {
            Some(header) => {
                let marker = if header.schema_version == current { "" } else { "!" };
                (
                    format!("{}{marker}", header.schema_version),
                    format_age(now.signed_duration_since(header.cached_at)),
                    header.declared_type.as_str(),
                )
            }
            None => ("legacy".to_string(), "-".to_string(), "-"),
        };
        println!(
            "{:<48} {:<5} {:>7} {:>9} {:>10}  {}",
            entry.key,
            entry.mechanism.name(),
            schema,
            age,
            entry.size,
            declared
        );
    }

    let records = cache.structured_records().await?;
    if !records.is_empty() {
        println!();
        println!("{:<48} {:<12} {:>7} {:>9}  TYPE", "RECORD", "KIND", "SCHEMA", "AGE");
        for record in &records {
            println!(
                "{:<48} {:<12} {:>7} {:>9}  {}",
                record.key,
                record.kind,
                record.schema_version,
                format_age(now.signed_duration_since(record.cached_at)),
                record.type_name
            );
        }
    }

    println!();
    println!("{} persisted entries, {} structured records", entries.len(), records.len());
    Ok(())
}

async fn migrate(args: &Args, config: CacheConfig) -> Result<()> {
    let current = config.schema_version;
    let cache = TieredCache::open(&args.cache_dir, config).await?;

    let layout = CacheLayout::new(&args.cache_dir);
    let marker = JsonFileFlatStore::open(&layout.meta).await?;
    let state = VersionGuard::new(Arc::new(marker), current).check().await;

    cache.ensure_ready().await;

    if let Some(mismatch) = state.mismatch(current) {
        println!("{mismatch}: cleared cache for schema v{current}");
    } else if state.requires_clear() {
        println!("marker {state}: cleared cache for schema v{current}");
    } else {
        println!("schema v{} is current, nothing to do", cache.schema_version());
    }
    Ok(())
}

fn format_age(age: chrono::Duration) -> String {
    let secs = age.num_seconds().max(0);
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h", s / 3600),
        s => format!("{}d", s / 86_400),
    }
}
