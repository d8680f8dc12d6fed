//! stagepoint CLI - Inspect and recover typed checkpoints.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stagepoint::codec::RecordReader;
use stagepoint::{CheckpointStore, Config, LocalStorage};
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "stagepoint")]
#[command(version)]
#[command(about = "Typed checkpoint store and generated record assemblers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "stagepoint.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a checkpoint's manifest and, optionally, its first records
    Inspect {
        /// Checkpoint path, relative to the storage root
        path: PathBuf,

        /// Number of records to print
        #[arg(short, long, default_value = "0")]
        limit: usize,
    },

    /// Undo interrupted checkpoint calls and remove stale staging files
    Recover,

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
}

fn print_example_config() {
    let example = r#"# stagepoint configuration file

[storage]
# Root for relative checkpoint paths (supports ${VAR} expansion)
root = "${HOME}/stagepoint/checkpoints"
# "overwrite" or "fail_if_exists"
default_policy = "overwrite"

[checkpoint]
# Transaction intent files, relative to the storage root
state_dir = ".stagepoint"
# Write <path>.meta.json next to every checkpoint
write_manifest = true

[assembler]
cache_capacity = 256
# "off", "debug" or "trace"
source_log = "debug"
"#;
    println!("{example}");
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        warn!(path = %path.display(), "Config file not found, using defaults");
        return Ok(Config::default());
    }
    Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))
}

fn inspect(config: &Config, path: &Path, limit: usize) -> Result<()> {
    let store = CheckpointStore::from_config(config).context("Failed to open checkpoint store")?;
    let manifest = store
        .manifest(path)?
        .with_context(|| format!("No manifest found for {path:?}"))?;

    println!("Path:        {}", store.storage().resolve(path).display());
    println!("Type:        {}", manifest.descriptor);
    println!("Fingerprint: {}", manifest.fingerprint);
    println!("Records:     {}", manifest.records);
    println!("Job:         {}", manifest.job_id);
    println!("Created:     {}", manifest.created_at.to_rfc3339());

    if limit > 0 {
        let reader = RecordReader::new(store.storage().open(path)?, manifest.descriptor.clone())
            .context("Failed to open checkpoint data")?;
        for record in reader.take(limit) {
            let record = record.context("Failed to read record")?;
            println!("{}", record.to_json(manifest.descriptor.root()));
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example_config();
        }

        Commands::Validate => {
            let config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

            info!("Configuration is valid");
            info!("  Storage root: {}", config.storage.resolved_root().display());
            info!("  Default policy: {:?}", config.storage.default_policy);
            info!("  Manifests: {}", config.checkpoint.write_manifest);
            info!(
                "  Assembler cache: {} ({:?} source log)",
                config.assembler.cache_capacity, config.assembler.source_log
            );
        }

        Commands::Inspect { path, limit } => {
            let config = load_config(&cli.config)?;
            inspect(&config, &path, limit)?;
        }

        Commands::Recover => {
            let config = load_config(&cli.config)?;
            let store =
                CheckpointStore::from_config(&config).context("Failed to open checkpoint store")?;
            let transactions = store.recover().context("Failed to recover transactions")?;

            let storage = LocalStorage::new(&config.storage.resolved_root())?;
            let staging = storage
                .recover()
                .context("Failed to remove stale staging files")?;

            println!("\n=== Recovery Complete ===");
            println!("Transactions undone:   {transactions}");
            println!("Staging files removed: {staging}");
        }
    }

    Ok(())
}
