//! Agora Store operator tool
//!
//! Opens the node's database directly. Meant for inspection and manual
//! repair while the node is stopped, or for seeding a test network.
//!
//! ## Usage
//!
//! ```bash
//! # Row counts per table
//! agora-store stats
//!
//! # Admit a JSON array of entities through the normal write path
//! agora-store ingest batch.json
//!
//! # Read a board with its threads and every owner key
//! agora-store read boards --fp <fingerprint> --embed threads --embed keys
//!
//! # Dump the address book
//! agora-store addresses
//!
//! # Record addresses this node connected to itself
//! agora-store trust-address addresses.json
//! ```
//!
//! Exits non-zero if the engine reports a fatal storage condition.

use std::path::PathBuf;
use std::sync::Arc;

use agora_store::{
    Address, AddressSearch, Config, Engine, Entity, EntityKind, ReadOptions, StorageError,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "agora-store")]
#[command(about = "Persistence engine for an Agora node")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "AGORA_STORE_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "AGORA_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print row counts per table
    Stats,

    /// Batch insert a JSON array of entities
    Ingest {
        /// File holding the entities
        file: PathBuf,
    },

    /// Read one kind with optional filters and embeds
    Read {
        /// boards, threads, posts, votes, keys or truststates
        kind: EntityKind,

        /// Fingerprints to fetch
        #[arg(long = "fp")]
        fingerprints: Vec<String>,

        /// threads, posts, votes or keys
        #[arg(long = "embed")]
        embeds: Vec<String>,

        #[arg(long, default_value_t = 0)]
        begin: i64,

        #[arg(long, default_value_t = 0)]
        end: i64,

        /// Read as the local application
        #[arg(long)]
        privileged: bool,

        /// Extra filters as JSON, e.g. '{"owner":"..","limit":10}'
        #[arg(long)]
        options: Option<String>,
    },

    /// Print every stored address, most recently synced first
    Addresses,

    /// Store first-party addresses from a JSON array
    TrustAddress {
        file: PathBuf,
    },
}

fn read_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Log and exit if the engine says local state can't be trusted
fn exit_if_fatal(err: &StorageError) {
    if err.is_fatal() {
        error!(error = %err, "Fatal storage condition, stopping");
        std::process::exit(2);
    }
}

async fn run(engine: Engine, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Stats => {
            print_json(&engine.reader.database_counts()?)?;
        }

        Command::Ingest { file } => {
            let entities: Vec<Entity> = read_json(&file)?;
            info!(count = entities.len(), file = %file.display(), "Ingesting batch");

            // Writes may sleep on a locked database; keep them off the runtime
            let writer = Arc::clone(&engine.writer);
            let result = tokio::task::spawn_blocking(move || writer.batch_insert(entities)).await?;
            match result {
                Ok(metrics) => print_json(&metrics)?,
                Err(e) => {
                    exit_if_fatal(&e);
                    return Err(e.into());
                }
            }
        }

        Command::Read {
            kind,
            fingerprints,
            embeds,
            begin,
            end,
            privileged,
            options,
        } => {
            let opts: ReadOptions = match options {
                Some(json) => serde_json::from_str(&json).context("Invalid --options JSON")?,
                None => ReadOptions::default(),
            };
            let response = engine
                .reader
                .read(kind, &fingerprints, &embeds, begin, end, privileged, &opts)
                .map_err(|e| {
                    exit_if_fatal(&e);
                    e
                })?;
            print_json(&response)?;
        }

        Command::Addresses => {
            let addresses = engine
                .reader
                .read_addresses(&AddressSearch::All { descending: true })
                .map_err(|e| {
                    exit_if_fatal(&e);
                    e
                })?;
            print_json(&addresses)?;
        }

        Command::TrustAddress { file } => {
            let addresses: Vec<Address> = read_json(&file)?;
            let total = addresses.len();

            let writer = Arc::clone(&engine.writer);
            let errors =
                tokio::task::spawn_blocking(move || writer.insert_or_update_addresses(addresses))
                    .await?;
            for e in &errors {
                exit_if_fatal(e);
                warn!(error = %e, "Address not stored");
            }
            info!(total, refused = errors.len(), "Trusted addresses processed");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("agora_store=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)
            .with_context(|| format!("Failed to load config {}", config_path.display()))?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = &args.storage_dir {
        config.storage_dir = dir.clone();
    }

    tokio::fs::create_dir_all(&config.storage_dir).await?;

    // Save default config if it doesn't exist, so the node id stays stable
    let config_path = config.config_path();
    if args.config.is_none() {
        if config_path.exists() {
            config = Config::load(&config_path)?;
            if let Some(dir) = &args.storage_dir {
                config.storage_dir = dir.clone();
            }
        } else {
            config.save(&config_path)?;
            info!(path = %config_path.display(), "Created default config");
        }
    }

    let engine = Engine::open(&config).map_err(|e| {
        exit_if_fatal(&e);
        e
    })?;

    run(engine, args.command).await
}
