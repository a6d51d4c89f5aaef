//! Backup engine - command-line entry point.

use std::num::NonZeroUsize;
use std::path::PathBuf;

use anyhow::Result;
use aws_sdk_s3::types::StorageClass;
use backup_engine::engine::{self, BackupEngine};
use backup_engine::snapshot::zfs::ZfsEngine;
use backup_engine::state::StateStore;
use backup_engine::store::s3::{parse_storage_class, S3Store};
use backup_engine::store::ObjectStore;
use backup_engine::transfer;
use backup_engine::{utils, BackupConfig, RunOptions};
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Set up the state file for a new dataset+destination pair
    Init(InitArgs),
    /// Snapshot the dataset and upload the next link of the chain
    Run(RunArgs),
    /// Show the persisted chain position, and optionally the remote groups
    Status(StatusArgs),
}

#[derive(Args, Debug)]
struct InitArgs {
    /// Dataset to back up, e.g. `tank/photos`
    #[arg(long)]
    dataset: String,

    /// Destination bucket
    #[arg(long)]
    bucket: String,

    /// Snapshots will be named `{prefix}0`, `{prefix}1`, ... An incremental
    /// group `{prefix}0_{prefix}1` carries the data to reach the second
    /// snapshot when the first is already received
    #[arg(long, default_value = "backup")]
    snapshot_prefix: String,

    /// Remote object-key prefix, e.g. `photos/`
    #[arg(long)]
    object_prefix: String,

    /// Where to keep the state file
    #[arg(long)]
    state_path: PathBuf,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path of the state file written by `init`
    #[arg(long)]
    state_path: PathBuf,

    /// Maximum object size in bytes; bigger streams are split into chunks
    /// `0`, `1`, `2`, ... (AWS caps a single PutObject at 5 GB)
    #[arg(long)]
    chunk_size: NonZeroUsize,

    /// Storage class for uploaded chunks (e.g. STANDARD, DEEP_ARCHIVE)
    #[arg(long, value_parser = parse_storage_class)]
    storage_class: Option<StorageClass>,

    /// Upload to this bucket instead of the configured one
    #[arg(long)]
    bucket: Option<String>,

    /// Use this object-key prefix instead of the configured one
    #[arg(long)]
    object_prefix: Option<String>,

    /// Custom S3-compatible endpoint (switches to path-style addressing),
    /// for development servers like minio
    #[arg(long)]
    endpoint_url: Option<String>,
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// Path of the state file written by `init`
    #[arg(long)]
    state_path: PathBuf,

    /// Also list the chunk groups present in the destination bucket
    #[arg(long)]
    remote: bool,

    /// Custom S3-compatible endpoint (switches to path-style addressing)
    #[arg(long)]
    endpoint_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    utils::logger::init(&cli.log_level);

    match cli.command {
        Commands::Init(args) => init(args).await,
        Commands::Run(args) => run(args).await,
        Commands::Status(args) => status(args).await,
    }
}

async fn init(args: InitArgs) -> Result<()> {
    let state_store = StateStore::new(&args.state_path);
    engine::init(
        &state_store,
        BackupConfig {
            dataset: args.dataset,
            bucket: args.bucket,
            snapshot_prefix: args.snapshot_prefix,
            object_prefix: args.object_prefix,
        },
    )
    .await?;
    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    let state_store = StateStore::new(&args.state_path);
    // Peek at the config for the destination; `run` re-loads under the lock.
    let state = state_store.load().await?;
    let bucket = args
        .bucket
        .unwrap_or_else(|| state.config.bucket.clone());

    let store = S3Store::connect(bucket, args.endpoint_url.as_deref()).await;
    let snapshots = ZfsEngine::new();
    let engine = BackupEngine::new(&snapshots, &store);

    let options = RunOptions {
        chunk_size: args.chunk_size,
        storage_class: args.storage_class.map(|class| class.as_str().to_string()),
        object_prefix_override: args.object_prefix,
    };
    let report = engine.run(&state_store, &options).await?;
    tracing::info!(
        snapshot = %report.snapshot,
        group = %report.group,
        chunks = report.chunks,
        bytes = report.bytes,
        "backup complete"
    );
    Ok(())
}

async fn status(args: StatusArgs) -> Result<()> {
    let state_store = StateStore::new(&args.state_path);
    let state = state_store.load().await?;

    println!("dataset:         {}", state.config.dataset);
    println!("bucket:          {}", state.config.bucket);
    println!("snapshot prefix: {}", state.config.snapshot_prefix);
    println!("object prefix:   {}", state.config.object_prefix);
    match &state.chain_head {
        Some(head) => println!("chain head:      {head}"),
        None => println!("chain head:      (no successful backup yet)"),
    }
    println!(
        "next snapshot:   {}{}",
        state.config.snapshot_prefix, state.next_index
    );

    if args.remote {
        let store = S3Store::connect(state.config.bucket.clone(), args.endpoint_url.as_deref())
            .await;
        let keys = store.list(&state.config.object_prefix).await?;
        let groups = transfer::chain_order(
            &state.config.snapshot_prefix,
            transfer::groups_from_keys(&state.config.object_prefix, keys.iter().map(String::as_str)),
        );
        println!("remote groups:   {}", groups.len());
        for (group, chunks) in groups {
            println!("  {}{group}  ({chunks} chunks)", state.config.object_prefix);
        }
    }
    Ok(())
}
