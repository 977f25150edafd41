// Copyright (c) 2026 Keel Contributors. MIT License.
// See LICENSE for details.

//! # Keel Node
//!
//! Entry point for the `keel-node` binary. Parses CLI arguments,
//! initializes logging, opens the chain store and drives the organizer.
//!
//! The binary supports five subcommands:
//!
//! - `init`    — create the data directory and the genesis chain
//! - `run`     — organize blocks streamed on stdin
//! - `import`  — organize every block in a file
//! - `stat`    — print table statistics
//! - `version` — print build version information
//!
//! ## Threading
//!
//! Any number of producers may hand blocks to the organizer. They all go
//! through one dispatcher task, which adds whatever is queued and then
//! runs a single `organize` pass on the blocking pool. Passes never
//! overlap.

mod cli;
mod logging;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;

use keel_protocol::blockchain::{
    AddOutcome, BlockChain, Organizer, OrganizerError, ReorganizeEvent, SimpleChain, Subscription,
};
use keel_protocol::chain::Block;
use keel_protocol::config::Settings;
use keel_protocol::database::DataBaseStats;

use cli::{Commands, KeelNodeCli, SETTINGS_FILE};

type ChainOrganizer = Organizer<BlockChain>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = KeelNodeCli::parse();

    if let Commands::Version = cli.command {
        print_version();
        return Ok(());
    }

    logging::init_logging("keel_node=info,keel_protocol=info", cli.log_format);

    let settings = cli.load_settings()?;
    match &cli.command {
        Commands::Init => init_node(&cli, &settings),
        Commands::Run(args) => run_node(&cli, settings, args.queue_depth).await,
        Commands::Import(args) => import_blocks(&cli, settings, &args.file).await,
        Commands::Stat => print_stats(&cli, &settings),
        Commands::Version => Ok(()),
    }
}

/// Creates the data directory, the genesis chain and the persisted
/// settings file.
fn init_node(cli: &KeelNodeCli, settings: &Settings) -> Result<()> {
    let data_dir = &cli.data_dir;
    tracing::info!(data_dir = %data_dir.display(), network = %settings.network, "initializing node");

    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let settings_path = data_dir.join(SETTINGS_FILE);
    let encoded = serde_json::to_string_pretty(settings).context("failed to encode settings")?;
    std::fs::write(&settings_path, encoded)
        .with_context(|| format!("failed to write settings to {}", settings_path.display()))?;

    let chain_dir = cli.chain_dir();
    let chain = BlockChain::create(&chain_dir, settings)
        .with_context(|| format!("failed to create chain at {}", chain_dir.display()))?;
    let genesis = settings.genesis_block();
    chain.close().context("failed to close chain store")?;

    println!("Node initialized successfully.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Network        : {}", settings.network);
    println!("  Genesis        : {}", genesis.hash_hex());

    Ok(())
}

fn open_chain(cli: &KeelNodeCli, settings: &Settings) -> Result<Arc<BlockChain>> {
    let chain_dir = cli.chain_dir();
    let chain = BlockChain::open(&chain_dir, settings).with_context(|| {
        format!(
            "failed to open chain at {} (run `keel-node init` first)",
            chain_dir.display()
        )
    })?;
    let top = chain.top()?;
    tracing::info!(path = %chain_dir.display(), ?top, "chain opened");
    Ok(Arc::new(chain))
}

/// Builds an organizer over `chain` that logs every reorganization.
fn start_organizer(chain: &Arc<BlockChain>, settings: Settings) -> Arc<ChainOrganizer> {
    let organizer = Arc::new(Organizer::new(Arc::clone(chain), settings));
    organizer.subscribe_reorganize(|event| {
        match event {
            ReorganizeEvent::Reorganized(reorg) => {
                let top = reorg.fork_height + reorg.arrivals.len() as u64;
                let tip = reorg.arrivals.last().map(|block| block.hash_hex());
                tracing::info!(
                    fork_height = reorg.fork_height,
                    top,
                    tip = tip.as_deref().unwrap_or_default(),
                    arrivals = reorg.arrivals.len(),
                    replaced = reorg.replaced.len(),
                    "new chain tip"
                );
            }
            ReorganizeEvent::Stopped => tracing::debug!("reorganization feed closed"),
        }
        Subscription::Keep
    });
    organizer.start();
    organizer
}

fn decode_block(line: &str) -> Result<Block> {
    let bytes = hex::decode(line.trim()).context("block is not valid hex")?;
    Block::from_bytes(&bytes).context("block failed to decode")
}

/// Adds `block` to the pool. `false` once the organizer has stopped.
fn submit(organizer: &ChainOrganizer, block: Block) -> Result<bool> {
    let hash = block.hash_hex();
    match organizer.add(block) {
        Ok(AddOutcome::Pooled) => tracing::debug!(%hash, "block pooled"),
        Ok(outcome) => tracing::debug!(%hash, ?outcome, "block ignored"),
        Err(OrganizerError::Stopped) => return Ok(false),
        Err(e) => return Err(e).context("failed to add block"),
    }
    Ok(true)
}

async fn organize(organizer: &Arc<ChainOrganizer>) -> Result<usize> {
    let organizer = Arc::clone(organizer);
    let reorganizations = tokio::task::spawn_blocking(move || organizer.organize())
        .await
        .context("organize task panicked")??;
    Ok(reorganizations)
}

/// The single consumer of `blocks`: drains whatever is queued into the
/// pool, then runs one organize pass.
async fn dispatch(organizer: Arc<ChainOrganizer>, mut blocks: mpsc::Receiver<Block>) -> Result<()> {
    while let Some(block) = blocks.recv().await {
        if !submit(&organizer, block)? {
            break;
        }
        while let Ok(block) = blocks.try_recv() {
            if !submit(&organizer, block)? {
                return Ok(());
            }
        }
        organize(&organizer).await?;
    }
    Ok(())
}

/// Streams hex-encoded blocks from stdin into the organizer until EOF or
/// a shutdown signal.
async fn run_node(cli: &KeelNodeCli, settings: Settings, queue_depth: usize) -> Result<()> {
    let chain = open_chain(cli, &settings)?;
    let organizer = start_organizer(&chain, settings);

    let (sender, receiver) = mpsc::channel(queue_depth.max(1));
    let dispatcher = tokio::spawn(dispatch(Arc::clone(&organizer), receiver));

    let reader = async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
            if line.trim().is_empty() {
                continue;
            }
            match decode_block(&line) {
                Ok(block) => {
                    if sender.send(block).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "skipping undecodable block"),
            }
        }
        anyhow::Ok(())
    };

    tokio::select! {
        res = reader => res?,
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    // The sender is gone, so the dispatcher finishes its queue and exits.
    let dispatched = dispatcher.await.context("dispatcher panicked")?;
    shutdown(&organizer, &chain)?;
    dispatched
}

async fn import_blocks(cli: &KeelNodeCli, settings: Settings, file: &Path) -> Result<()> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;

    let chain = open_chain(cli, &settings)?;
    let organizer = start_organizer(&chain, settings);

    let mut submitted = 0usize;
    for (number, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let block = decode_block(line).with_context(|| format!("line {}", number + 1))?;
        submit(&organizer, block)?;
        submitted += 1;
    }
    let reorganizations = organize(&organizer).await?;
    let top = chain.top()?;

    tracing::info!(submitted, reorganizations, top = ?top, "import complete");
    println!("Imported {submitted} blocks, chain top is now {}", top.unwrap_or(0));
    shutdown(&organizer, &chain)
}

#[derive(Serialize)]
struct NodeStats {
    network: String,
    top: Option<u64>,
    tables: DataBaseStats,
}

fn print_stats(cli: &KeelNodeCli, settings: &Settings) -> Result<()> {
    let chain = open_chain(cli, settings)?;
    let stats = NodeStats {
        network: settings.network.to_string(),
        top: chain.top()?,
        tables: chain.statinfo(),
    };
    println!("{}", serde_json::to_string_pretty(&stats)?);
    chain.close().context("failed to close chain store")?;
    Ok(())
}

fn shutdown(organizer: &ChainOrganizer, chain: &BlockChain) -> Result<()> {
    organizer.stop();
    chain.close().context("failed to close chain store")?;
    tracing::info!("keel-node stopped");
    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("keel-node {}", env!("CARGO_PKG_VERSION"));
    println!("rustc     {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
