//! marketindex CLI — run the marketplace indexer and query listings.
//!
//! Usage:
//! ```bash
//! marketindex run     --config marketindex.toml
//! marketindex status  --db marketindex.db
//! marketindex active  --db marketindex.db --limit 10 --json
//! marketindex tokens  --db marketindex.db
//! marketindex history --db marketindex.db --nft 0x… --token 7
//! marketindex decode  --topics 0x… 0x… --data 0x…
//! marketindex info
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use alloy_primitives::{Address, U256};
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use marketindex_core::event::{decode, EventKind};
use marketindex_core::query::{format_ether, truncate_middle, QueryFacade};
use marketindex_core::{Cursor, ListingKey, ListingStore, RawLog};
use marketindex_evm::{HttpLogSource, IndexerBuilder};
use marketindex_storage::SqliteStorage;

mod config;
mod logging;

use config::{AppConfig, RPC_URL_ENV};
use logging::init_tracing;

#[derive(Parser)]
#[command(
    name = "marketindex",
    about = "NFT marketplace event indexer",
    long_about = "
Indexes ItemListed / ItemBought / ItemCancelled events of an NFT marketplace
contract into a SQLite listing store and answers listing queries.

ENVIRONMENT VARIABLES:
  MARKETINDEX_RPC_URL   Overrides [rpc].url from the config file
  RUST_LOG              Overrides the [log] filter
",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingestion pipeline until Ctrl-C (or the configured end block)
    Run {
        /// Path to the TOML config file
        #[arg(short, long, default_value = "marketindex.toml")]
        config: PathBuf,
    },

    /// Print the persisted cursor
    Status {
        #[arg(long, default_value = "marketindex.db")]
        db: String,
    },

    /// Newest active listings
    Active {
        #[arg(long, default_value = "marketindex.db")]
        db: String,
        /// Maximum number of listings (default 5)
        #[arg(long)]
        limit: Option<usize>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// All listings ordered by token id, highest first
    Tokens {
        #[arg(long, default_value = "marketindex.db")]
        db: String,
        #[arg(long)]
        json: bool,
    },

    /// Journaled events for one (nft, token) key
    History {
        #[arg(long, default_value = "marketindex.db")]
        db: String,
        /// NFT contract address
        #[arg(long)]
        nft: String,
        /// Token id (decimal or 0x-hex)
        #[arg(long)]
        token: String,
    },

    /// Decode a single raw marketplace log
    Decode {
        /// topics[0] = event signature hash, topics[1..] = indexed params
        #[arg(long, num_args = 1..)]
        topics: Vec<String>,
        /// Non-indexed params (hex, 0x-prefixed)
        #[arg(long, default_value = "0x")]
        data: String,
    },

    /// Show defaults and event signatures
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => cmd_run(config).await,
        Commands::Status { db } => cmd_status(&db).await,
        Commands::Active { db, limit, json } => cmd_active(&db, limit, json).await,
        Commands::Tokens { db, json } => cmd_tokens(&db, json).await,
        Commands::History { db, nft, token } => cmd_history(&db, &nft, &token).await,
        Commands::Decode { topics, data } => cmd_decode(topics, data),
        Commands::Info => {
            cmd_info();
            Ok(())
        }
    }
}

// ─── Command implementations ─────────────────────────────────────────────────

async fn cmd_run(path: PathBuf) -> Result<()> {
    let config = AppConfig::load(&path)?;
    init_tracing(&config.log);

    let source = HttpLogSource::new(config.rpc.url.clone(), config.source_config())?;
    let store = SqliteStorage::open(&config.storage.path)
        .await
        .with_context(|| format!("opening {}", config.storage.path))?;
    let store = Arc::new(store);

    let mut pipeline = IndexerBuilder::from_config(config.indexer.clone()).build(Arc::new(source), store.clone())?;
    let stop = pipeline.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping after the current batch");
            stop.stop();
        }
    });

    info!(
        rpc = %config.rpc.url,
        contract = %config.indexer.contract_address,
        db = %config.storage.path,
        "Starting marketindex"
    );
    let result = pipeline.run().await;
    let stats = pipeline.stats();
    info!(
        batches = stats.batches,
        events = stats.events_applied,
        duplicates = stats.duplicates,
        decode_failures = stats.decode_failures,
        retries = stats.retries,
        reorgs = stats.reorgs,
        "Run summary"
    );
    store.close().await;
    result.map_err(Into::into)
}

async fn open_store(db: &str) -> Result<Arc<SqliteStorage>> {
    if !std::path::Path::new(db).exists() {
        return Err(anyhow!("database '{db}' not found (run `marketindex run` first)"));
    }
    let store = SqliteStorage::open(db).await.with_context(|| format!("opening {db}"))?;
    Ok(Arc::new(store))
}

async fn cmd_status(db: &str) -> Result<()> {
    let store = open_store(db).await?;
    match store.cursor().await? {
        Some(cursor) => print_cursor(&cursor, store.event_count().await?),
        None => println!("No cursor yet: nothing has been indexed."),
    }
    Ok(())
}

fn print_cursor(cursor: &Cursor, events: u64) {
    println!("Cursor:");
    println!("  block:      {}", cursor.block_number);
    println!("  hash:       {}", cursor.block_hash);
    println!("  updated_at: {}", cursor.updated_at);
    println!("  events:     {events}");
}

async fn cmd_active(db: &str, limit: Option<usize>, as_json: bool) -> Result<()> {
    let facade = QueryFacade::new(open_store(db).await?);
    let listings = facade.active_listings(limit).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&listings)?);
        return Ok(());
    }
    if listings.is_empty() {
        println!("No active listings.");
        return Ok(());
    }
    println!("{:<15} {:>12} {:<15} {:>24}", "NFT", "TOKEN", "SELLER", "PRICE (ETH)");
    for l in &listings {
        println!(
            "{:<15} {:>12} {:<15} {:>24}",
            truncate_middle(&l.nft_address.to_string(), 15),
            truncate_middle(&l.token_id.to_string(), 12),
            truncate_middle(&l.seller.to_string(), 15),
            l.price_ether()
        );
    }
    Ok(())
}

async fn cmd_tokens(db: &str, as_json: bool) -> Result<()> {
    let facade = QueryFacade::new(open_store(db).await?);
    let listings = facade.listings_by_token_desc().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&listings)?);
        return Ok(());
    }
    for l in &listings {
        let status = match (l.active, l.buyer) {
            (true, _) => "active".to_string(),
            (false, Some(buyer)) => format!("sold to {}", truncate_middle(&buyer.to_string(), 15)),
            (false, None) => "cancelled".to_string(),
        };
        println!(
            "{:>12}  {}  {} ETH  {}",
            l.token_id,
            l.nft_address,
            format_ether(l.price),
            status
        );
    }
    Ok(())
}

async fn cmd_history(db: &str, nft: &str, token: &str) -> Result<()> {
    let nft: Address = nft.parse().with_context(|| format!("invalid NFT address '{nft}'"))?;
    let token = parse_token_id(token)?;
    let store = open_store(db).await?;

    let events = store.history(&ListingKey::new(nft, token)).await?;
    if events.is_empty() {
        println!("No events for {nft} #{token}.");
    }
    for e in &events {
        println!("{}", serde_json::to_string(e)?);
    }
    Ok(())
}

fn parse_token_id(s: &str) -> Result<U256> {
    let parsed = match s.strip_prefix("0x") {
        Some(hex) => U256::from_str_radix(hex, 16),
        None => U256::from_str_radix(s, 10),
    };
    parsed.map_err(|e| anyhow!("invalid token id '{s}': {e}"))
}

fn cmd_decode(topics: Vec<String>, data: String) -> Result<()> {
    let raw = RawLog {
        block_number: 0,
        block_hash: String::new(),
        log_index: 0,
        tx_hash: "0x0".into(),
        address: String::new(),
        topics,
        data,
        removed: false,
    };
    let event = decode(&raw)?;
    println!("{}", serde_json::to_string_pretty(&event.event)?);
    Ok(())
}

fn cmd_info() {
    let defaults = IndexerBuilder::new().build_config();
    println!("marketindex v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default confirmation depth: {} blocks", defaults.confirmation_depth);
    println!("  Default batch size:         {} blocks/call", defaults.batch_size);
    println!("  Default max reorg depth:    {} blocks", defaults.max_reorg_depth);
    println!("  Default poll interval:      {} ms", defaults.poll_interval_ms);
    println!("  Storage backends:           memory, SQLite");
    println!("  RPC URL override:           ${RPC_URL_ENV}");
    println!("  Events:");
    for kind in EventKind::ALL {
        println!("    {:<60} {}", kind.signature(), kind.topic0());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_ids_parse_decimal_and_hex() {
        assert_eq!(parse_token_id("42").unwrap(), U256::from(42u64));
        assert_eq!(parse_token_id("0x2a").unwrap(), U256::from(42u64));
        assert!(parse_token_id("forty-two").is_err());
    }

    #[test]
    fn cli_parses_commands() {
        let cli = Cli::try_parse_from(["marketindex", "active", "--limit", "3", "--json"]).unwrap();
        match cli.command {
            Commands::Active { db, limit, json } => {
                assert_eq!(db, "marketindex.db");
                assert_eq!(limit, Some(3));
                assert!(json);
            }
            _ => panic!("expected active"),
        }
    }
}
