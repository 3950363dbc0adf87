use anyhow::{anyhow, Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tidepool_store::{
    config::{StoreConfig, StoreConfigBuilder},
    engine::Engine,
    entry::MessageId,
    id,
};
use tracing::log::{debug, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn setup_logger() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new("info"))
                .context("error parsing RUST_LOG env")?
        )
        .init();
    Ok(())
}

/// A topic-indexed, time-ordered message store.
///
/// Messages are appended to a topic inside a contract (a numeric tenant namespace) and read
/// back newest-first. Every write is an atomic batch in an append-only log that is replayed
/// when the store is opened.
#[derive(Debug, Parser)]
#[command(max_term_width=100)]
struct Args {
    /// Path to a YAML (or JSON) store config file.
    ///
    /// Recognized keys are `directory`, `value_directory`, `value_threshold`, `sync_writes`,
    /// `default_ttl_secs`, and `sweep_interval_ms`. Anything else is ignored.
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Store directory. Overrides `directory` from the config file.
    #[arg(short = 'd', long)]
    dir: Option<PathBuf>,

    /// Separate directory for the value log (large records).
    #[arg(long)]
    value_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Append a message to a topic, printing its generated id (hex).
    Put {
        #[arg(short = 'C', long, default_value = "0")]
        contract: u32,
        #[arg(short, long)]
        topic: String,
        payload: String,
    },
    /// Store a message under a specific id (hex).
    PutId {
        #[arg(short = 'C', long, default_value = "0")]
        contract: u32,
        #[arg(short, long)]
        topic: String,
        #[arg(short, long)]
        id: String,
        payload: String,
    },
    /// Print the newest messages in a topic, one per line, newest first.
    Get {
        #[arg(short = 'C', long, default_value = "0")]
        contract: u32,
        #[arg(short, long)]
        topic: String,
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Delete a message by id (hex).
    Delete {
        #[arg(short = 'C', long, default_value = "0")]
        contract: u32,
        #[arg(short, long)]
        topic: String,
        #[arg(short, long)]
        id: String,
    },
    /// Generate a message id without storing anything.
    GenId {
        #[arg(short = 'C', long, default_value = "0")]
        contract: u32,
        #[arg(short, long, default_value = "")]
        topic: String,
        #[arg(default_value = "")]
        payload: String,
    },
    /// Rewrite the log so it only holds live messages.
    Compact,
    /// Remove expired messages.
    Sweep,
    /// Print some information about the store.
    Stats,
}

#[derive(Debug, Serialize)]
struct Stats {
    directory: PathBuf,
    value_directory: PathBuf,
    entries: usize,
}

fn load_config(args: &Args) -> Result<StoreConfig> {
    let config = match &args.config {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            let parsed = StoreConfig::parse(&contents)
                .with_context(|| format!("parsing config {}", path.display()))?;
            if args.dir.is_none() && args.value_dir.is_none() {
                return Ok(parsed);
            }
            let mut builder = StoreConfigBuilder::default()
                .directory(args.dir.clone().unwrap_or_else(|| parsed.directory().clone()))
                .value_threshold(parsed.value_threshold())
                .sync_writes(parsed.sync_writes());
            if let Some(value_dir) = args.value_dir.clone().or_else(|| parsed.value_directory().clone()) {
                builder = builder.value_directory(value_dir);
            }
            if let Some(ttl) = parsed.default_ttl_secs() {
                builder = builder.default_ttl_secs(ttl);
            }
            if let Some(interval) = parsed.sweep_interval_ms() {
                builder = builder.sweep_interval_ms(interval);
            }
            builder.build()?
        }
        None => {
            let dir = args.dir.clone()
                .ok_or_else(|| anyhow!("either --config or --dir is required"))?;
            let mut builder = StoreConfigBuilder::default().directory(dir);
            if let Some(value_dir) = args.value_dir.clone() {
                builder = builder.value_directory(value_dir);
            }
            builder.build()?
        }
    };
    Ok(config)
}

fn parse_id(hex: &str) -> Result<MessageId> {
    MessageId::from_hex(hex).ok_or_else(|| anyhow!("invalid hex id: {}", hex))
}

fn print_gen_id(engine: &Engine, contract: u32, topic: &str, payload: &str) -> Result<()> {
    let id = engine.gen_id(contract, topic.as_bytes(), payload.as_bytes())?;
    let when = id::timestamp_of(&id)
        .and_then(|ts| Utc.timestamp_micros(*ts).single())
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default();
    println!("{} {}", id, when);
    Ok(())
}

fn run(engine: &Engine, config: &StoreConfig, command: Command) -> Result<()> {
    match command {
        Command::Put { contract, topic, payload } => {
            let id = engine.put(contract, topic.as_bytes(), payload.as_bytes())?;
            println!("{}", id);
        }
        Command::PutId { contract, topic, id, payload } => {
            engine.put_with_id(contract, topic.as_bytes(), parse_id(&id)?, payload.as_bytes())?;
        }
        Command::Get { contract, topic, limit } => {
            for payload in engine.get(contract, topic.as_bytes(), limit)? {
                println!("{}", String::from_utf8_lossy(&payload));
            }
        }
        Command::Delete { contract, topic, id } => {
            engine.delete(contract, topic.as_bytes(), parse_id(&id)?)?;
        }
        Command::GenId { contract, topic, payload } => {
            print_gen_id(engine, contract, &topic, &payload)?;
        }
        Command::Compact => {
            let count = engine.compact()?;
            info!("main() -- compacted log to {} entries", count);
        }
        Command::Sweep => {
            let count = engine.sweep_expired()?;
            println!("{}", count);
        }
        Command::Stats => {
            let stats = Stats {
                directory: config.directory().clone(),
                value_directory: config.value_dir().to_path_buf(),
                entries: engine.len()?,
            };
            print!("{}", serde_yaml::to_string(&stats)?);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    setup_logger()
        .context("Failed to setup logging")?;
    let args = Args::parse();

    // generating an id doesn't need a store at all
    if let Command::GenId { contract, topic, payload } = &args.command {
        return print_gen_id(&Engine::new(), *contract, topic, payload);
    }

    let config = load_config(&args)?;
    debug!("main() -- config: {:?}", config);
    let engine = Engine::new();
    engine.open(&config)
        .with_context(|| format!("opening store in {}", config.directory().display()))?;
    let res = run(&engine, &config, args.command);
    engine.close()?;
    res
}
