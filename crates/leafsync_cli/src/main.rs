//! leafsync CLI
//!
//! Command-line tools for working with leaf-only stores.
//!
//! # Commands
//!
//! - `expand` - List the leaf keys a key decomposes into
//! - `address` - Translate a logical key into a transport address
//! - `get` - Read keys through the engine against a loopback store
//! - `set` - Write a value, then read it back
//! - `watch` - Subscribe to a key while a simulated controller changes it

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use leafsync_engine::CacheMode;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// leafsync command-line tools.
#[derive(Parser)]
#[command(name = "leafsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the schema document (JSON)
    #[arg(global = true, short, long)]
    schema: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the leaf keys a key expands into
    Expand {
        /// Logical key
        key: String,

        /// Maximum expansion depth
        #[arg(short, long)]
        depth: Option<usize>,
    },

    /// Print the transport address of a key
    Address {
        /// Logical key
        key: String,

        /// Prefix substitution, as FROM=TO (repeatable)
        #[arg(short, long = "map")]
        maps: Vec<String>,
    },

    /// Read keys against a loopback store seeded from the schema
    Get {
        /// Logical keys
        #[arg(required = true)]
        keys: Vec<String>,

        /// Cache mode
        #[arg(short, long, value_enum, default_value = "ignore")]
        mode: ModeArg,
    },

    /// Write a value, then read it back
    Set {
        /// Logical key
        key: String,

        /// Value as JSON
        value: String,
    },

    /// Print changes to a key while a simulated controller mutates it
    Watch {
        /// Logical key
        key: String,

        /// Number of changes to print
        #[arg(short, long, default_value = "10")]
        ticks: usize,
    },

    /// Show version information
    Version,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    /// Always read from the store
    Ignore,
    /// Answer from the mirror when every leaf is present
    Cache,
    /// Answer with the value of a write in flight
    Write,
    /// Wait for a write in flight to finish
    Wait,
}

impl From<ModeArg> for CacheMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Ignore => CacheMode::IgnoreCache,
            ModeArg::Cache => CacheMode::UseCache,
            ModeArg::Write => CacheMode::UseWrite,
            ModeArg::Wait => CacheMode::WaitForWrite,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Commands::Version = cli.command {
        println!("leafsync CLI v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let path = cli.schema.ok_or("schema path required (--schema FILE)")?;
    let schema = commands::load_schema(&path)?;

    match cli.command {
        Commands::Expand { key, depth } => commands::expand::run(&schema, &key, depth)?,
        Commands::Address { key, maps } => commands::address::run(&schema, &key, &maps)?,
        Commands::Get { keys, mode } => commands::get::run(&schema, keys, mode.into()).await?,
        Commands::Set { key, value } => commands::set::run(&schema, &key, &value).await?,
        Commands::Watch { key, ticks } => commands::watch::run(&schema, &key, ticks).await?,
        Commands::Version => {}
    }

    Ok(())
}
