//! CLI argument definitions for biofetch.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `extract` | Fetch one row per identifier |
//! | `cache clear` | Drop the cache generation of the configured source |
//! | `health` | Probe the upstream once without waiting for rate budget |
//!
//! # Examples
//!
//! ```bash
//! biofetch --config chembl.yaml extract --ids CHEMBL25,CHEMBL1201585 --pretty
//! biofetch --config chembl.yaml extract --ids-file ids.txt --no-cache
//! biofetch --config chembl.yaml cache clear
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "biofetch",
    author,
    version,
    about = "Resilient batched extraction from bioactivity and literature APIs"
)]
pub struct Cli {
    /// Extraction config file (YAML).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    /// Log filter such as `debug` or `biofetch_core=trace`. Overrides RUST_LOG.
    #[arg(long, global = true)]
    pub log: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Extract records for a list of identifiers.
    ///
    /// Every valid identifier yields exactly one row. Rows that could not be
    /// fetched carry `fallback_*` fields. Ctrl-C stops after the current batch.
    Extract(ExtractArgs),

    /// Manage the response cache.
    Cache(CacheArgs),

    /// Probe the upstream once.
    Health(HealthArgs),
}

#[derive(Debug, Args)]
pub struct ExtractArgs {
    /// Comma-separated identifiers.
    #[arg(long, value_delimiter = ',')]
    pub ids: Vec<String>,

    /// File with one identifier per line. Blank lines and `#` comments are skipped.
    #[arg(long)]
    pub ids_file: Option<PathBuf>,

    /// Bypass the cache for this run.
    #[arg(long, default_value_t = false)]
    pub no_cache: bool,

    /// Stop issuing new batches after this many seconds.
    #[arg(long)]
    pub deadline_secs: Option<u64>,
}

#[derive(Debug, Args)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// Remove every cached batch of the configured generation.
    Clear,
}

#[derive(Debug, Args)]
pub struct HealthArgs {
    /// Path to probe, relative to the base URL. Defaults to the endpoint.
    #[arg(long)]
    pub path: Option<String>,
}
