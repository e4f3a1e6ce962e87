use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about = "Simulate a network of crow nests", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// JSON topology to load instead of the built-in crow village.
    #[arg(long, global = true)]
    pub topology: Option<PathBuf>,

    /// JSON network config. Missing or invalid files fall back to defaults.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Per-hop message loss probability, overriding the config.
    #[arg(long, global = true)]
    pub loss: Option<f64>,

    /// Also write logs to a daily rolling file in this directory.
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the whole scenario: ping, routing, gossip and storage lookups.
    Demo,
    /// Route one message between two nests.
    Route(RouteArgs),
    /// Search the network's storage for a key.
    Lookup(LookupArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RouteArgs {
    #[arg(long)]
    pub from: String,

    #[arg(long)]
    pub to: String,

    /// Text to deliver.
    #[arg(long, default_value = "caw")]
    pub message: String,
}

#[derive(Args, Debug, Clone)]
pub struct LookupArgs {
    /// Nest the search starts from.
    #[arg(long)]
    pub from: String,

    #[arg(long)]
    pub key: String,
}
