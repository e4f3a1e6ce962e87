mod cli;
mod logging;
mod scenario;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use nest_network::{NetworkConfig, Topology};

use cli::{Cli, Command};

const CONVERGENCE_LIMIT: Duration = Duration::from_secs(10);

fn load_config(cli: &Cli) -> Result<NetworkConfig> {
    let mut config = match &cli.config {
        Some(path) => NetworkConfig::load_or_default(path),
        None => NetworkConfig::default(),
    };
    if let Some(loss) = cli.loss {
        config.loss_rate = loss;
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid network config: {e}"))?;
    Ok(config)
}

fn load_topology(cli: &Cli) -> Result<Topology> {
    match &cli.topology {
        Some(path) => Topology::load(path).context("Failed to load topology"),
        None => Ok(Topology::crow_nests()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = logging::init_logging(cli.log_dir.as_deref())?;

    let config = load_config(&cli)?;
    let network = load_topology(&cli)?
        .build(config)
        .context("Failed to build network")?;
    scenario::install_message_handler(&network);
    network.start();

    network.broadcast_all_connections()?;
    if network.wait_for_convergence(CONVERGENCE_LIMIT).await {
        info!("Connections converged across {} nests", network.nest_ids().len());
    } else {
        warn!("Connections did not converge within {CONVERGENCE_LIMIT:?}");
    }

    let result = match &cli.command {
        Command::Demo => scenario::demo(&network).await,
        Command::Route(args) => scenario::route(&network, &args.from, &args.to, &args.message)
            .await
            .map(|reply| println!("{reply}")),
        Command::Lookup(args) => scenario::lookup(&network, &args.from, &args.key)
            .await
            .map(|value| println!("{value}")),
    };

    network.shutdown();
    result
}
