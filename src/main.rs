use std::{net::SocketAddr, path::PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;

use fedsim::{
    compute::{self, ComputeState},
    gateway::{self, GatewayConfig},
    Simulation, SimulationConfig,
};

#[derive(Parser)]
#[command(name = "fedsim", version, about = "Federated learning simulator")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs a simulation to completion and prints the accuracy per round.
    Simulate {
        #[command(flatten)]
        sim: SimArgs,
    },
    /// Serves `/start-training` and `/get-status` over a simulation.
    Serve {
        #[command(flatten)]
        sim: SimArgs,
        #[arg(long, default_value = "0.0.0.0:8888", env = "FEDSIM_ADDR")]
        addr: SocketAddr,
    },
    /// Proxies `/api/*` requests to a compute host.
    Gateway {
        #[arg(long, default_value = "127.0.0.1:8000", env = "GATEWAY_ADDR")]
        addr: SocketAddr,
        /// The compute host's base URL.
        #[arg(long, env = "COMPUTE_SERVER_URL_FL")]
        upstream: Option<String>,
    },
}

#[derive(clap::Args)]
struct SimArgs {
    /// JSON simulation config, defaults apply to missing fields.
    #[arg(short, long, env = "FEDSIM_CONFIG")]
    config: Option<PathBuf>,
    /// Overrides the number of rounds.
    #[arg(long)]
    rounds: Option<u32>,
    /// Overrides the seed.
    #[arg(long)]
    seed: Option<u64>,
}

impl SimArgs {
    fn load(&self) -> anyhow::Result<SimulationConfig> {
        let mut config = match &self.config {
            Some(path) => SimulationConfig::load(path)?,
            None => SimulationConfig::default(),
        };

        if let Some(rounds) = self.rounds {
            config.strategy.num_rounds = rounds;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                info!("shutting down");
                shutdown.cancel();
            }
        }
    });

    match Args::parse().command {
        Command::Simulate { sim } => simulate(sim.load()?, shutdown).await,
        Command::Serve { sim, addr } => {
            let app = compute::router(ComputeState::new(sim.load()?, shutdown.clone()));
            serve(app, addr, shutdown).await
        }
        Command::Gateway { addr, upstream } => {
            let config = upstream.map_or_else(GatewayConfig::from_env, GatewayConfig::new);
            info!("forwarding to {}", config.upstream);
            serve(gateway::router(config), addr, shutdown).await
        }
    }
}

async fn simulate(config: SimulationConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let history = Simulation::new(config)?
        .with_cancel_token(shutdown)
        .run()
        .await
        .context("simulation failed")?;

    for record in history.rounds() {
        match (record.loss, record.metrics.get("accuracy")) {
            (Some(loss), Some(accuracy)) => println!(
                "round {:>3}: loss {loss:.4}  accuracy {:.2}%",
                record.round,
                accuracy * 100.0
            ),
            _ => println!("round {:>3}: not evaluated", record.round),
        }
    }
    Ok(())
}

async fn serve(
    app: axum::Router,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!("listening at {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}
