mod command;
mod transport;

use std::path::PathBuf;

use anyhow::bail;
use clap::Parser;
use tello_shared::broker::{ConnectionManager, Role};
use tello_shared::{AmqpConnector, AppConfig};
use tracing::{error, info, warn};

use command::CommandRelay;
use transport::{DroneClient, Vehicle};

#[derive(Parser, Debug)]
#[command(name = "tello-executor", version, about = "Relay broker commands to a Tello over UDP")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short = 'C', long)]
    config: Option<PathBuf>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,

    #[arg(long)]
    broker_host: Option<String>,

    #[arg(long)]
    broker_port: Option<u16>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if let Some(host) = cli.broker_host {
        config.broker.host = host;
    }
    if let Some(port) = cli.broker_port {
        config.broker.port = port;
    }

    if cli.print_config {
        print!("{}", config.to_toml());
        return Ok(());
    }
    config.validate()?;

    tello_shared::init_logging(config.log_level.as_deref());
    info!("Executor starting, broker {}", config.broker.endpoint());

    let mut drone = DroneClient::bind(&config.drone).await?;
    match drone.connect().await {
        Some(reply) => info!("Vehicle handshake answered {:?}", reply),
        None => bail!(
            "Vehicle at {}:{} did not answer the handshake",
            config.drone.address,
            config.drone.command_port
        ),
    }

    let link = ConnectionManager::new(
        AmqpConnector,
        config.broker.clone(),
        &config.flight,
        Role::Executor,
    );
    let mut relay = CommandRelay::new(link, drone, config.flight.poll_interval());

    let result = tokio::select! {
        result = relay.run() => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    if result.is_none() {
        warn!("Interrupted");
    }
    info!("Shutting down ({} reply(s) queued)", relay.queued_replies());
    relay.shutdown().await;

    if let Some(Err(err)) = result {
        error!("Fatal broker error: {}", err);
        return Err(err.into());
    }
    Ok(())
}
