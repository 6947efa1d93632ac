mod command;
mod mission;
mod safety;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use clap::Parser;
use tello_shared::{AmqpConnector, AppConfig, LinkError};
use tracing::{error, info, warn};

use command::{CommandDispatcher, SequenceResult};
use safety::PreflightReport;

/// How long to wait for the broker before giving up on the flight
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "tello-commander", version, about = "Fly a pre-flight checked square through the broker")]
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
    info!("Commander starting, broker {}", config.broker.endpoint());

    let mut dispatcher = CommandDispatcher::new(
        AmqpConnector,
        config.broker.clone(),
        Arc::new(config.flight.clone()),
    );

    let flown = tokio::select! {
        result = fly(&mut dispatcher) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    let result = match flown {
        Some(result) => result,
        None => {
            warn!("Interrupted, landing");
            dispatcher.emergency_land().await.map(|()| false)
        }
    };

    info!(
        "Shutting down (link {}, {} command(s) queued)",
        dispatcher.state(),
        dispatcher.pending_count()
    );
    dispatcher.shutdown().await;

    match result {
        Ok(true) => {
            info!("Flight complete");
            Ok(())
        }
        Ok(false) => bail!("Flight aborted"),
        Err(err) => {
            error!("Fatal broker error: {}", err);
            Err(err.into())
        }
    }
}

/// Connect, run the pre-flight check, then fly the square.
/// Returns whether every step succeeded.
async fn fly(dispatcher: &mut CommandDispatcher<AmqpConnector>) -> Result<bool, LinkError> {
    if !dispatcher.wait_for_connection(CONNECT_TIMEOUT).await? {
        error!("Broker not reachable within {:?}", CONNECT_TIMEOUT);
        return Ok(false);
    }

    match safety::preflight(dispatcher).await? {
        PreflightReport::Ready { battery, height } => {
            info!("Ready: battery {}%, height {}", battery, height);
        }
        PreflightReport::Aborted(failure) => {
            error!("Pre-flight check failed: {}", failure);
            return Ok(false);
        }
    }

    let config = dispatcher.config();
    let commands = mission::square(&config);
    info!("Flying square: {}", commands.join(", "));
    dispatcher.idle(config.command_delay()).await?;

    match dispatcher.run_sequence(&commands).await? {
        SequenceResult::Completed { executed } => {
            info!("Executed {} command(s)", executed);
            Ok(true)
        }
        SequenceResult::Aborted { command, outcome } => {
            error!("Aborted at {:?}: {:?}", command, outcome);
            Ok(false)
        }
    }
}
