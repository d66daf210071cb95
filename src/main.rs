//! `mqd` daemon entry point.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mqd::broker::Broker;
use mqd::config::load_config;
use mqd::lookup::{WebSocketPeer, start_announce_loop};
use mqd::transport::start_websocket_server;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "mqd", version)]
struct Args {
    /// Configuration file (defaults to the optional `config/default`)
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    if let Err(e) = run(args).await {
        // Logging may not be initialized yet if configuration failed.
        eprintln!("mqd: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args.config.as_deref())?;
    mqd::utils::logging::init(&config.log.level);
    info!("mqd v{}", mqd::VERSION);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let broker = Arc::new(Broker::open(config.broker.clone())?);

    tokio::spawn(Broker::start_sweep_loop(broker.clone()));

    if !config.lookup.addresses.is_empty() {
        let peers: Vec<WebSocketPeer> = config
            .lookup
            .addresses
            .iter()
            .map(WebSocketPeer::new)
            .collect();
        tokio::spawn(start_announce_loop(
            broker.clone(),
            peers,
            addr.clone(),
            Duration::from_millis(config.lookup.announce_interval_ms),
        ));
    }

    tokio::select! {
        res = start_websocket_server(addr, broker.clone()) => {
            if let Err(e) = res {
                error!("WebSocket server exited: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    broker.close()?;
    Ok(())
}
