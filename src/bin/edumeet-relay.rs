use anyhow::Result;
use clap::Parser;
use edumeet::logging;
use edumeet::server::{RelayServer, DEFAULT_IP, DEFAULT_PORT};

/// Room-scoped WebSocket relay for EduMeet signaling.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[arg(long, env = "EDUMEET_RELAY_IP", default_value = DEFAULT_IP)]
    ip: String,

    #[arg(long, env = "EDUMEET_RELAY_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(logging::DEFAULT_DIRECTIVE);
    let args = Args::parse();

    let server = RelayServer::new(Some(args.port), Some(args.ip));
    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Relay shutting down");
            Ok(())
        }
    }
}
