use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use lan_file_relay::{
    cli::{Cli, Command},
    client,
    server::{self, HubConfig, RelayServer},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Hub(args) => {
            let listener = TcpListener::bind((args.host, args.port))
                .await
                .with_context(|| format!("failed to bind {}:{}", args.host, args.port))?;
            let server = RelayServer::new(listener, HubConfig::from(&args));
            let addr = server.local_addr()?;
            info!("hub listening on {}", addr);
            server::log_banner(addr).await;
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("hub exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
