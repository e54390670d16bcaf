use std::{net::IpAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay hub, accepting WebSocket connections on /ws.
    Hub(HubArgs),
    /// Connect to a hub and chat or send files from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct HubArgs {
    /// Interface the hub binds to.
    #[arg(long, env = "RELAY_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port the hub listens on. Use 0 for an ephemeral port.
    #[arg(long, env = "PORT", default_value_t = 9001)]
    pub port: u16,

    /// Directory served over HTTP next to the WebSocket endpoint.
    #[arg(long, env = "RELAY_PUBLIC_DIR")]
    pub public_dir: Option<PathBuf>,

    /// Frames buffered per connection; a client that falls further behind is disconnected.
    #[arg(long, default_value_t = 256, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    pub outbox_capacity: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// WebSocket URL of the hub.
    #[arg(long, default_value = "ws://127.0.0.1:9001/ws")]
    pub server: String,

    /// Seconds between keep-alive pings.
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    pub keepalive_secs: u64,

    /// Where received files are written.
    #[arg(long, default_value = ".")]
    pub download_dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn hub_defaults_listen_on_all_interfaces() {
        let cli = Cli::try_parse_from(["lan_file_relay", "hub"]).expect("parse hub");
        let Command::Hub(args) = cli.command else {
            panic!("expected hub command");
        };
        assert!(args.host.is_unspecified());
        assert_eq!(args.port, 9001);
        assert_eq!(args.outbox_capacity, 256);
        assert!(args.public_dir.is_none());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let result = Cli::try_parse_from(["lan_file_relay", "hub", "--outbox-capacity", "0"]);
        assert!(result.is_err());
    }
}
