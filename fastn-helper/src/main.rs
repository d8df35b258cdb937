//! fastn-helper: P2P helper daemon
//!
//! The daemon owns an iroh endpoint and lets one host process drive it. The
//! host talks newline delimited JSON either over the daemon's stdin/stdout
//! (`--stdio`) or over the Unix socket `FASTN_HOME/helper.sock`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "fastn-helper")]
#[command(about = "P2P helper daemon for fastn hosts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the helper daemon in foreground mode
    Daemon {
        /// Custom FASTN_HOME directory (defaults to FASTN_HOME env var or ~/.fastn)
        #[arg(long, env = "FASTN_HOME")]
        home: Option<PathBuf>,
        /// Talk to the host over stdin/stdout instead of the control socket
        #[arg(long)]
        stdio: bool,
        /// UDP port for the iroh endpoint (random when not set)
        #[arg(long)]
        port: Option<u16>,
        /// How many upcalls may wait for the host before the network stalls
        #[arg(long)]
        upcall_capacity: Option<usize>,
        /// Disable n0 DNS and local network discovery
        #[arg(long)]
        no_discovery: bool,
    },
    /// Print this daemon's peer id, creating the key if needed
    PeerId {
        /// Custom FASTN_HOME directory (defaults to FASTN_HOME env var or ~/.fastn)
        #[arg(long, env = "FASTN_HOME")]
        home: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // stdout may be the host channel, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            home,
            stdio,
            port,
            upcall_capacity,
            no_discovery,
        } => {
            let fastn_home = cli::get_fastn_home(home)?;
            eprintln!("🚀 Starting fastn-helper daemon");
            eprintln!("📁 FASTN_HOME: {}", fastn_home.display());
            let options = cli::daemon::DaemonOptions {
                stdio,
                port,
                upcall_capacity,
                no_discovery,
            };
            cli::daemon::run(fastn_home, options).await
        }
        Commands::PeerId { home } => {
            let fastn_home = cli::get_fastn_home(home)?;
            cli::identity::show_peer_id(fastn_home).await
        }
    }
}
