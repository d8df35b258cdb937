//! The helper daemon
//!
//! One process per FASTN_HOME. It binds an iroh endpoint with the node key
//! from `helper.key`, wires it to the helper core and hands control to a
//! single host, either over stdin/stdout or over the control socket.

use fs2::FileExt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod config;
pub mod control;

pub use config::DaemonConfig;

pub const LOCK_FILE: &str = "helper.lock";

/// Command line flags for `fastn-helper daemon`.
#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    pub stdio: bool,
    pub port: Option<u16>,
    pub upcall_capacity: Option<usize>,
    pub no_discovery: bool,
}

/// Daemon context containing runtime state and lock
#[derive(Debug)]
pub struct DaemonContext {
    pub secret_key: iroh::SecretKey,
    pub peer_id: fastn_helper_core::PeerId,
    pub fastn_home: PathBuf,
    pub _lock_file: std::fs::File, // Keep lock file open to maintain exclusive access
}

pub async fn run(fastn_home: PathBuf, options: DaemonOptions) -> eyre::Result<()> {
    let context = initialize_daemon(&fastn_home).await?;
    let config = DaemonConfig::load(&fastn_home).await?.with_options(&options);
    tracing::debug!(?config, "daemon config");

    let mut endpoint_config = fastn_helper_net::EndpointConfig::new(context.secret_key.clone());
    endpoint_config.port = config.bind_port;
    endpoint_config.discovery = config.discovery;
    endpoint_config.relay = config.relay;
    let endpoint = fastn_helper_net::bind(endpoint_config).await?;
    let transport = fastn_helper_net::IrohTransport::new(endpoint);

    let (helper, upcalls) = fastn_helper_core::Helper::new(
        Arc::new(transport.clone()),
        fastn_helper_core::HelperConfig {
            upcall_capacity: config.upcall_capacity,
        },
    );
    for protocol in &config.stream_handlers {
        helper.add_stream_handler(protocol.clone()).await?;
        eprintln!("📡 Accepting streams for {protocol}");
    }
    let dispatcher = fastn_helper_core::Dispatcher::new(helper);

    eprintln!("✅ fastn-helper ready");
    eprintln!("   Peer ID: {}", context.peer_id);

    let cancel = tokio_util::sync::CancellationToken::new();
    let served = if options.stdio {
        tokio::select! {
            result = control::run_stdio(dispatcher, upcalls) => result,
            _ = tokio::signal::ctrl_c() => Ok(()),
        }
    } else {
        let server = control::run_socket(&fastn_home, dispatcher, upcalls, cancel.clone());
        tokio::pin!(server);
        tokio::select! {
            result = &mut server => result,
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                server.await
            }
        }
    };

    eprintln!("🛑 Shutting down");
    transport.shutdown().await;
    served
}

/// Initialize daemon environment with singleton lock protection
pub async fn initialize_daemon(fastn_home: &Path) -> eyre::Result<DaemonContext> {
    // Ensure FASTN_HOME directory exists
    tokio::fs::create_dir_all(fastn_home).await?;

    let lock_path = fastn_home.join(LOCK_FILE);
    let lock_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&lock_path)?;

    // fail immediately if another daemon owns this home
    if let Err(e) = lock_file.try_lock_exclusive() {
        return Err(eyre::eyre!(
            "❌ Another daemon is already running (lock file: {})\n   Error: {}\n   Shutdown the existing daemon first.",
            lock_path.display(),
            e
        ));
    }

    eprintln!("🔒 Acquired exclusive daemon lock: {}", lock_path.display());

    let secret_key = super::identity::get_or_create_daemon_key(fastn_home).await?;
    let peer_id = fastn_helper_net::peer_id(&secret_key.public());

    Ok(DaemonContext {
        secret_key,
        peer_id,
        fastn_home: fastn_home.to_path_buf(),
        _lock_file: lock_file, // Keep file open to maintain lock
    })
}
