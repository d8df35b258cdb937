use std::net::{Ipv4Addr, SocketAddrV4};

/// How the daemon's iroh endpoint is set up.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub secret_key: iroh::SecretKey,
    /// UDP port to bind; a random one when `None`.
    pub port: Option<u16>,
    /// Publish and resolve addresses through n0 DNS and mDNS.
    pub discovery: bool,
    /// Use the n0 relay servers. Tests on one machine turn this off.
    pub relay: bool,
}

impl EndpointConfig {
    pub fn new(secret_key: iroh::SecretKey) -> Self {
        Self {
            secret_key,
            port: None,
            discovery: true,
            relay: true,
        }
    }
}

/// Binds the endpoint every helper connection goes through.
#[tracing::instrument(skip_all, fields(port = ?config.port, discovery = config.discovery))]
pub async fn bind(config: EndpointConfig) -> eyre::Result<iroh::Endpoint> {
    let mut builder = iroh::Endpoint::builder()
        .secret_key(config.secret_key)
        .alpns(vec![crate::ALPN.to_vec()]);

    if config.discovery {
        builder = builder.discovery_n0().discovery_local_network();
    }
    if !config.relay {
        builder = builder.relay_mode(iroh::RelayMode::Disabled);
    }
    if let Some(port) = config.port {
        builder = builder.bind_addr_v4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    }

    match builder.bind().await {
        Ok(endpoint) => {
            tracing::info!(node_id = %endpoint.node_id(), "endpoint bound");
            Ok(endpoint)
        }
        Err(e) => Err(eyre::anyhow!("failed to bind to iroh network: {e:?}")),
    }
}
