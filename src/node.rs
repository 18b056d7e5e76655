//! Assembles the peer network and spawns its long-running tasks.
//!
//! Listener, bootstrapper, reconnector and peer exchange all feed one
//! bounded channel; the peer supervisor is its only consumer.

use crate::config::NetworkConfig;
use crate::constants::discovery::CONNECTION_CHANNEL_SIZE;
use crate::error::AppError;
use crate::network::client::Dialer;
use crate::network::connection::RemoteAddr;
use crate::network::nat::{PortMapper, UpnpPortMapper};
use crate::network::peer::run_peers;
use crate::network::peer_discovery::Bootstrapper;
use crate::network::peer_exchange::PeerExchange;
use crate::network::peer_state::LiveRegistry;
use crate::network::reconnect::Reconnector;
use crate::network::server::{ListenerConfig, TransportListener};
use crate::shutdown::ShutdownManager;
use crate::storage::PeerTable;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const UPNP_SEARCH_TIMEOUT: Duration = Duration::from_secs(3);

pub struct Node {
    pub registry: Arc<LiveRegistry>,
    pub table: PeerTable,
    pub dialer: Arc<Dialer>,
    pub listen_port: u16,
}

impl Node {
    /// Bind the listener and start every network task under `shutdown`
    pub async fn start(
        config: &NetworkConfig,
        table: PeerTable,
        shutdown: &mut ShutdownManager,
    ) -> Result<Self, AppError> {
        if config.enable_bootstrap {
            RemoteAddr::from_url(&config.bootstrap_peer).map_err(|e| {
                AppError::Config(format!("bootstrap_peer: {}", e))
            })?;
        }

        let cancel = shutdown.token();
        let registry = Arc::new(LiveRegistry::new());
        let keep_alive = Duration::from_secs(config.keep_alive_secs);
        let dialer = Arc::new(Dialer::new(
            Duration::from_secs(config.dial_timeout_secs),
            keep_alive,
        ));
        let (connections, incoming) = mpsc::channel(CONNECTION_CHANNEL_SIZE);

        let mapper = config
            .enable_upnp
            .then(|| UpnpPortMapper::new(UPNP_SEARCH_TIMEOUT));
        let listener = TransportListener::bind(
            &table,
            &ListenerConfig {
                default_port: config.listen_port,
                keep_alive,
            },
            mapper.as_ref().map(|m| m as &dyn PortMapper),
        )
        .await?;
        let listen_port = listener.local_port();

        shutdown.spawn(
            "peer-supervisor",
            run_peers(incoming, registry.clone(), table.clone(), cancel.clone()),
        );
        shutdown.spawn("listener", listener.serve(connections.clone(), cancel.clone()));

        let bootstrapper = Bootstrapper::new(config.bootstrap_peer.clone(), config.enable_bootstrap);
        let boot_table = table.clone();
        let boot_dialer = dialer.clone();
        let boot_connections = connections.clone();
        let boot_cancel = cancel.clone();
        shutdown.spawn("bootstrap", async move {
            tokio::select! {
                _ = boot_cancel.cancelled() => {}
                _ = bootstrapper.run(boot_table, &boot_dialer, boot_connections) => {}
            }
        });

        let reconnector = Reconnector {
            table: table.clone(),
            registry: registry.clone(),
            dialer: dialer.clone(),
            connections: connections.clone(),
            interval: Duration::from_secs(config.reconnect_interval_secs),
            dead_retry_probability: config.dead_retry_probability,
        };
        shutdown.spawn("reconnect", reconnector.run(cancel.clone()));

        let pex = PeerExchange {
            table: table.clone(),
            registry: registry.clone(),
            dialer: dialer.clone(),
            connections,
            interval: Duration::from_secs(config.pex_interval_secs),
            call_timeout: Duration::from_secs(config.dial_timeout_secs),
        };
        shutdown.spawn("peer-exchange", pex.run(cancel));

        tracing::info!("✓ Peer network started on port {}", listen_port);
        Ok(Self {
            registry,
            table,
            dialer,
            listen_port,
        })
    }
}
