//! Seed bootstrap for nodes that know no peers yet.
//!
//! A node with an empty peer table dials the configured seed once. The seed
//! then feeds the rest of the network through peer exchange, and the
//! reconnector takes over on later starts.

use crate::error::DiscoveryError;
use crate::network::client::Dialer;
use crate::network::connection::Connection;
use crate::storage::PeerTable;
use tokio::sync::mpsc;

pub struct Bootstrapper {
    seed: String,
    enabled: bool,
}

impl Bootstrapper {
    pub fn new(seed: String, enabled: bool) -> Self {
        Self { seed, enabled }
    }

    /// Whether a node with this peer table should contact the seed
    pub async fn should_bootstrap(&self, table: &PeerTable) -> Result<bool, DiscoveryError> {
        Ok(self.enabled && table.is_empty().await?)
    }

    pub async fn run(self, table: PeerTable, dialer: &Dialer, connections: mpsc::Sender<Connection>) {
        match self.should_bootstrap(&table).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("Skipping bootstrap (disabled or peers already known)");
                return;
            }
            Err(e) => {
                tracing::warn!("Failed to inspect peer table, skipping bootstrap: {}", e);
                return;
            }
        }

        tracing::info!("🌱 Bootstrapping from {}", self.seed);
        match dialer.connect(&self.seed).await {
            Ok(conn) => {
                if connections.send(conn).await.is_err() {
                    tracing::debug!("Peer supervisor gone, dropping bootstrap session");
                }
            }
            Err(e) => tracing::warn!("failed to bootstrap: {}", e),
        }
    }
}
