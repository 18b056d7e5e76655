//! Gossip-based peer exchange.
//!
//! Every round asks each handshaken peer for its own live peers and dials
//! any address we are not already connected to.

use crate::constants::rpc::METHOD_PEERS;
use crate::error::DiscoveryError;
use crate::network::client::Dialer;
use crate::network::connection::Connection;
use crate::network::message::PeerAddr;
use crate::network::peer_state::LiveRegistry;
use crate::network::rpc::{PeerHandle, RpcError};
use crate::storage::{PeerRecord, PeerState, PeerTable};
use ciborium::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Usable addresses from a `peers` reply; malformed entries are skipped
pub fn parse_peers(reply: Value) -> Result<Vec<PeerAddr>, RpcError> {
    match reply {
        Value::Array(entries) => Ok(entries.iter().filter_map(PeerAddr::from_value).collect()),
        other => Err(RpcError::InvalidResponse(format!(
            "peers returned {:?}",
            other
        ))),
    }
}

#[derive(Clone)]
pub struct PeerExchange {
    pub table: PeerTable,
    pub registry: Arc<LiveRegistry>,
    pub dialer: Arc<Dialer>,
    pub connections: mpsc::Sender<Connection>,
    pub interval: Duration,
    /// Upper bound on each `peers` call
    pub call_timeout: Duration,
}

impl PeerExchange {
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for (url, peer) in self.registry.handshaken() {
                        let pex = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = pex.exchange_with(peer).await {
                                tracing::debug!("Peer exchange with {} failed: {}", url, e);
                            }
                        });
                    }
                }
            }
        }
        tracing::debug!("Peer exchange stopped");
    }

    /// Ask `peer` for its live peers and dial the unknown ones.
    /// Returns how many dials were started.
    async fn exchange_with(&self, peer: PeerHandle) -> Result<usize, DiscoveryError> {
        let reply = tokio::time::timeout(self.call_timeout, peer.call(METHOD_PEERS, vec![]))
            .await
            .map_err(|_| DiscoveryError::NoReply {
                method: METHOD_PEERS,
                secs: self.call_timeout.as_secs(),
            })??;
        let mut dialed = 0;
        for learned in parse_peers(reply)? {
            let url = learned.addr.canonical_url();
            if self.registry.contains(&url) {
                continue;
            }

            let pex = self.clone();
            tokio::spawn(async move {
                match pex.dialer.connect(&url).await {
                    Ok(conn) => {
                        tracing::info!("🔍 Discovered peer {}", url);
                        let record = PeerRecord::new(&learned.addr, PeerState::Alive);
                        if let Err(e) = pex.table.put_peer(&url, &record).await {
                            tracing::warn!("Failed to record discovered peer {}: {}", url, e);
                        }
                        if pex.connections.send(conn).await.is_err() {
                            tracing::debug!("Peer supervisor gone, dropping {}", url);
                        }
                    }
                    Err(e) => tracing::debug!("Dial to gossiped peer {} failed: {}", url, e),
                }
            });
            dialed += 1;
        }
        Ok(dialed)
    }
}
