//! Peer supervisor: the single consumer of established connections.
//!
//! Every connection, whichever component produced it, ends up here. The
//! supervisor tracks it in the live registry (first session per URL wins),
//! opens the RPC channel, and tears everything down when the channel closes.

use crate::constants::rpc::{METHOD_PEERS, METHOD_WHOAMI};
use crate::network::connection::{Connection, RemoteAddr};
use crate::network::message::PeerAddr;
use crate::network::peer_state::LiveRegistry;
use crate::network::rpc::{self, RpcHandlers};
use crate::storage::{PeerRecord, PeerState, PeerTable};
use ciborium::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Methods served to every peer
pub fn peer_handlers(remote_addr: RemoteAddr, registry: Arc<LiveRegistry>) -> RpcHandlers {
    RpcHandlers::new()
        .register(METHOD_WHOAMI, move |_| async move {
            Ok(PeerAddr {
                addr: remote_addr,
                incoming: None,
            }
            .to_value())
        })
        .register(METHOD_PEERS, move |_| {
            let registry = registry.clone();
            async move {
                Ok(Value::Array(
                    registry.peer_addrs().iter().map(PeerAddr::to_value).collect(),
                ))
            }
        })
}

pub async fn run_peers(
    mut connections: mpsc::Receiver<Connection>,
    registry: Arc<LiveRegistry>,
    table: PeerTable,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            conn = connections.recv() => match conn {
                Some(conn) => {
                    tokio::spawn(supervise(conn, registry.clone(), table.clone()));
                }
                None => break,
            },
        }
    }
    tracing::debug!("Peer supervisor stopped");
}

async fn supervise(conn: Connection, registry: Arc<LiveRegistry>, table: PeerTable) {
    let url = conn.canonical_url();
    let direction = if conn.incoming { "inbound" } else { "outbound" };
    tracing::info!("🔗 Got peer {} ({})", url, direction);

    let owned = registry.try_insert(&url, conn.remote_addr, conn.incoming);
    if !owned {
        tracing::debug!("Already tracking {}, not registering duplicate session", url);
    }

    if conn.incoming {
        let record = PeerRecord::new(&conn.remote_addr, PeerState::Unchecked);
        if let Err(e) = table.put_peer(&url, &record).await {
            tracing::warn!("Failed to record inbound peer {}: {}", url, e);
        }
    }

    let Connection {
        session,
        send,
        recv,
        remote_addr,
        ..
    } = conn;
    let peer = rpc::open(recv, send, peer_handlers(remote_addr, registry.clone()));
    if owned {
        registry.attach_handle(&url, peer.clone());
    }

    match peer.call(METHOD_WHOAMI, vec![]).await {
        Ok(value) => match PeerAddr::from_value(&value) {
            Some(seen) => tracing::info!("🪞 {} sees us as {}", url, seen.addr),
            None => tracing::debug!("{} answered whoami with {:?}", url, value),
        },
        Err(e) => tracing::debug!("whoami to {} failed: {}", url, e),
    }

    peer.closed().await;
    if owned {
        registry.remove(&url);
    }
    session.close(0u32.into(), b"closed");
    tracing::info!("👋 Peer {} disconnected", url);
}
