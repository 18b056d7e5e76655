//! Periodic re-dialing of persisted peers.
//!
//! Each scan walks the peer table and dials every record whose state calls
//! for it. The outcome of a dial moves the record through its state machine:
//!
//! | state     | dial ok | dial failed |
//! |-----------|---------|-------------|
//! | unchecked | alive   | deleted     |
//! | alive     | alive   | dead        |
//! | dead      | alive   | dead        |

use crate::error::{DiscoveryError, StorageError};
use crate::network::client::Dialer;
use crate::network::connection::{Connection, TransportError};
use crate::network::peer_state::LiveRegistry;
use crate::storage::{PeerRecord, PeerState, PeerTable};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Whether a record in `state` is dialed this scan. `retry_dead` is only
/// consulted for dead peers.
pub fn should_attempt(state: PeerState, retry_dead: impl FnOnce() -> bool) -> bool {
    match state {
        PeerState::Unchecked | PeerState::Alive => true,
        PeerState::Dead => retry_dead(),
    }
}

/// Record the outcome of a dial against the peer stored under `key`.
///
/// A successful dial is always handed back, even if persisting the new
/// state failed.
pub async fn settle<T>(
    table: &PeerTable,
    key: &str,
    record: &PeerRecord,
    dial: Result<T, TransportError>,
) -> Result<T, DiscoveryError> {
    match dial {
        Ok(conn) => {
            if record.state != PeerState::Alive {
                if let Err(e) = table.put(key, &record.with_state(PeerState::Alive)).await {
                    tracing::warn!("Failed to mark {} alive: {}", key, e);
                }
            }
            Ok(conn)
        }
        Err(dial) => {
            let update = match record.state {
                PeerState::Alive => table.put(key, &record.with_state(PeerState::Dead)).await,
                PeerState::Unchecked => table.delete(key).await,
                PeerState::Dead => Ok(()),
            };
            match update {
                Ok(()) => Err(DiscoveryError::Dial(dial)),
                Err(storage) => Err(DiscoveryError::Bookkeeping { dial, storage }),
            }
        }
    }
}

pub struct Reconnector {
    pub table: PeerTable,
    pub registry: Arc<LiveRegistry>,
    pub dialer: Arc<Dialer>,
    pub connections: mpsc::Sender<Connection>,
    pub interval: Duration,
    pub dead_retry_probability: f64,
}

impl Reconnector {
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.scan(&cancel).await {
                        tracing::warn!("Reconnect scan failed: {}", e);
                    }
                }
            }
        }
        tracing::debug!("Reconnector stopped");
    }

    /// Dial every due record not already live. Returns how many dials were started.
    async fn scan(&self, cancel: &CancellationToken) -> Result<usize, StorageError> {
        let p = self.dead_retry_probability;
        let mut dialed = 0;
        for (key, record) in self.table.peers().await? {
            if cancel.is_cancelled() {
                break;
            }
            if !should_attempt(record.state, || rand::thread_rng().gen::<f64>() < p) {
                continue;
            }
            let Some(addr) = record.remote_addr() else {
                tracing::warn!("Skipping peer record {} with malformed address", key);
                continue;
            };
            let url = addr.canonical_url();
            if self.registry.contains(&url) {
                continue;
            }

            let dialer = self.dialer.clone();
            let table = self.table.clone();
            let connections = self.connections.clone();
            tokio::spawn(async move {
                let dial = dialer.connect(&url).await;
                match settle(&table, &key, &record, dial).await {
                    Ok(conn) => {
                        tracing::info!("🔄 Reconnected to {}", url);
                        if connections.send(conn).await.is_err() {
                            tracing::debug!("Peer supervisor gone, dropping {}", url);
                        }
                    }
                    Err(e @ DiscoveryError::Bookkeeping { .. }) => {
                        tracing::warn!("Reconnect to {}: {}", url, e)
                    }
                    Err(e) => tracing::debug!("Reconnect to {} failed: {}", url, e),
                }
            });
            dialed += 1;
        }
        Ok(dialed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::connection::RemoteAddr;
    use crate::storage::InMemoryKv;

    fn local(port: u16) -> RemoteAddr {
        RemoteAddr::new("127.0.0.1".parse().unwrap(), port)
    }

    #[tokio::test]
    async fn test_scan_skips_live_and_settles_failures() {
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let unreachable = local(silent.local_addr().unwrap().port());
        let live = local(1);
        let dead = local(2);

        let table = PeerTable::new(Arc::new(InMemoryKv::new()));
        for (addr, state) in [
            (live, PeerState::Alive),
            (unreachable, PeerState::Unchecked),
            (dead, PeerState::Dead),
        ] {
            table
                .put_peer(&addr.canonical_url(), &PeerRecord::new(&addr, state))
                .await
                .unwrap();
        }

        let registry = Arc::new(LiveRegistry::new());
        registry.try_insert(&live.canonical_url(), live, true);
        let (connections, mut forwarded) = mpsc::channel(4);
        let reconnector = Reconnector {
            table: table.clone(),
            registry,
            dialer: Arc::new(Dialer::new(
                Duration::from_millis(200),
                Duration::from_secs(10),
            )),
            connections,
            interval: Duration::from_secs(3600),
            dead_retry_probability: 0.0,
        };

        // live is connected and dead is never retried: only the unchecked one
        let dialed = reconnector.scan(&CancellationToken::new()).await.unwrap();
        assert_eq!(dialed, 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        let mut remaining: Vec<_> = table
            .peers()
            .await
            .unwrap()
            .into_iter()
            .map(|(_, record)| (record.remote_addr().unwrap(), record.state))
            .collect();
        remaining.sort_by_key(|(addr, _)| addr.port);
        assert_eq!(
            remaining,
            vec![(live, PeerState::Alive), (dead, PeerState::Dead)]
        );
        assert!(forwarded.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_scan_dials_nothing() {
        let table = PeerTable::new(Arc::new(InMemoryKv::new()));
        let addr = local(3);
        table
            .put_peer(&addr.canonical_url(), &PeerRecord::new(&addr, PeerState::Alive))
            .await
            .unwrap();
        let (connections, _forwarded) = mpsc::channel(1);
        let reconnector = Reconnector {
            table,
            registry: Arc::new(LiveRegistry::new()),
            dialer: Arc::new(Dialer::new(Duration::from_millis(200), Duration::from_secs(10))),
            connections,
            interval: Duration::from_secs(3600),
            dead_retry_probability: 1.0,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(reconnector.scan(&cancel).await.unwrap(), 0);
    }
}
