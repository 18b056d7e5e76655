use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Instant;

use super::connection::RemoteAddr;
use super::message::PeerAddr;
use super::rpc::PeerHandle;

/// Live state for one tracked session
#[derive(Clone)]
pub struct LivePeer {
    pub remote_addr: RemoteAddr,

    /// Whether the remote dialed us
    pub incoming: bool,

    /// When this connection was registered
    pub connected_at: Instant,

    /// RPC surface, published once the channel is open
    pub peer: Option<PeerHandle>,
}

/// Canonical peer URL -> live session, at most one per URL
pub struct LiveRegistry {
    peers: DashMap<String, LivePeer>,
}

impl LiveRegistry {
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
        }
    }

    /// Register a session unless the URL is already tracked.
    /// Returns true if this caller now owns the entry.
    pub fn try_insert(&self, url: &str, remote_addr: RemoteAddr, incoming: bool) -> bool {
        match self.peers.entry(url.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(LivePeer {
                    remote_addr,
                    incoming,
                    connected_at: Instant::now(),
                    peer: None,
                });
                true
            }
        }
    }

    /// Publish the RPC handle on an owned entry
    pub fn attach_handle(&self, url: &str, handle: PeerHandle) {
        if let Some(mut entry) = self.peers.get_mut(url) {
            entry.peer = Some(handle);
        }
    }

    pub fn remove(&self, url: &str) -> Option<LivePeer> {
        self.peers.remove(url).map(|(_, peer)| peer)
    }

    pub fn contains(&self, url: &str) -> bool {
        self.peers.contains_key(url)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Address payloads served by the `peers` method
    pub fn peer_addrs(&self) -> Vec<PeerAddr> {
        self.peers
            .iter()
            .map(|entry| PeerAddr {
                addr: entry.remote_addr,
                incoming: Some(entry.incoming),
            })
            .collect()
    }

    /// Entries whose RPC channel is open
    pub fn handshaken(&self) -> Vec<(String, PeerHandle)> {
        self.peers
            .iter()
            .filter_map(|entry| {
                entry
                    .peer
                    .as_ref()
                    .filter(|peer| !peer.is_closed())
                    .map(|peer| (entry.key().clone(), peer.clone()))
            })
            .collect()
    }
}

impl Default for LiveRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> RemoteAddr {
        RemoteAddr::new("8.8.8.8".parse().unwrap(), port)
    }

    #[test]
    fn test_duplicate_url_not_tracked() {
        let registry = LiveRegistry::new();
        let url = addr(1).canonical_url();
        assert!(registry.try_insert(&url, addr(1), true));
        assert!(!registry.try_insert(&url, addr(1), false));
        assert_eq!(registry.len(), 1);

        let entry = registry.remove(&url).unwrap();
        assert!(entry.incoming);
        assert!(registry.is_empty());
        assert!(registry.try_insert(&url, addr(1), false));
    }

    #[test]
    fn test_concurrent_inserts_single_winner() {
        let registry = std::sync::Arc::new(LiveRegistry::new());
        let url = addr(7).canonical_url();
        let winners: usize = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let url = url.clone();
                std::thread::spawn(move || registry.try_insert(&url, addr(7), false))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_peer_addrs_and_handshaken() {
        let registry = LiveRegistry::new();
        registry.try_insert(&addr(1).canonical_url(), addr(1), true);
        registry.try_insert(&addr(2).canonical_url(), addr(2), false);

        let mut ports: Vec<u16> = registry.peer_addrs().iter().map(|p| p.addr.port).collect();
        ports.sort();
        assert_eq!(ports, vec![1, 2]);
        // no handle published yet
        assert!(registry.handshaken().is_empty());
    }
}
