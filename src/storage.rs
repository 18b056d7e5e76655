//! Key-value persistence for the peer table.
//!
//! Two interchangeable backends implement [`KvStore`]: a sled tree for the
//! daemon and an ordered in-memory map for tests and ephemeral nodes. Values
//! are opaque bytes at this level; [`PeerTable`] layers the typed keys the
//! network core uses (`listenPort`, `peer-<url>`) on top with bincode.

use crate::config::StorageConfig;
use crate::constants::discovery::{LISTEN_PORT_KEY, PEER_KEY_PREFIX};
use crate::error::StorageError;
use crate::network::connection::RemoteAddr;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::RwLock;

#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
    async fn clear(&self) -> Result<(), StorageError>;
    /// All entries in key order, restricted to `[prefix, prefix_end(prefix))`
    /// when a prefix is given.
    async fn entries(&self, prefix: Option<&str>)
        -> Result<Vec<(String, Vec<u8>)>, StorageError>;
}

/// Exclusive upper bound of a prefix scan: the prefix with its last
/// character incremented. `None` means the scan is unbounded above.
pub fn prefix_end(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    let last = chars.pop()?;
    let next = char::from_u32(u32::from(last) + 1)?;
    chars.push(next);
    Some(chars.into_iter().collect())
}

pub struct InMemoryKv {
    entries: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

impl Default for InMemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.entries.write().await.clear();
        Ok(())
    }

    async fn entries(
        &self,
        prefix: Option<&str>,
    ) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let entries = self.entries.read().await;
        let collected = match prefix {
            None => entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            Some(prefix) => {
                let upper = match prefix_end(prefix) {
                    Some(end) => Bound::Excluded(end),
                    None => Bound::Unbounded,
                };
                entries
                    .range::<String, _>((Bound::Included(prefix.to_string()), upper))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            }
        };
        Ok(collected)
    }
}

pub struct SledKv {
    db: sled::Db,
}

impl SledKv {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let db = sled::Config::new()
            .path(path)
            .mode(sled::Mode::HighThroughput)
            .open()
            .map_err(|source| StorageError::DatabaseOpen {
                name: "peers".to_string(),
                source,
            })?;
        Ok(Self { db })
    }

    fn decode_key(key: &[u8]) -> Result<String, StorageError> {
        String::from_utf8(key.to_vec())
            .map_err(|e| StorageError::Serialization(format!("non-utf8 key: {}", e)))
    }
}

#[async_trait::async_trait]
impl KvStore for SledKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.db.insert(key.as_bytes(), value)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.db.remove(key.as_bytes())?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.db.clear()?;
        Ok(())
    }

    async fn entries(
        &self,
        prefix: Option<&str>,
    ) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let iter = match prefix {
            None => self.db.iter(),
            Some(prefix) => match prefix_end(prefix) {
                Some(end) => self.db.range(prefix.as_bytes()..end.as_bytes()),
                None => self.db.range(prefix.as_bytes()..),
            },
        };
        let mut collected = Vec::new();
        for item in iter {
            let (key, value) = item?;
            collected.push((Self::decode_key(&key)?, value.to_vec()));
        }
        Ok(collected)
    }
}

/// Open the backend named in `config`: "memory", or sled under `data_dir`
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn KvStore>, StorageError> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryKv::new())),
        "sled" => {
            let path = format!("{}/peers", config.data_dir);
            Ok(Arc::new(SledKv::new(&path)?))
        }
        other => Err(StorageError::DatabaseOp(format!(
            "unknown storage backend: {}",
            other
        ))),
    }
}

/// Health of a persisted peer, driving the reconnect policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    /// Learned from an inbound dial, never confirmed by an outbound one
    Unchecked,
    Alive,
    Dead,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Raw IP octets (4 or 16 bytes)
    pub address: Vec<u8>,
    pub port: u16,
    pub state: PeerState,
}

impl PeerRecord {
    pub fn new(addr: &RemoteAddr, state: PeerState) -> Self {
        Self {
            address: addr.address_bytes(),
            port: addr.port,
            state,
        }
    }

    pub fn remote_addr(&self) -> Option<RemoteAddr> {
        RemoteAddr::from_bytes(&self.address, self.port)
    }

    pub fn with_state(&self, state: PeerState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }
}

/// Typed view over the keys the network core persists
#[derive(Clone)]
pub struct PeerTable {
    kv: Arc<dyn KvStore>,
}

impl PeerTable {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn peer_key(url: &str) -> String {
        format!("{}{}", PEER_KEY_PREFIX, url)
    }

    pub async fn listen_port(&self) -> Result<Option<u16>, StorageError> {
        match self.kv.get(LISTEN_PORT_KEY).await? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn set_listen_port(&self, port: u16) -> Result<(), StorageError> {
        self.kv
            .set(LISTEN_PORT_KEY, bincode::serialize(&port)?)
            .await
    }

    pub async fn get(&self, key: &str) -> Result<Option<PeerRecord>, StorageError> {
        match self.kv.get(key).await? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn put(&self, key: &str, record: &PeerRecord) -> Result<(), StorageError> {
        self.kv.set(key, bincode::serialize(record)?).await
    }

    pub async fn put_peer(&self, url: &str, record: &PeerRecord) -> Result<(), StorageError> {
        self.put(&Self::peer_key(url), record).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.kv.delete(key).await
    }

    /// Every persisted peer record keyed by its full storage key.
    /// Records that fail to decode are skipped.
    pub async fn peers(&self) -> Result<Vec<(String, PeerRecord)>, StorageError> {
        let entries = self.kv.entries(Some(PEER_KEY_PREFIX)).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, bytes)| match bincode::deserialize(&bytes) {
                Ok(record) => Some((key, record)),
                Err(e) => {
                    tracing::warn!("Skipping undecodable peer record {}: {}", key, e);
                    None
                }
            })
            .collect())
    }

    pub async fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.kv.entries(Some(PEER_KEY_PREFIX)).await?.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_prefix_end_increments_last_char() {
        assert_eq!(prefix_end("peer-").as_deref(), Some("peer."));
        assert_eq!(prefix_end("a").as_deref(), Some("b"));
        assert_eq!(prefix_end(""), None);
    }

    #[tokio::test]
    async fn test_memory_prefix_scan() {
        let kv = InMemoryKv::new();
        for key in ["peer-b", "other", "peer-a", "peer.", "peeq"] {
            kv.set(key, vec![1]).await.unwrap();
        }

        let keys: Vec<String> = kv
            .entries(Some("peer-"))
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["peer-a".to_string(), "peer-b".to_string()]);

        assert_eq!(kv.entries(None).await.unwrap().len(), 5);
        kv.clear().await.unwrap();
        assert!(kv.entries(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_peer_table_roundtrip() {
        let table = PeerTable::new(Arc::new(InMemoryKv::new()));
        assert_eq!(table.listen_port().await.unwrap(), None);
        table.set_listen_port(4000).await.unwrap();
        assert_eq!(table.listen_port().await.unwrap(), Some(4000));

        let addr = RemoteAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 3963);
        let record = PeerRecord::new(&addr, PeerState::Unchecked);
        table.put_peer(&addr.canonical_url(), &record).await.unwrap();

        let peers = table.peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].0, "peer-https://8.8.8.8:3963");
        assert_eq!(peers[0].1.remote_addr(), Some(addr));
        // listenPort is not a peer record
        assert!(!table.is_empty().await.unwrap());
    }
}
