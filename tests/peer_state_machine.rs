//! Peer record transitions driven by dial outcomes.

use async_trait::async_trait;
use std::sync::Arc;
use tsnode::error::{DiscoveryError, StorageError};
use tsnode::network::connection::{RemoteAddr, TransportError};
use tsnode::network::reconnect::{settle, should_attempt};
use tsnode::storage::{InMemoryKv, KvStore, PeerRecord, PeerState, PeerTable};

const URL: &str = "https://203.0.113.7:3963";

fn record(state: PeerState) -> PeerRecord {
    PeerRecord::new(&RemoteAddr::from_url(URL).unwrap(), state)
}

fn refused() -> Result<(), TransportError> {
    Err(TransportError::Connect("connection refused".to_string()))
}

async fn seeded(state: PeerState) -> (PeerTable, String) {
    let table = PeerTable::new(Arc::new(InMemoryKv::new()));
    let key = PeerTable::peer_key(URL);
    table.put(&key, &record(state)).await.unwrap();
    (table, key)
}

/// Reads work, every write fails
struct ReadOnlyKv(InMemoryKv);

#[async_trait]
impl KvStore for ReadOnlyKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.0.get(key).await
    }
    async fn set(&self, _key: &str, _value: Vec<u8>) -> Result<(), StorageError> {
        Err(StorageError::DatabaseOp("read-only".to_string()))
    }
    async fn delete(&self, _key: &str) -> Result<(), StorageError> {
        Err(StorageError::DatabaseOp("read-only".to_string()))
    }
    async fn clear(&self) -> Result<(), StorageError> {
        Err(StorageError::DatabaseOp("read-only".to_string()))
    }
    async fn entries(&self, prefix: Option<&str>) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        self.0.entries(prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_dead_peers_consult_the_coin() {
        assert!(should_attempt(PeerState::Alive, || panic!("not consulted")));
        assert!(should_attempt(PeerState::Unchecked, || panic!("not consulted")));
        assert!(should_attempt(PeerState::Dead, || true));
        assert!(!should_attempt(PeerState::Dead, || false));
    }

    #[tokio::test]
    async fn test_successful_dial_marks_alive() {
        for state in [PeerState::Unchecked, PeerState::Alive, PeerState::Dead] {
            let (table, key) = seeded(state).await;
            let conn = settle(&table, &key, &record(state), Ok(42u8)).await.unwrap();
            assert_eq!(conn, 42);
            assert_eq!(table.get(&key).await.unwrap().unwrap().state, PeerState::Alive);
        }
    }

    #[tokio::test]
    async fn test_failed_dial_on_alive_marks_dead() {
        let (table, key) = seeded(PeerState::Alive).await;
        let outcome = settle(&table, &key, &record(PeerState::Alive), refused()).await;
        assert!(matches!(outcome, Err(DiscoveryError::Dial(_))));
        assert_eq!(table.get(&key).await.unwrap().unwrap().state, PeerState::Dead);
    }

    #[tokio::test]
    async fn test_failed_dial_on_unchecked_forgets_peer() {
        let (table, key) = seeded(PeerState::Unchecked).await;
        let outcome = settle(&table, &key, &record(PeerState::Unchecked), refused()).await;
        assert!(matches!(outcome, Err(DiscoveryError::Dial(_))));
        assert!(table.get(&key).await.unwrap().is_none());
        assert!(table.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_dial_on_dead_stays_dead() {
        let (table, key) = seeded(PeerState::Dead).await;
        let outcome = settle(&table, &key, &record(PeerState::Dead), refused()).await;
        assert!(matches!(outcome, Err(DiscoveryError::Dial(_))));
        assert_eq!(table.get(&key).await.unwrap().unwrap().state, PeerState::Dead);
    }

    #[tokio::test]
    async fn test_storage_failure_is_reported_with_dial_error() {
        let inner = InMemoryKv::new();
        let key = PeerTable::peer_key(URL);
        inner
            .set(&key, bincode::serialize(&record(PeerState::Alive)).unwrap())
            .await
            .unwrap();
        let table = PeerTable::new(Arc::new(ReadOnlyKv(inner)));

        match settle(&table, &key, &record(PeerState::Alive), refused()).await {
            Err(DiscoveryError::Bookkeeping { dial, storage }) => {
                assert!(matches!(dial, TransportError::Connect(_)));
                assert!(matches!(storage, StorageError::DatabaseOp(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
        // Record untouched
        assert_eq!(table.get(&key).await.unwrap().unwrap().state, PeerState::Alive);
    }

    #[tokio::test]
    async fn test_storage_failure_after_successful_dial_keeps_connection() {
        let inner = InMemoryKv::new();
        let key = PeerTable::peer_key(URL);
        inner
            .set(&key, bincode::serialize(&record(PeerState::Dead)).unwrap())
            .await
            .unwrap();
        let table = PeerTable::new(Arc::new(ReadOnlyKv(inner)));

        let conn = settle(&table, &key, &record(PeerState::Dead), Ok("session"))
            .await
            .unwrap();
        assert_eq!(conn, "session");
    }
}
