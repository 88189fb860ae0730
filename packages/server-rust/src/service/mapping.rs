//! Request-facing facade over the engine and the peer resolver.

use std::sync::Arc;

use idmap_core::{Association, Direction};
use tracing::debug;

use crate::cluster::PeerResolver;
use crate::engine::{Engine, EngineStats};
use crate::storage::StoreError;

/// Where a full lookup found its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupSource {
    Hot,
    Peer,
    Store,
}

/// Entry point used by the HTTP handlers.
///
/// Cloning is cheap; both halves are shared.
#[derive(Clone)]
pub struct IdMappingService {
    engine: Arc<Engine>,
    peers: Option<Arc<PeerResolver>>,
}

impl IdMappingService {
    #[must_use]
    pub fn new(engine: Arc<Engine>, peers: Option<Arc<PeerResolver>>) -> Self {
        Self { engine, peers }
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    #[must_use]
    pub fn peers(&self) -> Option<&Arc<PeerResolver>> {
        self.peers.as_ref()
    }

    pub fn insert(&self, association: &Association) {
        self.engine.insert(&association.from_id, &association.to_id);
    }

    pub fn insert_batch(&self, associations: &[Association]) {
        self.engine.insert_batch(associations);
    }

    /// Hot-cache-only lookup; this is what peers call.
    #[must_use]
    pub fn lookup_from_mem(&self, direction: Direction, id: &str) -> Option<String> {
        match direction {
            Direction::Forward => self.engine.lookup_forward(id),
            Direction::Reverse => self.engine.lookup_reverse(id),
        }
    }

    /// Full lookup: hot cache, then peers, then storage.
    ///
    /// # Errors
    ///
    /// Returns the store's error when neither the hot cache nor any peer
    /// knows the id and the storage query fails.
    pub async fn resolve(
        &self,
        direction: Direction,
        id: &str,
    ) -> Result<Option<(String, LookupSource)>, StoreError> {
        if let Some(hit) = self.lookup_from_mem(direction, id) {
            return Ok(Some((hit, LookupSource::Hot)));
        }
        if let Some(peers) = &self.peers {
            if let Some(hit) = peers.resolve(direction, id).await {
                return Ok(Some((hit, LookupSource::Peer)));
            }
        }
        let stored = match direction {
            Direction::Forward => self.engine.store_lookup_forward(id).await?,
            Direction::Reverse => self.engine.store_lookup_reverse(id).await?,
        };
        if stored.is_none() {
            debug!(?direction, id, "id not found");
        }
        Ok(stored.map(|hit| (hit, LookupSource::Store)))
    }

    pub fn delete(&self, direction: Direction, id: &str) {
        match direction {
            Direction::Forward => self.engine.delete_forward(id),
            Direction::Reverse => self.engine.delete_reverse(id),
        }
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        self.engine.stats()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use idmap_core::{shard_of, TableKind, TableRef};

    use super::*;
    use crate::cluster::{PeerClient, PeerError, PeerInstance, StaticRegistry};
    use crate::engine::test_support::{harness, small_config};
    use crate::storage::{IdRow, MappingStore};

    struct MapClient(HashMap<String, String>);

    #[async_trait]
    impl PeerClient for MapClient {
        async fn query(
            &self,
            _peer: &PeerInstance,
            _direction: Direction,
            id: &str,
        ) -> Result<String, PeerError> {
            Ok(self.0.get(id).cloned().unwrap_or_default())
        }
    }

    async fn resolver(answers: &[(&str, &str)]) -> Arc<PeerResolver> {
        let client = MapClient(
            answers
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        );
        let resolver = PeerResolver::new(
            "idmap",
            Arc::new(StaticRegistry::new(vec![PeerInstance::new("peer", 1)])),
            Arc::new(client),
            None,
            40,
        );
        resolver.refresh().await.unwrap();
        Arc::new(resolver)
    }

    #[tokio::test]
    async fn hot_cache_answers_first() {
        let h = harness(small_config()).await;
        let service = IdMappingService::new(h.engine.clone(), Some(resolver(&[("u1", "peer-v")]).await));
        service.insert(&Association::new("u1", "v1"));
        assert_eq!(
            service.resolve(Direction::Forward, "u1").await.unwrap(),
            Some(("v1".to_string(), LookupSource::Hot))
        );
        assert_eq!(
            service.resolve(Direction::Reverse, "v1").await.unwrap(),
            Some(("u1".to_string(), LookupSource::Hot))
        );
    }

    #[tokio::test]
    async fn peers_answer_before_storage() {
        let h = harness(small_config()).await;
        let table = TableRef::new(TableKind::FromIndexed, shard_of("u9", 4));
        h.store
            .insert_batch(table, &[IdRow::new("u9", "stored")])
            .await
            .unwrap();
        let service = IdMappingService::new(h.engine.clone(), Some(resolver(&[("u9", "remote")]).await));
        assert_eq!(
            service.resolve(Direction::Forward, "u9").await.unwrap(),
            Some(("remote".to_string(), LookupSource::Peer))
        );
    }

    #[tokio::test]
    async fn storage_is_the_last_resort() {
        let h = harness(small_config()).await;
        let table = TableRef::new(TableKind::ToIndexed, shard_of("v7", 4));
        h.store
            .insert_batch(table, &[IdRow::new("u7", "v7")])
            .await
            .unwrap();
        let service = IdMappingService::new(h.engine.clone(), Some(resolver(&[]).await));
        assert_eq!(
            service.resolve(Direction::Reverse, "v7").await.unwrap(),
            Some(("u7".to_string(), LookupSource::Store))
        );
        assert_eq!(service.resolve(Direction::Reverse, "nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn mem_lookup_ignores_storage() {
        let h = harness(small_config()).await;
        let table = TableRef::new(TableKind::FromIndexed, shard_of("u3", 4));
        h.store
            .insert_batch(table, &[IdRow::new("u3", "v3")])
            .await
            .unwrap();
        let service = IdMappingService::new(h.engine.clone(), None);
        assert_eq!(service.lookup_from_mem(Direction::Forward, "u3"), None);
    }

    #[tokio::test]
    async fn delete_removes_from_hot_cache() {
        let h = harness(small_config()).await;
        let service = IdMappingService::new(h.engine.clone(), None);
        service.insert(&Association::new("u1", "v1"));
        service.delete(Direction::Forward, "u1");
        assert_eq!(service.lookup_from_mem(Direction::Forward, "u1"), None);
        assert_eq!(service.stats().delete_requests, 1);
    }
}
