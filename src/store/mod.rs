//! Shared key-value store abstraction (§6).
//!
//! This generalizes the cluster shared-state pattern this crate's lineage
//! expresses in `services/clustering.rs` (`SharedStateManager`,
//! `ConsensusManager` traits with pluggable Redis/Etcd/Consul/Raft
//! placeholders) into the single get/put/delete/list-by-prefix/watch-by-prefix
//! interface the core actually needs (§6): C7 (session/user-limit records),
//! C8 (routing rules), and C9 (dialog-pair metadata) are all just callers of
//! this trait.

pub mod memory;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Result;

/// A put or delete observed on a watched prefix.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// Cluster-shared key-value store. Implementations: in-process memory (the
/// only backend this crate ships, since no external store is reachable in
/// this environment); the `StoreBackend` config enum documents the pluggable
/// backends a deployment would route to (Redis/Etcd/Consul), matching the
/// `SharedStateBackend` shape this crate's lineage already had in
/// `ClusteringConfig`.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
    /// Put with an expiry; implementations without native TTL support must
    /// still honor it (the in-memory backend does, via a reaper).
    async fn put_with_ttl(&self, key: &str, value: Vec<u8>, ttl: std::time::Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
    /// Subscribe to put/delete events under a prefix. Returns a receiver fed
    /// by a background task for the lifetime of the store handle.
    async fn watch_by_prefix(&self, prefix: &str) -> Result<mpsc::UnboundedReceiver<WatchEvent>>;
    /// Whether the store is currently reachable (§7 Dependency error kind).
    fn is_connected(&self) -> bool;
}

pub type SharedKvStore = std::sync::Arc<dyn KvStore>;
