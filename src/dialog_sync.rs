//! Dialog state sync (C9, §4.9, §6).
//!
//! Publishes per-pair metadata to the shared store on every state transition
//! so an external observer (or another process, in a clustered deployment)
//! can enumerate active calls without reaching into this process's memory.
//! Writes are best-effort: a store outage must not fail the call it is
//! describing (§7 Dependency error kind — "best-effort writers degrade
//! silently, logging at WARN").

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::SharedKvStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairState {
    Establishing,
    EarlyMedia,
    Confirmed,
    Terminating,
    Terminated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairSnapshot {
    pub pair_id: String,
    pub a_leg_uri: String,
    pub b_leg_uri: String,
    pub username: String,
    pub state: PairState,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

pub struct DialogSync {
    store: Option<SharedKvStore>,
    namespace: String,
}

impl DialogSync {
    pub fn new(store: Option<SharedKvStore>, namespace: &str) -> Self {
        Self { store, namespace: namespace.to_string() }
    }

    fn pair_key(&self, pair_id: &str) -> String {
        format!("/{}/pairs/{}", self.namespace, pair_id)
    }

    /// Writes the current snapshot for a pair. Failures are logged and
    /// swallowed (§4.9: sync is observability, not a correctness dependency).
    pub async fn publish(&self, snapshot: &PairSnapshot) {
        let Some(store) = &self.store else { return };
        let value = match serde_json::to_vec(snapshot) {
            Ok(v) => v,
            Err(e) => {
                warn!("dialog_sync: failed to serialize snapshot for {}: {e}", snapshot.pair_id);
                return;
            }
        };
        if let Err(e) = store.put(&self.pair_key(&snapshot.pair_id), value).await {
            warn!("dialog_sync: failed to publish snapshot for {}: {e}", snapshot.pair_id);
        }
    }

    /// Removes the published snapshot once a pair has fully terminated.
    pub async fn retire(&self, pair_id: &str) {
        let Some(store) = &self.store else { return };
        if let Err(e) = store.delete(&self.pair_key(pair_id)).await {
            warn!("dialog_sync: failed to retire snapshot for {pair_id}: {e}");
        }
    }

    pub async fn list_active(&self) -> Vec<PairSnapshot> {
        let Some(store) = &self.store else { return Vec::new() };
        let prefix = format!("/{}/pairs/", self.namespace);
        match store.list_by_prefix(&prefix).await {
            Ok(entries) => entries
                .into_iter()
                .filter_map(|(_, value)| serde_json::from_slice(&value).ok())
                .collect(),
            Err(e) => {
                warn!("dialog_sync: failed to list active pairs: {e}");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn snapshot(pair_id: &str, state: PairState) -> PairSnapshot {
        let now = chrono::Utc::now();
        PairSnapshot {
            pair_id: pair_id.to_string(),
            a_leg_uri: "sip:a@x".to_string(),
            b_leg_uri: "sip:b@y".to_string(),
            username: "alice".to_string(),
            state,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn publish_then_list_round_trips() {
        let store = MemoryStore::new();
        let sync = DialogSync::new(Some(store), "ns");
        sync.publish(&snapshot("p1", PairState::Confirmed)).await;
        let active = sync.list_active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].pair_id, "p1");
    }

    #[tokio::test]
    async fn retire_removes_snapshot() {
        let store = MemoryStore::new();
        let sync = DialogSync::new(Some(store), "ns");
        sync.publish(&snapshot("p1", PairState::Confirmed)).await;
        sync.retire("p1").await;
        assert!(sync.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn no_store_configured_is_a_silent_no_op() {
        let sync = DialogSync::new(None, "ns");
        sync.publish(&snapshot("p1", PairState::Confirmed)).await;
        assert!(sync.list_active().await.is_empty());
    }
}
