//! In-memory `KvStore` backend.
//!
//! Stands in for the external Redis/Etcd/Consul-backed store this crate is
//! designed against (§6); this backend implements the same interface so the
//! rest of the core — C7, C8, C9 — is unaware it isn't clustered. Tests and
//! the default configuration both run against this.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::{KvStore, WatchEvent};
use crate::Result;

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

pub struct MemoryStore {
    data: Arc<DashMap<String, Entry>>,
    watchers: Arc<DashMap<String, Vec<mpsc::UnboundedSender<WatchEvent>>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        let store = Arc::new(Self {
            data: Arc::new(DashMap::new()),
            watchers: Arc::new(DashMap::new()),
        });
        store.spawn_reaper();
        store
    }

    fn spawn_reaper(self: &Arc<Self>) {
        let data = self.data.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                let now = Instant::now();
                data.retain(|_, entry| entry.expires_at.map(|e| e > now).unwrap_or(true));
            }
        });
    }

    fn notify(&self, key: &str, event_for: impl Fn() -> WatchEvent) {
        for mut watcher in self.watchers.iter_mut() {
            if key.starts_with(watcher.key().as_str()) {
                watcher.retain(|tx| tx.send(event_for()).is_ok());
            }
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        Ok(self.data.get(key).and_then(|e| {
            if e.expires_at.map(|exp| exp > now).unwrap_or(true) {
                Some(e.value.clone())
            } else {
                None
            }
        }))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.data.insert(
            key.to_string(),
            Entry { value: value.clone(), expires_at: None },
        );
        self.notify(key, || WatchEvent::Put { key: key.to_string(), value: value.clone() });
        Ok(())
    }

    async fn put_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.data.insert(
            key.to_string(),
            Entry { value: value.clone(), expires_at: Some(Instant::now() + ttl) },
        );
        self.notify(key, || WatchEvent::Put { key: key.to_string(), value: value.clone() });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.remove(key);
        self.notify(key, || WatchEvent::Delete { key: key.to_string() });
        Ok(())
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let now = Instant::now();
        Ok(self
            .data
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .filter(|e| e.value().expires_at.map(|exp| exp > now).unwrap_or(true))
            .map(|e| (e.key().clone(), e.value().value.clone()))
            .collect())
    }

    async fn watch_by_prefix(&self, prefix: &str) -> Result<mpsc::UnboundedReceiver<WatchEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.entry(prefix.to_string()).or_default().push(tx);
        Ok(rx)
    }

    fn is_connected(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let store = MemoryStore::new();
        store.put("k", b"v".to_vec()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn list_by_prefix_filters() {
        let store = MemoryStore::new();
        store.put("a/1", b"x".to_vec()).await.unwrap();
        store.put("a/2", b"y".to_vec()).await.unwrap();
        store.put("b/1", b"z".to_vec()).await.unwrap();
        let listed = store.list_by_prefix("a/").await.unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn watch_receives_put_and_delete() {
        let store = MemoryStore::new();
        let mut rx = store.watch_by_prefix("a/").await.unwrap();
        store.put("a/1", b"x".to_vec()).await.unwrap();
        store.delete("a/1").await.unwrap();
        match rx.recv().await.unwrap() {
            WatchEvent::Put { key, .. } => assert_eq!(key, "a/1"),
            _ => panic!("expected put"),
        }
        match rx.recv().await.unwrap() {
            WatchEvent::Delete { key } => assert_eq!(key, "a/1"),
            _ => panic!("expected delete"),
        }
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryStore::new();
        store.put("k", b"v".to_vec()).await.unwrap();
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
