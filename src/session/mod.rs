//! Session tracker (C7, §4.7).
//!
//! Tracks concurrent sessions per user against a configurable cap, backed by
//! the shared [`KvStore`] so admission state is visible cluster-wide. This
//! replaces this crate's lineage's in-process `services/clustering.rs`
//! session bookkeeping with a store-backed record keyed the way §6 enumerates
//! (`/<namespace>/sessions/<id>`, `/<namespace>/users/<user>/sessions`).

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{AdmissionAction, SessionTrackerConfig};
use crate::store::SharedKvStore;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub username: String,
    pub call_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct UserSessionSet {
    session_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionResult {
    Admitted,
    /// Terminate-oldest admitted the new session by evicting this one.
    AdmittedByEvicting { session_id: String },
    Denied,
}

pub struct SessionTracker {
    store: SharedKvStore,
    namespace: String,
    default_cap: u32,
    action: AdmissionAction,
    ttl: Duration,
}

impl SessionTracker {
    pub fn new(store: SharedKvStore, namespace: &str, config: &SessionTrackerConfig) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
            default_cap: config.default_cap,
            action: config.action.clone(),
            ttl: Duration::from_secs(config.session_ttl_secs),
        }
    }

    fn session_key(&self, session_id: &str) -> String {
        format!("/{}/sessions/{}", self.namespace, session_id)
    }

    fn user_key(&self, username: &str) -> String {
        format!("/{}/users/{}/sessions", self.namespace, username)
    }

    fn limit_key(&self, username: &str) -> String {
        format!("/{}/users/{}/limit", self.namespace, username)
    }

    async fn cap_for(&self, username: &str) -> u32 {
        match self.store.get(&self.limit_key(username)).await {
            Ok(Some(bytes)) => std::str::from_utf8(&bytes).ok().and_then(|s| s.parse().ok()).unwrap_or(self.default_cap),
            _ => self.default_cap,
        }
    }

    async fn user_sessions(&self, username: &str) -> Vec<String> {
        match self.store.get(&self.user_key(username)).await {
            Ok(Some(bytes)) => serde_json::from_slice::<UserSessionSet>(&bytes).map(|s| s.session_ids).unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    async fn write_user_sessions(&self, username: &str, ids: Vec<String>) -> Result<()> {
        let value = serde_json::to_vec(&UserSessionSet { session_ids: ids })?;
        self.store.put(&self.user_key(username), value).await
    }

    /// Admits a new session for `username`, applying the configured cap and
    /// the configured over-cap action (§4.7: reject new, or terminate the
    /// oldest existing session to make room). Returns which session id (if
    /// any) the caller must now tear down.
    pub async fn admit(&self, session_id: &str, username: &str, call_id: &str) -> Result<AdmissionResult> {
        let cap = self.cap_for(username).await;
        let mut existing = self.user_sessions(username).await;
        existing.retain(|id| id != session_id);

        let mut evicted = None;
        if existing.len() as u32 >= cap {
            match self.action {
                AdmissionAction::Reject => return Ok(AdmissionResult::Denied),
                AdmissionAction::TerminateOldest => {
                    if let Some(oldest) = existing.first().cloned() {
                        existing.retain(|id| id != &oldest);
                        self.store.delete(&self.session_key(&oldest)).await.ok();
                        evicted = Some(oldest);
                    }
                }
            }
        }

        existing.push(session_id.to_string());
        self.write_user_sessions(username, existing).await?;

        let record = SessionRecord {
            session_id: session_id.to_string(),
            username: username.to_string(),
            call_id: call_id.to_string(),
            created_at: chrono::Utc::now(),
        };
        let value = serde_json::to_vec(&record)?;
        self.store.put_with_ttl(&self.session_key(session_id), value, self.ttl).await?;

        Ok(match evicted {
            Some(session_id) => AdmissionResult::AdmittedByEvicting { session_id },
            None => AdmissionResult::Admitted,
        })
    }

    /// Removes a session on pair termination (normal BYE/CANCEL completion,
    /// not just TTL expiry — §4.7 "released promptly on pair teardown").
    pub async fn release(&self, session_id: &str, username: &str) -> Result<()> {
        self.store.delete(&self.session_key(session_id)).await?;
        let mut existing: HashSet<String> = self.user_sessions(username).await.into_iter().collect();
        existing.remove(session_id);
        self.write_user_sessions(username, existing.into_iter().collect()).await
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        match self.store.get(&self.session_key(session_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Best-effort sweep reconciling each user's session set against records
    /// that have already TTL-expired out of the store, dropping orphaned ids
    /// left behind by a crash between record-write and user-set-write.
    pub async fn sweep_orphans(&self, usernames: &[String]) {
        for username in usernames {
            let ids = self.user_sessions(username).await;
            let mut live = Vec::with_capacity(ids.len());
            for id in ids {
                match self.store.get(&self.session_key(&id)).await {
                    Ok(Some(_)) => live.push(id),
                    Ok(None) => {}
                    Err(e) => {
                        warn!("sweep_orphans: store lookup failed for {id}: {e}");
                        live.push(id);
                    }
                }
            }
            if let Err(e) = self.write_user_sessions(username, live).await {
                warn!("sweep_orphans: failed to rewrite session set for {username}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn config(cap: u32, action: AdmissionAction) -> SessionTrackerConfig {
        SessionTrackerConfig { default_cap: cap, action, session_ttl_secs: 3600, cleanup_sweep_interval_secs: 300 }
    }

    #[tokio::test]
    async fn admits_under_cap() {
        let tracker = SessionTracker::new(MemoryStore::new(), "ns", &config(2, AdmissionAction::Reject));
        assert_eq!(tracker.admit("s1", "alice", "call-1").await.unwrap(), AdmissionResult::Admitted);
        assert_eq!(tracker.admit("s2", "alice", "call-2").await.unwrap(), AdmissionResult::Admitted);
    }

    #[tokio::test]
    async fn rejects_over_cap_by_default() {
        let tracker = SessionTracker::new(MemoryStore::new(), "ns", &config(1, AdmissionAction::Reject));
        tracker.admit("s1", "alice", "call-1").await.unwrap();
        assert_eq!(tracker.admit("s2", "alice", "call-2").await.unwrap(), AdmissionResult::Denied);
    }

    #[tokio::test]
    async fn terminate_oldest_evicts_and_admits() {
        let tracker = SessionTracker::new(MemoryStore::new(), "ns", &config(1, AdmissionAction::TerminateOldest));
        tracker.admit("s1", "alice", "call-1").await.unwrap();
        let result = tracker.admit("s2", "alice", "call-2").await.unwrap();
        assert_eq!(result, AdmissionResult::AdmittedByEvicting { session_id: "s1".to_string() });
        assert!(tracker.get("s1").await.unwrap().is_none());
        assert!(tracker.get("s2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn release_frees_capacity() {
        let tracker = SessionTracker::new(MemoryStore::new(), "ns", &config(1, AdmissionAction::Reject));
        tracker.admit("s1", "alice", "call-1").await.unwrap();
        tracker.release("s1", "alice").await.unwrap();
        assert_eq!(tracker.admit("s2", "alice", "call-2").await.unwrap(), AdmissionResult::Admitted);
    }

    #[tokio::test]
    async fn per_user_limit_override_takes_effect() {
        let store = MemoryStore::new();
        let tracker = SessionTracker::new(store.clone(), "ns", &config(10, AdmissionAction::Reject));
        store.put("/ns/users/bob/limit", b"1".to_vec()).await.unwrap();
        tracker.admit("s1", "bob", "call-1").await.unwrap();
        assert_eq!(tracker.admit("s2", "bob", "call-2").await.unwrap(), AdmissionResult::Denied);
    }
}
