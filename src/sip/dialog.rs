//! Dialog manager (C3, §3, §4.3).
//!
//! Dialogs are arena entries keyed by their (Call-ID, local-tag, remote-tag)
//! triple; they hold a pair-id, not a pointer to their owning B2BUA pair
//! (§9 "Cyclic references" design note).

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rsip::prelude::*;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl std::fmt::Display for DialogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}|{}", self.call_id, self.local_tag, self.remote_tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct Dialog {
    pub id: DialogId,
    pub pair_id: String,
    pub state: DialogState,
    pub local_uri: String,
    pub remote_uri: String,
    pub local_cseq: u32,
    pub remote_cseq: u32,
    pub route_set: Vec<String>,
    pub remote_contact: Option<String>,
    pub created_at: Instant,
    pub last_activity: Instant,
}

impl Dialog {
    pub fn new(id: DialogId, pair_id: String, local_uri: String, remote_uri: String) -> Self {
        let now = Instant::now();
        Self {
            id,
            pair_id,
            state: DialogState::Early,
            local_uri,
            remote_uri,
            local_cseq: 1,
            remote_cseq: 0,
            route_set: Vec::new(),
            remote_contact: None,
            created_at: now,
            last_activity: now,
        }
    }

    /// Derives the Route-Set from a dialog-establishing response's
    /// Record-Route headers: reversed for the UAC, forward for the UAS
    /// (§4.3 invariant c).
    pub fn set_route_set_from_record_route(&mut self, record_routes: Vec<String>, is_uac: bool) {
        self.route_set = record_routes;
        if is_uac {
            self.route_set.reverse();
        }
    }

    pub fn next_local_cseq(&mut self) -> u32 {
        self.local_cseq += 1;
        self.local_cseq
    }

    /// CSeq-ordered in-dialog request delivery (§5 ordering guarantees): an
    /// out-of-order in-dialog request must be rejected by the caller with
    /// 500 "Out of Order".
    pub fn accepts_remote_cseq(&self, cseq: u32) -> bool {
        cseq > self.remote_cseq
    }

    pub fn observe_remote_cseq(&mut self, cseq: u32) {
        self.remote_cseq = cseq;
        self.last_activity = Instant::now();
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Registers dialogs under their triple key and routes in-dialog requests.
pub struct DialogManager {
    dialogs: Arc<DashMap<DialogId, Dialog>>,
    /// Secondary index: pair-id -> dialog ids, so a pair's legs can be found
    /// and torn down together.
    by_pair: Arc<DashMap<String, Vec<DialogId>>>,
}

impl DialogManager {
    pub fn new() -> Self {
        Self { dialogs: Arc::new(DashMap::new()), by_pair: Arc::new(DashMap::new()) }
    }

    /// Registers a new dialog. Returns an error if the triple already exists
    /// (§4.3 invariant a: triples unique within a process).
    pub fn register(&self, dialog: Dialog) -> Result<()> {
        if self.dialogs.contains_key(&dialog.id) {
            return Err(Error::invalid_state(format!("duplicate dialog id {}", dialog.id)));
        }
        self.by_pair.entry(dialog.pair_id.clone()).or_default().push(dialog.id.clone());
        self.dialogs.insert(dialog.id.clone(), dialog);
        Ok(())
    }

    pub fn get(&self, id: &DialogId) -> Option<Dialog> {
        self.dialogs.get(id).map(|d| d.clone())
    }

    pub fn update<F: FnOnce(&mut Dialog)>(&self, id: &DialogId, f: F) -> Result<()> {
        let mut entry = self
            .dialogs
            .get_mut(id)
            .ok_or_else(|| Error::invalid_state(format!("unknown dialog {id}")))?;
        f(&mut entry);
        Ok(())
    }

    pub fn remove(&self, id: &DialogId) -> Option<Dialog> {
        let removed = self.dialogs.remove(id).map(|(_, d)| d);
        if let Some(d) = &removed {
            if let Some(mut ids) = self.by_pair.get_mut(&d.pair_id) {
                ids.retain(|existing| existing != id);
            }
        }
        removed
    }

    pub fn dialogs_for_pair(&self, pair_id: &str) -> Vec<Dialog> {
        self.by_pair
            .get(pair_id)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    /// §4.3 forked-2xx edge case: when a second 2xx with a different to-tag
    /// arrives for a pair that already has a confirmed dialog on that leg,
    /// the caller (C4) must BYE it; this just reports whether one already
    /// exists so C4 can make that call.
    pub fn has_confirmed_dialog_for_pair(&self, pair_id: &str) -> bool {
        self.dialogs_for_pair(pair_id).iter().any(|d| d.state == DialogState::Confirmed)
    }

    pub fn len(&self) -> usize {
        self.dialogs.len()
    }

    /// Pairs whose last activity predates `timeout` while still Early —
    /// candidates for the §4.4 force-termination sweep.
    pub fn early_pairs_older_than(&self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        self.dialogs
            .iter()
            .filter(|e| e.state == DialogState::Early && now.duration_since(e.last_activity) > timeout)
            .map(|e| e.pair_id.clone())
            .collect()
    }
}

impl Default for DialogManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pair: &str, tag: &str) -> Dialog {
        Dialog::new(
            DialogId { call_id: "c1".into(), local_tag: "l1".into(), remote_tag: tag.into() },
            pair.into(),
            "sip:a@b".into(),
            "sip:b@c".into(),
        )
    }

    #[test]
    fn register_then_deregister_is_a_no_op_on_table_shape() {
        let mgr = DialogManager::new();
        let before = mgr.len();
        let d = sample("pair-1", "r1");
        let id = d.id.clone();
        mgr.register(d).unwrap();
        mgr.remove(&id);
        assert_eq!(mgr.len(), before);
    }

    #[test]
    fn duplicate_triple_is_rejected() {
        let mgr = DialogManager::new();
        mgr.register(sample("pair-1", "r1")).unwrap();
        assert!(mgr.register(sample("pair-1", "r1")).is_err());
    }

    #[test]
    fn route_set_reversed_for_uac_forward_for_uas() {
        let mut d = sample("pair-1", "r1");
        d.set_route_set_from_record_route(vec!["a".into(), "b".into()], true);
        assert_eq!(d.route_set, vec!["b".to_string(), "a".to_string()]);

        let mut d2 = sample("pair-2", "r2");
        d2.set_route_set_from_record_route(vec!["a".into(), "b".into()], false);
        assert_eq!(d2.route_set, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn out_of_order_cseq_is_rejected() {
        let mut d = sample("pair-1", "r1");
        d.observe_remote_cseq(5);
        assert!(!d.accepts_remote_cseq(5));
        assert!(!d.accepts_remote_cseq(4));
        assert!(d.accepts_remote_cseq(6));
    }

    #[test]
    fn dialogs_for_pair_groups_both_legs() {
        let mgr = DialogManager::new();
        mgr.register(sample("pair-1", "a")).unwrap();
        let mut other = sample("pair-1", "b");
        other.id.local_tag = "l2".into();
        mgr.register(other).unwrap();
        assert_eq!(mgr.dialogs_for_pair("pair-1").len(), 2);
    }
}
