//! Routing engine (C5, §4.5) and rule store (C8, §4.8).
//!
//! This replaces this crate's lineage's `services/sip_router.rs`, which was
//! an explicit stub ("placeholder implementation... all methods return stub
//! implementations") — the rule model (`RoutingRule`) and its evaluation
//! here are a full rewrite grounded directly in §4.5 and §4.8, keeping the
//! lineage's ambient shape (DashMap-backed registries, an mpsc event
//! channel, `RoutingEvent`s mirroring the lineage's own event enum).

pub mod rule;

use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::{info, warn};

use rule::{rule_order, RequestContext, RoutingRule, RuleAction};

use crate::store::{KvStore, WatchEvent};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub enum RoutingEvent {
    RuleAdded { id: String },
    RuleRemoved { id: String },
    IndexReloaded { rule_count: usize },
    StoreDisconnected,
    StoreReconnected,
}

/// A read-mostly, copy-on-write sorted index: writers build a whole new
/// `Vec` and swap the `Arc`; readers clone the `Arc` once and evaluate
/// without holding any lock (§4.5 hot-reload, §5 "sorted rule index... read
/// mostly; writers swap the reference atomically").
struct SortedIndex {
    rules: RwLock<Arc<Vec<RoutingRule>>>,
}

impl SortedIndex {
    fn new() -> Self {
        Self { rules: RwLock::new(Arc::new(Vec::new())) }
    }

    fn snapshot(&self) -> Arc<Vec<RoutingRule>> {
        self.rules.read().unwrap().clone()
    }

    fn replace_all(&self, mut rules: Vec<RoutingRule>) {
        rules.sort_by(rule_order);
        *self.rules.write().unwrap() = Arc::new(rules);
    }

    fn upsert(&self, rule: RoutingRule) {
        let mut guard = self.rules.write().unwrap();
        let mut rules: Vec<RoutingRule> = guard.iter().filter(|r| r.id != rule.id).cloned().collect();
        rules.push(rule);
        rules.sort_by(rule_order);
        *guard = Arc::new(rules);
    }

    fn remove(&self, id: &str) {
        let mut guard = self.rules.write().unwrap();
        let rules: Vec<RoutingRule> = guard.iter().filter(|r| r.id != id).cloned().collect();
        *guard = Arc::new(rules);
    }
}

#[derive(Debug, Clone)]
pub enum RoutingDecision {
    NextHop(rule::NextHopAction),
    Reject { status_code: u16, reason: String },
    /// No matching rule and no default (§4.5, §7 Routing error kind).
    NoMatch,
}

pub struct RoutingEngine {
    index: Arc<SortedIndex>,
    store: Option<crate::store::SharedKvStore>,
    rule_prefix: String,
    event_tx: mpsc::UnboundedSender<RoutingEvent>,
}

impl RoutingEngine {
    pub fn new(store: Option<crate::store::SharedKvStore>, namespace: &str) -> (Self, mpsc::UnboundedReceiver<RoutingEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                index: Arc::new(SortedIndex::new()),
                store,
                rule_prefix: format!("/{namespace}/routing-rules/"),
                event_tx,
            },
            event_rx,
        )
    }

    /// Bulk-loads the prefix on startup, then applies watch events
    /// incrementally for the lifetime of the process (§4.8).
    pub async fn start(&self) -> Result<()> {
        let Some(store) = &self.store else {
            info!("routing engine running without a shared store; rules must be added locally");
            return Ok(());
        };

        let listed = store.list_by_prefix(&self.rule_prefix).await?;
        let mut rules = Vec::with_capacity(listed.len());
        for (_key, value) in listed {
            match serde_json::from_slice::<RoutingRule>(&value) {
                Ok(rule) => rules.push(rule),
                Err(e) => warn!("skipping unparsable rule in store: {e}"),
            }
        }
        let count = rules.len();
        self.index.replace_all(rules);
        let _ = self.event_tx.send(RoutingEvent::IndexReloaded { rule_count: count });

        let mut watch_rx = store.watch_by_prefix(&self.rule_prefix).await?;
        let index = self.index.clone();
        let event_tx = self.event_tx.clone();
        let prefix = self.rule_prefix.clone();
        tokio::spawn(async move {
            while let Some(event) = watch_rx.recv().await {
                match event {
                    WatchEvent::Put { key, value } => match serde_json::from_slice::<RoutingRule>(&value) {
                        Ok(rule) => {
                            index.upsert(rule.clone());
                            let _ = event_tx.send(RoutingEvent::RuleAdded { id: rule.id });
                        }
                        Err(e) => warn!("skipping unparsable rule update for {key}: {e}"),
                    },
                    WatchEvent::Delete { key } => {
                        let id = key.strip_prefix(&prefix).unwrap_or(&key).to_string();
                        index.remove(&id);
                        let _ = event_tx.send(RoutingEvent::RuleRemoved { id });
                    }
                }
            }
        });
        Ok(())
    }

    pub async fn add_rule(&self, rule: RoutingRule) -> Result<()> {
        rule.validate()?;
        if let Some(store) = &self.store {
            let value = serde_json::to_vec(&rule)?;
            store.put(&format!("{}{}", self.rule_prefix, rule.id), value).await?;
        } else {
            self.index.upsert(rule);
        }
        Ok(())
    }

    pub async fn remove_rule(&self, id: &str) -> Result<()> {
        if let Some(store) = &self.store {
            store.delete(&format!("{}{}", self.rule_prefix, id)).await?;
        } else {
            self.index.remove(id);
        }
        Ok(())
    }

    pub fn list_rules(&self) -> Vec<RoutingRule> {
        self.index.snapshot().as_ref().clone()
    }

    /// Evaluates the current (captured-by-value, copy-on-write) rule index
    /// against a request context, in O(R) with no backtracking across rules
    /// (§4.5 determinism guarantees).
    pub fn evaluate(&self, ctx: &RequestContext) -> RoutingDecision {
        let rules = self.index.snapshot();
        for rule in rules.iter() {
            if rule.matches(ctx) {
                return match &rule.action {
                    RuleAction::NextHop(next_hop) => RoutingDecision::NextHop(next_hop.clone()),
                    RuleAction::Reject(reject) => {
                        RoutingDecision::Reject { status_code: reject.status_code, reason: reject.reason.clone() }
                    }
                };
            }
        }
        RoutingDecision::NoMatch
    }
}

#[cfg(test)]
mod tests {
    use super::rule::*;
    use super::*;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};

    fn ctx(uri: &str, ip: [u8; 4]) -> RequestContext<'static> {
        RequestContext {
            request_uri: Box::leak(uri.to_string().into_boxed_str()),
            method: "INVITE",
            source_ip: IpAddr::V4(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])),
            headers: Box::leak(Box::new(HashMap::new())),
            timestamp: chrono::Utc::now(),
        }
    }

    fn next_hop_rule(id: &str, priority: i64, uri_pattern: &str, destination: &str) -> RoutingRule {
        RoutingRule {
            id: id.to_string(),
            priority,
            enabled: true,
            conditions: RuleConditions { uri_pattern: Some(uri_pattern.to_string()), uri_use_regex: true, ..Default::default() },
            action: RuleAction::NextHop(NextHopAction {
                destination_uri: destination.to_string(),
                outbound_proxy: None,
                transport_override: None,
                request_timeout_override_secs: None,
                headers: HeaderMutations::default(),
                media_relay_flags: String::new(),
            }),
        }
    }

    #[tokio::test]
    async fn s1_basic_call_through_one_rule() {
        let (engine, _rx) = RoutingEngine::new(None, "ns");
        engine
            .add_rule(next_hop_rule("r1", 100, r"^sip:\+?1[2-9][0-9]{9}@", "sip:gw1:5060"))
            .await
            .unwrap();
        let decision = engine.evaluate(&ctx("sip:+15551234567@proxy", [10, 0, 0, 5]));
        match decision {
            RoutingDecision::NextHop(a) => assert_eq!(a.destination_uri, "sip:gw1:5060"),
            other => panic!("expected next-hop, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn s6_emergency_reject_precedes_lower_priority_rules() {
        let (engine, _rx) = RoutingEngine::new(None, "ns");
        engine.add_rule(next_hop_rule("low", 10, ".*", "sip:gw1:5060")).await.unwrap();
        let mut sec = RoutingRule {
            id: "sec".to_string(),
            priority: 1500,
            enabled: true,
            conditions: RuleConditions { source_cidrs: Some(vec!["192.0.2.0/24".parse().unwrap()]), ..Default::default() },
            action: RuleAction::Reject(RejectAction { status_code: 403, reason: "Forbidden".to_string() }),
        };
        sec.validate().unwrap();
        engine.add_rule(sec).await.unwrap();
        let decision = engine.evaluate(&ctx("sip:anyone@x", [192, 0, 2, 10]));
        match decision {
            RoutingDecision::Reject { status_code, .. } => assert_eq!(status_code, 403),
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_match_result_when_nothing_fits() {
        let (engine, _rx) = RoutingEngine::new(None, "ns");
        let decision = engine.evaluate(&ctx("sip:nobody@x", [1, 1, 1, 1]));
        assert!(matches!(decision, RoutingDecision::NoMatch));
    }

    #[tokio::test]
    async fn evaluation_is_deterministic() {
        let (engine, _rx) = RoutingEngine::new(None, "ns");
        engine.add_rule(next_hop_rule("r1", 100, ".*", "sip:gw1:5060")).await.unwrap();
        engine.add_rule(next_hop_rule("r2", 50, ".*", "sip:gw2:5060")).await.unwrap();
        let c = ctx("sip:anyone@x", [1, 1, 1, 1]);
        let first = format!("{:?}", engine.evaluate(&c));
        let second = format!("{:?}", engine.evaluate(&c));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn store_backed_hot_reload_swaps_index() {
        let store = crate::store::memory::MemoryStore::new();
        let (engine, _rx) = RoutingEngine::new(Some(store.clone()), "ns");
        engine.start().await.unwrap();
        engine.add_rule(next_hop_rule("r1", 100, ".*", "sip:gw1:5060")).await.unwrap();
        // allow the watch task to process the put
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let decision = engine.evaluate(&ctx("sip:anyone@x", [1, 1, 1, 1]));
        match decision {
            RoutingDecision::NextHop(a) => assert_eq!(a.destination_uri, "sip:gw1:5060"),
            other => panic!("expected next-hop, got {other:?}"),
        }
    }
}
