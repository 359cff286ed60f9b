//! Management RPC interface contract (§6, SPEC_FULL.md §13).
//!
//! §1 scopes the management RPC surface itself ("thin adapters") out of the
//! core's engineering weight; what belongs here is the contract the core
//! would expose to that adapter. No implementation is bound to live engine
//! state and nothing serves it over the wire in this crate. A production
//! deployment wires `ManagementApi` behind whatever RPC transport it prefers
//! (the lineage used a bespoke framing over TCP in `interfaces/`; nothing
//! about this trait presumes it) and implements it against the running
//! core.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::routing::rule::RoutingRule;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub node_id: String,
    pub active_pairs: usize,
    pub active_transactions: usize,
    pub routing_rule_count: usize,
    pub store_connected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub active_pairs: u64,
    pub sessions_admitted_total: u64,
    pub sessions_denied_total: u64,
    pub routing_evaluations_total: u64,
    pub media_relay_healthy_instances: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSummary {
    pub pair_id: String,
    pub username: String,
    pub a_leg_uri: String,
    pub b_leg_uri: String,
    pub state: String,
}

/// The full RPC surface §6 names: rule CRUD, status/metrics, call control,
/// ad-hoc header patching, and config lifecycle. Every method other than
/// a health check requires the caller to already have passed `AuthGuard`.
#[async_trait]
pub trait ManagementApi: Send + Sync {
    async fn add_routing_rule(&self, rule: RoutingRule) -> Result<()>;
    async fn get_routing_rule(&self, id: &str) -> Result<Option<RoutingRule>>;
    async fn update_routing_rule(&self, rule: RoutingRule) -> Result<()>;
    async fn delete_routing_rule(&self, id: &str) -> Result<()>;
    async fn list_routing_rules(&self) -> Result<Vec<RoutingRule>>;

    async fn get_system_status(&self) -> Result<SystemStatus>;
    async fn get_metrics(&self) -> Result<MetricsSnapshot>;

    /// Places an outbound call originated by the management plane itself
    /// (as opposed to an inbound SIP INVITE) — returns the new pair id.
    async fn initiate_call(&self, destination_uri: &str, from_user: &str) -> Result<String>;
    async fn terminate_call(&self, pair_id: &str) -> Result<()>;
    async fn get_active_calls(&self) -> Result<Vec<CallSummary>>;
    async fn get_call_details(&self, pair_id: &str) -> Result<Option<CallSummary>>;

    async fn add_sip_header(&self, rule_id: &str, name: &str, value: &str) -> Result<()>;
    async fn remove_sip_header(&self, rule_id: &str, name: &str) -> Result<()>;
    async fn replace_sip_header(&self, rule_id: &str, name: &str, value: &str) -> Result<()>;

    async fn get_global_config(&self) -> Result<serde_json::Value>;
    async fn update_global_config(&self, patch: serde_json::Value) -> Result<()>;
    async fn reload_config(&self) -> Result<()>;
}

/// Bearer-token authentication (§6: "required for all calls except a
/// designated health-check method").
pub struct AuthGuard {
    expected_token: String,
}

impl AuthGuard {
    pub fn new(expected_token: String) -> Self {
        Self { expected_token }
    }

    pub fn authorize(&self, presented: &str) -> Result<()> {
        if presented == self.expected_token {
            Ok(())
        } else {
            Err(Error::protocol("invalid bearer token"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_guard_accepts_matching_token_only() {
        let guard = AuthGuard::new("secret".to_string());
        assert!(guard.authorize("secret").is_ok());
        assert!(guard.authorize("wrong").is_err());
    }
}
