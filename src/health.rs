//! Health surface contract (§6, SPEC_FULL.md §13).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: ComponentStatus,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateHealth {
    pub status: ComponentStatus,
    pub components: Vec<ComponentHealth>,
}

/// `/health`, `/health/ready`, `/health/live`, `/health/component` (§6).
#[async_trait]
pub trait HealthSurface: Send + Sync {
    async fn health(&self) -> AggregateHealth;
    /// Ready to accept new SIP traffic (listeners bound, config valid).
    async fn ready(&self) -> bool;
    /// Process is alive and its task supervisor hasn't declared it wedged.
    async fn live(&self) -> bool;
    async fn component(&self, name: &str) -> Option<ComponentHealth>;
}

pub fn worst_of(components: &[ComponentHealth]) -> ComponentStatus {
    if components.iter().any(|c| c.status == ComponentStatus::Unhealthy) {
        ComponentStatus::Unhealthy
    } else if components.iter().any(|c| c.status == ComponentStatus::Degraded) {
        ComponentStatus::Degraded
    } else {
        ComponentStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worst_of_picks_unhealthy_over_degraded() {
        let components = vec![
            ComponentHealth { name: "store".into(), status: ComponentStatus::Degraded, detail: None },
            ComponentHealth { name: "relay".into(), status: ComponentStatus::Unhealthy, detail: None },
        ];
        assert_eq!(worst_of(&components), ComponentStatus::Unhealthy);
    }

    #[test]
    fn worst_of_is_healthy_when_all_healthy() {
        let components = vec![ComponentHealth { name: "store".into(), status: ComponentStatus::Healthy, detail: None }];
        assert_eq!(worst_of(&components), ComponentStatus::Healthy);
    }
}
