//! Media-relay control-plane client (C6, §4.6).
//!
//! This replaces this crate's lineage's `services/media_relay.rs`, which did
//! in-process RTP packet forwarding, jitter buffering, and transcoding — all
//! explicitly out of scope here (§1 Non-goals: "no in-process media
//! processing... the relay daemon owns media"). What survives from the
//! lineage is the ambient shape: a DashMap-backed instance registry, an
//! mpsc event channel, and a health loop with consecutive-failure counting
//! much like the lineage's `call_monitor_loop`/`media_monitor_loop`. The
//! actual behavior is rewritten as a bencoded request/response UDP client.

pub mod bencode;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::warn;

use bencode::{decode, dict, encode, BValue};

use crate::config::MediaRelayConfig;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub enum MediaRelayEvent {
    InstanceUnhealthy { id: String },
    InstanceHealthy { id: String },
    RequestFailed { command: String, reason: String },
}

struct RelayInstance {
    id: String,
    address: SocketAddr,
    weight: u32,
    enabled: bool,
    consecutive_failures: AtomicU32,
    healthy: std::sync::atomic::AtomicBool,
}

pub struct MediaRelayClient {
    instances: Vec<Arc<RelayInstance>>,
    rr_cursor: AtomicUsize,
    request_timeout: Duration,
    unhealthy_after: u32,
    event_tx: mpsc::UnboundedSender<MediaRelayEvent>,
}

impl MediaRelayClient {
    pub fn new(config: &MediaRelayConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<MediaRelayEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let instances = config
            .instances
            .iter()
            .map(|i| {
                Arc::new(RelayInstance {
                    id: i.id.clone(),
                    address: i.address,
                    weight: i.weight.max(1),
                    enabled: i.enabled,
                    consecutive_failures: AtomicU32::new(0),
                    healthy: std::sync::atomic::AtomicBool::new(true),
                })
            })
            .collect();
        (
            Arc::new(Self {
                instances,
                rr_cursor: AtomicUsize::new(0),
                request_timeout: Duration::from_secs(config.request_timeout_secs),
                unhealthy_after: config.unhealthy_after_failures,
                event_tx,
            }),
            event_rx,
        )
    }

    /// Spawns the background health-ping loop (§4.6: every 30s by default).
    pub fn spawn_health_loop(self: &Arc<Self>, interval: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for instance in &this.instances {
                    if !instance.enabled {
                        continue;
                    }
                    let ok = this.ping(instance).await;
                    this.record_probe_result(instance, ok);
                }
            }
        });
    }

    async fn ping(&self, instance: &RelayInstance) -> bool {
        let request = dict(vec![("command", BValue::str("ping"))]);
        match self.send_request(instance.address, &request).await {
            Ok(response) => response.get("result").and_then(|r| r.as_str()) == Some("ok"),
            Err(_) => false,
        }
    }

    fn record_probe_result(&self, instance: &RelayInstance, ok: bool) {
        if ok {
            let was_unhealthy = !instance.healthy.load(Ordering::SeqCst);
            instance.consecutive_failures.store(0, Ordering::SeqCst);
            instance.healthy.store(true, Ordering::SeqCst);
            if was_unhealthy {
                let _ = self.event_tx.send(MediaRelayEvent::InstanceHealthy { id: instance.id.clone() });
            }
        } else {
            let failures = instance.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            if failures >= self.unhealthy_after && instance.healthy.swap(false, Ordering::SeqCst) {
                let _ = self.event_tx.send(MediaRelayEvent::InstanceUnhealthy { id: instance.id.clone() });
            }
        }
    }

    /// Weighted round-robin across the currently enabled+healthy set
    /// (§3, §4.6). Returns `None` ("no healthy relay") if the set is empty.
    fn select_instance(&self) -> Option<Arc<RelayInstance>> {
        let healthy: Vec<&Arc<RelayInstance>> = self
            .instances
            .iter()
            .filter(|i| i.enabled && i.healthy.load(Ordering::SeqCst))
            .collect();
        if healthy.is_empty() {
            return None;
        }
        let total_weight: u32 = healthy.iter().map(|i| i.weight).sum();
        let cursor = self.rr_cursor.fetch_add(1, Ordering::SeqCst) as u32 % total_weight.max(1);
        let mut acc = 0;
        for instance in &healthy {
            acc += instance.weight;
            if cursor < acc {
                return Some((*instance).clone());
            }
        }
        healthy.last().map(|i| (*i).clone())
    }

    /// One request/response round trip: fresh cookie, fresh ephemeral
    /// socket, bounded wait (§4.6, §9 "fresh datagram sockets for health
    /// checks" — applied to every request, not just pings, since the same
    /// cluster-networking pathology applies to any long-lived UDP socket).
    async fn send_request(&self, destination: SocketAddr, body: &BValue) -> Result<BValue> {
        let cookie: String = {
            let mut rng = rand::thread_rng();
            (0..16).map(|_| rng.gen_range(b'a'..=b'z') as char).collect()
        };
        let mut framed = Vec::new();
        framed.extend_from_slice(cookie.as_bytes());
        framed.push(b' ');
        framed.extend_from_slice(&encode(body));

        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(Error::Io)?;
        socket.send_to(&framed, destination).await.map_err(Error::Io)?;

        let mut buf = vec![0u8; 65_507];
        let recv = timeout(self.request_timeout, socket.recv_from(&mut buf)).await;
        let (len, _peer) = match recv {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(Error::Transport(e.to_string())),
            Err(_) => return Err(Error::timeout("media-relay request timed out")),
        };

        let received = &buf[..len];
        let space = received
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| Error::protocol("media-relay response missing cookie"))?;
        let received_cookie = std::str::from_utf8(&received[..space]).unwrap_or_default();
        if received_cookie != cookie {
            return Err(Error::protocol("media-relay response cookie mismatch"));
        }
        decode(&received[space + 1..])
    }

    async fn call_command(&self, command: &str, mut fields: Vec<(&str, BValue)>) -> Result<BValue> {
        let instance = self.select_instance().ok_or_else(|| Error::media_allocation("no healthy relay"))?;
        fields.insert(0, ("command", BValue::str(command)));
        let request = dict(fields);
        self.send_request(instance.address, &request).await.map_err(|e| {
            let _ = self.event_tx.send(MediaRelayEvent::RequestFailed { command: command.to_string(), reason: e.to_string() });
            e
        })
    }

    /// §4.6 *offer*: A-leg SDP in, rewritten SDP for the B-leg out.
    pub async fn offer(&self, call_id: &str, from_tag: &str, sdp: &str, flags: &str) -> Result<String> {
        let response = self
            .call_command(
                "offer",
                vec![
                    ("call-id", BValue::str(call_id)),
                    ("from-tag", BValue::str(from_tag)),
                    ("sdp", BValue::str(sdp)),
                    ("flags", BValue::str(flags)),
                ],
            )
            .await?;
        response
            .get("sdp")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::media_allocation("offer response missing sdp"))
    }

    /// §4.6 *answer*: both tags plus the new SDP; returns the rewritten SDP
    /// for the peer. Also used for re-INVITE SDP renegotiation on an
    /// established pair (§4.4 Mid-dialog).
    pub async fn answer(&self, call_id: &str, from_tag: &str, to_tag: &str, sdp: &str, flags: &str) -> Result<String> {
        let response = self
            .call_command(
                "answer",
                vec![
                    ("call-id", BValue::str(call_id)),
                    ("from-tag", BValue::str(from_tag)),
                    ("to-tag", BValue::str(to_tag)),
                    ("sdp", BValue::str(sdp)),
                    ("flags", BValue::str(flags)),
                ],
            )
            .await?;
        response
            .get("sdp")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::media_allocation("answer response missing sdp"))
    }

    /// §4.6 *delete*: idempotent — a relay that has already forgotten the
    /// call still answers "ok" (§8 round-trip property).
    pub async fn delete(&self, call_id: &str, from_tag: &str, to_tag: &str) -> Result<()> {
        let response = self
            .call_command(
                "delete",
                vec![
                    ("call-id", BValue::str(call_id)),
                    ("from-tag", BValue::str(from_tag)),
                    ("to-tag", BValue::str(to_tag)),
                ],
            )
            .await?;
        match response.get("result").and_then(|v| v.as_str()) {
            Some("ok") => Ok(()),
            _ => Err(Error::media_allocation("delete did not return ok")),
        }
    }

    /// §4.6 *delete*, best-effort up to 3 retries (§8 invariant 2).
    pub async fn delete_best_effort(&self, call_id: &str, from_tag: &str, to_tag: &str) {
        for attempt in 1..=3 {
            match self.delete(call_id, from_tag, to_tag).await {
                Ok(()) => return,
                Err(e) if attempt == 3 => {
                    warn!("media-relay delete for {call_id} failed after 3 attempts: {e}");
                }
                Err(_) => continue,
            }
        }
    }

    pub fn healthy_instance_count(&self) -> usize {
        self.instances.iter().filter(|i| i.enabled && i.healthy.load(Ordering::SeqCst)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaRelayInstanceConfig;

    fn config_with(addrs: Vec<&str>) -> MediaRelayConfig {
        MediaRelayConfig {
            instances: addrs
                .into_iter()
                .enumerate()
                .map(|(i, a)| MediaRelayInstanceConfig { id: format!("r{i}"), address: a.parse().unwrap(), weight: 1, enabled: true })
                .collect(),
            request_timeout_secs: 1,
            health_check_interval_secs: 30,
            unhealthy_after_failures: 3,
        }
    }

    #[tokio::test]
    async fn s5_three_failed_probes_removes_instance_then_recovery_readmits() {
        let (client, mut events) = MediaRelayClient::new(&config_with(vec!["127.0.0.1:1", "127.0.0.1:2"]));
        let instance = client.instances[0].clone();
        client.record_probe_result(&instance, false);
        client.record_probe_result(&instance, false);
        assert_eq!(client.healthy_instance_count(), 2);
        client.record_probe_result(&instance, false);
        assert_eq!(client.healthy_instance_count(), 1);
        let evt = events.recv().await.unwrap();
        assert!(matches!(evt, MediaRelayEvent::InstanceUnhealthy { .. }));

        client.record_probe_result(&instance, true);
        assert_eq!(client.healthy_instance_count(), 2);
        let evt = events.recv().await.unwrap();
        assert!(matches!(evt, MediaRelayEvent::InstanceHealthy { .. }));
    }

    #[tokio::test]
    async fn selection_returns_none_when_nothing_healthy() {
        let (client, _events) = MediaRelayClient::new(&config_with(vec!["127.0.0.1:1"]));
        let instance = client.instances[0].clone();
        for _ in 0..3 {
            client.record_probe_result(&instance, false);
        }
        assert!(client.select_instance().is_none());
    }

    #[test]
    fn weighted_round_robin_is_proportional() {
        let mut config = config_with(vec!["127.0.0.1:1", "127.0.0.1:2"]);
        config.instances[0].weight = 3;
        config.instances[1].weight = 1;
        let (client, _events) = MediaRelayClient::new(&config);
        let mut counts = std::collections::HashMap::new();
        for _ in 0..8 {
            let chosen = client.select_instance().unwrap();
            *counts.entry(chosen.id.clone()).or_insert(0) += 1;
        }
        assert_eq!(counts.get("r0").copied().unwrap_or(0), 6);
        assert_eq!(counts.get("r1").copied().unwrap_or(0), 2);
    }
}
