//! Configuration loading and validation.
//!
//! Layered the way this crate's lineage layers configuration: a TOML file,
//! overridden by `B2BUA_`-prefixed environment variables, overridden by
//! nothing else — there is no live hot-swap of this struct (§7 Configuration
//! error kind: invalid values fail at load). The routing-rule store (C8) has
//! its own, independent hot-reload mechanism and is not governed by this
//! module.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub general: GeneralConfig,
    pub sip: SipConfig,
    pub store: StoreConfig,
    pub media_relay: MediaRelayConfig,
    pub session_tracker: SessionTrackerConfig,
    pub management_rpc: ManagementRpcConfig,
    pub health: HealthConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Key prefix used for every shared-store key this process writes (§6).
    pub namespace: String,
    pub node_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SipTransport {
    Udp,
    Tcp,
    Tls,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipConfig {
    pub listen_host: String,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub tls_port: u16,
    pub transports: Vec<SipTransport>,
    /// T1 retransmission base, milliseconds (default 500, §3).
    pub t1_ms: u64,
    /// T2 retransmission cap, milliseconds (default 4000, §3).
    pub t2_ms: u64,
    /// T4 network cleanup, milliseconds (default 5000, §3).
    pub t4_ms: u64,
    /// Bounded TCP partial-read timeout, seconds (default 10, §4.1).
    pub tcp_partial_read_timeout_secs: u64,
    /// Per-source-IP concurrent server-transaction ceiling (§5 backpressure).
    pub max_transactions_per_source: u32,
    /// Pair Early-state force-termination timeout, seconds (default 1800, §4.4).
    pub dialog_early_timeout_secs: u64,
    /// PEM certificate chain for the TLS listener. Required when `transports`
    /// lists `Tls`.
    pub tls_cert_path: Option<String>,
    /// PEM private key matching `tls_cert_path`.
    pub tls_key_path: Option<String>,
    /// PEM CA bundle trusted for outbound TLS connections to next hops.
    pub tls_ca_path: Option<String>,
}

impl SipConfig {
    pub fn t1(&self) -> Duration {
        Duration::from_millis(self.t1_ms)
    }
    pub fn t2(&self) -> Duration {
        Duration::from_millis(self.t2_ms)
    }
    pub fn t4(&self) -> Duration {
        Duration::from_millis(self.t4_ms)
    }
    /// Timer B/F: transaction timeout, 64*T1 (§3).
    pub fn timer_b(&self) -> Duration {
        self.t1() * 64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoreBackend {
    Memory,
    Redis { addresses: Vec<String>, password: Option<String> },
    Etcd { endpoints: Vec<String> },
    Consul { endpoints: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Whether C7 admission continues without the store once it is
    /// unreachable (§7 Dependency error kind: "fails open only if
    /// configured to do so").
    pub fail_open: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRelayInstanceConfig {
    pub id: String,
    pub address: SocketAddr,
    pub weight: u32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRelayConfig {
    pub instances: Vec<MediaRelayInstanceConfig>,
    pub request_timeout_secs: u64,
    pub health_check_interval_secs: u64,
    /// Consecutive failed probes before an instance is removed from
    /// selection (default 3, §4.6).
    pub unhealthy_after_failures: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AdmissionAction {
    Reject,
    TerminateOldest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTrackerConfig {
    pub default_cap: u32,
    pub action: AdmissionAction,
    pub session_ttl_secs: u64,
    pub cleanup_sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementRpcConfig {
    pub listen_addr: SocketAddr,
    pub bearer_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub listen_addr: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    Json,
    Compact,
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<String>,
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("B2BUA").separator("__"));
        let cfg: Config = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_from_env_or_default() -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::Environment::with_prefix("B2BUA").separator("__"));
        match builder.build() {
            Ok(built) => {
                if let Ok(cfg) = built.try_deserialize::<Config>() {
                    cfg.validate()?;
                    return Ok(cfg);
                }
                Ok(Self::default_config())
            }
            Err(_) => Ok(Self::default_config()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.general.namespace.is_empty() {
            return Err(Error::configuration("general.namespace must not be empty"));
        }
        if self.sip.transports.is_empty() {
            return Err(Error::configuration("sip.transports must list at least one transport"));
        }
        if self.sip.t1_ms == 0 {
            return Err(Error::configuration("sip.t1_ms must be non-zero"));
        }
        if self.media_relay.instances.is_empty() {
            return Err(Error::configuration("media_relay.instances must not be empty"));
        }
        if self.sip.transports.contains(&SipTransport::Tls)
            && (self.sip.tls_cert_path.is_none() || self.sip.tls_key_path.is_none() || self.sip.tls_ca_path.is_none())
        {
            return Err(Error::configuration("sip.tls_cert_path, tls_key_path and tls_ca_path are required when transports lists Tls"));
        }
        if self.management_rpc.bearer_token.is_empty() {
            return Err(Error::configuration("management_rpc.bearer_token must not be empty"));
        }
        Ok(())
    }

    pub fn default_config() -> Self {
        Self {
            general: GeneralConfig {
                namespace: "b2bua".to_string(),
                node_id: uuid::Uuid::new_v4().to_string(),
            },
            sip: SipConfig {
                listen_host: "0.0.0.0".to_string(),
                udp_port: 5060,
                tcp_port: 5060,
                tls_port: 5061,
                transports: vec![SipTransport::Udp, SipTransport::Tcp],
                t1_ms: 500,
                t2_ms: 4000,
                t4_ms: 5000,
                tcp_partial_read_timeout_secs: 10,
                max_transactions_per_source: 200,
                dialog_early_timeout_secs: 1800,
                tls_cert_path: None,
                tls_key_path: None,
                tls_ca_path: None,
            },
            store: StoreConfig {
                backend: StoreBackend::Memory,
                fail_open: false,
            },
            media_relay: MediaRelayConfig {
                instances: vec![MediaRelayInstanceConfig {
                    id: "relay-1".to_string(),
                    address: "127.0.0.1:22222".parse().unwrap(),
                    weight: 1,
                    enabled: true,
                }],
                request_timeout_secs: 5,
                health_check_interval_secs: 30,
                unhealthy_after_failures: 3,
            },
            session_tracker: SessionTrackerConfig {
                default_cap: 10,
                action: AdmissionAction::Reject,
                session_ttl_secs: 24 * 3600,
                cleanup_sweep_interval_secs: 300,
            },
            management_rpc: ManagementRpcConfig {
                listen_addr: "0.0.0.0:50051".parse().unwrap(),
                bearer_token: "change-me".to_string(),
            },
            health: HealthConfig {
                listen_addr: "0.0.0.0:8080".parse().unwrap(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: LogFormat::Compact,
                file: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let cfg = Config::default_config();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_namespace_is_rejected() {
        let mut cfg = Config::default_config();
        cfg.general.namespace.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn timer_b_is_64_times_t1() {
        let cfg = Config::default_config();
        assert_eq!(cfg.sip.timer_b(), Duration::from_millis(cfg.sip.t1_ms * 64));
    }
}
