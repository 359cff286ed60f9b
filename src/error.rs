//! Error handling for the B2BUA core.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed SIP, missing mandatory header, unknown method (§7).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error or timeout at the transport layer (§7).
    #[error("Transport error: {0}")]
    Transport(String),

    /// No matching routing rule and no default (§7).
    #[error("Routing error: {0}")]
    Routing(String),

    /// Media-relay unreachable or returned an error result (§7).
    #[error("Media allocation error: {0}")]
    MediaAllocation(String),

    /// Session-cap exceeded for a username (§7).
    #[error("Admission error: {0}")]
    Admission(String),

    /// Shared key-value store unreachable (§7).
    #[error("Dependency error: {0}")]
    Dependency(String),

    /// Invalid config value or unknown field; fails at load (§7).
    #[error("Configuration value error: {0}")]
    Configuration(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }

    pub fn routing<S: Into<String>>(msg: S) -> Self {
        Self::Routing(msg.into())
    }

    pub fn media_allocation<S: Into<String>>(msg: S) -> Self {
        Self::MediaAllocation(msg.into())
    }

    pub fn admission<S: Into<String>>(msg: S) -> Self {
        Self::Admission(msg.into())
    }

    pub fn dependency<S: Into<String>>(msg: S) -> Self {
        Self::Dependency(msg.into())
    }

    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn not_supported<S: Into<String>>(msg: S) -> Self {
        Self::NotSupported(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Self::Parse(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// The canonical SIP final-status this error translates to when it must
    /// be answered in-line on the leg that observed it (§7 propagation policy).
    pub fn sip_status(&self) -> Option<(u16, &'static str)> {
        match self {
            Error::Protocol(_) => Some((400, "Bad Request")),
            Error::Transport(_) => Some((503, "Service Unavailable")),
            Error::Routing(_) => Some((404, "Not Found")),
            Error::MediaAllocation(_) => Some((500, "Media Allocation Failed")),
            Error::Admission(_) => Some((486, "Busy Here")),
            Error::Dependency(_) => Some((503, "Dependency Unavailable")),
            Error::Timeout(_) => Some((408, "Request Timeout")),
            _ => None,
        }
    }
}
