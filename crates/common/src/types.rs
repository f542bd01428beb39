use crate::DomainError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Amount of e-cash moved by a single transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credits(pub u64);

impl Credits {
    pub const ZERO: Credits = Credits(0);

    /// Largest amount a single transfer may carry; balances are `i64`
    pub const MAX: Credits = Credits(i64::MAX as u64);

    pub fn new(amount: u64) -> Self {
        Self(amount)
    }

    /// Signed view used when applying the amount to a balance
    pub fn to_signed(&self) -> Option<i64> {
        i64::try_from(self.0).ok()
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Credits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} credits", self.0)
    }
}

/// Timestamp in Unix epoch seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const EPOCH: Timestamp = Timestamp(0);

    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_secs())
    }

    pub fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    pub fn elapsed(&self) -> Duration {
        let now = Self::now();
        Duration::from_secs(now.0.saturating_sub(self.0))
    }
}

/// Network address for peer connections
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkAddress {
    /// Standard socket address (IP + port)
    Socket(SocketAddr),
    /// Domain name + port (for DNS-based connections)
    Domain { host: String, port: u16 },
}

impl NetworkAddress {
    pub fn from_socket(addr: SocketAddr) -> Self {
        Self::Socket(addr)
    }

    pub fn from_domain(host: String, port: u16) -> Self {
        Self::Domain { host, port }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Socket(addr) => addr.port(),
            Self::Domain { port, .. } => *port,
        }
    }
}

impl std::fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Socket(addr) => write!(f, "{}", addr),
            Self::Domain { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

impl FromStr for NetworkAddress {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self::Socket(addr));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| DomainError::InvalidAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(DomainError::InvalidAddress(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| DomainError::InvalidAddress(s.to_string()))?;

        Ok(Self::from_domain(host.to_string(), port))
    }
}
