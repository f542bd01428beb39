use crate::{AccountId, NetworkAddress};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Network protocol constants
pub mod protocol {
    /// Current protocol version
    pub const VERSION: u32 = 1;

    /// Default port for node communication
    pub const DEFAULT_PORT: u16 = 7400;

    /// Default port for the HTTP API
    pub const DEFAULT_API_PORT: u16 = 7480;

    /// Maximum message size (10 MB)
    pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

    /// Connection timeout
    pub const CONNECTION_TIMEOUT_SECS: u64 = 5;

    /// How often the connector retries configured peers
    pub const RECONNECT_INTERVAL_SECS: u64 = 15;

    /// Delay before the first chain request after startup
    pub const INITIAL_SYNC_DELAY_SECS: u64 = 3;
}

/// Ledger economics
pub mod ledger {
    /// Account allowed to send transfers without a balance check
    pub const SYSTEM_ACCOUNT: &str = "SYSTEM_BANK_001";

    /// Paid by the system to the doctor who ordered a lab test once the result lands
    pub const LAB_TEST_REWARD: u64 = 500;

    /// Paid by the system to the prescriber once a prescription is filled
    pub const PRESCRIPTION_FILL_REWARD: u64 = 700;

    /// Paid by the prescriber to the lab whose report was reviewed
    pub const LAB_REPORT_FEE: u64 = 100;

    /// Test ordered by a consultation when the doctor requests one
    pub const DEFAULT_TEST: &str = "Blood Test";
}

/// Participant role a node acts for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Clinician,
    Lab,
    Pharmacy,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Clinician => f.write_str("clinician"),
            Self::Lab => f.write_str("lab"),
            Self::Pharmacy => f.write_str("pharmacy"),
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Human-readable node name, used in logs and the handshake
    pub node_name: String,

    /// Listen address
    pub listen_addr: String,

    /// Listen port
    pub listen_port: u16,

    /// HTTP API port
    pub api_port: u16,

    /// Peers to connect to (host:port)
    pub peers: Vec<String>,

    /// Account this node's operator acts as
    pub account: String,

    /// Role of this node's operator
    pub role: Role,

    /// Mine blocks even when nothing is pending
    pub allow_empty_blocks: bool,

    /// Seconds between reconnection attempts to configured peers
    pub reconnect_interval_secs: u64,

    /// Seconds to wait after startup before requesting peers' chains
    pub initial_sync_delay_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "careledger-node".to_string(),
            listen_addr: "0.0.0.0".to_string(),
            listen_port: protocol::DEFAULT_PORT,
            api_port: protocol::DEFAULT_API_PORT,
            peers: Vec::new(),
            account: "dr_alice".to_string(),
            role: Role::Clinician,
            allow_empty_blocks: false,
            reconnect_interval_secs: protocol::RECONNECT_INTERVAL_SECS,
            initial_sync_delay_secs: protocol::INITIAL_SYNC_DELAY_SECS,
        }
    }
}

impl NodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = name.into();
        self
    }

    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn with_api_port(mut self, port: u16) -> Self {
        self.api_port = port;
        self
    }

    pub fn with_peers(mut self, peers: Vec<String>) -> Self {
        self.peers = peers;
        self
    }

    pub fn with_account(mut self, account: impl Into<String>, role: Role) -> Self {
        self.account = account.into();
        self.role = role;
        self
    }

    pub fn with_empty_blocks(mut self, allow: bool) -> Self {
        self.allow_empty_blocks = allow;
        self
    }

    pub fn with_initial_sync_delay(mut self, secs: u64) -> Self {
        self.initial_sync_delay_secs = secs;
        self
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(protocol::CONNECTION_TIMEOUT_SECS)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs.max(1))
    }

    pub fn initial_sync_delay(&self) -> Duration {
        Duration::from_secs(self.initial_sync_delay_secs)
    }

    /// Operator account, validated
    pub fn account_id(&self) -> Result<AccountId, ConfigError> {
        AccountId::new(self.account.clone()).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Configured peers, skipping (and reporting) unparseable entries
    pub fn peer_addresses(&self) -> (Vec<NetworkAddress>, Vec<String>) {
        let mut parsed = Vec::new();
        let mut rejected = Vec::new();
        for peer in &self.peers {
            match peer.parse::<NetworkAddress>() {
                Ok(addr) => parsed.push(addr),
                Err(_) => rejected.push(peer.clone()),
            }
        }
        (parsed, rejected)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.listen_port, protocol::DEFAULT_PORT);
        assert_eq!(config.role, Role::Clinician);
        assert!(!config.allow_empty_blocks);
    }

    #[test]
    fn test_config_builder() {
        let config = NodeConfig::new()
            .with_name("lab-node")
            .with_port(8080)
            .with_peers(vec!["127.0.0.1:7401".to_string()])
            .with_account("lab_tech_bob", Role::Lab);

        assert_eq!(config.node_name, "lab-node");
        assert_eq!(config.listen_port, 8080);
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.role, Role::Lab);
        assert_eq!(config.account_id().unwrap().as_str(), "lab_tech_bob");
    }

    #[test]
    fn test_peer_addresses_skip_invalid() {
        let config = NodeConfig::new().with_peers(vec![
            "127.0.0.1:7401".to_string(),
            "garbage".to_string(),
            "pharmacy.local:7402".to_string(),
        ]);

        let (parsed, rejected) = config.peer_addresses();
        assert_eq!(parsed.len(), 2);
        assert_eq!(rejected, vec!["garbage".to_string()]);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: NodeConfig = toml::from_str(
            r#"
            node_name = "pharmacy"
            role = "pharmacy"
            account = "pharm_charlie"
            "#,
        )
        .unwrap();

        assert_eq!(config.role, Role::Pharmacy);
        assert_eq!(config.listen_port, protocol::DEFAULT_PORT);
        assert!(config.peers.is_empty());
    }

    #[test]
    fn test_config_file_roundtrip() {
        let path = std::env::temp_dir().join(format!(
            "careledger-config-{}.toml",
            std::process::id()
        ));
        let config = NodeConfig::new().with_port(9999).with_empty_blocks(true);
        config.to_file(&path).unwrap();

        let loaded = NodeConfig::from_file(&path).unwrap();
        assert_eq!(loaded.listen_port, 9999);
        assert!(loaded.allow_empty_blocks);

        std::fs::remove_file(&path).ok();
    }
}
