use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

pub mod config;
pub mod error;
pub mod types;

pub use config::{ledger, protocol, ConfigError, NodeConfig, Role};
pub use error::LedgerError;
pub use types::{Credits, NetworkAddress, Timestamp};

/// Longest account name accepted on the wire
pub const MAX_ACCOUNT_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("account id must not be empty")]
    EmptyAccountId,
    #[error("account id too long: {actual} bytes (max {max})")]
    AccountIdTooLong { max: usize, actual: usize },
    #[error("invalid character {0:?} in account id")]
    InvalidAccountChar(char),
    #[error("invalid network address: {0}")]
    InvalidAddress(String),
}

/// Name of a ledger account (a participant or the system bank)
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountId(String);

impl AccountId {
    pub fn new(name: impl Into<String>) -> Result<Self, DomainError> {
        let name = name.into();
        if name.is_empty() {
            return Err(DomainError::EmptyAccountId);
        }
        if name.len() > MAX_ACCOUNT_LEN {
            return Err(DomainError::AccountIdTooLong {
                max: MAX_ACCOUNT_LEN,
                actual: name.len(),
            });
        }
        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
        {
            return Err(DomainError::InvalidAccountChar(c));
        }
        Ok(Self(name))
    }

    /// The distinguished account that issues rewards without a balance check
    pub fn system() -> Self {
        Self(ledger::SYSTEM_ACCOUNT.to_string())
    }

    pub fn is_system(&self) -> bool {
        self.0 == ledger::SYSTEM_ACCOUNT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({})", self.0)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AccountId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for AccountId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AccountId> for String {
    fn from(value: AccountId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_id_rejects_empty() {
        assert_eq!(AccountId::new("").unwrap_err(), DomainError::EmptyAccountId);
    }

    #[test]
    fn account_id_rejects_whitespace() {
        let err = AccountId::new("dr alice").unwrap_err();
        assert_eq!(err, DomainError::InvalidAccountChar(' '));
    }

    #[test]
    fn account_id_rejects_overlong() {
        let err = AccountId::new("a".repeat(MAX_ACCOUNT_LEN + 1)).unwrap_err();
        assert!(matches!(err, DomainError::AccountIdTooLong { .. }));
    }

    #[test]
    fn system_account_is_recognised() {
        assert!(AccountId::system().is_system());
        assert!(!AccountId::new("dr_alice").unwrap().is_system());
    }

    #[test]
    fn account_id_deserialization_validates() {
        let ok: AccountId = serde_json::from_str("\"lab_tech_bob\"").unwrap();
        assert_eq!(ok.as_str(), "lab_tech_bob");

        let bad = serde_json::from_str::<AccountId>("\"\"");
        assert!(bad.is_err());
    }

    #[test]
    fn account_id_bincode_roundtrip() {
        let id = AccountId::new("pharm_charlie").unwrap();
        let encoded = bincode::serialize(&id).unwrap();
        let decoded: AccountId = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, id);
    }
}
