use crate::{AccountId, Credits};
use thiserror::Error;

/// Errors reported by core ledger operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Duplicate transaction: {0}")]
    DuplicateTransaction(String),

    #[error("Insufficient balance for {account}: need {needed}, have {available}")]
    InsufficientBalance {
        account: AccountId,
        needed: Credits,
        available: i64,
    },

    #[error("Invalid chain: {0}")]
    InvalidChain(String),

    #[error("Candidate chain is not longer: local {local}, candidate {candidate}")]
    ChainNotLonger { local: usize, candidate: usize },

    #[error("Chain has no tip to build on")]
    ChainEmpty,

    #[error("Nothing to mine")]
    NothingToMine,

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

impl LedgerError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedMessage(msg.into())
    }

    pub fn invalid_chain(msg: impl Into<String>) -> Self {
        Self::InvalidChain(msg.into())
    }

    pub fn peer_unreachable(msg: impl Into<String>) -> Self {
        Self::PeerUnreachable(msg.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }
}
