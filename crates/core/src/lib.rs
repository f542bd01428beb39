pub mod consensus;
pub mod network;
pub mod node;
pub mod protocol;
pub mod transport;
pub mod workflow;

pub use node::{Node, NodeStats, SyncReport};

// Re-export ledger types
pub use consensus::{
    append_candidate, chain_length, is_valid_chain, validate_chain, BalanceLedger, BalanceView,
    Block, BlockDecision, BlockError, BlockHash, Blockchain, ChainAdoption, HistoryEntry,
    LedgerState, LedgerStats, MinedBlock, MinerContext, Transaction, TransactionId,
    TransactionKind, TransactionPool,
};

// Re-export network types
pub use network::{ConnectionManager, MessageDispatcher, PeerAction, PeerSummary};
pub use protocol::{Message, MessagePayload};

// Re-export workflow types
pub use workflow::{Capabilities, Clinician, Lab, Pharmacy, WorkflowAction, WorkflowOutcome};
