/// Ledger engine
///
/// Blocks and chain validation, the pending transaction pool, balances derived
/// from transfers, system rewards and the fork-choice rules that tie them together.

mod block;
mod ledger;
mod pool;
mod resolver;
mod rewards;
mod transaction;

pub use block::{
    append_candidate, chain_length, is_valid_chain, validate_chain, Block, BlockError, BlockHash,
    Blockchain, HistoryEntry, MinerContext,
};
pub use ledger::{BalanceLedger, BalanceOverlay, BalanceView};
pub use pool::TransactionPool;
pub use resolver::{BlockDecision, ChainAdoption, LedgerState, LedgerStats, MinedBlock};
pub use rewards::rewards_for_block;
pub use transaction::{Transaction, TransactionId, TransactionKind};
