use super::block::{append_candidate, validate_chain, Block, BlockHash, Blockchain, HistoryEntry, MinerContext};
use super::ledger::BalanceLedger;
use super::pool::TransactionPool;
use super::rewards::rewards_for_block;
use super::transaction::Transaction;
use careledger_common::{AccountId, LedgerError};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Chain, pending pool and balances of one node, mutated together
///
/// Every method that changes one of the three updates the others before
/// returning, so holding this behind a single lock is enough to never observe
/// a chain without its matching pool and balances.
#[derive(Debug, Clone)]
pub struct LedgerState {
    chain: Blockchain,
    pool: TransactionPool,
    ledger: BalanceLedger,
    allow_empty_blocks: bool,
}

/// A block this node appended, plus the rewards it queued as a result
#[derive(Debug, Clone)]
pub struct MinedBlock {
    pub block: Block,
    pub rewards: Vec<Transaction>,
}

/// Outcome of offering a peer's block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockDecision {
    /// Extended the tip; carries rewards queued for the new block
    Appended(Vec<Transaction>),

    /// Already part of the local chain
    AlreadyKnown,

    /// Does not build on the local tip; the peer may be on a longer fork
    PossibleFork,

    /// Builds on the tip but is invalid
    Rejected(LedgerError),
}

/// Result of adopting a peer's chain
#[derive(Debug, Clone)]
pub struct ChainAdoption {
    pub length: usize,

    /// Rewards for newly adopted blocks that were not pending or committed yet
    pub rewards: Vec<Transaction>,

    /// Pending transfers that the new balances no longer cover
    pub dropped: Vec<Transaction>,
}

/// Summary for status displays
#[derive(Debug, Clone)]
pub struct LedgerStats {
    pub chain_length: usize,
    pub tip_hash: BlockHash,
    pub pending: usize,
    pub accounts: usize,
}

impl Default for LedgerState {
    fn default() -> Self {
        Self::new(false)
    }
}

impl LedgerState {
    pub fn new(allow_empty_blocks: bool) -> Self {
        Self {
            chain: Blockchain::new(),
            pool: TransactionPool::new(),
            ledger: BalanceLedger::new(),
            allow_empty_blocks,
        }
    }

    pub fn chain(&self) -> &Blockchain {
        &self.chain
    }

    pub fn pool(&self) -> &TransactionPool {
        &self.pool
    }

    pub fn ledger(&self) -> &BalanceLedger {
        &self.ledger
    }

    pub fn balances(&self) -> BTreeMap<AccountId, i64> {
        self.ledger.snapshot()
    }

    pub fn patient_history(&self, patient_id: &str) -> Vec<HistoryEntry> {
        self.chain.patient_history(patient_id)
    }

    pub fn stats(&self) -> LedgerStats {
        LedgerStats {
            chain_length: self.chain.len(),
            tip_hash: self.chain.tip().hash,
            pending: self.pool.len(),
            accounts: self.ledger.account_count(),
        }
    }

    /// Admit a transaction into the pending pool
    pub fn submit(&mut self, tx: Transaction) -> Result<Transaction, LedgerError> {
        self.pool.submit(tx, &self.chain, &self.ledger)
    }

    /// Package minable pending transactions into a block on the local tip
    pub fn mine(&mut self, miner: &MinerContext) -> Result<MinedBlock, LedgerError> {
        let transactions = self.pool.drain_minable(&self.ledger);
        if transactions.is_empty() && !self.allow_empty_blocks {
            return Err(LedgerError::NothingToMine);
        }

        let block = append_candidate(self.chain.blocks(), transactions, miner)?;
        let mut ledger = self.ledger.clone();
        ledger.apply_block(&block)?;
        self.chain.try_append(block.clone())?;
        self.ledger = ledger;
        self.pool
            .remove(block.transactions.iter().map(|tx| &tx.id));

        info!(
            "Mined block {} ({}) with {} transactions",
            block.index,
            block.hash.short(),
            block.transaction_count()
        );

        let rewards = self.queue_rewards(std::slice::from_ref(&block));
        Ok(MinedBlock { block, rewards })
    }

    /// Fast path for a block received from a peer
    pub fn consider_foreign_block(&mut self, block: Block) -> BlockDecision {
        if self.chain.contains_block(&block) {
            return BlockDecision::AlreadyKnown;
        }

        let tip = self.chain.tip();
        if block.previous_hash != tip.hash || block.index != tip.index + 1 {
            debug!(
                "Block {} ({}) does not extend tip {} ({})",
                block.index,
                block.hash.short(),
                tip.index,
                tip.hash.short()
            );
            return BlockDecision::PossibleFork;
        }

        if let Err(e) = block.validate_successor(tip) {
            warn!("Rejected block {}: {}", block.index, e);
            return BlockDecision::Rejected(e.into());
        }

        let mut ledger = self.ledger.clone();
        if let Err(e) = ledger.apply_block_checked(&block) {
            warn!("Rejected block {}: {}", block.index, e);
            return BlockDecision::Rejected(e);
        }

        if let Err(e) = self.chain.try_append(block.clone()) {
            warn!("Rejected block {}: {}", block.index, e);
            return BlockDecision::Rejected(e.into());
        }
        self.ledger = ledger;
        self.pool
            .remove(block.transactions.iter().map(|tx| &tx.id));

        info!(
            "Accepted block {} ({}) from peer",
            block.index,
            block.hash.short()
        );

        BlockDecision::Appended(self.queue_rewards(std::slice::from_ref(&block)))
    }

    /// Longest-valid-chain rule: adopt only a strictly longer, fully valid chain
    pub fn consider_foreign_chain(
        &mut self,
        candidate: Vec<Block>,
    ) -> Result<ChainAdoption, LedgerError> {
        let local = self.chain.len();
        if candidate.len() <= local {
            return Err(LedgerError::ChainNotLonger {
                local,
                candidate: candidate.len(),
            });
        }

        validate_chain(&candidate)?;
        let ledger = BalanceLedger::replay_checked(&candidate)
            .map_err(|e| LedgerError::invalid_chain(format!("balance replay failed: {}", e)))?;

        let fork_point = self
            .chain
            .blocks()
            .iter()
            .zip(candidate.iter())
            .take_while(|(ours, theirs)| ours.hash == theirs.hash)
            .count();

        self.chain.replace(candidate)?;
        self.ledger = ledger;
        let dropped = self.pool.reconcile(&self.chain, &self.ledger);

        info!(
            "Adopted chain of length {} (was {}, diverged at block {})",
            self.chain.len(),
            local,
            fork_point
        );
        for tx in &dropped {
            warn!("Dropped pending transaction {}: no longer affordable", tx.id);
        }

        let new_blocks = self.chain.blocks()[fork_point..].to_vec();
        let rewards = self.queue_rewards(&new_blocks);

        Ok(ChainAdoption {
            length: self.chain.len(),
            rewards,
            dropped,
        })
    }

    /// Rebuild balances from the chain
    pub fn recalc_balances(&mut self) -> Result<BTreeMap<AccountId, i64>, LedgerError> {
        self.ledger = BalanceLedger::recompute_from_chain(self.chain.blocks())?;
        Ok(self.ledger.snapshot())
    }

    /// Submit rewards earned by `blocks`; returns the ones newly admitted
    fn queue_rewards(&mut self, blocks: &[Block]) -> Vec<Transaction> {
        let mut queued = Vec::new();
        for block in blocks {
            for reward in rewards_for_block(&self.chain, block) {
                match self.pool.submit(reward, &self.chain, &self.ledger) {
                    Ok(tx) => queued.push(tx),
                    Err(e) => debug!("Reward not queued: {}", e),
                }
            }
        }
        queued
    }
}
