use super::transaction::{Transaction, TransactionId};
use careledger_common::{LedgerError, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// 32-byte BLAKE3 block digest, hex encoded on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// Sentinel used as the genesis block's predecessor
    pub const ZERO: BlockHash = BlockHash([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Display for BlockHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl TryFrom<String> for BlockHash {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let bytes = hex::decode(&value).map_err(|e| format!("invalid block hash: {}", e))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "block hash must be 32 bytes".to_string())?;
        Ok(Self(arr))
    }
}

impl From<BlockHash> for String {
    fn from(value: BlockHash) -> Self {
        value.to_string()
    }
}

/// A hash-linked batch of transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Position in the chain (0 for genesis)
    pub index: u64,

    /// When the block was mined
    pub timestamp: Timestamp,

    /// Transactions in admission order
    pub transactions: Vec<Transaction>,

    /// Hash of the previous block
    pub previous_hash: BlockHash,

    /// Miner-chosen marker folded into the hash
    pub nonce: u64,

    /// Digest over all of the above
    pub hash: BlockHash,
}

impl Block {
    /// Create a block and compute its hash
    pub fn new(
        index: u64,
        timestamp: Timestamp,
        transactions: Vec<Transaction>,
        previous_hash: BlockHash,
        nonce: u64,
    ) -> Result<Self, BlockError> {
        let mut block = Self {
            index,
            timestamp,
            transactions,
            previous_hash,
            nonce,
            hash: BlockHash::ZERO,
        };
        block.hash = block.calculate_hash()?;
        Ok(block)
    }

    /// The fixed root every node agrees on
    pub fn genesis() -> Self {
        // bincode encodes an empty Vec as its u64 length
        let encoded_empty = 0u64.to_le_bytes();
        let hash = digest(0, Timestamp::EPOCH, &encoded_empty, &BlockHash::ZERO, 0);

        Self {
            index: 0,
            timestamp: Timestamp::EPOCH,
            transactions: Vec::new(),
            previous_hash: BlockHash::ZERO,
            nonce: 0,
            hash,
        }
    }

    /// Recompute the digest from the block's fields
    pub fn calculate_hash(&self) -> Result<BlockHash, BlockError> {
        let encoded = bincode::serialize(&self.transactions)
            .map_err(|e| BlockError::Encoding(e.to_string()))?;

        Ok(digest(
            self.index,
            self.timestamp,
            &encoded,
            &self.previous_hash,
            self.nonce,
        ))
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn contains_transaction(&self, tx_id: &TransactionId) -> bool {
        self.transactions.iter().any(|tx| &tx.id == tx_id)
    }

    /// Check this block's own contents: hash and transaction structure
    pub fn validate_contents(&self) -> Result<(), BlockError> {
        if self.hash != self.calculate_hash()? {
            return Err(BlockError::HashMismatch { index: self.index });
        }

        let mut seen = HashSet::new();
        for tx in &self.transactions {
            if !seen.insert(tx.id) {
                return Err(BlockError::DuplicateTransaction(tx.id));
            }
            tx.validate_structure()
                .map_err(|e| BlockError::MalformedTransaction {
                    id: tx.id,
                    reason: e.to_string(),
                })?;
        }

        Ok(())
    }

    /// Validate this block as the direct successor of `previous`
    pub fn validate_successor(&self, previous: &Block) -> Result<(), BlockError> {
        if self.index != previous.index + 1 {
            return Err(BlockError::InvalidIndex {
                expected: previous.index + 1,
                got: self.index,
            });
        }

        if self.previous_hash != previous.hash {
            return Err(BlockError::InvalidPreviousHash { index: self.index });
        }

        self.validate_contents()
    }
}

fn digest(
    index: u64,
    timestamp: Timestamp,
    encoded_transactions: &[u8],
    previous_hash: &BlockHash,
    nonce: u64,
) -> BlockHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&index.to_le_bytes());
    hasher.update(&timestamp.as_secs().to_le_bytes());
    hasher.update(encoded_transactions);
    hasher.update(previous_hash.as_bytes());
    hasher.update(&nonce.to_le_bytes());

    BlockHash(*hasher.finalize().as_bytes())
}

/// What the miner contributes to a new block besides its transactions
#[derive(Debug, Clone, Copy)]
pub struct MinerContext {
    pub timestamp: Timestamp,
    pub nonce: u64,
}

impl MinerContext {
    pub fn now() -> Self {
        Self {
            timestamp: Timestamp::now(),
            nonce: 0,
        }
    }

    pub fn at(timestamp: Timestamp) -> Self {
        Self { timestamp, nonce: 0 }
    }
}

/// Build the next block on top of `chain`'s tip
pub fn append_candidate(
    chain: &[Block],
    transactions: Vec<Transaction>,
    miner: &MinerContext,
) -> Result<Block, LedgerError> {
    let tip = chain.last().ok_or(LedgerError::ChainEmpty)?;

    Ok(Block::new(
        tip.index + 1,
        miner.timestamp,
        transactions,
        tip.hash,
        miner.nonce,
    )?)
}

/// Verify genesis, every link and every digest from root to tip
pub fn validate_chain(chain: &[Block]) -> Result<(), BlockError> {
    let first = chain.first().ok_or(BlockError::EmptyChain)?;
    if *first != Block::genesis() {
        return Err(BlockError::GenesisMismatch);
    }

    let mut committed = HashSet::new();
    for pair in chain.windows(2) {
        let (previous, block) = (&pair[0], &pair[1]);
        block.validate_successor(previous)?;

        for tx in &block.transactions {
            if !committed.insert(tx.id) {
                return Err(BlockError::DuplicateTransaction(tx.id));
            }
        }
    }

    Ok(())
}

pub fn is_valid_chain(chain: &[Block]) -> bool {
    validate_chain(chain).is_ok()
}

pub fn chain_length(chain: &[Block]) -> usize {
    chain.len()
}

/// One patient-related transaction together with where it was committed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub block_index: u64,
    pub block_timestamp: Timestamp,
    pub transaction: Transaction,
}

/// Local chain plus an index of committed transaction ids
#[derive(Debug, Clone)]
pub struct Blockchain {
    blocks: Vec<Block>,
    committed: HashSet<TransactionId>,
}

impl Default for Blockchain {
    fn default() -> Self {
        Self::new()
    }
}

impl Blockchain {
    /// Create a chain holding only the genesis block
    pub fn new() -> Self {
        Self {
            blocks: vec![Block::genesis()],
            committed: HashSet::new(),
        }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn tip(&self) -> &Block {
        // Non-empty: constructed with genesis and only replaced by validated chains
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn get_block(&self, index: u64) -> Option<&Block> {
        usize::try_from(index).ok().and_then(|i| self.blocks.get(i))
    }

    /// Whether this exact block is already part of the chain
    pub fn contains_block(&self, block: &Block) -> bool {
        self.get_block(block.index)
            .map(|existing| existing.hash == block.hash)
            .unwrap_or(false)
    }

    pub fn contains_transaction(&self, tx_id: &TransactionId) -> bool {
        self.committed.contains(tx_id)
    }

    /// Locate a committed transaction and the block holding it
    pub fn find_transaction(&self, tx_id: &TransactionId) -> Option<(&Block, &Transaction)> {
        if !self.committed.contains(tx_id) {
            return None;
        }
        self.blocks.iter().find_map(|block| {
            block
                .transactions
                .iter()
                .find(|tx| &tx.id == tx_id)
                .map(|tx| (block, tx))
        })
    }

    /// Append a block that extends the current tip
    pub fn try_append(&mut self, block: Block) -> Result<(), BlockError> {
        block.validate_successor(self.tip())?;

        if let Some(tx) = block
            .transactions
            .iter()
            .find(|tx| self.committed.contains(&tx.id))
        {
            return Err(BlockError::DuplicateTransaction(tx.id));
        }

        self.committed
            .extend(block.transactions.iter().map(|tx| tx.id));
        self.blocks.push(block);
        Ok(())
    }

    /// Swap in a whole new chain after validating it
    pub fn replace(&mut self, blocks: Vec<Block>) -> Result<(), BlockError> {
        validate_chain(&blocks)?;

        self.committed = blocks
            .iter()
            .flat_map(|block| block.transactions.iter().map(|tx| tx.id))
            .collect();
        self.blocks = blocks;
        Ok(())
    }

    /// All committed transactions for one patient, oldest first
    pub fn patient_history(&self, patient_id: &str) -> Vec<HistoryEntry> {
        self.blocks
            .iter()
            .flat_map(move |block| {
                block
                    .transactions
                    .iter()
                    .filter(move |tx| tx.patient_id() == Some(patient_id))
                    .map(move |tx| HistoryEntry {
                        block_index: block.index,
                        block_timestamp: block.timestamp,
                        transaction: tx.clone(),
                    })
            })
            .collect()
    }
}

/// Block and chain validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    #[error("Invalid block index: expected {expected}, got {got}")]
    InvalidIndex { expected: u64, got: u64 },

    #[error("Block {index} does not link to its predecessor")]
    InvalidPreviousHash { index: u64 },

    #[error("Block {index} hash does not match its contents")]
    HashMismatch { index: u64 },

    #[error("Chain does not start with the agreed genesis block")]
    GenesisMismatch,

    #[error("Chain is empty")]
    EmptyChain,

    #[error("Transaction {0} appears more than once")]
    DuplicateTransaction(TransactionId),

    #[error("Transaction {id} is malformed: {reason}")]
    MalformedTransaction { id: TransactionId, reason: String },

    #[error("Failed to encode transactions: {0}")]
    Encoding(String),
}

impl From<BlockError> for LedgerError {
    fn from(err: BlockError) -> Self {
        match err {
            BlockError::Encoding(msg) => LedgerError::MalformedMessage(msg),
            BlockError::EmptyChain => LedgerError::ChainEmpty,
            other => LedgerError::InvalidChain(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::transaction::TransactionKind;
    use careledger_common::{AccountId, Credits};

    fn account(name: &str) -> AccountId {
        AccountId::new(name).unwrap()
    }

    fn registration(patient: &str) -> Transaction {
        Transaction::new(TransactionKind::Registration {
            patient_id: patient.to_string(),
            patient_name: "Jane Doe".to_string(),
            registered_by: account("dr_alice"),
        })
    }

    fn build_chain(blocks: usize) -> Vec<Block> {
        let mut chain = vec![Block::genesis()];
        for i in 0..blocks {
            let next = append_candidate(
                &chain,
                vec![registration(&format!("p-{}", i))],
                &MinerContext::at(Timestamp::from_secs(1_000 + i as u64)),
            )
            .unwrap();
            chain.push(next);
        }
        chain
    }

    #[test]
    fn test_genesis_is_deterministic() {
        let g1 = Block::genesis();
        let g2 = Block::genesis();

        assert_eq!(g1, g2);
        assert_eq!(g1.index, 0);
        assert_eq!(g1.previous_hash, BlockHash::ZERO);
        assert!(g1.transactions.is_empty());
    }

    #[test]
    fn test_genesis_hash_matches_recomputation() {
        let genesis = Block::genesis();
        assert_eq!(genesis.calculate_hash().unwrap(), genesis.hash);
    }

    #[test]
    fn test_append_candidate_links_to_tip() {
        let chain = build_chain(2);
        let tip = chain.last().unwrap();

        let next = append_candidate(&chain, vec![], &MinerContext::now()).unwrap();
        assert_eq!(next.index, tip.index + 1);
        assert_eq!(next.previous_hash, tip.hash);
    }

    #[test]
    fn test_append_candidate_on_empty_chain() {
        let result = append_candidate(&[], vec![], &MinerContext::now());
        assert_eq!(result.unwrap_err(), LedgerError::ChainEmpty);
    }

    #[test]
    fn test_valid_chain_validates() {
        let chain = build_chain(4);
        assert!(is_valid_chain(&chain));
        assert_eq!(chain_length(&chain), 5);
    }

    #[test]
    fn test_empty_chain_is_invalid() {
        assert_eq!(validate_chain(&[]), Err(BlockError::EmptyChain));
    }

    #[test]
    fn test_foreign_genesis_is_invalid() {
        let mut chain = build_chain(1);
        chain[0] = Block::new(0, Timestamp::from_secs(5), vec![], BlockHash::ZERO, 0).unwrap();
        assert_eq!(validate_chain(&chain), Err(BlockError::GenesisMismatch));
    }

    #[test]
    fn test_mutating_transaction_invalidates() {
        let mut chain = build_chain(3);
        if let TransactionKind::Registration { patient_name, .. } =
            &mut chain[2].transactions[0].kind
        {
            *patient_name = "Mallory".to_string();
        }
        assert!(matches!(
            validate_chain(&chain),
            Err(BlockError::HashMismatch { index: 2 })
        ));
    }

    #[test]
    fn test_mutating_hash_invalidates() {
        let mut chain = build_chain(3);
        chain[1].hash = BlockHash([7u8; 32]);
        assert!(!is_valid_chain(&chain));
    }

    #[test]
    fn test_mutating_previous_hash_invalidates() {
        let mut chain = build_chain(3);
        chain[3].previous_hash = BlockHash([9u8; 32]);
        assert!(!is_valid_chain(&chain));
    }

    #[test]
    fn test_wrong_index_invalidates() {
        let mut chain = build_chain(2);
        let bad = Block::new(
            5,
            chain[2].timestamp,
            chain[2].transactions.clone(),
            chain[1].hash,
            0,
        )
        .unwrap();
        chain[2] = bad;
        assert!(matches!(
            validate_chain(&chain),
            Err(BlockError::InvalidIndex { expected: 2, got: 5 })
        ));
    }

    #[test]
    fn test_transaction_repeated_across_blocks_invalidates() {
        let mut chain = build_chain(1);
        let repeat = chain[1].transactions[0].clone();
        let next = append_candidate(&chain, vec![repeat.clone()], &MinerContext::now()).unwrap();
        chain.push(next);

        assert_eq!(
            validate_chain(&chain),
            Err(BlockError::DuplicateTransaction(repeat.id))
        );
    }

    #[test]
    fn test_block_rejects_malformed_transfer() {
        let zero = Transaction::transfer(account("dr_alice"), account("lab_tech_bob"), Credits::ZERO, "");
        let block = append_candidate(&[Block::genesis()], vec![zero], &MinerContext::now()).unwrap();
        assert!(matches!(
            block.validate_contents(),
            Err(BlockError::MalformedTransaction { .. })
        ));
    }

    #[test]
    fn test_block_hash_json_roundtrip_is_stable() {
        let chain = build_chain(1);
        let json = serde_json::to_string(&chain[1]).unwrap();
        let decoded: Block = serde_json::from_str(&json).unwrap();

        assert_eq!(decoded, chain[1]);
        assert_eq!(decoded.calculate_hash().unwrap(), chain[1].hash);
    }

    #[test]
    fn test_blockchain_try_append() {
        let mut blockchain = Blockchain::new();
        let tx = registration("p-1");
        let tx_id = tx.id;

        let block = append_candidate(blockchain.blocks(), vec![tx], &MinerContext::now()).unwrap();
        blockchain.try_append(block.clone()).unwrap();

        assert_eq!(blockchain.len(), 2);
        assert_eq!(blockchain.tip().hash, block.hash);
        assert!(blockchain.contains_transaction(&tx_id));
        assert!(blockchain.contains_block(&block));
    }

    #[test]
    fn test_blockchain_rejects_non_extending_block() {
        let mut blockchain = Blockchain::new();
        let stale = Block::new(1, Timestamp::now(), vec![], BlockHash([1u8; 32]), 0).unwrap();

        assert!(matches!(
            blockchain.try_append(stale),
            Err(BlockError::InvalidPreviousHash { index: 1 })
        ));
        assert_eq!(blockchain.len(), 1);
    }

    #[test]
    fn test_blockchain_rejects_recommitted_transaction() {
        let mut blockchain = Blockchain::new();
        let tx = registration("p-1");

        let b1 = append_candidate(blockchain.blocks(), vec![tx.clone()], &MinerContext::now()).unwrap();
        blockchain.try_append(b1).unwrap();

        let b2 = append_candidate(blockchain.blocks(), vec![tx.clone()], &MinerContext::now()).unwrap();
        assert_eq!(
            blockchain.try_append(b2),
            Err(BlockError::DuplicateTransaction(tx.id))
        );
    }

    #[test]
    fn test_blockchain_replace_rebuilds_index() {
        let mut blockchain = Blockchain::new();
        let other = build_chain(3);
        let committed = other[2].transactions[0].id;

        blockchain.replace(other).unwrap();
        assert_eq!(blockchain.len(), 4);
        assert!(blockchain.contains_transaction(&committed));
        assert!(blockchain.find_transaction(&committed).is_some());
    }

    #[test]
    fn test_blockchain_replace_rejects_invalid() {
        let mut blockchain = Blockchain::new();
        let mut other = build_chain(2);
        other[1].nonce = 99;

        assert!(blockchain.replace(other).is_err());
        assert_eq!(blockchain.len(), 1);
    }

    #[test]
    fn test_patient_history() {
        let mut blockchain = Blockchain::new();
        let consult = Transaction::new(TransactionKind::Consultation {
            patient_id: "p-1".to_string(),
            doctor: account("dr_alice"),
            notes: "fever".to_string(),
            tests_ordered: vec!["Blood Test".to_string()],
        });
        let b1 = append_candidate(
            blockchain.blocks(),
            vec![registration("p-1"), registration("p-2")],
            &MinerContext::now(),
        )
        .unwrap();
        blockchain.try_append(b1).unwrap();
        let b2 = append_candidate(blockchain.blocks(), vec![consult], &MinerContext::now()).unwrap();
        blockchain.try_append(b2).unwrap();

        let history = blockchain.patient_history("p-1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].block_index, 1);
        assert_eq!(history[1].block_index, 2);
        assert!(blockchain.patient_history("p-3").is_empty());
    }

    #[test]
    fn test_block_error_maps_to_ledger_error() {
        let err: LedgerError = BlockError::GenesisMismatch.into();
        assert!(matches!(err, LedgerError::InvalidChain(_)));

        let err: LedgerError = BlockError::EmptyChain.into();
        assert_eq!(err, LedgerError::ChainEmpty);
    }
}
