use super::block::Block;
use super::transaction::Transaction;
use careledger_common::{AccountId, Credits, LedgerError};
use std::collections::{BTreeMap, HashMap};

/// Read access to account balances
///
/// The transaction pool only ever sees balances through this trait, so it can be
/// handed either the committed ledger or a scratch overlay on top of it.
pub trait BalanceView {
    /// Current balance, 0 for accounts never seen
    fn balance(&self, account: &AccountId) -> i64;

    /// Whether `account` may send `amount` right now
    fn can_spend(&self, account: &AccountId, amount: Credits) -> bool {
        account.is_system()
            || amount
                .to_signed()
                .is_some_and(|amount| self.balance(account) >= amount)
    }

    /// Like `can_spend`, reporting the shortfall as an error
    fn check_spend(&self, account: &AccountId, amount: Credits) -> Result<(), LedgerError> {
        if self.can_spend(account, amount) {
            Ok(())
        } else {
            Err(LedgerError::InsufficientBalance {
                account: account.clone(),
                needed: amount,
                available: self.balance(account),
            })
        }
    }
}

/// Sender and recipient balances after moving `amount`, or an error if either
/// leaves the `i64` range
fn settle<V: BalanceView + ?Sized>(
    view: &V,
    from: &AccountId,
    to: &AccountId,
    amount: Credits,
) -> Result<(i64, i64), LedgerError> {
    let overflow = || {
        LedgerError::invalid_chain(format!(
            "moving {} from {} to {} overflows a balance",
            amount, from, to
        ))
    };
    let signed = amount.to_signed().ok_or_else(overflow)?;
    let sender = view.balance(from).checked_sub(signed).ok_or_else(overflow)?;
    let recipient = view.balance(to).checked_add(signed).ok_or_else(overflow)?;
    Ok((sender, recipient))
}

/// Account balances derived by replaying transfers in chain order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalanceLedger {
    balances: BTreeMap<AccountId, i64>,
}

impl BalanceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay every transfer from genesis to tip
    pub fn recompute_from_chain(chain: &[Block]) -> Result<Self, LedgerError> {
        let mut ledger = Self::new();
        for block in chain {
            ledger.apply_block(block)?;
        }
        Ok(ledger)
    }

    /// Replay like `recompute_from_chain`, refusing any non-system overdraft
    pub fn replay_checked(chain: &[Block]) -> Result<Self, LedgerError> {
        let mut ledger = Self::new();
        for block in chain {
            ledger.apply_block_checked(block)?;
        }
        Ok(ledger)
    }

    /// Extend with one block's transfers; nothing is applied if a balance would overflow
    pub fn apply_block(&mut self, block: &Block) -> Result<(), LedgerError> {
        let mut scratch = self.clone();
        for tx in &block.transactions {
            scratch.apply_transaction(tx)?;
        }
        *self = scratch;
        Ok(())
    }

    /// Like `apply_block`, also refusing any non-system overdraft
    pub fn apply_block_checked(&mut self, block: &Block) -> Result<(), LedgerError> {
        let mut scratch = self.clone();
        for tx in &block.transactions {
            if let Some((from, _, amount)) = tx.as_transfer() {
                scratch.check_spend(from, amount)?;
            }
            scratch.apply_transaction(tx)?;
        }
        *self = scratch;
        Ok(())
    }

    /// Apply a single transaction; non-transfers leave balances unchanged
    pub fn apply_transaction(&mut self, tx: &Transaction) -> Result<(), LedgerError> {
        if let Some((from, to, amount)) = tx.as_transfer() {
            let (sender, recipient) = settle(self, from, to, amount)?;
            self.balances.insert(from.clone(), sender);
            self.balances.insert(to.clone(), recipient);
        }
        Ok(())
    }

    /// Sorted snapshot of all known balances
    pub fn snapshot(&self) -> BTreeMap<AccountId, i64> {
        self.balances.clone()
    }

    pub fn account_count(&self) -> usize {
        self.balances.len()
    }

    /// Sum over all accounts, the system account included
    pub fn total(&self) -> i128 {
        self.balances.values().map(|&balance| i128::from(balance)).sum()
    }
}

impl BalanceView for BalanceLedger {
    fn balance(&self, account: &AccountId) -> i64 {
        self.balances.get(account).copied().unwrap_or(0)
    }
}

/// Pending balance changes layered over a base view
pub struct BalanceOverlay<'a, V: BalanceView + ?Sized> {
    base: &'a V,
    balances: HashMap<AccountId, i64>,
}

impl<'a, V: BalanceView + ?Sized> BalanceOverlay<'a, V> {
    pub fn new(base: &'a V) -> Self {
        Self {
            base,
            balances: HashMap::new(),
        }
    }

    /// Record a transfer in the overlay only; on overflow the overlay is unchanged
    pub fn apply(&mut self, tx: &Transaction) -> Result<(), LedgerError> {
        if let Some((from, to, amount)) = tx.as_transfer() {
            let (sender, recipient) = settle(self, from, to, amount)?;
            self.balances.insert(from.clone(), sender);
            self.balances.insert(to.clone(), recipient);
        }
        Ok(())
    }
}

impl<V: BalanceView + ?Sized> BalanceView for BalanceOverlay<'_, V> {
    fn balance(&self, account: &AccountId) -> i64 {
        match self.balances.get(account) {
            Some(balance) => *balance,
            None => self.base.balance(account),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::block::{append_candidate, MinerContext};

    fn account(name: &str) -> AccountId {
        AccountId::new(name).unwrap()
    }

    fn transfer(from: &AccountId, to: &AccountId, amount: u64) -> Transaction {
        Transaction::transfer(from.clone(), to.clone(), Credits::new(amount), "test")
    }

    fn chain_with(blocks: Vec<Vec<Transaction>>) -> Vec<Block> {
        let mut chain = vec![Block::genesis()];
        for txs in blocks {
            let next = append_candidate(&chain, txs, &MinerContext::now()).unwrap();
            chain.push(next);
        }
        chain
    }

    #[test]
    fn test_unseen_account_is_zero() {
        let ledger = BalanceLedger::new();
        assert_eq!(ledger.balance(&account("nobody")), 0);
    }

    #[test]
    fn test_recompute_replays_in_order() {
        let system = AccountId::system();
        let alice = account("dr_alice");
        let bob = account("lab_tech_bob");

        let chain = chain_with(vec![
            vec![transfer(&system, &alice, 500)],
            vec![transfer(&alice, &bob, 100)],
        ]);

        let ledger = BalanceLedger::recompute_from_chain(&chain).unwrap();
        assert_eq!(ledger.balance(&alice), 400);
        assert_eq!(ledger.balance(&bob), 100);
        assert_eq!(ledger.balance(&system), -500);
    }

    #[test]
    fn test_transfers_conserve_value() {
        let system = AccountId::system();
        let alice = account("dr_alice");
        let bob = account("lab_tech_bob");
        let charlie = account("pharm_charlie");

        let chain = chain_with(vec![
            vec![transfer(&system, &alice, 500), transfer(&system, &charlie, 700)],
            vec![transfer(&alice, &bob, 100), transfer(&charlie, &bob, 250)],
            vec![transfer(&bob, &alice, 50)],
        ]);

        let ledger = BalanceLedger::recompute_from_chain(&chain).unwrap();
        assert_eq!(ledger.total(), 0);
    }

    #[test]
    fn test_system_issuance_beyond_i64_range_is_refused() {
        let system = AccountId::system();
        let alice = account("dr_alice");
        let max = i64::MAX as u64;

        let chain = chain_with(vec![vec![transfer(&system, &alice, max)]]);
        let ledger = BalanceLedger::recompute_from_chain(&chain).unwrap();
        assert_eq!(ledger.total(), 0);

        // A second issuance would push SYSTEM below i64::MIN and alice above i64::MAX
        let overflowing = chain_with(vec![
            vec![transfer(&system, &alice, max)],
            vec![transfer(&system, &alice, max)],
        ]);
        assert!(matches!(
            BalanceLedger::recompute_from_chain(&overflowing),
            Err(LedgerError::InvalidChain(_))
        ));
        assert!(matches!(
            BalanceLedger::replay_checked(&overflowing),
            Err(LedgerError::InvalidChain(_))
        ));

        let mut partial = BalanceLedger::recompute_from_chain(&overflowing[..2]).unwrap();
        let before = partial.clone();
        assert!(partial.apply_block(&overflowing[2]).is_err());
        assert_eq!(partial, before);
    }

    #[test]
    fn test_overlay_refuses_overflow() {
        let system = AccountId::system();
        let alice = account("dr_alice");
        let max = i64::MAX as u64;

        let ledger = BalanceLedger::new();
        let mut overlay = BalanceOverlay::new(&ledger);
        overlay.apply(&transfer(&system, &alice, max)).unwrap();
        assert!(overlay.apply(&transfer(&system, &alice, max)).is_err());
        assert_eq!(overlay.balance(&alice), i64::MAX);
        assert_eq!(overlay.balance(&system), -i64::MAX);
    }

    #[test]
    fn test_incremental_matches_full_replay() {
        let system = AccountId::system();
        let alice = account("dr_alice");
        let bob = account("lab_tech_bob");

        let chain = chain_with(vec![
            vec![transfer(&system, &alice, 500)],
            vec![transfer(&alice, &bob, 200)],
        ]);

        let mut incremental = BalanceLedger::recompute_from_chain(&chain[..2]).unwrap();
        incremental.apply_block(&chain[2]).unwrap();

        assert_eq!(incremental, BalanceLedger::recompute_from_chain(&chain).unwrap());
    }

    #[test]
    fn test_replay_checked_rejects_overdraft() {
        let alice = account("dr_alice");
        let bob = account("lab_tech_bob");

        let chain = chain_with(vec![vec![transfer(&alice, &bob, 1)]]);

        let err = BalanceLedger::replay_checked(&chain).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { available: 0, .. }));
    }

    #[test]
    fn test_replay_checked_counts_earlier_transfers_in_block() {
        let system = AccountId::system();
        let alice = account("dr_alice");
        let bob = account("lab_tech_bob");

        let ok = chain_with(vec![vec![
            transfer(&system, &alice, 100),
            transfer(&alice, &bob, 100),
        ]]);
        assert!(BalanceLedger::replay_checked(&ok).is_ok());

        let overdrawn = chain_with(vec![vec![
            transfer(&system, &alice, 100),
            transfer(&alice, &bob, 60),
            transfer(&alice, &bob, 60),
        ]]);
        assert!(BalanceLedger::replay_checked(&overdrawn).is_err());
    }

    #[test]
    fn test_apply_block_checked_is_atomic() {
        let system = AccountId::system();
        let alice = account("dr_alice");
        let bob = account("lab_tech_bob");

        let chain = chain_with(vec![vec![transfer(&system, &alice, 50)]]);
        let mut ledger = BalanceLedger::recompute_from_chain(&chain).unwrap();
        let before = ledger.clone();

        let bad = append_candidate(
            &chain,
            vec![transfer(&system, &bob, 10), transfer(&alice, &bob, 80)],
            &MinerContext::now(),
        )
        .unwrap();

        assert!(ledger.apply_block_checked(&bad).is_err());
        assert_eq!(ledger, before);
    }

    #[test]
    fn test_system_account_may_overdraw() {
        let ledger = BalanceLedger::new();
        assert!(ledger.can_spend(&AccountId::system(), Credits::new(1_000_000)));
        assert!(!ledger.can_spend(&account("dr_alice"), Credits::new(1)));
    }

    #[test]
    fn test_overlay_accumulates() {
        let system = AccountId::system();
        let alice = account("dr_alice");
        let bob = account("lab_tech_bob");

        let chain = chain_with(vec![vec![transfer(&system, &alice, 100)]]);
        let ledger = BalanceLedger::recompute_from_chain(&chain).unwrap();

        let mut overlay = BalanceOverlay::new(&ledger);
        overlay.apply(&transfer(&alice, &bob, 70)).unwrap();

        assert_eq!(overlay.balance(&alice), 30);
        assert_eq!(overlay.balance(&bob), 70);
        assert!(!overlay.can_spend(&alice, Credits::new(70)));
        assert_eq!(ledger.balance(&alice), 100);
    }
}
