use super::block::Blockchain;
use super::ledger::{BalanceOverlay, BalanceView};
use super::transaction::{Transaction, TransactionId};
use careledger_common::LedgerError;
use std::collections::HashSet;
use tracing::debug;

/// Transactions known to this node but not yet in any block of its chain
#[derive(Debug, Clone, Default)]
pub struct TransactionPool {
    /// Admission order
    pending: Vec<Transaction>,

    ids: HashSet<TransactionId>,
}

impl TransactionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a transaction after structural, duplicate and balance checks
    pub fn submit<V: BalanceView + ?Sized>(
        &mut self,
        tx: Transaction,
        chain: &Blockchain,
        ledger: &V,
    ) -> Result<Transaction, LedgerError> {
        tx.validate_structure()?;

        if self.ids.contains(&tx.id) || chain.contains_transaction(&tx.id) {
            return Err(LedgerError::DuplicateTransaction(tx.id.to_string()));
        }

        if let Some((from, _, amount)) = tx.as_transfer() {
            ledger.check_spend(from, amount)?;
        }

        self.ids.insert(tx.id);
        self.pending.push(tx.clone());
        Ok(tx)
    }

    /// Pending transactions that can go into the next block, in admission order
    ///
    /// Transfers are checked against a running overlay so two transfers that are
    /// each affordable but not together only yield the first. Skipped entries stay
    /// pending.
    pub fn drain_minable<V: BalanceView + ?Sized>(&self, ledger: &V) -> Vec<Transaction> {
        let mut overlay = BalanceOverlay::new(ledger);
        let mut minable = Vec::with_capacity(self.pending.len());

        for tx in &self.pending {
            if let Some((from, _, amount)) = tx.as_transfer() {
                if !overlay.can_spend(from, amount) {
                    debug!("Skipping transfer {} from {}: insufficient funds", tx.id, from);
                    continue;
                }
            }
            if let Err(e) = overlay.apply(tx) {
                debug!("Skipping transfer {}: {}", tx.id, e);
                continue;
            }
            minable.push(tx.clone());
        }

        minable
    }

    /// Drop committed transactions
    pub fn remove<'a>(&mut self, ids: impl IntoIterator<Item = &'a TransactionId>) -> usize {
        let ids: HashSet<TransactionId> = ids
            .into_iter()
            .filter(|id| self.ids.contains(*id))
            .copied()
            .collect();
        if ids.is_empty() {
            return 0;
        }

        self.pending.retain(|tx| !ids.contains(&tx.id));
        for id in &ids {
            self.ids.remove(id);
        }
        ids.len()
    }

    /// Bring the pool in line with a replacement chain
    ///
    /// Remaining transfers are re-validated in admission order, each against
    /// the new balances plus the transfers kept before it. Returns the
    /// transactions dropped as no longer affordable; committed ones are
    /// removed silently.
    pub fn reconcile<V: BalanceView + ?Sized>(
        &mut self,
        chain: &Blockchain,
        ledger: &V,
    ) -> Vec<Transaction> {
        let mut overlay = BalanceOverlay::new(ledger);
        let mut dropped = Vec::new();
        let mut kept = Vec::with_capacity(self.pending.len());

        for tx in self.pending.drain(..) {
            if chain.contains_transaction(&tx.id) {
                continue;
            }
            let affordable = match tx.as_transfer() {
                Some((from, _, amount)) => overlay.can_spend(from, amount),
                None => true,
            };
            if affordable && overlay.apply(&tx).is_ok() {
                kept.push(tx);
            } else {
                dropped.push(tx);
            }
        }

        self.ids = kept.iter().map(|tx| tx.id).collect();
        self.pending = kept;
        dropped
    }

    pub fn contains(&self, id: &TransactionId) -> bool {
        self.ids.contains(id)
    }

    pub fn pending(&self) -> &[Transaction] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::block::{append_candidate, MinerContext};
    use crate::consensus::ledger::BalanceLedger;
    use crate::consensus::transaction::TransactionKind;
    use careledger_common::{AccountId, Credits};

    fn account(name: &str) -> AccountId {
        AccountId::new(name).unwrap()
    }

    fn transfer(from: &AccountId, to: &AccountId, amount: u64) -> Transaction {
        Transaction::transfer(from.clone(), to.clone(), Credits::new(amount), "test")
    }

    fn registration(patient: &str) -> Transaction {
        Transaction::new(TransactionKind::Registration {
            patient_id: patient.to_string(),
            patient_name: "Jane Doe".to_string(),
            registered_by: account("dr_alice"),
        })
    }

    /// Chain where dr_alice holds `funds`
    fn funded(funds: u64) -> (Blockchain, BalanceLedger) {
        let mut chain = Blockchain::new();
        if funds > 0 {
            let grant = transfer(&AccountId::system(), &account("dr_alice"), funds);
            let block = append_candidate(chain.blocks(), vec![grant], &MinerContext::now()).unwrap();
            chain.try_append(block).unwrap();
        }
        let ledger = BalanceLedger::recompute_from_chain(chain.blocks()).unwrap();
        (chain, ledger)
    }

    #[test]
    fn test_submit_accepts_event() {
        let (chain, ledger) = funded(0);
        let mut pool = TransactionPool::new();

        let tx = registration("p-1");
        let accepted = pool.submit(tx.clone(), &chain, &ledger).unwrap();

        assert_eq!(accepted, tx);
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&tx.id));
    }

    #[test]
    fn test_submit_rejects_pending_duplicate() {
        let (chain, ledger) = funded(0);
        let mut pool = TransactionPool::new();
        let tx = registration("p-1");

        pool.submit(tx.clone(), &chain, &ledger).unwrap();
        let err = pool.submit(tx, &chain, &ledger).unwrap_err();

        assert!(matches!(err, LedgerError::DuplicateTransaction(_)));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_submit_rejects_committed_duplicate() {
        let (chain, ledger) = funded(100);
        let mut pool = TransactionPool::new();
        let committed = chain.tip().transactions[0].clone();

        let err = pool.submit(committed, &chain, &ledger).unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateTransaction(_)));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_submit_rejects_overdraft() {
        let (chain, ledger) = funded(99);
        let mut pool = TransactionPool::new();
        let tx = transfer(&account("dr_alice"), &account("lab_tech_bob"), 100);

        let err = pool.submit(tx, &chain, &ledger).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { available: 99, .. }));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_submit_allows_exact_balance() {
        let (chain, ledger) = funded(500);
        let mut pool = TransactionPool::new();
        let tx = transfer(&account("dr_alice"), &account("lab_tech_bob"), 500);

        assert!(pool.submit(tx, &chain, &ledger).is_ok());
    }

    #[test]
    fn test_submit_exempts_system_account() {
        let (chain, ledger) = funded(0);
        let mut pool = TransactionPool::new();
        let reward = transfer(&AccountId::system(), &account("dr_alice"), 700);

        assert!(pool.submit(reward, &chain, &ledger).is_ok());
    }

    #[test]
    fn test_submit_rejects_malformed() {
        let (chain, ledger) = funded(100);
        let mut pool = TransactionPool::new();
        let tx = transfer(&account("dr_alice"), &account("lab_tech_bob"), 0);

        let err = pool.submit(tx, &chain, &ledger).unwrap_err();
        assert!(matches!(err, LedgerError::MalformedMessage(_)));
    }

    #[test]
    fn test_drain_skips_jointly_unaffordable_transfers() {
        let (chain, ledger) = funded(100);
        let mut pool = TransactionPool::new();
        let alice = account("dr_alice");
        let bob = account("lab_tech_bob");

        let first = transfer(&alice, &bob, 80);
        let second = transfer(&alice, &bob, 80);
        let event = registration("p-1");
        pool.submit(first.clone(), &chain, &ledger).unwrap();
        pool.submit(second.clone(), &chain, &ledger).unwrap();
        pool.submit(event.clone(), &chain, &ledger).unwrap();

        let minable = pool.drain_minable(&ledger);
        let ids: Vec<_> = minable.iter().map(|tx| tx.id).collect();
        assert_eq!(ids, vec![first.id, event.id]);

        // Skipped, not dropped
        assert!(pool.contains(&second.id));
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_drain_credits_earlier_transfers() {
        let (chain, ledger) = funded(0);
        let mut pool = TransactionPool::new();
        let alice = account("dr_alice");
        let bob = account("lab_tech_bob");

        pool.submit(transfer(&AccountId::system(), &bob, 300), &chain, &ledger)
            .unwrap();
        // bob's funds arrive inside the same drain
        let spend = transfer(&bob, &alice, 300);
        pool.pending.push(spend.clone());
        pool.ids.insert(spend.id);

        assert_eq!(pool.drain_minable(&ledger).len(), 2);
    }

    #[test]
    fn test_remove() {
        let (chain, ledger) = funded(0);
        let mut pool = TransactionPool::new();
        let a = registration("p-1");
        let b = registration("p-2");
        pool.submit(a.clone(), &chain, &ledger).unwrap();
        pool.submit(b.clone(), &chain, &ledger).unwrap();

        assert_eq!(pool.remove([a.id, TransactionId::generate()].iter()), 1);
        assert_eq!(pool.len(), 1);
        assert!(!pool.contains(&a.id));
        assert!(pool.contains(&b.id));
    }

    #[test]
    fn test_reconcile_drops_committed_and_unaffordable() {
        let (chain, ledger) = funded(200);
        let mut pool = TransactionPool::new();
        let alice = account("dr_alice");
        let bob = account("lab_tech_bob");

        let spend = transfer(&alice, &bob, 150);
        let committed = registration("p-1");
        let survivor = registration("p-2");
        pool.submit(spend.clone(), &chain, &ledger).unwrap();
        pool.submit(committed.clone(), &chain, &ledger).unwrap();
        pool.submit(survivor.clone(), &chain, &ledger).unwrap();

        // Replacement chain commits the registration and gives alice nothing
        let mut other = Blockchain::new();
        let block = append_candidate(other.blocks(), vec![committed.clone()], &MinerContext::now()).unwrap();
        other.try_append(block).unwrap();
        let fresh = BalanceLedger::recompute_from_chain(other.blocks()).unwrap();

        let dropped = pool.reconcile(&other, &fresh);

        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].id, spend.id);
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&survivor.id));
        assert!(!pool.contains(&committed.id));
    }

    #[test]
    fn test_reconcile_counts_kept_transfers_in_order() {
        let (chain, ledger) = funded(200);
        let mut pool = TransactionPool::new();
        let alice = account("dr_alice");
        let bob = account("lab_tech_bob");

        // Each is affordable alone, so both are admitted
        let first = transfer(&alice, &bob, 120);
        let second = transfer(&alice, &bob, 120);
        pool.submit(first.clone(), &chain, &ledger).unwrap();
        pool.submit(second.clone(), &chain, &ledger).unwrap();

        // Replacement chain funds alice with the same 200 through a different grant
        let mut other = Blockchain::new();
        let grant = transfer(&AccountId::system(), &alice, 200);
        let block = append_candidate(other.blocks(), vec![grant], &MinerContext::now()).unwrap();
        other.try_append(block).unwrap();
        let fresh = BalanceLedger::recompute_from_chain(other.blocks()).unwrap();

        let dropped = pool.reconcile(&other, &fresh);

        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].id, second.id);
        assert_eq!(pool.pending()[0].id, first.id);
        assert_eq!(pool.len(), 1);
    }
}
