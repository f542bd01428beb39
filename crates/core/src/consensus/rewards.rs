use super::block::{Block, Blockchain};
use super::transaction::{Transaction, TransactionId, TransactionKind};
use careledger_common::{ledger, AccountId, Credits};
use tracing::debug;

const LAB_TEST_REWARD_DOMAIN: &str = "careledger/reward/lab-test";
const FILL_REWARD_DOMAIN: &str = "careledger/reward/prescription-fill";

/// System transfers earned by the events in `block`
///
/// `chain` must already contain `block`. Reward ids and timestamps are derived
/// from the triggering transaction and the block, so every node that sees the
/// block produces byte-identical rewards.
pub fn rewards_for_block(chain: &Blockchain, block: &Block) -> Vec<Transaction> {
    block
        .transactions
        .iter()
        .filter_map(|tx| reward_for(chain, block, tx))
        .collect()
}

fn reward_for(chain: &Blockchain, block: &Block, tx: &Transaction) -> Option<Transaction> {
    match &tx.kind {
        TransactionKind::TestResult {
            patient_id,
            test_name,
            ..
        } => {
            let doctor = ordering_doctor(chain, block.index, patient_id, test_name)?;
            debug!(
                "Lab test reward for {} ({}) in block {}",
                doctor, test_name, block.index
            );
            Some(system_transfer(
                TransactionId::derived(tx.id, LAB_TEST_REWARD_DOMAIN),
                block,
                doctor,
                ledger::LAB_TEST_REWARD,
                format!("Reward for lab test order ({})", test_name),
            ))
        }
        TransactionKind::PrescriptionFilled {
            patient_id,
            prescription_id,
            ..
        } => {
            let prescriber = prescriber_of(chain, patient_id, prescription_id)?;
            debug!(
                "Prescription fill reward for {} in block {}",
                prescriber, block.index
            );
            Some(system_transfer(
                TransactionId::derived(tx.id, FILL_REWARD_DOMAIN),
                block,
                prescriber,
                ledger::PRESCRIPTION_FILL_REWARD,
                "Reward for prescription fill".to_string(),
            ))
        }
        _ => None,
    }
}

/// Most recent consultation up to `up_to_index` that ordered `test_name`
fn ordering_doctor(
    chain: &Blockchain,
    up_to_index: u64,
    patient_id: &str,
    test_name: &str,
) -> Option<AccountId> {
    chain
        .patient_history(patient_id)
        .into_iter()
        .rev()
        .filter(|entry| entry.block_index <= up_to_index)
        .find_map(|entry| match entry.transaction.kind {
            TransactionKind::Consultation {
                doctor,
                tests_ordered,
                ..
            } if tests_ordered.iter().any(|t| t == test_name) => Some(doctor),
            _ => None,
        })
}

fn prescriber_of(
    chain: &Blockchain,
    patient_id: &str,
    prescription_id: &TransactionId,
) -> Option<AccountId> {
    let (_, tx) = chain.find_transaction(prescription_id)?;
    match &tx.kind {
        TransactionKind::Prescription {
            patient_id: prescribed_for,
            prescribed_by,
            ..
        } if prescribed_for == patient_id => Some(prescribed_by.clone()),
        _ => None,
    }
}

fn system_transfer(
    id: TransactionId,
    block: &Block,
    to: AccountId,
    amount: u64,
    reason: String,
) -> Transaction {
    Transaction::with_id(
        id,
        TransactionKind::Transfer {
            from: AccountId::system(),
            to,
            amount: Credits::new(amount),
            reason,
        },
        block.timestamp,
    )
}
