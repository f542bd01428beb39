use super::{Capabilities, WorkflowOutcome};
use crate::consensus::{BalanceView, LedgerState, Transaction, TransactionId, TransactionKind};
use careledger_common::{ledger, AccountId, Credits, LedgerError, Role};
use std::collections::{BTreeMap, HashSet};
use tracing::warn;

/// Strategy for the operator's configured role
pub fn capabilities_for(role: Role, account: AccountId) -> Box<dyn Capabilities> {
    match role {
        Role::Clinician => Box::new(Clinician::new(account)),
        Role::Lab => Box::new(Lab::new(account)),
        Role::Pharmacy => Box::new(Pharmacy::new(account)),
    }
}

fn new_patient_id() -> String {
    use rand::Rng;
    let bytes: [u8; 8] = rand::thread_rng().gen();
    format!("pt-{}", hex::encode(bytes))
}

/// Registers patients, consults, reviews results and prescribes
#[derive(Debug, Clone)]
pub struct Clinician {
    account: AccountId,
}

impl Clinician {
    pub fn new(account: AccountId) -> Self {
        Self { account }
    }

    /// The lab that produced the patient's most recent test result
    fn reviewed_lab(state: &LedgerState, patient_id: &str) -> Option<AccountId> {
        state
            .patient_history(patient_id)
            .into_iter()
            .rev()
            .find_map(|entry| match entry.transaction.kind {
                TransactionKind::TestResult { performed_by, .. } => Some(performed_by),
                _ => None,
            })
    }
}

impl Capabilities for Clinician {
    fn role(&self) -> Role {
        Role::Clinician
    }

    fn account(&self) -> &AccountId {
        &self.account
    }

    fn register(&self, _state: &LedgerState, patient_name: &str) -> Result<WorkflowOutcome, LedgerError> {
        let patient_id = new_patient_id();
        let tx = Transaction::new(TransactionKind::Registration {
            patient_id: patient_id.clone(),
            patient_name: patient_name.to_string(),
            registered_by: self.account.clone(),
        });
        Ok(WorkflowOutcome::single(&patient_id, tx))
    }

    fn consult(
        &self,
        _state: &LedgerState,
        patient_id: &str,
        notes: &str,
        order_test: bool,
    ) -> Result<WorkflowOutcome, LedgerError> {
        let tests_ordered = if order_test {
            vec![ledger::DEFAULT_TEST.to_string()]
        } else {
            Vec::new()
        };
        let tx = Transaction::new(TransactionKind::Consultation {
            patient_id: patient_id.to_string(),
            doctor: self.account.clone(),
            notes: notes.to_string(),
            tests_ordered,
        });
        Ok(WorkflowOutcome::single(patient_id, tx))
    }

    /// Record the prescription and pay the reviewed lab for its report when
    /// the clinician's committed balance covers the fee
    fn prescribe(
        &self,
        state: &LedgerState,
        patient_id: &str,
        medication: &str,
        dosage: &str,
    ) -> Result<WorkflowOutcome, LedgerError> {
        let reviewed_lab = Self::reviewed_lab(state, patient_id);
        let prescription = Transaction::new(TransactionKind::Prescription {
            patient_id: patient_id.to_string(),
            prescribed_by: self.account.clone(),
            medication: medication.to_string(),
            dosage: dosage.to_string(),
            reviewed_lab: reviewed_lab.clone(),
        });
        let mut outcome = WorkflowOutcome::single(patient_id, prescription);

        let fee = Credits::new(ledger::LAB_REPORT_FEE);
        let balance = state.ledger().balance(&self.account);
        match reviewed_lab {
            None => outcome
                .notes
                .push("No lab result found to pay for; payment skipped".to_string()),
            Some(lab) if lab == self.account => outcome
                .notes
                .push("Reviewed result was recorded by the prescriber; payment skipped".to_string()),
            Some(lab) if state.ledger().can_spend(&self.account, fee) => {
                outcome.transactions.push(Transaction::transfer(
                    self.account.clone(),
                    lab,
                    fee,
                    "Payment for Lab Report Access",
                ));
            }
            Some(lab) => {
                warn!(
                    "{} has {} but owes {} to {}; payment skipped",
                    self.account, balance, fee, lab
                );
                outcome.notes.push(format!(
                    "Insufficient balance ({}) to pay {} to {}; payment skipped",
                    balance, fee, lab
                ));
            }
        }
        Ok(outcome)
    }
}

/// Records diagnostic test results
#[derive(Debug, Clone)]
pub struct Lab {
    account: AccountId,
}

impl Lab {
    pub fn new(account: AccountId) -> Self {
        Self { account }
    }
}

impl Capabilities for Lab {
    fn role(&self) -> Role {
        Role::Lab
    }

    fn account(&self) -> &AccountId {
        &self.account
    }

    fn perform_test(
        &self,
        _state: &LedgerState,
        patient_id: &str,
        test_name: &str,
        results: BTreeMap<String, String>,
    ) -> Result<WorkflowOutcome, LedgerError> {
        let tx = Transaction::new(TransactionKind::TestResult {
            patient_id: patient_id.to_string(),
            test_name: test_name.to_string(),
            performed_by: self.account.clone(),
            results,
        });
        Ok(WorkflowOutcome::single(patient_id, tx))
    }
}

/// Dispenses prescribed medication
#[derive(Debug, Clone)]
pub struct Pharmacy {
    account: AccountId,
}

impl Pharmacy {
    pub fn new(account: AccountId) -> Self {
        Self { account }
    }

    /// Latest prescription for the patient with no fill committed or pending
    fn latest_unfilled(state: &LedgerState, patient_id: &str) -> Option<TransactionId> {
        let history = state.patient_history(patient_id);

        let committed = history.iter().map(|entry| &entry.transaction);
        let pending = state
            .pool()
            .pending()
            .iter()
            .filter(|tx| tx.patient_id() == Some(patient_id));
        let filled: HashSet<TransactionId> = committed
            .chain(pending)
            .filter_map(|tx| match &tx.kind {
                TransactionKind::PrescriptionFilled { prescription_id, .. } => Some(*prescription_id),
                _ => None,
            })
            .collect();

        history
            .iter()
            .rev()
            .filter(|entry| matches!(entry.transaction.kind, TransactionKind::Prescription { .. }))
            .map(|entry| entry.transaction.id)
            .find(|id| !filled.contains(id))
    }
}

impl Capabilities for Pharmacy {
    fn role(&self) -> Role {
        Role::Pharmacy
    }

    fn account(&self) -> &AccountId {
        &self.account
    }

    fn fill(&self, state: &LedgerState, patient_id: &str) -> Result<WorkflowOutcome, LedgerError> {
        let prescription_id = Self::latest_unfilled(state, patient_id).ok_or_else(|| {
            LedgerError::malformed(format!("no unfilled prescription for patient {}", patient_id))
        })?;

        let tx = Transaction::new(TransactionKind::PrescriptionFilled {
            patient_id: patient_id.to_string(),
            filled_by: self.account.clone(),
            prescription_id,
        });
        Ok(WorkflowOutcome::single(patient_id, tx))
    }
}
