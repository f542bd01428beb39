/// Healthcare workflow actions
///
/// Operators act through a role. Each role is a `Capabilities` strategy that
/// turns a requested action into the ledger transactions recording it; the
/// node only ever talks to the trait.

mod roles;

pub use roles::{capabilities_for, Clinician, Lab, Pharmacy};

use crate::consensus::{LedgerState, Transaction};
use careledger_common::{ledger, AccountId, LedgerError, Role};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A workflow step requested by the node's operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WorkflowAction {
    Register {
        patient_name: String,
    },
    Consult {
        patient_id: String,
        #[serde(default)]
        notes: String,
        #[serde(default)]
        order_test: bool,
    },
    PerformTest {
        patient_id: String,
        #[serde(default)]
        test_name: Option<String>,
        #[serde(default)]
        results: BTreeMap<String, String>,
    },
    Prescribe {
        patient_id: String,
        medication: String,
        dosage: String,
    },
    Fill {
        patient_id: String,
    },
}

impl WorkflowAction {
    /// Build the transactions for this action as `actor`, reading the ledger
    /// for any history the action depends on
    pub fn plan(
        &self,
        actor: &dyn Capabilities,
        state: &LedgerState,
    ) -> Result<WorkflowOutcome, LedgerError> {
        match self {
            Self::Register { patient_name } => actor.register(state, non_empty(patient_name, "patient_name")?),
            Self::Consult {
                patient_id,
                notes,
                order_test,
            } => actor.consult(state, non_empty(patient_id, "patient_id")?, notes, *order_test),
            Self::PerformTest {
                patient_id,
                test_name,
                results,
            } => actor.perform_test(
                state,
                non_empty(patient_id, "patient_id")?,
                test_name.as_deref().unwrap_or(ledger::DEFAULT_TEST),
                results.clone(),
            ),
            Self::Prescribe {
                patient_id,
                medication,
                dosage,
            } => actor.prescribe(
                state,
                non_empty(patient_id, "patient_id")?,
                non_empty(medication, "medication")?,
                dosage,
            ),
            Self::Fill { patient_id } => actor.fill(state, non_empty(patient_id, "patient_id")?),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Consult { .. } => "consult",
            Self::PerformTest { .. } => "perform_test",
            Self::Prescribe { .. } => "prescribe",
            Self::Fill { .. } => "fill",
        }
    }
}

fn non_empty<'a>(value: &'a str, field: &str) -> Result<&'a str, LedgerError> {
    let value = value.trim();
    if value.is_empty() {
        Err(LedgerError::malformed(format!("{} must not be empty", field)))
    } else {
        Ok(value)
    }
}

/// Transactions produced by one workflow action
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkflowOutcome {
    /// Patient the action concerned, including freshly registered ones
    pub patient_id: Option<String>,
    pub transactions: Vec<Transaction>,
    /// Human-readable remarks, such as a skipped payment
    pub notes: Vec<String>,
}

impl WorkflowOutcome {
    pub fn single(patient_id: &str, tx: Transaction) -> Self {
        Self {
            patient_id: Some(patient_id.to_string()),
            transactions: vec![tx],
            notes: Vec::new(),
        }
    }
}

/// What an operator acting in a given role may record
///
/// Every action defaults to `PermissionDenied`; a role overrides the ones it
/// is allowed to perform.
pub trait Capabilities: Send + Sync {
    fn role(&self) -> Role;

    fn account(&self) -> &AccountId;

    fn register(&self, _state: &LedgerState, _patient_name: &str) -> Result<WorkflowOutcome, LedgerError> {
        Err(self.denied("register patients"))
    }

    fn consult(
        &self,
        _state: &LedgerState,
        _patient_id: &str,
        _notes: &str,
        _order_test: bool,
    ) -> Result<WorkflowOutcome, LedgerError> {
        Err(self.denied("record consultations"))
    }

    fn perform_test(
        &self,
        _state: &LedgerState,
        _patient_id: &str,
        _test_name: &str,
        _results: BTreeMap<String, String>,
    ) -> Result<WorkflowOutcome, LedgerError> {
        Err(self.denied("record test results"))
    }

    fn prescribe(
        &self,
        _state: &LedgerState,
        _patient_id: &str,
        _medication: &str,
        _dosage: &str,
    ) -> Result<WorkflowOutcome, LedgerError> {
        Err(self.denied("prescribe"))
    }

    fn fill(&self, _state: &LedgerState, _patient_id: &str) -> Result<WorkflowOutcome, LedgerError> {
        Err(self.denied("fill prescriptions"))
    }

    fn denied(&self, what: &str) -> LedgerError {
        LedgerError::permission_denied(format!("{} {} cannot {}", self.role(), self.account(), what))
    }
}
