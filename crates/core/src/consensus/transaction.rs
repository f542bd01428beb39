use careledger_common::{AccountId, Credits, LedgerError, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// A recorded healthcare event or value transfer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    /// Unique transaction ID
    pub id: TransactionId,

    /// Transaction kind and kind-specific payload
    pub kind: TransactionKind,

    /// When the transaction was created
    pub timestamp: Timestamp,
}

impl Transaction {
    pub fn new(kind: TransactionKind) -> Self {
        Self {
            id: TransactionId::generate(),
            kind,
            timestamp: Timestamp::now(),
        }
    }

    /// Build a transaction with a caller-chosen id and timestamp
    pub fn with_id(id: TransactionId, kind: TransactionKind, timestamp: Timestamp) -> Self {
        Self { id, kind, timestamp }
    }

    pub fn transfer(
        from: AccountId,
        to: AccountId,
        amount: Credits,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(TransactionKind::Transfer {
            from,
            to,
            amount,
            reason: reason.into(),
        })
    }

    /// Sender, recipient and amount when this is a transfer
    pub fn as_transfer(&self) -> Option<(&AccountId, &AccountId, Credits)> {
        match &self.kind {
            TransactionKind::Transfer { from, to, amount, .. } => Some((from, to, *amount)),
            _ => None,
        }
    }

    /// Patient this event concerns, if any
    pub fn patient_id(&self) -> Option<&str> {
        match &self.kind {
            TransactionKind::Registration { patient_id, .. }
            | TransactionKind::Consultation { patient_id, .. }
            | TransactionKind::TestResult { patient_id, .. }
            | TransactionKind::Prescription { patient_id, .. }
            | TransactionKind::PrescriptionFilled { patient_id, .. } => Some(patient_id),
            TransactionKind::Transfer { .. } => None,
        }
    }

    /// Reject transactions that can never be valid regardless of ledger state
    pub fn validate_structure(&self) -> Result<(), LedgerError> {
        if let Some(patient) = self.patient_id() {
            if patient.trim().is_empty() {
                return Err(LedgerError::malformed(format!(
                    "{} without patient id",
                    self.kind.kind_name()
                )));
            }
        }

        match &self.kind {
            TransactionKind::Transfer { from, to, amount, .. } => {
                if amount.is_zero() {
                    return Err(LedgerError::malformed("transfer of zero credits"));
                }
                if *amount > Credits::MAX {
                    return Err(LedgerError::malformed(format!(
                        "transfer of {} exceeds the {} limit",
                        amount,
                        Credits::MAX
                    )));
                }
                if from == to {
                    return Err(LedgerError::malformed(format!(
                        "transfer from {} to itself",
                        from
                    )));
                }
            }
            TransactionKind::Registration { patient_name, .. } if patient_name.trim().is_empty() => {
                return Err(LedgerError::malformed("registration without patient name"));
            }
            TransactionKind::TestResult { test_name, .. } if test_name.trim().is_empty() => {
                return Err(LedgerError::malformed("test result without test name"));
            }
            _ => {}
        }

        Ok(())
    }
}

/// Unique transaction identifier, shown and serialized as 16 hex digits
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TransactionId(pub u64);

impl TransactionId {
    pub fn generate() -> Self {
        use rand::Rng;
        Self(rand::thread_rng().gen())
    }

    /// Derive an id from another transaction's id so every node computes the same value
    pub fn derived(parent: TransactionId, domain: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(domain.as_bytes());
        hasher.update(&parent.0.to_le_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest.as_bytes()[..8]);
        Self(u64::from_le_bytes(bytes))
    }

    #[cfg(test)]
    pub(crate) fn from_u64(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s.trim(), 16)
            .map(Self)
            .map_err(|_| LedgerError::malformed(format!("invalid transaction id {:?}", s)))
    }
}

impl TryFrom<String> for TransactionId {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TransactionId> for String {
    fn from(value: TransactionId) -> Self {
        value.to_string()
    }
}

/// Kinds of events recorded on the ledger
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    /// New patient enrolled by a clinician
    Registration {
        patient_id: String,
        patient_name: String,
        registered_by: AccountId,
    },

    /// Clinician consultation, optionally ordering lab tests
    Consultation {
        patient_id: String,
        doctor: AccountId,
        notes: String,
        tests_ordered: Vec<String>,
    },

    /// Lab test outcome
    TestResult {
        patient_id: String,
        test_name: String,
        performed_by: AccountId,
        results: BTreeMap<String, String>,
    },

    /// Medication prescribed after reviewing results
    Prescription {
        patient_id: String,
        prescribed_by: AccountId,
        medication: String,
        dosage: String,
        reviewed_lab: Option<AccountId>,
    },

    /// Pharmacy dispensed a prescription
    PrescriptionFilled {
        patient_id: String,
        filled_by: AccountId,
        prescription_id: TransactionId,
    },

    /// E-cash movement between accounts
    Transfer {
        from: AccountId,
        to: AccountId,
        amount: Credits,
        reason: String,
    },
}

impl TransactionKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Registration { .. } => "registration",
            Self::Consultation { .. } => "consultation",
            Self::TestResult { .. } => "test_result",
            Self::Prescription { .. } => "prescription",
            Self::PrescriptionFilled { .. } => "prescription_filled",
            Self::Transfer { .. } => "transfer",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(name: &str) -> AccountId {
        AccountId::new(name).unwrap()
    }

    #[test]
    fn test_transaction_id_generation() {
        let id1 = TransactionId::generate();
        let id2 = TransactionId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_derived_id_is_deterministic() {
        let parent = TransactionId::from_u64(42);
        assert_eq!(
            TransactionId::derived(parent, "reward"),
            TransactionId::derived(parent, "reward")
        );
        assert_ne!(
            TransactionId::derived(parent, "reward"),
            TransactionId::derived(parent, "fee")
        );
    }

    #[test]
    fn test_transaction_id_hex_display() {
        let id = TransactionId::from_u64(0xabc);
        assert_eq!(id.to_string(), "0000000000000abc");
        assert_eq!("0000000000000abc".parse::<TransactionId>().unwrap(), id);
        assert!("not-hex".parse::<TransactionId>().is_err());
    }

    #[test]
    fn test_transfer_accessors() {
        let tx = Transaction::transfer(account("dr_alice"), account("lab_tech_bob"), Credits::new(100), "report");
        let (from, to, amount) = tx.as_transfer().unwrap();
        assert_eq!(from.as_str(), "dr_alice");
        assert_eq!(to.as_str(), "lab_tech_bob");
        assert_eq!(amount, Credits::new(100));
        assert!(tx.patient_id().is_none());
    }

    #[test]
    fn test_zero_transfer_is_malformed() {
        let tx = Transaction::transfer(account("dr_alice"), account("lab_tech_bob"), Credits::ZERO, "");
        assert!(matches!(
            tx.validate_structure(),
            Err(LedgerError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_self_transfer_is_malformed() {
        let tx = Transaction::transfer(account("dr_alice"), account("dr_alice"), Credits::new(5), "");
        assert!(tx.validate_structure().is_err());
    }

    #[test]
    fn test_event_requires_patient() {
        let tx = Transaction::new(TransactionKind::Consultation {
            patient_id: " ".to_string(),
            doctor: account("dr_alice"),
            notes: String::new(),
            tests_ordered: vec![],
        });
        assert!(tx.validate_structure().is_err());
    }

    #[test]
    fn test_json_uses_type_tag() {
        let tx = Transaction::new(TransactionKind::Registration {
            patient_id: "p-1".to_string(),
            patient_name: "Jane Doe".to_string(),
            registered_by: account("dr_alice"),
        });

        let value = serde_json::to_value(&tx).unwrap();
        assert_eq!(value["kind"]["type"], "REGISTRATION");
        assert_eq!(value["id"], tx.id.to_string());

        let back: Transaction = serde_json::from_value(value).unwrap();
        assert_eq!(back, tx);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let json = r#"{"id":"0000000000000001","kind":{"type":"MINT","amount":5},"timestamp":0}"#;
        assert!(serde_json::from_str::<Transaction>(json).is_err());
    }
}
