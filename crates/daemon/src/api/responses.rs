/// API request and response types

use careledger_core::{Block, HistoryEntry, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Full chain as held by this node
#[derive(Debug, Serialize)]
pub struct ChainResponse {
    pub length: usize,
    pub valid: bool,
    pub blocks: Vec<Block>,
}

/// Balance of every account seen in a transfer
#[derive(Debug, Serialize, Deserialize)]
pub struct BalancesResponse {
    pub balances: BTreeMap<String, i64>,
    /// Always zero: every credit issued by the system account is owed by it
    pub total: i128,
}

impl BalancesResponse {
    pub fn from_ledger<K: ToString>(balances: BTreeMap<K, i64>) -> Self {
        let total = balances.values().map(|&balance| i128::from(balance)).sum();
        Self {
            balances: balances
                .into_iter()
                .map(|(account, balance)| (account.to_string(), balance))
                .collect(),
            total,
        }
    }
}

/// Transactions waiting to be mined
#[derive(Debug, Serialize)]
pub struct PendingResponse {
    pub count: usize,
    pub transactions: Vec<Transaction>,
}

/// Accepted transaction
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: String,
    pub kind: String,
}

/// Newly mined block
#[derive(Debug, Serialize, Deserialize)]
pub struct MineResponse {
    pub index: u64,
    pub hash: String,
    pub transactions: usize,
    /// System rewards the block earned, now pending
    pub rewards_queued: usize,
}

#[derive(Debug, Serialize)]
pub struct PeersResponse<P: Serialize> {
    pub count: usize,
    pub peers: Vec<P>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub patient_id: String,
    pub entries: Vec<HistoryEntry>,
}

/// Body of `POST /api/peers`
#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub address: String,
}

/// Body of `POST /api/workflow/register`
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub patient_name: String,
}

/// Body of `POST /api/workflow/consult`
#[derive(Debug, Deserialize)]
pub struct ConsultRequest {
    pub patient_id: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub order_test: bool,
}

/// Body of `POST /api/workflow/test`
#[derive(Debug, Deserialize)]
pub struct TestRequest {
    pub patient_id: String,
    pub test_name: Option<String>,
    #[serde(default)]
    pub results: BTreeMap<String, String>,
}

/// Body of `POST /api/workflow/prescribe`
#[derive(Debug, Deserialize)]
pub struct PrescribeRequest {
    pub patient_id: String,
    pub medication: String,
    #[serde(default)]
    pub dosage: String,
}

/// Body of `POST /api/workflow/fill`
#[derive(Debug, Deserialize)]
pub struct FillRequest {
    pub patient_id: String,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, status: u16) -> Self {
        Self {
            error: error.into(),
            status,
        }
    }
}
