/// API request handlers

use super::responses::*;
use careledger_common::LedgerError;
use careledger_core::{
    is_valid_chain, Node, NodeStats, PeerSummary, SyncReport, Transaction, TransactionKind,
    WorkflowAction, WorkflowOutcome,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub node: Arc<Node>,
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    debug!("API: GET /health");
    (StatusCode::OK, "OK")
}

/// Handler for GET /api/chain
pub async fn get_chain(State(state): State<AppState>) -> Json<ChainResponse> {
    debug!("API: GET /api/chain");

    let blocks = state.node.get_chain().await;
    Json(ChainResponse {
        length: blocks.len(),
        valid: is_valid_chain(&blocks),
        blocks,
    })
}

/// Handler for GET /api/balances
pub async fn get_balances(State(state): State<AppState>) -> Json<BalancesResponse> {
    debug!("API: GET /api/balances");
    Json(BalancesResponse::from_ledger(state.node.get_balances().await))
}

/// Handler for POST /api/balances/recalculate
pub async fn recalculate_balances(
    State(state): State<AppState>,
) -> Result<Json<BalancesResponse>, AppError> {
    debug!("API: POST /api/balances/recalculate");
    let balances = state.node.recalc_balances().await?;
    Ok(Json(BalancesResponse::from_ledger(balances)))
}

/// Handler for GET /api/pending
pub async fn get_pending(State(state): State<AppState>) -> Json<PendingResponse> {
    debug!("API: GET /api/pending");

    let transactions = state.node.get_pending_transactions().await;
    Json(PendingResponse {
        count: transactions.len(),
        transactions,
    })
}

/// Handler for POST /api/transactions
///
/// The body is a transaction kind, tagged by `type`; id and timestamp are
/// assigned here.
pub async fn submit_transaction(
    State(state): State<AppState>,
    Json(kind): Json<TransactionKind>,
) -> Result<(StatusCode, Json<SubmitResponse>), AppError> {
    debug!("API: POST /api/transactions ({})", kind.kind_name());

    let tx = state.node.submit_transaction(Transaction::new(kind)).await?;
    Ok((
        StatusCode::CREATED,
        Json(SubmitResponse {
            id: tx.id.to_string(),
            kind: tx.kind.kind_name().to_string(),
        }),
    ))
}

/// Handler for POST /api/mine
pub async fn mine(State(state): State<AppState>) -> Result<Json<MineResponse>, AppError> {
    debug!("API: POST /api/mine");

    let mined = state.node.mine().await?;
    Ok(Json(MineResponse {
        index: mined.block.index,
        hash: mined.block.hash.to_string(),
        transactions: mined.block.transaction_count(),
        rewards_queued: mined.rewards.len(),
    }))
}

/// Handler for POST /api/sync
pub async fn request_sync(State(state): State<AppState>) -> Json<SyncReport> {
    debug!("API: POST /api/sync");
    Json(state.node.request_sync().await)
}

/// Handler for GET /api/peers
pub async fn list_peers(State(state): State<AppState>) -> Json<PeersResponse<PeerSummary>> {
    debug!("API: GET /api/peers");

    let peers = state.node.list_peers().await;
    Json(PeersResponse {
        count: peers.len(),
        peers,
    })
}

/// Handler for POST /api/peers
pub async fn connect_peer(
    State(state): State<AppState>,
    Json(request): Json<ConnectRequest>,
) -> Result<StatusCode, AppError> {
    debug!("API: POST /api/peers ({})", request.address);

    state.node.connect_peer(&request.address).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for GET /api/status
pub async fn get_status(State(state): State<AppState>) -> Json<NodeStats> {
    debug!("API: GET /api/status");
    Json(state.node.stats().await)
}

/// Handler for GET /api/patients/:id/history
pub async fn patient_history(
    State(state): State<AppState>,
    Path(patient_id): Path<String>,
) -> Json<HistoryResponse> {
    debug!("API: GET /api/patients/{}/history", patient_id);

    let entries = state.node.patient_history(&patient_id).await;
    Json(HistoryResponse {
        patient_id,
        entries,
    })
}

async fn perform(
    state: &AppState,
    action: WorkflowAction,
) -> Result<(StatusCode, Json<WorkflowOutcome>), AppError> {
    debug!("API: workflow {}", action.name());
    let outcome = state.node.perform(action).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// Handler for POST /api/workflow/register
pub async fn register_patient(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<WorkflowOutcome>), AppError> {
    perform(
        &state,
        WorkflowAction::Register {
            patient_name: request.patient_name,
        },
    )
    .await
}

/// Handler for POST /api/workflow/consult
pub async fn consult(
    State(state): State<AppState>,
    Json(request): Json<ConsultRequest>,
) -> Result<(StatusCode, Json<WorkflowOutcome>), AppError> {
    perform(
        &state,
        WorkflowAction::Consult {
            patient_id: request.patient_id,
            notes: request.notes,
            order_test: request.order_test,
        },
    )
    .await
}

/// Handler for POST /api/workflow/test
pub async fn perform_test(
    State(state): State<AppState>,
    Json(request): Json<TestRequest>,
) -> Result<(StatusCode, Json<WorkflowOutcome>), AppError> {
    perform(
        &state,
        WorkflowAction::PerformTest {
            patient_id: request.patient_id,
            test_name: request.test_name,
            results: request.results,
        },
    )
    .await
}

/// Handler for POST /api/workflow/prescribe
pub async fn prescribe(
    State(state): State<AppState>,
    Json(request): Json<PrescribeRequest>,
) -> Result<(StatusCode, Json<WorkflowOutcome>), AppError> {
    perform(
        &state,
        WorkflowAction::Prescribe {
            patient_id: request.patient_id,
            medication: request.medication,
            dosage: request.dosage,
        },
    )
    .await
}

/// Handler for POST /api/workflow/fill
pub async fn fill_prescription(
    State(state): State<AppState>,
    Json(request): Json<FillRequest>,
) -> Result<(StatusCode, Json<WorkflowOutcome>), AppError> {
    perform(
        &state,
        WorkflowAction::Fill {
            patient_id: request.patient_id,
        },
    )
    .await
}

/// Application error type
#[derive(Debug)]
pub struct AppError {
    message: String,
    status_code: StatusCode,
}

impl AppError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status_code.is_server_error() {
            error!("API Error: {}", self.message);
        } else {
            warn!("API request refused: {}", self.message);
        }

        let body = Json(ErrorResponse::new(self.message, self.status_code.as_u16()));
        (self.status_code, body).into_response()
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        let status_code = match &err {
            LedgerError::MalformedMessage(_) => StatusCode::BAD_REQUEST,
            LedgerError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            LedgerError::DuplicateTransaction(_)
            | LedgerError::ChainNotLonger { .. }
            | LedgerError::NothingToMine => StatusCode::CONFLICT,
            LedgerError::InsufficientBalance { .. } | LedgerError::InvalidChain(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            LedgerError::PeerUnreachable(_) => StatusCode::BAD_GATEWAY,
            LedgerError::ChainEmpty => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            message: err.to_string(),
            status_code,
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}
