/// API Server implementation

use super::handlers::*;
use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use careledger_core::Node;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

/// HTTP front end for one ledger node
pub struct ApiServer {
    listen_addr: SocketAddr,
    node: Arc<Node>,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(listen_addr: SocketAddr, node: Arc<Node>) -> Self {
        Self { listen_addr, node }
    }

    /// Start the API server
    pub async fn start(self) -> Result<()> {
        let app = router(self.node);

        info!("API server starting on {}", self.listen_addr);

        let listener = tokio::net::TcpListener::bind(self.listen_addr).await?;

        axum::serve(listener, app)
            .await
            .map_err(|e| anyhow::anyhow!("API server error: {}", e))?;

        Ok(())
    }
}

/// Build the router with all endpoints
pub fn router(node: Arc<Node>) -> Router {
    let state = AppState { node };

    Router::new()
        .route("/health", get(health_check))
        // Ledger
        .route("/api/chain", get(get_chain))
        .route("/api/balances", get(get_balances))
        .route("/api/balances/recalculate", post(recalculate_balances))
        .route("/api/pending", get(get_pending))
        .route("/api/transactions", post(submit_transaction))
        .route("/api/mine", post(mine))
        // Network
        .route("/api/sync", post(request_sync))
        .route("/api/peers", get(list_peers).post(connect_peer))
        .route("/api/status", get(get_status))
        // Patients
        .route("/api/patients/:id/history", get(patient_history))
        .route("/api/workflow/register", post(register_patient))
        .route("/api/workflow/consult", post(consult))
        .route("/api/workflow/test", post(perform_test))
        .route("/api/workflow/prescribe", post(prescribe))
        .route("/api/workflow/fill", post(fill_prescription))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
