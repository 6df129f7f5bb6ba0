//! Read-only status endpoint reporting which replica answered.
//!
//! Because the routing Service points at the leader, hitting this endpoint
//! through the Service shows who currently leads.

use std::net::SocketAddr;

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::identity::Identity;

#[derive(Clone)]
pub struct StatusState {
    pub identity: Identity,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub hostname: String,
}

async fn root_handler(State(state): State<StatusState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        hostname: state.identity.to_string(),
    })
}

pub fn create_router(state: StatusState) -> Router {
    Router::new().route("/", get(root_handler)).with_state(state)
}

/// Serve the status endpoint until `cancel` fires.
pub async fn serve(
    addr: SocketAddr,
    state: StatusState,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "status server listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            info!("status server shutting down");
        })
        .await?;

    Ok(())
}
