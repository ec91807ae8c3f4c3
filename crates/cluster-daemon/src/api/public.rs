//! Endpoints other daemons call.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::{Extension, Json};
use axum::http::{HeaderMap, StatusCode, header};
use cluster_core::context::Cancelled;
use cluster_core::intent::JoinPlan;
use cluster_core::protocol::Identity;
use tracing::{info, warn};

use super::{ApiError, AppState};
use crate::tls::PeerCertificate;

/// Handler for `POST /1.0/session/join`
///
/// Every failure to authenticate answers with the same generic message.
pub async fn join_intent(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    state
        .intake
        .receive(&state.pairing.slot, authorization, &body)
        .await?;

    Ok(StatusCode::OK)
}

/// Handler for `GET /1.0/identity`
pub async fn identity(State(state): State<Arc<AppState>>) -> Json<Identity> {
    Json(state.pairing.identity.clone())
}

/// Handler for `PUT /1.0/services`
///
/// Only a peer whose TLS client certificate is trusted by the active
/// session may ask us to join. A successful join completes the session.
pub async fn join_services(
    State(state): State<Arc<AppState>>,
    Extension(peer): Extension<PeerCertificate>,
    Json(plan): Json<JoinPlan>,
) -> Result<StatusCode, ApiError> {
    let fingerprint = peer
        .fingerprint()
        .ok_or_else(|| ApiError::forbidden("Missing client certificate"))?;

    let session = state
        .pairing
        .slot
        .active()
        .ok_or_else(|| ApiError::bad_request("No active session"))?;

    let Some(peer) = session.trusted_name(&fingerprint) else {
        return Err(ApiError::forbidden("Client certificate is not trusted"));
    };

    info!(%peer, services = ?plan.services(), "Joining cluster on request of trusted peer");
    match state.handler.join(&state.ctx, &plan).await {
        Ok(()) => {
            state.pairing.slot.release(&session);
            info!(%peer, "Joined cluster");
            Ok(StatusCode::OK)
        }
        Err(e) => {
            warn!(%peer, "Failed to join cluster: {}", e);
            session.stop(Some(Cancelled::new(format!("Failed to join services: {e}"))));
            Err(ApiError::internal(e.to_string()))
        }
    }
}
