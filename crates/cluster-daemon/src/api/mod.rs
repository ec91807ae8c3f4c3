//! HTTP surface of the daemon.
//!
//! Two routers are served on separate listeners:
//! - the public router, reachable by other daemons over mutually
//!   authenticated TLS (see [`crate::tls::serve`])
//! - the control router, bound to loopback for the local operator

pub mod control;
pub mod error;
pub mod public;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post, put};
use cluster_core::context::Context;
use cluster_core::coordinator::JoinCoordinator;
use cluster_core::handler::ServiceHandler;
use cluster_core::session::{IntentIntake, Pairing};
use tower_http::trace::TraceLayer;

use crate::config::SessionConfig;

pub use error::ApiError;

/// Shared application state
pub struct AppState {
    pub pairing: Pairing,
    pub intake: IntentIntake,
    pub handler: ServiceHandler,
    pub coordinator: JoinCoordinator,
    pub session: SessionConfig,
    /// Lifetime of the daemon. Sessions and service calls derive from it.
    pub ctx: Context,
}

pub fn public_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/1.0/session/join", post(public::join_intent))
        .route("/1.0/identity", get(public::identity))
        .route("/1.0/services", put(public::join_services))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn control_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/1.0/session/initiating", get(control::initiating))
        .route("/1.0/session/joining", get(control::joining))
        .route("/1.0/session/stop", put(control::stop_session))
        .route("/1.0/cluster", post(control::add_members))
        .route("/1.0/cluster/{name}", delete(control::remove_member))
        .route("/1.0/status", get(control::status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
