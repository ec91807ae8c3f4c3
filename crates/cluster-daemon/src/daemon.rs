//! Assembly of the daemon from its configuration.

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use cluster_core::context::{CancelHandle, Context};
use cluster_core::coordinator::JoinCoordinator;
use cluster_core::discovery::MulticastDiscovery;
use cluster_core::handler::ServiceHandler;
use cluster_core::protocol::Identity;
use cluster_core::service::ServiceType;
use cluster_core::session::{IntentIntake, Pairing, SessionSlot};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::api::{self, AppState};
use crate::client::{HttpJoinDispatcher, HttpPeerClient};
use crate::config::Config;
use crate::services::HttpService;
use crate::tls::{self, TlsIdentity};

pub const SHUTDOWN_CAUSE: &str = "Daemon shutting down";

/// Timeout of pairing requests to other daemons.
const PEER_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Daemon {
    state: Arc<AppState>,
    cancel: CancelHandle,
    acceptor: TlsAcceptor,
    fingerprint: String,
}

impl Daemon {
    /// Build every component. `public_addr` is the address the public
    /// listener is bound to, used when the configuration names none.
    pub fn build(config: &Config, config_dir: &Path, public_addr: SocketAddr) -> Result<Self> {
        let name = config.member_name();
        let address = if config.address.is_empty() {
            public_addr.to_string()
        } else {
            config.address.clone()
        };

        let identity = TlsIdentity::load_or_generate(config_dir, &name)?;
        let fingerprint = identity.fingerprint().to_string();

        let services: Vec<ServiceType> = config.services.keys().copied().collect();
        let mut handles = Vec::with_capacity(services.len());
        for (kind, endpoint) in &config.services {
            let service = HttpService::new(*kind, name.clone(), address.clone(), endpoint.clone())
                .with_context(|| format!("Failed to create {kind} client"))?;
            handles.push(service.shared());
        }
        let handler = ServiceHandler::new(handles);

        let discovery = MulticastDiscovery::new(config.discovery.interface, config.discovery.port)
            .with_group(config.discovery.group);

        let hmac = config.hmac.conf();
        let pairing = Pairing {
            slot: Arc::new(SessionSlot::new()),
            identity: Identity {
                name: name.clone(),
                address: address.clone(),
                certificate: identity.certificate_pem().to_string(),
            },
            services: services.clone(),
            hmac: hmac.clone(),
            peers: Arc::new(HttpPeerClient::new(identity.http_client(PEER_REQUEST_TIMEOUT)?)),
            discovery: Arc::new(discovery),
        };

        let policy = config.join.policy();
        let dispatcher = HttpJoinDispatcher::new(identity.http_client(policy.timeout)?);
        let coordinator = JoinCoordinator::new(handler.clone(), Arc::new(dispatcher)).with_policy(policy);

        let (ctx, cancel) = Context::background().with_cancel();

        info!(%name, %address, fingerprint = %fingerprint, ?services, "Daemon configured");

        let state = AppState {
            pairing,
            intake: IntentIntake::new(hmac, services),
            handler,
            coordinator,
            session: config.session.clone(),
            ctx,
        };

        Ok(Self {
            state: Arc::new(state),
            cancel,
            acceptor: identity.acceptor()?,
            fingerprint,
        })
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Fingerprint of the identity certificate.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Serve both listeners until `shutdown` resolves. The public listener
    /// speaks TLS, the control listener plain HTTP.
    ///
    /// Shutting down cancels the daemon context, which ends any open session
    /// and pending subsystem call before the servers drain.
    pub async fn serve(
        self,
        public: TcpListener,
        control: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            shutdown.await;
            cancel.cancel_with(SHUTDOWN_CAUSE);
        });

        info!("Public API listening on {}", public.local_addr()?);
        info!("Control API listening on {}", control.local_addr()?);

        let ctx = self.state.ctx.clone();
        let public_server = tls::serve(
            public,
            self.acceptor.clone(),
            api::public_router(self.state.clone()),
            ctx.clone(),
        );
        let control_server = axum::serve(control, api::control_router(self.state.clone()))
            .with_graceful_shutdown(async move { ctx.cancelled().await });

        let ((), served) = tokio::join!(public_server, async { control_server.await });
        served.context("Control API failed")?;

        info!("Daemon shut down");
        Ok(())
    }
}
