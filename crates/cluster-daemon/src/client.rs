//! HTTPS clients for talking to other daemons.
//!
//! Both clients are built from [`crate::tls::TlsIdentity::http_client`], so
//! every request presents this daemon's certificate.

use async_trait::async_trait;
use cluster_core::context::Context;
use cluster_core::coordinator::{JoinDispatcher, PeerPlan, PeerReport, dispatch_each};
use cluster_core::protocol::Identity;
use cluster_core::session::{PeerClient, PeerError};
use tokio::sync::mpsc;
use tracing::debug;

/// Port of the public listener when an address does not carry one.
pub const DEFAULT_PUBLIC_PORT: u16 = 9443;


/// Base URL of the daemon listening at `address`.
pub fn peer_url(address: &str, path: &str) -> String {
    let has_port = address
        .rsplit_once(':')
        .is_some_and(|(_, port)| port.parse::<u16>().is_ok());

    if has_port {
        format!("https://{address}{path}")
    } else {
        format!("https://{address}:{DEFAULT_PUBLIC_PORT}{path}")
    }
}

fn transport(e: reqwest::Error) -> PeerError {
    PeerError::Transport(e.to_string())
}

/// Turn a non-success response into [`PeerError::Remote`] carrying the body.
async fn check(response: reqwest::Response) -> Result<reqwest::Response, PeerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response.text().await.unwrap_or_default().trim().to_string();
    Err(PeerError::Remote {
        status: status.as_u16(),
        message: if message.is_empty() {
            status.to_string()
        } else {
            message
        },
    })
}

/// [`PeerClient`] over HTTPS.
#[derive(Clone)]
pub struct HttpPeerClient {
    http: reqwest::Client,
}

impl HttpPeerClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn identity(&self, ctx: &Context, address: &str) -> Result<Identity, PeerError> {
        let url = peer_url(address, "/1.0/identity");
        debug!(%url, "Fetching peer identity");

        let request = async {
            let response = self.http.get(&url).send().await.map_err(transport)?;
            check(response).await?.json().await.map_err(transport)
        };

        ctx.run(request).await?
    }

    async fn send_intent(
        &self,
        ctx: &Context,
        address: &str,
        authorization: &str,
        body: Vec<u8>,
    ) -> Result<(), PeerError> {
        let url = peer_url(address, "/1.0/session/join");
        debug!(%url, "Sending join intent");

        let request = async {
            let response = self
                .http
                .post(&url)
                .header(reqwest::header::AUTHORIZATION, authorization)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body)
                .send()
                .await
                .map_err(transport)?;
            check(response).await.map(|_| ())
        };

        ctx.run(request).await?
    }
}

/// Sends each peer its join plan with `PUT /1.0/services`.
///
/// Peers authorize the request by the client certificate `http` presents,
/// which they trust from the pairing session.
pub struct HttpJoinDispatcher {
    http: reqwest::Client,
}

impl HttpJoinDispatcher {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl JoinDispatcher for HttpJoinDispatcher {
    fn dispatch(&self, ctx: &Context, batch: Vec<PeerPlan>) -> mpsc::Receiver<PeerReport> {
        let http = self.http.clone();

        dispatch_each(ctx, batch, move |ctx, peer| {
            let http = http.clone();
            async move {
                let url = peer_url(&peer.plan.address, "/1.0/services");
                debug!(peer = %peer.name, %url, "Requesting join");

                let request = async {
                    let response = http
                        .put(&url)
                        .json(&peer.plan)
                        .send()
                        .await
                        .map_err(transport)?;
                    check(response).await.map(|_| ())
                };

                match ctx.run(request).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(cause) => Err(cause.to_string()),
                }
            }
        })
    }
}
