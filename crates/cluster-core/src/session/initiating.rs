//! Initiator side of the pairing protocol.
//!
//! 1. Read the start message and open the session.
//! 2. Advertise via multicast and send the passphrase to the operator.
//! 3. Forward each authenticated intent to the operator until it answers
//!    with the subset to accept. Only intents that were forwarded can be
//!    accepted, and their certificate must match what was received.
//! 4. Trust the accepted certificates and confirm to every accepted joiner
//!    with our own signed intent, concurrently.
//! 5. Report `accepted` once all confirmations went through.

use std::collections::BTreeMap;

use tokio::task::JoinSet;
use tracing::{info, warn};

use super::{Pairing, PairingError, Session, sign_blocking};
use crate::auth::Authenticator;
use crate::certificate::Certificate;
use crate::discovery::ServerInfo;
use crate::gateway::{Gateway, GatewayError};
use crate::intent::{JoinIntent, PROTOCOL_VERSION};
use crate::protocol::{SessionMessage, SessionRole};

impl Pairing {
    pub(crate) async fn run_initiating(&self, gw: &Gateway) -> Result<(), PairingError> {
        let start: SessionMessage = gw
            .receive_json(gw.context())
            .await
            .map_err(PairingError::StartMessage)?;

        let session = self
            .slot
            .start(SessionRole::Initiating, start.passphrase.clone(), gw.context())
            .map_err(PairingError::Start)?;

        let result = self.initiate(&session, gw, &start).await;
        self.slot.release(&session);
        result
    }

    async fn initiate(
        &self,
        session: &Session,
        gw: &Gateway,
        start: &SessionMessage,
    ) -> Result<(), PairingError> {
        let local = self.local_intent(&start.address, &start.services);

        let info = ServerInfo {
            version: PROTOCOL_VERSION.to_string(),
            name: local.name.clone(),
            address: local.address.clone(),
            services: local.services.clone(),
        };
        self.discovery
            .respond(session.context(), &start.interface, info)
            .await
            .map_err(PairingError::Discovery)?;

        let passphrase = session.passphrase();
        gw.write(&SessionMessage::with_passphrase(passphrase.clone()))
            .await
            .map_err(|source| PairingError::Write {
                step: "send session details",
                source,
            })?;

        let (forwarded, confirmed) = confirmed_intents(session, gw).await?;
        let accepted = accepted_intents(forwarded, confirmed)?;
        info!(count = accepted.len(), "Operator confirmed join intents");

        // A joiner must never see a confirmation from a side that does not
        // trust it yet.
        let mut confirmed = Vec::with_capacity(accepted.len());
        for (intent, cert) in accepted {
            session.allow(&intent.name, cert);
            confirmed.push(intent);
        }

        self.confirm_all(session, &local, &passphrase, confirmed)
            .await?;

        gw.write(&SessionMessage::accepted())
            .await
            .map_err(|source| PairingError::Write {
                step: "send confirmation",
                source,
            })
    }

    /// Send our signed intent to every accepted joiner. One failure does not
    /// stop the others; all failures are reported together.
    async fn confirm_all(
        &self,
        session: &Session,
        local: &JoinIntent,
        passphrase: &str,
        confirmed: Vec<JoinIntent>,
    ) -> Result<(), PairingError> {
        let body = local.to_json();
        let mut tasks = JoinSet::new();

        for intent in confirmed {
            let auth = Authenticator::new(passphrase, self.hmac.clone());
            let peers = self.peers.clone();
            let ctx = session.context().clone();
            let body = body.clone();

            tasks.spawn(async move {
                let header = sign_blocking(auth, body.clone())
                    .await
                    .map_err(|e| format!("Failed to create HMAC for {:?}: {e}", intent.address))?;

                peers
                    .send_intent(&ctx, &intent.address, &header, body)
                    .await
                    .map_err(|e| {
                        format!("Failed to confirm join intent of {:?}: {e}", intent.address)
                    })?;

                info!(name = %intent.name, address = %intent.address, "Confirmed join intent");
                Ok::<_, String>(())
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("{}", e);
                    failures.push(e);
                }
                Err(e) => failures.push(format!("Confirmation task failed: {e}")),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            failures.sort();
            Err(PairingError::Confirm(failures.join("; ")))
        }
    }
}

/// Intents forwarded to the operator, by name.
type Forwarded = BTreeMap<String, JoinIntent>;

/// Forward intents to the operator until it answers with the accepted ones.
async fn confirmed_intents(
    session: &Session,
    gw: &Gateway,
) -> Result<(Forwarded, Vec<JoinIntent>), PairingError> {
    let mut forwarded = Forwarded::new();
    loop {
        tokio::select! {
            intent = session.next_intent() => {
                let Some(intent) = intent else {
                    let cause = session.context().cancelled_cause().await;
                    return Err(PairingError::ConfirmedIntents(GatewayError::Cancelled(cause)));
                };

                info!(name = %intent.name, address = %intent.address, "Forwarding join intent");
                gw.write(&SessionMessage::with_intent(intent.clone()))
                    .await
                    .map_err(|source| PairingError::Write {
                        step: "forward join intent",
                        source,
                    })?;
                forwarded.insert(intent.name.clone(), intent);
            }
            reply = gw.receive_json::<SessionMessage>(session.context()) => {
                let reply = reply.map_err(PairingError::ConfirmedIntents)?;
                return Ok((forwarded, reply.confirmed_intents));
            }
        }
    }
}

fn parse_certificate(intent: &JoinIntent) -> Result<Certificate, PairingError> {
    Certificate::from_pem(&intent.certificate).map_err(|source| PairingError::Certificate {
        name: intent.name.clone(),
        source,
    })
}

/// Match the operator's answer against what was actually received.
///
/// The received intent is kept, so the operator can pick intents but never
/// alter their address or certificate. Nothing is trusted unless every
/// confirmation matches.
fn accepted_intents(
    mut forwarded: Forwarded,
    confirmed: Vec<JoinIntent>,
) -> Result<Vec<(JoinIntent, Certificate)>, PairingError> {
    let mut accepted = Vec::with_capacity(confirmed.len());
    for claim in confirmed {
        let Some(received) = forwarded.remove(&claim.name) else {
            warn!(name = %claim.name, "Operator confirmed an intent that was never received");
            return Err(PairingError::UnknownIntent(claim.name));
        };

        let cert = parse_certificate(&received)?;
        if parse_certificate(&claim)?.fingerprint() != cert.fingerprint() {
            warn!(name = %claim.name, "Confirmed certificate differs from the received intent");
            return Err(PairingError::UnknownIntent(claim.name));
        }

        accepted.push((received, cert));
    }

    Ok(accepted)
}
