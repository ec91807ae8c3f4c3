//! Joiner side of the pairing protocol.
//!
//! The joiner finds the initiator (or is told its address), sends its signed
//! intent, reports the initiator's identity to the operator, and then waits
//! for the initiator's own signed intent to arrive through the join
//! endpoint. Only a confirmation whose certificate matches the identity we
//! reported is trusted.

use std::time::Duration;

use tracing::info;

use super::{Pairing, PairingError, PeerError, Session, sign_blocking};
use crate::certificate::{Certificate, fingerprint_pem};
use crate::discovery::LOOKUP_TIMEOUT_CAUSE;
use crate::gateway::Gateway;
use crate::intent::PROTOCOL_VERSION;
use crate::protocol::{SessionMessage, SessionRole};

/// Lookup timeout used when the client does not send one.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Hint shown instead of the generic authentication failure.
pub const WRONG_PASSPHRASE: &str = "Wrong passphrase";

impl Pairing {
    pub(crate) async fn run_joining(&self, gw: &Gateway) -> Result<(), PairingError> {
        let start: SessionMessage = gw
            .receive_json(gw.context())
            .await
            .map_err(PairingError::StartMessage)?;

        let session = self
            .slot
            .start(SessionRole::Joining, start.passphrase.clone(), gw.context())
            .map_err(PairingError::Start)?;

        let result = self.join(&session, gw, start).await;
        self.slot.release(&session);
        result
    }

    async fn join(
        &self,
        session: &Session,
        gw: &Gateway,
        mut start: SessionMessage,
    ) -> Result<(), PairingError> {
        if start.initiator_address.is_empty() {
            let timeout = match start.lookup_timeout {
                0 => DEFAULT_LOOKUP_TIMEOUT,
                secs => Duration::from_secs(secs),
            };
            let (lookup_ctx, _cancel) = session
                .context()
                .with_timeout(timeout, LOOKUP_TIMEOUT_CAUSE);

            let found = self
                .discovery
                .lookup(&lookup_ctx, &start.interface, PROTOCOL_VERSION)
                .await
                .map_err(PairingError::Lookup)?;
            start.initiator_address = found.address;
        }

        let initiator = start.initiator_address.clone();
        let local = self.local_intent(&start.address, &start.services);
        let body = local.to_json();
        let header = sign_blocking(session.authenticator(self.hmac.clone()), body.clone())
            .await
            .map_err(PairingError::Sign)?;

        if let Err(e) = self
            .peers
            .send_intent(session.context(), &initiator, &header, body)
            .await
        {
            // Only a passphrase mismatch should plausibly fail
            // authentication once the request type checks.
            let source = if e.is_invalid_hmac() {
                PeerError::Remote {
                    status: 400,
                    message: WRONG_PASSPHRASE.to_string(),
                }
            } else {
                e
            };

            return Err(PairingError::SendIntent {
                address: initiator,
                source,
            });
        }

        let identity = self
            .peers
            .identity(session.context(), &initiator)
            .await
            .map_err(|source| PairingError::Identity {
                address: initiator.clone(),
                source,
            })?;
        let expected = fingerprint_pem(&identity.certificate).map_err(|source| {
            PairingError::Certificate {
                name: identity.name.clone(),
                source,
            }
        })?;

        info!(name = %identity.name, address = %initiator, "Sent join intent");
        gw.write(&SessionMessage {
            initiator_name: identity.name.clone(),
            initiator_address: initiator.clone(),
            initiator_fingerprint: expected.clone(),
            ..Default::default()
        })
        .await
        .map_err(|source| PairingError::Write {
            step: "confirm the eligible system",
            source,
        })?;

        let Some(confirmed) = session.next_intent().await else {
            let cause = session.context().cancelled_cause().await;
            return Err(PairingError::NoConfirmation(cause));
        };

        let cert = Certificate::from_pem(&confirmed.certificate).map_err(|source| {
            PairingError::Certificate {
                name: confirmed.name.clone(),
                source,
            }
        })?;
        let actual = cert.fingerprint();
        if actual != expected {
            return Err(PairingError::FingerprintMismatch {
                name: confirmed.name,
                expected,
                actual,
            });
        }

        session.allow(&confirmed.name, cert);
        info!(name = %confirmed.name, "Received join confirmation");

        gw.write(&SessionMessage::with_intent(confirmed))
            .await
            .map_err(|source| PairingError::Write {
                step: "forward join confirmation",
                source,
            })?;

        let error = match session.exited().await {
            Ok(()) => String::new(),
            Err(cause) => format!("Exit waiting for session to end: {cause}"),
        };

        gw.write(&SessionMessage::final_message(error))
            .await
            .map_err(|source| PairingError::Write {
                step: "signal final message",
                source,
            })
    }
}
