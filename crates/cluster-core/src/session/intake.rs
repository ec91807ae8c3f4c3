//! Inbound join intents.
//!
//! [`IntentIntake::receive`] is the whole server side of the join request:
//! delay, authenticate, decode, validate, register, and hand the intent to
//! the protocol driver. It has no HTTP types in it so the daemon only maps
//! the result to a status code.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use super::{SessionError, SessionSlot};
use crate::auth::{AuthError, HmacConf};
use crate::certificate::fingerprint_pem;
use crate::context::Cancelled;
use crate::intent::{JoinIntent, PROTOCOL_VERSION};
use crate::protocol::SessionRole;
use crate::service::ServiceType;

/// Fixed delay applied before looking at a join request.
pub const INTENT_DELAY: Duration = Duration::from_millis(100);

/// Cause recorded when the failed attempt budget runs out.
pub const TOO_MANY_ATTEMPTS: &str = "Stopping session after too many failed attempts";

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("No active session")]
    NotActive,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Stopping session after too many failed attempts")]
    TooManyAttempts,

    #[error("{0}")]
    Invalid(String),

    #[error("Failed to register join intent: {0}")]
    Register(SessionError),

    #[error(transparent)]
    Handoff(SessionError),
}

impl IntakeError {
    /// Errors the caller caused. Everything else is on our side.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Handoff(_))
    }
}

/// Server side of the join endpoint.
#[derive(Debug, Clone)]
pub struct IntentIntake {
    conf: HmacConf,
    services: Vec<ServiceType>,
    delay: Duration,
}

impl IntentIntake {
    /// `services` are the services this daemon runs. An initiator rejects
    /// joiners that do not run all of them.
    pub fn new(conf: HmacConf, services: Vec<ServiceType>) -> Self {
        Self {
            conf,
            services,
            delay: INTENT_DELAY,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Authenticate `body` against the active session and queue it.
    pub async fn receive(
        &self,
        slot: &SessionSlot,
        authorization: Option<&str>,
        body: &[u8],
    ) -> Result<(), IntakeError> {
        // Applied before any validation to slow down passphrase guessing
        tokio::time::sleep(self.delay).await;

        let session = slot.active().ok_or(IntakeError::NotActive)?;

        let auth = session.authenticator(self.conf.clone());
        let header = authorization.map(str::to_string);
        let owned = body.to_vec();
        let verified =
            tokio::task::spawn_blocking(move || auth.verify(header.as_deref(), &owned))
                .await
                .unwrap_or(Err(AuthError::InvalidHmac));

        if let Err(e) = verified {
            if session.register_failed_attempt().is_err() {
                warn!("{}", TOO_MANY_ATTEMPTS);
                session.stop(Some(Cancelled::new(TOO_MANY_ATTEMPTS)));
                return Err(IntakeError::TooManyAttempts);
            }

            return Err(e.into());
        }

        let intent: JoinIntent = serde_json::from_slice(body)
            .map_err(|e| IntakeError::Invalid(format!("Invalid join intent: {e}")))?;
        intent.validate().map_err(IntakeError::Invalid)?;

        // The joiner has to accept whatever services the initiator runs
        if session.role() == SessionRole::Initiating {
            self.validate_intent(&intent)?;
        }

        let fingerprint = fingerprint_pem(&intent.certificate)
            .map_err(|e| IntakeError::Invalid(format!("Failed to get fingerprint: {e}")))?;

        session
            .register_intent(&fingerprint)
            .map_err(IntakeError::Register)?;

        debug!(name = %intent.name, %fingerprint, "Accepted join intent");
        session
            .submit_intent(intent)
            .await
            .map_err(IntakeError::Handoff)
    }

    fn validate_intent(&self, intent: &JoinIntent) -> Result<(), IntakeError> {
        if intent.version != PROTOCOL_VERSION {
            return Err(IntakeError::Invalid(format!(
                "Rejecting peer {:?} due to invalid version. (Want: {:?}, Detected: {:?})",
                intent.name, PROTOCOL_VERSION, intent.version
            )));
        }

        let missing = intent.missing_services(&self.services);
        if !missing.is_empty() {
            let names: Vec<_> = missing.iter().map(ServiceType::as_str).collect();
            return Err(IntakeError::Invalid(format!(
                "Rejecting peer {:?} due to missing services ({})",
                intent.name,
                names.join(", ")
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::auth::{Authenticator, test_conf};
    use crate::context::Context;
    use crate::session::Session;
    use crate::testing::self_signed;

    fn intake() -> IntentIntake {
        IntentIntake::new(test_conf(), vec![ServiceType::Cluster, ServiceType::Storage])
            .with_delay(Duration::ZERO)
    }

    fn signed(passphrase: &str, intent: &JoinIntent) -> (String, Vec<u8>) {
        let body = intent.to_json();
        let header = Authenticator::new(passphrase, test_conf())
            .sign(&body)
            .unwrap();
        (header, body)
    }

    fn host_b() -> JoinIntent {
        JoinIntent::new(
            "host-b",
            "10.0.0.2:9443",
            self_signed("host-b"),
            vec![ServiceType::Cluster, ServiceType::Storage],
        )
    }

    fn initiator() -> (Arc<SessionSlot>, Arc<Session>) {
        let slot = Arc::new(SessionSlot::new());
        let session = slot
            .start(SessionRole::Initiating, "correct-horse", &Context::background())
            .unwrap();
        (slot, session)
    }

    #[tokio::test]
    async fn test_rejects_without_session() {
        let slot = SessionSlot::new();
        let (header, body) = signed("correct-horse", &host_b());
        let err = intake().receive(&slot, Some(&header), &body).await.unwrap_err();
        assert!(matches!(err, IntakeError::NotActive));
    }

    #[tokio::test]
    async fn test_valid_intent_is_queued() {
        let (slot, session) = initiator();
        let intent = host_b();
        let (header, body) = signed("correct-horse", &intent);

        intake().receive(&slot, Some(&header), &body).await.unwrap();
        assert_eq!(session.next_intent().await, Some(intent));
    }

    #[tokio::test]
    async fn test_wrong_passphrase_and_garbage_look_the_same() {
        let (slot, _session) = initiator();
        let (wrong, body) = signed("wrong-password", &host_b());
        let (empty, _) = signed("", &host_b());

        for header in [Some(wrong.as_str()), Some(empty.as_str()), Some("garbage"), None] {
            let err = intake().receive(&slot, header, &body).await.unwrap_err();
            assert_eq!(err.to_string(), "Invalid HMAC");
        }
    }

    #[tokio::test]
    async fn test_duplicate_certificate_rejected() {
        let (slot, session) = initiator();
        let intent = host_b();
        let (header, body) = signed("correct-horse", &intent);
        intake().receive(&slot, Some(&header), &body).await.unwrap();
        session.next_intent().await.unwrap();

        let (header, body) = signed("correct-horse", &intent);
        let err = intake().receive(&slot, Some(&header), &body).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to register join intent: Fingerprint already exists"
        );
    }

    #[tokio::test]
    async fn test_initiator_requires_all_services() {
        let (slot, _session) = initiator();
        let mut intent = host_b();
        intent.services = vec![ServiceType::Cluster];
        let (header, body) = signed("correct-horse", &intent);

        let err = intake().receive(&slot, Some(&header), &body).await.unwrap_err();
        assert!(err.to_string().contains("missing services (storage)"));
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn test_initiator_requires_same_version() {
        let (slot, _session) = initiator();
        let mut intent = host_b();
        intent.version = "0.9".into();
        let (header, body) = signed("correct-horse", &intent);

        let err = intake().receive(&slot, Some(&header), &body).await.unwrap_err();
        assert!(err.to_string().contains("invalid version"));
    }

    #[tokio::test]
    async fn test_joiner_accepts_any_services() {
        let slot = SessionSlot::new();
        let session = slot
            .start(SessionRole::Joining, "correct-horse", &Context::background())
            .unwrap();
        let mut intent = host_b();
        intent.services = vec![];
        let (header, body) = signed("correct-horse", &intent);

        intake().receive(&slot, Some(&header), &body).await.unwrap();
        assert!(session.next_intent().await.is_some());
    }

    #[tokio::test]
    async fn test_bad_certificate_rejected() {
        let (slot, _session) = initiator();
        let mut intent = host_b();
        intent.certificate = "not a certificate".into();
        let (header, body) = signed("correct-horse", &intent);

        let err = intake().receive(&slot, Some(&header), &body).await.unwrap_err();
        assert!(err.to_string().starts_with("Failed to get fingerprint"));
    }

    #[tokio::test]
    async fn test_too_many_failures_stop_the_session() {
        let (slot, session) = initiator();
        let (wrong, body) = signed("wrong-password", &host_b());

        for _ in 1..crate::session::ALLOWED_FAILED_ATTEMPTS {
            let err = intake().receive(&slot, Some(&wrong), &body).await.unwrap_err();
            assert!(matches!(err, IntakeError::Auth(_)));
        }

        let err = intake().receive(&slot, Some(&wrong), &body).await.unwrap_err();
        assert!(matches!(err, IntakeError::TooManyAttempts));
        assert_eq!(session.exited().await.unwrap_err().message(), TOO_MANY_ATTEMPTS);
        assert!(!slot.is_active());
    }
}
