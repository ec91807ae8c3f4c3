//! Pairing sessions.
//!
//! A [`Session`] is one pairing attempt, either as the initiator or as a
//! joiner. It owns the passphrase, a temporary trust store of certificates
//! that were confirmed during the attempt, and the queue of authenticated
//! join intents waiting for the protocol driver.
//!
//! At most one session is active per process. [`SessionSlot`] is the guard
//! that enforces this; it is owned by the daemon state rather than being a
//! global so tests can build as many as they like.
//!
//! - [`intake`]: authenticating and queueing inbound join intents
//! - [`initiating`] and [`joining`]: the two protocol drivers
//! - [`peer`]: client seam for talking to the remote daemon

pub mod initiating;
pub mod intake;
pub mod joining;
pub mod passphrase;
pub mod peer;

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

use crate::auth::{AuthError, Authenticator, HmacConf};
use crate::certificate::{Certificate, CertificateError};
use crate::context::{CancelHandle, Cancelled, Context};
use crate::discovery::{DiscoveryError, PeerDiscovery};
use crate::gateway::{Gateway, GatewayError};
use crate::intent::JoinIntent;
use crate::protocol::{Identity, SessionRole};
use crate::service::ServiceType;

pub use intake::{IntakeError, IntentIntake};
pub use peer::{PeerClient, PeerError};

/// Failed join attempts tolerated before the session is stopped.
pub const ALLOWED_FAILED_ATTEMPTS: u8 = 50;

/// How long an inbound intent waits for room in the queue.
pub const INTENT_HANDOFF_TIMEOUT: Duration = Duration::from_secs(10);

/// Default lifetime of a session.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Upper bound for a requested session lifetime.
pub const MAX_SESSION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Cause of a session that outlived its timeout.
pub const SESSION_TIMEOUT_CAUSE: &str = "Session timeout exceeded";

/// Cause recorded on a session stopped without error.
pub const SESSION_STOPPED: &str = "Session stopped";

const INTENT_QUEUE: usize = 16;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("There already is an active session")]
    AlreadyActive,

    #[error("No active session")]
    NotActive,

    #[error("Fingerprint already exists")]
    DuplicateFingerprint,

    #[error("Exceeded the number of failed session join attempts")]
    TooManyAttempts,

    #[error("Session is stopped")]
    Stopped,

    #[error("Timeout waiting for an active consumer of the join intent")]
    NoConsumer,

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Failure of a protocol driver, reported to the operator client.
#[derive(Debug, Error)]
pub enum PairingError {
    #[error("Failed to read session start message: {0}")]
    StartMessage(GatewayError),

    #[error("Failed to start session: {0}")]
    Start(SessionError),

    #[error("Failed to start multicast discovery: {0}")]
    Discovery(DiscoveryError),

    #[error("Failed to lookup eligible system: {0}")]
    Lookup(DiscoveryError),

    #[error("Failed to {step}: {source}")]
    Write {
        step: &'static str,
        source: GatewayError,
    },

    #[error("Failed waiting for the confirmed intents: {0}")]
    ConfirmedIntents(GatewayError),

    #[error("Failed to parse certificate of {name:?}: {source}")]
    Certificate {
        name: String,
        source: CertificateError,
    },

    #[error("No join intent was received from {0:?}")]
    UnknownIntent(String),

    #[error("Failed to create HMAC for join intent: {0}")]
    Sign(AuthError),

    #[error("Failed to confirm join intents: {0}")]
    Confirm(String),

    #[error("Failed to send our intent to join {address:?}: {source}")]
    SendIntent { address: String, source: PeerError },

    #[error("Failed to retrieve identity of {address:?}: {source}")]
    Identity { address: String, source: PeerError },

    #[error("Exit waiting for join confirmation: {0}")]
    NoConfirmation(Cancelled),

    #[error("Confirmation from {name:?} has fingerprint {actual}, expected {expected}")]
    FingerprintMismatch {
        name: String,
        expected: String,
        actual: String,
    },
}

#[derive(Default)]
struct SessionState {
    passphrase: String,
    trust_store: BTreeMap<String, Certificate>,
    fingerprints: HashSet<String>,
    failed_attempts: u8,
    intent_tx: Option<mpsc::Sender<JoinIntent>>,
    stopped: bool,
    clean_exit: bool,
}

/// One pairing attempt.
pub struct Session {
    role: SessionRole,
    ctx: Context,
    cancel: CancelHandle,
    state: RwLock<SessionState>,
    intent_rx: Mutex<mpsc::Receiver<JoinIntent>>,
}

impl Session {
    /// Create a session bound to `parent`. An initiating session without a
    /// passphrase generates one.
    pub fn new(role: SessionRole, passphrase: impl Into<String>, parent: &Context) -> Self {
        let mut passphrase = passphrase.into();
        if passphrase.is_empty() && role == SessionRole::Initiating {
            passphrase = passphrase::generate();
        }

        let (ctx, cancel) = parent.with_cancel();
        let (tx, rx) = mpsc::channel(INTENT_QUEUE);

        Self {
            role,
            ctx,
            cancel,
            state: RwLock::new(SessionState {
                passphrase,
                intent_tx: Some(tx),
                ..Default::default()
            }),
            intent_rx: Mutex::new(rx),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn passphrase(&self) -> String {
        self.read().passphrase.clone()
    }

    /// Authenticator keyed by this session's passphrase.
    pub fn authenticator(&self, conf: HmacConf) -> Authenticator {
        Authenticator::new(self.passphrase(), conf)
    }

    /// Ends when the session does. Derived contexts inherit its cause.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn is_active(&self) -> bool {
        !self.read().stopped && !self.ctx.is_cancelled()
    }

    /// Trust `certificate` for `name` until the session ends.
    pub fn allow(&self, name: &str, certificate: Certificate) {
        debug!(name, fingerprint = %certificate.fingerprint(), "Allowing certificate");
        self.write()
            .trust_store
            .insert(name.to_string(), certificate);
    }

    /// Copy of the temporary trust store.
    pub fn trust_store(&self) -> BTreeMap<String, Certificate> {
        self.read().trust_store.clone()
    }

    /// Name of the trusted member with this fingerprint, if any.
    pub fn trusted_name(&self, fingerprint: &str) -> Option<String> {
        self.read()
            .trust_store
            .iter()
            .find(|(_, cert)| cert.fingerprint() == fingerprint)
            .map(|(name, _)| name.clone())
    }

    /// Record an authenticated intent. Each certificate may only join once.
    pub fn register_intent(&self, fingerprint: &str) -> Result<(), SessionError> {
        let mut state = self.write();
        if state.stopped {
            return Err(SessionError::Stopped);
        }

        if !state.fingerprints.insert(fingerprint.to_string()) {
            return Err(SessionError::DuplicateFingerprint);
        }

        Ok(())
    }

    /// Count a failed authentication. Errors once the budget is used up.
    pub fn register_failed_attempt(&self) -> Result<(), SessionError> {
        let mut state = self.write();
        state.failed_attempts = state.failed_attempts.saturating_add(1);
        if state.failed_attempts >= ALLOWED_FAILED_ATTEMPTS {
            return Err(SessionError::TooManyAttempts);
        }

        Ok(())
    }

    /// Queue an authenticated intent for the protocol driver.
    pub async fn submit_intent(&self, intent: JoinIntent) -> Result<(), SessionError> {
        let tx = self.read().intent_tx.clone().ok_or(SessionError::Stopped)?;

        let send = tokio::time::timeout(INTENT_HANDOFF_TIMEOUT, tx.send(intent));
        match self.ctx.run(send).await? {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SessionError::Stopped),
            Err(_) => Err(SessionError::NoConsumer),
        }
    }

    /// Next queued intent. `None` once the session has ended.
    pub async fn next_intent(&self) -> Option<JoinIntent> {
        let mut rx = self.intent_rx.lock().await;
        tokio::select! {
            intent = rx.recv() => intent,
            _ = self.ctx.cancelled() => None,
        }
    }

    /// End the session. `None` means a normal stop.
    ///
    /// Idempotent. Clears the passphrase, trust store and fingerprints,
    /// closes the intent queue and cancels the session context, which also
    /// shuts down any discovery responder bound to it.
    pub fn stop(&self, cause: Option<Cancelled>) {
        let mut state = self.write();
        if state.stopped {
            return;
        }

        let normal = cause.is_none();
        let cause = cause.unwrap_or_else(|| Cancelled::new(SESSION_STOPPED));
        info!(role = %self.role, cause = %cause, "Stopping session");

        state.stopped = true;
        state.passphrase.clear();
        state.trust_store.clear();
        state.fingerprints.clear();
        state.failed_attempts = 0;
        state.intent_tx = None;
        state.clean_exit = self.cancel.cancel(cause) && normal;
    }

    /// Wait for the session to end. `Ok` only for a normal stop.
    pub async fn exited(&self) -> Result<(), Cancelled> {
        let cause = self.ctx.cancelled_cause().await;
        if self.read().clean_exit {
            Ok(())
        } else {
            Err(cause)
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

/// Process wide guard that admits one active session at a time.
#[derive(Default)]
pub struct SessionSlot {
    active: RwLock<Option<Arc<Session>>>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a session unless one is already active.
    pub fn start(
        &self,
        role: SessionRole,
        passphrase: impl Into<String>,
        parent: &Context,
    ) -> Result<Arc<Session>, SessionError> {
        let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
        if active.as_ref().is_some_and(|s| s.is_active()) {
            return Err(SessionError::AlreadyActive);
        }

        let session = Arc::new(Session::new(role, passphrase, parent));
        info!(%role, "Started session");
        *active = Some(session.clone());
        Ok(session)
    }

    /// The active session, if any.
    pub fn active(&self) -> Option<Arc<Session>> {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .filter(|s| s.is_active())
            .cloned()
    }

    pub fn is_active(&self) -> bool {
        self.active().is_some()
    }

    /// Run `f` against the active session.
    pub fn with_active<T>(
        &self,
        f: impl FnOnce(&Session) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let session = self.active().ok_or(SessionError::NotActive)?;
        f(&session)
    }

    /// Stop the active session.
    pub fn stop(&self, cause: Option<Cancelled>) -> Result<(), SessionError> {
        let session = self
            .active
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(SessionError::NotActive)?;

        session.stop(cause);
        Ok(())
    }

    /// Stop `session` and free the slot if it still holds it.
    pub fn release(&self, session: &Arc<Session>) {
        session.stop(None);

        let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
        if active.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
            *active = None;
        }
    }
}

/// Everything the protocol drivers need from the local daemon.
#[derive(Clone)]
pub struct Pairing {
    pub slot: Arc<SessionSlot>,
    /// Local name, address and certificate
    pub identity: Identity,
    /// Services run by this daemon
    pub services: Vec<ServiceType>,
    pub hmac: HmacConf,
    pub peers: Arc<dyn PeerClient>,
    pub discovery: Arc<dyn PeerDiscovery>,
}

impl Pairing {
    /// Drive a session of `role` over `gateway` and close the gateway.
    ///
    /// Errors after the websocket upgrade can only be reported in-band, so
    /// a failure is sent to the client as the control close cause.
    pub async fn serve(&self, role: SessionRole, gateway: &Gateway) {
        let result = match role {
            SessionRole::Initiating => self.run_initiating(gateway).await,
            SessionRole::Joining => self.run_joining(gateway).await,
        };

        match result {
            Ok(()) => {
                info!(%role, "Session completed");
                gateway.finish().await;
            }
            Err(e) => {
                info!(%role, error = %e, "Session failed");
                gateway.close(e).await;
            }
        }
    }

    fn local_intent(&self, address: &str, services: &[ServiceType]) -> JoinIntent {
        let address = if address.is_empty() {
            self.identity.address.as_str()
        } else {
            address
        };

        let services = if services.is_empty() {
            self.services.clone()
        } else {
            services.to_vec()
        };

        JoinIntent::new(
            self.identity.name.clone(),
            address,
            self.identity.certificate.clone(),
            services,
        )
    }
}

/// Sign `body` off the async runtime; Argon2 is deliberately slow.
pub(crate) async fn sign_blocking(auth: Authenticator, body: Vec<u8>) -> Result<String, AuthError> {
    tokio::task::spawn_blocking(move || auth.sign(&body))
        .await
        .map_err(|e| AuthError::KeyDerivation(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert() -> Certificate {
        Certificate::from_pem(&crate::testing::self_signed("host-a")).unwrap()
    }

    #[tokio::test]
    async fn test_at_most_one_session() {
        let slot = SessionSlot::new();
        let ctx = Context::background();

        let first = slot.start(SessionRole::Initiating, "", &ctx).unwrap();
        for role in [SessionRole::Initiating, SessionRole::Joining] {
            assert!(matches!(
                slot.start(role, "x", &ctx),
                Err(SessionError::AlreadyActive)
            ));
        }

        slot.release(&first);
        assert!(slot.start(SessionRole::Joining, "x", &ctx).is_ok());
    }

    #[tokio::test]
    async fn test_ended_session_frees_slot() {
        let slot = SessionSlot::new();
        let (ctx, handle) = Context::background().with_cancel();
        slot.start(SessionRole::Joining, "x", &ctx).unwrap();

        handle.cancel_with(SESSION_TIMEOUT_CAUSE);
        tokio::time::timeout(Duration::from_secs(1), async {
            while slot.is_active() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert!(slot.start(SessionRole::Initiating, "", &Context::background()).is_ok());
    }

    #[tokio::test]
    async fn test_initiator_generates_passphrase() {
        let ctx = Context::background();
        let initiator = Session::new(SessionRole::Initiating, "", &ctx);
        assert_eq!(initiator.passphrase().split(' ').count(), 4);

        let supplied = Session::new(SessionRole::Initiating, "correct-horse", &ctx);
        assert_eq!(supplied.passphrase(), "correct-horse");

        let joiner = Session::new(SessionRole::Joining, "", &ctx);
        assert_eq!(joiner.passphrase(), "");
    }

    #[tokio::test]
    async fn test_register_intent_dedups_by_fingerprint() {
        let session = Session::new(SessionRole::Initiating, "", &Context::background());
        session.register_intent("aa").unwrap();
        session.register_intent("bb").unwrap();
        assert!(matches!(
            session.register_intent("aa"),
            Err(SessionError::DuplicateFingerprint)
        ));
    }

    #[test]
    fn test_with_active_requires_session() {
        let slot = SessionSlot::new();
        let result = slot.with_active(|s| s.register_intent("aa"));
        assert!(matches!(result, Err(SessionError::NotActive)));
        assert!(matches!(slot.stop(None), Err(SessionError::NotActive)));
    }

    #[tokio::test]
    async fn test_allow_is_idempotent_per_name() {
        let session = Session::new(SessionRole::Joining, "x", &Context::background());
        let (old, new) = (cert(), cert());
        session.allow("host-a", old.clone());
        session.allow("host-a", new.clone());

        let store = session.trust_store();
        assert_eq!(store.len(), 1);
        assert_eq!(store["host-a"], new);
        assert_eq!(
            session.trusted_name(&new.fingerprint()).as_deref(),
            Some("host-a")
        );
        assert!(session.trusted_name(&old.fingerprint()).is_none());
    }

    #[tokio::test]
    async fn test_failed_attempt_budget() {
        let session = Session::new(SessionRole::Initiating, "", &Context::background());
        for _ in 1..ALLOWED_FAILED_ATTEMPTS {
            session.register_failed_attempt().unwrap();
        }
        assert!(matches!(
            session.register_failed_attempt(),
            Err(SessionError::TooManyAttempts)
        ));
    }

    #[tokio::test]
    async fn test_intents_flow_until_stop() {
        let session = Session::new(SessionRole::Initiating, "", &Context::background());
        let intent = JoinIntent::new("host-b", "10.0.0.2:9443", "cert", vec![]);

        session.submit_intent(intent.clone()).await.unwrap();
        assert_eq!(session.next_intent().await, Some(intent.clone()));

        session.stop(None);
        assert_eq!(session.next_intent().await, None);
        assert!(matches!(
            session.submit_intent(intent).await,
            Err(SessionError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_stop_clears_state_and_is_idempotent() {
        let session = Session::new(SessionRole::Initiating, "secret", &Context::background());
        session.allow("host-b", cert());
        session.register_intent("aa").unwrap();

        session.stop(Some(Cancelled::new("Operator aborted")));
        session.stop(None);

        assert_eq!(session.passphrase(), "");
        assert!(session.trust_store().is_empty());
        assert!(!session.is_active());
        assert_eq!(
            session.exited().await.unwrap_err().message(),
            "Operator aborted"
        );
    }

    #[tokio::test]
    async fn test_normal_stop_exits_cleanly() {
        let session = Session::new(SessionRole::Joining, "x", &Context::background());
        session.stop(None);
        assert!(session.exited().await.is_ok());
        assert_eq!(session.context().cause().unwrap().message(), SESSION_STOPPED);
    }

    #[tokio::test]
    async fn test_parent_cancel_is_an_error_exit() {
        let (parent, handle) = Context::background().with_cancel();
        let session = Session::new(SessionRole::Joining, "x", &parent);
        handle.cancel_with(SESSION_TIMEOUT_CAUSE);

        let cause = session.exited().await.unwrap_err();
        assert_eq!(cause.message(), SESSION_TIMEOUT_CAUSE);

        // A later normal stop does not rewrite the exit
        session.stop(None);
        assert!(session.exited().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handoff_times_out_without_consumer() {
        let session = Session::new(SessionRole::Initiating, "", &Context::background());
        for i in 0..INTENT_QUEUE {
            let intent = JoinIntent::new(format!("host-{i}"), "a", "c", vec![]);
            session.submit_intent(intent).await.unwrap();
        }

        let intent = JoinIntent::new("late", "a", "c", vec![]);
        assert!(matches!(
            session.submit_intent(intent).await,
            Err(SessionError::NoConsumer)
        ));
    }
}
