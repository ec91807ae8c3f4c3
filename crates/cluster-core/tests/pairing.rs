//! Two daemons pairing in-process.
//!
//! Each daemon gets its own session slot and intent intake. Requests one
//! daemon makes to the other are routed straight into the other's intake,
//! and discovery is a shared in-memory board, so the whole handshake runs
//! without sockets.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::StreamExt;

use cluster_core::certificate::Certificate;
use cluster_core::discovery::{DiscoveryError, PeerDiscovery, ServerInfo};
use cluster_core::gateway::Gateway;
use cluster_core::protocol::{ControlClose, Identity, SessionMessage, SessionRole};
use cluster_core::service::ServiceType;
use cluster_core::session::{IntentIntake, Pairing, PeerClient, PeerError, SessionSlot};
use cluster_core::{Cancelled, Context, HmacConf, JoinIntent};

const STEP: Duration = Duration::from_secs(10);

fn self_signed(name: &str) -> String {
    rcgen::generate_simple_self_signed(vec![name.to_string()])
        .unwrap()
        .cert
        .pem()
}

fn hmac() -> HmacConf {
    HmacConf::default().with_params(64, 1, 1)
}

struct Node {
    identity: Identity,
    slot: Arc<SessionSlot>,
    intake: IntentIntake,
}

impl Node {
    fn new(name: &str, address: &str) -> Arc<Self> {
        let certificate = self_signed(name);
        Arc::new(Self {
            identity: Identity {
                name: name.to_string(),
                address: address.to_string(),
                certificate,
            },
            slot: Arc::new(SessionSlot::new()),
            intake: IntentIntake::new(hmac(), ServiceType::ALL.to_vec())
                .with_delay(Duration::ZERO),
        })
    }

    fn trusted(&self) -> Vec<String> {
        self.slot
            .active()
            .map(|s| s.trust_store().into_keys().collect())
            .unwrap_or_default()
    }
}

/// Routes peer requests to the in-process node at the target address.
#[derive(Default)]
struct Router {
    nodes: Mutex<BTreeMap<String, Arc<Node>>>,
    /// Trusted names of every node at the moment an intent was delivered
    deliveries: Mutex<Vec<(String, BTreeMap<String, Vec<String>>)>>,
}

impl Router {
    fn add(&self, node: &Arc<Node>) {
        self.nodes
            .lock()
            .unwrap()
            .insert(node.identity.address.clone(), node.clone());
    }

    fn node(&self, address: &str) -> Result<Arc<Node>, PeerError> {
        self.nodes
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| PeerError::Transport(format!("no route to {address}")))
    }

    fn snapshot(&self) -> BTreeMap<String, Vec<String>> {
        self.nodes
            .lock()
            .unwrap()
            .values()
            .map(|n| (n.identity.name.clone(), n.trusted()))
            .collect()
    }
}

#[async_trait]
impl PeerClient for Router {
    async fn identity(&self, _ctx: &Context, address: &str) -> Result<Identity, PeerError> {
        Ok(self.node(address)?.identity.clone())
    }

    async fn send_intent(
        &self,
        _ctx: &Context,
        address: &str,
        authorization: &str,
        body: Vec<u8>,
    ) -> Result<(), PeerError> {
        let node = self.node(address)?;
        let snapshot = self.snapshot();
        node.intake
            .receive(&node.slot, Some(authorization), &body)
            .await
            .map_err(|e| PeerError::Remote {
                status: if e.is_client_error() { 400 } else { 500 },
                message: e.to_string(),
            })?;

        self.deliveries
            .lock()
            .unwrap()
            .push((node.identity.name.clone(), snapshot));
        Ok(())
    }
}

/// Discovery board shared by every node.
#[derive(Default)]
struct Board {
    advertised: Mutex<Option<ServerInfo>>,
}

#[async_trait]
impl PeerDiscovery for Board {
    async fn respond(
        &self,
        _ctx: &Context,
        _interface: &str,
        info: ServerInfo,
    ) -> Result<(), DiscoveryError> {
        *self.advertised.lock().unwrap() = Some(info);
        Ok(())
    }

    async fn lookup(
        &self,
        ctx: &Context,
        _interface: &str,
        version: &str,
    ) -> Result<ServerInfo, DiscoveryError> {
        loop {
            let found = self.advertised.lock().unwrap().clone();
            if let Some(info) = found.filter(|i| i.version == version) {
                return Ok(info);
            }

            ctx.run(tokio::time::sleep(Duration::from_millis(10))).await?;
        }
    }
}

struct Harness {
    router: Arc<Router>,
    board: Arc<Board>,
}

impl Harness {
    fn new() -> Self {
        Self {
            router: Arc::new(Router::default()),
            board: Arc::new(Board::default()),
        }
    }

    fn pairing(&self, node: &Arc<Node>) -> Pairing {
        self.router.add(node);
        Pairing {
            slot: node.slot.clone(),
            identity: node.identity.clone(),
            services: ServiceType::ALL.to_vec(),
            hmac: hmac(),
            peers: self.router.clone(),
            discovery: self.board.clone(),
        }
    }
}

/// Operator end of a session websocket.
struct Operator {
    tx: fmpsc::UnboundedSender<String>,
    rx: fmpsc::UnboundedReceiver<String>,
}

impl Operator {
    fn start(pairing: Pairing, role: SessionRole) -> Self {
        let (tx, incoming) = fmpsc::unbounded::<String>();
        let (outgoing, rx) = fmpsc::unbounded::<String>();

        tokio::spawn(async move {
            let gw = Gateway::new(&Context::background(), outgoing, incoming.map(Ok::<_, Infallible>));
            pairing.serve(role, &gw).await;
        });

        Self { tx, rx }
    }

    fn send(&self, msg: &SessionMessage) {
        self.tx.unbounded_send(msg.to_json()).unwrap();
    }

    async fn frame(&mut self) -> Option<String> {
        tokio::time::timeout(STEP, self.rx.next())
            .await
            .expect("timed out waiting for a frame")
    }

    async fn message(&mut self) -> SessionMessage {
        let frame = self.frame().await.expect("connection closed");
        assert!(
            ControlClose::from_json(&frame).is_none(),
            "session failed: {frame}"
        );
        serde_json::from_str(&frame).unwrap()
    }

    /// Read until the control close frame and return its message.
    async fn close_message(&mut self) -> String {
        while let Some(frame) = self.frame().await {
            if let Some(close) = ControlClose::from_json(&frame) {
                return close.control_message;
            }
        }

        panic!("connection closed without a control message");
    }
}

#[tokio::test]
async fn test_pairing_establishes_mutual_trust() {
    let harness = Harness::new();
    let host_a = Node::new("host-a", "10.0.0.1");
    let host_b = Node::new("host-b", "10.0.0.2");

    let mut initiator = Operator::start(harness.pairing(&host_a), SessionRole::Initiating);
    initiator.send(&SessionMessage::with_passphrase("correct-horse"));
    assert_eq!(initiator.message().await.passphrase, "correct-horse");

    let mut joiner = Operator::start(harness.pairing(&host_b), SessionRole::Joining);
    joiner.send(&SessionMessage::with_passphrase("correct-horse"));

    // The initiator's operator sees the joiner's intent
    let forwarded = initiator.message().await.intent.expect("join intent");
    assert_eq!(forwarded.name, "host-b");
    assert_eq!(forwarded.address, "10.0.0.2");

    // The joiner's operator sees who it is about to trust
    let found = joiner.message().await;
    assert_eq!(found.initiator_name, "host-a");
    assert_eq!(found.initiator_address, "10.0.0.1");
    let expected = Certificate::from_pem(&host_a.identity.certificate)
        .unwrap()
        .fingerprint();
    assert_eq!(found.initiator_fingerprint, expected);

    initiator.send(&SessionMessage::with_confirmed(vec![forwarded]));

    let confirmation = joiner.message().await.intent.expect("confirmation");
    assert_eq!(confirmation.name, "host-a");
    assert!(initiator.message().await.accepted);

    // The initiator trusted host-b before its confirmation was delivered
    let deliveries = harness.router.deliveries.lock().unwrap().clone();
    let (_, at_confirmation) = deliveries
        .iter()
        .find(|(to, _)| to == "host-b")
        .expect("confirmation delivered to host-b");
    assert_eq!(at_confirmation["host-a"], vec!["host-b"]);

    assert_eq!(host_b.trusted(), vec!["host-a"]);

    // Completing the join ends the joiner's session normally
    host_b.slot.stop(None).unwrap();
    let last = joiner.message().await;
    assert!(last.error.is_empty());
    assert!(joiner.frame().await.is_none());
}

#[tokio::test]
async fn test_wrong_passphrase_is_reported_to_joiner() {
    let harness = Harness::new();
    let host_a = Node::new("host-a", "10.0.0.1");
    let host_b = Node::new("host-b", "10.0.0.2");

    let mut initiator = Operator::start(harness.pairing(&host_a), SessionRole::Initiating);
    initiator.send(&SessionMessage::with_passphrase("correct-horse"));
    initiator.message().await;

    let mut joiner = Operator::start(harness.pairing(&host_b), SessionRole::Joining);
    joiner.send(&SessionMessage {
        passphrase: "wrong-password".to_string(),
        initiator_address: "10.0.0.1".to_string(),
        ..Default::default()
    });

    let reason = joiner.close_message().await;
    assert!(reason.contains("Wrong passphrase"), "unexpected reason: {reason}");

    // One failed attempt does not end the initiator's session
    assert!(host_a.slot.is_active());
    assert!(host_a.trusted().is_empty());
}

#[tokio::test]
async fn test_stopping_a_session_reports_the_reason() {
    let harness = Harness::new();
    let host_a = Node::new("host-a", "10.0.0.1");

    let mut initiator = Operator::start(harness.pairing(&host_a), SessionRole::Initiating);
    initiator.send(&SessionMessage::default());
    let passphrase = initiator.message().await.passphrase;
    assert_eq!(passphrase.split(' ').count(), 4);

    host_a
        .slot
        .stop(Some(Cancelled::new("Operator stopped the session")))
        .unwrap();

    let reason = initiator.close_message().await;
    assert!(reason.contains("Operator stopped the session"), "unexpected reason: {reason}");
    assert!(!host_a.slot.is_active());
}

#[tokio::test]
async fn test_second_session_is_refused() {
    let harness = Harness::new();
    let host_a = Node::new("host-a", "10.0.0.1");

    let mut first = Operator::start(harness.pairing(&host_a), SessionRole::Initiating);
    first.send(&SessionMessage::default());
    first.message().await;

    let mut second = Operator::start(harness.pairing(&host_a), SessionRole::Joining);
    second.send(&SessionMessage::with_passphrase("correct-horse"));

    let reason = second.close_message().await;
    assert!(reason.contains("There already is an active session"));
}

#[tokio::test]
async fn test_joiner_rejects_confirmation_from_other_system() {
    let harness = Harness::new();
    let host_a = Node::new("host-a", "10.0.0.1");
    let host_b = Node::new("host-b", "10.0.0.2");

    let mut initiator = Operator::start(harness.pairing(&host_a), SessionRole::Initiating);
    initiator.send(&SessionMessage::with_passphrase("correct-horse"));
    initiator.message().await;

    let mut joiner = Operator::start(harness.pairing(&host_b), SessionRole::Joining);
    joiner.send(&SessionMessage::with_passphrase("correct-horse"));
    initiator.message().await;
    joiner.message().await;

    // A third system that knows the passphrase answers in host-a's place
    let imposter = self_signed("host-a");
    let intent = JoinIntent::new("host-a", "10.0.0.1", imposter, ServiceType::ALL.to_vec());
    let header = host_b
        .slot
        .active()
        .unwrap()
        .authenticator(hmac())
        .sign(&intent.to_json())
        .unwrap();
    harness
        .router
        .send_intent(&Context::background(), "10.0.0.2", &header, intent.to_json())
        .await
        .unwrap();

    let reason = joiner.close_message().await;
    assert!(reason.contains("fingerprint"), "unexpected reason: {reason}");
    assert!(host_b.trusted().is_empty());
}

#[tokio::test]
async fn test_operator_cannot_confirm_an_unreceived_intent() {
    let harness = Harness::new();
    let host_a = Node::new("host-a", "10.0.0.1");
    let host_b = Node::new("host-b", "10.0.0.2");

    let mut initiator = Operator::start(harness.pairing(&host_a), SessionRole::Initiating);
    initiator.send(&SessionMessage::with_passphrase("correct-horse"));
    initiator.message().await;

    let mut joiner = Operator::start(harness.pairing(&host_b), SessionRole::Joining);
    joiner.send(&SessionMessage::with_passphrase("correct-horse"));
    let forwarded = initiator.message().await.intent.expect("join intent");
    joiner.message().await;

    // "mallory" never sent an intent, so confirming it must trust nobody
    let mallory = JoinIntent::new(
        "mallory",
        "10.0.0.66",
        self_signed("mallory"),
        ServiceType::ALL.to_vec(),
    );
    initiator.send(&SessionMessage::with_confirmed(vec![forwarded, mallory]));

    let reason = initiator.close_message().await;
    assert!(reason.contains("\"mallory\""), "unexpected reason: {reason}");
    assert!(host_a.trusted().is_empty());
    let deliveries = harness.router.deliveries.lock().unwrap().clone();
    assert!(
        deliveries.iter().all(|(to, _)| to != "host-b"),
        "no confirmation may be sent"
    );
}

#[tokio::test]
async fn test_operator_cannot_swap_a_certificate() {
    let harness = Harness::new();
    let host_a = Node::new("host-a", "10.0.0.1");
    let host_b = Node::new("host-b", "10.0.0.2");

    let mut initiator = Operator::start(harness.pairing(&host_a), SessionRole::Initiating);
    initiator.send(&SessionMessage::with_passphrase("correct-horse"));
    initiator.message().await;

    let mut joiner = Operator::start(harness.pairing(&host_b), SessionRole::Joining);
    joiner.send(&SessionMessage::with_passphrase("correct-horse"));
    let mut forwarded = initiator.message().await.intent.expect("join intent");
    joiner.message().await;

    forwarded.certificate = self_signed("host-b");
    initiator.send(&SessionMessage::with_confirmed(vec![forwarded]));

    let reason = initiator.close_message().await;
    assert!(reason.contains("No join intent was received from \"host-b\""), "unexpected reason: {reason}");
    assert!(host_a.trusted().is_empty());
}
