//! cluster-core: pairing machines into a multi-subsystem cluster.
//!
//! This crate provides:
//! - A passphrase-authenticated pairing session between an initiating and a
//!   joining machine, driven over a bidirectional message channel
//! - Multicast discovery of an initiating machine on the local network
//! - Ordered bootstrap, join and removal across independent subsystems
//! - Staged rollout of several new peers into every subsystem at once

pub mod auth;
pub mod certificate;
pub mod context;
pub mod coordinator;
pub mod discovery;
pub mod gateway;
pub mod handler;
pub mod intent;
pub mod protocol;
pub mod service;
pub mod session;

#[cfg(test)]
mod testing;

pub use auth::{Authenticator, AuthError, HmacConf};
pub use certificate::{Certificate, CertificateError};
pub use context::{CancelHandle, Cancelled, Context};
pub use coordinator::{
    CoordinatorError, JoinCoordinator, JoinDispatcher, JoinEvent, JoinPolicy, JoinReport,
    PeerPlan, PeerReport, PeerTarget,
};
pub use discovery::{DiscoveryError, MulticastDiscovery, PeerDiscovery, ServerInfo};
pub use gateway::{Gateway, GatewayError};
pub use handler::{HandlerError, ServiceHandler, StatusReport};
pub use intent::{JoinConfig, JoinIntent, JoinPlan, PROTOCOL_VERSION};
pub use protocol::{ControlClose, Identity, SessionMessage, SessionRole, SessionStop};
pub use service::{Disk, DiskLister, Service, ServiceError, ServiceType};
pub use session::{
    IntakeError, IntentIntake, Pairing, PairingError, PeerClient, PeerError, Session,
    SessionError, SessionSlot,
};
