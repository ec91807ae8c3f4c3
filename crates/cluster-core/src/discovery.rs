//! Multicast peer discovery on the local subnet.
//!
//! An initiator runs a responder that answers lookup datagrams with its
//! [`ServerInfo`]. A joiner that does not know the initiator's address sends
//! a lookup carrying only the protocol version every second until a matching
//! reply arrives or its context ends.
//!
//! Datagrams are capped at 500 bytes: every IPv4 host must accept 576 byte
//! datagrams, which leaves 508 bytes after the largest IP and UDP headers.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::context::{Cancelled, Context};
use crate::service::ServiceType;

/// Organization-local scope address not reserved for any public protocol.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 100, 100, 100);

pub const DEFAULT_DISCOVERY_PORT: u16 = 9444;

pub const MAX_DATAGRAM: usize = 500;

pub const LOOKUP_INTERVAL: Duration = Duration::from_secs(1);

/// Cause recorded when a lookup runs out of time.
pub const LOOKUP_TIMEOUT_CAUSE: &str = "Lookup timeout exceeded";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Invalid interface address {0:?}")]
    InvalidInterface(String),

    #[error("Failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Failed to join multicast group {group}: {source}")]
    JoinGroup {
        group: Ipv4Addr,
        source: std::io::Error,
    },

    #[error("Server info is {0} bytes, larger than the datagram limit")]
    TooLarge(usize),

    #[error("Failed to read from multicast network endpoint: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// What a responder advertises about itself.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceType>,
}

impl ServerInfo {
    fn encode(&self) -> Result<Vec<u8>, DiscoveryError> {
        let bytes = serde_json::to_vec(self).expect("ServerInfo serialization should not fail");
        if bytes.len() > MAX_DATAGRAM {
            return Err(DiscoveryError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }
}

/// Advertisement and lookup of pairing peers.
#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    /// Answer lookups with `info` until `ctx` ends. Returns once listening.
    async fn respond(
        &self,
        ctx: &Context,
        interface: &str,
        info: ServerInfo,
    ) -> Result<(), DiscoveryError>;

    /// Find a responder speaking `version`.
    async fn lookup(
        &self,
        ctx: &Context,
        interface: &str,
        version: &str,
    ) -> Result<ServerInfo, DiscoveryError>;
}

/// UDP multicast implementation of [`PeerDiscovery`].
#[derive(Debug, Clone)]
pub struct MulticastDiscovery {
    interface: Ipv4Addr,
    port: u16,
    group: Ipv4Addr,
}

impl MulticastDiscovery {
    /// `interface` is the IPv4 address of the interface used when a session
    /// does not name one.
    pub fn new(interface: Ipv4Addr, port: u16) -> Self {
        Self {
            interface,
            port,
            group: MULTICAST_GROUP,
        }
    }

    /// Send lookups to `group` instead of the default multicast group.
    /// A unicast address skips the group membership entirely.
    pub fn with_group(mut self, group: Ipv4Addr) -> Self {
        self.group = group;
        self
    }

    fn interface(&self, requested: &str) -> Result<Ipv4Addr, DiscoveryError> {
        if requested.is_empty() {
            return Ok(self.interface);
        }

        requested
            .parse()
            .map_err(|_| DiscoveryError::InvalidInterface(requested.to_string()))
    }

    /// Start the responder and return the address it listens on.
    pub async fn start_responder(
        &self,
        ctx: &Context,
        interface: &str,
        info: ServerInfo,
    ) -> Result<SocketAddr, DiscoveryError> {
        let interface = self.interface(interface)?;
        let reply = info.encode()?;

        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.port));
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| DiscoveryError::Bind { addr, source })?;

        if self.group.is_multicast() {
            socket
                .join_multicast_v4(self.group, interface)
                .map_err(|source| DiscoveryError::JoinGroup {
                    group: self.group,
                    source,
                })?;
        }

        let local = socket.local_addr()?;
        info!(%local, name = %info.name, "Started multicast responder");

        let ctx = ctx.clone();
        tokio::spawn(async move {
            serve_lookups(&ctx, &socket, &info.version, &reply).await;
            debug!(%local, "Stopped multicast responder");
        });

        Ok(local)
    }
}

async fn serve_lookups(ctx: &Context, socket: &UdpSocket, version: &str, reply: &[u8]) {
    let mut buf = [0u8; MAX_DATAGRAM];

    loop {
        let (n, src) = tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    error!("Failed to read from network endpoint: {}", e);
                    return;
                }
            },
            _ = ctx.cancelled() => return,
        };

        let query: ServerInfo = match serde_json::from_slice(&buf[..n]) {
            Ok(query) => query,
            Err(e) => {
                warn!(%src, "Failed to parse received multicast server info: {}", e);
                continue;
            }
        };

        if query.version != version {
            warn!(%src, version = %query.version, "Ignoring lookup with different version");
            continue;
        }

        if let Err(e) = socket.send_to(reply, src).await {
            error!(dest = %src, "Failed to send reply: {}", e);
        }
    }
}

#[async_trait]
impl PeerDiscovery for MulticastDiscovery {
    async fn respond(
        &self,
        ctx: &Context,
        interface: &str,
        info: ServerInfo,
    ) -> Result<(), DiscoveryError> {
        self.start_responder(ctx, interface, info).await.map(|_| ())
    }

    async fn lookup(
        &self,
        ctx: &Context,
        interface: &str,
        version: &str,
    ) -> Result<ServerInfo, DiscoveryError> {
        let interface = self.interface(interface)?;

        // Binding to the interface address selects the outgoing interface
        let addr = SocketAddr::V4(SocketAddrV4::new(interface, 0));
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| DiscoveryError::Bind { addr, source })?;

        let query = ServerInfo {
            version: version.to_string(),
            ..Default::default()
        }
        .encode()?;
        let target = SocketAddrV4::new(self.group, self.port);

        let mut ticker = tokio::time::interval(LOOKUP_INTERVAL);
        let mut buf = [0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = socket.send_to(&query, target).await {
                        error!(%target, "Failed to send multicast message: {}", e);
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    let (n, src) = received?;
                    match serde_json::from_slice::<ServerInfo>(&buf[..n]) {
                        Ok(found) if found.version == version => {
                            info!(name = %found.name, address = %found.address, "Found eligible system");
                            return Ok(found);
                        }
                        Ok(found) => warn!(
                            %src,
                            name = %found.name,
                            version = %found.version,
                            "System has a version mismatch"
                        ),
                        Err(e) => warn!(%src, "Failed to parse received multicast server info: {}", e),
                    }
                }
                cause = ctx.cancelled_cause() => return Err(cause.into()),
            }
        }
    }
}
