//! Subsystem service abstraction.
//!
//! Each independently clustered subsystem (the cluster daemon itself,
//! virtualization, storage, network) is reached through a [`Service`]
//! handle. Handles own their client connection; callers never look past
//! this interface except through the typed capability accessors such as
//! [`Service::as_disk_lister`].

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::{Cancelled, Context};
use crate::intent::JoinConfig;

/// Supported subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    /// The cluster daemon's own membership (the orchestrator itself)
    Cluster,
    /// Virtualization manager
    Virtualization,
    /// Distributed storage manager
    Storage,
    /// Software-defined network manager
    Network,
}

impl ServiceType {
    pub const ALL: [ServiceType; 4] = [
        ServiceType::Cluster,
        ServiceType::Virtualization,
        ServiceType::Storage,
        ServiceType::Network,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cluster => "cluster",
            Self::Virtualization => "virtualization",
            Self::Storage => "storage",
            Self::Network => "network",
        }
    }
}

impl Display for ServiceType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// The subsystem is installed but not initialized yet.
    #[error("{0} is not initialized")]
    Unavailable(ServiceType),

    #[error("{service} request failed: {message}")]
    Request { service: ServiceType, message: String },

    #[error("No join token for {0}")]
    MissingToken(ServiceType),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

pub type Result<T> = std::result::Result<T, ServiceError>;

/// A disk known to a storage subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    /// Member the disk is attached to
    pub location: String,
    /// Device path
    pub path: String,
}

/// Common capability set of every clustered subsystem.
#[async_trait]
pub trait Service: Send + Sync {
    /// Form a new single-member cluster.
    async fn bootstrap(&self, ctx: &Context) -> Result<()>;

    /// Join an existing cluster using the token in `config`.
    async fn join(&self, ctx: &Context, config: &JoinConfig) -> Result<()>;

    /// Issue a single-use join token for `peer`.
    async fn issue_token(&self, ctx: &Context, peer: &str) -> Result<String>;

    /// Revoke an unused join token.
    async fn delete_token(&self, ctx: &Context, peer: &str) -> Result<()>;

    /// Current members, name to address.
    async fn cluster_members(&self, ctx: &Context) -> Result<BTreeMap<String, String>>;

    async fn delete_cluster_member(&self, ctx: &Context, name: &str, force: bool) -> Result<()>;

    fn service_type(&self) -> ServiceType;

    /// Disk inventory capability, exposed only by subsystems that have one.
    fn as_disk_lister(&self) -> Option<&dyn DiskLister> {
        None
    }
}

/// Extension capability for subsystems that manage disks.
#[async_trait]
pub trait DiskLister: Send + Sync {
    async fn list_disks(&self, ctx: &Context) -> Result<Vec<Disk>>;
}
