use async_trait::async_trait;
use thiserror::Error;

use crate::context::{Cancelled, Context};
use crate::protocol::Identity;

/// The generic rejection of an unauthenticated intent, as sent on the wire.
pub const INVALID_HMAC: &str = "Invalid HMAC";

#[derive(Debug, Error)]
pub enum PeerError {
    /// The peer answered with an error status.
    #[error("{message}")]
    Remote { status: u16, message: String },

    #[error("Failed to reach peer: {0}")]
    Transport(String),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl PeerError {
    /// True when the peer rejected our HMAC.
    pub fn is_invalid_hmac(&self) -> bool {
        matches!(self, Self::Remote { message, .. } if message == INVALID_HMAC)
    }
}

/// Requests one daemon makes to another before any trust exists.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Fetch the public identity of the daemon at `address`.
    async fn identity(&self, ctx: &Context, address: &str) -> Result<Identity, PeerError>;

    /// Post a signed join intent. `authorization` is the HMAC header value
    /// and `body` the exact bytes it was computed over.
    async fn send_intent(
        &self,
        ctx: &Context,
        address: &str,
        authorization: &str,
        body: Vec<u8>,
    ) -> Result<(), PeerError>;
}
