//! Wire types exchanged during pairing.
//!
//! - [`SessionMessage`]: frames streamed between an operator client and the
//!   daemon over the session websocket
//! - [`ControlClose`]: the in-band close frame carrying an error cause
//! - [`Identity`] and [`SessionStop`]: small request/response bodies

pub mod message;

pub use message::{ControlClose, Identity, SessionMessage, SessionRole, SessionStop};
