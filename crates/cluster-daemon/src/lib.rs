//! cluster-daemon library: exposes the daemon components for testing.
//!
//! The binary in `main.rs` only parses arguments, binds the listeners and
//! hands them to [`Daemon::serve`].

pub mod api;
pub mod client;
pub mod config;
pub mod daemon;
pub mod services;
pub mod tls;

pub use config::Config;
pub use daemon::Daemon;
