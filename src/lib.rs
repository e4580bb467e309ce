//! N-party mesh calling client.
//!
//! Every participant keeps one direct transport per remote participant; a
//! relay server only forwards signaling. [`Session`] ties the pieces
//! together and [`SessionHandle`] is how callers drive it.

pub mod audio;
pub mod config;
pub mod connection;
pub mod error;
pub mod media;
pub mod metrics;
pub mod negotiation;
pub mod registry;
pub mod room;
pub mod session;
pub mod signaling;
pub mod timer;
pub mod transport;
pub mod webrtc;

#[cfg(test)]
mod testing;

pub use config::{ClientConfig, LatencySource, SessionConfig};
pub use connection::{ExitReason, SessionNotice, SessionStatus};
pub use error::{Error, ErrorCategory, RejectReason, Result};
pub use metrics::MetricsSnapshot;
pub use session::{Session, SessionHandle};
