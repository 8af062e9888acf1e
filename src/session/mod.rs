//! Session module for the live conversation service
//!
//! Frames outbound audio and control messages, classifies inbound messages
//! and reports connection lifecycle changes.

mod client;
pub mod protocol;
mod transport;

pub use client::{Credential, LiveSessionClient, SessionError, SessionState};
pub use protocol::{InboundMessage, Role, UsageReport};
pub use transport::{SessionConnector, WireInbound, WireLink, WsConnector};
