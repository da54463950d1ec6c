//! Infrastructure layer: the WebSocket signaling front end and mDNS presence.

pub mod discovery;
pub mod signaling;
