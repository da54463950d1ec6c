//! The LANCast control-plane wire protocol.

pub mod messages;
