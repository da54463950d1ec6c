//! Application layer: the session coordinator and the media negotiator.
//!
//! Both depend only on domain types, channels, and capability traits, so the
//! whole layer is unit-testable without sockets or a real media transport.

pub mod coordinator;
pub mod negotiator;
