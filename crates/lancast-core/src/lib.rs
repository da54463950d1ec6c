//! # lancast-core
//!
//! Shared library for LANCast containing the JSON control-plane protocol,
//! roster domain entities, network quality classification, and candidate
//! address ranking.
//!
//! This crate is used by the presenter host and by viewer-side tooling.
//! It has zero dependencies on sockets, mDNS, media transports, or OS APIs.
//!
//! # Architecture overview (for beginners)
//!
//! LANCast lets one computer (the "presenter") broadcast its screen to many
//! other computers (the "viewers") on the same local network.  Viewers can
//! send lightweight feedback signals ("reactions") back to the presenter.
//!
//! This crate (`lancast-core`) is the shared foundation.  It defines:
//!
//! - **`protocol`** – The JSON messages exchanged over the control channel.
//!   Every message is a JSON object tagged with a `"type"` field, so browser
//!   viewers and native viewers parse the same wire format.
//!
//! - **`domain`** – Pure business logic with no I/O.  The roster entities
//!   (`Viewer`, `ReactionKind`), the adaptive quality model (`QualityTier`
//!   and its encoding presets), and the address ranker used to pick the best
//!   LAN address from an mDNS record.

// Declare the two top-level modules.  Rust will look for each in a
// subdirectory with the same name (e.g., src/protocol/mod.rs).
pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `lancast_core::Viewer` instead of `lancast_core::domain::viewer::Viewer`.
pub use domain::quality::{interval_loss, EncodingPreset, QualityTier, TransportStats};
pub use domain::ranker::best_address;
pub use domain::viewer::{ReactionKind, ScreenMode, Viewer, ViewerId};
pub use protocol::messages::{
    now_ms, Annotation, AnnotationTool, ClientMessage, IceCandidateInit, Point, ServerMessage,
    SessionDescription,
};
