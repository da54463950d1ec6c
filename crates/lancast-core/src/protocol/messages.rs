//! JSON message types for the viewer-facing control channel.
//!
//! The control plane is JSON over WebSocket.  Media itself travels over a
//! separate peer transport; only the signaling payloads (session descriptions
//! and ICE candidates) pass through here as opaque structures.
//!
//! # Message flow
//!
//! ```text
//! Viewer    → Presenter: JSON text frame → ClientMessage
//! Presenter → Viewer:    ServerMessage   → JSON text frame
//! ```
//!
//! # JSON discriminant
//!
//! Every message is a JSON object with a `"type"` field that identifies the
//! variant, spelled in kebab-case.  All other fields are flattened into the
//! same object and spelled in camelCase so browser viewers consume them
//! without translation.  For example:
//!
//! ```json
//! {"type":"reaction","viewerId":"v1","reaction":"hand","timestamp":1700000000000}
//! ```
//!
//! Serde's `#[serde(tag = "type")]` attribute handles this automatically.
//!
//! # Why separate viewer→presenter and presenter→viewer message types?
//!
//! The two directions carry different information: viewers *send* join/leave,
//! reactions, and signaling replies; the presenter *sends* roster updates,
//! control commands, and signaling offers.  Two distinct enums make it a
//! compile-time error to send a presenter-only message from a viewer, and
//! vice versa.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::domain::viewer::{ReactionKind, ScreenMode, Viewer, ViewerId};

/// Returns the current time as milliseconds since the Unix epoch.
///
/// Every wire message carries this so viewers can order events and display
/// relative timestamps without a clock-sync protocol.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Signaling payloads ────────────────────────────────────────────────────────

/// An SDP session description exchanged during media negotiation.
///
/// Field names follow the WebRTC JSON convention (`type` + `sdp`) so the
/// payload can be handed to a browser's `RTCPeerConnection` unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// `"offer"` or `"answer"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// The raw SDP text.
    pub sdp: String,
}

/// An ICE candidate exchanged during media negotiation.
///
/// Mirrors the browser's `RTCIceCandidateInit` dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

// ── Annotation payloads ───────────────────────────────────────────────────────

/// Drawing tool used for an annotation stroke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AnnotationTool {
    Pointer,
    Pen,
    Arrow,
    Rectangle,
    Text,
    Eraser,
}

/// A point in stream coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// One drawn annotation, overlaid on the stream by viewers.
///
/// The control plane does not interpret annotations; they pass through to
/// viewers as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub id: String,
    pub tool: AnnotationTool,
    pub color: String,
    pub stroke_width: f64,
    pub points: Vec<Point>,
    /// Label content; only set for the text tool.
    pub text: Option<String>,
    pub timestamp: u64,
}

// ── Viewer → Presenter messages ───────────────────────────────────────────────

/// All messages a viewer can send to the presenter over the control channel.
///
/// # Serde representation
///
/// ```json
/// {"type":"join","viewerId":"v1","displayName":"Dana","timestamp":0}
/// {"type":"reaction","viewerId":"v1","reaction":"thumbsUp","timestamp":0}
/// {"type":"leave","timestamp":0}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Viewer introduces itself and enters the roster.
    ///
    /// Must be the first message on a new connection.  Re-joining with the
    /// same `viewer_id` supersedes any previous connection for that id.
    #[serde(rename_all = "camelCase")]
    Join {
        /// Stable identifier chosen by the viewer and kept across reconnects.
        viewer_id: ViewerId,
        /// Human-readable label shown in the presenter's roster.
        display_name: String,
        timestamp: u64,
    },

    /// Viewer requests a graceful departure from the session.
    #[serde(rename_all = "camelCase")]
    Leave { timestamp: u64 },

    /// Viewer raises, changes, or clears its reaction.
    ///
    /// `reaction: None` (JSON `null`) clears the current reaction
    /// immediately; any other value replaces it and restarts the expiry
    /// countdown on the presenter side.
    #[serde(rename_all = "camelCase")]
    Reaction {
        viewer_id: ViewerId,
        reaction: Option<ReactionKind>,
        timestamp: u64,
    },

    /// Viewer replies to a media offer with its SDP answer.
    #[serde(rename_all = "camelCase")]
    Answer {
        answer: SessionDescription,
        timestamp: u64,
    },

    /// Viewer trickles an ICE candidate for its media session.
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        candidate: IceCandidateInit,
        timestamp: u64,
    },
}

// ── Presenter → Viewer messages ───────────────────────────────────────────────

/// All messages the presenter sends to viewers over the control channel.
///
/// # Serde representation
///
/// ```json
/// {"type":"welcome","presenterId":"p1","presenterName":"Ms. Ko","roomName":"Lab 2","roster":[],"timestamp":0}
/// {"type":"reaction-update","viewerId":"v1","reaction":"hand","timestamp":0}
/// {"type":"screen-mode","mode":"paused","message":null,"timestamp":0}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// First message to a newly joined viewer: presenter identity plus the
    /// full roster snapshot (including the joiner itself).
    #[serde(rename_all = "camelCase")]
    Welcome {
        presenter_id: String,
        presenter_name: String,
        room_name: String,
        roster: Vec<Viewer>,
        timestamp: u64,
    },

    /// Another viewer entered the roster.
    #[serde(rename_all = "camelCase")]
    ViewerJoined { viewer: Viewer, timestamp: u64 },

    /// A viewer left the roster (disconnect, leave, or kick).
    #[serde(rename_all = "camelCase")]
    ViewerLeft { viewer_id: ViewerId, timestamp: u64 },

    /// A single viewer's reaction changed; `reaction: null` means cleared.
    #[serde(rename_all = "camelCase")]
    ReactionUpdate {
        viewer_id: ViewerId,
        reaction: Option<ReactionKind>,
        timestamp: u64,
    },

    /// Aggregate snapshot of every current reaction, sent after `welcome` so
    /// a late joiner can render raised hands without waiting for updates.
    #[serde(rename_all = "camelCase")]
    AllReactions {
        reactions: HashMap<ViewerId, ReactionKind>,
        timestamp: u64,
    },

    /// The presenter wiped all reactions at once.
    #[serde(rename_all = "camelCase")]
    ClearReactions { timestamp: u64 },

    /// The broadcast switched between live, paused, and blanked output.
    #[serde(rename_all = "camelCase")]
    ScreenMode {
        mode: ScreenMode,
        /// Optional text shown to viewers while the screen is blanked.
        message: Option<String>,
        timestamp: u64,
    },

    /// A new or updated annotation to overlay on the stream.
    #[serde(rename_all = "camelCase")]
    Annotation {
        annotation: Annotation,
        timestamp: u64,
    },

    /// The presenter wiped every annotation.
    #[serde(rename_all = "camelCase")]
    AnnotationClear { timestamp: u64 },

    /// The presenter's pointer moved; `position: null` hides it.
    #[serde(rename_all = "camelCase")]
    PointerPosition {
        position: Option<Point>,
        timestamp: u64,
    },

    /// The presenter removed this viewer; the connection closes right after.
    #[serde(rename_all = "camelCase")]
    Kicked {
        reason: Option<String>,
        timestamp: u64,
    },

    /// Media offer for this viewer's session.
    #[serde(rename_all = "camelCase")]
    Offer {
        offer: SessionDescription,
        timestamp: u64,
    },

    /// ICE candidate from the presenter side of this viewer's session.
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        candidate: IceCandidateInit,
        timestamp: u64,
    },
}

impl ServerMessage {
    /// Returns the wire discriminant for this message.
    ///
    /// Used in log lines so field values (names, SDP blobs) never leak into
    /// the logs wholesale.
    pub fn message_type(&self) -> &'static str {
        match self {
            ServerMessage::Welcome { .. } => "welcome",
            ServerMessage::ViewerJoined { .. } => "viewer-joined",
            ServerMessage::ViewerLeft { .. } => "viewer-left",
            ServerMessage::ReactionUpdate { .. } => "reaction-update",
            ServerMessage::AllReactions { .. } => "all-reactions",
            ServerMessage::ClearReactions { .. } => "clear-reactions",
            ServerMessage::ScreenMode { .. } => "screen-mode",
            ServerMessage::Annotation { .. } => "annotation",
            ServerMessage::AnnotationClear { .. } => "annotation-clear",
            ServerMessage::PointerPosition { .. } => "pointer-position",
            ServerMessage::Kicked { .. } => "kicked",
            ServerMessage::Offer { .. } => "offer",
            ServerMessage::IceCandidate { .. } => "ice-candidate",
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
