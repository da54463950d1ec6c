//! Roster entities: viewers, reactions, and the broadcast screen mode.

use serde::{Deserialize, Serialize};

/// Stable identifier for a viewer, chosen by the viewer application and kept
/// across reconnects (browsers persist it in `localStorage`).
pub type ViewerId = String;

/// The feedback signals a viewer can raise.
///
/// A reaction is deliberately lossy state: it auto-expires on the presenter
/// side after a fixed window, so a forgotten raised hand disappears on its
/// own.  "No reaction" is modeled as `Option::None` rather than a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReactionKind {
    Hand,
    ThumbsUp,
    Question,
    Confused,
}

/// What the broadcast output currently shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScreenMode {
    /// Live screen content.
    Live,
    /// Frozen on the last frame.
    Paused,
    /// Blanked out, optionally with a message for viewers.
    Blank,
}

/// A connected viewer as tracked in the presenter's roster.
///
/// The coordinator owns the single authoritative copy; everything else
/// (events, welcome messages, roster snapshots) receives clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewer {
    pub id: ViewerId,
    pub display_name: String,
    /// Current reaction, if any.  Cleared automatically after the reaction
    /// window elapses.
    pub reaction: Option<ReactionKind>,
    /// When the current reaction was raised (ms since Unix epoch).
    pub reaction_set_at: Option<u64>,
    pub connected: bool,
    /// Last time any message arrived from this viewer (ms since Unix epoch).
    pub last_seen: u64,
}

impl Viewer {
    /// Creates a freshly joined viewer with no reaction.
    pub fn new(id: ViewerId, display_name: String, now: u64) -> Self {
        Self {
            id,
            display_name,
            reaction: None,
            reaction_set_at: None,
            connected: true,
            last_seen: now,
        }
    }
}
