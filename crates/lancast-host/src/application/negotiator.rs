//! SessionNegotiator: per-viewer media session lifecycle and adaptive quality.
//!
//! This use case owns one media session per joined viewer: it creates the
//! offer, routes the viewer's answer and ICE candidates to the right
//! transport, watches connection state, and adapts encoding quality to the
//! measured network conditions.
//!
//! # Architecture
//!
//! The negotiator depends only on traits ([`PeerTransport`],
//! [`TransportFactory`], [`MediaSource`], [`SignalChannel`]) and domain
//! types.  The concrete WebRTC stack is injected at construction time, which
//! keeps the whole lifecycle unit-testable with recording doubles.
//!
//! # Per-session pump
//!
//! Every session gets a companion Tokio task (the "pump") that:
//!
//! - forwards locally gathered ICE candidates to the viewer,
//! - forwards transport state changes, reporting terminal states back so the
//!   session is torn down,
//! - samples transport stats on a fixed interval, classifies the connection
//!   into a [`QualityTier`] from the interval packet loss and RTT, and
//!   applies the tier's [`EncodingPreset`] when the tier changes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use lancast_core::protocol::messages::{now_ms, IceCandidateInit, ServerMessage, SessionDescription};
use lancast_core::{interval_loss, EncodingPreset, QualityTier, TransportStats, Viewer, ViewerId};

use crate::application::coordinator::{CoordinatorHandle, SessionEvent};

/// How often each session samples its transport stats.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

/// Capacity of the negotiator event channel.
const CHANNEL_CAPACITY: usize = 64;

/// Error type for media negotiation.
///
/// A negotiation error is always scoped to one viewer; it is logged and the
/// other sessions carry on.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("no media source attached")]
    NoMediaSource,
    #[error("transport error: {0}")]
    Transport(String),
}

// ── Capability traits ─────────────────────────────────────────────────────────

/// Connection-level state reported by a media transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// Terminal states end the session; the negotiator tears it down.
    fn is_terminal(self) -> bool {
        matches!(
            self,
            TransportState::Disconnected | TransportState::Failed | TransportState::Closed
        )
    }
}

/// One peer media connection.
///
/// Infrastructure implementations wrap a real WebRTC peer connection; test
/// implementations record calls.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Produces the local session description for this connection.
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Applies the viewer's answer.
    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), NegotiationError>;

    /// Adds a remote ICE candidate trickled by the viewer.
    async fn add_remote_candidate(&self, candidate: IceCandidateInit)
        -> Result<(), NegotiationError>;

    /// Applies encoder parameters to the outgoing media sender.
    async fn apply_encoding(&self, preset: EncodingPreset) -> Result<(), NegotiationError>;

    /// Samples the current connection counters.
    async fn stats(&self) -> Result<TransportStats, NegotiationError>;

    /// Closes the connection and releases its resources.
    async fn close(&self);
}

/// A freshly created transport plus its outbound event streams.
pub struct PeerTransportHandles {
    pub transport: Arc<dyn PeerTransport>,
    /// Connection state transitions, ending with a terminal state.
    pub state_changes: mpsc::Receiver<TransportState>,
    /// ICE candidates gathered locally, to be forwarded to the viewer.
    pub local_candidates: mpsc::Receiver<IceCandidateInit>,
}

/// Builds one transport per viewer session, with the media source's tracks
/// already attached.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        viewer_id: &str,
        media: Arc<dyn MediaSource>,
    ) -> Result<PeerTransportHandles, NegotiationError>;
}

/// The captured screen content shared across all sessions.
pub trait MediaSource: Send + Sync {
    /// Whether the source is currently producing frames.
    fn is_live(&self) -> bool;

    /// Releases the underlying capture.  Called when no session needs the
    /// source anymore; implementations must tolerate repeated calls.
    fn release_tracks(&self);
}

/// Outbound signaling path back to a viewer.
///
/// Fire-and-forget: a viewer that disconnected mid-negotiation simply misses
/// the message, and the roster cleanup handles the rest.
#[async_trait]
pub trait SignalChannel: Send + Sync {
    async fn send_offer(&self, viewer_id: &str, offer: SessionDescription);
    async fn send_candidate(&self, viewer_id: &str, candidate: IceCandidateInit);
}

/// The coordinator's per-viewer send path is the production signal channel.
#[async_trait]
impl SignalChannel for CoordinatorHandle {
    async fn send_offer(&self, viewer_id: &str, offer: SessionDescription) {
        self.send_to(
            viewer_id.to_string(),
            ServerMessage::Offer {
                offer,
                timestamp: now_ms(),
            },
        )
        .await;
    }

    async fn send_candidate(&self, viewer_id: &str, candidate: IceCandidateInit) {
        self.send_to(
            viewer_id.to_string(),
            ServerMessage::IceCandidate {
                candidate,
                timestamp: now_ms(),
            },
        )
        .await;
    }
}

// ── Session state and events ──────────────────────────────────────────────────

/// Lifecycle of one viewer's media session.
///
/// `Closed` is terminal for the session object; a later `create_offer` for
/// the same viewer builds a brand-new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Offer sent, waiting for the answer and connectivity.
    Negotiating,
    /// Media is flowing.
    Connected,
    /// Torn down (viewer left, transport failed, or replaced).
    Closed,
}

/// Events the negotiator publishes for the UI and logging.
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiatorEvent {
    SessionStateChanged {
        viewer_id: ViewerId,
        state: SessionState,
    },
    QualityChanged {
        viewer_id: ViewerId,
        tier: QualityTier,
        rtt_ms: f64,
        loss: f64,
    },
}

// ── The negotiator ────────────────────────────────────────────────────────────

struct SessionEntry {
    transport: Arc<dyn PeerTransport>,
    pump: JoinHandle<()>,
}

/// Owns every active media session.  At most one session exists per viewer
/// id, and session ids are always a subset of the roster the coordinator
/// reports.
pub struct SessionNegotiator {
    factory: Arc<dyn TransportFactory>,
    signals: Arc<dyn SignalChannel>,
    media: Option<Arc<dyn MediaSource>>,
    sessions: HashMap<ViewerId, SessionEntry>,
    events: mpsc::Sender<NegotiatorEvent>,
    /// Pumps report terminal transport states here.
    terminated_tx: mpsc::Sender<ViewerId>,
    terminated_rx: Option<mpsc::Receiver<ViewerId>>,
    sample_interval: Duration,
}

impl SessionNegotiator {
    /// Creates a negotiator and the stream of its events.
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        signals: Arc<dyn SignalChannel>,
    ) -> (Self, mpsc::Receiver<NegotiatorEvent>) {
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (terminated_tx, terminated_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self {
                factory,
                signals,
                media: None,
                sessions: HashMap::new(),
                events: event_tx,
                terminated_tx,
                terminated_rx: Some(terminated_rx),
                sample_interval: SAMPLE_INTERVAL,
            },
            event_rx,
        )
    }

    /// Attaches (or detaches) the shared media source.  Sessions created
    /// from here on carry its tracks; existing sessions are unaffected.
    pub fn set_media_source(&mut self, media: Option<Arc<dyn MediaSource>>) {
        self.media = media;
    }

    /// Ids of all active sessions.
    pub fn session_ids(&self) -> Vec<ViewerId> {
        self.sessions.keys().cloned().collect()
    }

    /// Starts (or restarts) negotiation with one viewer.
    ///
    /// Any previous session for the id is closed first, so repeated calls
    /// can never leak a transport.  The offer travels back through the
    /// signal channel.
    pub async fn create_offer(&mut self, viewer_id: &str) -> Result<(), NegotiationError> {
        let media = match &self.media {
            Some(m) => Arc::clone(m),
            None => return Err(NegotiationError::NoMediaSource),
        };

        // Close-and-replace; the media source stays attached for the
        // replacement, so no track release here.
        self.close_session_inner(viewer_id, false).await;

        let handles = self.factory.create(viewer_id, media).await?;
        let offer = handles.transport.create_offer().await?;
        self.signals.send_offer(viewer_id, offer).await;
        info!(%viewer_id, "offer sent");

        let pump = tokio::spawn(run_pump(PumpContext {
            viewer_id: viewer_id.to_string(),
            transport: Arc::clone(&handles.transport),
            signals: Arc::clone(&self.signals),
            events: self.events.clone(),
            terminated: self.terminated_tx.clone(),
            state_changes: handles.state_changes,
            local_candidates: handles.local_candidates,
            sample_interval: self.sample_interval,
        }));

        self.sessions.insert(
            viewer_id.to_string(),
            SessionEntry {
                transport: handles.transport,
                pump,
            },
        );
        self.emit_state(viewer_id, SessionState::Negotiating).await;
        Ok(())
    }

    /// Applies a viewer's answer.  No session for the id means the viewer
    /// answered an offer that was already torn down; that race is expected
    /// and ignored.
    pub async fn handle_answer(&mut self, viewer_id: &str, answer: SessionDescription) {
        let Some(entry) = self.sessions.get(viewer_id) else {
            debug!(%viewer_id, "answer without a session; ignored");
            return;
        };
        if let Err(e) = entry.transport.apply_answer(answer).await {
            warn!(%viewer_id, "failed to apply answer: {e}");
        }
    }

    /// Adds a remote ICE candidate from a viewer.  Same no-op semantics as
    /// [`Self::handle_answer`].
    pub async fn handle_ice_candidate(&mut self, viewer_id: &str, candidate: IceCandidateInit) {
        let Some(entry) = self.sessions.get(viewer_id) else {
            debug!(%viewer_id, "ice candidate without a session; ignored");
            return;
        };
        if let Err(e) = entry.transport.add_remote_candidate(candidate).await {
            warn!(%viewer_id, "failed to add remote candidate: {e}");
        }
    }

    /// Aligns sessions with the connected roster: closes sessions for
    /// departed viewers, offers to viewers without one (when a live media
    /// source is attached).
    pub async fn reconcile(&mut self, roster: &[Viewer]) {
        let connected: HashSet<&str> = roster.iter().map(|v| v.id.as_str()).collect();

        let stale: Vec<ViewerId> = self
            .sessions
            .keys()
            .filter(|id| !connected.contains(id.as_str()))
            .cloned()
            .collect();
        for viewer_id in stale {
            debug!(%viewer_id, "closing session for departed viewer");
            self.close_session(&viewer_id).await;
        }

        let offer_ready = self.media.as_ref().map(|m| m.is_live()).unwrap_or(false);
        if !offer_ready {
            return;
        }
        for viewer in roster {
            if !self.sessions.contains_key(&viewer.id) {
                if let Err(e) = self.create_offer(&viewer.id).await {
                    warn!(viewer_id = %viewer.id, "offer failed during reconcile: {e}");
                }
            }
        }
    }

    /// Tears down one session; releases the media capture if it was the
    /// last. Unknown ids are a no-op.
    pub async fn close_session(&mut self, viewer_id: &str) {
        self.close_session_inner(viewer_id, true).await;
    }

    async fn close_session_inner(&mut self, viewer_id: &str, release_media: bool) {
        let Some(entry) = self.sessions.remove(viewer_id) else {
            return;
        };
        entry.pump.abort();
        entry.transport.close().await;
        info!(%viewer_id, "session closed");
        self.emit_state(viewer_id, SessionState::Closed).await;

        if release_media && self.sessions.is_empty() {
            if let Some(media) = &self.media {
                debug!("last session gone; releasing media tracks");
                media.release_tracks();
            }
        }
    }

    /// Closes every session and releases the media source.
    pub async fn stop(&mut self) {
        let ids: Vec<ViewerId> = self.sessions.keys().cloned().collect();
        for viewer_id in ids {
            self.close_session_inner(&viewer_id, false).await;
        }
        if let Some(media) = &self.media {
            media.release_tracks();
        }
    }

    /// Drives the negotiator from the coordinator's event stream until that
    /// stream ends, then stops.
    ///
    /// Roster reconciliation is driven by the `roster` watch channel, not by
    /// the event stream: the watch is latest-wins, so even if the lossy event
    /// channel drops a `RosterChanged` under backlog, the next `changed()`
    /// wakeup reconciles against the current roster.
    pub async fn run(
        mut self,
        mut session_events: mpsc::Receiver<SessionEvent>,
        mut roster: watch::Receiver<Vec<Viewer>>,
    ) {
        let mut terminated_rx = match self.terminated_rx.take() {
            Some(rx) => rx,
            None => return,
        };
        let mut roster_open = true;
        // Catch up with a roster that changed before this task started.
        let initial = roster.borrow_and_update().clone();
        if !initial.is_empty() {
            self.reconcile(&initial).await;
        }
        loop {
            tokio::select! {
                event = session_events.recv() => match event {
                    Some(SessionEvent::ViewerAnswer { viewer_id, answer }) => {
                        self.handle_answer(&viewer_id, answer).await;
                    }
                    Some(SessionEvent::ViewerCandidate { viewer_id, candidate }) => {
                        self.handle_ice_candidate(&viewer_id, candidate).await;
                    }
                    // Roster changes arrive via the watch channel; reaction
                    // traffic is not a negotiation concern.
                    Some(_) => {}
                    None => break,
                },
                changed = roster.changed(), if roster_open => match changed {
                    Ok(()) => {
                        let snapshot = roster.borrow_and_update().clone();
                        self.reconcile(&snapshot).await;
                    }
                    Err(_) => roster_open = false,
                },
                Some(viewer_id) = terminated_rx.recv() => {
                    self.close_session(&viewer_id).await;
                }
            }
        }
        self.stop().await;
    }

    async fn emit_state(&self, viewer_id: &str, state: SessionState) {
        let _ = self
            .events
            .send(NegotiatorEvent::SessionStateChanged {
                viewer_id: viewer_id.to_string(),
                state,
            })
            .await;
    }
}

// ── Per-session pump ──────────────────────────────────────────────────────────

struct PumpContext {
    viewer_id: ViewerId,
    transport: Arc<dyn PeerTransport>,
    signals: Arc<dyn SignalChannel>,
    events: mpsc::Sender<NegotiatorEvent>,
    terminated: mpsc::Sender<ViewerId>,
    state_changes: mpsc::Receiver<TransportState>,
    local_candidates: mpsc::Receiver<IceCandidateInit>,
    sample_interval: Duration,
}

/// Runs one session's candidate forwarding, state watching, and quality
/// sampling until the transport reaches a terminal state (or the pump is
/// aborted by a session close).
async fn run_pump(mut ctx: PumpContext) {
    let mut ticker = interval(ctx.sample_interval);
    ticker.tick().await; // skip the immediate first tick

    let mut previous = TransportStats::default();
    let mut tier: Option<QualityTier> = None;
    let mut states_open = true;
    let mut candidates_open = true;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = match ctx.transport.stats().await {
                    Ok(s) => s,
                    Err(e) => {
                        debug!(viewer_id = %ctx.viewer_id, "stats unavailable: {e}");
                        continue;
                    }
                };
                let loss = interval_loss(previous, stats);
                previous = stats;

                let next = QualityTier::classify(stats.rtt_ms, loss);
                if tier == Some(next) {
                    continue;
                }
                tier = Some(next);
                debug!(viewer_id = %ctx.viewer_id, ?next, rtt_ms = stats.rtt_ms, loss,
                    "quality tier changed");
                if let Err(e) = ctx.transport.apply_encoding(next.preset()).await {
                    warn!(viewer_id = %ctx.viewer_id, "failed to apply encoding preset: {e}");
                }
                let _ = ctx.events.send(NegotiatorEvent::QualityChanged {
                    viewer_id: ctx.viewer_id.clone(),
                    tier: next,
                    rtt_ms: stats.rtt_ms,
                    loss,
                }).await;
            }

            state = ctx.state_changes.recv(), if states_open => match state {
                Some(state) if state.is_terminal() => {
                    debug!(viewer_id = %ctx.viewer_id, ?state, "transport reached terminal state");
                    let _ = ctx.terminated.send(ctx.viewer_id.clone()).await;
                    break;
                }
                Some(TransportState::Connected) => {
                    let _ = ctx.events.send(NegotiatorEvent::SessionStateChanged {
                        viewer_id: ctx.viewer_id.clone(),
                        state: SessionState::Connected,
                    }).await;
                }
                Some(_) => {}
                None => states_open = false,
            },

            candidate = ctx.local_candidates.recv(), if candidates_open => match candidate {
                Some(candidate) => {
                    ctx.signals.send_candidate(&ctx.viewer_id, candidate).await;
                }
                None => candidates_open = false,
            },
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
