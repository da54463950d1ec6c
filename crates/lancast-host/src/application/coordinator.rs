//! SessionCoordinator: the single owner of the viewer roster.
//!
//! The coordinator runs as one Tokio task driven by a command channel.  All
//! roster state (who is connected, who has which reaction, which connection
//! belongs to which viewer) lives inside that task, so there are no locks and
//! no cross-task data races by construction.
//!
//! Connection reader tasks, reaction expiry timers, and the public
//! [`CoordinatorHandle`] all talk to the actor through the same channel.
//! Messages from one viewer arrive in order because one reader feeds the
//! channel per connection; no ordering is promised across viewers.
//!
//! # Reaction expiry
//!
//! A raised reaction clears itself after [`CoordinatorConfig::reaction_timeout`].
//! Each (re)raise aborts the previous timer task and bumps a per-viewer
//! generation counter; an expiry that fires with a stale generation is
//! ignored, so a timer that escaped the abort can never wipe a newer
//! reaction.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use lancast_core::protocol::messages::{
    now_ms, ClientMessage, IceCandidateInit, ServerMessage, SessionDescription,
};
use lancast_core::{ReactionKind, ScreenMode, Viewer, ViewerId};

/// How long a reaction stays up before it clears itself.
pub const DEFAULT_REACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the command and event channels.
const CHANNEL_CAPACITY: usize = 64;

// ── Configuration ─────────────────────────────────────────────────────────────

/// Static configuration for one broadcast session.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Unique identity of this presenter process, sent in `welcome`.
    pub presenter_id: String,
    /// Human-readable presenter name.
    pub presenter_name: String,
    /// Room name shown to viewers and advertised over mDNS.
    pub room_name: String,
    /// Reaction auto-expiry window.
    pub reaction_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            presenter_id: Uuid::new_v4().to_string(),
            presenter_name: "Presenter".to_string(),
            room_name: "LANCast".to_string(),
            reaction_timeout: DEFAULT_REACTION_TIMEOUT,
        }
    }
}

// ── Channel message types ─────────────────────────────────────────────────────

/// Lifecycle and traffic events for one viewer connection.
///
/// Produced by the signaling front end (or by tests standing in for it) and
/// consumed by the coordinator actor.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A transport-level connection opened.  `outbound` is where the
    /// coordinator queues messages for this connection; dropping it tells
    /// the writer task to flush and close with a normal closure.
    Opened {
        conn_id: u64,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    },
    /// A parsed control message arrived on the connection.
    Inbound { conn_id: u64, message: ClientMessage },
    /// The connection closed (viewer gone, network drop, or our own close).
    Closed { conn_id: u64 },
}

/// Commands accepted by the coordinator actor.
#[derive(Debug)]
enum Command {
    Connection(ConnectionEvent),
    Kick {
        viewer_id: ViewerId,
        reason: Option<String>,
    },
    ClearReactions,
    SetScreenMode {
        mode: ScreenMode,
        message: Option<String>,
    },
    Broadcast(ServerMessage),
    SendTo {
        viewer_id: ViewerId,
        message: ServerMessage,
    },
    Roster(oneshot::Sender<Vec<Viewer>>),
    /// Internal: a reaction expiry timer fired.
    ExpireReaction { viewer_id: ViewerId, generation: u64 },
    Stop,
}

/// Events the coordinator publishes to the rest of the application
/// (negotiation layer, UI, logging).
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The set of connected viewers changed.
    RosterChanged { roster: Vec<Viewer> },
    /// One viewer's reaction changed; `None` means cleared or expired.
    ReactionChanged {
        viewer_id: ViewerId,
        reaction: Option<ReactionKind>,
    },
    /// All reactions were wiped at once.
    ReactionsCleared,
    /// A viewer answered a media offer.
    ViewerAnswer {
        viewer_id: ViewerId,
        answer: SessionDescription,
    },
    /// A viewer trickled an ICE candidate.
    ViewerCandidate {
        viewer_id: ViewerId,
        candidate: IceCandidateInit,
    },
}

// ── Public handle ─────────────────────────────────────────────────────────────

/// Cloneable handle to a running coordinator.
///
/// All methods are fire-and-forget against the actor; if the coordinator has
/// already stopped they become no-ops, which is the behavior callers want
/// during shutdown races.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
    roster_rx: watch::Receiver<Vec<Viewer>>,
}

impl CoordinatorHandle {
    /// Feeds a connection event into the coordinator.
    pub async fn connection_event(&self, event: ConnectionEvent) {
        let _ = self.tx.send(Command::Connection(event)).await;
    }

    /// Removes a viewer: sends `kicked`, closes the connection, and cleans
    /// up the roster.  Unknown ids are a no-op.
    pub async fn kick(&self, viewer_id: ViewerId, reason: Option<String>) {
        let _ = self.tx.send(Command::Kick { viewer_id, reason }).await;
    }

    /// Wipes every reaction and broadcasts a single `clear-reactions`.
    pub async fn clear_all_reactions(&self) {
        let _ = self.tx.send(Command::ClearReactions).await;
    }

    /// Announces a screen mode change to every viewer.
    pub async fn set_screen_mode(&self, mode: ScreenMode, message: Option<String>) {
        let _ = self.tx.send(Command::SetScreenMode { mode, message }).await;
    }

    /// Sends a message to every connected viewer.  Unreachable viewers are
    /// skipped, never retried.
    pub async fn broadcast(&self, message: ServerMessage) {
        let _ = self.tx.send(Command::Broadcast(message)).await;
    }

    /// Sends a message to one viewer.  Unknown ids are a no-op.
    pub async fn send_to(&self, viewer_id: ViewerId, message: ServerMessage) {
        let _ = self.tx.send(Command::SendTo { viewer_id, message }).await;
    }

    /// Returns a watch receiver that always holds the latest roster.
    ///
    /// Unlike the [`SessionEvent`] stream, which is advisory and lossy under
    /// backlog, the watch channel is latest-wins: a slow consumer may skip
    /// intermediate rosters but always observes the current one.
    pub fn roster_updates(&self) -> watch::Receiver<Vec<Viewer>> {
        self.roster_rx.clone()
    }

    /// Returns a snapshot of the current roster.
    ///
    /// Empty if the coordinator has already stopped.
    pub async fn roster(&self) -> Vec<Viewer> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::Roster(reply_tx)).await.is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Stops the coordinator: cancels pending expiry timers and closes every
    /// viewer connection with a normal closure.  Idempotent.
    pub async fn stop(&self) {
        let _ = self.tx.send(Command::Stop).await;
    }
}

// ── The actor ─────────────────────────────────────────────────────────────────

struct ConnEntry {
    outbound: mpsc::UnboundedSender<ServerMessage>,
    /// Set once the connection has joined.
    viewer_id: Option<ViewerId>,
}

struct ViewerEntry {
    viewer: Viewer,
    conn_id: u64,
    /// Bumped on every reaction change; guards stale expiry timers.
    generation: u64,
    expiry: Option<JoinHandle<()>>,
}

/// The roster-owning actor.  Constructed via [`SessionCoordinator::spawn`].
pub struct SessionCoordinator {
    config: CoordinatorConfig,
    /// Sender side of our own command channel, cloned into expiry timers.
    cmd_tx: mpsc::Sender<Command>,
    events: mpsc::Sender<SessionEvent>,
    roster_tx: watch::Sender<Vec<Viewer>>,
    conns: HashMap<u64, ConnEntry>,
    viewers: HashMap<ViewerId, ViewerEntry>,
}

impl SessionCoordinator {
    /// Spawns the coordinator task and returns a handle plus the event
    /// stream.
    pub fn spawn(config: CoordinatorConfig) -> (CoordinatorHandle, mpsc::Receiver<SessionEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (roster_tx, roster_rx) = watch::channel(Vec::new());

        let actor = SessionCoordinator {
            config,
            cmd_tx: cmd_tx.clone(),
            events: event_tx,
            roster_tx,
            conns: HashMap::new(),
            viewers: HashMap::new(),
        };
        tokio::spawn(actor.run(cmd_rx));

        (
            CoordinatorHandle {
                tx: cmd_tx,
                roster_rx,
            },
            event_rx,
        )
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        info!(room = %self.config.room_name, "session coordinator started");
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Connection(event) => self.handle_connection_event(event),
                Command::Kick { viewer_id, reason } => self.handle_kick(&viewer_id, reason),
                Command::ClearReactions => self.handle_clear_reactions(),
                Command::SetScreenMode { mode, message } => {
                    self.broadcast_message(ServerMessage::ScreenMode {
                        mode,
                        message,
                        timestamp: now_ms(),
                    });
                }
                Command::Broadcast(message) => self.broadcast_message(message),
                Command::SendTo { viewer_id, message } => self.send_to_viewer(&viewer_id, message),
                Command::Roster(reply) => {
                    let _ = reply.send(self.roster_snapshot());
                }
                Command::ExpireReaction { viewer_id, generation } => {
                    self.handle_expiry(&viewer_id, generation);
                }
                Command::Stop => break,
            }
        }
        self.shutdown();
        info!("session coordinator stopped");
    }

    // ── Connection events ─────────────────────────────────────────────────────

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened { conn_id, outbound } => {
                debug!(conn_id, "connection opened");
                self.conns.insert(
                    conn_id,
                    ConnEntry {
                        outbound,
                        viewer_id: None,
                    },
                );
            }
            ConnectionEvent::Inbound { conn_id, message } => {
                self.handle_inbound(conn_id, message);
            }
            ConnectionEvent::Closed { conn_id } => {
                self.handle_disconnect(conn_id);
            }
        }
    }

    fn handle_inbound(&mut self, conn_id: u64, message: ClientMessage) {
        match message {
            ClientMessage::Join {
                viewer_id,
                display_name,
                ..
            } => self.handle_join(conn_id, viewer_id, display_name),
            ClientMessage::Leave { .. } => self.handle_disconnect(conn_id),
            ClientMessage::Reaction {
                viewer_id, reaction, ..
            } => self.handle_reaction(conn_id, viewer_id, reaction),
            ClientMessage::Answer { answer, .. } => {
                if let Some(viewer_id) = self.bound_viewer(conn_id) {
                    self.touch(&viewer_id);
                    self.emit(SessionEvent::ViewerAnswer { viewer_id, answer });
                } else {
                    warn!(conn_id, "answer from connection that never joined; dropped");
                }
            }
            ClientMessage::IceCandidate { candidate, .. } => {
                if let Some(viewer_id) = self.bound_viewer(conn_id) {
                    self.touch(&viewer_id);
                    self.emit(SessionEvent::ViewerCandidate { viewer_id, candidate });
                } else {
                    warn!(conn_id, "ice candidate from connection that never joined; dropped");
                }
            }
        }
    }

    fn handle_join(&mut self, conn_id: u64, viewer_id: ViewerId, display_name: String) {
        if !self.conns.contains_key(&conn_id) {
            warn!(conn_id, "join from unknown connection; dropped");
            return;
        }

        // Last join wins: a re-join with the same id supersedes the previous
        // connection, which is closed without a viewer-left broadcast (the
        // viewer never actually left the session).
        let mut generation = 0;
        if let Some(prev) = self.viewers.remove(&viewer_id) {
            generation = prev.generation + 1;
            if let Some(timer) = prev.expiry {
                timer.abort();
            }
            if prev.conn_id != conn_id {
                debug!(%viewer_id, old_conn = prev.conn_id, new_conn = conn_id,
                    "re-join supersedes previous connection");
                self.conns.remove(&prev.conn_id);
            }
        }

        let viewer = Viewer::new(viewer_id.clone(), display_name, now_ms());
        if let Some(conn) = self.conns.get_mut(&conn_id) {
            conn.viewer_id = Some(viewer_id.clone());
        }
        self.viewers.insert(
            viewer_id.clone(),
            ViewerEntry {
                viewer: viewer.clone(),
                conn_id,
                generation,
                expiry: None,
            },
        );
        info!(%viewer_id, name = %viewer.display_name, "viewer joined");

        // The joiner gets the full picture; everyone else just the delta.
        self.send_to_conn(
            conn_id,
            ServerMessage::Welcome {
                presenter_id: self.config.presenter_id.clone(),
                presenter_name: self.config.presenter_name.clone(),
                room_name: self.config.room_name.clone(),
                roster: self.roster_snapshot(),
                timestamp: now_ms(),
            },
        );
        self.send_to_conn(
            conn_id,
            ServerMessage::AllReactions {
                reactions: self.reaction_snapshot(),
                timestamp: now_ms(),
            },
        );
        self.broadcast_except(
            &viewer_id,
            ServerMessage::ViewerJoined {
                viewer,
                timestamp: now_ms(),
            },
        );
        self.emit_roster_changed();
    }

    fn handle_reaction(
        &mut self,
        conn_id: u64,
        viewer_id: ViewerId,
        reaction: Option<ReactionKind>,
    ) {
        let Some(entry) = self.viewers.get_mut(&viewer_id) else {
            debug!(%viewer_id, "reaction for unknown viewer; dropped");
            return;
        };
        if entry.conn_id != conn_id {
            debug!(%viewer_id, conn_id, "reaction from superseded connection; dropped");
            return;
        }

        // Replace, never stack: the previous timer dies with its generation.
        if let Some(timer) = entry.expiry.take() {
            timer.abort();
        }
        entry.generation += 1;

        let now = now_ms();
        entry.viewer.last_seen = now;
        entry.viewer.reaction = reaction;
        entry.viewer.reaction_set_at = reaction.map(|_| now);

        if reaction.is_some() {
            let cmd_tx = self.cmd_tx.clone();
            let id = viewer_id.clone();
            let generation = entry.generation;
            let timeout = self.config.reaction_timeout;
            entry.expiry = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = cmd_tx
                    .send(Command::ExpireReaction {
                        viewer_id: id,
                        generation,
                    })
                    .await;
            }));
        }

        self.broadcast_message(ServerMessage::ReactionUpdate {
            viewer_id: viewer_id.clone(),
            reaction,
            timestamp: now,
        });
        self.emit(SessionEvent::ReactionChanged { viewer_id, reaction });
    }

    fn handle_expiry(&mut self, viewer_id: &ViewerId, generation: u64) {
        let Some(entry) = self.viewers.get_mut(viewer_id) else {
            return; // viewer left before the timer fired
        };
        if entry.generation != generation || entry.viewer.reaction.is_none() {
            return; // stale timer
        }

        debug!(%viewer_id, "reaction expired");
        entry.generation += 1;
        entry.expiry = None;
        entry.viewer.reaction = None;
        entry.viewer.reaction_set_at = None;

        self.broadcast_message(ServerMessage::ReactionUpdate {
            viewer_id: viewer_id.clone(),
            reaction: None,
            timestamp: now_ms(),
        });
        self.emit(SessionEvent::ReactionChanged {
            viewer_id: viewer_id.clone(),
            reaction: None,
        });
    }

    fn handle_disconnect(&mut self, conn_id: u64) {
        let Some(conn) = self.conns.remove(&conn_id) else {
            return; // already cleaned up (kick or supersede)
        };
        let Some(viewer_id) = conn.viewer_id else {
            debug!(conn_id, "connection closed before joining");
            return;
        };

        // A superseded connection still carries its old viewer binding, but
        // the roster entry now points at the newer connection.
        match self.viewers.get(&viewer_id) {
            Some(entry) if entry.conn_id == conn_id => {}
            _ => return,
        }

        let entry = self.viewers.remove(&viewer_id).expect("checked above");
        if let Some(timer) = entry.expiry {
            timer.abort();
        }
        info!(%viewer_id, "viewer left");

        self.broadcast_message(ServerMessage::ViewerLeft {
            viewer_id,
            timestamp: now_ms(),
        });
        self.emit_roster_changed();
    }

    // ── Presenter operations ──────────────────────────────────────────────────

    fn handle_kick(&mut self, viewer_id: &ViewerId, reason: Option<String>) {
        let Some(entry) = self.viewers.get(viewer_id) else {
            debug!(%viewer_id, "kick for unknown viewer; no-op");
            return;
        };
        let conn_id = entry.conn_id;

        info!(%viewer_id, ?reason, "kicking viewer");
        self.send_to_conn(
            conn_id,
            ServerMessage::Kicked {
                reason,
                timestamp: now_ms(),
            },
        );

        // Dropping the connection entry closes the channel; the writer task
        // flushes the kicked message and then sends the close frame.
        self.conns.remove(&conn_id);

        let entry = self.viewers.remove(viewer_id).expect("checked above");
        if let Some(timer) = entry.expiry {
            timer.abort();
        }
        self.broadcast_message(ServerMessage::ViewerLeft {
            viewer_id: viewer_id.clone(),
            timestamp: now_ms(),
        });
        self.emit_roster_changed();
    }

    fn handle_clear_reactions(&mut self) {
        for entry in self.viewers.values_mut() {
            if let Some(timer) = entry.expiry.take() {
                timer.abort();
            }
            entry.generation += 1;
            entry.viewer.reaction = None;
            entry.viewer.reaction_set_at = None;
        }
        // One batched broadcast, not one update per viewer.
        self.broadcast_message(ServerMessage::ClearReactions { timestamp: now_ms() });
        self.emit(SessionEvent::ReactionsCleared);
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn bound_viewer(&self, conn_id: u64) -> Option<ViewerId> {
        self.conns.get(&conn_id).and_then(|c| c.viewer_id.clone())
    }

    fn touch(&mut self, viewer_id: &ViewerId) {
        if let Some(entry) = self.viewers.get_mut(viewer_id) {
            entry.viewer.last_seen = now_ms();
        }
    }

    fn roster_snapshot(&self) -> Vec<Viewer> {
        self.viewers.values().map(|e| e.viewer.clone()).collect()
    }

    fn reaction_snapshot(&self) -> HashMap<ViewerId, ReactionKind> {
        self.viewers
            .values()
            .filter_map(|e| e.viewer.reaction.map(|r| (e.viewer.id.clone(), r)))
            .collect()
    }

    fn send_to_conn(&self, conn_id: u64, message: ServerMessage) {
        if let Some(conn) = self.conns.get(&conn_id) {
            // A failed send means the writer is already gone; the Closed
            // event will clean up shortly.
            let _ = conn.outbound.send(message);
        }
    }

    fn send_to_viewer(&self, viewer_id: &ViewerId, message: ServerMessage) {
        if let Some(entry) = self.viewers.get(viewer_id) {
            self.send_to_conn(entry.conn_id, message);
        } else {
            debug!(%viewer_id, kind = message.message_type(), "send to unknown viewer; dropped");
        }
    }

    fn broadcast_message(&self, message: ServerMessage) {
        for entry in self.viewers.values() {
            self.send_to_conn(entry.conn_id, message.clone());
        }
    }

    fn broadcast_except(&self, skip: &ViewerId, message: ServerMessage) {
        for entry in self.viewers.values() {
            if &entry.viewer.id != skip {
                self.send_to_conn(entry.conn_id, message.clone());
            }
        }
    }

    fn emit_roster_changed(&self) {
        let roster = self.roster_snapshot();
        // The watch channel is the authoritative feed: it always holds the
        // newest roster even when the event channel is backlogged.
        let _ = self.roster_tx.send(roster.clone());
        self.emit(SessionEvent::RosterChanged { roster });
    }

    /// Publishes an event without blocking the actor.  Events are advisory;
    /// if nobody is listening (or the listener is hopelessly behind) they
    /// are dropped.
    fn emit(&self, event: SessionEvent) {
        if let Err(e) = self.events.try_send(event) {
            debug!("session event dropped: {e}");
        }
    }

    fn shutdown(&mut self) {
        for entry in self.viewers.values_mut() {
            if let Some(timer) = entry.expiry.take() {
                timer.abort();
            }
        }
        self.viewers.clear();
        // Dropping the outbound senders makes every writer task flush and
        // close its connection normally.
        self.conns.clear();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use lancast_core::protocol::messages::{Annotation, AnnotationTool, Point};
    use tokio::sync::mpsc::error::TryRecvError;

    fn test_config() -> CoordinatorConfig {
        CoordinatorConfig {
            presenter_id: "p-1".to_string(),
            presenter_name: "Dr. Lee".to_string(),
            room_name: "Lab 2".to_string(),
            reaction_timeout: Duration::from_secs(30),
        }
    }

    async fn open_conn(
        handle: &CoordinatorHandle,
        conn_id: u64,
    ) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        handle
            .connection_event(ConnectionEvent::Opened { conn_id, outbound: tx })
            .await;
        rx
    }

    async fn join(handle: &CoordinatorHandle, conn_id: u64, viewer_id: &str, name: &str) {
        handle
            .connection_event(ConnectionEvent::Inbound {
                conn_id,
                message: ClientMessage::Join {
                    viewer_id: viewer_id.to_string(),
                    display_name: name.to_string(),
                    timestamp: 0,
                },
            })
            .await;
    }

    async fn react(
        handle: &CoordinatorHandle,
        conn_id: u64,
        viewer_id: &str,
        reaction: Option<ReactionKind>,
    ) {
        handle
            .connection_event(ConnectionEvent::Inbound {
                conn_id,
                message: ClientMessage::Reaction {
                    viewer_id: viewer_id.to_string(),
                    reaction,
                    timestamp: 0,
                },
            })
            .await;
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> ServerMessage {
        rx.recv().await.expect("expected a message")
    }

    /// Lets the actor and any ready timers run before a try_recv assertion.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    // ── Join ──────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_join_receives_welcome_then_all_reactions() {
        // Arrange
        let (handle, _events) = SessionCoordinator::spawn(test_config());
        let mut rx = open_conn(&handle, 1).await;

        // Act
        join(&handle, 1, "v-1", "Dana").await;

        // Assert: welcome first, with the joiner already in the roster
        match recv(&mut rx).await {
            ServerMessage::Welcome {
                presenter_name,
                room_name,
                roster,
                ..
            } => {
                assert_eq!(presenter_name, "Dr. Lee");
                assert_eq!(room_name, "Lab 2");
                assert_eq!(roster.len(), 1);
                assert_eq!(roster[0].id, "v-1");
            }
            other => panic!("expected welcome, got {:?}", other),
        }
        // Then the aggregate reaction snapshot (empty for a fresh room)
        match recv(&mut rx).await {
            ServerMessage::AllReactions { reactions, .. } => assert!(reactions.is_empty()),
            other => panic!("expected all-reactions, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_broadcasts_viewer_joined_to_others() {
        // Arrange
        let (handle, _events) = SessionCoordinator::spawn(test_config());
        let mut rx1 = open_conn(&handle, 1).await;
        join(&handle, 1, "v-1", "Dana").await;
        recv(&mut rx1).await; // welcome
        recv(&mut rx1).await; // all-reactions
        let mut rx2 = open_conn(&handle, 2).await;

        // Act
        join(&handle, 2, "v-2", "Sam").await;

        // Assert: the existing viewer sees the delta, not a new welcome
        match recv(&mut rx1).await {
            ServerMessage::ViewerJoined { viewer, .. } => assert_eq!(viewer.id, "v-2"),
            other => panic!("expected viewer-joined, got {:?}", other),
        }
        // The joiner does not see its own viewer-joined
        match recv(&mut rx2).await {
            ServerMessage::Welcome { roster, .. } => assert_eq!(roster.len(), 2),
            other => panic!("expected welcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_emits_roster_changed_event() {
        // Arrange
        let (handle, mut events) = SessionCoordinator::spawn(test_config());
        let _rx = open_conn(&handle, 1).await;

        // Act
        join(&handle, 1, "v-1", "Dana").await;

        // Assert
        match events.recv().await.expect("event") {
            SessionEvent::RosterChanged { roster } => {
                assert_eq!(roster.len(), 1);
                assert_eq!(roster[0].id, "v-1");
            }
            other => panic!("expected RosterChanged, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_roster_watch_survives_event_channel_backlog() {
        // Arrange: nobody drains the event channel, so it fills up and
        // further events get dropped.
        let (handle, _events) = SessionCoordinator::spawn(test_config());
        let roster_rx = handle.roster_updates();
        let _rx = open_conn(&handle, 1).await;
        join(&handle, 1, "v-1", "Dana").await;
        for i in 0..100u64 {
            let reaction = if i % 2 == 0 {
                Some(ReactionKind::ThumbsUp)
            } else {
                None
            };
            react(&handle, 1, "v-1", reaction).await;
        }

        // Act: the viewer disconnects behind the backlog
        handle
            .connection_event(ConnectionEvent::Closed { conn_id: 1 })
            .await;

        // Assert: the round-trip proves the disconnect was processed, and the
        // watch channel still reflects the empty roster even though the
        // RosterChanged event itself may have been dropped.
        assert!(handle.roster().await.is_empty());
        assert!(roster_rx.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_rejoin_supersedes_previous_connection() {
        // Arrange: v-1 joins on connection 1
        let (handle, _events) = SessionCoordinator::spawn(test_config());
        let mut rx1 = open_conn(&handle, 1).await;
        join(&handle, 1, "v-1", "Dana").await;
        recv(&mut rx1).await;
        recv(&mut rx1).await;

        // Act: the same viewer joins again on connection 2
        let mut rx2 = open_conn(&handle, 2).await;
        join(&handle, 2, "v-1", "Dana").await;

        // Assert: the old connection's channel closes without any further
        // traffic; in particular no viewer-left was broadcast.
        assert_eq!(rx1.recv().await, None, "superseded channel must close");
        match recv(&mut rx2).await {
            ServerMessage::Welcome { roster, .. } => {
                assert_eq!(roster.len(), 1, "roster must hold one entry per viewer id");
            }
            other => panic!("expected welcome, got {:?}", other),
        }
        assert_eq!(handle.roster().await.len(), 1);
    }

    #[tokio::test]
    async fn test_superseded_connection_close_is_noop() {
        // Arrange: v-1 re-joined on connection 2, superseding connection 1
        let (handle, _events) = SessionCoordinator::spawn(test_config());
        let _rx1 = open_conn(&handle, 1).await;
        join(&handle, 1, "v-1", "Dana").await;
        let mut rx2 = open_conn(&handle, 2).await;
        join(&handle, 2, "v-1", "Dana").await;
        recv(&mut rx2).await;
        recv(&mut rx2).await;

        // Act: the old connection's close event finally arrives
        handle
            .connection_event(ConnectionEvent::Closed { conn_id: 1 })
            .await;
        settle().await;

        // Assert: the viewer is still in the roster and got no viewer-left
        assert_eq!(handle.roster().await.len(), 1);
        assert!(matches!(rx2.try_recv(), Err(TryRecvError::Empty)));
    }

    // ── Reactions ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_reaction_broadcast_to_everyone_including_sender() {
        // Arrange
        let (handle, _events) = SessionCoordinator::spawn(test_config());
        let mut rx1 = open_conn(&handle, 1).await;
        join(&handle, 1, "v-1", "Dana").await;
        recv(&mut rx1).await;
        recv(&mut rx1).await;
        let mut rx2 = open_conn(&handle, 2).await;
        join(&handle, 2, "v-2", "Sam").await;
        recv(&mut rx1).await; // viewer-joined
        recv(&mut rx2).await;
        recv(&mut rx2).await;

        // Act
        react(&handle, 1, "v-1", Some(ReactionKind::Hand)).await;

        // Assert: both connections, sender included, see the update
        for rx in [&mut rx1, &mut rx2] {
            match recv(rx).await {
                ServerMessage::ReactionUpdate {
                    viewer_id, reaction, ..
                } => {
                    assert_eq!(viewer_id, "v-1");
                    assert_eq!(reaction, Some(ReactionKind::Hand));
                }
                other => panic!("expected reaction-update, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_late_joiner_sees_reactions_in_snapshot() {
        // Arrange: v-1 raises a hand before v-2 arrives
        let (handle, _events) = SessionCoordinator::spawn(test_config());
        let mut rx1 = open_conn(&handle, 1).await;
        join(&handle, 1, "v-1", "Dana").await;
        react(&handle, 1, "v-1", Some(ReactionKind::Hand)).await;
        recv(&mut rx1).await;
        recv(&mut rx1).await;
        recv(&mut rx1).await;

        // Act
        let mut rx2 = open_conn(&handle, 2).await;
        join(&handle, 2, "v-2", "Sam").await;

        // Assert: the all-reactions snapshot carries the raised hand
        recv(&mut rx2).await; // welcome
        match recv(&mut rx2).await {
            ServerMessage::AllReactions { reactions, .. } => {
                assert_eq!(reactions.get("v-1"), Some(&ReactionKind::Hand));
            }
            other => panic!("expected all-reactions, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaction_expires_after_window() {
        // Arrange
        let (handle, _events) = SessionCoordinator::spawn(test_config());
        let mut rx = open_conn(&handle, 1).await;
        join(&handle, 1, "v-1", "Dana").await;
        recv(&mut rx).await;
        recv(&mut rx).await;

        // Act
        react(&handle, 1, "v-1", Some(ReactionKind::Question)).await;
        match recv(&mut rx).await {
            ServerMessage::ReactionUpdate { reaction, .. } => {
                assert_eq!(reaction, Some(ReactionKind::Question));
            }
            other => panic!("expected reaction-update, got {:?}", other),
        }

        // Assert: the paused clock jumps to the expiry and the clear arrives
        match recv(&mut rx).await {
            ServerMessage::ReactionUpdate {
                viewer_id, reaction, ..
            } => {
                assert_eq!(viewer_id, "v-1");
                assert_eq!(reaction, None);
            }
            other => panic!("expected expiry reaction-update, got {:?}", other),
        }
        let roster = handle.roster().await;
        assert_eq!(roster[0].reaction, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_reaction_restarts_expiry_window() {
        // Arrange
        let (handle, _events) = SessionCoordinator::spawn(test_config());
        let mut rx = open_conn(&handle, 1).await;
        join(&handle, 1, "v-1", "Dana").await;
        recv(&mut rx).await;
        recv(&mut rx).await;
        react(&handle, 1, "v-1", Some(ReactionKind::Hand)).await;
        recv(&mut rx).await; // hand update

        // Act: 20 s in, replace the reaction; the window must restart
        tokio::time::advance(Duration::from_secs(20)).await;
        react(&handle, 1, "v-1", Some(ReactionKind::ThumbsUp)).await;
        recv(&mut rx).await; // thumbsUp update

        // 35 s after the first reaction (past its original deadline) the
        // replaced timer must not have fired.
        tokio::time::advance(Duration::from_secs(15)).await;
        settle().await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        // Assert: the replacement expires once, 30 s after it was raised
        tokio::time::advance(Duration::from_secs(15)).await;
        match recv(&mut rx).await {
            ServerMessage::ReactionUpdate { reaction, .. } => assert_eq!(reaction, None),
            other => panic!("expected expiry reaction-update, got {:?}", other),
        }
        settle().await;
        assert!(
            matches!(rx.try_recv(), Err(TryRecvError::Empty)),
            "expiry must fire exactly once"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_clear_cancels_expiry() {
        // Arrange
        let (handle, _events) = SessionCoordinator::spawn(test_config());
        let mut rx = open_conn(&handle, 1).await;
        join(&handle, 1, "v-1", "Dana").await;
        recv(&mut rx).await;
        recv(&mut rx).await;
        react(&handle, 1, "v-1", Some(ReactionKind::Hand)).await;
        recv(&mut rx).await;

        // Act: clear immediately
        react(&handle, 1, "v-1", None).await;
        match recv(&mut rx).await {
            ServerMessage::ReactionUpdate { reaction, .. } => assert_eq!(reaction, None),
            other => panic!("expected reaction-update, got {:?}", other),
        }

        // Assert: no second clear arrives when the old deadline passes
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_clear_all_reactions_single_broadcast() {
        // Arrange: two raised reactions
        let (handle, mut events) = SessionCoordinator::spawn(test_config());
        let mut rx1 = open_conn(&handle, 1).await;
        join(&handle, 1, "v-1", "Dana").await;
        recv(&mut rx1).await;
        recv(&mut rx1).await;
        let mut rx2 = open_conn(&handle, 2).await;
        join(&handle, 2, "v-2", "Sam").await;
        recv(&mut rx1).await;
        recv(&mut rx2).await;
        recv(&mut rx2).await;
        react(&handle, 1, "v-1", Some(ReactionKind::Hand)).await;
        react(&handle, 2, "v-2", Some(ReactionKind::Question)).await;
        for rx in [&mut rx1, &mut rx2] {
            recv(rx).await;
            recv(rx).await;
        }
        while let Ok(ev) = events.try_recv() {
            drop(ev); // drain join/reaction events
        }

        // Act
        handle.clear_all_reactions().await;

        // Assert: exactly one clear-reactions per connection, nothing else
        for rx in [&mut rx1, &mut rx2] {
            assert!(matches!(
                recv(rx).await,
                ServerMessage::ClearReactions { .. }
            ));
        }
        settle().await;
        assert!(matches!(rx1.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(events.recv().await, Some(SessionEvent::ReactionsCleared));
        let roster = handle.roster().await;
        assert!(roster.iter().all(|v| v.reaction.is_none()));
    }

    // ── Disconnect and kick ───────────────────────────────────────────────────

    #[tokio::test]
    async fn test_disconnect_broadcasts_viewer_left() {
        // Arrange
        let (handle, _events) = SessionCoordinator::spawn(test_config());
        let _rx1 = open_conn(&handle, 1).await;
        join(&handle, 1, "v-1", "Dana").await;
        let mut rx2 = open_conn(&handle, 2).await;
        join(&handle, 2, "v-2", "Sam").await;
        recv(&mut rx2).await;
        recv(&mut rx2).await;

        // Act
        handle
            .connection_event(ConnectionEvent::Closed { conn_id: 1 })
            .await;

        // Assert
        match recv(&mut rx2).await {
            ServerMessage::ViewerLeft { viewer_id, .. } => assert_eq!(viewer_id, "v-1"),
            other => panic!("expected viewer-left, got {:?}", other),
        }
        assert_eq!(handle.roster().await.len(), 1);
    }

    #[tokio::test]
    async fn test_leave_message_removes_viewer() {
        // Arrange
        let (handle, _events) = SessionCoordinator::spawn(test_config());
        let mut rx = open_conn(&handle, 1).await;
        join(&handle, 1, "v-1", "Dana").await;
        recv(&mut rx).await;
        recv(&mut rx).await;

        // Act
        handle
            .connection_event(ConnectionEvent::Inbound {
                conn_id: 1,
                message: ClientMessage::Leave { timestamp: 0 },
            })
            .await;

        // Assert: connection closed and roster empty
        assert_eq!(rx.recv().await, None);
        assert!(handle.roster().await.is_empty());
    }

    #[tokio::test]
    async fn test_kick_sends_kicked_then_closes() {
        // Arrange
        let (handle, _events) = SessionCoordinator::spawn(test_config());
        let mut rx1 = open_conn(&handle, 1).await;
        join(&handle, 1, "v-1", "Dana").await;
        recv(&mut rx1).await;
        recv(&mut rx1).await;
        let mut rx2 = open_conn(&handle, 2).await;
        join(&handle, 2, "v-2", "Sam").await;
        recv(&mut rx1).await;
        recv(&mut rx2).await;
        recv(&mut rx2).await;

        // Act
        handle
            .kick("v-1".to_string(), Some("disruptive".to_string()))
            .await;

        // Assert: kicked message, then the channel closes
        match recv(&mut rx1).await {
            ServerMessage::Kicked { reason, .. } => {
                assert_eq!(reason.as_deref(), Some("disruptive"));
            }
            other => panic!("expected kicked, got {:?}", other),
        }
        assert_eq!(rx1.recv().await, None);
        // The remaining viewer sees a normal departure
        match recv(&mut rx2).await {
            ServerMessage::ViewerLeft { viewer_id, .. } => assert_eq!(viewer_id, "v-1"),
            other => panic!("expected viewer-left, got {:?}", other),
        }
        assert_eq!(handle.roster().await.len(), 1);
    }

    #[tokio::test]
    async fn test_kick_unknown_viewer_is_noop() {
        // Arrange
        let (handle, _events) = SessionCoordinator::spawn(test_config());
        let mut rx = open_conn(&handle, 1).await;
        join(&handle, 1, "v-1", "Dana").await;
        recv(&mut rx).await;
        recv(&mut rx).await;

        // Act
        handle.kick("ghost".to_string(), None).await;
        settle().await;

        // Assert
        assert_eq!(handle.roster().await.len(), 1);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    // ── Signaling passthrough ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_answer_forwarded_with_viewer_id() {
        // Arrange
        let (handle, mut events) = SessionCoordinator::spawn(test_config());
        let _rx = open_conn(&handle, 1).await;
        join(&handle, 1, "v-1", "Dana").await;
        assert!(matches!(
            events.recv().await,
            Some(SessionEvent::RosterChanged { .. })
        ));

        // Act
        handle
            .connection_event(ConnectionEvent::Inbound {
                conn_id: 1,
                message: ClientMessage::Answer {
                    answer: SessionDescription {
                        kind: "answer".to_string(),
                        sdp: "v=0\r\n".to_string(),
                    },
                    timestamp: 0,
                },
            })
            .await;

        // Assert: the payload is not interpreted, just attributed and passed on
        match events.recv().await.expect("event") {
            SessionEvent::ViewerAnswer { viewer_id, answer } => {
                assert_eq!(viewer_id, "v-1");
                assert_eq!(answer.kind, "answer");
            }
            other => panic!("expected ViewerAnswer, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_signal_before_join_is_dropped() {
        // Arrange: connection open but never joined
        let (handle, mut events) = SessionCoordinator::spawn(test_config());
        let _rx = open_conn(&handle, 1).await;

        // Act
        handle
            .connection_event(ConnectionEvent::Inbound {
                conn_id: 1,
                message: ClientMessage::IceCandidate {
                    candidate: IceCandidateInit {
                        candidate: "candidate:0".to_string(),
                        sdp_mid: None,
                        sdp_mline_index: None,
                    },
                    timestamp: 0,
                },
            })
            .await;
        settle().await;

        // Assert: nothing emitted, nothing crashed
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    // ── Presenter broadcast operations ────────────────────────────────────────

    #[tokio::test]
    async fn test_set_screen_mode_broadcasts() {
        // Arrange
        let (handle, _events) = SessionCoordinator::spawn(test_config());
        let mut rx = open_conn(&handle, 1).await;
        join(&handle, 1, "v-1", "Dana").await;
        recv(&mut rx).await;
        recv(&mut rx).await;

        // Act
        handle
            .set_screen_mode(ScreenMode::Blank, Some("Back in 5".to_string()))
            .await;

        // Assert
        match recv(&mut rx).await {
            ServerMessage::ScreenMode { mode, message, .. } => {
                assert_eq!(mode, ScreenMode::Blank);
                assert_eq!(message.as_deref(), Some("Back in 5"));
            }
            other => panic!("expected screen-mode, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_annotation_broadcast_passes_through_untouched() {
        // Arrange
        let (handle, _events) = SessionCoordinator::spawn(test_config());
        let mut rx = open_conn(&handle, 1).await;
        join(&handle, 1, "v-1", "Dana").await;
        recv(&mut rx).await;
        recv(&mut rx).await;

        // Act: the presenter draws on the shared screen
        let drawn = Annotation {
            id: "a-1".to_string(),
            tool: AnnotationTool::Arrow,
            color: "#00ff00".to_string(),
            stroke_width: 2.0,
            points: vec![Point { x: 0.0, y: 0.0 }, Point { x: 0.5, y: 0.5 }],
            text: None,
            timestamp: 1,
        };
        handle
            .broadcast(ServerMessage::Annotation {
                annotation: drawn.clone(),
                timestamp: 1,
            })
            .await;

        // Assert: the viewer receives the annotation as sent
        match recv(&mut rx).await {
            ServerMessage::Annotation { annotation, .. } => assert_eq!(annotation, drawn),
            other => panic!("expected annotation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_to_unknown_viewer_is_noop() {
        // Arrange
        let (handle, _events) = SessionCoordinator::spawn(test_config());

        // Act: must not panic or error
        handle
            .send_to(
                "ghost".to_string(),
                ServerMessage::ClearReactions { timestamp: 0 },
            )
            .await;
        settle().await;

        // Assert
        assert!(handle.roster().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_closes_all_connections() {
        // Arrange
        let (handle, _events) = SessionCoordinator::spawn(test_config());
        let mut rx = open_conn(&handle, 1).await;
        join(&handle, 1, "v-1", "Dana").await;
        recv(&mut rx).await;
        recv(&mut rx).await;

        // Act
        handle.stop().await;

        // Assert: outbound channel closes, roster queries return empty
        assert_eq!(rx.recv().await, None);
        assert!(handle.roster().await.is_empty());
    }
}
