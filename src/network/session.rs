//! Match Session Management
//!
//! One tokio task per match owns its `MatchSession`. Every join, leave,
//! move and tick reaches the session through a single bounded queue, so
//! the state machine runs without locks and broadcasts leave in mutation
//! order. When a match ends the result goes to the reporter on a detached
//! task and the session removes itself from the registry.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::game::board::Mark;
use crate::game::input::MoveRequest;
use crate::game::state::{
    JoinOutcome, LeaveOutcome, MatchError, MatchPhase, MatchSnapshot, MatchState, PlayerId,
};
use crate::network::protocol::{ErrorCode, MatchDataIn, OpCode, ServerMessage};
use crate::ranking::reporter::{MatchResult, ResultReporter};

/// Unique session identifier; also the match id on the wire.
pub type SessionId = Uuid;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting events.
    Open,
    /// Result produced; every further event is rejected.
    Closed,
}

/// Why a session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Terminal outcome reached.
    Finished,
    /// Idle expiry with nobody or only one player seated.
    Abandoned,
    /// Server shutdown or every handle dropped.
    Shutdown,
}

/// Configuration for a match session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Loop tick rate (Hz).
    pub tick_rate: u32,
    /// Ticks with no seated player before the session closes.
    pub empty_timeout_ticks: u32,
    /// Ticks with a single seated player before the session closes.
    pub awaiting_timeout_ticks: u32,
    /// Command queue capacity.
    pub command_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_rate: crate::TICK_RATE,
            empty_timeout_ticks: 30,
            awaiting_timeout_ticks: 300,
            command_capacity: 64,
        }
    }
}

impl SessionConfig {
    /// Duration of one tick.
    pub fn tick_duration(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.tick_rate.max(1) as u64)
    }
}

/// A confirmed broadcast recipient.
///
/// Sends never wait: a recipient whose queue is full has stopped reading
/// and is removed from the match.
#[derive(Debug, Clone)]
pub struct Presence {
    /// Player identifier.
    pub player_id: PlayerId,
    /// Display name.
    pub display_name: String,
    /// Connection the presence arrived on.
    pub connection: SocketAddr,
    /// Message channel to this player.
    pub sender: mpsc::Sender<ServerMessage>,
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Rejected by the match state machine.
    #[error(transparent)]
    Match(#[from] MatchError),

    /// Session no longer accepts events.
    #[error("Session is closed")]
    SessionClosed,

    /// Move body could not be decoded.
    #[error("Malformed move: {0}")]
    MalformedMove(String),

    /// Opcode not accepted from clients.
    #[error("Unsupported opcode {0}")]
    UnsupportedOpCode(u8),

    /// Player is not a confirmed presence.
    #[error("Player is not present in this match")]
    NotPresent,

    /// Leave came from a connection the player has since replaced.
    #[error("Connection was superseded")]
    StaleConnection,
}

impl SessionError {
    /// Wire error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::Match(e) => ErrorCode::from(e),
            SessionError::SessionClosed => ErrorCode::SessionClosed,
            SessionError::MalformedMove(_) => ErrorCode::MalformedMove,
            SessionError::UnsupportedOpCode(_) => ErrorCode::UnsupportedOpCode,
            SessionError::NotPresent | SessionError::StaleConnection => ErrorCode::NotPresent,
        }
    }
}

// =============================================================================
// MATCH SESSION
// =============================================================================

/// A match session.
pub struct MatchSession {
    id: SessionId,
    state: SessionState,
    config: SessionConfig,
    game: MatchState,
    presences: BTreeMap<PlayerId, Presence>,
    tick: u64,
    idle_ticks: u32,
    idle_revision: u64,
    result: Option<MatchResult>,
}

impl MatchSession {
    /// Create a new session with an empty match.
    pub fn new(id: SessionId, config: SessionConfig) -> Self {
        Self {
            id,
            state: SessionState::Open,
            config,
            game: MatchState::new(),
            presences: BTreeMap::new(),
            tick: 0,
            idle_ticks: 0,
            idle_revision: 0,
            result: None,
        }
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True once closed.
    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Match state.
    pub fn game(&self) -> &MatchState {
        &self.game
    }

    /// Ticks processed.
    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    /// Number of confirmed recipients.
    pub fn presence_count(&self) -> usize {
        self.presences.len()
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> MatchSnapshot {
        self.game.snapshot(self.id)
    }

    fn apply_message(&mut self, player_id: PlayerId, data: MatchDataIn) -> Result<(), SessionError> {
        if !self.presences.contains_key(&player_id) {
            return Err(SessionError::NotPresent);
        }
        match OpCode::try_from(data.op_code) {
            Ok(OpCode::Move) => {}
            _ => return Err(SessionError::UnsupportedOpCode(data.op_code)),
        }
        let request = MoveRequest::from_value(data.data)
            .map_err(|e| SessionError::MalformedMove(e.to_string()))?;

        let applied = self.game.apply_move(player_id, request.row, request.col)?;
        debug!("Match {}: {} placed {} at {}", self.id, player_id.short(), applied.mark, applied.pos);
        Ok(())
    }

    /// Close the session. The result is produced exactly once.
    pub fn close(&mut self, reason: CloseReason) {
        if self.is_closed() {
            return;
        }
        self.state = SessionState::Closed;
        self.result = Some(MatchResult {
            match_id: self.id,
            outcome: self.game.outcome(),
            revision: self.game.revision(),
            finished_at: Utc::now(),
        });
        info!("Match {} closed ({:?}) with outcome {:?}", self.id, reason, self.game.outcome());
    }

    /// Take the close result. Returns `None` before close and after the
    /// first take.
    pub fn take_result(&mut self) -> Option<MatchResult> {
        self.result.take()
    }

    /// Seated players, in mark order.
    pub fn seated_players(&self) -> Vec<PlayerId> {
        self.game.slots().iter().map(|(id, _)| id).collect()
    }

    /// Send a message to every recipient without waiting.
    ///
    /// Recipients with a closed channel are dropped. Recipients with a full
    /// queue are dropped and returned so the caller can settle their seat.
    pub fn broadcast(&mut self, message: &ServerMessage) -> Vec<PlayerId> {
        let match_id = self.id;
        let mut stalled = Vec::new();
        self.presences.retain(|player_id, presence| match presence.sender.try_send(message.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Player {} stopped reading match {}, removing", player_id.short(), match_id);
                stalled.push(*player_id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Broadcast to {} dropped, channel closed", player_id.short());
                false
            }
        });
        stalled
    }

    /// Broadcast the current snapshot. Stalled recipients leave the match,
    /// and the resulting state goes out to whoever remains.
    fn broadcast_state(&mut self) {
        loop {
            let snapshot = self.snapshot();
            #[cfg(feature = "debug-tracing")]
            debug!("Match {} snapshot: {:?}", self.id, snapshot);

            let message = match ServerMessage::state(&snapshot) {
                Ok(message) => message,
                Err(e) => {
                    error!("Failed to encode snapshot for match {}: {}", self.id, e);
                    return;
                }
            };

            let mut changed = false;
            for player_id in self.broadcast(&message) {
                changed |= self.depart(player_id).changed();
            }
            if !changed {
                break;
            }
        }
        self.close_if_finished();
    }

    /// Remove a player from recipients and seats.
    fn depart(&mut self, player_id: PlayerId) -> LeaveOutcome {
        self.presences.remove(&player_id);

        let outcome = self.game.leave(player_id);
        match outcome {
            LeaveOutcome::Forfeited { winner, .. } => {
                info!("Player {} left match {}, {} wins by forfeit", player_id.short(), self.id, winner.short());
            }
            LeaveOutcome::Left(mark) => {
                info!("Player {} ({}) left match {}", player_id.short(), mark, self.id);
            }
            LeaveOutcome::NotSeated | LeaveOutcome::Ignored => {}
        }
        self.log_events();
        outcome
    }

    /// Dispatch one queued command.
    pub async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::JoinRequest { player_id, reply } => {
                let _ = reply.send(self.on_join_request(player_id));
            }
            SessionCommand::PresenceJoined { presence, reply } => {
                let _ = reply.send(self.on_presence_joined(presence).await);
            }
            SessionCommand::PresenceLeft { player_id, connection, reply } => {
                let _ = reply.send(self.on_presence_left(player_id, connection).await);
            }
            SessionCommand::Message { player_id, data, reply } => {
                let _ = reply.send(self.on_message(player_id, data).await);
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.ensure_open().map(|_| self.snapshot()));
            }
            SessionCommand::Shutdown => {
                self.broadcast(&ServerMessage::Shutdown { reason: "Server shutting down".to_string() });
                self.close(CloseReason::Shutdown);
            }
        }
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            Err(SessionError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn close_if_finished(&mut self) {
        if self.game.outcome().is_terminal() {
            self.close(CloseReason::Finished);
        }
    }

    fn log_events(&mut self) {
        for event in self.game.drain_events() {
            debug!("Match {} r{}: {:?}", self.id, event.revision, event.data);
        }
    }
}

/// Lifecycle contract between the hosting loop and a match.
///
/// The host calls these one at a time from its command queue, never
/// concurrently.
#[async_trait]
pub trait MatchHandler: Send {
    /// Join attempt. Returns the mark held on success.
    fn on_join_request(&mut self, player_id: PlayerId) -> Result<Mark, SessionError>;

    /// A seated player's connection is ready to receive broadcasts.
    async fn on_presence_joined(&mut self, presence: Presence) -> Result<(), SessionError>;

    /// A player's connection went away.
    async fn on_presence_left(&mut self, player_id: PlayerId, connection: SocketAddr) -> Result<LeaveOutcome, SessionError>;

    /// Match data sent by a player.
    async fn on_message(&mut self, player_id: PlayerId, data: MatchDataIn) -> Result<(), SessionError>;

    /// Periodic tick.
    fn on_tick(&mut self);
}

#[async_trait]
impl MatchHandler for MatchSession {
    /// Join attempt. Seats the player but does not broadcast; the
    /// broadcast follows presence confirmation.
    fn on_join_request(&mut self, player_id: PlayerId) -> Result<Mark, SessionError> {
        self.ensure_open()?;
        let outcome = self.game.try_join(player_id)?;
        if let JoinOutcome::Seated(mark) = outcome {
            info!("Player {} seated as {} in match {}", player_id.short(), mark, self.id);
        }
        self.log_events();
        Ok(outcome.mark())
    }

    /// Presence confirmed. Only seated players become recipients.
    async fn on_presence_joined(&mut self, presence: Presence) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.game.slots().mark_of(&presence.player_id).is_none() {
            return Err(SessionError::NotPresent);
        }
        debug!("Presence {} ({}) joined match {}", presence.display_name, presence.player_id.short(), self.id);
        self.presences.insert(presence.player_id, presence);
        self.broadcast_state();
        Ok(())
    }

    /// Presence gone. Leaving an unfinished match with an opponent seated
    /// is a forfeit. A leave from a connection other than the player's
    /// current presence changes nothing.
    async fn on_presence_left(&mut self, player_id: PlayerId, connection: SocketAddr) -> Result<LeaveOutcome, SessionError> {
        self.ensure_open()?;
        if let Some(current) = self.presences.get(&player_id) {
            if current.connection != connection {
                debug!("Ignoring leave of {} from superseded connection {}", player_id.short(), connection);
                return Err(SessionError::StaleConnection);
            }
        }

        let outcome = self.depart(player_id);
        if outcome.changed() {
            self.broadcast_state();
        }
        Ok(outcome)
    }

    /// Match data from a player. Rejections go only to the sender.
    async fn on_message(&mut self, player_id: PlayerId, data: MatchDataIn) -> Result<(), SessionError> {
        self.ensure_open()?;

        match self.apply_message(player_id, data) {
            Ok(()) => {
                self.log_events();
                self.broadcast_state();
                Ok(())
            }
            Err(e) => {
                debug!("Rejected message from {} in match {}: {}", player_id.short(), self.id, e);
                if let Some(presence) = self.presences.get(&player_id) {
                    let msg = ServerMessage::match_error(self.id, e.code(), e.to_string());
                    if let Err(send_err) = presence.sender.try_send(msg) {
                        debug!("Error for {} dropped: {}", player_id.short(), send_err);
                    }
                }
                Err(e)
            }
        }
    }

    /// Advance one tick and apply idle expiry.
    ///
    /// The idle counter restarts on every state change.
    fn on_tick(&mut self) {
        if self.is_closed() {
            return;
        }
        self.tick += 1;

        if self.game.revision() != self.idle_revision {
            self.idle_revision = self.game.revision();
            self.idle_ticks = 0;
        }

        let limit = match self.game.phase() {
            MatchPhase::Empty => self.config.empty_timeout_ticks,
            MatchPhase::AwaitingSecondPlayer => self.config.awaiting_timeout_ticks,
            MatchPhase::InProgress | MatchPhase::Finished => {
                self.idle_ticks = 0;
                return;
            }
        };

        self.idle_ticks += 1;
        if self.idle_ticks >= limit {
            info!("Match {} idle for {} ticks, closing", self.id, self.idle_ticks);
            self.close(CloseReason::Abandoned);
        }
    }
}

// =============================================================================
// COMMANDS & HANDLE
// =============================================================================

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Commands consumed by the session task.
pub enum SessionCommand {
    /// Join attempt.
    JoinRequest { player_id: PlayerId, reply: Reply<Mark> },
    /// Presence confirmed.
    PresenceJoined { presence: Presence, reply: Reply<()> },
    /// Presence gone.
    PresenceLeft { player_id: PlayerId, connection: SocketAddr, reply: Reply<LeaveOutcome> },
    /// Match data.
    Message { player_id: PlayerId, data: MatchDataIn, reply: Reply<()> },
    /// Read the current snapshot.
    Snapshot { reply: Reply<MatchSnapshot> },
    /// Close without a result write.
    Shutdown,
}

impl SessionCommand {
    /// Answer a command that will never be processed.
    fn reject(self, err: SessionError) {
        match self {
            SessionCommand::JoinRequest { reply, .. } => { let _ = reply.send(Err(err)); }
            SessionCommand::PresenceJoined { reply, .. } => { let _ = reply.send(Err(err)); }
            SessionCommand::PresenceLeft { reply, .. } => { let _ = reply.send(Err(err)); }
            SessionCommand::Message { reply, .. } => { let _ = reply.send(Err(err)); }
            SessionCommand::Snapshot { reply } => { let _ = reply.send(Err(err)); }
            SessionCommand::Shutdown => {}
        }
    }
}

/// Cloneable sender side of a session task.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// True once the session task stopped accepting commands.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// See [`MatchHandler::on_join_request`].
    pub async fn join_request(&self, player_id: PlayerId) -> Result<Mark, SessionError> {
        self.request(|reply| SessionCommand::JoinRequest { player_id, reply }).await
    }

    /// See [`MatchHandler::on_presence_joined`].
    pub async fn presence_joined(&self, presence: Presence) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::PresenceJoined { presence, reply }).await
    }

    /// See [`MatchHandler::on_presence_left`].
    pub async fn presence_left(&self, player_id: PlayerId, connection: SocketAddr) -> Result<LeaveOutcome, SessionError> {
        self.request(|reply| SessionCommand::PresenceLeft { player_id, connection, reply }).await
    }

    /// See [`MatchHandler::on_message`].
    pub async fn send_message(&self, player_id: PlayerId, data: MatchDataIn) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Message { player_id, data, reply }).await
    }

    /// Current snapshot.
    pub async fn snapshot(&self) -> Result<MatchSnapshot, SessionError> {
        self.request(|reply| SessionCommand::Snapshot { reply }).await
    }

    /// Ask the session to close.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(SessionCommand::Shutdown).await;
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> SessionCommand) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        rx.await.map_err(|_| SessionError::SessionClosed)?
    }
}

/// Session task body.
///
/// Runs until the session closes, then stops accepting commands, reports
/// the result on a detached task, answers queued commands with
/// `SessionClosed` and leaves the registry.
pub async fn run_session(
    mut session: MatchSession,
    mut rx: mpsc::Receiver<SessionCommand>,
    manager: Arc<SessionManager>,
) {
    let id = session.id();
    let mut ticker = interval(session.config().tick_duration());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick of a tokio interval completes immediately.
    ticker.tick().await;

    while !session.is_closed() {
        tokio::select! {
            command = rx.recv() => match command {
                Some(command) => session.handle_command(command).await,
                None => session.close(CloseReason::Shutdown),
            },
            _ = ticker.tick() => session.on_tick(),
        }
    }

    rx.close();

    match session.take_result() {
        Some(result) if result.outcome.is_terminal() => match manager.reporter() {
            Some(reporter) => {
                let reporter = Arc::clone(reporter);
                tokio::spawn(async move {
                    reporter.report(&result).await;
                });
            }
            None => warn!("Match {} finished without a reporter", id),
        },
        _ => debug!("Match {} closed undecided, nothing to report", id),
    }

    while let Some(command) = rx.recv().await {
        command.reject(SessionError::SessionClosed);
    }

    manager.remove_session(&id).await;
    for player_id in session.seated_players() {
        manager.unregister_player(&player_id, &id).await;
    }
    debug!("Match {} task finished", id);
}

// =============================================================================
// SESSION MANAGER
// =============================================================================

/// Registry of live sessions.
pub struct SessionManager {
    /// Active sessions.
    sessions: RwLock<BTreeMap<SessionId, SessionHandle>>,
    /// Player to session mapping.
    player_sessions: RwLock<BTreeMap<PlayerId, SessionId>>,
    /// Receives finished matches.
    reporter: Option<Arc<ResultReporter>>,
}

impl SessionManager {
    /// Create new session manager.
    pub fn new(reporter: Option<Arc<ResultReporter>>) -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            player_sessions: RwLock::new(BTreeMap::new()),
            reporter,
        }
    }

    /// Result reporter, if any.
    pub fn reporter(&self) -> Option<&Arc<ResultReporter>> {
        self.reporter.as_ref()
    }

    /// Create a session and spawn its task.
    pub async fn create_session(self: &Arc<Self>, config: SessionConfig) -> SessionHandle {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(config.command_capacity.max(1));
        let handle = SessionHandle { id, tx };

        self.sessions.write().await.insert(id, handle.clone());
        tokio::spawn(run_session(MatchSession::new(id, config), rx, Arc::clone(self)));

        info!("Created match {}", id);
        handle
    }

    /// Get a session by ID.
    pub async fn get_session(&self, id: &SessionId) -> Option<SessionHandle> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Get session for a player.
    pub async fn get_player_session(&self, player_id: &PlayerId) -> Option<SessionHandle> {
        let session_id = self.player_sessions.read().await.get(player_id).copied()?;
        self.get_session(&session_id).await
    }

    /// Register player in a session.
    pub async fn register_player(&self, player_id: PlayerId, session_id: SessionId) {
        self.player_sessions.write().await.insert(player_id, session_id);
    }

    /// Unregister a player only if still mapped to `session_id`.
    pub async fn unregister_player(&self, player_id: &PlayerId, session_id: &SessionId) {
        let mut player_sessions = self.player_sessions.write().await;
        if player_sessions.get(player_id) == Some(session_id) {
            player_sessions.remove(player_id);
        }
    }

    /// Remove a session.
    pub async fn remove_session(&self, id: &SessionId) {
        self.sessions.write().await.remove(id);
    }

    /// Get active session count.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Ask every session to close.
    pub async fn shutdown_all(&self) {
        let handles: Vec<SessionHandle> = self.sessions.read().await.values().cloned().collect();
        for handle in handles {
            handle.shutdown().await;
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use crate::game::state::{Outcome, WinReason};
    use crate::ranking::profile::InMemoryProfileStore;
    use crate::ranking::reporter::ReporterConfig;
    use crate::ranking::store::{InMemoryRankingStore, RankingStore, LEADERBOARD_ID};

    const A: PlayerId = PlayerId::new([0xA; 16]);
    const B: PlayerId = PlayerId::new([0xB; 16]);
    const C: PlayerId = PlayerId::new([0xC; 16]);

    fn create_test_session() -> MatchSession {
        MatchSession::new(Uuid::nil(), SessionConfig::default())
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn presence_with(player_id: PlayerId, connection: SocketAddr, capacity: usize)
        -> (Presence, mpsc::Receiver<ServerMessage>)
    {
        let (sender, rx) = mpsc::channel(capacity);
        let presence = Presence { player_id, display_name: player_id.short(), connection, sender };
        (presence, rx)
    }

    fn presence(player_id: PlayerId) -> (Presence, mpsc::Receiver<ServerMessage>) {
        presence_with(player_id, addr(player_id.as_bytes()[0] as u16 + 1000), 32)
    }

    fn move_data(row: i64, col: i64) -> MatchDataIn {
        MatchDataIn { match_id: Uuid::nil(), op_code: OpCode::Move as u8, data: json!({"row": row, "col": col}) }
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            messages.push(msg);
        }
        messages
    }

    fn snapshots(messages: &[ServerMessage]) -> Vec<MatchSnapshot> {
        messages
            .iter()
            .filter_map(|msg| match msg {
                ServerMessage::MatchData(data) if data.op_code == OpCode::State => {
                    Some(serde_json::from_value(data.data.clone()).unwrap())
                }
                _ => None,
            })
            .collect()
    }

    fn error_codes(messages: &[ServerMessage]) -> Vec<String> {
        messages
            .iter()
            .filter_map(|msg| match msg {
                ServerMessage::MatchData(data) if data.op_code == OpCode::Error => {
                    data.data["code"].as_str().map(str::to_string)
                }
                _ => None,
            })
            .collect()
    }

    async fn seated_pair(session: &mut MatchSession)
        -> (mpsc::Receiver<ServerMessage>, mpsc::Receiver<ServerMessage>)
    {
        let (pa, rx_a) = presence(A);
        let (pb, rx_b) = presence(B);
        session.on_join_request(A).unwrap();
        session.on_presence_joined(pa).await.unwrap();
        session.on_join_request(B).unwrap();
        session.on_presence_joined(pb).await.unwrap();
        (rx_a, rx_b)
    }

    #[tokio::test]
    async fn test_join_broadcasts_on_presence() {
        let mut session = create_test_session();
        let (pa, mut rx_a) = presence(A);

        assert_eq!(session.on_join_request(A), Ok(Mark::X));
        assert!(drain(&mut rx_a).is_empty());

        session.on_presence_joined(pa).await.unwrap();
        let states = snapshots(&drain(&mut rx_a));
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].players.get(&A), Some(&Mark::X));
        assert_eq!(states[0].turn, Some(A));
    }

    #[tokio::test]
    async fn test_rejected_joiner_never_receives_broadcasts() {
        let mut session = create_test_session();
        let (mut rx_a, _rx_b) = seated_pair(&mut session).await;
        let (pc, mut rx_c) = presence(C);

        assert_eq!(session.on_join_request(C), Err(SessionError::Match(MatchError::MatchFull)));
        assert_eq!(session.on_presence_joined(pc).await, Err(SessionError::NotPresent));
        assert_eq!(session.presence_count(), 2);

        drain(&mut rx_a);
        session.on_message(A, move_data(0, 0)).await.unwrap();
        assert_eq!(snapshots(&drain(&mut rx_a)).len(), 1);
        assert!(drain(&mut rx_c).is_empty());
    }

    #[tokio::test]
    async fn test_rejected_move_is_private() {
        let mut session = create_test_session();
        let (mut rx_a, mut rx_b) = seated_pair(&mut session).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        let err = session.on_message(B, move_data(0, 0)).await.unwrap_err();

        assert_eq!(err, SessionError::Match(MatchError::NotYourTurn));
        assert_eq!(error_codes(&drain(&mut rx_b)), vec!["not_your_turn"]);
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(session.game().move_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_and_unsupported_messages() {
        let mut session = create_test_session();
        let (_rx_a, _rx_b) = seated_pair(&mut session).await;

        let bad_body = MatchDataIn { data: json!({"row": "middle"}), ..move_data(0, 0) };
        assert!(matches!(session.on_message(A, bad_body).await, Err(SessionError::MalformedMove(_))));

        let state_op = MatchDataIn { op_code: OpCode::State as u8, ..move_data(0, 0) };
        assert_eq!(session.on_message(A, state_op).await, Err(SessionError::UnsupportedOpCode(1)));

        let unknown = MatchDataIn { op_code: 42, ..move_data(0, 0) };
        assert_eq!(session.on_message(A, unknown).await, Err(SessionError::UnsupportedOpCode(42)));

        assert_eq!(session.on_message(C, move_data(0, 0)).await, Err(SessionError::NotPresent));
        assert_eq!(session.game().revision(), 2);
    }

    #[tokio::test]
    async fn test_broadcast_revisions_increase() {
        let mut session = create_test_session();
        let (mut rx_a, _rx_b) = seated_pair(&mut session).await;

        session.on_message(A, move_data(1, 1)).await.unwrap();
        session.on_message(B, move_data(0, 0)).await.unwrap();
        let _ = session.on_message(B, move_data(2, 2)).await;

        let revisions: Vec<u64> = snapshots(&drain(&mut rx_a)).iter().map(|s| s.revision).collect();
        assert_eq!(revisions, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_win_closes_session_once() {
        let mut session = create_test_session();
        let (mut rx_a, _rx_b) = seated_pair(&mut session).await;

        for (player, row, col) in [(A, 0, 0), (B, 0, 1), (A, 1, 1), (B, 0, 2), (A, 2, 2)] {
            session.on_message(player, move_data(row, col)).await.unwrap();
        }

        assert!(session.is_closed());
        let last = snapshots(&drain(&mut rx_a)).pop().unwrap();
        assert!(matches!(last.outcome, Outcome::Won { winner: A, reason: WinReason::Line { .. } }));

        let result = session.take_result().unwrap();
        assert_eq!(result.outcome.winner(), Some(A));
        assert!(session.take_result().is_none());

        session.close(CloseReason::Finished);
        assert!(session.take_result().is_none());
        assert_eq!(session.on_message(B, move_data(2, 0)).await, Err(SessionError::SessionClosed));
        assert_eq!(session.on_join_request(C), Err(SessionError::SessionClosed));
    }

    #[tokio::test]
    async fn test_presence_left_forfeits() {
        let mut session = create_test_session();
        let (_rx_a, mut rx_b) = seated_pair(&mut session).await;
        session.on_message(A, move_data(0, 0)).await.unwrap();
        drain(&mut rx_b);

        let outcome = session.on_presence_left(A, addr(1010)).await.unwrap();

        assert_eq!(outcome, LeaveOutcome::Forfeited { mark: Mark::X, winner: B });
        let last = snapshots(&drain(&mut rx_b)).pop().unwrap();
        assert_eq!(last.outcome, Outcome::Won { winner: B, reason: WinReason::Forfeit });
        assert!(session.is_closed());
        assert_eq!(session.take_result().unwrap().outcome.winner(), Some(B));
    }

    #[tokio::test]
    async fn test_lone_player_leave_keeps_session_open() {
        let mut session = create_test_session();
        let (pa, _rx_a) = presence(A);
        session.on_join_request(A).unwrap();
        session.on_presence_joined(pa).await.unwrap();

        assert_eq!(session.on_presence_left(A, addr(1010)).await, Ok(LeaveOutcome::Left(Mark::X)));
        assert!(!session.is_closed());
        assert_eq!(session.game().phase(), MatchPhase::Empty);
        assert_eq!(session.game().outcome(), Outcome::InProgress);
    }

    #[tokio::test]
    async fn test_superseded_connection_leave_is_ignored() {
        let mut session = create_test_session();
        let (old, _rx_old) = presence_with(A, addr(2001), 32);
        let (new, mut rx_new) = presence_with(A, addr(2002), 32);
        let (pb, _rx_b) = presence(B);
        session.on_join_request(A).unwrap();
        session.on_presence_joined(old).await.unwrap();
        session.on_join_request(B).unwrap();
        session.on_presence_joined(pb).await.unwrap();

        // Same player reconnects; the old socket's cleanup arrives afterwards.
        session.on_join_request(A).unwrap();
        session.on_presence_joined(new).await.unwrap();
        drain(&mut rx_new);

        assert_eq!(session.on_presence_left(A, addr(2001)).await, Err(SessionError::StaleConnection));
        assert!(!session.is_closed());
        assert_eq!(session.game().outcome(), Outcome::InProgress);
        assert!(session.presences.contains_key(&A));

        session.on_message(B, move_data(1, 1)).await.unwrap_err();
        session.on_message(A, move_data(0, 0)).await.unwrap();
        assert_eq!(snapshots(&drain(&mut rx_new)).len(), 1);

        let outcome = session.on_presence_left(A, addr(2002)).await.unwrap();
        assert_eq!(outcome, LeaveOutcome::Forfeited { mark: Mark::X, winner: B });
    }

    #[tokio::test]
    async fn test_stalled_recipient_is_removed_without_blocking() {
        let mut session = create_test_session();
        // A's queue holds one message and is never read.
        let (pa, _rx_a) = presence_with(A, addr(3001), 1);
        let (pb, mut rx_b) = presence(B);
        session.on_join_request(A).unwrap();
        session.on_presence_joined(pa).await.unwrap();
        session.on_join_request(B).unwrap();

        tokio::time::timeout(Duration::from_secs(1), session.on_presence_joined(pb))
            .await
            .expect("broadcast blocked on a full queue")
            .unwrap();

        assert!(!session.presences.contains_key(&A));
        assert!(session.is_closed());
        assert_eq!(session.game().outcome(), Outcome::Won { winner: B, reason: WinReason::Forfeit });

        let last = snapshots(&drain(&mut rx_b)).pop().unwrap();
        assert_eq!(last.outcome, Outcome::Won { winner: B, reason: WinReason::Forfeit });
        assert_eq!(session.take_result().unwrap().outcome.winner(), Some(B));
    }

    #[tokio::test]
    async fn test_closed_recipient_is_dropped_quietly() {
        let mut session = create_test_session();
        let (pa, rx_a) = presence(A);
        let (pb, mut rx_b) = presence(B);
        session.on_join_request(A).unwrap();
        session.on_presence_joined(pa).await.unwrap();
        session.on_join_request(B).unwrap();
        drop(rx_a);

        session.on_presence_joined(pb).await.unwrap();

        assert!(!session.presences.contains_key(&A));
        assert_eq!(session.game().slots().mark_of(&A), Some(Mark::X));
        assert!(!session.is_closed());
        assert_eq!(snapshots(&drain(&mut rx_b)).len(), 1);
    }

    #[test]
    fn test_idle_expiry_when_empty() {
        let config = SessionConfig { empty_timeout_ticks: 3, ..Default::default() };
        let mut session = MatchSession::new(Uuid::nil(), config);

        session.on_tick();
        session.on_tick();
        assert!(!session.is_closed());
        session.on_tick();

        assert!(session.is_closed());
        assert_eq!(session.current_tick(), 3);
        assert_eq!(session.take_result().unwrap().outcome, Outcome::InProgress);
    }

    #[test]
    fn test_idle_expiry_waiting_for_opponent() {
        let config = SessionConfig { awaiting_timeout_ticks: 2, empty_timeout_ticks: 100, ..Default::default() };
        let mut session = MatchSession::new(Uuid::nil(), config);
        session.on_join_request(A).unwrap();

        session.on_tick();
        assert!(!session.is_closed());
        session.on_tick();
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_in_progress_match_never_idles_out() {
        let config = SessionConfig { empty_timeout_ticks: 1, awaiting_timeout_ticks: 1, ..Default::default() };
        let mut session = MatchSession::new(Uuid::nil(), config);
        let (_rx_a, _rx_b) = seated_pair(&mut session).await;

        for _ in 0..10 {
            session.on_tick();
        }
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_session_manager() {
        let manager = Arc::new(SessionManager::default());

        let handle = manager.create_session(SessionConfig::default()).await;
        assert_eq!(manager.session_count().await, 1);
        assert!(manager.get_session(&handle.id()).await.is_some());

        manager.remove_session(&handle.id()).await;
        assert_eq!(manager.session_count().await, 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_player_session_mapping() {
        let manager = Arc::new(SessionManager::default());
        let handle = manager.create_session(SessionConfig::default()).await;

        manager.register_player(A, handle.id()).await;
        assert!(manager.get_player_session(&A).await.is_some());

        manager.unregister_player(&A, &Uuid::nil()).await;
        assert!(manager.get_player_session(&A).await.is_some());

        manager.unregister_player(&A, &handle.id()).await;
        assert!(manager.get_player_session(&A).await.is_none());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_session_task_reports_win_and_unregisters() {
        let rankings = Arc::new(InMemoryRankingStore::new());
        let reporter = Arc::new(ResultReporter::new(
            ReporterConfig::default(),
            rankings.clone(),
            Arc::new(InMemoryProfileStore::new()),
        ));
        reporter.ensure_leaderboard().await.unwrap();
        let manager = Arc::new(SessionManager::new(Some(reporter.clone())));

        let handle = manager.create_session(SessionConfig::default()).await;
        let (pa, _rx_a) = presence(A);
        let (pb, _rx_b) = presence(B);
        handle.join_request(A).await.unwrap();
        handle.presence_joined(pa).await.unwrap();
        handle.join_request(B).await.unwrap();
        handle.presence_joined(pb).await.unwrap();
        manager.register_player(A, handle.id()).await;

        for (player, row, col) in [(A, 0, 0), (B, 1, 0), (A, 0, 1), (B, 1, 1), (A, 0, 2)] {
            handle.send_message(player, move_data(row, col)).await.unwrap();
        }

        for _ in 0..100 {
            if manager.session_count().await == 0 && reporter.was_reported(&handle.id()).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.session_count().await, 0);
        assert!(manager.get_player_session(&A).await.is_none());
        assert_eq!(handle.snapshot().await, Err(SessionError::SessionClosed));

        let mut record = None;
        for _ in 0..100 {
            record = rankings.get_record(LEADERBOARD_ID, &A).await.unwrap();
            if record.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(record.map(|r| r.score), Some(1));
    }

    #[tokio::test]
    async fn test_session_task_reports_forfeit_once() {
        let rankings = Arc::new(InMemoryRankingStore::new());
        let reporter = Arc::new(ResultReporter::new(
            ReporterConfig::default(),
            rankings.clone(),
            Arc::new(InMemoryProfileStore::new()),
        ));
        reporter.ensure_leaderboard().await.unwrap();
        let manager = Arc::new(SessionManager::new(Some(reporter.clone())));

        let handle = manager.create_session(SessionConfig::default()).await;
        let (pa, _rx_a) = presence(A);
        let (pb, _rx_b) = presence(B);
        handle.join_request(A).await.unwrap();
        handle.presence_joined(pa).await.unwrap();
        handle.join_request(B).await.unwrap();
        handle.presence_joined(pb).await.unwrap();
        manager.register_player(A, handle.id()).await;
        manager.register_player(B, handle.id()).await;
        handle.send_message(A, move_data(0, 0)).await.unwrap();

        let outcome = handle.presence_left(A, addr(1010)).await.unwrap();
        assert_eq!(outcome, LeaveOutcome::Forfeited { mark: Mark::X, winner: B });

        let mut record = None;
        for _ in 0..100 {
            record = rankings.get_record(LEADERBOARD_ID, &B).await.unwrap();
            if record.is_some() && manager.session_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let record = record.unwrap();
        assert_eq!(record.score, 1);
        assert_eq!(record.metadata["win_reason"], "forfeit");
        assert!(rankings.get_record(LEADERBOARD_ID, &A).await.unwrap().is_none());
        assert!(manager.get_player_session(&B).await.is_none());

        // The winner's own disconnect arrives after the session is gone.
        assert_eq!(handle.presence_left(B, addr(1011)).await, Err(SessionError::SessionClosed));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let record = rankings.get_record(LEADERBOARD_ID, &B).await.unwrap().unwrap();
        assert_eq!(record.score, 1);
        assert_eq!(record.num_score, 1);
    }
}
