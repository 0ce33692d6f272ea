//! Match State Machine
//!
//! Owns one match: board, player slots, turn holder and outcome.
//! Every transition is a plain method on `MatchState`; callers must
//! serialize access (the session host does this with its command queue).
//!
//! ```text
//! Empty --join--> AwaitingSecondPlayer --join--> InProgress --move*--> Finished
//!   ^                    |                            |
//!   +------leave---------+            leave (forfeit) +------> Finished
//! ```

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::hash::{compute_state_hash, hash_with_domain, StateHash};
use crate::game::board::{Board, BoardError, CellPos, Mark};
use crate::game::events::{MatchEvent, MatchEventData};

/// Maximum number of seated players.
pub const MAX_PLAYERS: usize = 2;

// =============================================================================
// PLAYER ID
// =============================================================================

/// Stable player identifier (UUID as bytes).
///
/// Serialized as a hyphenated UUID string so it can key JSON maps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PlayerId(pub [u8; 16]);

impl PlayerId {
    /// Create from raw bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Derive a stable id from a login subject (JWT `sub` or device id).
    pub fn from_subject(subject: &str) -> Self {
        let hash = hash_with_domain(b"xoxo-player:", subject.as_bytes());
        let mut id = [0u8; 16];
        id.copy_from_slice(&hash[..16]);
        Self(id)
    }

    /// Create from UUID string.
    pub fn from_uuid_str(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(|u| Self(*u.as_bytes()))
    }

    /// Convert to UUID string.
    pub fn to_uuid_string(&self) -> String {
        Uuid::from_bytes(self.0).to_string()
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Short hex prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uuid_string())
    }
}

impl From<PlayerId> for String {
    fn from(id: PlayerId) -> Self {
        id.to_uuid_string()
    }
}

impl TryFrom<String> for PlayerId {
    type Error = uuid::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Uuid::parse_str(&value).map(|u| Self(*u.as_bytes()))
    }
}

// =============================================================================
// PLAYER SLOTS
// =============================================================================

/// Seat assignment, stored per mark so marks are always distinct.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlayerSlots {
    x: Option<PlayerId>,
    o: Option<PlayerId>,
}

impl PlayerSlots {
    /// Player holding a mark.
    pub fn holder(&self, mark: Mark) -> Option<PlayerId> {
        match mark {
            Mark::X => self.x,
            Mark::O => self.o,
        }
    }

    /// Mark held by a player.
    pub fn mark_of(&self, player_id: &PlayerId) -> Option<Mark> {
        self.iter().find(|(id, _)| id == player_id).map(|(_, mark)| mark)
    }

    /// The other seated player, if any.
    pub fn opponent_of(&self, player_id: &PlayerId) -> Option<PlayerId> {
        let mark = self.mark_of(player_id)?;
        self.holder(mark.other())
    }

    /// Number of seated players.
    pub fn len(&self) -> usize {
        self.x.is_some() as usize + self.o.is_some() as usize
    }

    /// No seated players.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Both seats taken.
    pub fn is_full(&self) -> bool {
        self.len() == MAX_PLAYERS
    }

    /// Seated players in mark order.
    pub fn iter(&self) -> impl Iterator<Item = (PlayerId, Mark)> {
        let x = self.x.map(|id| (id, Mark::X));
        let o = self.o.map(|id| (id, Mark::O));
        x.into_iter().chain(o)
    }

    /// Seat a player on the first free mark, `X` preferred.
    fn seat(&mut self, player_id: PlayerId) -> Option<Mark> {
        if self.x.is_none() {
            self.x = Some(player_id);
            Some(Mark::X)
        } else if self.o.is_none() {
            self.o = Some(player_id);
            Some(Mark::O)
        } else {
            None
        }
    }

    /// Free a player's seat.
    fn vacate(&mut self, player_id: &PlayerId) -> Option<Mark> {
        let mark = self.mark_of(player_id)?;
        match mark {
            Mark::X => self.x = None,
            Mark::O => self.o = None,
        }
        Some(mark)
    }
}

// =============================================================================
// OUTCOME & PHASE
// =============================================================================

/// Why a match was won.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WinReason {
    /// Three in a row.
    Line {
        /// Cells of the winning line.
        cells: [CellPos; 3],
    },
    /// Opponent left before the match ended.
    Forfeit,
}

/// Match outcome.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// Still being played (or waiting for players).
    #[default]
    InProgress,
    /// Won by a player.
    Won {
        /// Winning player.
        winner: PlayerId,
        /// How the match was won.
        reason: WinReason,
    },
    /// Board filled with no line.
    Draw,
}

impl Outcome {
    /// True once the match can no longer change.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::InProgress)
    }

    /// Winning player, if any.
    pub fn winner(&self) -> Option<PlayerId> {
        match self {
            Outcome::Won { winner, .. } => Some(*winner),
            _ => None,
        }
    }
}

/// Lifecycle phase derived from slots and outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPhase {
    /// Nobody seated.
    Empty,
    /// One player seated.
    AwaitingSecondPlayer,
    /// Two players seated, no outcome yet.
    InProgress,
    /// Terminal.
    Finished,
}

// =============================================================================
// ERRORS & TRANSITION RESULTS
// =============================================================================

/// Rejected transitions. None of these change the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MatchError {
    /// Placement rejected by the board.
    #[error(transparent)]
    Board(#[from] BoardError),

    /// Player holds no slot.
    #[error("player is not in this match")]
    UnknownPlayer,

    /// Player is seated but does not hold the turn.
    #[error("not your turn")]
    NotYourTurn,

    /// Outcome already decided.
    #[error("match already finished")]
    MatchFinished,

    /// Both slots taken.
    #[error("match is full")]
    MatchFull,

    /// Only one player is seated.
    #[error("waiting for an opponent to join")]
    AwaitingOpponent,
}

/// Accepted join.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Newly seated with this mark.
    Seated(Mark),
    /// Already held this mark; nothing changed.
    AlreadySeated(Mark),
}

impl JoinOutcome {
    /// Mark held after the join.
    pub fn mark(self) -> Mark {
        match self {
            JoinOutcome::Seated(mark) | JoinOutcome::AlreadySeated(mark) => mark,
        }
    }
}

/// Result of a leave.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// Slot freed; no opponent remained to win.
    Left(Mark),
    /// Slot freed and the remaining player wins by forfeit.
    Forfeited {
        /// Mark the leaver held.
        mark: Mark,
        /// Remaining player.
        winner: PlayerId,
    },
    /// Player held no slot.
    NotSeated,
    /// Match already finished; the final state is kept as is.
    Ignored,
}

impl LeaveOutcome {
    /// Whether the state changed.
    pub fn changed(self) -> bool {
        matches!(self, LeaveOutcome::Left(_) | LeaveOutcome::Forfeited { .. })
    }
}

/// Accepted move.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MoveApplied {
    /// Mover.
    pub player_id: PlayerId,
    /// Mark placed.
    pub mark: Mark,
    /// Cell written.
    pub pos: CellPos,
    /// Outcome after the move.
    pub outcome: Outcome,
}

// =============================================================================
// MATCH STATE
// =============================================================================

/// Full state of one match.
#[derive(Clone, Debug)]
pub struct MatchState {
    board: Board,
    slots: PlayerSlots,
    turn: Option<PlayerId>,
    outcome: Outcome,
    move_count: u32,
    revision: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    events: Vec<MatchEvent>,
}

impl Default for MatchState {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchState {
    /// Create an empty match.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            board: Board::new(),
            slots: PlayerSlots::default(),
            turn: None,
            outcome: Outcome::InProgress,
            move_count: 0,
            revision: 0,
            created_at: now,
            updated_at: now,
            events: Vec::new(),
        }
    }

    /// Current board.
    pub fn board(&self) -> &Board {
        &self.board
    }

    /// Current slots.
    pub fn slots(&self) -> &PlayerSlots {
        &self.slots
    }

    /// Turn holder.
    pub fn turn(&self) -> Option<PlayerId> {
        self.turn
    }

    /// Current outcome.
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// Accepted moves so far.
    pub fn move_count(&self) -> u32 {
        self.move_count
    }

    /// Mutation counter; strictly increases with every accepted change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time of the last accepted change. Never decreases.
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Derived lifecycle phase.
    pub fn phase(&self) -> MatchPhase {
        if self.outcome.is_terminal() {
            return MatchPhase::Finished;
        }
        match self.slots.len() {
            0 => MatchPhase::Empty,
            1 => MatchPhase::AwaitingSecondPlayer,
            _ => MatchPhase::InProgress,
        }
    }

    /// Seat a player.
    ///
    /// The first player seated gets `X` and the turn. Joining again while
    /// seated is a no-op.
    pub fn try_join(&mut self, player_id: PlayerId) -> Result<JoinOutcome, MatchError> {
        if self.outcome.is_terminal() {
            return Err(MatchError::MatchFinished);
        }
        if let Some(mark) = self.slots.mark_of(&player_id) {
            return Ok(JoinOutcome::AlreadySeated(mark));
        }

        let was_empty = self.slots.is_empty();
        let mark = self.slots.seat(player_id).ok_or(MatchError::MatchFull)?;
        if was_empty {
            self.turn = Some(player_id);
        }

        self.touch();
        self.push_event(MatchEventData::PlayerJoined { player_id, mark });
        Ok(JoinOutcome::Seated(mark))
    }

    /// Remove a player.
    ///
    /// Leaving an unfinished match with an opponent still seated hands the
    /// opponent a forfeit win. Leaving a lone seat empties the match.
    pub fn leave(&mut self, player_id: PlayerId) -> LeaveOutcome {
        if self.slots.mark_of(&player_id).is_none() {
            return LeaveOutcome::NotSeated;
        }
        if self.outcome.is_terminal() {
            return LeaveOutcome::Ignored;
        }

        let opponent = self.slots.opponent_of(&player_id);
        let Some(mark) = self.slots.vacate(&player_id) else {
            return LeaveOutcome::NotSeated;
        };
        self.turn = None;
        self.touch();
        self.push_event(MatchEventData::PlayerLeft { player_id, mark });

        match opponent {
            Some(winner) => {
                self.finish(Outcome::Won { winner, reason: WinReason::Forfeit });
                LeaveOutcome::Forfeited { mark, winner }
            }
            None => LeaveOutcome::Left(mark),
        }
    }

    /// Validate and apply a move.
    ///
    /// Checks run in order: finished, seated, opponent present, turn, then
    /// board legality. A rejected move leaves the state untouched.
    pub fn apply_move(&mut self, player_id: PlayerId, row: i64, col: i64) -> Result<MoveApplied, MatchError> {
        if self.outcome.is_terminal() {
            return Err(MatchError::MatchFinished);
        }
        let mark = self.slots.mark_of(&player_id).ok_or(MatchError::UnknownPlayer)?;
        if !self.slots.is_full() {
            return Err(MatchError::AwaitingOpponent);
        }
        if self.turn != Some(player_id) {
            return Err(MatchError::NotYourTurn);
        }

        let pos = self.board.place(mark, row, col)?;
        self.move_count += 1;
        self.turn = self.slots.opponent_of(&player_id);
        self.touch();
        self.push_event(MatchEventData::MoveApplied { player_id, mark, pos });

        let outcome = match self.board.detect_line() {
            Some(line) => self
                .slots
                .holder(line.mark)
                .map(|winner| Outcome::Won { winner, reason: WinReason::Line { cells: line.cells } })
                .unwrap_or(Outcome::InProgress),
            None if self.board.is_full() => Outcome::Draw,
            None => Outcome::InProgress,
        };
        if outcome.is_terminal() {
            self.finish(outcome);
        }

        Ok(MoveApplied { player_id, mark, pos, outcome: self.outcome })
    }

    /// Take the events produced since the last drain.
    pub fn drain_events(&mut self) -> Vec<MatchEvent> {
        std::mem::take(&mut self.events)
    }

    /// Immutable copy for broadcasting.
    pub fn snapshot(&self, match_id: Uuid) -> MatchSnapshot {
        MatchSnapshot {
            match_id,
            revision: self.revision,
            phase: self.phase(),
            board: self.board,
            players: self.slots.iter().collect(),
            turn: self.turn,
            outcome: self.outcome,
            move_count: self.move_count,
            created_at: self.created_at,
            updated_at: self.updated_at,
            state_hash: hex::encode(self.compute_hash()),
        }
    }

    /// Hash of board, slots, turn and outcome at the current revision.
    pub fn compute_hash(&self) -> StateHash {
        compute_state_hash(self.revision, |hasher| {
            for cell in self.board.rows().iter().flatten() {
                hasher.update_u8(cell.map_or(0, |mark| mark as u8));
            }
            for mark in [Mark::X, Mark::O] {
                hash_optional_player(hasher, self.slots.holder(mark));
            }
            hash_optional_player(hasher, self.turn);
            match self.outcome {
                Outcome::InProgress => hasher.update_u8(0),
                Outcome::Draw => hasher.update_u8(1),
                Outcome::Won { winner, reason } => {
                    hasher.update_u8(2);
                    hasher.update_uuid(winner.as_bytes());
                    match reason {
                        WinReason::Forfeit => hasher.update_u8(0),
                        WinReason::Line { cells } => {
                            hasher.update_u8(1);
                            for pos in cells {
                                hasher.update_u8(pos.row);
                                hasher.update_u8(pos.col);
                            }
                        }
                    }
                }
            }
        })
    }

    fn finish(&mut self, outcome: Outcome) {
        self.outcome = outcome;
        self.push_event(MatchEventData::MatchEnded { outcome });
    }

    fn touch(&mut self) {
        self.revision += 1;
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    fn push_event(&mut self, data: MatchEventData) {
        self.events.push(MatchEvent::new(self.revision, data));
    }
}

fn hash_optional_player(hasher: &mut crate::core::hash::StateHasher, player: Option<PlayerId>) {
    match player {
        Some(id) => {
            hasher.update_bool(true);
            hasher.update_uuid(id.as_bytes());
        }
        None => hasher.update_bool(false),
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Immutable copy of a match, broadcast after every accepted change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSnapshot {
    /// Session the match belongs to.
    pub match_id: Uuid,
    /// State revision.
    pub revision: u64,
    /// Lifecycle phase.
    pub phase: MatchPhase,
    /// Board cells.
    pub board: Board,
    /// Seated players and their marks.
    pub players: BTreeMap<PlayerId, Mark>,
    /// Turn holder.
    pub turn: Option<PlayerId>,
    /// Outcome.
    pub outcome: Outcome,
    /// Accepted moves.
    pub move_count: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last change time.
    pub updated_at: DateTime<Utc>,
    /// Hex SHA-256 of the state at this revision.
    pub state_hash: String,
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const A: PlayerId = PlayerId::new([0xA; 16]);
    const B: PlayerId = PlayerId::new([0xB; 16]);
    const C: PlayerId = PlayerId::new([0xC; 16]);

    fn two_player_match() -> MatchState {
        let mut state = MatchState::new();
        state.try_join(A).unwrap();
        state.try_join(B).unwrap();
        state
    }

    #[test]
    fn test_player_id_uuid_roundtrip() {
        let id = PlayerId::from_subject("device-123");
        let parsed = PlayerId::from_uuid_str(&id.to_uuid_string()).unwrap();
        assert_eq!(id, parsed);
        assert_eq!(PlayerId::from_subject("device-123"), id);
        assert_ne!(PlayerId::from_subject("device-124"), id);
    }

    #[test]
    fn test_first_joiner_gets_x_and_turn() {
        let mut state = MatchState::new();
        assert_eq!(state.phase(), MatchPhase::Empty);
        assert_eq!(state.turn(), None);

        assert_eq!(state.try_join(A), Ok(JoinOutcome::Seated(Mark::X)));
        assert_eq!(state.turn(), Some(A));
        assert_eq!(state.phase(), MatchPhase::AwaitingSecondPlayer);

        assert_eq!(state.try_join(B), Ok(JoinOutcome::Seated(Mark::O)));
        assert_eq!(state.turn(), Some(A));
        assert_eq!(state.phase(), MatchPhase::InProgress);
    }

    #[test]
    fn test_rejoin_is_idempotent() {
        let mut state = two_player_match();
        let revision = state.revision();

        assert_eq!(state.try_join(B), Ok(JoinOutcome::AlreadySeated(Mark::O)));
        assert_eq!(state.revision(), revision);
    }

    #[test]
    fn test_third_join_rejected() {
        let mut state = two_player_match();
        assert_eq!(state.try_join(C), Err(MatchError::MatchFull));
        assert_eq!(state.slots().len(), 2);
        assert_eq!(state.slots().mark_of(&C), None);
    }

    #[test]
    fn test_join_after_finish_rejected() {
        let mut state = two_player_match();
        state.leave(A);
        assert_eq!(state.try_join(C), Err(MatchError::MatchFinished));
    }

    #[test]
    fn test_move_validation_order() {
        let mut state = MatchState::new();
        state.try_join(A).unwrap();

        assert_eq!(state.apply_move(C, 0, 0), Err(MatchError::UnknownPlayer));
        assert_eq!(state.apply_move(A, 0, 0), Err(MatchError::AwaitingOpponent));

        state.try_join(B).unwrap();
        assert_eq!(state.apply_move(B, 0, 0), Err(MatchError::NotYourTurn));
        assert_eq!(
            state.apply_move(A, 3, 0),
            Err(MatchError::Board(BoardError::OutOfRange { row: 3, col: 0 }))
        );
        assert!(state.apply_move(A, 1, 1).is_ok());
    }

    #[test]
    fn test_occupied_cell_leaves_state_unchanged() {
        let mut state = two_player_match();
        state.apply_move(A, 1, 1).unwrap();
        let before = state.snapshot(Uuid::nil());

        let err = state.apply_move(B, 1, 1).unwrap_err();

        assert_eq!(err, MatchError::Board(BoardError::CellOccupied(CellPos::new(1, 1))));
        assert_eq!(state.snapshot(Uuid::nil()), before);
        assert_eq!(state.turn(), Some(B));
    }

    #[test]
    fn test_diagonal_win() {
        let mut state = two_player_match();
        state.apply_move(A, 0, 0).unwrap();
        state.apply_move(B, 0, 1).unwrap();
        state.apply_move(A, 1, 1).unwrap();
        state.apply_move(B, 0, 2).unwrap();
        let applied = state.apply_move(A, 2, 2).unwrap();

        let expected = Outcome::Won {
            winner: A,
            reason: WinReason::Line {
                cells: [CellPos::new(0, 0), CellPos::new(1, 1), CellPos::new(2, 2)],
            },
        };
        assert_eq!(applied.outcome, expected);
        assert_eq!(state.outcome(), expected);
        assert_eq!(state.phase(), MatchPhase::Finished);
    }

    #[test]
    fn test_draw_on_full_board() {
        let mut state = two_player_match();
        // X O X / X O O / O X X
        let moves = [(A, 0, 0), (B, 0, 1), (A, 0, 2), (B, 1, 1), (A, 1, 0),
                     (B, 1, 2), (A, 2, 1), (B, 2, 0), (A, 2, 2)];
        for (player, row, col) in moves {
            state.apply_move(player, row, col).unwrap();
        }

        assert_eq!(state.outcome(), Outcome::Draw);
        assert!(state.board().is_full());
        assert_eq!(state.move_count(), 9);
    }

    #[test]
    fn test_moves_rejected_after_finish() {
        let mut state = two_player_match();
        state.leave(B);
        let before = state.snapshot(Uuid::nil());

        assert_eq!(state.apply_move(A, 0, 0), Err(MatchError::MatchFinished));
        assert_eq!(state.snapshot(Uuid::nil()), before);
    }

    #[test]
    fn test_leave_with_opponent_is_forfeit() {
        let mut state = two_player_match();
        state.apply_move(A, 0, 0).unwrap();

        assert_eq!(state.leave(A), LeaveOutcome::Forfeited { mark: Mark::X, winner: B });
        assert_eq!(state.outcome(), Outcome::Won { winner: B, reason: WinReason::Forfeit });
        assert_eq!(state.turn(), None);
        assert_eq!(state.slots().len(), 1);
    }

    #[test]
    fn test_lone_player_leave_empties_match() {
        let mut state = MatchState::new();
        state.try_join(A).unwrap();

        assert_eq!(state.leave(A), LeaveOutcome::Left(Mark::X));
        assert_eq!(state.outcome(), Outcome::InProgress);
        assert_eq!(state.phase(), MatchPhase::Empty);
        assert_eq!(state.turn(), None);

        // Leaving an already empty match never invents a winner.
        assert_eq!(state.leave(A), LeaveOutcome::NotSeated);
        assert_eq!(state.outcome(), Outcome::InProgress);
    }

    #[test]
    fn test_empty_match_reseats_x_first() {
        let mut state = MatchState::new();
        state.try_join(A).unwrap();
        state.leave(A);

        assert_eq!(state.try_join(C), Ok(JoinOutcome::Seated(Mark::X)));
        assert_eq!(state.turn(), Some(C));
    }

    #[test]
    fn test_leave_unknown_and_after_finish() {
        let mut state = two_player_match();
        assert_eq!(state.leave(C), LeaveOutcome::NotSeated);

        state.leave(A);
        let finished = state.snapshot(Uuid::nil());
        assert_eq!(state.leave(B), LeaveOutcome::Ignored);
        assert_eq!(state.snapshot(Uuid::nil()), finished);
    }

    #[test]
    fn test_revision_and_events() {
        let mut state = two_player_match();
        state.apply_move(A, 0, 0).unwrap();
        assert_eq!(state.revision(), 3);

        let events = state.drain_events();
        let revisions: Vec<u64> = events.iter().map(|e| e.revision).collect();
        assert_eq!(revisions, vec![1, 2, 3]);
        assert!(state.drain_events().is_empty());
        assert!(state.updated_at() >= state.created_at());
    }

    #[test]
    fn test_snapshot_json_shape() {
        let mut state = two_player_match();
        state.apply_move(A, 2, 0).unwrap();
        let snapshot = state.snapshot(Uuid::nil());

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["board"][2][0], "X");
        assert_eq!(json["players"][A.to_uuid_string()], "X");
        assert_eq!(json["turn"], B.to_uuid_string());
        assert_eq!(json["outcome"]["status"], "in_progress");
        assert_eq!(json["phase"], "in_progress");

        let parsed: MatchSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn test_hash_tracks_state() {
        let mut state = two_player_match();
        let before = state.compute_hash();
        state.apply_move(A, 0, 0).unwrap();
        assert_ne!(before, state.compute_hash());
    }

    proptest! {
        #[test]
        fn prop_turn_alternates_until_terminal(cells in Just((0..9i64).collect::<Vec<_>>()).prop_shuffle()) {
            let mut state = two_player_match();
            let mut expected = A;

            for cell in cells {
                if state.outcome().is_terminal() {
                    prop_assert_eq!(state.apply_move(expected, cell / 3, cell % 3), Err(MatchError::MatchFinished));
                    break;
                }
                prop_assert_eq!(state.turn(), Some(expected));
                let other = if expected == A { B } else { A };
                prop_assert_eq!(state.apply_move(other, cell / 3, cell % 3), Err(MatchError::NotYourTurn));
                state.apply_move(expected, cell / 3, cell % 3).unwrap();
                expected = other;
            }

            // A line and a draw are never reported together.
            match state.outcome() {
                Outcome::Draw => prop_assert!(state.board().detect_line().is_none()),
                Outcome::Won { .. } => prop_assert!(state.board().detect_line().is_some()),
                Outcome::InProgress => prop_assert!(false, "nine moves must end the match"),
            }
        }
    }
}
