//! Match Events
//!
//! Events produced by match state transitions. The session host drains
//! them after each command for logging.

use serde::{Serialize, Deserialize};

use crate::game::board::{CellPos, Mark};
use crate::game::state::{Outcome, PlayerId};

/// Match event data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MatchEventData {
    /// Player took a slot.
    PlayerJoined {
        player_id: PlayerId,
        mark: Mark,
    },

    /// Player gave up their slot.
    PlayerLeft {
        player_id: PlayerId,
        mark: Mark,
    },

    /// Move accepted and placed.
    MoveApplied {
        player_id: PlayerId,
        mark: Mark,
        pos: CellPos,
    },

    /// Match reached a terminal outcome.
    MatchEnded {
        outcome: Outcome,
    },
}

/// A match event stamped with the state revision it produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchEvent {
    /// Revision of the match state after the event.
    pub revision: u64,

    /// Event data
    pub data: MatchEventData,
}

impl MatchEvent {
    /// Create a new event.
    pub fn new(revision: u64, data: MatchEventData) -> Self {
        Self { revision, data }
    }

    /// Player involved in the event, if any.
    pub fn player_id(&self) -> Option<PlayerId> {
        match &self.data {
            MatchEventData::PlayerJoined { player_id, .. }
            | MatchEventData::PlayerLeft { player_id, .. }
            | MatchEventData::MoveApplied { player_id, .. } => Some(*player_id),
            MatchEventData::MatchEnded { outcome } => outcome.winner(),
        }
    }
}
