//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every frame is a JSON text message tagged by `type`. Match traffic rides
//! in `match_data` envelopes carrying a numeric opcode.

use serde::{Serialize, Deserialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::game::board::{BoardError, Mark};
use crate::game::state::{MatchError, MatchSnapshot};
use crate::ranking::store::RankingPage;

// =============================================================================
// OPCODES
// =============================================================================

/// Match data opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum OpCode {
    /// Full state snapshot, server to all players.
    State = 1,
    /// Move `{row, col}`, client to server.
    Move = 2,
    /// Rejection `{error, code}`, server to the offending player only.
    Error = 3,
}

/// Opcode outside the known set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("unknown opcode {0}")]
pub struct UnknownOpCode(pub u8);

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> Self {
        op as u8
    }
}

impl TryFrom<u8> for OpCode {
    type Error = UnknownOpCode;

    fn try_from(value: u8) -> Result<Self, UnknownOpCode> {
        match value {
            1 => Ok(OpCode::State),
            2 => Ok(OpCode::Move),
            3 => Ok(OpCode::Error),
            other => Err(UnknownOpCode(other)),
        }
    }
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate with the server.
    Auth(AuthRequest),

    /// Open a new match session.
    CreateMatch,

    /// Take a seat in a match.
    JoinMatch { match_id: Uuid },

    /// Opcode-tagged match traffic.
    MatchData(MatchDataIn),

    /// Leave the current match.
    LeaveMatch,

    /// Read the win leaderboard.
    ListLeaderboard {
        limit: Option<usize>,
        cursor: Option<String>,
    },

    /// Ping for latency measurement.
    Ping { timestamp: u64 },
}

/// Authentication request.
///
/// Either `token` (JWT) or, when the server allows it, `device_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    /// JWT bearer token.
    #[serde(default)]
    pub token: Option<String>,
    /// Device identifier for device login.
    #[serde(default)]
    pub device_id: Option<String>,
    /// Requested display name.
    #[serde(default)]
    pub name: Option<String>,
}

/// Inbound match data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchDataIn {
    /// Target match.
    pub match_id: Uuid,
    /// Raw opcode; unknown values are rejected by the session.
    pub op_code: u8,
    /// Opcode body.
    #[serde(default)]
    pub data: serde_json::Value,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication result.
    AuthResult(AuthResult),

    /// Match session opened.
    MatchCreated { match_id: Uuid },

    /// Result of a join attempt.
    JoinResult(JoinResult),

    /// Opcode-tagged match traffic.
    MatchData(MatchDataOut),

    /// Leaderboard page.
    Leaderboard(RankingPage),

    /// Pong response.
    Pong { timestamp: u64, server_time: u64 },

    /// Error message.
    Error(ServerError),

    /// Server shutting down.
    Shutdown { reason: String },
}

/// Authentication result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResult {
    /// Whether auth succeeded.
    pub success: bool,
    /// Player id if successful.
    pub player_id: Option<String>,
    /// Display name if successful.
    pub display_name: Option<String>,
    /// Error message if failed.
    pub error: Option<String>,
    /// Error code if failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    /// Server version.
    pub server_version: String,
}

/// Join attempt result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResult {
    /// Match joined.
    pub match_id: Uuid,
    /// Whether a seat is held.
    pub success: bool,
    /// Mark held on success.
    pub mark: Option<Mark>,
    /// Rejection on failure.
    pub error: Option<ServerError>,
}

/// Outbound match data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchDataOut {
    /// Source match.
    pub match_id: Uuid,
    /// Opcode.
    pub op_code: OpCode,
    /// Sent on the reliable channel.
    pub reliable: bool,
    /// Opcode body.
    pub data: serde_json::Value,
}

/// Server error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl ServerError {
    /// Create an error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Authentication failed.
    AuthFailed,
    /// Not authenticated.
    NotAuthenticated,
    /// JWT token has expired.
    TokenExpired,
    /// Invalid JWT token (signature, format, claims).
    InvalidToken,
    /// Invalid input.
    InvalidInput,
    /// Match not found.
    MatchNotFound,
    /// Already in match.
    AlreadyInMatch,
    /// Not in match.
    NotInMatch,
    /// Server overloaded.
    ServerOverloaded,
    /// Move coordinates outside the board.
    OutOfRange,
    /// Target cell taken.
    CellOccupied,
    /// Sender holds no seat.
    UnknownPlayer,
    /// Sender does not hold the turn.
    NotYourTurn,
    /// Match already decided.
    MatchFinished,
    /// Both seats taken.
    MatchFull,
    /// Second seat still empty.
    AwaitingOpponent,
    /// Session no longer accepts events.
    SessionClosed,
    /// Move body could not be decoded.
    MalformedMove,
    /// Opcode not accepted from clients.
    UnsupportedOpCode,
    /// Sender is not a confirmed presence.
    NotPresent,
    /// Leaderboard could not be read.
    LeaderboardUnavailable,
}

impl From<&MatchError> for ErrorCode {
    fn from(err: &MatchError) -> Self {
        match err {
            MatchError::Board(BoardError::OutOfRange { .. }) => ErrorCode::OutOfRange,
            MatchError::Board(BoardError::CellOccupied(_)) => ErrorCode::CellOccupied,
            MatchError::UnknownPlayer => ErrorCode::UnknownPlayer,
            MatchError::NotYourTurn => ErrorCode::NotYourTurn,
            MatchError::MatchFinished => ErrorCode::MatchFinished,
            MatchError::MatchFull => ErrorCode::MatchFull,
            MatchError::AwaitingOpponent => ErrorCode::AwaitingOpponent,
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Reliable state broadcast carrying a full snapshot.
    pub fn state(snapshot: &MatchSnapshot) -> Result<Self, serde_json::Error> {
        Ok(ServerMessage::MatchData(MatchDataOut {
            match_id: snapshot.match_id,
            op_code: OpCode::State,
            reliable: true,
            data: serde_json::to_value(snapshot)?,
        }))
    }

    /// Private rejection for one player.
    pub fn match_error(match_id: Uuid, code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::MatchData(MatchDataOut {
            match_id,
            op_code: OpCode::Error,
            reliable: true,
            data: json!({ "error": message.into(), "code": code }),
        })
    }

    /// Top-level error frame.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ServerError::new(code, message))
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::{MatchState, PlayerId};

    #[test]
    fn test_opcode_numeric_wire_form() {
        assert_eq!(serde_json::to_string(&OpCode::Move).unwrap(), "2");
        assert_eq!(serde_json::from_str::<OpCode>("3").unwrap(), OpCode::Error);
        assert!(serde_json::from_str::<OpCode>("9").is_err());
        assert_eq!(OpCode::try_from(7), Err(UnknownOpCode(7)));
    }

    #[test]
    fn test_client_move_message() {
        let json = r#"{"type":"match_data","match_id":"00000000-0000-0000-0000-000000000000","op_code":2,"data":{"row":1,"col":2}}"#;
        let parsed = ClientMessage::from_json(json).unwrap();

        if let ClientMessage::MatchData(data) = parsed {
            assert_eq!(data.op_code, 2);
            assert_eq!(data.data["col"], 2);
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_client_message_json_roundtrip() {
        let messages = vec![
            ClientMessage::Auth(AuthRequest {
                device_id: Some("device-1".to_string()),
                ..Default::default()
            }),
            ClientMessage::CreateMatch,
            ClientMessage::JoinMatch { match_id: Uuid::new_v4() },
            ClientMessage::LeaveMatch,
            ClientMessage::ListLeaderboard { limit: Some(10), cursor: None },
            ClientMessage::Ping { timestamp: 42 },
        ];

        for msg in messages {
            let json = msg.to_json().unwrap();
            assert_eq!(ClientMessage::from_json(&json).unwrap(), msg);
        }
    }

    #[test]
    fn test_leaderboard_request_defaults() {
        let parsed = ClientMessage::from_json(r#"{"type":"list_leaderboard"}"#).unwrap();
        assert_eq!(parsed, ClientMessage::ListLeaderboard { limit: None, cursor: None });
    }

    #[test]
    fn test_state_broadcast_is_reliable() {
        let mut state = MatchState::new();
        state.try_join(PlayerId::new([1; 16])).unwrap();
        let snapshot = state.snapshot(Uuid::nil());

        let msg = ServerMessage::state(&snapshot).unwrap();
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "match_data");
        assert_eq!(json["op_code"], 1);
        assert_eq!(json["reliable"], true);
        assert_eq!(json["data"]["revision"], 1);
    }

    #[test]
    fn test_match_error_payload() {
        let msg = ServerMessage::match_error(Uuid::nil(), ErrorCode::NotYourTurn, "not your turn");
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(json["op_code"], 3);
        assert_eq!(json["data"]["error"], "not your turn");
        assert_eq!(json["data"]["code"], "not_your_turn");
    }

    #[test]
    fn test_error_codes() {
        let msg = ServerMessage::error(ErrorCode::AuthFailed, "Invalid token");
        let json = msg.to_json().unwrap();
        assert!(json.contains("auth_failed"));

        let code = ErrorCode::from(&MatchError::Board(BoardError::OutOfRange { row: 5, col: 0 }));
        assert_eq!(code, ErrorCode::OutOfRange);
    }
}
