//! Network Layer
//!
//! WebSocket server, wire protocol, login and the per-match session host.
//! All match rules live in `game/`; this layer only serializes access to
//! them and moves messages.

pub mod auth;
pub mod protocol;
pub mod session;
pub mod server;

pub use auth::{AuthConfig, TokenClaims, AuthError, LoginIdentity, validate_token, authenticate, after_authenticate};
pub use protocol::{ClientMessage, ServerMessage, OpCode, ErrorCode, MatchDataIn, MatchDataOut};
pub use session::{
    MatchHandler, MatchSession, Presence, SessionConfig, SessionError, SessionHandle, SessionId, SessionManager, SessionState,
};
pub use server::{GameServer, ServerConfig, GameServerError};
