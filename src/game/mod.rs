//! Game Logic Module
//!
//! Board rules and the match state machine. No I/O and no clocks beyond
//! the change timestamps kept on `MatchState`.
//!
//! ## Module Structure
//!
//! - `board`: 3x3 grid, placement and line detection
//! - `state`: Player slots, turn, outcome and transitions
//! - `input`: Typed move payload
//! - `events`: Events produced by state transitions

pub mod board;
pub mod state;
pub mod input;
pub mod events;

// Re-export key types
pub use board::{Board, BoardError, CellPos, Mark, WinningLine};
pub use state::{MatchError, MatchPhase, MatchSnapshot, MatchState, Outcome, PlayerId, WinReason};
pub use input::MoveRequest;
pub use events::{MatchEvent, MatchEventData};
