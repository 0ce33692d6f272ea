//! # xoxo Match Server
//!
//! Authoritative two-player tic-tac-toe: the server owns the board, enforces
//! turn order and move legality, settles departures as forfeits and records
//! each win on a leaderboard exactly once.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      XOXO SERVER                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Shared primitives                         │
//! │  └── hash.rs     - Snapshot and player-id hashing            │
//! │                                                              │
//! │  game/           - Match rules (no I/O)                      │
//! │  ├── board.rs    - 3x3 grid, placement, line detection       │
//! │  ├── state.rs    - Slots, turn, outcome, transitions         │
//! │  ├── input.rs    - Move payload                              │
//! │  └── events.rs   - Transition events                         │
//! │                                                              │
//! │  network/        - Transport and hosting                     │
//! │  ├── server.rs   - WebSocket server                          │
//! │  ├── protocol.rs - Message types and opcodes                 │
//! │  ├── auth.rs     - JWT / device login, profile hook          │
//! │  └── session.rs  - Per-match task and registry               │
//! │                                                              │
//! │  ranking/        - Persistence                               │
//! │  ├── store.rs    - Leaderboard                               │
//! │  ├── profile.rs  - Player profiles                           │
//! │  └── reporter.rs - Exactly-once win reporting                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//!
//! Each match runs in its own tokio task and receives every event through
//! one ordered queue. `game/` therefore needs no locks, and snapshots are
//! broadcast in the order the state changed.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;
pub mod ranking;

// Re-export commonly used types
pub use game::board::{Board, CellPos, Mark};
pub use game::state::{MatchState, MatchSnapshot, Outcome, PlayerId};
pub use ranking::store::LEADERBOARD_ID;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Session tick rate (Hz)
pub const TICK_RATE: u32 = 1;

/// Players per match
pub const MAX_PLAYERS: usize = game::state::MAX_PLAYERS;
