//! Ranking Module
//!
//! Leaderboard storage, player profiles and the result reporter that
//! feeds finished matches into the leaderboard.
//!
//! ## Module Structure
//!
//! - `store`: Leaderboard trait and in-memory backend
//! - `profile`: Player profiles and guest names
//! - `reporter`: Exactly-once win reporting

pub mod store;
pub mod profile;
pub mod reporter;

pub use store::{
    InMemoryRankingStore, LeaderboardConfig, RankingError, RankingPage, RankingRecord,
    RankingStore, RankingWrite, ScoreOperator, SortOrder, LEADERBOARD_ID,
};
pub use profile::{guest_name, InMemoryProfileStore, Profile, ProfileError, ProfileStore};
pub use reporter::{MatchResult, ReportStatus, ReporterConfig, ResultReporter};
