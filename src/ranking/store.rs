//! Ranking Store
//!
//! Persistent leaderboard of per-player scores. Writes are upserts keyed by
//! owner and merged with the leaderboard's score operator.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::game::state::PlayerId;

/// Global win leaderboard.
pub const LEADERBOARD_ID: &str = "tictactoe_global_rank";

/// Largest page `list_top` returns.
pub const MAX_PAGE_SIZE: usize = 100;

// =============================================================================
// CONFIG
// =============================================================================

/// Record ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Lowest score first.
    Ascending,
    /// Highest score first.
    Descending,
}

/// How a new score merges with an existing record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreOperator {
    /// Replace.
    Set,
    /// Keep the better of the two under the sort order.
    Best,
    /// Add.
    Increment,
}

impl ScoreOperator {
    /// Merge `incoming` into `existing`.
    pub fn combine(self, order: SortOrder, existing: i64, incoming: i64) -> i64 {
        match (self, order) {
            (ScoreOperator::Set, _) => incoming,
            (ScoreOperator::Best, SortOrder::Descending) => existing.max(incoming),
            (ScoreOperator::Best, SortOrder::Ascending) => existing.min(incoming),
            (ScoreOperator::Increment, _) => existing.saturating_add(incoming),
        }
    }
}

/// Leaderboard definition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardConfig {
    /// Leaderboard id.
    pub id: String,
    /// Sort order.
    pub sort_order: SortOrder,
    /// Merge operator.
    pub operator: ScoreOperator,
    /// Only the server may write.
    pub authoritative: bool,
}

impl Default for LeaderboardConfig {
    fn default() -> Self {
        Self {
            id: LEADERBOARD_ID.to_string(),
            sort_order: SortOrder::Descending,
            operator: ScoreOperator::Increment,
            authoritative: true,
        }
    }
}

// =============================================================================
// RECORDS
// =============================================================================

/// One score submission.
#[derive(Clone, Debug, PartialEq)]
pub struct RankingWrite {
    /// Record owner.
    pub owner_id: PlayerId,
    /// Display name stored with the record.
    pub username: String,
    /// Score to merge.
    pub score: i64,
    /// Free-form metadata, replaced on every write.
    pub metadata: serde_json::Value,
}

/// Stored leaderboard record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RankingRecord {
    /// Leaderboard id.
    pub leaderboard_id: String,
    /// Record owner.
    pub owner_id: PlayerId,
    /// Display name.
    pub username: String,
    /// Merged score.
    pub score: i64,
    /// Number of writes merged into this record.
    pub num_score: u32,
    /// Metadata from the latest write.
    pub metadata: serde_json::Value,
    /// First write.
    pub create_time: DateTime<Utc>,
    /// Latest write.
    pub update_time: DateTime<Utc>,
    /// 1-based rank, filled in on reads.
    pub rank: u64,
}

/// One page of records.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RankingPage {
    /// Records in rank order.
    pub records: Vec<RankingRecord>,
    /// Caller's own record, when requested.
    pub owner_record: Option<RankingRecord>,
    /// Cursor for the previous page.
    pub prev_cursor: Option<String>,
    /// Cursor for the next page.
    pub next_cursor: Option<String>,
}

/// Ranking failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RankingError {
    /// No leaderboard with this id.
    #[error("leaderboard not found: {0}")]
    LeaderboardNotFound(String),

    /// Store rejected or failed the write.
    #[error("ranking write failed: {0}")]
    RankingWriteFailed(String),

    /// Store did not answer in time.
    #[error("ranking store timed out after {0:?}")]
    Timeout(Duration),

    /// Cursor was not produced by this store.
    #[error("invalid cursor")]
    InvalidCursor,
}

// =============================================================================
// STORE TRAIT
// =============================================================================

/// Persistent ranking backend.
#[async_trait]
pub trait RankingStore: Send + Sync {
    /// Create a leaderboard. Returns `false` if it already existed.
    async fn create_leaderboard(&self, config: LeaderboardConfig) -> Result<bool, RankingError>;

    /// Upsert a record, merging with the leaderboard operator.
    async fn write_record(&self, leaderboard_id: &str, write: RankingWrite) -> Result<RankingRecord, RankingError>;

    /// One page of records in rank order. `limit` is clamped to `1..=MAX_PAGE_SIZE`.
    async fn list_top(
        &self,
        leaderboard_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<RankingPage, RankingError>;

    /// A single owner's record with its rank.
    async fn get_record(&self, leaderboard_id: &str, owner_id: &PlayerId) -> Result<Option<RankingRecord>, RankingError>;
}

/// Encode a page offset as an opaque cursor.
pub fn encode_cursor(offset: u64) -> String {
    hex::encode(offset.to_be_bytes())
}

/// Decode a cursor produced by [`encode_cursor`].
pub fn decode_cursor(cursor: &str) -> Result<u64, RankingError> {
    let bytes = hex::decode(cursor).map_err(|_| RankingError::InvalidCursor)?;
    let bytes: [u8; 8] = bytes.try_into().map_err(|_| RankingError::InvalidCursor)?;
    Ok(u64::from_be_bytes(bytes))
}

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

struct Leaderboard {
    config: LeaderboardConfig,
    records: BTreeMap<PlayerId, RankingRecord>,
}

impl Leaderboard {
    /// Records sorted by score, then earliest update, then owner.
    fn ranked(&self) -> Vec<RankingRecord> {
        let mut records: Vec<RankingRecord> = self.records.values().cloned().collect();
        let order = self.config.sort_order;
        records.sort_by(|a, b| {
            let by_score = match order {
                SortOrder::Descending => b.score.cmp(&a.score),
                SortOrder::Ascending => a.score.cmp(&b.score),
            };
            by_score
                .then(a.update_time.cmp(&b.update_time))
                .then(a.owner_id.cmp(&b.owner_id))
        });
        for (i, record) in records.iter_mut().enumerate() {
            record.rank = i as u64 + 1;
        }
        records
    }
}

/// In-process ranking store.
#[derive(Default)]
pub struct InMemoryRankingStore {
    boards: RwLock<BTreeMap<String, Leaderboard>>,
}

impl InMemoryRankingStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RankingStore for InMemoryRankingStore {
    async fn create_leaderboard(&self, config: LeaderboardConfig) -> Result<bool, RankingError> {
        let mut boards = self.boards.write().await;
        if boards.contains_key(&config.id) {
            return Ok(false);
        }
        boards.insert(config.id.clone(), Leaderboard { config, records: BTreeMap::new() });
        Ok(true)
    }

    async fn write_record(&self, leaderboard_id: &str, write: RankingWrite) -> Result<RankingRecord, RankingError> {
        let mut boards = self.boards.write().await;
        let board = boards
            .get_mut(leaderboard_id)
            .ok_or_else(|| RankingError::LeaderboardNotFound(leaderboard_id.to_string()))?;

        let now = Utc::now();
        let (operator, order) = (board.config.operator, board.config.sort_order);
        let record = board.records.entry(write.owner_id).or_insert_with(|| RankingRecord {
            leaderboard_id: leaderboard_id.to_string(),
            owner_id: write.owner_id,
            username: write.username.clone(),
            score: 0,
            num_score: 0,
            metadata: serde_json::Value::Null,
            create_time: now,
            update_time: now,
            rank: 0,
        });

        record.score = if record.num_score == 0 {
            write.score
        } else {
            operator.combine(order, record.score, write.score)
        };
        record.num_score += 1;
        record.username = write.username;
        record.metadata = write.metadata;
        record.update_time = record.update_time.max(now);

        let owner_id = record.owner_id;
        let ranked = board.ranked();
        ranked
            .into_iter()
            .find(|r| r.owner_id == owner_id)
            .ok_or_else(|| RankingError::RankingWriteFailed("record vanished after write".to_string()))
    }

    async fn list_top(
        &self,
        leaderboard_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<RankingPage, RankingError> {
        let boards = self.boards.read().await;
        let board = boards
            .get(leaderboard_id)
            .ok_or_else(|| RankingError::LeaderboardNotFound(leaderboard_id.to_string()))?;

        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let ranked = board.ranked();
        let total = ranked.len();

        // Cursors only ever point inside the list they were issued for.
        let offset = match cursor {
            Some(cursor) => usize::try_from(decode_cursor(cursor)?)
                .ok()
                .filter(|offset| *offset < total)
                .ok_or(RankingError::InvalidCursor)?,
            None => 0,
        };
        let end = offset.saturating_add(limit);

        let records: Vec<RankingRecord> = ranked.into_iter().skip(offset).take(limit).collect();
        let next_cursor = (end < total).then(|| encode_cursor(end as u64));
        let prev_cursor = (offset > 0).then(|| encode_cursor(offset.saturating_sub(limit) as u64));

        Ok(RankingPage { records, owner_record: None, prev_cursor, next_cursor })
    }

    async fn get_record(&self, leaderboard_id: &str, owner_id: &PlayerId) -> Result<Option<RankingRecord>, RankingError> {
        let boards = self.boards.read().await;
        let board = boards
            .get(leaderboard_id)
            .ok_or_else(|| RankingError::LeaderboardNotFound(leaderboard_id.to_string()))?;
        if !board.records.contains_key(owner_id) {
            return Ok(None);
        }
        Ok(board.ranked().into_iter().find(|r| r.owner_id == *owner_id))
    }
}
