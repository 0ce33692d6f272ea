//! Result Reporter
//!
//! Turns a finished match into at most one leaderboard write. Draws and
//! undecided matches write nothing. Failures are logged and returned, never
//! retried and never propagated back into the session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::game::state::{Outcome, PlayerId, WinReason};
use crate::ranking::profile::{guest_name, ProfileStore};
use crate::ranking::store::{
    LeaderboardConfig, RankingError, RankingRecord, RankingStore, RankingWrite, LEADERBOARD_ID,
};

/// Final result of a closed session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchResult {
    /// Session id; the idempotency key.
    pub match_id: Uuid,
    /// Outcome at close.
    pub outcome: Outcome,
    /// State revision at close.
    pub revision: u64,
    /// Close time.
    pub finished_at: DateTime<Utc>,
}

/// What `report` did.
#[derive(Clone, Debug, PartialEq)]
pub enum ReportStatus {
    /// Win written.
    Recorded(RankingRecord),
    /// Draw; nothing to write.
    SkippedDraw,
    /// Session closed without an outcome.
    SkippedUndecided,
    /// This match id was already handled.
    AlreadyReported,
    /// Write failed or timed out. Not retried.
    Failed(RankingError),
}

/// Reporter configuration.
#[derive(Debug, Clone)]
pub struct ReporterConfig {
    /// Leaderboard receiving wins.
    pub leaderboard_id: String,
    /// Upper bound on one report (name lookup plus write).
    pub report_timeout: Duration,
    /// Score added per win.
    pub win_score: i64,
    /// How long a reported match id is remembered.
    pub guard_retention: Duration,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            leaderboard_id: LEADERBOARD_ID.to_string(),
            report_timeout: Duration::from_secs(5),
            win_score: 1,
            guard_retention: Duration::from_secs(3600),
        }
    }
}

impl ReporterConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            leaderboard_id: std::env::var("XOXO_LEADERBOARD_ID").unwrap_or(defaults.leaderboard_id),
            report_timeout: std::env::var("XOXO_REPORT_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.report_timeout),
            win_score: defaults.win_score,
            guard_retention: std::env::var("XOXO_REPORT_GUARD_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.guard_retention),
        }
    }
}

/// Records match wins on the ranking store.
pub struct ResultReporter {
    config: ReporterConfig,
    rankings: Arc<dyn RankingStore>,
    profiles: Arc<dyn ProfileStore>,
    reported: Mutex<HashMap<Uuid, Instant>>,
}

impl ResultReporter {
    /// Create a reporter.
    pub fn new(config: ReporterConfig, rankings: Arc<dyn RankingStore>, profiles: Arc<dyn ProfileStore>) -> Self {
        Self {
            config,
            rankings,
            profiles,
            reported: Mutex::new(HashMap::new()),
        }
    }

    /// Ranking store the reporter writes to.
    pub fn rankings(&self) -> &Arc<dyn RankingStore> {
        &self.rankings
    }

    /// Configured leaderboard id.
    pub fn leaderboard_id(&self) -> &str {
        &self.config.leaderboard_id
    }

    /// Create the win leaderboard if missing (descending, increment).
    pub async fn ensure_leaderboard(&self) -> Result<(), RankingError> {
        let created = self
            .rankings
            .create_leaderboard(LeaderboardConfig {
                id: self.config.leaderboard_id.clone(),
                ..Default::default()
            })
            .await?;
        if created {
            info!("Created leaderboard {}", self.config.leaderboard_id);
        }
        Ok(())
    }

    /// Report a finished match. Safe to call more than once per match.
    pub async fn report(&self, result: &MatchResult) -> ReportStatus {
        let (winner, reason) = match result.outcome {
            Outcome::Won { winner, reason } => (winner, reason),
            Outcome::Draw => {
                debug!("Match {} ended in a draw, nothing to record", result.match_id);
                return ReportStatus::SkippedDraw;
            }
            Outcome::InProgress => return ReportStatus::SkippedUndecided,
        };

        // Claimed before writing: a second call for the same match never writes.
        {
            let mut reported = self.reported.lock().await;
            let retention = self.config.guard_retention;
            reported.retain(|_, at| at.elapsed() < retention);
            if reported.contains_key(&result.match_id) {
                warn!("Match {} already reported", result.match_id);
                return ReportStatus::AlreadyReported;
            }
            reported.insert(result.match_id, Instant::now());
        }

        let win_reason = match reason {
            WinReason::Line { .. } => "line",
            WinReason::Forfeit => "forfeit",
        };
        let write = async {
            let username = self.display_name(&winner).await;
            let write = RankingWrite {
                owner_id: winner,
                username,
                score: self.config.win_score,
                metadata: json!({
                    "reason": "match_win",
                    "match_id": result.match_id,
                    "win_reason": win_reason,
                }),
            };
            self.rankings.write_record(&self.config.leaderboard_id, write).await
        };

        match tokio::time::timeout(self.config.report_timeout, write).await {
            Ok(Ok(record)) => {
                info!(
                    "Recorded win for {} in match {} (score {}, rank {})",
                    winner.short(), result.match_id, record.score, record.rank
                );
                ReportStatus::Recorded(record)
            }
            Ok(Err(e)) => {
                error!("Failed to record win for match {}: {}", result.match_id, e);
                ReportStatus::Failed(e)
            }
            Err(_) => {
                let e = RankingError::Timeout(self.config.report_timeout);
                error!("Failed to record win for match {}: {}", result.match_id, e);
                ReportStatus::Failed(e)
            }
        }
    }

    /// Whether a match id has been handled.
    pub async fn was_reported(&self, match_id: &Uuid) -> bool {
        self.reported.lock().await.contains_key(match_id)
    }

    async fn display_name(&self, player_id: &PlayerId) -> String {
        match self.profiles.get_profile(player_id).await {
            Ok(Some(profile)) => profile.name,
            Ok(None) => guest_name(player_id),
            Err(e) => {
                warn!("Profile lookup failed for {}: {}", player_id.short(), e);
                guest_name(player_id)
            }
        }
    }
}
