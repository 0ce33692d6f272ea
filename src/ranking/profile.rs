//! Player profiles.
//!
//! One row per player, written by the login hook and read when a result
//! needs a display name.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::game::state::PlayerId;

/// Stored player profile.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Player id.
    pub id: PlayerId,
    /// Device the player last logged in from, if any.
    pub device_id: Option<String>,
    /// Display name.
    pub name: String,
    /// First login.
    pub created_at: DateTime<Utc>,
    /// Latest upsert.
    pub updated_at: DateTime<Utc>,
}

/// Fallback display name: `Guest-` plus the first five characters of the id.
pub fn guest_name(id: &PlayerId) -> String {
    let uuid = id.to_uuid_string();
    format!("Guest-{}", &uuid[..5])
}

/// Profile persistence failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProfileError {
    /// Backend could not be reached or refused the operation.
    #[error("profile persistence unavailable: {0}")]
    PersistenceUnavailable(String),
}

/// Profile backend.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Insert or update by id. `created_at` is preserved on update.
    async fn upsert_profile(&self, profile: Profile) -> Result<Profile, ProfileError>;

    /// Look up by id.
    async fn get_profile(&self, id: &PlayerId) -> Result<Option<Profile>, ProfileError>;
}

/// In-process profile store.
#[derive(Default)]
pub struct InMemoryProfileStore {
    profiles: RwLock<BTreeMap<PlayerId, Profile>>,
}

impl InMemoryProfileStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn upsert_profile(&self, mut profile: Profile) -> Result<Profile, ProfileError> {
        let mut profiles = self.profiles.write().await;
        if let Some(existing) = profiles.get(&profile.id) {
            profile.created_at = existing.created_at;
        }
        profiles.insert(profile.id, profile.clone());
        Ok(profile)
    }

    async fn get_profile(&self, id: &PlayerId) -> Result<Option<Profile>, ProfileError> {
        Ok(self.profiles.read().await.get(id).cloned())
    }
}
