//! User directory collaborator used to enrich broadcasts with human-readable names.

use std::sync::Arc;

use dashmap::DashMap;
use futures::{FutureExt, future::BoxFuture};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use utoipa::ToSchema;

use crate::dao::storage::StorageResult;

/// Label used when a user id cannot be resolved.
pub const UNKNOWN_PLAYER_LABEL: &str = "Unknown player";

/// Public profile of a user, as broadcast in presence events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct UserProfile {
    /// Stable user identifier.
    pub user_id: String,
    /// Name shown to other players.
    pub display_name: String,
    /// Avatar URL, when the user has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Directory role (`player`, `admin`, ...); unrelated to the in-game role.
    pub role: String,
}

impl UserProfile {
    /// Stand-in profile for a user the directory does not know.
    pub fn placeholder(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_name: UNKNOWN_PLAYER_LABEL.to_string(),
            avatar: None,
            role: "player".into(),
        }
    }

    /// Whether the directory grants room management rights.
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

/// Read access to user profiles.
pub trait UserDirectory: Send + Sync {
    /// Profile of `user_id`, or `None` when the directory does not know it.
    fn get_user(&self, user_id: &str) -> BoxFuture<'static, StorageResult<Option<UserProfile>>>;
}

/// Directory backed by a concurrent map, seeded from configuration.
#[derive(Clone, Default)]
pub struct MemoryUserDirectory {
    users: Arc<DashMap<String, UserProfile>>,
}

impl MemoryUserDirectory {
    /// Directory holding `profiles`, keyed by user id.
    pub fn new(profiles: impl IntoIterator<Item = UserProfile>) -> Self {
        let users = profiles
            .into_iter()
            .map(|profile| (profile.user_id.clone(), profile))
            .collect::<DashMap<_, _>>();
        Self {
            users: Arc::new(users),
        }
    }

    /// Insert or replace a profile.
    pub fn upsert(&self, profile: UserProfile) {
        self.users.insert(profile.user_id.clone(), profile);
    }
}

impl UserDirectory for MemoryUserDirectory {
    fn get_user(&self, user_id: &str) -> BoxFuture<'static, StorageResult<Option<UserProfile>>> {
        let profile = self.users.get(user_id).map(|entry| entry.value().clone());
        async move { Ok(profile) }.boxed()
    }
}

/// Look a user up, falling back to [`UserProfile::placeholder`] on absence or failure.
pub async fn resolve_profile(directory: &dyn UserDirectory, user_id: &str) -> UserProfile {
    match directory.get_user(user_id).await {
        Ok(Some(profile)) => profile,
        Ok(None) => {
            debug!(user_id, "user not found in directory; using placeholder");
            UserProfile::placeholder(user_id)
        }
        Err(err) => {
            warn!(user_id, error = %err, "user directory lookup failed; using placeholder");
            UserProfile::placeholder(user_id)
        }
    }
}
