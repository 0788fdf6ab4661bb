//! Collaborators of the join protocol.
//!
//! [`WorldState`] is the simulation layer's view of the session (profiles,
//! cached events, avatar entities). [`SessionDirectory`] is the hosting
//! application's view (authentication, invite codes, chat notifications).
//! Both are traits so the orchestrator can run against in-memory versions in
//! development and tests.

use crate::types::UserId;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Avatar asset references published with the profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvatarDetail {
    pub avatar_url: String,
    pub thumbnail_url: String,
}

/// Identity of an authenticated connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: UserId,
    pub name: String,
    pub avatar: Option<AvatarDetail>,
}

/// User that issued an invite code, and where they currently are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inviter {
    pub user_id: UserId,
    pub instance_id: Option<String>,
}

/// Simulation-layer state shared by every peer of the session.
#[async_trait::async_trait]
pub trait WorldState: Send + Sync {
    /// Publish a user's name and avatar for other peers.
    async fn publish_profile(&self, user_index: u64, profile: &UserProfile);

    /// Events the user missed while disconnected. Drained on read.
    async fn cached_events(&self, user_id: &UserId) -> Vec<Value>;

    /// Logical start time of the session, epoch milliseconds.
    async fn start_time(&self) -> i64;

    /// Whether the user's avatar entity exists yet.
    async fn avatar_spawned(&self, user_id: &UserId) -> bool;

    /// Move the user's avatar next to `target`'s. Returns false if either is missing.
    async fn spawn_near(&self, user_id: &UserId, target: &UserId) -> bool;
}

/// Hosting application services.
#[async_trait::async_trait]
pub trait SessionDirectory: Send + Sync {
    /// Resolve a connection token to a profile.
    async fn authenticate(&self, token: &str) -> Option<UserProfile>;

    /// Resolve an invite code to the inviting user.
    async fn find_inviter(&self, invite_code: &str) -> Option<Inviter>;

    /// Post a chat-style notification to the session.
    async fn post_notification(&self, text: &str);
}

/// In-memory collaborators for development and tests.
pub mod memory {
    use super::{Inviter, SessionDirectory, UserProfile, WorldState};
    use crate::types::UserId;

    use serde_json::Value;
    use std::collections::{HashMap, HashSet};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct WorldTables {
        profiles: HashMap<UserId, (u64, UserProfile)>,
        cached: HashMap<UserId, Vec<Value>>,
        spawned: HashSet<UserId>,
        spawns: Vec<(UserId, UserId)>,
    }

    /// In-memory [`WorldState`].
    pub struct InMemoryWorld {
        start_time: i64,
        tables: Mutex<WorldTables>,
    }

    impl Default for InMemoryWorld {
        fn default() -> Self {
            Self::new(chrono::Utc::now().timestamp_millis())
        }
    }

    impl InMemoryWorld {
        #[must_use]
        pub fn new(start_time: i64) -> Self {
            Self {
                start_time,
                tables: Mutex::new(WorldTables::default()),
            }
        }

        /// Mark a user's avatar entity as materialized.
        pub async fn mark_spawned(&self, user_id: &UserId) {
            self.tables.lock().await.spawned.insert(user_id.clone());
        }

        /// Record an event for delivery on the user's next join.
        pub async fn cache_event(&self, user_id: &UserId, event: Value) {
            self.tables
                .lock()
                .await
                .cached
                .entry(user_id.clone())
                .or_default()
                .push(event);
        }

        /// Published profile and user index.
        pub async fn profile(&self, user_id: &UserId) -> Option<(u64, UserProfile)> {
            self.tables.lock().await.profiles.get(user_id).cloned()
        }

        /// Completed spawn-near moves, as (user, target) pairs.
        pub async fn spawns(&self) -> Vec<(UserId, UserId)> {
            self.tables.lock().await.spawns.clone()
        }
    }

    #[async_trait::async_trait]
    impl WorldState for InMemoryWorld {
        async fn publish_profile(&self, user_index: u64, profile: &UserProfile) {
            self.tables
                .lock()
                .await
                .profiles
                .insert(profile.user_id.clone(), (user_index, profile.clone()));
        }

        async fn cached_events(&self, user_id: &UserId) -> Vec<Value> {
            self.tables
                .lock()
                .await
                .cached
                .remove(user_id)
                .unwrap_or_default()
        }

        async fn start_time(&self) -> i64 {
            self.start_time
        }

        async fn avatar_spawned(&self, user_id: &UserId) -> bool {
            self.tables.lock().await.spawned.contains(user_id)
        }

        async fn spawn_near(&self, user_id: &UserId, target: &UserId) -> bool {
            let mut tables = self.tables.lock().await;
            if !tables.spawned.contains(user_id) || !tables.spawned.contains(target) {
                return false;
            }
            tables.spawns.push((user_id.clone(), target.clone()));
            true
        }
    }

    #[derive(Default)]
    struct DirectoryTables {
        tokens: HashMap<String, UserProfile>,
        invites: HashMap<String, Inviter>,
        notifications: Vec<String>,
    }

    /// In-memory [`SessionDirectory`].
    #[derive(Default)]
    pub struct InMemoryDirectory {
        allow_anonymous: bool,
        tables: Mutex<DirectoryTables>,
    }

    impl InMemoryDirectory {
        /// Directory that only knows registered tokens.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Directory that also accepts unknown tokens, using the token as user id.
        #[must_use]
        pub fn anonymous() -> Self {
            Self {
                allow_anonymous: true,
                tables: Mutex::new(DirectoryTables::default()),
            }
        }

        pub async fn add_user(&self, token: &str, profile: UserProfile) {
            self.tables
                .lock()
                .await
                .tokens
                .insert(token.to_string(), profile);
        }

        pub async fn add_invite(&self, invite_code: &str, inviter: Inviter) {
            self.tables
                .lock()
                .await
                .invites
                .insert(invite_code.to_string(), inviter);
        }

        pub async fn notifications(&self) -> Vec<String> {
            self.tables.lock().await.notifications.clone()
        }
    }

    #[async_trait::async_trait]
    impl SessionDirectory for InMemoryDirectory {
        async fn authenticate(&self, token: &str) -> Option<UserProfile> {
            if token.is_empty() {
                return None;
            }
            if let Some(profile) = self.tables.lock().await.tokens.get(token) {
                return Some(profile.clone());
            }
            self.allow_anonymous.then(|| UserProfile {
                user_id: UserId(token.to_string()),
                name: format!("Guest {}", token.chars().take(6).collect::<String>()),
                avatar: None,
            })
        }

        async fn find_inviter(&self, invite_code: &str) -> Option<Inviter> {
            self.tables.lock().await.invites.get(invite_code).cloned()
        }

        async fn post_notification(&self, text: &str) {
            self.tables
                .lock()
                .await
                .notifications
                .push(text.to_string());
        }
    }

    #[cfg(test)]
    #[allow(clippy::unwrap_used, clippy::expect_used)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_cached_events_are_drained() {
            let world = InMemoryWorld::new(0);
            let user = UserId::from("u1");
            world
                .cache_event(&user, serde_json::json!({"type": "chat"}))
                .await;

            assert_eq!(world.cached_events(&user).await.len(), 1);
            assert!(world.cached_events(&user).await.is_empty());
        }

        #[tokio::test]
        async fn test_spawn_near_requires_both_avatars() {
            let world = InMemoryWorld::new(0);
            let a = UserId::from("a");
            let b = UserId::from("b");
            world.mark_spawned(&a).await;
            assert!(!world.spawn_near(&a, &b).await);

            world.mark_spawned(&b).await;
            assert!(world.spawn_near(&a, &b).await);
            assert_eq!(world.spawns().await, vec![(a, b)]);
        }

        #[tokio::test]
        async fn test_directory_authentication_modes() {
            let strict = InMemoryDirectory::new();
            assert!(strict.authenticate("unknown").await.is_none());

            let open = InMemoryDirectory::anonymous();
            let profile = open.authenticate("abcdef123").await.unwrap();
            assert_eq!(profile.user_id, UserId::from("abcdef123"));
            assert_eq!(profile.name, "Guest abcdef");
            assert!(open.authenticate("").await.is_none());
        }
    }
}
