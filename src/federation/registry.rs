//! Follower/Following registry
//!
//! Maintains, per local actor, the set of remote followers and the set
//! of remote actors being followed. Backed by the injected store traits;
//! all operations are safe under concurrent calls for the same pair
//! (idempotent upsert/delete, no duplicate rows).
//!
//! Listing order is insertion order, oldest first, so collection pages
//! stay stable across requests.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;

use crate::data::{
    ActorRecord, EntityId, FederationStore, FollowState, FollowStore, FollowerRelation,
    FollowingRelation, LocalActor,
};
use crate::error::AppError;

/// Registry failure. Duplicate adds are idempotent no-ops, not errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("relation not found: {0}")]
    NotFound(String),
}

/// Follower/following registry over an injected store.
#[derive(Clone)]
pub struct FollowRegistry {
    store: Arc<dyn FederationStore>,
}

impl FollowRegistry {
    pub fn new(store: Arc<dyn FederationStore>) -> Self {
        Self { store }
    }

    // =========================================================================
    // Followers (remote actors following a local actor)
    // =========================================================================

    /// Record a remote follower.
    ///
    /// Idempotent: adding an existing pair returns the stored relation.
    /// Taking a resolved [`ActorRecord`] keeps the invariant that both
    /// sides of a relation were resolvable when it was created.
    pub async fn add_follower(
        &self,
        local: &LocalActor,
        remote: &ActorRecord,
        follow_activity_uri: Option<&str>,
    ) -> Result<FollowerRelation, AppError> {
        let relation = FollowerRelation {
            id: EntityId::new().0,
            local_actor_id: local.id.clone(),
            remote_actor_id: remote.id.clone(),
            follow_activity_uri: follow_activity_uri.map(str::to_string),
            delivery_failures: 0,
            created_at: Utc::now(),
        };

        let stored = self.store.add_follower(&relation).await?;
        if stored.id == relation.id {
            crate::metrics::FOLLOWERS_TOTAL.inc();
            tracing::info!(
                local = %local.username,
                remote = %remote.id,
                "follower added"
            );
        }

        Ok(stored)
    }

    /// Remove a follower relation. Returns true when one existed.
    pub async fn remove_follower(
        &self,
        local_actor_id: &str,
        remote_actor_id: &str,
    ) -> Result<bool, AppError> {
        let removed = self
            .store
            .remove_follower(local_actor_id, remote_actor_id)
            .await?;
        if removed {
            crate::metrics::FOLLOWERS_TOTAL.dec();
            tracing::info!(local = %local_actor_id, remote = %remote_actor_id, "follower removed");
        }
        Ok(removed)
    }

    pub async fn get_follower(
        &self,
        local_actor_id: &str,
        remote_actor_id: &str,
    ) -> Result<Option<FollowerRelation>, AppError> {
        self.store
            .get_follower(local_actor_id, remote_actor_id)
            .await
    }

    /// One page of followers, oldest first. Pages are 1-based.
    pub async fn list_followers(
        &self,
        local_actor_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<FollowerRelation>, AppError> {
        let offset = page.saturating_sub(1) * page_size;
        self.store
            .list_followers(local_actor_id, page_size, offset)
            .await
    }

    /// Every follower's remote actor id, oldest first (fan-out input).
    pub async fn all_follower_ids(&self, local_actor_id: &str) -> Result<Vec<String>, AppError> {
        let count = self.store.count_followers(local_actor_id).await?;
        let relations = self
            .store
            .list_followers(local_actor_id, count.max(0) as u32, 0)
            .await?;
        Ok(relations
            .into_iter()
            .map(|relation| relation.remote_actor_id)
            .collect())
    }

    pub async fn count_followers(&self, local_actor_id: &str) -> Result<i64, AppError> {
        self.store.count_followers(local_actor_id).await
    }

    // =========================================================================
    // Following (remote actors a local actor follows)
    // =========================================================================

    /// Record an outgoing follow in `pending` state.
    ///
    /// Idempotent: re-following the same actor returns the stored
    /// relation (whatever state it reached).
    pub async fn begin_following(
        &self,
        local: &LocalActor,
        remote: &ActorRecord,
        follow_activity_uri: &str,
    ) -> Result<FollowingRelation, AppError> {
        let relation = FollowingRelation {
            id: EntityId::new().0,
            local_actor_id: local.id.clone(),
            remote_actor_id: remote.id.clone(),
            follow_activity_uri: follow_activity_uri.to_string(),
            state: FollowState::Pending.as_str().to_string(),
            created_at: Utc::now(),
        };

        let stored = self.store.add_following(&relation).await?;
        if stored.id == relation.id {
            crate::metrics::FOLLOWING_TOTAL.inc();
            tracing::info!(
                local = %local.username,
                remote = %remote.id,
                "outgoing follow recorded as pending"
            );
        }

        Ok(stored)
    }

    /// Promote a pending follow to `accepted` (incoming Accept).
    pub async fn accept_following(
        &self,
        follow_activity_uri: &str,
    ) -> Result<FollowingRelation, AppError> {
        let relation = self
            .store
            .set_following_state_by_uri(follow_activity_uri, FollowState::Accepted)
            .await?
            .ok_or_else(|| RegistryError::NotFound(follow_activity_uri.to_string()))?;

        tracing::info!(remote = %relation.remote_actor_id, "follow accepted");
        Ok(relation)
    }

    /// Drop a pending follow (incoming Reject).
    pub async fn reject_following(
        &self,
        follow_activity_uri: &str,
    ) -> Result<Option<FollowingRelation>, AppError> {
        let removed = self
            .store
            .remove_following_by_uri(follow_activity_uri)
            .await?;
        if let Some(ref relation) = removed {
            crate::metrics::FOLLOWING_TOTAL.dec();
            tracing::info!(remote = %relation.remote_actor_id, "follow rejected by remote");
        }
        Ok(removed)
    }

    /// Drop a following relation (local Undo). Returns the relation so
    /// the caller can address the outgoing Undo activity.
    pub async fn undo_following(
        &self,
        local_actor_id: &str,
        remote_actor_id: &str,
    ) -> Result<FollowingRelation, AppError> {
        let relation = self
            .store
            .get_following(local_actor_id, remote_actor_id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(remote_actor_id.to_string()))?;

        self.store
            .remove_following(local_actor_id, remote_actor_id)
            .await?;
        crate::metrics::FOLLOWING_TOTAL.dec();

        Ok(relation)
    }

    /// One page of following relations, oldest first. Pages are 1-based.
    pub async fn list_following(
        &self,
        local_actor_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<FollowingRelation>, AppError> {
        let offset = page.saturating_sub(1) * page_size;
        self.store
            .list_following(local_actor_id, page_size, offset)
            .await
    }

    pub async fn count_following(&self, local_actor_id: &str) -> Result<i64, AppError> {
        self.store.count_following(local_actor_id).await
    }

    // =========================================================================
    // Unreachable-subscriber accounting
    // =========================================================================

    pub async fn record_delivery_failure(
        &self,
        local_actor_id: &str,
        remote_actor_id: &str,
    ) -> Result<(), AppError> {
        self.store
            .record_delivery_failure(local_actor_id, remote_actor_id)
            .await
    }

    pub async fn reset_delivery_failures(
        &self,
        local_actor_id: &str,
        remote_actor_id: &str,
    ) -> Result<(), AppError> {
        self.store
            .reset_delivery_failures(local_actor_id, remote_actor_id)
            .await
    }

    /// Remove follower relations whose consecutive permanent-failure
    /// count reached `threshold`. This is policy, invoked by the host,
    /// not by delivery mechanics.
    pub async fn prune_unreachable(&self, threshold: u32) -> Result<usize, AppError> {
        let pruned = self.store.prune_unreachable_followers(threshold).await?;
        for relation in &pruned {
            crate::metrics::FOLLOWERS_TOTAL.dec();
            tracing::info!(
                remote = %relation.remote_actor_id,
                failures = relation.delivery_failures,
                "pruned unreachable follower"
            );
        }
        Ok(pruned.len())
    }
}
