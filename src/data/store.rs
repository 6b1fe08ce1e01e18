//! Repository traits for the federation stores.
//!
//! The registry, dispatcher and scheduler only see these traits, so the
//! protocol logic stays independent of the storage engine. The crate
//! ships a SQLite implementation (`Database`) and an in-memory one
//! (`MemoryStore`) used in tests and by embedding hosts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::{DeliveryJob, FollowState, FollowerRelation, FollowingRelation, LocalActor};
use crate::error::AppError;

/// Access to the host platform's own publishing identities.
#[async_trait]
pub trait LocalActorStore: Send + Sync {
    async fn get_local_actor(&self, username: &str) -> Result<Option<LocalActor>, AppError>;

    async fn get_local_actor_by_id(&self, id: &str) -> Result<Option<LocalActor>, AppError>;

    async fn upsert_local_actor(&self, actor: &LocalActor) -> Result<(), AppError>;
}

/// Follower and following relations, keyed by local actor.
#[async_trait]
pub trait FollowStore: Send + Sync {
    /// Idempotent upsert: adding an existing pair returns the stored
    /// relation unchanged instead of duplicating it.
    async fn add_follower(
        &self,
        relation: &FollowerRelation,
    ) -> Result<FollowerRelation, AppError>;

    /// Returns true when a relation was removed.
    async fn remove_follower(
        &self,
        local_actor_id: &str,
        remote_actor_id: &str,
    ) -> Result<bool, AppError>;

    async fn get_follower(
        &self,
        local_actor_id: &str,
        remote_actor_id: &str,
    ) -> Result<Option<FollowerRelation>, AppError>;

    /// Insertion order, oldest first; stable across requests.
    async fn list_followers(
        &self,
        local_actor_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<FollowerRelation>, AppError>;

    async fn count_followers(&self, local_actor_id: &str) -> Result<i64, AppError>;

    /// Idempotent upsert, mirror of `add_follower`.
    async fn add_following(
        &self,
        relation: &FollowingRelation,
    ) -> Result<FollowingRelation, AppError>;

    async fn remove_following(
        &self,
        local_actor_id: &str,
        remote_actor_id: &str,
    ) -> Result<bool, AppError>;

    async fn get_following(
        &self,
        local_actor_id: &str,
        remote_actor_id: &str,
    ) -> Result<Option<FollowingRelation>, AppError>;

    /// Transition the relation identified by our outgoing Follow
    /// activity URI. Returns the updated relation when one matched.
    async fn set_following_state_by_uri(
        &self,
        follow_activity_uri: &str,
        state: FollowState,
    ) -> Result<Option<FollowingRelation>, AppError>;

    /// Remove the relation identified by our outgoing Follow activity
    /// URI (Reject handling). Returns the removed relation.
    async fn remove_following_by_uri(
        &self,
        follow_activity_uri: &str,
    ) -> Result<Option<FollowingRelation>, AppError>;

    /// Insertion order, oldest first; stable across requests.
    async fn list_following(
        &self,
        local_actor_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<FollowingRelation>, AppError>;

    async fn count_following(&self, local_actor_id: &str) -> Result<i64, AppError>;

    /// Bump the consecutive permanent-failure counter for a relation.
    async fn record_delivery_failure(
        &self,
        local_actor_id: &str,
        remote_actor_id: &str,
    ) -> Result<(), AppError>;

    /// Clear the failure counter after a successful delivery.
    async fn reset_delivery_failures(
        &self,
        local_actor_id: &str,
        remote_actor_id: &str,
    ) -> Result<(), AppError>;

    /// Remove follower relations whose failure counter reached the
    /// threshold. Returns the removed relations.
    async fn prune_unreachable_followers(
        &self,
        threshold: u32,
    ) -> Result<Vec<FollowerRelation>, AppError>;
}

/// Persisted delivery queue.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue_jobs(&self, jobs: &[DeliveryJob]) -> Result<(), AppError>;

    /// Pending jobs whose `next_attempt_at` is due, oldest first.
    async fn due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DeliveryJob>, AppError>;

    async fn get_job(&self, id: &str) -> Result<Option<DeliveryJob>, AppError>;

    /// Move a job into a terminal state.
    async fn mark_job(
        &self,
        id: &str,
        state: super::models::JobState,
        last_error: Option<&str>,
    ) -> Result<(), AppError>;

    /// Re-queue a job for a later attempt.
    async fn reschedule_job(
        &self,
        id: &str,
        attempt_count: i64,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<(), AppError>;

    /// Cancel all pending jobs of an activity (e.g., it was retracted).
    /// Returns the number of jobs cancelled.
    async fn cancel_jobs_for_activity(&self, activity_id: &str) -> Result<u64, AppError>;

    /// All jobs for an activity, for audit/observability.
    async fn jobs_for_activity(&self, activity_id: &str) -> Result<Vec<DeliveryJob>, AppError>;

    async fn count_pending_jobs(&self) -> Result<i64, AppError>;
}

/// Everything the federation engine needs from storage.
pub trait FederationStore: LocalActorStore + FollowStore + JobStore {}

impl<T: LocalActorStore + FollowStore + JobStore> FederationStore for T {}
