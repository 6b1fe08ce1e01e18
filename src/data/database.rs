//! SQLite database operations
//!
//! All database access goes through this module.
//! Uses SQLx with a migrations directory applied at connect time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use super::store::{FollowStore, JobStore, LocalActorStore};
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }
}

// =============================================================================
// Local actors
// =============================================================================

#[async_trait]
impl LocalActorStore for Database {
    async fn get_local_actor(&self, username: &str) -> Result<Option<LocalActor>, AppError> {
        let actor = sqlx::query_as::<_, LocalActor>(
            "SELECT * FROM local_actors WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(actor)
    }

    async fn get_local_actor_by_id(&self, id: &str) -> Result<Option<LocalActor>, AppError> {
        let actor = sqlx::query_as::<_, LocalActor>("SELECT * FROM local_actors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(actor)
    }

    async fn upsert_local_actor(&self, actor: &LocalActor) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO local_actors (id, username, display_name, note, private_key_pem, public_key_pem, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(username) DO UPDATE SET \
             display_name = excluded.display_name, \
             note = excluded.note, \
             updated_at = excluded.updated_at",
        )
        .bind(&actor.id)
        .bind(&actor.username)
        .bind(&actor.display_name)
        .bind(&actor.note)
        .bind(&actor.private_key_pem)
        .bind(&actor.public_key_pem)
        .bind(actor.created_at)
        .bind(actor.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// =============================================================================
// Followers / Following
// =============================================================================

#[async_trait]
impl FollowStore for Database {
    async fn add_follower(
        &self,
        relation: &FollowerRelation,
    ) -> Result<FollowerRelation, AppError> {
        // INSERT OR IGNORE + read-back keeps concurrent adds of the same
        // pair down to exactly one stored row.
        sqlx::query(
            "INSERT OR IGNORE INTO followers \
             (id, local_actor_id, remote_actor_id, follow_activity_uri, delivery_failures, created_at) \
             VALUES (?, ?, ?, ?, 0, ?)",
        )
        .bind(&relation.id)
        .bind(&relation.local_actor_id)
        .bind(&relation.remote_actor_id)
        .bind(&relation.follow_activity_uri)
        .bind(relation.created_at)
        .execute(&self.pool)
        .await?;

        let stored = self
            .get_follower(&relation.local_actor_id, &relation.remote_actor_id)
            .await?
            .ok_or_else(|| {
                AppError::Internal(anyhow::anyhow!("follower row missing after upsert"))
            })?;

        Ok(stored)
    }

    async fn remove_follower(
        &self,
        local_actor_id: &str,
        remote_actor_id: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "DELETE FROM followers WHERE local_actor_id = ? AND remote_actor_id = ?",
        )
        .bind(local_actor_id)
        .bind(remote_actor_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_follower(
        &self,
        local_actor_id: &str,
        remote_actor_id: &str,
    ) -> Result<Option<FollowerRelation>, AppError> {
        let relation = sqlx::query_as::<_, FollowerRelation>(
            "SELECT * FROM followers WHERE local_actor_id = ? AND remote_actor_id = ?",
        )
        .bind(local_actor_id)
        .bind(remote_actor_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(relation)
    }

    async fn list_followers(
        &self,
        local_actor_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<FollowerRelation>, AppError> {
        let relations = sqlx::query_as::<_, FollowerRelation>(
            "SELECT * FROM followers WHERE local_actor_id = ? \
             ORDER BY created_at ASC, id ASC LIMIT ? OFFSET ?",
        )
        .bind(local_actor_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(relations)
    }

    async fn count_followers(&self, local_actor_id: &str) -> Result<i64, AppError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM followers WHERE local_actor_id = ?")
                .bind(local_actor_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn add_following(
        &self,
        relation: &FollowingRelation,
    ) -> Result<FollowingRelation, AppError> {
        sqlx::query(
            "INSERT OR IGNORE INTO following \
             (id, local_actor_id, remote_actor_id, follow_activity_uri, state, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&relation.id)
        .bind(&relation.local_actor_id)
        .bind(&relation.remote_actor_id)
        .bind(&relation.follow_activity_uri)
        .bind(&relation.state)
        .bind(relation.created_at)
        .execute(&self.pool)
        .await?;

        let stored = self
            .get_following(&relation.local_actor_id, &relation.remote_actor_id)
            .await?
            .ok_or_else(|| {
                AppError::Internal(anyhow::anyhow!("following row missing after upsert"))
            })?;

        Ok(stored)
    }

    async fn remove_following(
        &self,
        local_actor_id: &str,
        remote_actor_id: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "DELETE FROM following WHERE local_actor_id = ? AND remote_actor_id = ?",
        )
        .bind(local_actor_id)
        .bind(remote_actor_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_following(
        &self,
        local_actor_id: &str,
        remote_actor_id: &str,
    ) -> Result<Option<FollowingRelation>, AppError> {
        let relation = sqlx::query_as::<_, FollowingRelation>(
            "SELECT * FROM following WHERE local_actor_id = ? AND remote_actor_id = ?",
        )
        .bind(local_actor_id)
        .bind(remote_actor_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(relation)
    }

    async fn set_following_state_by_uri(
        &self,
        follow_activity_uri: &str,
        state: FollowState,
    ) -> Result<Option<FollowingRelation>, AppError> {
        sqlx::query("UPDATE following SET state = ? WHERE follow_activity_uri = ?")
            .bind(state.as_str())
            .bind(follow_activity_uri)
            .execute(&self.pool)
            .await?;

        let relation = sqlx::query_as::<_, FollowingRelation>(
            "SELECT * FROM following WHERE follow_activity_uri = ?",
        )
        .bind(follow_activity_uri)
        .fetch_optional(&self.pool)
        .await?;

        Ok(relation)
    }

    async fn remove_following_by_uri(
        &self,
        follow_activity_uri: &str,
    ) -> Result<Option<FollowingRelation>, AppError> {
        let relation = sqlx::query_as::<_, FollowingRelation>(
            "SELECT * FROM following WHERE follow_activity_uri = ?",
        )
        .bind(follow_activity_uri)
        .fetch_optional(&self.pool)
        .await?;

        if relation.is_some() {
            sqlx::query("DELETE FROM following WHERE follow_activity_uri = ?")
                .bind(follow_activity_uri)
                .execute(&self.pool)
                .await?;
        }

        Ok(relation)
    }

    async fn list_following(
        &self,
        local_actor_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<FollowingRelation>, AppError> {
        let relations = sqlx::query_as::<_, FollowingRelation>(
            "SELECT * FROM following WHERE local_actor_id = ? \
             ORDER BY created_at ASC, id ASC LIMIT ? OFFSET ?",
        )
        .bind(local_actor_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(relations)
    }

    async fn count_following(&self, local_actor_id: &str) -> Result<i64, AppError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM following WHERE local_actor_id = ?")
                .bind(local_actor_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn record_delivery_failure(
        &self,
        local_actor_id: &str,
        remote_actor_id: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE followers SET delivery_failures = delivery_failures + 1 \
             WHERE local_actor_id = ? AND remote_actor_id = ?",
        )
        .bind(local_actor_id)
        .bind(remote_actor_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reset_delivery_failures(
        &self,
        local_actor_id: &str,
        remote_actor_id: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE followers SET delivery_failures = 0 \
             WHERE local_actor_id = ? AND remote_actor_id = ? AND delivery_failures != 0",
        )
        .bind(local_actor_id)
        .bind(remote_actor_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn prune_unreachable_followers(
        &self,
        threshold: u32,
    ) -> Result<Vec<FollowerRelation>, AppError> {
        let unreachable = sqlx::query_as::<_, FollowerRelation>(
            "SELECT * FROM followers WHERE delivery_failures >= ?",
        )
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;

        if !unreachable.is_empty() {
            sqlx::query("DELETE FROM followers WHERE delivery_failures >= ?")
                .bind(threshold)
                .execute(&self.pool)
                .await?;
        }

        Ok(unreachable)
    }
}

// =============================================================================
// Delivery jobs
// =============================================================================

#[async_trait]
impl JobStore for Database {
    async fn enqueue_jobs(&self, jobs: &[DeliveryJob]) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        for job in jobs {
            sqlx::query(
                "INSERT INTO delivery_jobs \
                 (id, activity_id, activity_json, inbox_url, local_actor_id, recipient_ids, \
                  attempt_count, next_attempt_at, state, last_error, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&job.id)
            .bind(&job.activity_id)
            .bind(&job.activity_json)
            .bind(&job.inbox_url)
            .bind(&job.local_actor_id)
            .bind(&job.recipient_ids)
            .bind(job.attempt_count)
            .bind(job.next_attempt_at)
            .bind(&job.state)
            .bind(&job.last_error)
            .bind(job.created_at)
            .bind(job.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DeliveryJob>, AppError> {
        let jobs = sqlx::query_as::<_, DeliveryJob>(
            "SELECT * FROM delivery_jobs WHERE state = 'pending' AND next_attempt_at <= ? \
             ORDER BY next_attempt_at ASC LIMIT ?",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn get_job(&self, id: &str) -> Result<Option<DeliveryJob>, AppError> {
        let job = sqlx::query_as::<_, DeliveryJob>("SELECT * FROM delivery_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    async fn mark_job(
        &self,
        id: &str,
        state: JobState,
        last_error: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE delivery_jobs SET state = ?, last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(last_error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reschedule_job(
        &self,
        id: &str,
        attempt_count: i64,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE delivery_jobs SET attempt_count = ?, next_attempt_at = ?, \
             last_error = ?, updated_at = ? WHERE id = ? AND state = 'pending'",
        )
        .bind(attempt_count)
        .bind(next_attempt_at)
        .bind(last_error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn cancel_jobs_for_activity(&self, activity_id: &str) -> Result<u64, AppError> {
        let result = sqlx::query(
            "UPDATE delivery_jobs SET state = 'cancelled', updated_at = ? \
             WHERE activity_id = ? AND state = 'pending'",
        )
        .bind(Utc::now())
        .bind(activity_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn jobs_for_activity(&self, activity_id: &str) -> Result<Vec<DeliveryJob>, AppError> {
        let jobs = sqlx::query_as::<_, DeliveryJob>(
            "SELECT * FROM delivery_jobs WHERE activity_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(activity_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn count_pending_jobs(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM delivery_jobs WHERE state = 'pending'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
