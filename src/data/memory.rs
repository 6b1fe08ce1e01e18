//! In-memory federation store
//!
//! Implements the repository traits over mutex-guarded maps with the same
//! idempotency and ordering semantics as the SQLite store. Used by the
//! test suite and by hosts embedding the engine without SQLite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::models::*;
use super::store::{FollowStore, JobStore, LocalActorStore};
use crate::error::AppError;

#[derive(Default)]
struct Inner {
    local_actors: Vec<LocalActor>,
    followers: Vec<FollowerRelation>,
    following: Vec<FollowingRelation>,
    jobs: HashMap<String, DeliveryJob>,
}

/// In-memory store; cheap to clone via `Arc` at the call sites.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_key<'a>(created_at: &'a DateTime<Utc>, id: &'a str) -> (DateTime<Utc>, &'a str) {
    (*created_at, id)
}

#[async_trait]
impl LocalActorStore for MemoryStore {
    async fn get_local_actor(&self, username: &str) -> Result<Option<LocalActor>, AppError> {
        let inner = self.inner.read().await;
        Ok(inner
            .local_actors
            .iter()
            .find(|actor| actor.username == username)
            .cloned())
    }

    async fn get_local_actor_by_id(&self, id: &str) -> Result<Option<LocalActor>, AppError> {
        let inner = self.inner.read().await;
        Ok(inner
            .local_actors
            .iter()
            .find(|actor| actor.id == id)
            .cloned())
    }

    async fn upsert_local_actor(&self, actor: &LocalActor) -> Result<(), AppError> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner
            .local_actors
            .iter_mut()
            .find(|existing| existing.username == actor.username)
        {
            existing.display_name = actor.display_name.clone();
            existing.note = actor.note.clone();
            existing.updated_at = actor.updated_at;
        } else {
            inner.local_actors.push(actor.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl FollowStore for MemoryStore {
    async fn add_follower(
        &self,
        relation: &FollowerRelation,
    ) -> Result<FollowerRelation, AppError> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.followers.iter().find(|existing| {
            existing.local_actor_id == relation.local_actor_id
                && existing.remote_actor_id == relation.remote_actor_id
        }) {
            return Ok(existing.clone());
        }
        inner.followers.push(relation.clone());
        Ok(relation.clone())
    }

    async fn remove_follower(
        &self,
        local_actor_id: &str,
        remote_actor_id: &str,
    ) -> Result<bool, AppError> {
        let mut inner = self.inner.write().await;
        let before = inner.followers.len();
        inner.followers.retain(|relation| {
            !(relation.local_actor_id == local_actor_id
                && relation.remote_actor_id == remote_actor_id)
        });
        Ok(inner.followers.len() < before)
    }

    async fn get_follower(
        &self,
        local_actor_id: &str,
        remote_actor_id: &str,
    ) -> Result<Option<FollowerRelation>, AppError> {
        let inner = self.inner.read().await;
        Ok(inner
            .followers
            .iter()
            .find(|relation| {
                relation.local_actor_id == local_actor_id
                    && relation.remote_actor_id == remote_actor_id
            })
            .cloned())
    }

    async fn list_followers(
        &self,
        local_actor_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<FollowerRelation>, AppError> {
        let inner = self.inner.read().await;
        let mut relations: Vec<FollowerRelation> = inner
            .followers
            .iter()
            .filter(|relation| relation.local_actor_id == local_actor_id)
            .cloned()
            .collect();
        relations.sort_by(|a, b| sort_key(&a.created_at, &a.id).cmp(&sort_key(&b.created_at, &b.id)));
        Ok(relations
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn count_followers(&self, local_actor_id: &str) -> Result<i64, AppError> {
        let inner = self.inner.read().await;
        Ok(inner
            .followers
            .iter()
            .filter(|relation| relation.local_actor_id == local_actor_id)
            .count() as i64)
    }

    async fn add_following(
        &self,
        relation: &FollowingRelation,
    ) -> Result<FollowingRelation, AppError> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.following.iter().find(|existing| {
            existing.local_actor_id == relation.local_actor_id
                && existing.remote_actor_id == relation.remote_actor_id
        }) {
            return Ok(existing.clone());
        }
        inner.following.push(relation.clone());
        Ok(relation.clone())
    }

    async fn remove_following(
        &self,
        local_actor_id: &str,
        remote_actor_id: &str,
    ) -> Result<bool, AppError> {
        let mut inner = self.inner.write().await;
        let before = inner.following.len();
        inner.following.retain(|relation| {
            !(relation.local_actor_id == local_actor_id
                && relation.remote_actor_id == remote_actor_id)
        });
        Ok(inner.following.len() < before)
    }

    async fn get_following(
        &self,
        local_actor_id: &str,
        remote_actor_id: &str,
    ) -> Result<Option<FollowingRelation>, AppError> {
        let inner = self.inner.read().await;
        Ok(inner
            .following
            .iter()
            .find(|relation| {
                relation.local_actor_id == local_actor_id
                    && relation.remote_actor_id == remote_actor_id
            })
            .cloned())
    }

    async fn set_following_state_by_uri(
        &self,
        follow_activity_uri: &str,
        state: FollowState,
    ) -> Result<Option<FollowingRelation>, AppError> {
        let mut inner = self.inner.write().await;
        if let Some(relation) = inner
            .following
            .iter_mut()
            .find(|relation| relation.follow_activity_uri == follow_activity_uri)
        {
            relation.state = state.as_str().to_string();
            return Ok(Some(relation.clone()));
        }
        Ok(None)
    }

    async fn remove_following_by_uri(
        &self,
        follow_activity_uri: &str,
    ) -> Result<Option<FollowingRelation>, AppError> {
        let mut inner = self.inner.write().await;
        let position = inner
            .following
            .iter()
            .position(|relation| relation.follow_activity_uri == follow_activity_uri);
        Ok(position.map(|index| inner.following.remove(index)))
    }

    async fn list_following(
        &self,
        local_actor_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<FollowingRelation>, AppError> {
        let inner = self.inner.read().await;
        let mut relations: Vec<FollowingRelation> = inner
            .following
            .iter()
            .filter(|relation| relation.local_actor_id == local_actor_id)
            .cloned()
            .collect();
        relations.sort_by(|a, b| sort_key(&a.created_at, &a.id).cmp(&sort_key(&b.created_at, &b.id)));
        Ok(relations
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn count_following(&self, local_actor_id: &str) -> Result<i64, AppError> {
        let inner = self.inner.read().await;
        Ok(inner
            .following
            .iter()
            .filter(|relation| relation.local_actor_id == local_actor_id)
            .count() as i64)
    }

    async fn record_delivery_failure(
        &self,
        local_actor_id: &str,
        remote_actor_id: &str,
    ) -> Result<(), AppError> {
        let mut inner = self.inner.write().await;
        if let Some(relation) = inner.followers.iter_mut().find(|relation| {
            relation.local_actor_id == local_actor_id
                && relation.remote_actor_id == remote_actor_id
        }) {
            relation.delivery_failures += 1;
        }
        Ok(())
    }

    async fn reset_delivery_failures(
        &self,
        local_actor_id: &str,
        remote_actor_id: &str,
    ) -> Result<(), AppError> {
        let mut inner = self.inner.write().await;
        if let Some(relation) = inner.followers.iter_mut().find(|relation| {
            relation.local_actor_id == local_actor_id
                && relation.remote_actor_id == remote_actor_id
        }) {
            relation.delivery_failures = 0;
        }
        Ok(())
    }

    async fn prune_unreachable_followers(
        &self,
        threshold: u32,
    ) -> Result<Vec<FollowerRelation>, AppError> {
        let mut inner = self.inner.write().await;
        let threshold = threshold as i64;
        let (unreachable, remaining): (Vec<_>, Vec<_>) = inner
            .followers
            .drain(..)
            .partition(|relation| relation.delivery_failures >= threshold);
        inner.followers = remaining;
        Ok(unreachable)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue_jobs(&self, jobs: &[DeliveryJob]) -> Result<(), AppError> {
        let mut inner = self.inner.write().await;
        for job in jobs {
            inner.jobs.insert(job.id.clone(), job.clone());
        }
        Ok(())
    }

    async fn due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DeliveryJob>, AppError> {
        let inner = self.inner.read().await;
        let mut due: Vec<DeliveryJob> = inner
            .jobs
            .values()
            .filter(|job| job.state == JobState::Pending.as_str() && job.next_attempt_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_attempt_at.cmp(&b.next_attempt_at));
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn get_job(&self, id: &str) -> Result<Option<DeliveryJob>, AppError> {
        let inner = self.inner.read().await;
        Ok(inner.jobs.get(id).cloned())
    }

    async fn mark_job(
        &self,
        id: &str,
        state: JobState,
        last_error: Option<&str>,
    ) -> Result<(), AppError> {
        let mut inner = self.inner.write().await;
        if let Some(job) = inner.jobs.get_mut(id) {
            job.state = state.as_str().to_string();
            job.last_error = last_error.map(str::to_string);
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn reschedule_job(
        &self,
        id: &str,
        attempt_count: i64,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<(), AppError> {
        let mut inner = self.inner.write().await;
        if let Some(job) = inner.jobs.get_mut(id) {
            if job.state == JobState::Pending.as_str() {
                job.attempt_count = attempt_count;
                job.next_attempt_at = next_attempt_at;
                job.last_error = Some(last_error.to_string());
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn cancel_jobs_for_activity(&self, activity_id: &str) -> Result<u64, AppError> {
        let mut inner = self.inner.write().await;
        let mut cancelled = 0;
        for job in inner.jobs.values_mut() {
            if job.activity_id == activity_id && job.state == JobState::Pending.as_str() {
                job.state = JobState::Cancelled.as_str().to_string();
                job.updated_at = Utc::now();
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn jobs_for_activity(&self, activity_id: &str) -> Result<Vec<DeliveryJob>, AppError> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<DeliveryJob> = inner
            .jobs
            .values()
            .filter(|job| job.activity_id == activity_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| sort_key(&a.created_at, &a.id).cmp(&sort_key(&b.created_at, &b.id)));
        Ok(jobs)
    }

    async fn count_pending_jobs(&self) -> Result<i64, AppError> {
        let inner = self.inner.read().await;
        Ok(inner
            .jobs
            .values()
            .filter(|job| job.state == JobState::Pending.as_str())
            .count() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn follower(local: &str, remote: &str) -> FollowerRelation {
        FollowerRelation {
            id: EntityId::new().0,
            local_actor_id: local.to_string(),
            remote_actor_id: remote.to_string(),
            follow_activity_uri: None,
            delivery_failures: 0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn add_follower_is_idempotent() {
        let store = MemoryStore::new();
        let relation = follower("local-1", "https://remote.example/users/alice");

        let first = store.add_follower(&relation).await.unwrap();
        let replay = store
            .add_follower(&follower("local-1", "https://remote.example/users/alice"))
            .await
            .unwrap();

        assert_eq!(first.id, replay.id, "replayed add must return the stored relation");
        assert_eq!(store.count_followers("local-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn list_followers_pages_in_insertion_order() {
        let store = MemoryStore::new();
        for n in 0..5 {
            let mut relation = follower("local-1", &format!("https://remote.example/users/u{n}"));
            relation.created_at = Utc::now() + chrono::Duration::seconds(n);
            store.add_follower(&relation).await.unwrap();
        }

        let first_page = store.list_followers("local-1", 2, 0).await.unwrap();
        let second_page = store.list_followers("local-1", 2, 2).await.unwrap();

        assert_eq!(first_page.len(), 2);
        assert_eq!(first_page[0].remote_actor_id, "https://remote.example/users/u0");
        assert_eq!(second_page[0].remote_actor_id, "https://remote.example/users/u2");
    }

    #[tokio::test]
    async fn prune_unreachable_removes_only_past_threshold() {
        let store = MemoryStore::new();
        store
            .add_follower(&follower("local-1", "https://a.example/u/1"))
            .await
            .unwrap();
        store
            .add_follower(&follower("local-1", "https://b.example/u/2"))
            .await
            .unwrap();

        for _ in 0..3 {
            store
                .record_delivery_failure("local-1", "https://a.example/u/1")
                .await
                .unwrap();
        }

        let pruned = store.prune_unreachable_followers(3).await.unwrap();
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].remote_actor_id, "https://a.example/u/1");
        assert_eq!(store.count_followers("local-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancel_jobs_skips_terminal_states() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let job = |id: &str, state: JobState| DeliveryJob {
            id: id.to_string(),
            activity_id: "activity-1".to_string(),
            activity_json: "{}".to_string(),
            inbox_url: "https://remote.example/inbox".to_string(),
            local_actor_id: "local-1".to_string(),
            recipient_ids: "[]".to_string(),
            attempt_count: 0,
            next_attempt_at: now,
            state: state.as_str().to_string(),
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        store
            .enqueue_jobs(&[job("j1", JobState::Pending), job("j2", JobState::Succeeded)])
            .await
            .unwrap();

        let cancelled = store.cancel_jobs_for_activity("activity-1").await.unwrap();
        assert_eq!(cancelled, 1);

        let succeeded = store.get_job("j2").await.unwrap().unwrap();
        assert_eq!(succeeded.job_state(), Some(JobState::Succeeded));
    }
}
