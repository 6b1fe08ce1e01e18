//! SQLite store semantics: idempotent relation upserts, stable ordering,
//! and due-job polling — the same guarantees the in-memory store gives.

use chrono::{Duration, Utc};
use quillcast::data::{
    Database, DeliveryJob, EntityId, FollowState, FollowStore, FollowerRelation,
    FollowingRelation, JobState, JobStore, LocalActor, LocalActorStore,
};
use tempfile::TempDir;

async fn database() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::connect(&temp_dir.path().join("test.db"))
        .await
        .unwrap();
    (db, temp_dir)
}

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

fn job(id: &str, activity: &str, next_attempt_at: chrono::DateTime<Utc>) -> DeliveryJob {
    let now = Utc::now();
    DeliveryJob {
        id: id.to_string(),
        activity_id: activity.to_string(),
        activity_json: "{}".to_string(),
        inbox_url: "https://remote.example/inbox".to_string(),
        local_actor_id: "local-1".to_string(),
        recipient_ids: "[]".to_string(),
        attempt_count: 0,
        next_attempt_at,
        state: JobState::Pending.as_str().to_string(),
        last_error: None,
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn local_actor_round_trips() {
    let (db, _guard) = database().await;

    let actor = LocalActor {
        id: EntityId::new().0,
        username: "alice".to_string(),
        display_name: Some("Alice".to_string()),
        note: None,
        private_key_pem: "private".to_string(),
        public_key_pem: "public".to_string(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    db.upsert_local_actor(&actor).await.unwrap();

    let loaded = db.get_local_actor("alice").await.unwrap().unwrap();
    assert_eq!(loaded.id, actor.id);
    assert_eq!(loaded.display_name.as_deref(), Some("Alice"));

    let by_id = db.get_local_actor_by_id(&actor.id).await.unwrap().unwrap();
    assert_eq!(by_id.username, "alice");
}

#[tokio::test]
async fn add_follower_is_idempotent_per_pair() {
    let (db, _guard) = database().await;

    let first = db
        .add_follower(&follower("local-1", "https://remote.example/users/bob"))
        .await
        .unwrap();
    let replay = db
        .add_follower(&follower("local-1", "https://remote.example/users/bob"))
        .await
        .unwrap();

    assert_eq!(first.id, replay.id);
    assert_eq!(db.count_followers("local-1").await.unwrap(), 1);

    // A different local actor may hold the same remote follower.
    db.add_follower(&follower("local-2", "https://remote.example/users/bob"))
        .await
        .unwrap();
    assert_eq!(db.count_followers("local-2").await.unwrap(), 1);
}

#[tokio::test]
async fn list_followers_is_oldest_first_with_offset() {
    let (db, _guard) = database().await;

    for n in 0..4 {
        let mut relation = follower("local-1", &format!("https://remote.example/users/u{n}"));
        relation.created_at = Utc::now() + Duration::milliseconds(n);
        db.add_follower(&relation).await.unwrap();
    }

    let page = db.list_followers("local-1", 2, 1).await.unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].remote_actor_id, "https://remote.example/users/u1");
    assert_eq!(page[1].remote_actor_id, "https://remote.example/users/u2");
}

#[tokio::test]
async fn delivery_failure_accounting_and_pruning() {
    let (db, _guard) = database().await;

    db.add_follower(&follower("local-1", "https://a.example/u/1"))
        .await
        .unwrap();
    db.add_follower(&follower("local-1", "https://b.example/u/2"))
        .await
        .unwrap();

    for _ in 0..3 {
        db.record_delivery_failure("local-1", "https://a.example/u/1")
            .await
            .unwrap();
    }
    db.record_delivery_failure("local-1", "https://b.example/u/2")
        .await
        .unwrap();
    db.reset_delivery_failures("local-1", "https://b.example/u/2")
        .await
        .unwrap();

    let pruned = db.prune_unreachable_followers(3).await.unwrap();
    assert_eq!(pruned.len(), 1);
    assert_eq!(pruned[0].remote_actor_id, "https://a.example/u/1");
    assert_eq!(db.count_followers("local-1").await.unwrap(), 1);
}

#[tokio::test]
async fn following_state_transitions_by_follow_uri() {
    let (db, _guard) = database().await;

    let relation = FollowingRelation {
        id: EntityId::new().0,
        local_actor_id: "local-1".to_string(),
        remote_actor_id: "https://remote.example/users/bob".to_string(),
        follow_activity_uri: "https://blog.example.com/follow/1".to_string(),
        state: FollowState::Pending.as_str().to_string(),
        created_at: Utc::now(),
    };
    db.add_following(&relation).await.unwrap();

    let accepted = db
        .set_following_state_by_uri("https://blog.example.com/follow/1", FollowState::Accepted)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(accepted.follow_state(), Some(FollowState::Accepted));

    let removed = db
        .remove_following_by_uri("https://blog.example.com/follow/1")
        .await
        .unwrap();
    assert!(removed.is_some());
    assert_eq!(db.count_following("local-1").await.unwrap(), 0);
}

#[tokio::test]
async fn due_jobs_returns_only_pending_and_due() {
    let (db, _guard) = database().await;
    let now = Utc::now();

    db.enqueue_jobs(&[
        job("due", "activity-1", now - Duration::seconds(5)),
        job("future", "activity-1", now + Duration::seconds(3600)),
    ])
    .await
    .unwrap();

    let due = db.due_jobs(now, 10).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, "due");

    db.mark_job("due", JobState::Succeeded, None).await.unwrap();
    assert!(db.due_jobs(now, 10).await.unwrap().is_empty());
    assert_eq!(db.count_pending_jobs().await.unwrap(), 1);
}

#[tokio::test]
async fn reschedule_only_touches_pending_jobs() {
    let (db, _guard) = database().await;
    let now = Utc::now();

    db.enqueue_jobs(&[job("j1", "activity-1", now)]).await.unwrap();
    db.mark_job("j1", JobState::Cancelled, None).await.unwrap();

    db.reschedule_job("j1", 3, now + Duration::seconds(60), "should not apply")
        .await
        .unwrap();

    let loaded = db.get_job("j1").await.unwrap().unwrap();
    assert_eq!(loaded.job_state(), Some(JobState::Cancelled));
    assert_eq!(loaded.attempt_count, 0);
}

#[tokio::test]
async fn cancel_jobs_for_activity_reports_count() {
    let (db, _guard) = database().await;
    let now = Utc::now();

    db.enqueue_jobs(&[
        job("j1", "activity-1", now),
        job("j2", "activity-1", now),
        job("j3", "activity-2", now),
    ])
    .await
    .unwrap();

    let cancelled = db.cancel_jobs_for_activity("activity-1").await.unwrap();
    assert_eq!(cancelled, 2);

    let remaining = db.due_jobs(now, 10).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].activity_id, "activity-2");
}
