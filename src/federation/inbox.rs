//! Incoming activity processing
//!
//! Applies the follow-family activities to the registry after the HTTP
//! layer has verified the sender's signature:
//!
//! - `Follow` records the follower and answers with an `Accept`;
//! - `Undo(Follow)` removes the follower;
//! - `Accept`/`Reject` settle our own outgoing follows.
//!
//! Every other activity type is acknowledged and logged; content-side
//! handling (timelines, replies, likes rendering) belongs to the host
//! platform.

use serde_json::Value;

use std::sync::Arc;

use super::activity::builder;
use super::directory::ActorDirectory;
use super::outbox::OutboxDispatcher;
use super::registry::FollowRegistry;
use super::signature::VerifiedIdentity;
use crate::data::{EntityId, FederationStore, LocalActor, LocalActorStore};
use crate::error::AppError;

/// Handles verified activities arriving at an inbox.
#[derive(Clone)]
pub struct InboxProcessor {
    store: Arc<dyn FederationStore>,
    directory: ActorDirectory,
    registry: FollowRegistry,
    dispatcher: OutboxDispatcher,
    base_url: String,
}

fn activity_field<'a>(activity: &'a Value, field: &str) -> Result<&'a str, AppError> {
    activity
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Validation(format!("missing {field} in activity")))
}

/// An activity's object, as a URI: either a plain string or an embedded
/// object's `id`.
fn object_uri(activity: &Value) -> Result<String, AppError> {
    let object = activity
        .get("object")
        .ok_or_else(|| AppError::Validation("missing object in activity".to_string()))?;

    object
        .as_str()
        .or_else(|| object.get("id").and_then(Value::as_str))
        .map(str::to_string)
        .ok_or_else(|| AppError::Validation("invalid object in activity".to_string()))
}

fn object_type(activity: &Value) -> Option<&str> {
    activity
        .get("object")
        .and_then(|object| object.get("type"))
        .and_then(Value::as_str)
}

impl InboxProcessor {
    pub fn new(
        store: Arc<dyn FederationStore>,
        directory: ActorDirectory,
        registry: FollowRegistry,
        dispatcher: OutboxDispatcher,
        base_url: String,
    ) -> Self {
        Self {
            store,
            directory,
            registry,
            dispatcher,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Apply one verified activity addressed to `local`.
    ///
    /// The caller has already verified the signature and checked that the
    /// activity's `actor` matches the verified identity.
    pub async fn process(
        &self,
        local: &LocalActor,
        identity: &VerifiedIdentity,
        activity: &Value,
    ) -> Result<(), AppError> {
        let kind = activity_field(activity, "type")?;
        crate::metrics::ACTIVITIES_RECEIVED_TOTAL
            .with_label_values(&[kind])
            .inc();

        match kind {
            "Follow" => self.handle_follow(local, identity, activity).await,
            "Undo" => self.handle_undo(local, identity, activity).await,
            "Accept" => self.handle_accept(activity).await,
            "Reject" => self.handle_reject(activity).await,
            other => {
                tracing::debug!(
                    kind = %other,
                    actor = %identity.actor_id,
                    "activity acknowledged without protocol-side effect"
                );
                Ok(())
            }
        }
    }

    /// Apply one verified activity arriving at the shared inbox.
    ///
    /// The target local actor is derived from the activity itself: the
    /// `object` of a Follow, the undone Follow's object for an Undo.
    /// Accept/Reject identify the relation by our Follow activity URI
    /// and need no target.
    pub async fn process_shared(
        &self,
        identity: &VerifiedIdentity,
        activity: &Value,
    ) -> Result<(), AppError> {
        let kind = activity_field(activity, "type")?;
        crate::metrics::ACTIVITIES_RECEIVED_TOTAL
            .with_label_values(&[kind])
            .inc();

        match kind {
            "Follow" => {
                let target = object_uri(activity)?;
                let local = self.local_actor_for_uri(&target).await?;
                self.handle_follow(&local, identity, activity).await
            }
            "Undo" => {
                let target = activity
                    .get("object")
                    .and_then(|object| object.get("object"))
                    .and_then(Value::as_str);
                match target {
                    Some(uri) => {
                        let local = self.local_actor_for_uri(uri).await?;
                        self.handle_undo(&local, identity, activity).await
                    }
                    None => {
                        tracing::debug!(
                            actor = %identity.actor_id,
                            "Undo via shared inbox without a target actor, acknowledged"
                        );
                        Ok(())
                    }
                }
            }
            "Accept" => self.handle_accept(activity).await,
            "Reject" => self.handle_reject(activity).await,
            other => {
                tracing::debug!(
                    kind = %other,
                    actor = %identity.actor_id,
                    "activity acknowledged without protocol-side effect"
                );
                Ok(())
            }
        }
    }

    /// Look up the local actor a URI like `{base}/users/{name}` names.
    async fn local_actor_for_uri(&self, uri: &str) -> Result<LocalActor, AppError> {
        let username = uri
            .strip_prefix(&self.base_url)
            .and_then(|rest| rest.strip_prefix("/users/"))
            .map(|rest| rest.split(['/', '#']).next().unwrap_or(rest))
            .ok_or_else(|| {
                AppError::Validation(format!("activity does not target a local actor: {uri}"))
            })?;

        self.store
            .get_local_actor(username)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// Record the follower and answer with an Accept.
    async fn handle_follow(
        &self,
        local: &LocalActor,
        identity: &VerifiedIdentity,
        activity: &Value,
    ) -> Result<(), AppError> {
        let follow_uri = activity_field(activity, "id")?;
        let target = object_uri(activity)?;

        let local_uri = local.actor_uri(&self.base_url);
        if target != local_uri {
            return Err(AppError::Validation(format!(
                "Follow targets {target}, not this actor"
            )));
        }

        // Resolution populates the directory if the follower is unknown;
        // a relation never exists without a resolvable remote actor.
        let follower = self.directory.resolve(&identity.actor_id, false).await?;

        self.registry
            .add_follower(local, &follower, Some(follow_uri))
            .await?;

        let accept = builder::accept(
            &format!("{}/accept/{}", local_uri, EntityId::new().0),
            &local_uri,
            serde_json::json!({
                "type": "Follow",
                "id": follow_uri,
                "actor": follower.id,
                "object": local_uri,
            }),
            &follower.id,
        );
        self.dispatcher.dispatch(&accept, local).await?;

        Ok(())
    }

    /// Undo(Follow) removes the follower relation. Other undone types
    /// are acknowledged only.
    async fn handle_undo(
        &self,
        local: &LocalActor,
        identity: &VerifiedIdentity,
        activity: &Value,
    ) -> Result<(), AppError> {
        match object_type(activity) {
            Some("Follow") | None => {
                let removed = self
                    .registry
                    .remove_follower(&local.id, &identity.actor_id)
                    .await?;
                if !removed {
                    tracing::debug!(
                        actor = %identity.actor_id,
                        "Undo(Follow) for a relation we don't hold"
                    );
                }
                Ok(())
            }
            Some(other) => {
                tracing::debug!(kind = %other, "Undo acknowledged without protocol-side effect");
                Ok(())
            }
        }
    }

    /// Accept settles one of our pending outgoing follows.
    async fn handle_accept(&self, activity: &Value) -> Result<(), AppError> {
        let follow_uri = object_uri(activity)?;
        self.registry.accept_following(&follow_uri).await?;
        Ok(())
    }

    /// Reject drops one of our pending outgoing follows.
    async fn handle_reject(&self, activity: &Value) -> Result<(), AppError> {
        let follow_uri = object_uri(activity)?;
        self.registry.reject_following(&follow_uri).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ActorRecord, FollowState, JobStore, MemoryStore};
    use crate::federation::signature::SignatureScheme;
    use chrono::Utc;
    use std::sync::Arc;

    const BASE_URL: &str = "https://blog.example.com";

    struct Fixture {
        store: Arc<MemoryStore>,
        processor: InboxProcessor,
        registry: FollowRegistry,
        directory: ActorDirectory,
        local: LocalActor,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(reqwest::Client::new());
        let directory = ActorDirectory::new(
            client,
            store.clone(),
            BASE_URL.to_string(),
            std::time::Duration::from_secs(86400),
        );
        let registry = FollowRegistry::new(store.clone());
        let dispatcher = OutboxDispatcher::new(
            store.clone(),
            directory.clone(),
            registry.clone(),
            BASE_URL.to_string(),
        );
        let processor = InboxProcessor::new(
            store.clone(),
            directory.clone(),
            registry.clone(),
            dispatcher,
            BASE_URL.to_string(),
        );

        let local = LocalActor {
            id: EntityId::new().0,
            username: "alice".to_string(),
            display_name: None,
            note: None,
            private_key_pem: String::new(),
            public_key_pem: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.upsert_local_actor(&local).await.unwrap();

        Fixture {
            store,
            processor,
            registry,
            directory,
            local,
        }
    }

    fn remote_record(id: &str) -> ActorRecord {
        ActorRecord {
            id: id.to_string(),
            preferred_username: "bob".to_string(),
            display_name: None,
            inbox: format!("{id}/inbox"),
            shared_inbox: None,
            public_key_id: format!("{id}#main-key"),
            public_key_pem: String::new(),
        }
    }

    fn identity(actor_id: &str) -> VerifiedIdentity {
        VerifiedIdentity {
            key_id: format!("{actor_id}#main-key"),
            actor_id: actor_id.to_string(),
            scheme: SignatureScheme::Draft,
        }
    }

    #[tokio::test]
    async fn follow_records_follower_and_queues_accept() {
        let fx = fixture().await;
        let remote_id = "https://remote.example/users/bob";
        fx.directory.insert(remote_record(remote_id)).await;

        let follow = serde_json::json!({
            "type": "Follow",
            "id": "https://remote.example/follow/1",
            "actor": remote_id,
            "object": format!("{BASE_URL}/users/alice"),
        });

        fx.processor
            .process(&fx.local, &identity(remote_id), &follow)
            .await
            .unwrap();

        assert_eq!(fx.registry.count_followers(&fx.local.id).await.unwrap(), 1);

        // The Accept went out as a delivery job to the follower's inbox.
        let pending = fx.store.due_jobs(Utc::now(), 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].inbox_url, format!("{remote_id}/inbox"));
        let accept: serde_json::Value =
            serde_json::from_str(&pending[0].activity_json).unwrap();
        assert_eq!(accept["type"], "Accept");
        assert_eq!(accept["object"]["id"], "https://remote.example/follow/1");
    }

    #[tokio::test]
    async fn follow_for_another_actor_is_rejected() {
        let fx = fixture().await;
        let remote_id = "https://remote.example/users/bob";
        fx.directory.insert(remote_record(remote_id)).await;

        let follow = serde_json::json!({
            "type": "Follow",
            "id": "https://remote.example/follow/1",
            "actor": remote_id,
            "object": format!("{BASE_URL}/users/someone-else"),
        });

        let result = fx
            .processor
            .process(&fx.local, &identity(remote_id), &follow)
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
        assert_eq!(fx.registry.count_followers(&fx.local.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn undo_follow_removes_the_relation() {
        let fx = fixture().await;
        let remote_id = "https://remote.example/users/bob";
        let record = remote_record(remote_id);
        fx.directory.insert(record.clone()).await;
        fx.registry
            .add_follower(&fx.local, &record, Some("https://remote.example/follow/1"))
            .await
            .unwrap();

        let undo = serde_json::json!({
            "type": "Undo",
            "id": "https://remote.example/undo/1",
            "actor": remote_id,
            "object": {
                "type": "Follow",
                "id": "https://remote.example/follow/1",
            },
        });

        fx.processor
            .process(&fx.local, &identity(remote_id), &undo)
            .await
            .unwrap();

        assert_eq!(fx.registry.count_followers(&fx.local.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn accept_promotes_pending_follow() {
        let fx = fixture().await;
        let remote_id = "https://remote.example/users/bob";
        let record = remote_record(remote_id);
        let follow_uri = format!("{BASE_URL}/users/alice/follow/1");
        fx.registry
            .begin_following(&fx.local, &record, &follow_uri)
            .await
            .unwrap();

        let accept = serde_json::json!({
            "type": "Accept",
            "id": "https://remote.example/accept/1",
            "actor": remote_id,
            "object": follow_uri,
        });

        fx.processor
            .process(&fx.local, &identity(remote_id), &accept)
            .await
            .unwrap();

        let relation = fx
            .registry
            .list_following(&fx.local.id, 1, 10)
            .await
            .unwrap()
            .remove(0);
        assert_eq!(relation.follow_state(), Some(FollowState::Accepted));
    }

    #[tokio::test]
    async fn shared_inbox_routes_follow_to_target_actor() {
        let fx = fixture().await;
        let remote_id = "https://remote.example/users/bob";
        fx.directory.insert(remote_record(remote_id)).await;

        let follow = serde_json::json!({
            "type": "Follow",
            "id": "https://remote.example/follow/7",
            "actor": remote_id,
            "object": format!("{BASE_URL}/users/alice"),
        });

        fx.processor
            .process_shared(&identity(remote_id), &follow)
            .await
            .unwrap();

        assert_eq!(fx.registry.count_followers(&fx.local.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn shared_inbox_rejects_follow_for_unknown_actor() {
        let fx = fixture().await;
        let remote_id = "https://remote.example/users/bob";
        fx.directory.insert(remote_record(remote_id)).await;

        let follow = serde_json::json!({
            "type": "Follow",
            "id": "https://remote.example/follow/8",
            "actor": remote_id,
            "object": format!("{BASE_URL}/users/nobody"),
        });

        let result = fx
            .processor
            .process_shared(&identity(remote_id), &follow)
            .await;
        assert!(matches!(result, Err(AppError::NotFound)));
    }

    #[tokio::test]
    async fn unhandled_types_are_acknowledged() {
        let fx = fixture().await;
        let remote_id = "https://remote.example/users/bob";

        let like = serde_json::json!({
            "type": "Like",
            "id": "https://remote.example/like/1",
            "actor": remote_id,
            "object": format!("{BASE_URL}/posts/1"),
        });

        fx.processor
            .process(&fx.local, &identity(remote_id), &like)
            .await
            .unwrap();
    }
}
