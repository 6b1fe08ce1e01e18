//! Federation service facade
//!
//! The surface consumed by out-of-scope collaborators (admin screens,
//! CLI wrappers, importers): every operation returns a success value or
//! a typed error, never fails silently.

use std::sync::Arc;

use crate::data::{
    ActorRecord, DeliveryJob, EntityId, FederationStore, FollowingRelation, JobStore, LocalActor,
    LocalActorStore,
};
use crate::error::AppError;
use crate::federation::activity::{Activity, builder};
use crate::federation::directory::ActorDirectory;
use crate::federation::outbox::{DispatchReceipt, OutboxDispatcher};
use crate::federation::registry::FollowRegistry;
use crate::federation::webfinger::{self, WebFingerResolver, WebFingerResponse};

/// Typed operations over the federation engine.
#[derive(Clone)]
pub struct FederationService {
    store: Arc<dyn FederationStore>,
    directory: ActorDirectory,
    registry: FollowRegistry,
    dispatcher: OutboxDispatcher,
    webfinger: WebFingerResolver,
    domain: String,
    base_url: String,
}

impl FederationService {
    pub fn new(
        store: Arc<dyn FederationStore>,
        directory: ActorDirectory,
        registry: FollowRegistry,
        dispatcher: OutboxDispatcher,
        webfinger: WebFingerResolver,
        domain: String,
        base_url: String,
    ) -> Self {
        Self {
            store,
            directory,
            registry,
            dispatcher,
            webfinger,
            domain,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Resolve an actor id (local or remote) to its canonical record.
    pub async fn resolve_actor(&self, id: &str) -> Result<ActorRecord, AppError> {
        Ok(self.directory.resolve(id, false).await?)
    }

    /// Start following a remote actor, by URI or `@user@host` handle.
    ///
    /// Emits the outgoing Follow activity and records the relation as
    /// pending until the remote Accept arrives. A heuristic (non-
    /// authoritative) WebFinger fallback is only trusted after the
    /// guessed actor document actually resolves.
    pub async fn follow(
        &self,
        target: &str,
        local_actor_id: &str,
    ) -> Result<FollowingRelation, AppError> {
        let local = self.local_actor_by_id(local_actor_id).await?;

        let target_uri = if target.contains("://") {
            target.to_string()
        } else {
            let resolved = self.webfinger.resolve_handle(target).await?;
            if !resolved.authoritative {
                tracing::warn!(
                    %target,
                    guess = %resolved.actor_id,
                    "webfinger discovery unavailable, verifying heuristic guess"
                );
            }
            resolved.actor_id
        };

        // Resolution both validates the target and caches its record for
        // the delivery fan-out below.
        let remote = self.directory.resolve(&target_uri, false).await?;

        let local_uri = local.actor_uri(&self.base_url);
        let follow_uri = format!("{}/follow/{}", local_uri, EntityId::new().0);

        let relation = self
            .registry
            .begin_following(&local, &remote, &follow_uri)
            .await?;

        // Re-follow of an existing relation re-uses its original Follow
        // activity; don't send a second one.
        if relation.follow_activity_uri == follow_uri {
            let activity = builder::follow(&follow_uri, &local_uri, &remote.id);
            self.dispatcher.dispatch(&activity, &local).await?;
        }

        Ok(relation)
    }

    /// Stop following a remote actor: emits Undo(Follow) and removes the
    /// relation.
    pub async fn unfollow(
        &self,
        remote_actor_id: &str,
        local_actor_id: &str,
    ) -> Result<(), AppError> {
        let local = self.local_actor_by_id(local_actor_id).await?;
        let relation = self
            .registry
            .undo_following(local_actor_id, remote_actor_id)
            .await?;

        let local_uri = local.actor_uri(&self.base_url);
        let undo = builder::undo(
            &format!("{}/undo/{}", local_uri, EntityId::new().0),
            &local_uri,
            serde_json::json!({
                "type": "Follow",
                "id": relation.follow_activity_uri,
                "actor": local_uri,
                "object": remote_actor_id,
            }),
            vec![remote_actor_id.to_string()],
        );
        self.dispatcher.dispatch(&undo, &local).await?;

        Ok(())
    }

    pub async fn count_followers(&self, local_actor_id: &str) -> Result<i64, AppError> {
        self.registry.count_followers(local_actor_id).await
    }

    /// Enqueue an activity for delivery. Returns the created job ids;
    /// outcomes are asynchronous and visible through the audit surface.
    pub async fn dispatch(
        &self,
        activity: &Activity,
        local_actor_id: &str,
    ) -> Result<DispatchReceipt, AppError> {
        let local = self.local_actor_by_id(local_actor_id).await?;
        self.dispatcher.dispatch(activity, &local).await
    }

    /// Cancel pending deliveries of a retracted activity.
    pub async fn cancel_dispatch(&self, activity_id: &str) -> Result<u64, AppError> {
        self.dispatcher.cancel(activity_id)
            .await
    }

    /// Delivery outcomes of an activity, for audit/observability.
    pub async fn delivery_audit(&self, activity_id: &str) -> Result<Vec<DeliveryJob>, AppError> {
        self.store.jobs_for_activity(activity_id).await
    }

    /// WebFinger JRD for a local actor.
    ///
    /// # Arguments
    /// * `resource` - `acct:user@domain` resource parameter
    pub async fn get_webfinger(&self, resource: &str) -> Result<WebFingerResponse, AppError> {
        if !resource.starts_with("acct:") {
            return Err(AppError::Validation(
                "resource must start with 'acct:'".to_string(),
            ));
        }

        let (username, domain) = webfinger::parse_handle(resource)
            .map_err(|_| AppError::Validation("invalid acct resource".to_string()))?;

        if domain != self.domain {
            return Err(AppError::NotFound);
        }

        let actor = self
            .store
            .get_local_actor(&username)
            .await?
            .ok_or(AppError::NotFound)?;

        Ok(webfinger::local_descriptor(
            &actor.username,
            &self.domain,
            &self.base_url,
        ))
    }

    /// Unreachable-subscriber cleanup policy hook.
    pub async fn prune_unreachable_followers(&self, threshold: u32) -> Result<usize, AppError> {
        self.registry.prune_unreachable(threshold).await
    }

    async fn local_actor_by_id(&self, local_actor_id: &str) -> Result<LocalActor, AppError> {
        self.store
            .get_local_actor_by_id(local_actor_id)
            .await?
            .ok_or(AppError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemoryStore;
    use chrono::Utc;

    const BASE_URL: &str = "https://blog.example.com";

    async fn service_with_local_actor() -> (FederationService, LocalActor, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(reqwest::Client::new());
        let directory = ActorDirectory::new(
            client.clone(),
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
        let webfinger = WebFingerResolver::new(client);

        let service = FederationService::new(
            store.clone(),
            directory,
            registry,
            dispatcher,
            webfinger,
            "blog.example.com".to_string(),
            BASE_URL.to_string(),
        );

        let local = LocalActor {
            id: EntityId::new().0,
            username: "alice".to_string(),
            display_name: Some("Alice".to_string()),
            note: None,
            private_key_pem: String::new(),
            public_key_pem: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.upsert_local_actor(&local).await.unwrap();

        (service, local, store)
    }

    #[tokio::test]
    async fn get_webfinger_answers_for_local_actor() {
        let (service, _local, _store) = service_with_local_actor().await;

        let descriptor = service
            .get_webfinger("acct:alice@blog.example.com")
            .await
            .unwrap();
        assert_eq!(descriptor.subject, "acct:alice@blog.example.com");
    }

    #[tokio::test]
    async fn get_webfinger_rejects_foreign_domain() {
        let (service, _local, _store) = service_with_local_actor().await;

        let result = service.get_webfinger("acct:alice@other.example").await;
        assert!(matches!(result, Err(AppError::NotFound)));
    }

    #[tokio::test]
    async fn get_webfinger_rejects_non_acct_resource() {
        let (service, _local, _store) = service_with_local_actor().await;

        let result = service
            .get_webfinger("https://blog.example.com/users/alice")
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn dispatch_requires_known_local_actor() {
        let (service, _local, _store) = service_with_local_actor().await;

        let activity = builder::create(
            "https://blog.example.com/create/1",
            "https://blog.example.com/users/alice",
            serde_json::json!({ "type": "Note" }),
            Vec::new(),
            Vec::new(),
        );

        let result = service.dispatch(&activity, "unknown-actor-id").await;
        assert!(matches!(result, Err(AppError::NotFound)));
    }
}
