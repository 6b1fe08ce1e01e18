//! Outbox dispatcher
//!
//! Computes the delivery recipient set for one locally-authored activity
//! and turns it into delivery jobs:
//!
//! 1. expand `to`/`cc` (followers-collection references become the
//!    current follower list; the public sentinel is not deliverable);
//! 2. resolve every recipient to an inbox URL, substituting the shared
//!    inbox when more than one recipient on the same server shares it —
//!    a resolution failure drops only that recipient;
//! 3. each unique inbox URL becomes exactly one delivery job.
//!
//! The returned receipt carries job ids, not outcomes; delivery itself is
//! asynchronous (see the scheduler).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use super::activity::{Activity, PUBLIC_AUDIENCE};
use super::directory::ActorDirectory;
use super::registry::FollowRegistry;
use crate::data::{
    ActorRecord, DeliveryJob, EntityId, FederationStore, JobState, JobStore, LocalActor,
};
use crate::error::AppError;

/// Receipt for a dispatched activity: the created jobs, not outcomes.
#[derive(Debug, Clone)]
pub struct DispatchReceipt {
    pub activity_id: String,
    pub job_ids: Vec<String>,
}

/// Fans one activity out into delivery jobs.
#[derive(Clone)]
pub struct OutboxDispatcher {
    store: Arc<dyn FederationStore>,
    directory: ActorDirectory,
    registry: FollowRegistry,
    base_url: String,
}

impl OutboxDispatcher {
    pub fn new(
        store: Arc<dyn FederationStore>,
        directory: ActorDirectory,
        registry: FollowRegistry,
        base_url: String,
    ) -> Self {
        Self {
            store,
            directory,
            registry,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Compute the recipient set and enqueue one job per unique inbox.
    pub async fn dispatch(
        &self,
        activity: &Activity,
        local: &LocalActor,
    ) -> Result<DispatchReceipt, AppError> {
        let recipient_ids = self.expand_recipients(activity, local).await?;
        let records = self.resolve_recipients(&recipient_ids).await;
        let targets = plan_inbox_targets(&records, &self.own_inboxes(local));

        let now = Utc::now();
        let activity_json = activity.to_document().to_string();

        let jobs: Vec<DeliveryJob> = targets
            .into_iter()
            .map(|(inbox_url, recipients)| DeliveryJob {
                id: EntityId::new().0,
                activity_id: activity.id.clone(),
                activity_json: activity_json.clone(),
                inbox_url,
                local_actor_id: local.id.clone(),
                recipient_ids: serde_json::to_string(&recipients).unwrap_or_else(|_| "[]".into()),
                attempt_count: 0,
                next_attempt_at: now,
                state: JobState::Pending.as_str().to_string(),
                last_error: None,
                created_at: now,
                updated_at: now,
            })
            .collect();

        self.store.enqueue_jobs(&jobs).await?;

        crate::metrics::ACTIVITIES_SENT_TOTAL
            .with_label_values(&[activity.kind.as_str()])
            .inc();
        if let Ok(depth) = self.store.count_pending_jobs().await {
            crate::metrics::DELIVERY_QUEUE_DEPTH.set(depth);
        }

        tracing::info!(
            activity = %activity.id,
            kind = %activity.kind,
            jobs = jobs.len(),
            "activity dispatched"
        );

        Ok(DispatchReceipt {
            activity_id: activity.id.clone(),
            job_ids: jobs.into_iter().map(|job| job.id).collect(),
        })
    }

    /// Cancel pending deliveries of an activity (e.g., it was retracted).
    /// Cancellation takes effect before the next attempt; an attempt
    /// already in flight is not interrupted.
    pub async fn cancel(&self, activity_id: &str) -> Result<u64, AppError> {
        let cancelled = self.store.cancel_jobs_for_activity(activity_id).await?;
        if cancelled > 0 {
            tracing::info!(activity = %activity_id, cancelled, "pending deliveries cancelled");
        }
        Ok(cancelled)
    }

    /// Raw recipient actor ids: explicit `to`/`cc` entries with the
    /// followers collection expanded and the public sentinel dropped.
    async fn expand_recipients(
        &self,
        activity: &Activity,
        local: &LocalActor,
    ) -> Result<Vec<String>, AppError> {
        let followers_uri = local.followers_uri(&self.base_url);
        let own_actor_uri = local.actor_uri(&self.base_url);

        let mut seen = std::collections::HashSet::new();
        let mut recipient_ids = Vec::new();
        let mut push = |id: String| {
            if seen.insert(id.clone()) {
                recipient_ids.push(id);
            }
        };

        for recipient in activity.recipients() {
            if recipient == PUBLIC_AUDIENCE {
                continue;
            }
            if recipient == own_actor_uri {
                continue;
            }
            if recipient == followers_uri {
                for follower_id in self.registry.all_follower_ids(&local.id).await? {
                    push(follower_id);
                }
            } else {
                push(recipient.to_string());
            }
        }

        Ok(recipient_ids)
    }

    /// Resolve recipient ids to actor records, concurrently. A failure
    /// removes only that recipient from the delivery set.
    async fn resolve_recipients(&self, recipient_ids: &[String]) -> Vec<ActorRecord> {
        let resolutions = futures::future::join_all(
            recipient_ids
                .iter()
                .map(|recipient_id| self.directory.resolve(recipient_id, false)),
        )
        .await;

        recipient_ids
            .iter()
            .zip(resolutions)
            .filter_map(|(recipient_id, resolution)| match resolution {
                Ok(record) => Some(record),
                Err(error) => {
                    tracing::warn!(
                        recipient = %recipient_id,
                        %error,
                        "dropping unresolvable recipient from delivery set"
                    );
                    None
                }
            })
            .collect()
    }

    fn own_inboxes(&self, local: &LocalActor) -> Vec<String> {
        vec![
            local.inbox_uri(&self.base_url),
            format!("{}/inbox", self.base_url),
        ]
    }
}

/// Map resolved recipients to their delivery inboxes.
///
/// The shared inbox substitutes the personal one only when more than one
/// recipient of this dispatch shares it; an inbox URL appears at most
/// once in the result regardless of how many actors map to it, and the
/// local server's own inboxes are never targeted.
fn plan_inbox_targets(
    records: &[ActorRecord],
    own_inboxes: &[String],
) -> Vec<(String, Vec<String>)> {
    let mut shared_counts: HashMap<&str, usize> = HashMap::new();
    for record in records {
        if let Some(shared) = record.shared_inbox.as_deref() {
            *shared_counts.entry(shared).or_default() += 1;
        }
    }

    let mut order: Vec<String> = Vec::new();
    let mut targets: HashMap<String, Vec<String>> = HashMap::new();

    for record in records {
        let inbox = match record.shared_inbox.as_deref() {
            Some(shared) if shared_counts[shared] > 1 => shared,
            _ => record.inbox.as_str(),
        };

        if own_inboxes.iter().any(|own| own == inbox) {
            continue;
        }

        match targets.entry(inbox.to_string()) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                entry.get_mut().push(record.id.clone());
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                order.push(inbox.to_string());
                entry.insert(vec![record.id.clone()]);
            }
        }
    }

    order
        .into_iter()
        .map(|inbox| {
            let recipients = targets.remove(&inbox).unwrap_or_default();
            (inbox, recipients)
        })
        .collect()
}
