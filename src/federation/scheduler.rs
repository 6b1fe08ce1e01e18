//! Delivery scheduler
//!
//! Drains the persisted delivery queue on a background worker loop. Each
//! due job is signed, sent, and classified:
//!
//! - 2xx: the job succeeded; the outcome is recorded for audit and the
//!   recipients' failure counters reset.
//! - 4xx other than 429: permanent failure, never retried.
//! - 5xx, 429, or a network-level error: transient — the job is
//!   re-queued with exponential backoff and jitter, bounded by the
//!   configured attempt budget; exceeding it converts the job to
//!   `Exhausted`, recorded like a permanent failure.
//!
//! Per job there is at most one in-flight attempt at a time; nothing is
//! ordered across jobs. Cancellation is observed when the job is picked
//! up again, never by interrupting an attempt mid-request.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};

use super::registry::FollowRegistry;
use super::signature::{SignatureScheme, sign_request};
use crate::config::DeliveryConfig;
use crate::data::{DeliveryJob, FederationStore, JobState, JobStore, LocalActorStore};
use crate::error::AppError;

/// Delivery failure classification.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Remote rejected the delivery with a non-retryable status
    #[error("permanent failure: HTTP {0}")]
    Permanent(u16),

    /// Worth retrying: 5xx, 429, or a network-level error
    #[error("transient failure: {0}")]
    Transient(String),

    /// Retry budget exceeded
    #[error("retry budget exhausted")]
    Exhausted,
}

/// Classify one HTTP response status.
pub fn classify_status(status: reqwest::StatusCode) -> Result<(), DeliveryError> {
    if status.is_success() {
        return Ok(());
    }
    if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(DeliveryError::Permanent(status.as_u16()));
    }
    Err(DeliveryError::Transient(format!("HTTP {status}")))
}

/// Background delivery worker.
///
/// Cheap to clone; clones share the queue claims and the semaphore.
#[derive(Clone)]
pub struct DeliveryScheduler {
    store: Arc<dyn FederationStore>,
    registry: FollowRegistry,
    http_client: Arc<reqwest::Client>,
    scheme: SignatureScheme,
    base_url: String,
    config: DeliveryConfig,
    /// Jobs currently being attempted; guarantees at most one in-flight
    /// attempt per job
    in_flight: Arc<Mutex<HashSet<String>>>,
    semaphore: Arc<Semaphore>,
}

impl DeliveryScheduler {
    pub fn new(
        store: Arc<dyn FederationStore>,
        registry: FollowRegistry,
        http_client: Arc<reqwest::Client>,
        scheme: SignatureScheme,
        base_url: String,
        config: DeliveryConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            store,
            registry,
            http_client,
            scheme,
            base_url: base_url.trim_end_matches('/').to_string(),
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            semaphore,
        }
    }

    /// Spawn the worker loop.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        let poll_interval = Duration::from_secs(self.config.poll_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            // The first tick fires immediately; keep it, startup drains
            // anything left over from before a restart.
            loop {
                interval.tick().await;
                if let Err(error) = self.drain_due().await {
                    tracing::error!(%error, "delivery queue drain failed");
                }
            }
        })
    }

    /// Pick up due jobs and attempt them concurrently (bounded).
    /// Returns the number of jobs picked up.
    pub async fn drain_due(&self) -> Result<usize, AppError> {
        let due = self.store.due_jobs(Utc::now(), 100).await?;
        let mut picked = 0;

        for job in due {
            {
                let mut in_flight = self.in_flight.lock().await;
                // Still being attempted from an earlier drain.
                if !in_flight.insert(job.id.clone()) {
                    continue;
                }
            }
            picked += 1;

            let scheduler = self.clone();
            tokio::spawn(async move {
                let _permit = scheduler.semaphore.acquire().await;
                scheduler.attempt(job).await;
            });
        }

        Ok(picked)
    }

    /// Attempt one delivery and settle the job's next state.
    ///
    /// Public so tests can drive attempts deterministically.
    pub async fn attempt(&self, job: DeliveryJob) {
        let outcome = self.attempt_inner(&job).await;
        if let Err(error) = outcome {
            tracing::error!(job = %job.id, %error, "delivery attempt could not be settled");
        }

        self.in_flight.lock().await.remove(&job.id);

        if let Ok(depth) = self.store.count_pending_jobs().await {
            crate::metrics::DELIVERY_QUEUE_DEPTH.set(depth);
        }
    }

    async fn attempt_inner(&self, job: &DeliveryJob) -> Result<(), AppError> {
        // Cancellation (or any other terminal transition) must be
        // observed before attempting, not mid-request.
        let Some(current) = self.store.get_job(&job.id).await? else {
            return Ok(());
        };
        if current.job_state() != Some(JobState::Pending) {
            tracing::debug!(job = %job.id, state = %current.state, "skipping settled job");
            return Ok(());
        }

        let Some(local_actor) = self
            .store
            .get_local_actor_by_id(&current.local_actor_id)
            .await?
        else {
            return self
                .settle_failure(&current, JobState::Failed, "signing identity not found")
                .await;
        };

        match self.send(&current, &local_actor).await {
            Ok(()) => {
                self.store.mark_job(&current.id, JobState::Succeeded, None).await?;
                crate::metrics::DELIVERY_ATTEMPTS_TOTAL
                    .with_label_values(&["success"])
                    .inc();
                crate::metrics::DELIVERY_JOBS_TOTAL
                    .with_label_values(&["succeeded"])
                    .inc();

                for recipient in current.recipients() {
                    self.registry
                        .reset_delivery_failures(&current.local_actor_id, &recipient)
                        .await?;
                }

                tracing::info!(
                    job = %current.id,
                    inbox = %current.inbox_url,
                    "delivery succeeded"
                );
                Ok(())
            }
            Err(DeliveryError::Permanent(status)) => {
                let reason = format!("HTTP {status}");
                crate::metrics::DELIVERY_ATTEMPTS_TOTAL
                    .with_label_values(&["permanent"])
                    .inc();
                self.settle_failure(&current, JobState::Failed, &reason).await
            }
            Err(DeliveryError::Transient(reason)) => {
                crate::metrics::DELIVERY_ATTEMPTS_TOTAL
                    .with_label_values(&["transient"])
                    .inc();

                let attempt_count = current.attempt_count + 1;
                if attempt_count > i64::from(self.config.max_attempts) {
                    // One transient failure past the budget terminates the
                    // job; recorded the same as a permanent failure.
                    return self
                        .settle_failure(&current, JobState::Exhausted, &reason)
                        .await;
                }

                let delay = self.backoff_delay(attempt_count as u32);
                let next_attempt_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());

                self.store
                    .reschedule_job(&current.id, attempt_count, next_attempt_at, &reason)
                    .await?;

                tracing::warn!(
                    job = %current.id,
                    inbox = %current.inbox_url,
                    attempt = attempt_count,
                    delay_secs = delay.as_secs(),
                    %reason,
                    "transient delivery failure, re-queued"
                );
                Ok(())
            }
            Err(DeliveryError::Exhausted) => {
                // classify_status never yields this; kept for completeness.
                self.settle_failure(&current, JobState::Exhausted, "exhausted")
                    .await
            }
        }
    }

    /// Record a terminal failure and account it against the recipients
    /// behind the inbox (unreachable-subscriber cleanup input).
    async fn settle_failure(
        &self,
        job: &DeliveryJob,
        state: JobState,
        reason: &str,
    ) -> Result<(), AppError> {
        self.store.mark_job(&job.id, state, Some(reason)).await?;
        crate::metrics::DELIVERY_JOBS_TOTAL
            .with_label_values(&[state.as_str()])
            .inc();

        for recipient in job.recipients() {
            self.registry
                .record_delivery_failure(&job.local_actor_id, &recipient)
                .await?;
        }

        tracing::warn!(
            job = %job.id,
            inbox = %job.inbox_url,
            state = state.as_str(),
            %reason,
            "delivery failed terminally"
        );
        Ok(())
    }

    /// Sign and send one delivery, classifying the outcome.
    async fn send(
        &self,
        job: &DeliveryJob,
        local_actor: &crate::data::LocalActor,
    ) -> Result<(), DeliveryError> {
        let body = job.activity_json.as_bytes();
        let signed = sign_request(
            self.scheme,
            "POST",
            &job.inbox_url,
            Some(body),
            &local_actor.private_key_pem,
            &local_actor.key_id(&self.base_url),
        )
        .map_err(|e| DeliveryError::Transient(format!("signing failed: {e}")))?;

        let _timer = crate::metrics::FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["outbound"])
            .start_timer();

        let mut request = self
            .http_client
            .post(&job.inbox_url)
            .header("Content-Type", "application/activity+json")
            .timeout(Duration::from_secs(self.config.request_timeout_seconds.max(1)));
        for (name, value) in &signed.headers {
            request = request.header(*name, value);
        }

        let response = request
            .body(job.activity_json.clone())
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        crate::metrics::FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["outbound", status.as_str()])
            .inc();

        classify_status(status)
    }

    /// Exponential backoff with jitter: `base * 2^(attempt-1)`, capped,
    /// plus up to 25% random jitter so synchronized retries spread out.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_backoff_seconds.max(1);
        let cap = self.config.max_backoff_seconds.max(base);
        let exp = attempt.saturating_sub(1).min(16);
        let backoff = base.saturating_mul(1u64 << exp).min(cap);
        let jitter = rand::thread_rng().gen_range(0..=backoff / 4);
        Duration::from_secs(backoff + jitter)
    }
}
