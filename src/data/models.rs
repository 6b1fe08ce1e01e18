//! Data models
//!
//! Rust structs representing persisted entities and resolved actor records.
//! All models use ULID for IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Create from existing string
    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Local actors
// =============================================================================

/// A publishing identity owned by the host platform.
///
/// Canonical URIs (actor id, inbox, collections, key id) are derived from
/// the instance base URL and the username and never change once assigned.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LocalActor {
    pub id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub note: Option<String>,
    /// RSA private key (PEM format)
    pub private_key_pem: String,
    /// RSA public key (PEM format)
    pub public_key_pem: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LocalActor {
    /// Canonical actor URI for this instance
    pub fn actor_uri(&self, base_url: &str) -> String {
        format!("{}/users/{}", base_url.trim_end_matches('/'), self.username)
    }

    /// Key id advertised in the actor document
    pub fn key_id(&self, base_url: &str) -> String {
        format!("{}#main-key", self.actor_uri(base_url))
    }

    /// Personal inbox URI
    pub fn inbox_uri(&self, base_url: &str) -> String {
        format!("{}/inbox", self.actor_uri(base_url))
    }

    /// Followers collection URI
    pub fn followers_uri(&self, base_url: &str) -> String {
        format!("{}/followers", self.actor_uri(base_url))
    }
}

// =============================================================================
// Resolved actor records
// =============================================================================

/// Canonical resolved actor shape used by the directory.
///
/// Covers both local actors (derived, no network) and remote actors
/// (fetched and cached copies of their published documents).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorRecord {
    /// Canonical actor URI, immutable
    pub id: String,
    pub preferred_username: String,
    pub display_name: Option<String>,
    /// Personal inbox URL
    pub inbox: String,
    /// Server-wide shared inbox URL, if advertised
    pub shared_inbox: Option<String>,
    pub public_key_id: String,
    pub public_key_pem: String,
}

impl ActorRecord {
    /// Inbox to prefer for batched delivery: shared when advertised.
    pub fn delivery_inbox(&self) -> &str {
        self.shared_inbox.as_deref().unwrap_or(&self.inbox)
    }
}

// =============================================================================
// Follow relationships
// =============================================================================

/// A remote actor following a local actor.
///
/// Unique per (local_actor_id, remote_actor_id). `delivery_failures`
/// counts consecutive permanent delivery failures for unreachable-
/// subscriber cleanup; it is reset on any successful delivery.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FollowerRelation {
    pub id: String,
    pub local_actor_id: String,
    /// Remote actor URI
    pub remote_actor_id: String,
    /// URI of the Follow activity that created this relation
    pub follow_activity_uri: Option<String>,
    pub delivery_failures: i64,
    pub created_at: DateTime<Utc>,
}

/// State of a locally-initiated follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FollowState {
    /// Outgoing Follow sent, no Accept received yet
    Pending,
    /// Accept received from the remote actor
    Accepted,
}

impl FollowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            _ => None,
        }
    }
}

/// A remote actor a local actor follows.
///
/// Starts `pending` when the outgoing Follow is emitted, becomes
/// `accepted` only when the matching Accept arrives.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FollowingRelation {
    pub id: String,
    pub local_actor_id: String,
    /// Remote actor URI
    pub remote_actor_id: String,
    /// URI of our outgoing Follow activity
    pub follow_activity_uri: String,
    pub state: String,
    pub created_at: DateTime<Utc>,
}

impl FollowingRelation {
    pub fn follow_state(&self) -> Option<FollowState> {
        FollowState::parse(&self.state)
    }
}

// =============================================================================
// Delivery jobs
// =============================================================================

/// State of a delivery job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting for its next attempt
    Pending,
    /// Delivered, remote answered 2xx
    Succeeded,
    /// Remote answered a non-retryable 4xx
    Failed,
    /// Retry budget exceeded
    Exhausted,
    /// Cancelled before a terminal outcome
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Exhausted => "exhausted",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "exhausted" => Some(Self::Exhausted),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal states are never attempted again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One outstanding attempt-tracked unit of work: deliver one activity to
/// one inbox URL.
///
/// The serialized activity travels with the job so retries survive a
/// process restart. `attempt_count` is monotonically non-decreasing and
/// bounded by the configured maximum.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryJob {
    pub id: String,
    pub activity_id: String,
    /// Serialized activity document (request body)
    pub activity_json: String,
    pub inbox_url: String,
    /// Signing identity for this delivery
    pub local_actor_id: String,
    /// JSON array of remote actor URIs reached through this inbox,
    /// kept for per-subscriber failure accounting
    pub recipient_ids: String,
    pub attempt_count: i64,
    pub next_attempt_at: DateTime<Utc>,
    pub state: String,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryJob {
    pub fn job_state(&self) -> Option<JobState> {
        JobState::parse(&self.state)
    }

    /// Remote actor URIs reached through this job's inbox.
    pub fn recipients(&self) -> Vec<String> {
        serde_json::from_str(&self.recipient_ids).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_id_is_26_chars() {
        let id = EntityId::new();
        assert_eq!(id.0.len(), 26);
    }

    #[test]
    fn delivery_inbox_prefers_shared_inbox() {
        let record = ActorRecord {
            id: "https://remote.example/users/alice".to_string(),
            preferred_username: "alice".to_string(),
            display_name: None,
            inbox: "https://remote.example/users/alice/inbox".to_string(),
            shared_inbox: Some("https://remote.example/inbox".to_string()),
            public_key_id: "https://remote.example/users/alice#main-key".to_string(),
            public_key_pem: String::new(),
        };
        assert_eq!(record.delivery_inbox(), "https://remote.example/inbox");
    }

    #[test]
    fn job_state_round_trips_through_strings() {
        for state in [
            JobState::Pending,
            JobState::Succeeded,
            JobState::Failed,
            JobState::Exhausted,
            JobState::Cancelled,
        ] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert_eq!(JobState::parse("bogus"), None);
    }

    #[test]
    fn local_actor_uris_derive_from_base_url() {
        let actor = LocalActor {
            id: EntityId::new().0,
            username: "alice".to_string(),
            display_name: None,
            note: None,
            private_key_pem: String::new(),
            public_key_pem: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(
            actor.actor_uri("https://blog.example.com/"),
            "https://blog.example.com/users/alice"
        );
        assert_eq!(
            actor.key_id("https://blog.example.com"),
            "https://blog.example.com/users/alice#main-key"
        );
        assert_eq!(
            actor.followers_uri("https://blog.example.com"),
            "https://blog.example.com/users/alice/followers"
        );
    }
}
