//! Activity envelopes and builders
//!
//! An [`Activity`] is the immutable unit handed to the dispatcher: once
//! dispatched, any subsequent change requires a new activity.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// The ActivityStreams public-audience sentinel collection.
pub const PUBLIC_AUDIENCE: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Activity envelope: id, type, authoring actor, object, addressing.
#[derive(Debug, Clone)]
pub struct Activity {
    /// Globally unique activity URI
    pub id: String,
    /// Activity type ("Create", "Follow", ...)
    pub kind: String,
    /// Authoring actor URI
    pub actor: String,
    pub object: Value,
    /// Primary recipients (actor URIs or collection URIs)
    pub to: Vec<String>,
    /// Secondary recipients
    pub cc: Vec<String>,
    pub published: DateTime<Utc>,
}

impl Activity {
    pub fn new(kind: &str, id: &str, actor: &str, object: Value) -> Self {
        Self {
            id: id.to_string(),
            kind: kind.to_string(),
            actor: actor.to_string(),
            object,
            to: Vec::new(),
            cc: Vec::new(),
            published: Utc::now(),
        }
    }

    /// Set the addressing fields.
    pub fn addressed(mut self, to: Vec<String>, cc: Vec<String>) -> Self {
        self.to = to;
        self.cc = cc;
        self
    }

    /// All addressed recipients, `to` before `cc`.
    pub fn recipients(&self) -> impl Iterator<Item = &str> {
        self.to.iter().chain(self.cc.iter()).map(String::as_str)
    }

    /// Serialize to the wire document, including the JSON-LD context.
    pub fn to_document(&self) -> Value {
        let mut document = serde_json::Map::new();
        document.insert(
            "@context".to_string(),
            serde_json::json!("https://www.w3.org/ns/activitystreams"),
        );
        document.insert("type".to_string(), serde_json::json!(self.kind));
        document.insert("id".to_string(), serde_json::json!(self.id));
        document.insert("actor".to_string(), serde_json::json!(self.actor));
        document.insert("object".to_string(), self.object.clone());
        if !self.to.is_empty() {
            document.insert("to".to_string(), serde_json::json!(self.to));
        }
        if !self.cc.is_empty() {
            document.insert("cc".to_string(), serde_json::json!(self.cc));
        }
        document.insert(
            "published".to_string(),
            serde_json::json!(self.published.to_rfc3339()),
        );
        Value::Object(document)
    }
}

/// Addressing for a post visibility level: (to, cc).
pub fn audience_for_visibility(actor_uri: &str, visibility: &str) -> (Vec<String>, Vec<String>) {
    let public_audience = PUBLIC_AUDIENCE.to_string();
    let followers_audience = format!("{actor_uri}/followers");

    match visibility {
        "public" => (vec![public_audience], vec![followers_audience]),
        "unlisted" => (vec![followers_audience], vec![public_audience]),
        "private" => (vec![followers_audience], Vec::new()),
        "direct" => (Vec::new(), Vec::new()),
        _ => (vec![public_audience], vec![followers_audience]),
    }
}

/// Build activity envelopes
pub mod builder {
    use super::Activity;
    use serde_json::Value;

    /// Build a Follow activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (follower)
    /// * `object` - Object URI (followee)
    pub fn follow(id: &str, actor: &str, object: &str) -> Activity {
        Activity::new("Follow", id, actor, serde_json::json!(object))
            .addressed(vec![object.to_string()], Vec::new())
    }

    /// Build an Accept activity wrapping an incoming Follow
    pub fn accept(id: &str, actor: &str, object: Value, follower: &str) -> Activity {
        Activity::new("Accept", id, actor, object)
            .addressed(vec![follower.to_string()], Vec::new())
    }

    /// Build a Reject activity wrapping an incoming Follow
    pub fn reject(id: &str, actor: &str, object: Value, follower: &str) -> Activity {
        Activity::new("Reject", id, actor, object)
            .addressed(vec![follower.to_string()], Vec::new())
    }

    /// Build a Create activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (creator)
    /// * `object` - Object being created (usually a Note/Article)
    /// * `to` / `cc` - Addressing
    pub fn create(
        id: &str,
        actor: &str,
        object: Value,
        to: Vec<String>,
        cc: Vec<String>,
    ) -> Activity {
        Activity::new("Create", id, actor, object).addressed(to, cc)
    }

    /// Build a Delete activity with a Tombstone object
    pub fn delete(
        id: &str,
        actor: &str,
        object_uri: &str,
        to: Vec<String>,
        cc: Vec<String>,
    ) -> Activity {
        Activity::new(
            "Delete",
            id,
            actor,
            serde_json::json!({
                "type": "Tombstone",
                "id": object_uri
            }),
        )
        .addressed(to, cc)
    }

    /// Build a Like activity
    pub fn like(id: &str, actor: &str, object_uri: &str, object_author: &str) -> Activity {
        Activity::new("Like", id, actor, serde_json::json!(object_uri))
            .addressed(vec![object_author.to_string()], Vec::new())
    }

    /// Build an Announce activity (boost)
    pub fn announce(
        id: &str,
        actor: &str,
        object_uri: &str,
        to: Vec<String>,
        cc: Vec<String>,
    ) -> Activity {
        Activity::new("Announce", id, actor, serde_json::json!(object_uri)).addressed(to, cc)
    }

    /// Build an Undo activity wrapping a previous activity of ours
    pub fn undo(id: &str, actor: &str, object: Value, to: Vec<String>) -> Activity {
        Activity::new("Undo", id, actor, object).addressed(to, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_document_includes_context_and_addressing() {
        let activity = builder::create(
            "https://blog.example.com/create/1",
            "https://blog.example.com/users/alice",
            serde_json::json!({ "type": "Note", "content": "hi" }),
            vec![PUBLIC_AUDIENCE.to_string()],
            vec!["https://blog.example.com/users/alice/followers".to_string()],
        );

        let document = activity.to_document();
        assert_eq!(document["@context"], "https://www.w3.org/ns/activitystreams");
        assert_eq!(document["type"], "Create");
        assert_eq!(document["to"][0], PUBLIC_AUDIENCE);
        assert_eq!(
            document["cc"][0],
            "https://blog.example.com/users/alice/followers"
        );
    }

    #[test]
    fn recipients_chains_to_and_cc() {
        let activity = Activity::new(
            "Create",
            "https://blog.example.com/create/1",
            "https://blog.example.com/users/alice",
            serde_json::json!({}),
        )
        .addressed(
            vec!["a".to_string(), "b".to_string()],
            vec!["c".to_string()],
        );

        let recipients: Vec<&str> = activity.recipients().collect();
        assert_eq!(recipients, vec!["a", "b", "c"]);
    }

    #[test]
    fn audience_for_visibility_public_targets_public_then_followers() {
        let (to, cc) = audience_for_visibility("https://example.com/users/alice", "public");
        assert_eq!(to, vec![PUBLIC_AUDIENCE.to_string()]);
        assert_eq!(cc, vec!["https://example.com/users/alice/followers".to_string()]);
    }

    #[test]
    fn audience_for_visibility_private_targets_only_followers() {
        let (to, cc) = audience_for_visibility("https://example.com/users/alice", "private");
        assert_eq!(to, vec!["https://example.com/users/alice/followers".to_string()]);
        assert!(cc.is_empty());
    }

    #[test]
    fn follow_builder_addresses_the_followee() {
        let activity = builder::follow(
            "https://blog.example.com/follow/1",
            "https://blog.example.com/users/alice",
            "https://remote.example/users/bob",
        );
        assert_eq!(activity.kind, "Follow");
        assert_eq!(activity.to, vec!["https://remote.example/users/bob".to_string()]);
    }
}
