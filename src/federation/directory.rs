//! Actor directory
//!
//! Maps an actor id (URI) to a canonical [`ActorRecord`]. Local ids
//! resolve straight from the host's actor store without touching the
//! network. Remote ids are fetched with content negotiation, validated,
//! and cached keyed by id:
//!
//! - a cache hit younger than the freshness TTL is returned as-is;
//! - an older entry is returned optimistically while a background refresh
//!   runs (readers never block on it);
//! - a forced refresh bypasses the cache entirely (used after a
//!   signature-verification key mismatch).
//!
//! Remote fetches are SSRF-guarded: non-HTTP(S) schemes, private and
//! loopback hosts, and hosts resolving to such addresses are rejected.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::data::{ActorRecord, FederationStore, LocalActorStore};

/// Actor or key resolution failure.
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// The actor does not exist (locally unknown, or remote 404/410)
    #[error("actor not found: {0}")]
    NotFound(String),

    /// Network-level or HTTP-level fetch failure
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// The document was fetched but is not a usable actor
    #[error("malformed actor document: {0}")]
    Parse(String),
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

/// Validate a remote actor URL and return its host.
///
/// Rejects non-HTTP(S) URLs and obvious local/private hosts.
pub fn validate_actor_url(actor_or_key_id: &str) -> Result<String, ResolutionError> {
    let actor_url = actor_or_key_id.split('#').next().unwrap_or(actor_or_key_id);
    let parsed = url::Url::parse(actor_url)
        .map_err(|e| ResolutionError::Parse(format!("invalid actor URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(ResolutionError::Parse(format!(
                "unsupported actor URL scheme: {scheme}"
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| ResolutionError::Parse("missing host in actor URL".to_string()))?
        .to_ascii_lowercase();

    if is_disallowed_host(&host) {
        return Err(ResolutionError::Fetch(format!(
            "refusing to fetch from disallowed host: {host}"
        )));
    }

    Ok(host)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), ResolutionError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| ResolutionError::Fetch(format!("failed to resolve actor host: {e}")))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(ResolutionError::Fetch(format!(
                "actor host resolves to disallowed address: {host}"
            )));
        }
    }

    if !resolved_any {
        return Err(ResolutionError::Fetch(format!(
            "no DNS records for actor host: {host}"
        )));
    }

    Ok(())
}

/// Parse a fetched document into an [`ActorRecord`].
///
/// Malformed documents (missing `id`, missing `inbox`, non-actor type)
/// are rejected and never cached. When the document advertises multiple
/// public keys, the entry whose id equals `expected_key_id` wins, else
/// the first usable entry.
pub fn parse_actor_document(
    document: &serde_json::Value,
    expected_key_id: Option<&str>,
) -> Result<ActorRecord, ResolutionError> {
    const ACTOR_TYPES: [&str; 5] = ["Person", "Service", "Application", "Group", "Organization"];

    let id = document
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ResolutionError::Parse("missing id".to_string()))?;

    let actor_type = document
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ResolutionError::Parse("missing type".to_string()))?;
    if !ACTOR_TYPES.iter().any(|t| t.eq_ignore_ascii_case(actor_type)) {
        return Err(ResolutionError::Parse(format!(
            "not an actor type: {actor_type}"
        )));
    }

    let inbox = document
        .get("inbox")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ResolutionError::Parse("missing inbox".to_string()))?;

    let shared_inbox = document
        .get("endpoints")
        .and_then(|endpoints| endpoints.get("sharedInbox"))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let (public_key_id, public_key_pem) = select_public_key(document, expected_key_id)?;

    let preferred_username = document
        .get("preferredUsername")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let display_name = document
        .get("name")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    Ok(ActorRecord {
        id: id.to_string(),
        preferred_username,
        display_name,
        inbox: inbox.to_string(),
        shared_inbox,
        public_key_id,
        public_key_pem,
    })
}

fn select_public_key(
    document: &serde_json::Value,
    expected_key_id: Option<&str>,
) -> Result<(String, String), ResolutionError> {
    let public_key = document
        .get("publicKey")
        .ok_or_else(|| ResolutionError::Parse("missing publicKey".to_string()))?;

    let entries: Vec<&serde_json::Value> = match public_key {
        serde_json::Value::Array(entries) => entries.iter().collect(),
        other => vec![other],
    };

    let key_fields = |entry: &serde_json::Value| -> Option<(String, String)> {
        let id = entry.get("id").and_then(|v| v.as_str())?;
        let pem = entry.get("publicKeyPem").and_then(|v| v.as_str())?;
        Some((id.to_string(), pem.to_string()))
    };

    if let Some(expected) = expected_key_id {
        for entry in &entries {
            if let Some((id, pem)) = key_fields(entry) {
                if id == expected {
                    return Ok((id, pem));
                }
            }
        }
    }

    entries
        .iter()
        .find_map(|entry| key_fields(entry))
        .ok_or_else(|| ResolutionError::Parse("no usable publicKey entry".to_string()))
}

struct CacheEntry {
    record: ActorRecord,
    fetched_at: Instant,
}

/// Directory of resolved actors.
///
/// Cheap to clone; clones share the cache.
#[derive(Clone)]
pub struct ActorDirectory {
    cache: Arc<RwLock<HashMap<String, CacheEntry>>>,
    /// Actor ids with a background refresh already running
    refreshing: Arc<Mutex<HashSet<String>>>,
    http_client: Arc<reqwest::Client>,
    local: Arc<dyn FederationStore>,
    base_url: String,
    ttl: Duration,
}

impl ActorDirectory {
    pub fn new(
        http_client: Arc<reqwest::Client>,
        local: Arc<dyn FederationStore>,
        base_url: String,
        ttl: Duration,
    ) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            refreshing: Arc::new(Mutex::new(HashSet::new())),
            http_client,
            local,
            base_url: base_url.trim_end_matches('/').to_string(),
            ttl,
        }
    }

    /// Resolve an actor id to its canonical record.
    ///
    /// # Arguments
    /// * `id` - Actor URI, local or remote
    /// * `force_refresh` - Bypass the cache entirely (remote ids only)
    pub async fn resolve(
        &self,
        id: &str,
        force_refresh: bool,
    ) -> Result<ActorRecord, ResolutionError> {
        if self.is_local_id(id) {
            return self.resolve_local(id).await;
        }

        if !force_refresh {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(id) {
                crate::metrics::CACHE_HITS_TOTAL
                    .with_label_values(&["actor_directory"])
                    .inc();
                if entry.fetched_at.elapsed() >= self.ttl {
                    // Stale entries are served optimistically; the refresh
                    // happens off the request path.
                    self.spawn_background_refresh(id.to_string());
                }
                return Ok(entry.record.clone());
            }
            crate::metrics::CACHE_MISSES_TOTAL
                .with_label_values(&["actor_directory"])
                .inc();
        }

        let record = self.fetch_remote_actor(id, None).await?;
        self.insert(record.clone()).await;
        Ok(record)
    }

    /// Resolve a signature keyId to a PEM public key.
    ///
    /// The owning actor is fetched (or read from cache); when the cached
    /// record advertises a different key than requested, one refetch with
    /// the requested key id is attempted before giving up.
    pub async fn resolve_key(
        &self,
        key_id: &str,
        force_refresh: bool,
    ) -> Result<String, ResolutionError> {
        let actor_url = key_id.split('#').next().unwrap_or(key_id);
        let mut record = self.resolve(actor_url, force_refresh).await?;

        if key_id.contains('#') && record.public_key_id != key_id {
            record = self.fetch_remote_actor(actor_url, Some(key_id)).await?;
            if record.public_key_id != key_id {
                return Err(ResolutionError::Parse(
                    "keyId does not match any advertised public key".to_string(),
                ));
            }
            self.insert(record.clone()).await;
        }

        Ok(record.public_key_pem)
    }

    /// Seed the cache with an already-resolved record.
    pub async fn insert(&self, record: ActorRecord) {
        let mut cache = self.cache.write().await;
        cache.insert(
            record.id.clone(),
            CacheEntry {
                record,
                fetched_at: Instant::now(),
            },
        );
        crate::metrics::CACHE_SIZE
            .with_label_values(&["actor_directory"])
            .set(cache.len() as i64);
    }

    /// Drop a cached record.
    pub async fn invalidate(&self, id: &str) {
        let mut cache = self.cache.write().await;
        cache.remove(id);
        tracing::debug!(actor = %id, "invalidated directory cache entry");
    }

    fn is_local_id(&self, id: &str) -> bool {
        id.starts_with(&self.base_url)
    }

    async fn resolve_local(&self, id: &str) -> Result<ActorRecord, ResolutionError> {
        let username = id
            .strip_prefix(&self.base_url)
            .and_then(|rest| rest.strip_prefix("/users/"))
            .map(|rest| rest.split(['/', '#']).next().unwrap_or(rest))
            .ok_or_else(|| ResolutionError::NotFound(id.to_string()))?;

        let actor = self
            .local
            .get_local_actor(username)
            .await
            .map_err(|e| ResolutionError::Fetch(e.to_string()))?
            .ok_or_else(|| ResolutionError::NotFound(id.to_string()))?;

        let actor_uri = actor.actor_uri(&self.base_url);
        Ok(ActorRecord {
            id: actor_uri.clone(),
            preferred_username: actor.username.clone(),
            display_name: actor.display_name.clone(),
            inbox: actor.inbox_uri(&self.base_url),
            shared_inbox: Some(format!("{}/inbox", self.base_url)),
            public_key_id: actor.key_id(&self.base_url),
            public_key_pem: actor.public_key_pem,
        })
    }

    async fn fetch_remote_actor(
        &self,
        actor_url: &str,
        expected_key_id: Option<&str>,
    ) -> Result<ActorRecord, ResolutionError> {
        let host = validate_actor_url(actor_url)?;
        let parsed = url::Url::parse(actor_url)
            .map_err(|e| ResolutionError::Parse(format!("invalid actor URL: {e}")))?;
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| ResolutionError::Parse("missing port in actor URL".to_string()))?;

        // Resolve DNS before fetching and reject local/private destinations.
        validate_resolved_host_ips(&host, port).await?;

        let response = self
            .http_client
            .get(actor_url)
            .header("Accept", "application/activity+json")
            .send()
            .await
            .map_err(|e| ResolutionError::Fetch(format!("failed to fetch actor: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Err(ResolutionError::NotFound(actor_url.to_string()));
        }
        if !status.is_success() {
            return Err(ResolutionError::Fetch(format!(
                "failed to fetch actor: HTTP {status}"
            )));
        }

        let document: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ResolutionError::Parse(format!("actor document is not JSON: {e}")))?;

        parse_actor_document(&document, expected_key_id)
    }

    fn spawn_background_refresh(&self, id: String) {
        let directory = self.clone();
        tokio::spawn(async move {
            {
                let mut refreshing = directory.refreshing.lock().await;
                // Another refresh for this actor is already on its way.
                if !refreshing.insert(id.clone()) {
                    return;
                }
            }

            match directory.fetch_remote_actor(&id, None).await {
                Ok(record) => {
                    directory.insert(record).await;
                    tracing::debug!(actor = %id, "refreshed stale actor record");
                }
                Err(error) => {
                    tracing::debug!(actor = %id, %error, "background actor refresh failed");
                }
            }

            directory.refreshing.lock().await.remove(&id);
        });
    }
}
