//! WebFinger protocol implementation
//!
//! Used to discover actor URIs from `@user@host` handles, and to answer
//! discovery queries for local actors.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::directory::ResolutionError;

/// Result of resolving a handle.
///
/// `authoritative` is false when the discovery document could not be
/// fetched (or carried no usable link) and the actor id is a heuristic
/// guess. Callers that require certainty must not accept a guess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHandle {
    /// Canonical actor URI
    pub actor_id: String,
    /// True when resolved through the discovery document
    pub authoritative: bool,
}

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

/// Split a handle into (user, host).
///
/// Accepted forms: `user@host`, `@user@host`, `acct:user@host`.
pub fn parse_handle(handle: &str) -> Result<(String, String), ResolutionError> {
    let trimmed = handle
        .trim()
        .trim_start_matches("acct:")
        .trim_start_matches('@');

    let (user, host) = trimmed
        .split_once('@')
        .ok_or_else(|| ResolutionError::Parse(format!("not a user@host handle: {handle}")))?;

    if user.is_empty() || host.is_empty() || host.contains('@') {
        return Err(ResolutionError::Parse(format!(
            "not a user@host handle: {handle}"
        )));
    }

    Ok((user.to_string(), host.to_string()))
}

/// Pick the link pointing at the actor's canonical activity document.
pub fn select_actor_link(descriptor: &WebFingerResponse) -> Option<String> {
    let self_links: Vec<&WebFingerLink> = descriptor
        .links
        .iter()
        .filter(|link| link.rel == "self")
        .collect();

    // Prefer the activity-document representation over other self links.
    self_links
        .iter()
        .find(|link| {
            link.link_type
                .as_deref()
                .is_some_and(|t| t.contains("activity+json") || t.contains("ld+json"))
        })
        .or_else(|| self_links.first())
        .and_then(|link| link.href.clone())
}

/// Heuristic actor URI guess for when discovery is unavailable.
pub fn fallback_guess(scheme: &str, user: &str, host: &str) -> String {
    format!("{scheme}://{host}/users/{user}")
}

/// Resolves `@user@host` handles via `/.well-known/webfinger`.
#[derive(Clone)]
pub struct WebFingerResolver {
    http_client: Arc<reqwest::Client>,
    scheme: String,
}

impl WebFingerResolver {
    pub fn new(http_client: Arc<reqwest::Client>) -> Self {
        Self::with_scheme(http_client, "https")
    }

    /// Override the discovery scheme. Loopback test fixtures use "http".
    pub fn with_scheme(http_client: Arc<reqwest::Client>, scheme: &str) -> Self {
        Self {
            http_client,
            scheme: scheme.to_string(),
        }
    }

    /// Resolve a handle to an actor id.
    ///
    /// Fetches the JSON resource descriptor and extracts the `self`
    /// link's href. On fetch failure or a descriptor without a usable
    /// link, falls back to a heuristic guess marked non-authoritative.
    ///
    /// # Errors
    /// Only for handles that cannot be parsed; an unreachable host is a
    /// fallback, not an error.
    pub async fn resolve_handle(&self, handle: &str) -> Result<ResolvedHandle, ResolutionError> {
        let (user, host) = parse_handle(handle)?;

        match self.fetch_descriptor(&user, &host).await {
            Ok(descriptor) => {
                if let Some(actor_id) = select_actor_link(&descriptor) {
                    return Ok(ResolvedHandle {
                        actor_id,
                        authoritative: true,
                    });
                }
                tracing::debug!(%handle, "webfinger descriptor has no actor link, guessing");
            }
            Err(error) => {
                tracing::debug!(%handle, %error, "webfinger fetch failed, guessing");
            }
        }

        Ok(ResolvedHandle {
            actor_id: fallback_guess(&self.scheme, &user, &host),
            authoritative: false,
        })
    }

    async fn fetch_descriptor(
        &self,
        user: &str,
        host: &str,
    ) -> Result<WebFingerResponse, ResolutionError> {
        let resource = format!("acct:{user}@{host}");
        let url = format!(
            "{}://{}/.well-known/webfinger?resource={}",
            self.scheme,
            host,
            urlencoding::encode(&resource)
        );

        let response = self
            .http_client
            .get(&url)
            .header("Accept", "application/jrd+json")
            .send()
            .await
            .map_err(|e| ResolutionError::Fetch(format!("webfinger fetch failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ResolutionError::Fetch(format!(
                "webfinger fetch failed: HTTP {}",
                response.status()
            )));
        }

        response
            .json::<WebFingerResponse>()
            .await
            .map_err(|e| ResolutionError::Parse(format!("invalid webfinger descriptor: {e}")))
    }
}

/// Generate the JRD for a local actor.
///
/// # Arguments
/// * `username` - Local username
/// * `domain` - Instance domain
/// * `base_url` - Instance base URL (includes protocol)
pub fn local_descriptor(username: &str, domain: &str, base_url: &str) -> WebFingerResponse {
    let subject = format!("acct:{username}@{domain}");
    let actor_url = format!("{}/users/{}", base_url.trim_end_matches('/'), username);

    WebFingerResponse {
        subject,
        aliases: Some(vec![actor_url.clone()]),
        links: vec![
            WebFingerLink {
                rel: "self".to_string(),
                link_type: Some("application/activity+json".to_string()),
                href: Some(actor_url.clone()),
            },
            WebFingerLink {
                rel: "http://webfinger.net/rel/profile-page".to_string(),
                link_type: Some("text/html".to_string()),
                href: Some(actor_url),
            },
        ],
    }
}
