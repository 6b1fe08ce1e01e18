//! HTTP message signatures for federation
//!
//! Two wire standards share one capability surface (sign, verify, digest):
//!
//! - [`draft`]: the legacy draft-cavage form — one `Signature` header,
//!   signing string built from `(request-target)`/`host`/`date`/`digest`.
//! - [`rfc9421`]: the structured-fields form — `Signature-Input` +
//!   `Signature` headers, signature base built from derived components.
//!
//! Outgoing requests use the scheme from configuration; incoming requests
//! are dispatched on which headers are present. Verification is stateless:
//! it consults nothing beyond the resolved public key.

pub mod draft;
pub mod rfc9421;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use http::HeaderMap;
use thiserror::Error;

use super::directory::ActorDirectory;
use crate::config::SignatureSchemeConfig;

/// Verification failure reasons.
///
/// Every failure is reported as a typed error so the inbound handler can
/// give a definitive accept/reject and log the reason; none of these is
/// allowed to escape as a panic.
#[derive(Debug, Error)]
pub enum SignatureError {
    /// No signature header, or a signed component the standard requires
    /// is absent from the request
    #[error("missing header: {0}")]
    MissingHeader(&'static str),

    /// Signature header present but not parseable
    #[error("unparseable signature: {0}")]
    Unparseable(String),

    /// Algorithm is not one we sign or verify with
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// keyId could not be resolved to a public key
    #[error("key resolution failed: {0}")]
    KeyResolution(String),

    /// Body digest does not match the digest header. Always fatal, even
    /// when the cryptographic signature itself validates.
    #[error("digest mismatch")]
    DigestMismatch,

    /// date/created outside the acceptance window, or expires passed
    #[error("signature expired or outside clock-skew window")]
    Expired,

    /// Cryptographic verification failed against the resolved key
    #[error("signature does not verify")]
    CryptoMismatch,
}

/// The two supported signature standards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    /// Legacy draft-cavage single-header signatures
    Draft,
    /// Structured-fields signatures (RFC 9421 shape)
    Rfc9421,
}

impl SignatureScheme {
    /// Pick the standard an incoming request used, from which headers
    /// are present.
    pub fn detect(headers: &HeaderMap) -> Result<Self, SignatureError> {
        if headers.contains_key("signature-input") {
            Ok(Self::Rfc9421)
        } else if headers.contains_key("signature") {
            Ok(Self::Draft)
        } else {
            Err(SignatureError::MissingHeader("signature"))
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Rfc9421 => "rfc9421",
        }
    }
}

impl From<SignatureSchemeConfig> for SignatureScheme {
    fn from(value: SignatureSchemeConfig) -> Self {
        match value {
            SignatureSchemeConfig::Draft => Self::Draft,
            SignatureSchemeConfig::Rfc9421 => Self::Rfc9421,
        }
    }
}

/// Headers to set on an outgoing signed request.
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    /// Header name/value pairs, ready to apply to the request builder
    pub headers: Vec<(&'static str, String)>,
}

/// Identity established by a successful verification.
#[derive(Debug, Clone)]
pub struct VerifiedIdentity {
    /// Key id the signature named
    pub key_id: String,
    /// Actor URI owning the key (key id with its fragment stripped)
    pub actor_id: String,
    /// Standard the signer used
    pub scheme: SignatureScheme,
}

/// Sign an outgoing request with the chosen standard.
///
/// # Arguments
/// * `scheme` - Which signature standard to emit
/// * `method` - HTTP method (e.g., "POST")
/// * `url` - Full URL being requested
/// * `body` - Request body (for the digest header)
/// * `private_key_pem` - RSA private key in PEM format
/// * `key_id` - Full URL to the public key (actor#main-key)
pub fn sign_request(
    scheme: SignatureScheme,
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
) -> Result<SignedHeaders, SignatureError> {
    sign_request_at(scheme, method, url, body, private_key_pem, key_id, Utc::now())
}

/// Sign with an explicit timestamp. Exposed for tests that need to place
/// a signature outside the acceptance window.
pub fn sign_request_at(
    scheme: SignatureScheme,
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
    now: DateTime<Utc>,
) -> Result<SignedHeaders, SignatureError> {
    match scheme {
        SignatureScheme::Draft => draft::sign(method, url, body, private_key_pem, key_id, now),
        SignatureScheme::Rfc9421 => rfc9421::sign(method, url, body, private_key_pem, key_id, now),
    }
}

/// Extract the signature's keyId (or structured-fields `keyid`) without
/// any cryptographic work. Used to cheaply reject keyId/actor mismatches
/// before fetching remote key material.
pub fn extract_key_id(headers: &HeaderMap) -> Result<String, SignatureError> {
    match SignatureScheme::detect(headers)? {
        SignatureScheme::Draft => Ok(draft::parse_signature_header(header_str(
            headers,
            "signature",
        )?)?
        .key_id),
        SignatureScheme::Rfc9421 => Ok(rfc9421::parse_signature_input(header_str(
            headers,
            "signature-input",
        )?)?
        .key_id),
    }
}

/// Validate that a keyId points to the same actor as an activity's actor.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    let key_actor = key_id.split('#').next().unwrap_or(key_id);
    let actor = actor_id.split('#').next().unwrap_or(actor_id);
    key_actor == actor
}

/// Acceptance window for date/created timestamps.
#[derive(Debug, Clone, Copy)]
pub struct SkewWindow {
    /// Reject signatures older than this
    pub max_age: Duration,
    /// Tolerated clock skew into the future
    pub max_future: Duration,
}

impl SkewWindow {
    /// Check a signature timestamp against the window.
    pub fn check(&self, signed_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), SignatureError> {
        let age = now.signed_duration_since(signed_at);
        if age > chrono::Duration::from_std(self.max_age).unwrap_or(chrono::Duration::MAX) {
            return Err(SignatureError::Expired);
        }
        if age < -chrono::Duration::from_std(self.max_future).unwrap_or(chrono::Duration::MAX) {
            return Err(SignatureError::Expired);
        }
        Ok(())
    }
}

/// Verifies incoming requests, resolving keys through the actor directory.
///
/// Stateless with respect to the request: the only side effect is the
/// directory's cache. A cryptographic mismatch against a cached key
/// triggers exactly one forced refetch of the key before the request is
/// rejected, covering key rotation by the remote actor.
pub struct SignatureVerifier {
    directory: Arc<ActorDirectory>,
    window: SkewWindow,
}

impl SignatureVerifier {
    pub fn new(directory: Arc<ActorDirectory>, window: SkewWindow) -> Self {
        Self { directory, window }
    }

    /// Verify an incoming request.
    ///
    /// # Arguments
    /// * `method` - HTTP method of the received request
    /// * `path_and_query` - Request target as received (path + query)
    /// * `headers` - All request headers
    /// * `body` - Request body, if any
    ///
    /// # Errors
    /// A [`SignatureError`] naming the first check that failed.
    pub async fn verify(
        &self,
        method: &str,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Option<&[u8]>,
    ) -> Result<VerifiedIdentity, SignatureError> {
        let scheme = SignatureScheme::detect(headers)?;
        let key_id = extract_key_id(headers)?;

        let public_key_pem = self
            .directory
            .resolve_key(&key_id, false)
            .await
            .map_err(|e| SignatureError::KeyResolution(e.to_string()))?;

        let outcome = self.verify_with_key(
            scheme,
            method,
            path_and_query,
            headers,
            body,
            &public_key_pem,
        );

        let outcome = match outcome {
            // The cached key may be rotated; refetch once before rejecting.
            Err(SignatureError::CryptoMismatch) => {
                let refreshed = self
                    .directory
                    .resolve_key(&key_id, true)
                    .await
                    .map_err(|e| SignatureError::KeyResolution(e.to_string()))?;
                self.verify_with_key(scheme, method, path_and_query, headers, body, &refreshed)
            }
            other => other,
        };

        let result_label = if outcome.is_ok() { "accepted" } else { "rejected" };
        crate::metrics::SIGNATURE_VERIFICATIONS_TOTAL
            .with_label_values(&[scheme.as_str(), result_label])
            .inc();

        outcome?;

        let actor_id = key_id
            .split('#')
            .next()
            .unwrap_or(key_id.as_str())
            .to_string();

        Ok(VerifiedIdentity {
            key_id,
            actor_id,
            scheme,
        })
    }

    fn verify_with_key(
        &self,
        scheme: SignatureScheme,
        method: &str,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Option<&[u8]>,
        public_key_pem: &str,
    ) -> Result<(), SignatureError> {
        match scheme {
            SignatureScheme::Draft => draft::verify(
                method,
                path_and_query,
                headers,
                body,
                public_key_pem,
                self.window,
                Utc::now(),
            ),
            SignatureScheme::Rfc9421 => rfc9421::verify(
                method,
                path_and_query,
                headers,
                body,
                public_key_pem,
                self.window,
                Utc::now(),
            ),
        }
    }
}

pub(crate) fn header_str<'a>(
    headers: &'a HeaderMap,
    name: &'static str,
) -> Result<&'a str, SignatureError> {
    headers
        .get(name)
        .ok_or(SignatureError::MissingHeader(name))?
        .to_str()
        .map_err(|_| SignatureError::Unparseable(format!("{name} header is not valid ASCII")))
}


#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn detect_prefers_structured_fields_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("signature", HeaderValue::from_static("sig1=:Zm9v:"));
        headers.insert(
            "signature-input",
            HeaderValue::from_static("sig1=(\"@method\");created=1"),
        );
        assert_eq!(
            SignatureScheme::detect(&headers).unwrap(),
            SignatureScheme::Rfc9421
        );
    }

    #[test]
    fn detect_falls_back_to_draft() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "signature",
            HeaderValue::from_static("keyId=\"k\",algorithm=\"rsa-sha256\",headers=\"date\",signature=\"Zm9v\""),
        );
        assert_eq!(
            SignatureScheme::detect(&headers).unwrap(),
            SignatureScheme::Draft
        );
    }

    #[test]
    fn detect_rejects_unsigned_requests() {
        let headers = HeaderMap::new();
        assert!(matches!(
            SignatureScheme::detect(&headers),
            Err(SignatureError::MissingHeader("signature"))
        ));
    }

    #[test]
    fn key_id_matches_actor_ignores_fragment() {
        assert!(key_id_matches_actor(
            "https://remote.example/users/alice#main-key",
            "https://remote.example/users/alice",
        ));
        assert!(!key_id_matches_actor(
            "https://remote.example/users/bob#main-key",
            "https://remote.example/users/alice",
        ));
    }

    #[test]
    fn skew_window_rejects_old_and_future_timestamps() {
        let window = SkewWindow {
            max_age: Duration::from_secs(3600),
            max_future: Duration::from_secs(300),
        };
        let now = Utc::now();

        assert!(window.check(now, now).is_ok());
        assert!(window
            .check(now - chrono::Duration::seconds(3599), now)
            .is_ok());
        assert!(matches!(
            window.check(now - chrono::Duration::seconds(3601), now),
            Err(SignatureError::Expired)
        ));
        assert!(matches!(
            window.check(now + chrono::Duration::seconds(301), now),
            Err(SignatureError::Expired)
        ));
    }
}
