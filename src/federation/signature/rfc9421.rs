//! Structured-fields HTTP message signatures (RFC 9421 shape)
//!
//! The signature base is derived from an explicit component list and
//! travels across two headers keyed by a label:
//!
//! ```text
//! Signature-Input: sig1=("@method" "@authority" "@path" "content-digest");created=1618884473;expires=1618884773;keyid="...";alg="rsa-v1_5-sha256"
//! Signature: sig1=:K2qG...:
//! ```
//!
//! The body digest uses the `Content-Digest` header with the
//! `sha-256=:<base64>:` byte-sequence serialization.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, TimeZone, Utc};
use http::HeaderMap;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use sha2::{Digest, Sha256};

use super::{SignatureError, SignedHeaders, SkewWindow, header_str};

/// Label used for our outgoing signatures.
const SIGNATURE_LABEL: &str = "sig1";

/// Validity we claim on outgoing signatures via the `expires` parameter.
const SIGNATURE_LIFETIME_SECS: i64 = 300;

/// The only algorithm we emit or accept.
const ALGORITHM: &str = "rsa-v1_5-sha256";

/// Parsed `Signature-Input` entry.
#[derive(Debug, Clone)]
pub struct ParsedSignatureInput {
    /// Signature label (e.g., "sig1")
    pub label: String,
    /// Covered component identifiers, in claimed order
    pub components: Vec<String>,
    /// Raw parameter serialization after `label=`, reused verbatim as the
    /// `"@signature-params"` base line so reserialization can't diverge
    pub raw_params: String,
    pub created: Option<i64>,
    pub expires: Option<i64>,
    pub key_id: String,
    pub algorithm: Option<String>,
}

/// Generate the `Content-Digest` header value: `sha-256=:<base64>:`
pub fn generate_digest(body: &[u8]) -> String {
    let hash = Sha256::digest(body);
    format!("sha-256=:{}:", BASE64.encode(hash))
}

/// Parse the first entry of a `Signature-Input` header.
pub fn parse_signature_input(header: &str) -> Result<ParsedSignatureInput, SignatureError> {
    let unparseable = |msg: &str| SignatureError::Unparseable(msg.to_string());

    let (label, rest) = header
        .split_once('=')
        .ok_or_else(|| unparseable("Signature-Input has no label"))?;
    let label = label.trim().to_string();
    let raw_params = rest.trim().to_string();

    // Inner list of covered components: ("@method" "@path" ...)
    if !raw_params.starts_with('(') {
        return Err(unparseable("Signature-Input component list must start with '('"));
    }
    let close = raw_params
        .find(')')
        .ok_or_else(|| unparseable("Signature-Input component list is unterminated"))?;
    let inner = &raw_params[1..close];

    let components: Vec<String> = inner
        .split_whitespace()
        .map(|item| item.trim_matches('"').to_ascii_lowercase())
        .filter(|item| !item.is_empty())
        .collect();

    let mut created = None;
    let mut expires = None;
    let mut key_id = None;
    let mut algorithm = None;

    for param in raw_params[close + 1..].split(';') {
        let param = param.trim();
        if param.is_empty() {
            continue;
        }
        let Some((name, value)) = param.split_once('=') else {
            return Err(unparseable("Signature-Input parameter has no value"));
        };
        let name = name.trim();
        let value = value.trim();

        match name {
            "created" => {
                created = Some(
                    value
                        .parse::<i64>()
                        .map_err(|_| unparseable("created is not an integer"))?,
                )
            }
            "expires" => {
                expires = Some(
                    value
                        .parse::<i64>()
                        .map_err(|_| unparseable("expires is not an integer"))?,
                )
            }
            "keyid" => key_id = Some(value.trim_matches('"').to_string()),
            "alg" => algorithm = Some(value.trim_matches('"').to_string()),
            _ => {} // Ignore unknown parameters
        }
    }

    Ok(ParsedSignatureInput {
        label,
        components,
        raw_params,
        created,
        expires,
        key_id: key_id.ok_or_else(|| unparseable("Signature-Input missing keyid"))?,
        algorithm,
    })
}

/// Parse a `Signature` header and return the bytes for the given label.
pub fn parse_signature(header: &str, label: &str) -> Result<Vec<u8>, SignatureError> {
    for entry in header.split(',') {
        let entry = entry.trim();
        let Some((entry_label, value)) = entry.split_once('=') else {
            continue;
        };
        if entry_label.trim() != label {
            continue;
        }
        let value = value.trim();
        let encoded = value
            .strip_prefix(':')
            .and_then(|v| v.strip_suffix(':'))
            .ok_or_else(|| {
                SignatureError::Unparseable("Signature value is not a byte sequence".to_string())
            })?;
        return BASE64
            .decode(encoded)
            .map_err(|_| SignatureError::Unparseable("invalid signature encoding".to_string()));
    }

    Err(SignatureError::Unparseable(format!(
        "Signature header has no entry for label {label}"
    )))
}

fn serialize_params(
    components: &[&str],
    created: i64,
    expires: i64,
    key_id: &str,
) -> String {
    let list = components
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(" ");
    format!("({list});created={created};expires={expires};keyid=\"{key_id}\";alg=\"{ALGORITHM}\"")
}

/// Sign an outgoing request.
///
/// # Returns
/// `Signature-Input`, `Signature` and (for bodies) `Content-Digest`
/// header values.
pub fn sign(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
    now: DateTime<Utc>,
) -> Result<SignedHeaders, SignatureError> {
    let parsed_url = url::Url::parse(url)
        .map_err(|e| SignatureError::Unparseable(format!("invalid URL: {e}")))?;

    let host = parsed_url
        .host_str()
        .ok_or_else(|| SignatureError::Unparseable("missing host in URL".to_string()))?;
    let authority = match parsed_url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let digest = body.map(generate_digest);

    let mut components = vec!["@method", "@authority", "@path"];
    if digest.is_some() {
        components.push("content-digest");
    }

    let created = now.timestamp();
    let expires = created + SIGNATURE_LIFETIME_SECS;
    let params = serialize_params(&components, created, expires, key_id);

    let mut base_lines = vec![
        format!("\"@method\": {}", method.to_ascii_uppercase()),
        format!("\"@authority\": {authority}"),
        format!("\"@path\": {}", parsed_url.path()),
    ];
    if let Some(ref digest_value) = digest {
        base_lines.push(format!("\"content-digest\": {digest_value}"));
    }
    base_lines.push(format!("\"@signature-params\": {params}"));
    let signature_base = base_lines.join("\n");

    let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| SignatureError::Unparseable(format!("invalid private key: {e}")))?;
    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(private_key);
    let signature = signing_key.sign(signature_base.as_bytes());
    let signature_b64 = BASE64.encode(signature.to_bytes());

    let mut headers = vec![
        ("signature-input", format!("{SIGNATURE_LABEL}={params}")),
        ("signature", format!("{SIGNATURE_LABEL}=:{signature_b64}:")),
    ];
    if let Some(digest_value) = digest {
        headers.push(("content-digest", digest_value));
    }

    Ok(SignedHeaders { headers })
}

/// Verify an incoming request's structured-fields signature.
///
/// Reconstructs the signature base from the *received* request using the
/// component list the signer claims, then checks the created/expires
/// window, the body digest, and the cryptographic signature.
pub fn verify(
    method: &str,
    path_and_query: &str,
    headers: &HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
    window: SkewWindow,
    now: DateTime<Utc>,
) -> Result<(), SignatureError> {
    let input = parse_signature_input(header_str(headers, "signature-input")?)?;
    let signature_bytes = parse_signature(header_str(headers, "signature")?, &input.label)?;

    if let Some(ref algorithm) = input.algorithm {
        if algorithm != ALGORITHM {
            return Err(SignatureError::UnsupportedAlgorithm(algorithm.clone()));
        }
    }

    // created is mandatory; expires must not have passed.
    let created = input
        .created
        .ok_or_else(|| SignatureError::Unparseable("signature missing created".to_string()))?;
    let created_at = Utc
        .timestamp_opt(created, 0)
        .single()
        .ok_or_else(|| SignatureError::Unparseable("created is out of range".to_string()))?;
    window.check(created_at, now)?;

    if let Some(expires) = input.expires {
        if expires < now.timestamp() {
            return Err(SignatureError::Expired);
        }
    }

    if body.is_some() && !input.components.iter().any(|c| c == "content-digest") {
        return Err(SignatureError::MissingHeader("content-digest"));
    }

    // Body digest mismatch is fatal regardless of the signature itself.
    if let Some(body_data) = body {
        let digest_str = header_str(headers, "content-digest")?;
        if digest_str != generate_digest(body_data) {
            return Err(SignatureError::DigestMismatch);
        }
    }

    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };

    // Reconstruct the signature base from the received request.
    let mut base_lines = Vec::with_capacity(input.components.len() + 1);
    for component in &input.components {
        let value = match component.as_str() {
            "@method" => method.to_ascii_uppercase(),
            "@authority" => header_str(headers, "host")?.to_ascii_lowercase(),
            "@path" => path.to_string(),
            "@query" => format!("?{}", query.unwrap_or_default()),
            derived if derived.starts_with('@') => {
                return Err(SignatureError::Unparseable(format!(
                    "unsupported derived component: {derived}"
                )));
            }
            header_name => headers
                .get(header_name)
                .ok_or(SignatureError::MissingHeader("signed header absent"))?
                .to_str()
                .map_err(|_| {
                    SignatureError::Unparseable(format!("{header_name} header is not valid ASCII"))
                })?
                .trim()
                .to_string(),
        };
        base_lines.push(format!("\"{component}\": {value}"));
    }
    base_lines.push(format!("\"@signature-params\": {}", input.raw_params));
    let signature_base = base_lines.join("\n");

    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| SignatureError::KeyResolution(format!("invalid public key: {e}")))?;
    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(public_key);
    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|_| SignatureError::Unparseable("invalid signature format".to_string()))?;

    verifier
        .verify(signature_base.as_bytes(), &signature)
        .map_err(|_| SignatureError::CryptoMismatch)
}
