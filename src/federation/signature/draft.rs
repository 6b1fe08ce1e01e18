//! Legacy draft-cavage HTTP signatures
//!
//! Signing string concatenates pseudo-headers and real headers with `\n`;
//! the result travels in a single `Signature` header:
//!
//! ```text
//! Signature: keyId="...",algorithm="rsa-sha256",headers="(request-target) host date digest",signature="..."
//! ```

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use http::HeaderMap;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use sha2::{Digest, Sha256};

use super::{SignatureError, SignedHeaders, SkewWindow, header_str};

/// Pseudo-headers/headers every draft signature must cover.
const REQUIRED_HEADERS: [&str; 3] = ["(request-target)", "host", "date"];

/// Parsed `Signature` header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (usually rsa-sha256)
    pub algorithm: String,
    /// Signed header names, lowercased
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse a `Signature` header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, SignatureError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim();
            let value = value.trim().trim_matches('"');

            match key {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_string()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {} // Ignore unknown fields
            }
        }
    }

    let missing = |field: &str| SignatureError::Unparseable(format!("missing {field} field"));

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| missing("keyId"))?,
        algorithm: algorithm.ok_or_else(|| missing("algorithm"))?,
        headers: headers.ok_or_else(|| missing("headers"))?,
        signature: signature.ok_or_else(|| missing("signature"))?,
    })
}

/// Generate the `Digest` header value: `SHA-256=<base64>`
pub fn generate_digest(body: &[u8]) -> String {
    let hash = Sha256::digest(body);
    format!("SHA-256={}", BASE64.encode(hash))
}

/// Sign an outgoing request.
///
/// # Returns
/// `Signature`, `Date` and (for bodies) `Digest` header values.
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
    // Explicit ports appear in the receiver's Host header too.
    let host = match parsed_url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let path_and_query = match parsed_url.query() {
        Some(query) => format!("{}?{}", parsed_url.path(), query),
        None => parsed_url.path().to_string(),
    };

    // Date header in RFC 2822/7231 format
    let date = now.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let digest = body.map(generate_digest);

    let request_target = format!("{} {}", method.to_ascii_lowercase(), path_and_query);

    let mut signing_parts = vec![
        format!("(request-target): {request_target}"),
        format!("host: {host}"),
        format!("date: {date}"),
    ];
    let mut header_list = REQUIRED_HEADERS.to_vec();

    if let Some(ref digest_value) = digest {
        signing_parts.push(format!("digest: {digest_value}"));
        header_list.push("digest");
    }

    let signing_string = signing_parts.join("\n");
    let signature_b64 = sign_string(&signing_string, private_key_pem)?;

    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id,
        header_list.join(" "),
        signature_b64
    );

    let mut headers = vec![("signature", signature_header), ("date", date)];
    if let Some(digest_value) = digest {
        headers.push(("digest", digest_value));
    }

    Ok(SignedHeaders { headers })
}

/// Verify an incoming request's draft signature.
///
/// Reconstructs the signing string from the *received* request using the
/// header list the signer claims, then checks the timestamp window, the
/// body digest, and finally the cryptographic signature.
pub fn verify(
    method: &str,
    path_and_query: &str,
    headers: &HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
    window: SkewWindow,
    now: DateTime<Utc>,
) -> Result<(), SignatureError> {
    let parsed = parse_signature_header(header_str(headers, "signature")?)?;

    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return Err(SignatureError::UnsupportedAlgorithm(parsed.algorithm));
    }

    for required in REQUIRED_HEADERS {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(SignatureError::Unparseable(format!(
                "signed headers must include {required}"
            )));
        }
    }

    if body.is_some() && !parsed.headers.iter().any(|h| h == "digest") {
        return Err(SignatureError::MissingHeader("digest"));
    }

    // Date must fall inside the acceptance window.
    let date_str = header_str(headers, "date")?;
    let date = DateTime::parse_from_rfc2822(date_str)
        .map_err(|_| SignatureError::Unparseable("invalid Date header format".to_string()))?;
    window.check(date.with_timezone(&Utc), now)?;

    // Body digest mismatch is fatal regardless of the signature itself.
    if let Some(body_data) = body {
        let digest_str = header_str(headers, "digest")?;
        if digest_str != generate_digest(body_data) {
            return Err(SignatureError::DigestMismatch);
        }
    }

    // Reconstruct the exact signing string from the received request.
    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for header_name in &parsed.headers {
        let value = match header_name.as_str() {
            "(request-target)" => {
                format!("{} {}", method.to_ascii_lowercase(), path_and_query)
            }
            "host" => header_str(headers, "host")?.to_string(),
            "date" => header_str(headers, "date")?.to_string(),
            "digest" => header_str(headers, "digest")?.to_string(),
            other => {
                return Err(SignatureError::Unparseable(format!(
                    "unsupported header in signature: {other}"
                )));
            }
        };
        signing_parts.push(format!("{header_name}: {value}"));
    }
    let signing_string = signing_parts.join("\n");

    verify_string(&signing_string, &parsed.signature, public_key_pem)
}

fn sign_string(signing_string: &str, private_key_pem: &str) -> Result<String, SignatureError> {
    let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| SignatureError::Unparseable(format!("invalid private key: {e}")))?;

    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(private_key);
    let signature = signing_key.sign(signing_string.as_bytes());
    Ok(BASE64.encode(signature.to_bytes()))
}

fn verify_string(
    signing_string: &str,
    signature_b64: &str,
    public_key_pem: &str,
) -> Result<(), SignatureError> {
    let signature_bytes = BASE64
        .decode(signature_b64)
        .map_err(|_| SignatureError::Unparseable("invalid signature encoding".to_string()))?;

    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| SignatureError::KeyResolution(format!("invalid public key: {e}")))?;

    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(public_key);
    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|_| SignatureError::Unparseable("invalid signature format".to_string()))?;

    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| SignatureError::CryptoMismatch)
}
