//! Deterministic request identity
//!
//! Two requests with the same unique key denote the same resource. The
//! key is derived from the normalized URL, optionally extended with the
//! HTTP method and a payload checksum; the request id is a stable hash of
//! the key, equal across processes.

use anyhow::{Context, Result};
use base64::Engine;
use sha2::{Digest, Sha256};
use url::Url;

use super::HttpMethod;

/// Query parameter prefixes dropped during normalization
const TRACKING_PARAM_PREFIX: &str = "utm_";

/// Number of characters of the payload checksum kept in extended keys
const PAYLOAD_HASH_LEN: usize = 8;

/// Length of a derived request id
const REQUEST_ID_LEN: usize = 15;

/// Normalize a URL for identity comparison.
///
/// Lowercases scheme and host, drops default ports, sorts query
/// parameters, removes `utm_*` tracking parameters, and strips the
/// fragment unless `keep_fragment` is set. The path and parameter values
/// are preserved byte-for-byte.
pub fn normalize_url(raw: &str, keep_fragment: bool) -> Result<String> {
    let mut url = Url::parse(raw.trim()).with_context(|| format!("Invalid URL: {raw}"))?;

    // Url::parse already lowercases scheme and host and omits default
    // ports during serialization; only query and fragment remain.
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| !name.to_lowercase().starts_with(TRACKING_PARAM_PREFIX))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    pairs.sort();

    if pairs.is_empty() {
        url.set_query(None);
    } else {
        let query = pairs
            .iter()
            .map(|(name, value)| {
                if value.is_empty() {
                    name.clone()
                } else {
                    format!("{name}={value}")
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        url.set_query(Some(&query));
    }

    if !keep_fragment {
        url.set_fragment(None);
    }

    Ok(url.to_string())
}

/// Derive a unique key from request identity inputs.
///
/// Plain GET requests use the normalized URL alone. Non-GET methods and
/// `use_extended` requests carry a `METHOD(payload-checksum):` prefix so
/// that distinct payloads to the same URL stay distinct.
pub fn compute_unique_key(
    url: &str,
    method: HttpMethod,
    payload: Option<&[u8]>,
    keep_fragment: bool,
    use_extended: bool,
) -> Result<String> {
    let normalized = normalize_url(url, keep_fragment)?;

    if method == HttpMethod::Get && !use_extended {
        return Ok(normalized);
    }

    let checksum = payload.map(payload_checksum).unwrap_or_default();
    Ok(format!("{}({checksum}):{normalized}", method.as_str()))
}

/// First `PAYLOAD_HASH_LEN` hex characters of the payload's SHA-256
fn payload_checksum(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    hex::encode(digest)[..PAYLOAD_HASH_LEN].to_string()
}

/// Map a unique key to its request id.
///
/// Pure function: equal keys yield equal ids across processes. The id is
/// the SHA-256 of the key, base64-encoded, stripped to alphanumerics and
/// truncated to 15 characters.
#[must_use]
pub fn unique_key_to_request_id(unique_key: &str) -> String {
    let digest = Sha256::digest(unique_key.as_bytes());
    let encoded = base64::engine::general_purpose::STANDARD.encode(digest);
    encoded
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(REQUEST_ID_LEN)
        .collect()
}
