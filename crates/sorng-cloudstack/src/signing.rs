//! CloudStack request signing and URL construction.
//!
//! Every API call is a GET against `<endpoint>/api` whose query string
//! carries the command, the caller's parameters, the API key and a
//! signature. The signature is computed as follows:
//!
//! 1. Collect `command`, `apikey` and every parameter; keys are lower-cased,
//!    values are URL-encoded and then lower-cased.
//! 2. Sort by key (first occurrence of a duplicate key wins).
//! 3. Join as `key=value` pairs with `&`.
//! 4. HMAC-SHA1 with the secret key, Base64-encode, URL-encode.
//!
//! Case folding is ASCII-only so the signature never depends on the locale.

use crate::config::EndpointContext;
use crate::error::{CsError, CsResult};
use crate::param::Param;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha1::Sha1;
use std::collections::BTreeMap;

type HmacSha1 = Hmac<Sha1>;

/// Form encoding with `a-zA-Z0-9 . - * _` left alone and spaces as `%20`.
const QUERY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'-')
    .remove(b'*')
    .remove(b'_');

/// Signs requests for one API key pair.
#[derive(Clone)]
pub struct CsSigner {
    api_key: String,
    api_secret: String,
}

impl CsSigner {
    /// Create a signer; carriage returns are stripped from both keys.
    pub fn new(api_key: &str, api_secret: &str) -> Self {
        Self {
            api_key: api_key.replace('\r', ""),
            api_secret: api_secret.replace('\r', ""),
        }
    }

    pub fn from_context(ctx: &EndpointContext) -> Self {
        Self::new(&ctx.api_key, &ctx.api_secret)
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Base64 HMAC-SHA1 signature for a command and its parameters.
    pub fn signature(&self, command: &str, params: &[Param]) -> CsResult<String> {
        let canonical = string_to_sign(command, &self.api_key, params);
        log::debug!("string to sign: {}", canonical);
        hmac_sha1_base64(self.api_secret.as_bytes(), canonical.as_bytes())
    }

    /// Full signed request URL.
    pub fn build_url(&self, endpoint: &str, command: &str, params: &[Param]) -> CsResult<String> {
        let mut url = normalize_endpoint(endpoint);
        url.push_str("?command=");
        url.push_str(command);
        for param in params {
            url.push('&');
            url.push_str(&param.key);
            if let Some(ref value) = param.value {
                url.push('=');
                url.push_str(&url_encode(value));
            }
        }
        url.push_str("&apiKey=");
        url.push_str(&url_encode(&self.api_key));
        url.push_str("&signature=");
        url.push_str(&url_encode(&self.signature(command, params)?));
        Ok(url)
    }
}

/// Build a signed URL from an optional context.
pub fn build_request(
    command: &str,
    params: &[Param],
    ctx: Option<&EndpointContext>,
) -> CsResult<String> {
    let ctx = ctx.ok_or_else(|| CsError::configuration("No context was set for this request"))?;
    if ctx.endpoint.trim().is_empty() {
        return Err(CsError::configuration("No endpoint was set for this request"));
    }
    CsSigner::from_context(ctx).build_url(&ctx.endpoint, command, params)
}

// ── Helper functions ────────────────────────────────────────────────────

/// URL-encode a value (spaces become `%20`, never `+`).
pub fn url_encode(input: &str) -> String {
    utf8_percent_encode(input, QUERY_ENCODE_SET).to_string()
}

/// Strip trailing slashes and make sure the path ends in `/api`.
pub fn normalize_endpoint(endpoint: &str) -> String {
    let mut base = endpoint.trim().trim_end_matches('/').to_string();
    if !base.ends_with("/api") {
        base.push_str("/api");
    }
    base
}

/// Canonical string that the signature is computed over.
pub fn string_to_sign(command: &str, api_key: &str, params: &[Param]) -> String {
    let mut sorted: BTreeMap<String, String> = BTreeMap::new();
    sorted.insert(
        "command".to_string(),
        url_encode(command).to_ascii_lowercase(),
    );
    sorted.insert(
        "apikey".to_string(),
        url_encode(api_key).to_ascii_lowercase(),
    );
    for param in params {
        let value = param.value.as_deref().map(url_encode).unwrap_or_default();
        sorted
            .entry(param.key.to_ascii_lowercase())
            .or_insert_with(|| value.to_ascii_lowercase());
    }
    sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<String>>()
        .join("&")
}

fn hmac_sha1_base64(key: &[u8], data: &[u8]) -> CsResult<String> {
    let mut mac = HmacSha1::new_from_slice(key)
        .map_err(|e| CsError::internal(format!("Failed to generate HMAC: {}", e)))?;
    mac.update(data);
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}
