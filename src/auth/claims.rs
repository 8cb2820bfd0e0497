//! JWT payload decoding for display purposes.
//!
//! No signature verification happens here: the token was handed to us by
//! the identity provider over TLS and the control plane verifies it on
//! every call. We only want the user and tenant labels out of it.

use base64::Engine;
use serde::{Deserialize, Serialize};

/// Who is signed in, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub display_name: Option<String>,
    pub principal_name: Option<String>,
    pub tenant_id: Option<String>,
    /// Best human label for the tenant: verified domain of the UPN, else the tenant id.
    pub tenant_label: Option<String>,
    pub object_id: Option<String>,
    /// `exp` claim (Unix seconds), if present.
    pub expires: Option<i64>,
}

/// Decode the middle segment of a three-part token into a JSON object.
///
/// Accepts both padded and unpadded base64url, and tolerates the standard
/// alphabet (`+`, `/`) some proxies rewrite tokens into.
pub fn decode_payload(token: &str) -> Option<serde_json::Value> {
    let mut parts = token.split('.');
    let (_header, payload, _sig) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() || payload.is_empty() {
        return None;
    }

    let normalized: String = payload
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();

    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let bytes = engine.decode(normalized.as_bytes()).ok()?;
    let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    value.is_object().then_some(value)
}

/// Derive the session context from a bearer token. Malformed tokens yield `None`.
pub fn session_context(token: &str) -> Option<SessionContext> {
    let raw = decode_payload(token)?;
    let s = |k: &str| raw.get(k).and_then(|v| v.as_str()).map(String::from);

    let principal_name = s("upn")
        .or_else(|| s("preferred_username"))
        .or_else(|| s("unique_name"))
        .or_else(|| s("email"));
    let tenant_id = s("tid");
    let tenant_label = principal_name
        .as_deref()
        .and_then(|p| p.split_once('@'))
        .map(|(_, domain)| domain.to_string())
        .or_else(|| tenant_id.clone());

    Some(SessionContext {
        display_name: s("name"),
        principal_name,
        tenant_id,
        tenant_label,
        object_id: s("oid"),
        expires: raw.get("exp").and_then(|v| v.as_i64()),
    })
}
