//! Ops behind the web platform globals: crypto, base64 and URL parsing.
//!
//! Timers, `queueMicrotask` and `structuredClone` come straight from
//! `Deno.core`; everything that needs a host crate lives here.

use crate::host::builtins::digest;
use anyhow::anyhow;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use deno_core::error::AnyError;
use deno_core::op2;
use serde::Serialize;
use url::Url;

/// Largest buffer `crypto.getRandomValues` fills in one call.
pub const MAX_RANDOM_VALUES: usize = 65536;

/// `atob` accepts input with or without padding.
const FORGIVING_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

// ============================================================================
// Crypto Ops
// ============================================================================

#[op2]
#[string]
pub fn op_web_random_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[op2(fast)]
pub fn op_web_get_random_values(#[buffer] buf: &mut [u8]) -> Result<(), AnyError> {
    use rand::RngCore;

    if buf.len() > MAX_RANDOM_VALUES {
        return Err(anyhow!(
            "getRandomValues: at most {} bytes per call",
            MAX_RANDOM_VALUES
        ));
    }
    rand::thread_rng().fill_bytes(buf);
    Ok(())
}

#[op2]
#[buffer]
pub fn op_web_digest(#[string] algorithm: &str, #[buffer] data: &[u8]) -> Result<Vec<u8>, AnyError> {
    digest(algorithm, data)
}

// ============================================================================
// Encoding Ops
// ============================================================================

/// `btoa`: every code unit must fit in one byte.
pub fn encode_latin1(data: &str) -> Result<String, AnyError> {
    let bytes = data
        .chars()
        .map(|c| u8::try_from(u32::from(c)).map_err(|_| anyhow!("btoa: character out of Latin-1 range")))
        .collect::<Result<Vec<u8>, _>>()?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// `atob`: ASCII whitespace is ignored and each byte becomes one code unit.
pub fn decode_latin1(data: &str) -> Result<String, AnyError> {
    let compact: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = FORGIVING_BASE64
        .decode(compact)
        .map_err(|e| anyhow!("atob: invalid base64: {}", e))?;
    Ok(bytes.into_iter().map(char::from).collect())
}

#[op2]
#[string]
pub fn op_web_btoa(#[string] data: &str) -> Result<String, AnyError> {
    encode_latin1(data)
}

#[op2]
#[string]
pub fn op_web_atob(#[string] data: &str) -> Result<String, AnyError> {
    decode_latin1(data)
}

// ============================================================================
// URL Ops
// ============================================================================

/// Components of a parsed URL, named like the `URL` getters.
#[derive(Debug, Serialize)]
pub struct UrlParts {
    pub href: String,
    pub origin: String,
    pub protocol: String,
    pub username: String,
    pub password: String,
    pub host: String,
    pub hostname: String,
    pub port: String,
    pub pathname: String,
    pub search: String,
    pub hash: String,
}

impl From<&Url> for UrlParts {
    fn from(url: &Url) -> Self {
        let prefixed = |prefix: &str, part: Option<&str>| match part {
            Some(part) if !part.is_empty() => format!("{}{}", prefix, part),
            _ => String::new(),
        };
        let hostname = url.host_str().unwrap_or_default().to_string();
        let port = url.port().map(|p| p.to_string()).unwrap_or_default();
        let host = if port.is_empty() {
            hostname.clone()
        } else {
            format!("{}:{}", hostname, port)
        };

        Self {
            href: url.as_str().to_string(),
            origin: url.origin().ascii_serialization(),
            protocol: format!("{}:", url.scheme()),
            username: url.username().to_string(),
            password: url.password().unwrap_or_default().to_string(),
            host,
            hostname,
            port,
            pathname: url.path().to_string(),
            search: prefixed("?", url.query()),
            hash: prefixed("#", url.fragment()),
        }
    }
}

pub fn parse_url(href: &str, base: Option<&str>) -> Result<Url, AnyError> {
    let parsed = match base {
        Some(base) => Url::parse(base).and_then(|base| base.join(href)),
        None => Url::parse(href),
    };
    parsed.map_err(|e| anyhow!("Invalid URL '{}': {}", href, e))
}

/// Replace one component of `href`. Only the components `URL` lets sandboxed
/// code assign are accepted.
pub fn set_url_part(href: &str, part: &str, value: &str) -> Result<Url, AnyError> {
    let mut url = parse_url(href, None)?;
    match part {
        "search" => {
            let query = value.strip_prefix('?').unwrap_or(value);
            url.set_query(if query.is_empty() { None } else { Some(query) });
        }
        "hash" => {
            let fragment = value.strip_prefix('#').unwrap_or(value);
            url.set_fragment(if fragment.is_empty() { None } else { Some(fragment) });
        }
        "pathname" => url.set_path(value),
        other => return Err(anyhow!("URL.{} cannot be assigned", other)),
    }
    Ok(url)
}

#[op2]
#[string]
pub fn op_web_url_parse(#[string] href: String, #[string] base: String) -> Result<String, AnyError> {
    // An empty base means none was given.
    let base = Some(base.as_str()).filter(|b| !b.is_empty());
    let url = parse_url(&href, base)?;
    Ok(serde_json::to_string(&UrlParts::from(&url))?)
}

#[op2]
#[string]
pub fn op_web_url_set(
    #[string] href: String,
    #[string] part: String,
    #[string] value: String,
) -> Result<String, AnyError> {
    let url = set_url_part(&href, &part, &value)?;
    Ok(serde_json::to_string(&UrlParts::from(&url))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_parts_match_getters() {
        let url = parse_url("https://user:pw@example.com:8443/a/b?x=1#top", None).unwrap();
        let parts = UrlParts::from(&url);
        assert_eq!(parts.origin, "https://example.com:8443");
        assert_eq!(parts.protocol, "https:");
        assert_eq!(parts.host, "example.com:8443");
        assert_eq!(parts.port, "8443");
        assert_eq!(parts.pathname, "/a/b");
        assert_eq!(parts.search, "?x=1");
        assert_eq!(parts.hash, "#top");
        assert_eq!(parts.username, "user");
    }

    #[test]
    fn test_relative_url_against_base() {
        let url = parse_url("../c?q", Some("https://example.com/a/b/")).unwrap();
        assert_eq!(url.as_str(), "https://example.com/a/c?q");
        assert!(parse_url("not a url", None).is_err());
    }

    #[test]
    fn test_set_search_and_hash() {
        let url = set_url_part("https://example.com/p?old=1#h", "search", "?new=2").unwrap();
        assert_eq!(url.as_str(), "https://example.com/p?new=2#h");

        let url = set_url_part(url.as_str(), "hash", "").unwrap();
        assert_eq!(UrlParts::from(&url).hash, "");

        assert!(set_url_part("https://example.com/", "origin", "x").is_err());
    }

    #[test]
    fn test_latin1_base64() {
        assert_eq!(encode_latin1("hello").unwrap(), "aGVsbG8=");
        assert_eq!(decode_latin1("aGVsbG8").unwrap(), "hello");
        assert_eq!(decode_latin1(" aGVs\nbG8= ").unwrap(), "hello");
        assert_eq!(decode_latin1(&encode_latin1("é").unwrap()).unwrap(), "é");
        assert!(encode_latin1("✓").is_err());
        assert!(decode_latin1("%%%").is_err());
    }
}
