//! `fetch()` for sandboxed code, gated by an origin allowlist.
//!
//! - Only URLs whose origin is on the allowlist can be fetched
//! - Redirects are followed by hand, and only within the same origin
//! - An empty allowlist disables fetch entirely

use anyhow::anyhow;
use deno_core::{op2, OpState};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use url::Url;

/// Redirect hops followed before giving up.
const MAX_REDIRECTS: usize = 5;

/// Origin allowlist for a realm's `fetch()`.
#[derive(Debug, Clone, Default)]
pub struct FetchPolicy {
    /// Origins as scheme + host + port, e.g. "https://api.example.com"
    pub allowed_origins: Vec<String>,
}

impl FetchPolicy {
    pub fn is_origin_allowed(&self, url: &Url) -> bool {
        let origin = url.origin().ascii_serialization();
        self.allowed_origins.iter().any(|allowed| origin == *allowed)
    }
}

/// Request info passed from the realm
#[derive(Debug, Clone, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub body: Option<String>,
}

/// Response info returned to the realm
#[derive(Debug, Serialize)]
pub struct FetchResponse {
    pub ok: bool,
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub url: String,
    pub body: String,
}

fn parse_method(method: Option<&str>) -> Result<Method, anyhow::Error> {
    match method.unwrap_or("GET").to_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "DELETE" => Ok(Method::DELETE),
        "PATCH" => Ok(Method::PATCH),
        "HEAD" => Ok(Method::HEAD),
        "OPTIONS" => Ok(Method::OPTIONS),
        other => Err(anyhow!("Unsupported HTTP method: {}", other)),
    }
}

#[op2(async)]
#[serde]
pub async fn op_realm_fetch(
    state: Rc<RefCell<OpState>>,
    #[serde] request: FetchRequest,
) -> Result<FetchResponse, deno_core::error::AnyError> {
    let policy = state
        .borrow()
        .try_borrow::<FetchPolicy>()
        .cloned()
        .unwrap_or_default();

    fetch(request, &policy).await
}

async fn fetch(
    mut request: FetchRequest,
    policy: &FetchPolicy,
) -> Result<FetchResponse, deno_core::error::AnyError> {
    let origin_url = Url::parse(&request.url)
        .map_err(|e| anyhow!("Invalid URL '{}': {}", request.url, e))?;

    if !policy.is_origin_allowed(&origin_url) {
        tracing::warn!(url = %origin_url, "fetch blocked by origin allowlist");
        return Err(anyhow!(
            "Fetch blocked: origin '{}' is not in the allowlist. Allowed: {:?}",
            origin_url.origin().ascii_serialization(),
            policy.allowed_origins
        ));
    }

    let client = Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

    let mut url = origin_url.clone();
    for _ in 0..=MAX_REDIRECTS {
        let method = parse_method(request.method.as_deref())?;
        let mut builder = client.request(method, url.clone());
        if let Some(headers) = &request.headers {
            for (key, value) in headers {
                builder = builder.header(key, value);
            }
        }
        if let Some(body) = request.body.take() {
            builder = builder.body(body);
        }

        tracing::debug!(url = %url, "fetch");
        let response = builder
            .send()
            .await
            .map_err(|e| anyhow!("Fetch failed: {}", e))?;

        let status = response.status();
        let final_url = response.url().clone();

        if status.is_redirection() {
            if let Some(location) = response.headers().get("location") {
                let location = location
                    .to_str()
                    .map_err(|_| anyhow!("Invalid redirect location"))?;
                let redirect_url = final_url
                    .join(location)
                    .map_err(|e| anyhow!("Invalid redirect URL: {}", e))?;

                if redirect_url.origin() != origin_url.origin() {
                    return Err(anyhow!(
                        "Fetch blocked: redirect to different origin '{}' (original: '{}')",
                        redirect_url.origin().ascii_serialization(),
                        origin_url.origin().ascii_serialization()
                    ));
                }

                // Redirects become GET without a body
                request.method = Some("GET".to_string());
                url = redirect_url;
                continue;
            }
        }

        let mut headers = HashMap::new();
        for (key, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(key.to_string(), v.to_string());
            }
        }

        let body = response
            .text()
            .await
            .map_err(|e| anyhow!("Failed to read response body: {}", e))?;

        return Ok(FetchResponse {
            ok: status.is_success(),
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("Unknown").to_string(),
            headers,
            url: final_url.to_string(),
            body,
        });
    }

    Err(anyhow!(
        "Fetch failed: more than {} redirects from '{}'",
        MAX_REDIRECTS,
        origin_url
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_matching() {
        let policy = FetchPolicy {
            allowed_origins: vec![
                "https://api.example.com".to_string(),
                "http://localhost:3000".to_string(),
            ],
        };

        assert!(policy.is_origin_allowed(&Url::parse("https://api.example.com/users").unwrap()));
        assert!(policy.is_origin_allowed(&Url::parse("http://localhost:3000/api").unwrap()));

        assert!(!policy.is_origin_allowed(&Url::parse("https://evil.com/api").unwrap()));
        // scheme and port are part of the origin
        assert!(!policy.is_origin_allowed(&Url::parse("http://api.example.com/users").unwrap()));
        assert!(!policy.is_origin_allowed(&Url::parse("https://api.example.com:8080/").unwrap()));
    }

    #[test]
    fn test_empty_allowlist_blocks_everything() {
        let policy = FetchPolicy::default();
        assert!(!policy.is_origin_allowed(&Url::parse("https://anything.com").unwrap()));
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!(parse_method(None).unwrap(), Method::GET);
        assert_eq!(parse_method(Some("post")).unwrap(), Method::POST);
        assert!(parse_method(Some("TRACE")).is_err());
    }

    #[tokio::test]
    async fn test_blocked_origin_never_connects() {
        let request = FetchRequest {
            url: "https://evil.example/steal".into(),
            method: None,
            headers: None,
            body: None,
        };
        let err = fetch(request, &FetchPolicy::default()).await.unwrap_err();
        assert!(err.to_string().contains("not in the allowlist"));
    }
}
