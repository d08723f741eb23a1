// ABOUTME: Metadata-only pre-flight probe that checks declared content type and length.
// ABOUTME: Uses HEAD through the secure fetcher, falling back to GET with the body abandoned.

use std::collections::HashSet;

use reqwest::{Method, StatusCode};
use serde::Serialize;

use crate::error::CourierError;
use crate::fetcher::SecureFetcher;
use crate::transport::RawResponse;

/// What the server declared about a resource before we commit to downloading it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub http_status: u16,
}

/// Limits applied to declared metadata. The downloader enforces the same limits on the
/// bytes actually received.
#[derive(Debug, Clone)]
pub struct ContentRules {
    pub allowed_mime_types: HashSet<String>,
    pub max_bytes: u64,
}

impl ContentRules {
    pub fn new<I>(allowed_mime_types: I, max_bytes: u64) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        Self {
            allowed_mime_types: allowed_mime_types
                .into_iter()
                .map(|m| m.as_ref().trim().to_lowercase())
                .collect(),
            max_bytes,
        }
    }

    /// Exact match on a lower-cased media type token.
    pub fn allows(&self, media_type: &str) -> bool {
        self.allowed_mime_types.contains(&media_type.to_lowercase())
    }

    /// Check a response's status and declared headers.
    ///
    /// A missing Content-Type passes; a declared one must be allowed.
    pub fn check_declared(&self, response: &RawResponse, op: &str) -> Result<(), CourierError> {
        let url = response.url.as_str();
        if !response.status.is_success() {
            return Err(CourierError::probe(
                url,
                op,
                Some(anyhow::anyhow!("HTTP status {}", response.status.as_u16())),
            ));
        }
        if let Some(media_type) = response.media_type() {
            if !self.allows(&media_type) {
                return Err(CourierError::probe(
                    url,
                    op,
                    Some(anyhow::anyhow!("content type {} is not allowed", media_type)),
                ));
            }
        }
        if let Some(len) = response.content_length() {
            if len > self.max_bytes {
                return Err(CourierError::probe(
                    url,
                    op,
                    Some(anyhow::anyhow!(
                        "declared length {} exceeds limit {}",
                        len,
                        self.max_bytes
                    )),
                ));
            }
        }
        Ok(())
    }
}

/// Run the pre-flight probe against `url`.
pub async fn probe(
    fetcher: &SecureFetcher,
    rules: &ContentRules,
    url: &str,
) -> Result<ProbeResult, CourierError> {
    let mut fetched = fetcher.fetch(Method::HEAD, url).await?;

    if matches!(
        fetched.response.status,
        StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
    ) {
        tracing::debug!(url = %crate::redact_url(url), "HEAD unsupported, probing with GET");
        fetched = fetcher.fetch(Method::GET, url).await?;
    }

    let response = fetched.response;
    let result = ProbeResult {
        content_type: response.media_type(),
        content_length: response.content_length(),
        http_status: response.status.as_u16(),
    };
    rules.check_declared(&response, "Probe")?;
    // Dropping the response abandons any GET body unread.
    drop(response);

    Ok(result)
}
