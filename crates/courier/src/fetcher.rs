// ABOUTME: Redirect-aware fetcher that follows Location headers by hand.
// ABOUTME: Every hop and the final response URL are re-validated against the URL policy.

use std::sync::Arc;

use reqwest::{Method, StatusCode};
use url::Url;

use crate::error::CourierError;
use crate::policy::UrlPolicy;
use crate::transport::{RawResponse, Transport};

/// Default number of requests a single fetch may issue.
pub const DEFAULT_MAX_HOPS: usize = 5;

/// A response that survived redirect handling, with the URL it was served from.
#[derive(Debug)]
pub struct Fetched {
    pub response: RawResponse,
    pub final_url: Url,
    /// Number of redirects followed to reach the response.
    pub redirects: usize,
}

/// Follows redirects manually so each target is validated before it is requested.
#[derive(Clone)]
pub struct SecureFetcher {
    policy: Arc<UrlPolicy>,
    transport: Arc<dyn Transport>,
    max_hops: usize,
}

impl SecureFetcher {
    pub fn new(policy: Arc<UrlPolicy>, transport: Arc<dyn Transport>, max_hops: usize) -> Self {
        Self {
            policy,
            transport,
            max_hops,
        }
    }

    pub fn policy(&self) -> &UrlPolicy {
        &self.policy
    }

    /// Issue `method` against `url`, following at most `max_hops` requests in total.
    ///
    /// Fails with PolicyViolation if any hop or the final URL is rejected, and with
    /// TransferAborted on a redirect without Location or when the hop budget runs out.
    pub async fn fetch(&self, method: Method, url: &str) -> Result<Fetched, CourierError> {
        let mut current = Url::parse(url).map_err(|e| {
            CourierError::policy(url, "Fetch", Some(anyhow::anyhow!("invalid URL: {}", e)))
        })?;

        for hop in 0..self.max_hops {
            // Fresh validation for every hop; nothing from an earlier hop is reused.
            let pinned = self.policy.check(&current).await?;

            let response = self
                .transport
                .send(method.clone(), &current, &pinned)
                .await
                .map_err(|e| CourierError::transfer(current.as_str(), "Fetch", Some(e)))?;

            if is_redirect(response.status) {
                let location = response.header("location").map(str::to_owned).ok_or_else(|| {
                    CourierError::transfer(
                        current.as_str(),
                        "Fetch",
                        Some(anyhow::anyhow!(
                            "redirect status {} without Location header",
                            response.status.as_u16()
                        )),
                    )
                })?;
                // Body of a redirect is never read.
                drop(response);

                let next = current.join(&location).map_err(|e| {
                    CourierError::policy(
                        current.as_str(),
                        "Fetch",
                        Some(anyhow::anyhow!("invalid redirect target: {}", e)),
                    )
                })?;
                tracing::debug!(
                    from = %crate::redact_url(current.as_str()),
                    to = %crate::redact_url(next.as_str()),
                    hop = hop + 1,
                    "following redirect"
                );
                current = next;
                continue;
            }

            if response.url != current {
                tracing::debug!(
                    requested = %crate::redact_url(current.as_str()),
                    reported = %crate::redact_url(response.url.as_str()),
                    "transport reported a different URL, re-validating"
                );
                self.policy.check(&response.url).await?;
            }

            let final_url = response.url.clone();
            return Ok(Fetched {
                response,
                final_url,
                redirects: hop,
            });
        }

        tracing::warn!(
            url = %crate::redact_url(url),
            max_hops = self.max_hops,
            "redirect budget exhausted"
        );
        Err(CourierError::transfer(
            url,
            "Fetch",
            Some(anyhow::anyhow!(
                "too many redirects (limit {} requests)",
                self.max_hops
            )),
        ))
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::StaticResolver;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use reqwest::header::{HeaderMap, HeaderValue};
    use std::net::IpAddr;
    use std::sync::Mutex;

    const A: &str = "a.images.example";
    const B: &str = "b.images.example";

    /// Answers from a closure and records every URL it was asked for.
    struct ScriptedTransport<F> {
        script: F,
        seen: Mutex<Vec<String>>,
    }

    impl<F> ScriptedTransport<F>
    where
        F: Fn(&Url) -> (u16, Vec<(&'static str, String)>) + Send + Sync,
    {
        fn new(script: F) -> Self {
            Self {
                script,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl<F> Transport for ScriptedTransport<F>
    where
        F: Fn(&Url) -> (u16, Vec<(&'static str, String)>) + Send + Sync,
    {
        async fn send(
            &self,
            _method: Method,
            url: &Url,
            _pinned: &[IpAddr],
        ) -> Result<RawResponse, anyhow::Error> {
            self.seen.lock().unwrap().push(url.to_string());
            let (status, headers) = (self.script)(url);
            let mut map = HeaderMap::new();
            for (name, value) in headers {
                map.insert(name, HeaderValue::from_str(&value)?);
            }
            Ok(RawResponse {
                status: StatusCode::from_u16(status)?,
                url: url.clone(),
                headers: map,
                body: futures::stream::iter(vec![Ok(Bytes::from_static(b"body"))]).boxed(),
            })
        }
    }

    fn policy() -> Arc<UrlPolicy> {
        let resolver = StaticResolver::new()
            .with_host(A, &["8.8.8.8"])
            .with_host(B, &["8.8.4.4"])
            .with_host("evil.example", &["1.2.3.4"]);
        Arc::new(UrlPolicy::new([A, B], ["localhost"], Arc::new(resolver)))
    }

    #[tokio::test]
    async fn test_follows_relative_redirect() {
        let transport = Arc::new(ScriptedTransport::new(|url: &Url| match url.path() {
            "/start" => (302, vec![("location", "/final.png".to_string())]),
            _ => (200, vec![("content-type", "image/png".to_string())]),
        }));
        let fetcher = SecureFetcher::new(policy(), transport.clone(), 5);

        let fetched = fetcher
            .fetch(Method::GET, &format!("https://{}/start", A))
            .await
            .unwrap();

        assert_eq!(fetched.final_url.as_str(), format!("https://{}/final.png", A));
        assert_eq!(fetched.redirects, 1);
        assert_eq!(transport.seen().len(), 2);
    }

    #[tokio::test]
    async fn test_redirect_to_disallowed_host_is_never_requested() {
        let transport = Arc::new(ScriptedTransport::new(|url: &Url| match url.host_str() {
            Some(A) => (302, vec![("location", "https://evil.example/x".to_string())]),
            _ => (200, vec![]),
        }));
        let fetcher = SecureFetcher::new(policy(), transport.clone(), 5);

        let err = fetcher
            .fetch(Method::GET, &format!("https://{}/start", A))
            .await
            .expect_err("redirect off the allowlist must fail");

        assert!(err.is_policy_violation());
        assert_eq!(transport.seen(), vec![format!("https://{}/start", A)]);
    }

    #[tokio::test]
    async fn test_redirect_to_metadata_endpoint_is_blocked() {
        let transport = Arc::new(ScriptedTransport::new(|_url: &Url| {
            (
                302,
                vec![(
                    "location",
                    "http://169.254.169.254/latest/meta-data/".to_string(),
                )],
            )
        }));
        let fetcher = SecureFetcher::new(policy(), transport.clone(), 5);

        let err = fetcher
            .fetch(Method::GET, &format!("https://{}/abc", A))
            .await
            .unwrap_err();
        assert!(err.is_policy_violation());
        assert_eq!(transport.seen().len(), 1);
    }

    #[tokio::test]
    async fn test_redirect_loop_stops_at_hop_budget() {
        let transport = Arc::new(ScriptedTransport::new(|url: &Url| {
            let other = if url.host_str() == Some(A) { B } else { A };
            (302, vec![("location", format!("https://{}/loop", other))])
        }));
        let fetcher = SecureFetcher::new(policy(), transport.clone(), 4);

        let err = fetcher
            .fetch(Method::GET, &format!("https://{}/loop", A))
            .await
            .unwrap_err();

        assert!(err.is_transfer_aborted());
        assert_eq!(transport.seen().len(), 4);
    }

    #[tokio::test]
    async fn test_redirect_without_location_fails() {
        let transport = Arc::new(ScriptedTransport::new(|_url: &Url| (301, vec![])));
        let fetcher = SecureFetcher::new(policy(), transport, 5);

        let err = fetcher
            .fetch(Method::GET, &format!("https://{}/x", A))
            .await
            .unwrap_err();
        assert!(err.is_transfer_aborted());
        assert!(err.to_string().contains("without Location"));
    }

    #[tokio::test]
    async fn test_initial_url_is_validated_before_any_request() {
        let transport = Arc::new(ScriptedTransport::new(|_url: &Url| (200, vec![])));
        let fetcher = SecureFetcher::new(policy(), transport.clone(), 5);

        let err = fetcher
            .fetch(Method::GET, "http://a.images.example/x")
            .await
            .unwrap_err();
        assert!(err.is_policy_violation());
        assert!(transport.seen().is_empty());
    }

    #[tokio::test]
    async fn test_not_modified_is_not_a_redirect() {
        let transport = Arc::new(ScriptedTransport::new(|_url: &Url| (304, vec![])));
        let fetcher = SecureFetcher::new(policy(), transport, 5);

        let fetched = fetcher
            .fetch(Method::HEAD, &format!("https://{}/x", A))
            .await
            .unwrap();
        assert_eq!(fetched.response.status, StatusCode::NOT_MODIFIED);
    }
}
