// ABOUTME: Single-request HTTP transport seam that never follows redirects.
// ABOUTME: The reqwest implementation pins connections to the addresses the policy resolved.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use url::Url;

/// Response body as a stream of chunks.
pub type BodyStream = BoxStream<'static, Result<Bytes, anyhow::Error>>;

/// One HTTP response, exactly as the server sent it.
pub struct RawResponse {
    pub status: StatusCode,
    /// The URL the transport reports for this response.
    pub url: Url,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl RawResponse {
    /// Header value as a string, if present and valid ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Declared Content-Length, if present and numeric.
    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")
            .and_then(|s| s.trim().parse::<u64>().ok())
    }

    /// Content-Type media type, lower-cased, without parameters.
    pub fn media_type(&self) -> Option<String> {
        self.header("content-type").and_then(media_type)
    }
}

impl std::fmt::Debug for RawResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawResponse")
            .field("status", &self.status)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Extract the type token before any `;` parameters, lower-cased.
pub fn media_type(content_type: &str) -> Option<String> {
    let token = content_type.split(';').next()?.trim().to_lowercase();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Issues exactly one HTTP request. Implementations must not follow redirects.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `method` to `url`. When `pinned` is non-empty the connection must go to one
    /// of those addresses rather than a fresh DNS answer.
    async fn send(
        &self,
        method: Method,
        url: &Url,
        pinned: &[IpAddr],
    ) -> Result<RawResponse, anyhow::Error>;
}

/// Transport built on reqwest with redirects disabled.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    user_agent: String,
    connect_timeout: Duration,
    /// Unpinned requests reuse this client's pool.
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: impl Into<String>, connect_timeout: Duration) -> Result<Self, anyhow::Error> {
        let user_agent = user_agent.into();
        let client = Self::client_builder(&user_agent, connect_timeout).build()?;
        Ok(Self {
            user_agent,
            connect_timeout,
            client,
        })
    }

    fn client_builder(user_agent: &str, connect_timeout: Duration) -> reqwest::ClientBuilder {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(user_agent)
            .connect_timeout(connect_timeout)
            .no_proxy()
    }

    fn pinned_client(&self, url: &Url, pinned: &[IpAddr]) -> Result<reqwest::Client, anyhow::Error> {
        let host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("URL has no host"))?;
        let port = url.port_or_known_default().unwrap_or(443);
        let addrs: Vec<SocketAddr> = pinned.iter().map(|ip| SocketAddr::new(*ip, port)).collect();
        Ok(Self::client_builder(&self.user_agent, self.connect_timeout)
            .resolve_to_addrs(host, &addrs)
            .build()?)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        method: Method,
        url: &Url,
        pinned: &[IpAddr],
    ) -> Result<RawResponse, anyhow::Error> {
        let client = if pinned.is_empty() {
            self.client.clone()
        } else {
            self.pinned_client(url, pinned)?
        };

        let response = client
            .request(method, url.clone())
            .header(reqwest::header::ACCEPT, "image/*")
            .send()
            .await?;

        let status = response.status();
        let final_url = response.url().clone();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(anyhow::Error::from))
            .boxed();

        Ok(RawResponse {
            status,
            url: final_url,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn test_media_type_strips_parameters() {
        assert_eq!(media_type("image/PNG; charset=binary"), Some("image/png".to_string()));
        assert_eq!(media_type("  image/webp  "), Some("image/webp".to_string()));
        assert_eq!(media_type(";q=1"), None);
        assert_eq!(media_type(""), None);
    }

    #[tokio::test]
    async fn test_reqwest_transport_does_not_follow_redirects() {
        let server = MockServer::start();
        let redirect = server.mock(|when, then| {
            when.method(GET).path("/start");
            then.status(302).header("Location", "/target");
        });
        let target = server.mock(|when, then| {
            when.method(GET).path("/target");
            then.status(200).body("should not be reached");
        });

        let transport = ReqwestTransport::new("test-agent", Duration::from_secs(5)).unwrap();
        let url = Url::parse(&server.url("/start")).unwrap();
        let response = transport.send(Method::GET, &url, &[]).await.unwrap();

        redirect.assert();
        assert_eq!(target.calls(), 0);
        assert_eq!(response.status, StatusCode::FOUND);
        assert_eq!(response.header("location"), Some("/target"));
    }

    #[tokio::test]
    async fn test_reqwest_transport_pins_addresses() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/img.png");
            then.status(200).header("content-type", "image/png").body("png");
        });

        let transport = ReqwestTransport::new("test-agent", Duration::from_secs(5)).unwrap();
        // The name does not exist; only the pinned address makes the request succeed.
        let url = Url::parse(&format!("http://pinned.invalid:{}/img.png", server.port())).unwrap();
        let pinned = ["127.0.0.1".parse().unwrap()];
        let response = transport.send(Method::GET, &url, &pinned).await.unwrap();

        mock.assert();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.media_type(), Some("image/png".to_string()));
        assert_eq!(response.content_length(), Some(3));
    }
}
