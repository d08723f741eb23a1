// ABOUTME: URL policy validator enforcing scheme, exact-host allowlist, denylist, and DNS checks.
// ABOUTME: Returns a bare verdict publicly; the fetcher uses check() to get addresses to pin.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;
use url::{Host, Url};

use crate::error::CourierError;
use crate::ip::is_private_ip;
use crate::resolve::{resolve_and_check, Resolver};

/// The only scheme a candidate URL may use.
pub const REQUIRED_SCHEME: &str = "https";

/// Outcome of validating one URL. Carries no capability: it cannot be replayed for
/// another URL or hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationVerdict {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl ValidationVerdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Validates candidate URLs before any byte is requested from them.
#[derive(Clone)]
pub struct UrlPolicy {
    allowed_hosts: HashSet<String>,
    denied_hosts: HashSet<String>,
    resolver: Arc<dyn Resolver>,
}

impl std::fmt::Debug for UrlPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlPolicy")
            .field("allowed_hosts", &self.allowed_hosts)
            .field("denied_hosts", &self.denied_hosts)
            .finish_non_exhaustive()
    }
}

impl UrlPolicy {
    /// Build a policy. Host entries are matched exactly after lower-casing.
    pub fn new<A, D>(allowed_hosts: A, denied_hosts: D, resolver: Arc<dyn Resolver>) -> Self
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        Self {
            allowed_hosts: normalize_hosts(allowed_hosts),
            denied_hosts: normalize_hosts(denied_hosts),
            resolver,
        }
    }

    /// Validate a URL string and return a verdict.
    pub async fn validate(&self, url: &str) -> ValidationVerdict {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(e) => return ValidationVerdict::deny(format!("invalid URL: {}", e)),
        };
        match self.check(&parsed).await {
            Ok(_) => ValidationVerdict::allow(),
            Err(err) => ValidationVerdict::deny(err.reason()),
        }
    }

    /// Validate a parsed URL, returning the addresses its host resolved to.
    ///
    /// The address list is empty when the host is an IP literal. Each call runs every
    /// step from scratch, including DNS.
    pub async fn check(&self, url: &Url) -> Result<Vec<IpAddr>, CourierError> {
        let deny = |msg: String| {
            tracing::warn!(url = %crate::redact_url(url.as_str()), reason = %msg, "URL rejected by policy");
            CourierError::policy(url.as_str(), "Validate", Some(anyhow::anyhow!(msg)))
        };

        if url.scheme() != REQUIRED_SCHEME {
            return Err(deny(format!(
                "scheme '{}' is not allowed, only {} is",
                url.scheme(),
                REQUIRED_SCHEME
            )));
        }

        let host = match url.host() {
            Some(host) => host,
            None => return Err(deny("URL has no host".to_string())),
        };
        let host_key = host_key(&host);

        if !self.allowed_hosts.contains(&host_key) {
            return Err(deny(format!("host '{}' is not in the allowlist", host_key)));
        }

        match host {
            Host::Ipv4(ip) => return self.check_literal(IpAddr::V4(ip), deny),
            Host::Ipv6(ip) => return self.check_literal(IpAddr::V6(ip), deny),
            Host::Domain(_) => {}
        }

        if self.denied_hosts.contains(&host_key) {
            return Err(deny(format!("host '{}' is denylisted", host_key)));
        }

        resolve_and_check(self.resolver.as_ref(), &host_key, url.as_str()).await
    }

    fn check_literal(
        &self,
        ip: IpAddr,
        deny: impl Fn(String) -> CourierError,
    ) -> Result<Vec<IpAddr>, CourierError> {
        if is_private_ip(&ip) {
            return Err(deny("literal private or reserved address".to_string()));
        }
        Ok(Vec::new())
    }

    /// True when the host appears in the allowlist.
    pub fn is_allowed_host(&self, host: &str) -> bool {
        self.allowed_hosts.contains(&host.to_lowercase())
    }
}

fn normalize_hosts<I>(hosts: I) -> HashSet<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    hosts
        .into_iter()
        .map(|h| h.as_ref().trim().trim_end_matches('.').to_lowercase())
        .filter(|h| !h.is_empty())
        .collect()
}

fn host_key(host: &Host<&str>) -> String {
    match host {
        Host::Domain(domain) => domain.trim_end_matches('.').to_lowercase(),
        Host::Ipv4(ip) => ip.to_string(),
        Host::Ipv6(ip) => ip.to_string(),
    }
}
