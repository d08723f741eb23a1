// ABOUTME: Hostname resolution guard that rejects hosts resolving to any private address.
// ABOUTME: Defines the Resolver seam with system and static implementations.

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CourierError;
use crate::ip::is_private_ip;

/// Address family for a single lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    fn matches(&self, ip: &IpAddr) -> bool {
        match self {
            AddressFamily::V4 => ip.is_ipv4(),
            AddressFamily::V6 => ip.is_ipv6(),
        }
    }
}

/// DNS lookup abstraction so the guard can be driven by a test double.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Return every address of the given family the host currently resolves to.
    async fn lookup(&self, host: &str, family: AddressFamily) -> io::Result<Vec<IpAddr>>;

    /// Look up both families, IPv4 first. The default issues the two lookups
    /// concurrently; implementations that get both from one query should override it.
    async fn lookup_both(&self, host: &str) -> (io::Result<Vec<IpAddr>>, io::Result<Vec<IpAddr>>) {
        tokio::join!(
            self.lookup(host, AddressFamily::V4),
            self.lookup(host, AddressFamily::V6)
        )
    }
}

/// Resolver backed by the operating system, bounded by a per-lookup timeout.
#[derive(Debug, Clone)]
pub struct SystemResolver {
    timeout: Duration,
}

impl SystemResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl SystemResolver {
    async fn lookup_any(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::time::timeout(self.timeout, tokio::net::lookup_host((host, 443)))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "DNS lookup timed out"))??;
        let mut ips: Vec<IpAddr> = Vec::new();
        for ip in addrs.map(|sa| sa.ip()) {
            if !ips.contains(&ip) {
                ips.push(ip);
            }
        }
        Ok(ips)
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup(&self, host: &str, family: AddressFamily) -> io::Result<Vec<IpAddr>> {
        let ips = self.lookup_any(host).await?;
        Ok(ips.into_iter().filter(|ip| family.matches(ip)).collect())
    }

    /// getaddrinfo answers for both families at once, so one query serves both.
    async fn lookup_both(&self, host: &str) -> (io::Result<Vec<IpAddr>>, io::Result<Vec<IpAddr>>) {
        match self.lookup_any(host).await {
            Ok(ips) => {
                let (v4, v6): (Vec<IpAddr>, Vec<IpAddr>) =
                    ips.into_iter().partition(|ip| ip.is_ipv4());
                (Ok(v4), Ok(v6))
            }
            Err(e) => {
                let kind = e.kind();
                let message = e.to_string();
                (Err(e), Err(io::Error::new(kind, message)))
            }
        }
    }
}

/// Resolver that answers from a fixed table. Unknown hosts fail to resolve.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    answers: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the addresses a host resolves to.
    pub fn with_host(mut self, host: impl Into<String>, ips: &[&str]) -> Self {
        let parsed = ips.iter().filter_map(|ip| ip.parse().ok()).collect();
        self.answers.insert(host.into().to_lowercase(), parsed);
        self
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn lookup(&self, host: &str, family: AddressFamily) -> io::Result<Vec<IpAddr>> {
        match self.answers.get(&host.to_lowercase()) {
            Some(ips) => Ok(ips.iter().copied().filter(|ip| family.matches(ip)).collect()),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no answer for {}", host),
            )),
        }
    }
}

/// Resolve both address families and reject the host if any answer is private.
///
/// A failed lookup for one family counts as "no addresses of that family". Zero
/// addresses overall is a rejection. Results are never cached: every call performs
/// fresh lookups so a rebinding resolver cannot reuse an earlier safe answer.
///
/// On success returns the full set of resolved addresses.
pub async fn resolve_and_check(
    resolver: &dyn Resolver,
    host: &str,
    url: &str,
) -> Result<Vec<IpAddr>, CourierError> {
    let (v4, v6) = resolver.lookup_both(host).await;

    let mut resolved = Vec::new();
    for (family, result) in [(AddressFamily::V4, v4), (AddressFamily::V6, v6)] {
        match result {
            Ok(ips) => resolved.extend(ips),
            Err(e) => {
                tracing::debug!(host = %host, ?family, error = %e, "DNS lookup failed for family");
            }
        }
    }

    if resolved.is_empty() {
        tracing::warn!(host = %host, "hostname resolved to no addresses");
        return Err(CourierError::policy(
            url,
            "Resolve",
            Some(anyhow::anyhow!("hostname did not resolve to any address")),
        ));
    }

    let private: Vec<IpAddr> = resolved.iter().copied().filter(is_private_ip).collect();
    if !private.is_empty() {
        // Private members go to internal logs only.
        tracing::warn!(host = %host, private = ?private, "hostname resolves to private address");
        return Err(CourierError::policy(
            url,
            "Resolve",
            Some(anyhow::anyhow!(
                "hostname resolves to a private or reserved address"
            )),
        ));
    }

    Ok(resolved)
}
