// ABOUTME: Tunables for the image courier (Options) and the fluent MigratorBuilder.
// ABOUTME: build() validates the configuration and wires policy, fetcher, store, and transport.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::TtlCache;
use crate::error::{CourierError, ErrorCode};
use crate::fetcher::{SecureFetcher, DEFAULT_MAX_HOPS};
use crate::migrate::Migrator;
use crate::policy::UrlPolicy;
use crate::probe::ContentRules;
use crate::resolve::{Resolver, SystemResolver};
use crate::store::LocalStore;
use crate::transport::{ReqwestTransport, Transport};

/// Image provider hosts trusted by default. Each endpoint is listed exactly.
pub const DEFAULT_ALLOWED_HOSTS: &[&str] = &[
    "oaidalleapiprodscus.blob.core.windows.net",
    "dalleproduse.blob.core.windows.net",
];

/// Hostnames rejected even if they appear in the allowlist.
pub const DEFAULT_DENIED_HOSTS: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "ip6-localhost",
    "ip6-loopback",
    "metadata",
    "metadata.google.internal",
    "metadata.goog",
    "instance-data",
    "instance-data.ec2.internal",
];

pub const DEFAULT_MIME_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/jpg",
    "image/webp",
    "image/gif",
];

pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Configuration for a [`Migrator`].
#[derive(Debug, Clone)]
pub struct Options {
    pub allowed_hosts: Vec<String>,
    pub denied_hosts: Vec<String>,
    pub allowed_mime_types: Vec<String>,
    /// Ceiling on bytes actually received, and on any declared Content-Length.
    pub max_bytes: u64,
    /// Overall deadline for one download, covering DNS, connect, headers, and body.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub dns_timeout: Duration,
    /// Requests one fetch may issue, counting the first.
    pub max_redirects: usize,
    pub image_root: PathBuf,
    pub file_prefix: String,
    pub public_prefix: String,
    pub user_agent: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            allowed_hosts: DEFAULT_ALLOWED_HOSTS.iter().map(|s| s.to_string()).collect(),
            denied_hosts: DEFAULT_DENIED_HOSTS.iter().map(|s| s.to_string()).collect(),
            allowed_mime_types: DEFAULT_MIME_TYPES.iter().map(|s| s.to_string()).collect(),
            max_bytes: DEFAULT_MAX_BYTES,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            dns_timeout: Duration::from_secs(5),
            max_redirects: DEFAULT_MAX_HOPS,
            image_root: PathBuf::from("./public/recipe-images"),
            file_prefix: "recipe".to_string(),
            public_prefix: "/recipe-images".to_string(),
            user_agent: format!("pantry-courier/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Options {
    /// Reject configurations that could never migrate anything safely.
    pub fn validate(&self) -> Result<(), CourierError> {
        let invalid = |msg: String| Err(CourierError::config("Options", Some(anyhow::anyhow!(msg))));

        if self.allowed_hosts.iter().all(|h| h.trim().is_empty()) {
            return invalid("allowed_hosts is empty".to_string());
        }
        if let Some(host) = self
            .allowed_hosts
            .iter()
            .find(|h| h.starts_with('.') || h.starts_with("*.") || h.contains('/'))
        {
            return invalid(format!("allowed host {:?} must be an exact hostname", host));
        }
        if self.allowed_mime_types.is_empty() {
            return invalid("allowed_mime_types is empty".to_string());
        }
        if self.max_bytes == 0 {
            return invalid("max_bytes must be positive".to_string());
        }
        if self.timeout.is_zero() || self.connect_timeout.is_zero() || self.dns_timeout.is_zero() {
            return invalid("timeouts must be positive".to_string());
        }
        if self.max_redirects == 0 {
            return invalid("max_redirects must allow at least one request".to_string());
        }
        if self.user_agent.trim().is_empty() {
            return invalid("user_agent is empty".to_string());
        }
        Ok(())
    }
}

/// Builder for [`Migrator`] instances.
///
/// The resolver and transport default to the system resolver and a reqwest transport;
/// tests swap them for doubles.
#[derive(Default)]
pub struct MigratorBuilder {
    opts: Options,
    resolver: Option<Arc<dyn Resolver>>,
    transport: Option<Arc<dyn Transport>>,
    failures: Option<Arc<TtlCache<String, ErrorCode>>>,
}

impl MigratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing set of options.
    pub fn from_options(opts: Options) -> Self {
        Self {
            opts,
            ..Self::default()
        }
    }

    pub fn allowed_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.opts.allowed_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    pub fn denied_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.opts.denied_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    pub fn allowed_mime_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.opts.allowed_mime_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn max_bytes(mut self, max_bytes: u64) -> Self {
        self.opts.max_bytes = max_bytes;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.opts.timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.opts.connect_timeout = timeout;
        self
    }

    pub fn dns_timeout(mut self, timeout: Duration) -> Self {
        self.opts.dns_timeout = timeout;
        self
    }

    pub fn max_redirects(mut self, hops: usize) -> Self {
        self.opts.max_redirects = hops;
        self
    }

    pub fn image_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.opts.image_root = root.into();
        self
    }

    pub fn file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.opts.file_prefix = prefix.into();
        self
    }

    pub fn public_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.opts.public_prefix = prefix.into();
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.opts.user_agent = user_agent.into();
        self
    }

    /// Use a custom DNS resolver.
    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Use a custom transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Remember failed URLs in `cache` and skip them until their entry expires.
    pub fn failure_backoff(mut self, cache: Arc<TtlCache<String, ErrorCode>>) -> Self {
        self.failures = Some(cache);
        self
    }

    /// Convenience for [`failure_backoff`](Self::failure_backoff) with a fresh cache.
    pub fn failure_backoff_for(self, capacity: NonZeroUsize, ttl: Duration) -> Self {
        self.failure_backoff(Arc::new(TtlCache::new(capacity, ttl)))
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    /// Validate the options and assemble the pipeline.
    pub fn build(self) -> Result<Migrator, CourierError> {
        let opts = self.opts;
        opts.validate()?;

        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(SystemResolver::new(opts.dns_timeout)));
        let transport = match self.transport {
            Some(t) => t,
            None => Arc::new(
                ReqwestTransport::new(opts.user_agent.clone(), opts.connect_timeout)
                    .map_err(|e| CourierError::config("Build", Some(e)))?,
            ),
        };

        let policy = Arc::new(UrlPolicy::new(
            &opts.allowed_hosts,
            &opts.denied_hosts,
            resolver,
        ));
        let fetcher = SecureFetcher::new(policy, transport, opts.max_redirects);
        let rules = ContentRules::new(&opts.allowed_mime_types, opts.max_bytes);
        let store = LocalStore::new(
            opts.image_root.clone(),
            opts.file_prefix.clone(),
            opts.public_prefix.clone(),
        )?;

        Ok(Migrator::from_parts(fetcher, rules, store, opts.timeout, self.failures))
    }
}

impl std::fmt::Debug for MigratorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigratorBuilder")
            .field("opts", &self.opts)
            .field("custom_resolver", &self.resolver.is_some())
            .field("custom_transport", &self.transport.is_some())
            .field("failure_backoff", &self.failures.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::StaticResolver;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let opts = Options::default();
        assert_eq!(opts.allowed_hosts.len(), 2);
        assert_eq!(opts.max_bytes, 10 * 1024 * 1024);
        assert_eq!(opts.max_redirects, 5);
        assert_eq!(opts.timeout, Duration::from_secs(30));
        assert_eq!(opts.public_prefix, "/recipe-images");
        assert!(opts.user_agent.starts_with("pantry-courier/"));
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_broken_config() {
        let cases: Vec<Box<dyn Fn(&mut Options)>> = vec![
            Box::new(|o| o.allowed_hosts.clear()),
            Box::new(|o| o.allowed_hosts = vec![" ".into()]),
            Box::new(|o| o.allowed_hosts = vec![".windows.net".into()]),
            Box::new(|o| o.allowed_hosts = vec!["*.windows.net".into()]),
            Box::new(|o| o.allowed_mime_types.clear()),
            Box::new(|o| o.max_bytes = 0),
            Box::new(|o| o.timeout = Duration::ZERO),
            Box::new(|o| o.max_redirects = 0),
            Box::new(|o| o.user_agent = String::new()),
        ];
        for (i, mutate) in cases.iter().enumerate() {
            let mut opts = Options::default();
            mutate(&mut opts);
            let err = opts.validate().expect_err(&format!("case {} should fail", i));
            assert!(err.is_invalid_config(), "case {}", i);
        }
    }

    #[test]
    fn test_builder_rejects_bad_prefix() {
        let err = MigratorBuilder::new()
            .resolver(Arc::new(StaticResolver::new()))
            .file_prefix("../escape")
            .build()
            .unwrap_err();
        assert!(err.is_invalid_config());
    }

    #[test]
    fn test_builder_applies_settings() {
        let builder = MigratorBuilder::new()
            .allowed_hosts(["img.example"])
            .max_bytes(1234)
            .max_redirects(2)
            .image_root("/tmp/images");
        assert_eq!(builder.options().allowed_hosts, vec!["img.example".to_string()]);
        assert_eq!(builder.options().max_bytes, 1234);
        assert_eq!(builder.options().max_redirects, 2);
        assert_eq!(builder.options().image_root, PathBuf::from("/tmp/images"));
    }
}
