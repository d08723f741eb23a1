// ABOUTME: Command-line configuration shared by the courier and pantry-cli binaries.
// ABOUTME: Maps clap flags with PANTRY_* environment fallbacks onto Options and sets up logging.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::options::{Options, DEFAULT_MAX_BYTES};

/// Tunables exposed as flags. Unset list flags keep the built-in defaults.
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Directory migrated images are written to
    #[arg(long, env = "PANTRY_IMAGE_ROOT", default_value = "./public/recipe-images")]
    pub image_root: PathBuf,

    /// Public path prefix recorded for migrated images
    #[arg(long, env = "PANTRY_PUBLIC_PREFIX", default_value = "/recipe-images")]
    pub public_prefix: String,

    /// Filename prefix, as in <prefix>-<id>.<ext>
    #[arg(long, env = "PANTRY_FILE_PREFIX", default_value = "recipe")]
    pub file_prefix: String,

    /// Exact hostnames images may be fetched from (comma-separated)
    #[arg(long = "allowed-host", env = "PANTRY_ALLOWED_HOSTS", value_delimiter = ',')]
    pub allowed_hosts: Vec<String>,

    /// Extra hostnames refused even if allowlisted, on top of the built-in list (comma-separated)
    #[arg(long = "denied-host", env = "PANTRY_DENIED_HOSTS", value_delimiter = ',')]
    pub denied_hosts: Vec<String>,

    /// Image media types accepted (comma-separated)
    #[arg(long = "allowed-mime-type", env = "PANTRY_ALLOWED_MIME_TYPES", value_delimiter = ',')]
    pub allowed_mime_types: Vec<String>,

    /// Largest image accepted, in bytes
    #[arg(long, env = "PANTRY_MAX_BYTES", default_value_t = DEFAULT_MAX_BYTES)]
    pub max_bytes: u64,

    /// Overall deadline per migration in seconds
    #[arg(long, env = "PANTRY_TIMEOUT_SECS", default_value_t = 30)]
    pub timeout_secs: u64,

    /// Requests allowed per fetch, including redirects
    #[arg(long, env = "PANTRY_MAX_REDIRECTS", default_value_t = 5)]
    pub max_redirects: usize,
}

impl ConfigArgs {
    pub fn to_options(&self) -> Options {
        let mut opts = Options {
            image_root: self.image_root.clone(),
            public_prefix: self.public_prefix.clone(),
            file_prefix: self.file_prefix.clone(),
            max_bytes: self.max_bytes,
            timeout: Duration::from_secs(self.timeout_secs),
            max_redirects: self.max_redirects,
            ..Options::default()
        };
        if let Some(hosts) = non_empty(&self.allowed_hosts) {
            opts.allowed_hosts = hosts;
        }
        if let Some(hosts) = non_empty(&self.denied_hosts) {
            opts.denied_hosts.extend(hosts);
        }
        if let Some(types) = non_empty(&self.allowed_mime_types) {
            opts.allowed_mime_types = types;
        }
        opts
    }
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    let kept: Vec<String> = values
        .iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    (!kept.is_empty()).then_some(kept)
}

/// Install a stderr fmt subscriber honoring RUST_LOG, defaulting to `info`.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // A second install (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        config: ConfigArgs,
    }

    #[test]
    fn test_flags_map_onto_options() {
        let cli = TestCli::parse_from([
            "test",
            "--allowed-host",
            "a.example,b.example",
            "--max-bytes",
            "2048",
            "--timeout-secs",
            "7",
            "--image-root",
            "/srv/img",
        ]);
        let opts = cli.config.to_options();
        assert_eq!(opts.allowed_hosts, vec!["a.example".to_string(), "b.example".to_string()]);
        assert_eq!(opts.max_bytes, 2048);
        assert_eq!(opts.timeout, Duration::from_secs(7));
        assert_eq!(opts.image_root, PathBuf::from("/srv/img"));
    }

    #[test]
    fn test_missing_hosts_keep_defaults() {
        let cli = TestCli::parse_from(["test"]);
        let opts = cli.config.to_options();
        assert_eq!(opts.allowed_hosts, Options::default().allowed_hosts);
        assert_eq!(opts.denied_hosts, Options::default().denied_hosts);
        assert_eq!(opts.allowed_mime_types, Options::default().allowed_mime_types);
    }

    #[test]
    fn test_mime_types_replace_and_denied_hosts_extend_defaults() {
        let cli = TestCli::parse_from([
            "test",
            "--allowed-mime-type",
            "image/png, image/webp",
            "--denied-host",
            "internal.example",
        ]);
        let opts = cli.config.to_options();
        assert_eq!(
            opts.allowed_mime_types,
            vec!["image/png".to_string(), "image/webp".to_string()]
        );
        assert!(opts.denied_hosts.contains(&"internal.example".to_string()));
        assert!(opts.denied_hosts.contains(&"localhost".to_string()));
    }
}
