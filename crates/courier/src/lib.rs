// ABOUTME: Main library entry point for the Pantry image courier.
// ABOUTME: Re-exports the public API: Migrator, MigratorBuilder, Options, CourierError, ErrorCode, and the pipeline stages.

//! Pantry Courier - moves externally hosted images onto local storage without letting an
//! untrusted URL steer the server into its own network.
//!
//! Each migration validates the URL against an exact host allowlist and the addresses it
//! resolves to, follows redirects by hand so every hop is checked again, probes the
//! declared type and size, then streams the body to disk under a byte ceiling and a
//! deadline.
//!
//! # Example
//!
//! ```no_run
//! use pantry_courier::{EntityId, Migrator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), pantry_courier::CourierError> {
//!     let migrator = Migrator::builder().image_root("./public/recipe-images").build()?;
//!     let save = |id: EntityId, path: String| async move {
//!         println!("recipe {} now uses {}", id, path);
//!         Ok::<(), anyhow::Error>(())
//!     };
//!     let kept = migrator
//!         .migrate_if_external(
//!             Some("https://oaidalleapiprodscus.blob.core.windows.net/abc123"),
//!             EntityId(42),
//!             &save,
//!         )
//!         .await;
//!     println!("{:?}", kept);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cli;
pub mod download;
pub mod error;
pub mod fetcher;
pub mod ip;
pub mod migrate;
pub mod options;
pub mod policy;
pub mod probe;
pub mod resolve;
pub mod store;
pub mod transport;

pub use crate::cache::TtlCache;
pub use crate::download::{download, Downloaded, SizeGovernor};
pub use crate::error::{CourierError, ErrorCode};
pub use crate::fetcher::{Fetched, SecureFetcher};
pub use crate::ip::{is_private_ip, is_private_or_reserved};
pub use crate::migrate::{MigrationOutcome, Migrator, RecordUpdater, StoredUrl};
pub use crate::options::{MigratorBuilder, Options};
pub use crate::policy::{UrlPolicy, ValidationVerdict};
pub use crate::probe::{probe, ContentRules, ProbeResult};
pub use crate::resolve::{resolve_and_check, AddressFamily, Resolver, StaticResolver, SystemResolver};
pub use crate::store::{EntityId, LocalStore, Placement};
pub use crate::transport::{RawResponse, ReqwestTransport, Transport};

/// Result type alias for courier operations.
pub type Result<T> = std::result::Result<T, CourierError>;

/// Strip userinfo from a URL before it is logged or stored in an error.
///
/// Input that does not parse is returned unchanged.
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) if !parsed.username().is_empty() || parsed.password().is_some() => {
            // Both setters only fail for URLs that cannot carry credentials at all.
            let _ = parsed.set_username("");
            let _ = parsed.set_password(None);
            parsed.to_string()
        }
        _ => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_url() {
        assert_eq!(
            redact_url("https://user:pw@a.example/img.png?x=1"),
            "https://a.example/img.png?x=1"
        );
        assert_eq!(redact_url("https://a.example/img.png"), "https://a.example/img.png");
        assert_eq!(redact_url("not a url"), "not a url");
    }
}
