// ABOUTME: Migration orchestrator that moves an externally hosted image into the local store.
// ABOUTME: Runs validate, probe, download, and placement, then reports the new path to the caller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;
use url::Url;

use crate::cache::TtlCache;
use crate::download::download;
use crate::error::{CourierError, ErrorCode};
use crate::fetcher::SecureFetcher;
use crate::options::MigratorBuilder;
use crate::policy::ValidationVerdict;
use crate::probe::{probe, ContentRules, ProbeResult};
use crate::redact_url;
use crate::store::{extension_for, EntityId, LocalStore, Placement};

/// Persists the new local path for an entity. The courier never touches storage itself.
#[async_trait]
pub trait RecordUpdater: Send + Sync {
    async fn update(&self, entity: EntityId, local_path: &str) -> Result<(), anyhow::Error>;
}

#[async_trait]
impl<F, Fut> RecordUpdater for F
where
    F: Fn(EntityId, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), anyhow::Error>> + Send,
{
    async fn update(&self, entity: EntityId, local_path: &str) -> Result<(), anyhow::Error> {
        (self)(entity, local_path.to_string()).await
    }
}

/// How a stored image value should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredUrl<'a> {
    /// Null or blank.
    Empty,
    /// A rooted local path; nothing to do.
    Local(&'a str),
    /// Anything else, to be validated and migrated.
    External(&'a str),
}

/// Result of one migration attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MigrationOutcome {
    /// Input was empty or already local and is returned as-is.
    Skipped { value: Option<String> },
    Migrated { local_path: String, bytes: u64 },
    /// The original value is still valid; a later attempt may succeed.
    Failed {
        original: String,
        code: ErrorCode,
        reason: String,
    },
}

impl MigrationOutcome {
    /// The value the caller should keep for the entity's image.
    pub fn into_value(self) -> Option<String> {
        match self {
            MigrationOutcome::Skipped { value } => value,
            MigrationOutcome::Migrated { local_path, .. } => Some(local_path),
            MigrationOutcome::Failed { original, .. } => Some(original),
        }
    }

    pub fn is_migrated(&self) -> bool {
        matches!(self, MigrationOutcome::Migrated { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, MigrationOutcome::Failed { .. })
    }
}

/// Coordinates the full pipeline for one stored URL at a time. Cheap to share behind an
/// `Arc`; concurrent calls hold no common mutable state apart from the optional backoff.
pub struct Migrator {
    fetcher: SecureFetcher,
    rules: ContentRules,
    store: LocalStore,
    timeout: Duration,
    failures: Option<Arc<TtlCache<String, ErrorCode>>>,
}

impl Migrator {
    pub fn builder() -> MigratorBuilder {
        MigratorBuilder::new()
    }

    pub(crate) fn from_parts(
        fetcher: SecureFetcher,
        rules: ContentRules,
        store: LocalStore,
        timeout: Duration,
        failures: Option<Arc<TtlCache<String, ErrorCode>>>,
    ) -> Self {
        Self {
            fetcher,
            rules,
            store,
            timeout,
            failures,
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn rules(&self) -> &ContentRules {
        &self.rules
    }

    /// Classify a stored value without any I/O.
    pub fn classify<'a>(&self, stored: Option<&'a str>) -> StoredUrl<'a> {
        match stored.map(str::trim) {
            None | Some("") => StoredUrl::Empty,
            Some(s) if self.store.is_local(s) || (s.starts_with('/') && !s.starts_with("//")) => {
                StoredUrl::Local(s)
            }
            Some(s) => StoredUrl::External(s),
        }
    }

    /// Run only the URL policy against `url`.
    pub async fn validate(&self, url: &str) -> ValidationVerdict {
        self.fetcher.policy().validate(url).await
    }

    /// Run only the metadata probe against `url`, bounded by the overall timeout.
    pub async fn probe(&self, url: &str) -> Result<ProbeResult, CourierError> {
        tokio::time::timeout(self.timeout, probe(&self.fetcher, &self.rules, url))
            .await
            .unwrap_or_else(|_| {
                Err(CourierError::timeout(
                    url,
                    "Probe",
                    Some(anyhow::anyhow!("exceeded {}ms deadline", self.timeout.as_millis())),
                ))
            })
    }

    /// Migrate `stored` if it is external, reporting what happened.
    ///
    /// Never fails: every error is logged and surfaced as [`MigrationOutcome::Failed`]
    /// with the original value intact.
    pub async fn migrate(
        &self,
        stored: Option<&str>,
        entity: EntityId,
        updater: &dyn RecordUpdater,
    ) -> MigrationOutcome {
        let url = match self.classify(stored) {
            StoredUrl::Empty => {
                return MigrationOutcome::Skipped {
                    value: stored.map(str::to_string),
                }
            }
            StoredUrl::Local(_) => {
                tracing::debug!(entity_id = %entity, "image already local");
                return MigrationOutcome::Skipped {
                    value: stored.map(str::to_string),
                };
            }
            StoredUrl::External(url) => url,
        };
        let original = stored.unwrap_or(url).to_string();

        if let Some(code) = self.failures.as_ref().and_then(|c| c.get(&original)) {
            tracing::debug!(entity_id = %entity, url = %redact_url(url), %code, "skipping recently failed url");
            return MigrationOutcome::Failed {
                original,
                code,
                reason: format!("{}: failed recently, backing off", code),
            };
        }

        match self.run(url, entity, updater).await {
            Ok((local_path, bytes)) => {
                tracing::info!(entity_id = %entity, bytes, local_path = %local_path, "image migrated");
                if let Some(cache) = &self.failures {
                    cache.remove(&original);
                }
                MigrationOutcome::Migrated { local_path, bytes }
            }
            Err(err) => {
                log_failure(entity, &err);
                if let Some(cache) = &self.failures {
                    cache.insert(original.clone(), err.code);
                }
                MigrationOutcome::Failed {
                    original,
                    code: err.code,
                    reason: err.reason(),
                }
            }
        }
    }

    /// Return the value the caller should keep: the new local path on success, otherwise
    /// the input unchanged.
    pub async fn migrate_if_external(
        &self,
        stored: Option<&str>,
        entity: EntityId,
        updater: &dyn RecordUpdater,
    ) -> Option<String> {
        self.migrate(stored, entity, updater).await.into_value()
    }

    async fn run(
        &self,
        url: &str,
        entity: EntityId,
        updater: &dyn RecordUpdater,
    ) -> Result<(String, u64), CourierError> {
        // One deadline covers validation, the probe, and the download. The updater runs
        // outside it so a placed file is never abandoned mid-update.
        let deadline = Instant::now() + self.timeout;
        let fetched = tokio::time::timeout_at(deadline, self.fetch_into_store(url, entity, deadline))
            .await
            .unwrap_or_else(|_| {
                tracing::warn!(url = %redact_url(url), timeout_ms = self.timeout.as_millis() as u64, "migration timed out");
                Err(CourierError::timeout(
                    url,
                    "Migrate",
                    Some(anyhow::anyhow!("exceeded {}ms deadline", self.timeout.as_millis())),
                ))
            });
        let (placement, bytes) = fetched?;

        if let Err(e) = updater.update(entity, &placement.local_path).await {
            if let Err(rm) = tokio::fs::remove_file(&placement.file_path).await {
                tracing::warn!(path = %placement.file_path.display(), error = %rm, "failed to remove placed file");
            }
            return Err(CourierError::storage(
                url,
                "UpdateRecord",
                Some(e.context("record updater failed")),
            ));
        }

        Ok((placement.local_path, bytes))
    }

    async fn fetch_into_store(
        &self,
        url: &str,
        entity: EntityId,
        deadline: Instant,
    ) -> Result<(Placement, u64), CourierError> {
        let parsed = Url::parse(url).map_err(|e| {
            CourierError::policy(url, "Migrate", Some(anyhow::anyhow!("invalid URL: {}", e)))
        })?;
        self.fetcher.policy().check(&parsed).await?;

        let declared = probe(&self.fetcher, &self.rules, url).await?;

        let extension = extension_for(declared.content_type.as_deref(), url);
        let placement = self.store.place(entity, extension);

        let downloaded = download(
            &self.fetcher,
            &self.rules,
            url,
            &placement.file_path,
            deadline.saturating_duration_since(Instant::now()),
        )
        .await?;

        if let Some(declared_len) = declared.content_length {
            if declared_len != downloaded.bytes_written {
                tracing::info!(
                    entity_id = %entity,
                    declared = declared_len,
                    written = downloaded.bytes_written,
                    "downloaded size differs from probe"
                );
            }
        }

        Ok((placement, downloaded.bytes_written))
    }
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("rules", &self.rules)
            .field("store", &self.store)
            .field("timeout", &self.timeout)
            .field("failure_backoff", &self.failures.is_some())
            .finish_non_exhaustive()
    }
}

fn log_failure(entity: EntityId, err: &CourierError) {
    let url = err.url.as_str();
    match err.code {
        ErrorCode::PolicyViolation => {
            tracing::warn!(entity_id = %entity, url, reason = %err.reason(), "image rejected by policy")
        }
        ErrorCode::ProbeRejected => {
            tracing::info!(entity_id = %entity, url, reason = %err.reason(), "image rejected by probe")
        }
        _ => tracing::warn!(entity_id = %entity, url, code = %err.code, reason = %err.reason(), "image migration failed"),
    }
}
