// ABOUTME: Streaming downloader that enforces a byte ceiling on observed data and a deadline.
// ABOUTME: Writes to a hidden temp file and renames on success; failures leave nothing behind.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Method;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::error::CourierError;
use crate::fetcher::SecureFetcher;
use crate::probe::ContentRules;
use crate::transport::BodyStream;

/// Result of a completed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downloaded {
    pub bytes_written: u64,
    /// Media type the GET response declared, if any.
    pub content_type: Option<String>,
    pub final_url: Url,
}

/// Errors surfaced by a governed body stream.
#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error("failed to read body: {0}")]
    Read(anyhow::Error),
    #[error("body exceeded {limit} bytes (saw at least {seen})")]
    TooLarge { limit: u64, seen: u64 },
}

/// Counts bytes as they arrive and trips once the running total passes the limit.
#[derive(Debug, Clone)]
pub struct SizeGovernor {
    limit: u64,
    seen: u64,
}

impl SizeGovernor {
    pub fn new(limit: u64) -> Self {
        Self { limit, seen: 0 }
    }

    /// Account for a chunk before it is written anywhere.
    pub fn admit(&mut self, len: usize) -> Result<(), BodyError> {
        self.seen = self.seen.saturating_add(len as u64);
        if self.seen > self.limit {
            return Err(BodyError::TooLarge {
                limit: self.limit,
                seen: self.seen,
            });
        }
        Ok(())
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }
}

/// Wrap a body so that it yields an error, and then ends, as soon as more than
/// `limit` bytes have been observed.
pub fn governed(body: BodyStream, limit: u64) -> impl Stream<Item = Result<Bytes, BodyError>> + Send {
    body.scan(
        (SizeGovernor::new(limit), false),
        |(governor, tripped), chunk| {
            if *tripped {
                return futures::future::ready(None);
            }
            let item = match chunk {
                Ok(bytes) => governor.admit(bytes.len()).map(|()| bytes),
                Err(e) => Err(BodyError::Read(e)),
            };
            *tripped = item.is_err();
            futures::future::ready(Some(item))
        },
    )
}

/// Removes the file at `path` when dropped unless committed.
struct PartialFile {
    path: PathBuf,
    committed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %e, "failed to remove partial file");
                }
            }
        }
    }
}

static ATTEMPTS: AtomicU64 = AtomicU64::new(0);

/// Hidden sibling of `dest` used while bytes are in flight.
///
/// Every call returns a fresh name, so concurrent downloads to the same `dest` never
/// share a temp file.
pub fn partial_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let attempt = ATTEMPTS.fetch_add(1, Ordering::Relaxed);
    dest.with_file_name(format!(".{}.{}-{}.part", name, std::process::id(), attempt))
}

/// Download `url` to `dest` with the size ceiling from `rules` and an overall deadline
/// covering DNS, connect, headers, and the full body.
///
/// On any failure, including the deadline firing, nothing is left at `dest` or at its
/// temp path.
pub async fn download(
    fetcher: &SecureFetcher,
    rules: &ContentRules,
    url: &str,
    dest: &Path,
    timeout: Duration,
) -> Result<Downloaded, CourierError> {
    match tokio::time::timeout(timeout, download_inner(fetcher, rules, url, dest)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(url = %crate::redact_url(url), timeout_ms = timeout.as_millis() as u64, "download timed out");
            Err(CourierError::timeout(
                url,
                "Download",
                Some(anyhow::anyhow!("exceeded {}ms deadline", timeout.as_millis())),
            ))
        }
    }
}

async fn download_inner(
    fetcher: &SecureFetcher,
    rules: &ContentRules,
    url: &str,
    dest: &Path,
) -> Result<Downloaded, CourierError> {
    let fetched = fetcher.fetch(Method::GET, url).await?;
    let response = fetched.response;

    if !response.status.is_success() {
        return Err(CourierError::transfer(
            url,
            "Download",
            Some(anyhow::anyhow!("HTTP status {}", response.status.as_u16())),
        ));
    }
    let content_type = response.media_type();
    if let Some(ref media_type) = content_type {
        if !rules.allows(media_type) {
            return Err(CourierError::probe(
                url,
                "Download",
                Some(anyhow::anyhow!("content type {} is not allowed", media_type)),
            ));
        }
    }
    if let Some(len) = response.content_length() {
        if len > rules.max_bytes {
            return Err(CourierError::transfer(
                url,
                "Download",
                Some(anyhow::anyhow!(
                    "declared length {} exceeds limit {}",
                    len,
                    rules.max_bytes
                )),
            ));
        }
    }

    if let Some(dir) = dest.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| CourierError::storage(url, "Download", Some(e.into())))?;
    }

    let temp = partial_path(dest);
    let guard = PartialFile::new(temp.clone());
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp)
        .await
        .map_err(|e| CourierError::storage(url, "Download", Some(e.into())))?;

    let mut body = Box::pin(governed(response.body, rules.max_bytes));
    let mut written: u64 = 0;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| {
            tracing::warn!(url = %crate::redact_url(url), error = %e, "download aborted");
            CourierError::transfer(url, "Download", Some(e.into()))
        })?;
        file.write_all(&chunk)
            .await
            .map_err(|e| CourierError::storage(url, "Download", Some(e.into())))?;
        written += chunk.len() as u64;
    }

    file.flush()
        .await
        .map_err(|e| CourierError::storage(url, "Download", Some(e.into())))?;
    file.sync_all()
        .await
        .map_err(|e| CourierError::storage(url, "Download", Some(e.into())))?;
    drop(file);

    tokio::fs::rename(&temp, dest)
        .await
        .map_err(|e| CourierError::storage(url, "Download", Some(e.into())))?;
    guard.commit();

    tracing::debug!(url = %crate::redact_url(url), bytes = written, path = %dest.display(), "download complete");

    Ok(Downloaded {
        bytes_written: written,
        content_type,
        final_url: fetched.final_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(chunks: Vec<&'static [u8]>) -> BodyStream {
        futures::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c)))).boxed()
    }

    #[test]
    fn test_governor_trips_past_limit() {
        let mut governor = SizeGovernor::new(10);
        assert!(governor.admit(6).is_ok());
        assert!(governor.admit(4).is_ok());
        assert_eq!(governor.seen(), 10);
        assert!(matches!(
            governor.admit(1),
            Err(BodyError::TooLarge { limit: 10, seen: 11 })
        ));
    }

    #[tokio::test]
    async fn test_governed_passes_small_body() {
        let chunks: Vec<_> = governed(body(vec![b"abc", b"def"]), 6).collect().await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.is_ok()));
    }

    #[tokio::test]
    async fn test_governed_stops_endless_body() {
        let endless = futures::stream::repeat_with(|| Ok(Bytes::from_static(&[7u8; 64]))).boxed();
        let items: Vec<_> = governed(endless, 1000).collect().await;
        // 15 chunks fit (960 bytes), the 16th trips the governor, then the stream ends.
        assert_eq!(items.len(), 16);
        assert!(matches!(items.last(), Some(Err(BodyError::TooLarge { .. }))));
    }

    #[tokio::test]
    async fn test_governed_propagates_read_errors() {
        let failing = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"ok")),
            Err(anyhow::anyhow!("connection reset")),
        ])
        .boxed();
        let items: Vec<_> = governed(failing, 100).collect().await;
        assert!(matches!(items.last(), Some(Err(BodyError::Read(_)))));
    }

    #[test]
    fn test_partial_path_is_unique_hidden_sibling() {
        let dest = Path::new("/srv/images/recipe-42.png");
        let first = partial_path(dest);
        let second = partial_path(dest);

        assert_ne!(first, second);
        for temp in [&first, &second] {
            assert_eq!(temp.parent(), dest.parent());
            let name = temp.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.starts_with(".recipe-42.png."), "{name}");
            assert!(name.ends_with(".part"), "{name}");
        }
    }

    #[test]
    fn test_partial_file_removed_unless_committed() {
        let dir = tempfile::TempDir::new().unwrap();
        let dropped = dir.path().join("dropped.part");
        let kept = dir.path().join("kept.part");
        std::fs::write(&dropped, b"x").unwrap();
        std::fs::write(&kept, b"x").unwrap();

        drop(PartialFile::new(dropped.clone()));
        PartialFile::new(kept.clone()).commit();

        assert!(!dropped.exists());
        assert!(kept.exists());
    }
}
