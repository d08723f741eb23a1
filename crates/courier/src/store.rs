// ABOUTME: Local content store that names and places downloaded images under a fixed root.
// ABOUTME: Filenames are <prefix>-<entity>.<ext>, reduced to a bare basename before use.

use std::fmt;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CourierError;

/// Extension used when neither the content type nor the URL says anything useful.
pub const DEFAULT_EXTENSION: &str = "png";

/// MIME type to file extension for every image type the store accepts.
const MIME_EXTENSIONS: &[(&str, &str)] = &[
    ("image/png", "png"),
    ("image/jpeg", "jpg"),
    ("image/jpg", "jpg"),
    ("image/pjpeg", "jpg"),
    ("image/webp", "webp"),
    ("image/gif", "gif"),
];

static URL_SUFFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\.(png|jpe?g|webp|gif)$").expect("valid suffix regex"));

/// Caller-owned stable identifier anchoring the stored filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EntityId {
    fn from(id: u64) -> Self {
        EntityId(id)
    }
}

/// Where a migrated image lives on disk and how it is addressed publicly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub file_name: String,
    /// Absolute or root-relative path to write to.
    pub file_path: PathBuf,
    /// Public path recorded by the caller, e.g. `/recipe-images/recipe-42.png`.
    pub local_path: String,
}

/// A fixed directory of migrated images.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
    prefix: String,
    public_prefix: String,
}

impl LocalStore {
    /// Create a store. `prefix` must be a plain filename fragment and `public_prefix`
    /// a rooted URL path such as `/recipe-images`.
    pub fn new(
        root: impl Into<PathBuf>,
        prefix: impl Into<String>,
        public_prefix: impl Into<String>,
    ) -> Result<Self, CourierError> {
        let prefix = prefix.into();
        let public_prefix = public_prefix.into().trim_end_matches('/').to_string();

        if prefix.is_empty() || sanitize_file_name(&prefix).as_deref() != Some(prefix.as_str()) {
            return Err(CourierError::config(
                "Store",
                Some(anyhow::anyhow!("file prefix {:?} is not a plain name", prefix)),
            ));
        }
        if !public_prefix.starts_with('/') || public_prefix.starts_with("//") || public_prefix.contains("..") {
            return Err(CourierError::config(
                "Store",
                Some(anyhow::anyhow!(
                    "public prefix {:?} must be a rooted path",
                    public_prefix
                )),
            ));
        }

        Ok(Self {
            root: root.into(),
            prefix,
            public_prefix,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn public_prefix(&self) -> &str {
        &self.public_prefix
    }

    /// Decide the target for `entity` with the given extension.
    ///
    /// The result is always a direct child of the root, whatever `extension` holds.
    pub fn place(&self, entity: EntityId, extension: &str) -> Placement {
        let stem = format!("{}-{}.", self.prefix, entity);
        let file_name = sanitize_file_name(&format!("{}{}", stem, extension))
            .filter(|name| {
                name.strip_prefix(&stem)
                    .is_some_and(|ext| !ext.is_empty() && !ext.contains('.'))
            })
            .unwrap_or_else(|| format!("{}{}", stem, DEFAULT_EXTENSION));

        Placement {
            file_path: self.root.join(&file_name),
            local_path: format!("{}/{}", self.public_prefix, file_name),
            file_name,
        }
    }

    /// True when a stored value already points into this store.
    pub fn is_local(&self, stored: &str) -> bool {
        let stored = stored.trim();
        stored
            .strip_prefix(&self.public_prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .is_some_and(|name| !name.is_empty() && !name.contains('/'))
    }

    /// Names of files in the root that belong to `entity`, including temp files.
    pub fn files_for(&self, entity: EntityId) -> std::io::Result<Vec<String>> {
        let stem = format!("{}-{}.", self.prefix, entity);
        let hidden = format!(".{}", stem);
        let mut names = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name.starts_with(&stem) || name.starts_with(&hidden) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Pick a file extension, preferring the validated content type and falling back to
/// the URL path suffix, then to [`DEFAULT_EXTENSION`].
pub fn extension_for(content_type: Option<&str>, url: &str) -> &'static str {
    if let Some(ext) = content_type.and_then(extension_for_mime) {
        return ext;
    }
    url_suffix_extension(url).unwrap_or(DEFAULT_EXTENSION)
}

/// Extension for a MIME type in the table, ignoring parameters and case.
pub fn extension_for_mime(content_type: &str) -> Option<&'static str> {
    let media_type = crate::transport::media_type(content_type)?;
    MIME_EXTENSIONS
        .iter()
        .find(|(mime, _)| *mime == media_type)
        .map(|(_, ext)| *ext)
}

fn url_suffix_extension(url: &str) -> Option<&'static str> {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.split(['?', '#']).next().unwrap_or_default().to_string());
    let caps = URL_SUFFIX_RE.captures(&path)?;
    match caps.get(1)?.as_str().to_lowercase().as_str() {
        "png" => Some("png"),
        "jpg" | "jpeg" => Some("jpg"),
        "webp" => Some("webp"),
        "gif" => Some("gif"),
        _ => None,
    }
}

/// Reduce a candidate to a bare, safe basename.
///
/// Keeps only the last path segment, drops leading dots, and removes every character
/// outside `[A-Za-z0-9._-]`. Returns None if nothing usable remains.
pub fn sanitize_file_name(candidate: &str) -> Option<String> {
    let last = candidate.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = last
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() || cleaned.contains("..") {
        None
    } else {
        Some(cleaned.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> LocalStore {
        LocalStore::new("/srv/public/recipe-images", "recipe", "/recipe-images").unwrap()
    }

    #[test]
    fn test_place_builds_expected_names() {
        let placement = store().place(EntityId(42), "png");
        assert_eq!(
            placement,
            Placement {
                file_name: "recipe-42.png".to_string(),
                file_path: PathBuf::from("/srv/public/recipe-images/recipe-42.png"),
                local_path: "/recipe-images/recipe-42.png".to_string(),
            }
        );
    }

    #[test]
    fn test_place_never_escapes_root() {
        let s = store();
        for ext in ["../../etc/passwd", "png/../../x", "..\\..\\boot.ini", "", "/", "p\0ng"] {
            let placement = s.place(EntityId(7), ext);
            assert_eq!(placement.file_path.parent(), Some(s.root()), "ext {ext:?}");
            assert!(placement.file_name.starts_with("recipe-7."), "ext {ext:?}");
            assert!(!placement.file_name.contains('/'));
        }
    }

    #[test]
    fn test_extension_prefers_content_type() {
        assert_eq!(extension_for(Some("image/jpeg"), "https://x/a.png"), "jpg");
        assert_eq!(extension_for(Some("IMAGE/WEBP; q=1"), "https://x/a"), "webp");
    }

    #[test]
    fn test_extension_falls_back_to_url_suffix() {
        assert_eq!(extension_for(None, "https://x/a/b.JPEG?sig=abc"), "jpg");
        assert_eq!(extension_for(None, "https://x/a/b.gif#frag"), "gif");
        assert_eq!(extension_for(Some("application/octet-stream"), "https://x/b.webp"), "webp");
    }

    #[test]
    fn test_extension_defaults() {
        assert_eq!(extension_for(None, "https://x/abc123"), DEFAULT_EXTENSION);
        assert_eq!(extension_for(None, "https://x/abc.png.exe"), DEFAULT_EXTENSION);
    }

    #[test]
    fn test_is_local() {
        let s = store();
        assert!(s.is_local("/recipe-images/recipe-42.png"));
        assert!(!s.is_local("/recipe-images/"));
        assert!(!s.is_local("/recipe-images/nested/recipe-1.png"));
        assert!(!s.is_local("/recipe-imagesX/recipe-1.png"));
        assert!(!s.is_local("https://oaidalleapiprodscus.blob.core.windows.net/abc"));
        assert!(!s.is_local(""));
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("recipe-1.png"), Some("recipe-1.png".to_string()));
        assert_eq!(sanitize_file_name("../../etc/passwd"), Some("passwd".to_string()));
        assert_eq!(sanitize_file_name("..\\win.ini"), Some("win.ini".to_string()));
        assert_eq!(sanitize_file_name(".hidden"), Some("hidden".to_string()));
        assert_eq!(sanitize_file_name(".."), None);
        assert_eq!(sanitize_file_name("a/"), None);
    }

    #[test]
    fn test_store_rejects_bad_prefixes() {
        assert!(LocalStore::new("/tmp", "", "/x").unwrap_err().is_invalid_config());
        assert!(LocalStore::new("/tmp", "../up", "/x").is_err());
        assert!(LocalStore::new("/tmp", "recipe", "relative").is_err());
        assert!(LocalStore::new("/tmp", "recipe", "//host/x").is_err());
    }

    #[test]
    fn test_files_for_lists_entity_files_only() {
        let dir = tempfile::TempDir::new().unwrap();
        let s = LocalStore::new(dir.path(), "recipe", "/recipe-images").unwrap();
        std::fs::write(dir.path().join("recipe-4.png"), b"x").unwrap();
        std::fs::write(dir.path().join(".recipe-4.png.77-0.part"), b"x").unwrap();
        std::fs::write(dir.path().join("recipe-42.png"), b"x").unwrap();

        assert_eq!(
            s.files_for(EntityId(4)).unwrap(),
            vec![".recipe-4.png.77-0.part".to_string(), "recipe-4.png".to_string()]
        );
    }
}
