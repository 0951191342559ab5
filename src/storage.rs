//! Key-addressed artifact storage.
//!
//! Keys are relative paths whose first segment is a logical bucket
//! (`templates/`, `generated/`, `combined/`, `endorsements/`,
//! `policy-packages/YYYY/MM/`, `policy-components/YYYY/MM/`). A stored key is
//! never overwritten; new content always gets a new key.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::StoreError;

pub const TEMPLATES_BUCKET: &str = "templates";
pub const GENERATED_BUCKET: &str = "generated";
pub const COMBINED_BUCKET: &str = "combined";
pub const ENDORSEMENTS_BUCKET: &str = "endorsements";
pub const PACKAGES_BUCKET: &str = "policy-packages";
pub const COMPONENTS_BUCKET: &str = "policy-components";

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Write a new blob. Fails with `AlreadyExists` rather than replacing one.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    fn url(&self, key: &str) -> String;
}

/// Reject absolute paths, parent traversal and characters outside the key alphabet.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let invalid = || StoreError::InvalidKey(key.to_string());
    if key.is_empty() || key.starts_with('/') || key.ends_with('/') {
        return Err(invalid());
    }
    for segment in key.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(invalid());
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ' | '(' | ')'))
        {
            return Err(invalid());
        }
    }
    Ok(())
}

fn safe_segment(value: &str, fallback: &str) -> String {
    let cleaned: String = sanitize_filename::sanitize(value)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        fallback.to_string()
    } else {
        cleaned
    }
}

fn dated_prefix(bucket: &str, at: DateTime<Utc>) -> String {
    format!("{}/{:04}/{:02}", bucket, at.year(), at.month())
}

fn unique_suffix() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn component_key(package_number: &str, sequence_order: i32, at: DateTime<Utc>) -> String {
    format!(
        "{}/{}-{:03}-{}.pdf",
        dated_prefix(COMPONENTS_BUCKET, at),
        safe_segment(package_number, "package"),
        sequence_order,
        unique_suffix()
    )
}

pub fn generated_key(name: &str) -> String {
    format!(
        "{}/{}-{}.pdf",
        GENERATED_BUCKET,
        safe_segment(name, "document"),
        unique_suffix()
    )
}

pub fn combined_key(package_number: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}/{}-{}.pdf",
        dated_prefix(PACKAGES_BUCKET, at),
        safe_segment(package_number, "package"),
        unique_suffix()
    )
}

pub fn fallback_key(package_number: &str) -> String {
    format!(
        "{}/{}-fallback-{}.pdf",
        COMBINED_BUCKET,
        safe_segment(package_number, "package"),
        unique_suffix()
    )
}

pub fn endorsement_key(endorsement_number: &str) -> String {
    format!(
        "{}/{}-{}.pdf",
        ENDORSEMENTS_BUCKET,
        safe_segment(endorsement_number, "endorsement"),
        unique_suffix()
    )
}

pub fn template_key(template_code: &str, file_name: &str) -> String {
    format!(
        "{}/{}/{}",
        TEMPLATES_BUCKET,
        safe_segment(template_code, "template"),
        safe_segment(file_name, "template.pdf")
    )
}

fn join_url(base_url: &str, key: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), key)
}

/// Filesystem store. Writes go to a temp file in the target directory and
/// are then linked into place without clobbering.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
    base_url: String,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |path, seg| path.join(seg)))
    }
}

fn io_error(key: &str, source: std::io::Error) -> StoreError {
    StoreError::Io {
        key: key.to_string(),
        source,
    }
}

async fn blocking<T, F>(key: &str, f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        io_error(
            key,
            std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        )
    })?
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let owned_key = key.to_string();
        let bytes = bytes.to_vec();

        blocking(key, move || {
            let parent = path
                .parent()
                .ok_or_else(|| StoreError::InvalidKey(owned_key.clone()))?;
            std::fs::create_dir_all(parent).map_err(|e| io_error(&owned_key, e))?;

            let mut tmp =
                tempfile::NamedTempFile::new_in(parent).map_err(|e| io_error(&owned_key, e))?;
            tmp.write_all(&bytes).map_err(|e| io_error(&owned_key, e))?;
            tmp.as_file()
                .sync_all()
                .map_err(|e| io_error(&owned_key, e))?;
            tmp.persist_noclobber(&path).map_err(|e| {
                if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                    StoreError::AlreadyExists(owned_key.clone())
                } else {
                    io_error(&owned_key, e.error)
                }
            })?;
            Ok(())
        })
        .await?;

        log::debug!("stored artifact {}", key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(key)?;
        let owned_key = key.to_string();
        blocking(key, move || match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(owned_key))
            }
            Err(e) => Err(io_error(&owned_key, e)),
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        let owned_key = key.to_string();
        blocking(key, move || {
            path.try_exists().map_err(|e| io_error(&owned_key, e))
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let owned_key = key.to_string();
        blocking(key, move || match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&owned_key, e)),
        })
        .await?;
        log::debug!("deleted artifact {}", key);
        Ok(())
    }

    fn url(&self, key: &str) -> String {
        join_url(&self.base_url, key)
    }
}

/// In-process store for tests and local runs.
#[derive(Debug)]
pub struct MemoryArtifactStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
    base_url: String,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(BTreeMap::new()),
            base_url: "memory://artifacts".to_string(),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.blobs.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl Default for MemoryArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        validate_key(key)?;
        let mut blobs = self.blobs.write();
        if blobs.contains_key(key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        blobs.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        validate_key(key)?;
        self.blobs
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        validate_key(key)?;
        Ok(self.blobs.read().contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        self.blobs.write().remove(key);
        Ok(())
    }

    fn url(&self, key: &str) -> String {
        join_url(&self.base_url, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn key_validation() {
        assert!(validate_key("templates/WCP-DEC/form.pdf").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("/abs/path.pdf").is_err());
        assert!(validate_key("generated//a.pdf").is_err());
        assert!(validate_key("").is_err());
    }

    #[test]
    fn dated_keys_use_year_and_month() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
        let key = component_key("POL-WCP-000001-00-DOC", 2, at);
        assert!(key.starts_with("policy-components/2024/03/POL-WCP-000001-00-DOC-002-"));
        assert!(validate_key(&key).is_ok());
        assert_ne!(key, component_key("POL-WCP-000001-00-DOC", 2, at));
    }

    #[test]
    fn unsafe_names_are_cleaned() {
        let key = generated_key("Notice / Waiver: 2");
        assert!(key.starts_with("generated/"));
        assert!(validate_key(&key).is_ok());
    }

    #[tokio::test]
    async fn local_store_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path(), "/artifacts/");

        store.put("generated/a.pdf", b"one").await.unwrap();
        let err = store.put("generated/a.pdf", b"two").await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert_eq!(store.get("generated/a.pdf").await.unwrap(), b"one");
        assert_eq!(store.url("generated/a.pdf"), "/artifacts/generated/a.pdf");

        store.delete("generated/a.pdf").await.unwrap();
        assert!(!store.exists("generated/a.pdf").await.unwrap());
        store.delete("generated/a.pdf").await.unwrap();
        assert!(matches!(
            store.get("generated/a.pdf").await.unwrap_err(),
            StoreError::NotFound(_)
        ));
    }
}
