//! # Session Store
//!
//! Durable artifacts of a run, each written as a versioned JSON envelope
//! `{format, schema_version, written_at, checksum, payload}` where the
//! checksum is the blake3 hash of the serialized payload.
//!
//! Writes go to a temp file that is renamed over the real name, so a crash
//! never leaves a torn file behind. A single writer lock serializes writes.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::infrastructure::retry_manager::RetryableError;

/// Bumped whenever a payload shape changes incompatibly
pub const SCHEMA_VERSION: u32 = 1;

const FORMAT_PREFIX: &str = "inventory-prober";
const SESSION_DIR: &str = "session";
const HISTORY_DIR: &str = "history";

/// Persisted files managed by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Artifact {
    /// Discovered URLs and extracted product pages
    Catalog,
    /// Probe results of the in-progress run
    Results,
    /// Failure tracker of the in-progress run
    Failures,
    /// Results of the last completed run
    PreviousResults,
    LastFailures,
    LastRecords,
}

impl Artifact {
    pub const SESSION: [Self; 3] = [Self::Catalog, Self::Results, Self::Failures];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Catalog => "catalog",
            Self::Results => "results",
            Self::Failures => "failures",
            Self::PreviousResults => "previous_results",
            Self::LastFailures => "last_failures",
            Self::LastRecords => "last_records",
        }
    }

    const fn directory(self) -> &'static str {
        match self {
            Self::Catalog | Self::Results | Self::Failures => SESSION_DIR,
            Self::PreviousResults | Self::LastFailures | Self::LastRecords => HISTORY_DIR,
        }
    }

    fn format(self) -> String {
        format!("{FORMAT_PREFIX}/{}", self.name())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    format: String,
    schema_version: u32,
    written_at: DateTime<Utc>,
    checksum: String,
    payload: serde_json::Value,
}

fn checksum_of(payload: &serde_json::Value) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(payload)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Corrupt state file {path:?}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Version mismatch in {path:?}: expected {expected_format} v{expected_version}, found {found_format} v{found_version}")]
    VersionMismatch {
        path: PathBuf,
        expected_format: String,
        expected_version: u32,
        found_format: String,
        found_version: u32,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Timeout after {after:?} during {operation}")]
    Timeout { operation: String, after: Duration },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether the error means the file content cannot be trusted
    #[must_use]
    pub const fn is_untrusted_content(&self) -> bool {
        matches!(self, Self::Corrupt { .. } | Self::VersionMismatch { .. })
    }
}

impl RetryableError for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Timeout { .. })
    }

    fn timed_out(operation: &str, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.to_string(),
            after,
        }
    }
}

/// Envelope-based JSON store rooted at the configured state directory
#[derive(Debug)]
pub struct SessionStore {
    root: PathBuf,
    writer: Mutex<()>,
}

impl SessionStore {
    /// Opens the store, creating `session/` and `history/` when missing
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in [root.join(SESSION_DIR), root.join(HISTORY_DIR)] {
            fs::create_dir_all(&dir).await.map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(Self {
            root,
            writer: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn path_of(&self, artifact: Artifact) -> PathBuf {
        self.root
            .join(artifact.directory())
            .join(format!("{}.json", artifact.name()))
    }

    #[must_use]
    pub fn exists(&self, artifact: Artifact) -> bool {
        self.path_of(artifact).exists()
    }

    /// Writes `value` atomically inside an envelope
    pub async fn save<T: Serialize + Sync>(&self, artifact: Artifact, value: &T) -> Result<(), StoreError> {
        let payload = serde_json::to_value(value)?;
        let envelope = Envelope {
            format: artifact.format(),
            schema_version: SCHEMA_VERSION,
            written_at: Utc::now(),
            checksum: checksum_of(&payload)?,
            payload,
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;

        let path = self.path_of(artifact);
        let tmp_path = path.with_extension("json.tmp");

        let _guard = self.writer.lock().await;
        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| StoreError::io(&tmp_path, e))?;
        file.write_all(&bytes).await.map_err(|e| StoreError::io(&tmp_path, e))?;
        file.sync_all().await.map_err(|e| StoreError::io(&tmp_path, e))?;
        drop(file);
        fs::rename(&tmp_path, &path).await.map_err(|e| StoreError::io(&path, e))?;

        debug!(artifact = artifact.name(), bytes = bytes.len(), "💾 State written");
        Ok(())
    }

    /// Reads and verifies an artifact; `Ok(None)` when it does not exist
    pub async fn load<T: DeserializeOwned>(&self, artifact: Artifact) -> Result<Option<T>, StoreError> {
        let path = self.path_of(artifact);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        let envelope: Envelope = serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            path: path.clone(),
            reason: format!("unparsable envelope: {e}"),
        })?;

        let expected_format = artifact.format();
        if envelope.format != expected_format || envelope.schema_version != SCHEMA_VERSION {
            return Err(StoreError::VersionMismatch {
                path,
                expected_format,
                expected_version: SCHEMA_VERSION,
                found_format: envelope.format,
                found_version: envelope.schema_version,
            });
        }

        let actual = checksum_of(&envelope.payload)?;
        if actual != envelope.checksum {
            return Err(StoreError::Corrupt {
                path,
                reason: format!("checksum mismatch (stored {}, computed {actual})", envelope.checksum),
            });
        }

        serde_json::from_value(envelope.payload)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                path,
                reason: format!("payload does not match the expected shape: {e}"),
            })
    }

    /// Moves a bad file aside as `<name>.corrupt-<timestamp>`
    pub async fn quarantine(&self, artifact: Artifact) -> Result<Option<PathBuf>, StoreError> {
        let path = self.path_of(artifact);
        if !path.exists() {
            return Ok(None);
        }

        let target = path.with_extension(format!(
            "json.corrupt-{}",
            Utc::now().format("%Y%m%dT%H%M%S%3f")
        ));
        let _guard = self.writer.lock().await;
        fs::rename(&path, &target).await.map_err(|e| StoreError::io(&path, e))?;
        warn!("🚧 Moved untrusted state file {:?} to {:?}", path, target);
        Ok(Some(target))
    }

    /// Removes the in-progress session files after a completed run
    pub async fn clear_session(&self) -> Result<(), StoreError> {
        let _guard = self.writer.lock().await;
        for artifact in Artifact::SESSION {
            let path = self.path_of(artifact);
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(&path, e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    fn sample() -> Sample {
        Sample {
            name: "arrow".to_string(),
            count: 3,
        }
    }

    #[tokio::test]
    async fn missing_artifact_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();
        let loaded: Option<Sample> = store.load(Artifact::Results).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn saved_artifact_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();
        store.save(Artifact::Results, &sample()).await.unwrap();

        let loaded: Option<Sample> = store.load(Artifact::Results).await.unwrap();
        assert_eq!(loaded, Some(sample()));
        assert!(!store.path_of(Artifact::Results).with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn tampered_payload_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();
        store.save(Artifact::Catalog, &sample()).await.unwrap();

        let path = store.path_of(Artifact::Catalog);
        let mut envelope: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        envelope["payload"]["count"] = json!(99);
        std::fs::write(&path, serde_json::to_vec(&envelope).unwrap()).unwrap();

        let err = store.load::<Sample>(Artifact::Catalog).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert!(err.is_untrusted_content());
    }

    #[tokio::test]
    async fn truncated_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();
        std::fs::write(store.path_of(Artifact::Failures), b"{\"format\": \"inventory-pro").unwrap();

        let err = store.load::<Sample>(Artifact::Failures).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn unsupported_schema_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();
        store.save(Artifact::Results, &sample()).await.unwrap();

        let path = store.path_of(Artifact::Results);
        let mut envelope: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        envelope["schema_version"] = json!(SCHEMA_VERSION + 1);
        std::fs::write(&path, serde_json::to_vec(&envelope).unwrap()).unwrap();

        let err = store.load::<Sample>(Artifact::Results).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionMismatch { found_version, .. } if found_version == SCHEMA_VERSION + 1));
    }

    #[tokio::test]
    async fn artifact_under_wrong_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();
        store.save(Artifact::Results, &sample()).await.unwrap();
        std::fs::copy(store.path_of(Artifact::Results), store.path_of(Artifact::Catalog)).unwrap();

        let err = store.load::<Sample>(Artifact::Catalog).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionMismatch { .. }));
    }

    #[tokio::test]
    async fn quarantine_moves_file_aside() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();
        std::fs::write(store.path_of(Artifact::Catalog), b"garbage").unwrap();

        let moved = store.quarantine(Artifact::Catalog).await.unwrap().unwrap();
        assert!(moved.exists());
        assert!(moved.to_string_lossy().contains(".corrupt-"));
        assert!(!store.exists(Artifact::Catalog));
    }

    #[tokio::test]
    async fn clear_session_keeps_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();
        store.save(Artifact::Results, &sample()).await.unwrap();
        store.save(Artifact::PreviousResults, &sample()).await.unwrap();

        store.clear_session().await.unwrap();
        assert!(!store.exists(Artifact::Results));
        assert!(store.exists(Artifact::PreviousResults));
    }
}
