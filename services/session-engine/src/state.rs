//! State Management - JSON state files under the engine's state directory

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::error::Result;

/// Reads and writes the engine's persisted artifacts
#[derive(Debug, Clone)]
pub struct StateFiles {
    state_dir: PathBuf,
}

impl StateFiles {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    /// Resolve a path relative to the state directory
    pub fn path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.state_dir.join(relative)
    }

    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.state_dir).await?;
        fs::create_dir_all(self.path("cost")).await?;
        fs::create_dir_all(self.path("backups")).await?;
        Ok(())
    }

    /// Write `value` as pretty JSON, replacing the file atomically
    pub async fn write_json<T: Serialize>(
        &self,
        relative: impl AsRef<Path>,
        value: &T,
    ) -> Result<u64> {
        let json = serde_json::to_vec_pretty(value)?;
        self.write_bytes(relative, &json).await
    }

    /// Write raw bytes atomically; returns the byte count
    pub async fn write_bytes(&self, relative: impl AsRef<Path>, bytes: &[u8]) -> Result<u64> {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;
        debug!("Wrote {}", path.display());
        Ok(bytes.len() as u64)
    }

    /// Read a JSON file; `None` when it does not exist
    pub async fn read_json<T: DeserializeOwned>(
        &self,
        relative: impl AsRef<Path>,
    ) -> Result<Option<T>> {
        match self.read_bytes(relative).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn read_bytes(&self, relative: impl AsRef<Path>) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path(relative)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a file; missing files are not an error
    pub async fn remove(&self, relative: impl AsRef<Path>) -> Result<()> {
        match fs::remove_file(self.path(relative)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Marker {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let files = StateFiles::new(dir.path());
        files.init().await.unwrap();

        let marker = Marker {
            name: "a".into(),
            count: 2,
        };
        let written = files.write_json("nested/marker.json", &marker).await.unwrap();
        assert!(written > 0);

        let loaded: Option<Marker> = files.read_json("nested/marker.json").await.unwrap();
        assert_eq!(loaded, Some(marker));
        assert!(!files.path("nested/marker.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let files = StateFiles::new(dir.path());
        let loaded: Option<Marker> = files.read_json("absent.json").await.unwrap();
        assert!(loaded.is_none());
        files.remove("absent.json").await.unwrap();
    }
}
