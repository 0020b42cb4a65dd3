//! Snapshot persistence
//!
//! The engine only produces and consumes [`PlayerSnapshot`]s; a [`Store`]
//! decides where they live. [`JsonFileStore`] keeps one snapshot per file.

use crate::error::Result;
use crate::player::PlayerSnapshot;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Persists and reloads player snapshots
#[async_trait]
pub trait Store: Send + Sync {
    async fn save(&self, snapshot: &PlayerSnapshot) -> Result<()>;

    /// Last saved snapshot, `None` if nothing was saved yet
    async fn load(&self) -> Result<Option<PlayerSnapshot>>;
}

/// Store writing pretty-printed JSON to a single file
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Store for JsonFileStore {
    async fn save(&self, snapshot: &PlayerSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(snapshot)?;
        // Write-then-rename; the previous snapshot survives a crash mid-write
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        info!(
            "Saved {} queued entries to {}",
            snapshot.playlist.entries.len(),
            self.path.display()
        );
        Ok(())
    }

    async fn load(&self) -> Result<Option<PlayerSnapshot>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No saved state at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot: PlayerSnapshot = serde_json::from_slice(&bytes)?;
        info!(
            "Loaded {} queued entries from {}",
            snapshot.playlist.entries.len(),
            self.path.display()
        );
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;
    use crate::error::Error;
    use crate::playlist::PlaylistSnapshot;

    fn sample() -> PlayerSnapshot {
        let a = Entry::with_metadata("a.mp3", Some("u1".into()), "A", Some(100.0));
        let b = Entry::with_metadata("b.mp3", None, "B", None);
        PlayerSnapshot {
            playlist: PlaylistSnapshot {
                name: "main".to_string(),
                entries: vec![b.snapshot()],
                precache_depth: 2,
                karaoke_mode: false,
            },
            current: Some(a.snapshot()),
            progress_seconds: 12.5,
            volume: 0.3,
        }
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state/queue.json"));

        assert!(store.load().await.unwrap().is_none());

        let snapshot = sample();
        store.save(&snapshot).await.unwrap();
        assert!(store.path().exists());
        assert_eq!(store.load().await.unwrap(), Some(snapshot));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = JsonFileStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
