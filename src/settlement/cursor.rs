//! Durable settlement cursor.
//!
//! The file holds `{"id", "createdAt", "updatedAt"}`. Writes go to a
//! sibling temp file that is then renamed over the target, so a crash
//! leaves either the old or the new cursor on disk. A file that does not
//! parse is moved aside to `<path>.invalid-<unix-millis>` and the scan
//! restarts from the beginning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use super::models::SettlementCursor;
use crate::error::AppResult;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorFile {
    id: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> AppResult<Option<SettlementCursor>> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<CursorFile>(&raw) {
            Ok(file) => Ok(Some(SettlementCursor {
                id: file.id,
                created_at: file.created_at,
            })),
            Err(e) => {
                let aside = self.invalid_path(Utc::now());
                warn!(
                    path = %self.path.display(),
                    moved_to = %aside.display(),
                    "Settlement cursor unreadable, restarting from the beginning: {}",
                    e
                );
                fs::rename(&self.path, &aside).await?;
                Ok(None)
            }
        }
    }

    pub async fn save(&self, cursor: &SettlementCursor, now: DateTime<Utc>) -> AppResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let body = serde_json::to_vec_pretty(&CursorFile {
            id: cursor.id,
            created_at: cursor.created_at,
            updated_at: now,
        })?;

        let tmp = self.sibling(".tmp");
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), cursor_id = %cursor.id, "Settlement cursor saved");
        Ok(())
    }

    /// Removes the cursor; the next scan starts from the beginning
    pub async fn clear(&self) -> AppResult<()> {
        match fs::remove_file(&self.path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn invalid_path(&self, now: DateTime<Utc>) -> PathBuf {
        self.sibling(&format!(".invalid-{}", now.timestamp_millis()))
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cursor() -> SettlementCursor {
        SettlementCursor {
            id: Uuid::new_v4(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CursorStore::new(dir.path().join("cursor.json"));
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = CursorStore::new(dir.path().join("nested/cursor.json"));
        let saved = cursor();

        store.save(&saved, Utc::now()).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(saved));

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"createdAt\""));
        assert!(raw.contains("\"updatedAt\""));
        assert!(!dir.path().join("nested/cursor.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store = CursorStore::new(&path);
        assert_eq!(store.load().await.unwrap(), None);
        assert!(!path.exists());

        let moved: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(moved.len(), 1);
        assert!(moved[0].starts_with("cursor.json.invalid-"));
    }

    #[tokio::test]
    async fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = CursorStore::new(dir.path().join("cursor.json"));
        store.clear().await.unwrap();

        store.save(&cursor(), Utc::now()).await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
    }
}
