//! JSON-file backed settings and state.
//!
//! The whole record is replaced on every write (temp file + rename), so a
//! reader never observes a half-updated upload state.

use crate::models::{ClipperOptions, Location, RecentClip, UploadState};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub const MAX_RECENT_CLIPS: usize = 10;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct StoredConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_collection_id: Option<String>,
    pub options: ClipperOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_location: Option<Location>,
    pub recent_clips: Vec<RecentClip>,
    pub upload_state: UploadState,
}

impl StoredConfig {
    /// Newest first; re-clipping a URL moves it to the front.
    pub fn push_recent(&mut self, clip: RecentClip) {
        self.recent_clips.retain(|c| c.url != clip.url);
        self.recent_clips.insert(0, clip);
        self.recent_clips.truncate(MAX_RECENT_CLIPS);
    }
}

#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    state: Mutex<StoredConfig>,
}

impl Store {
    /// Load `path`, or start empty when it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = match std::fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => StoredConfig::default(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoredConfig::default(),
            Err(e) => return Err(e.into()),
        };
        tracing::info!(path = %path.display(), recent = state.recent_clips.len(), "store.open");
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> StoredConfig {
        self.lock().clone()
    }

    /// Apply `f` and persist the resulting record. The in-memory copy only
    /// changes when the write succeeds.
    pub fn update<R>(&self, f: impl FnOnce(&mut StoredConfig) -> R) -> Result<R, StoreError> {
        let mut guard = self.lock();
        let mut next = guard.clone();
        let out = f(&mut next);
        write_atomic(&self.path, &next)?;
        *guard = next;
        Ok(out)
    }

    pub fn upload_state(&self) -> UploadState {
        self.lock().upload_state.clone()
    }

    pub fn set_upload_state(&self, state: UploadState) -> Result<(), StoreError> {
        self.update(|cfg| cfg.upload_state = state)
    }

    /// Apply `f` in memory now and write the record on the blocking pool.
    ///
    /// For frequent progress updates made from async code. A failed write is
    /// logged and the in-memory change is kept; the next write carries it.
    pub fn update_in_background(
        self: &Arc<Self>,
        f: impl FnOnce(&mut StoredConfig),
    ) -> tokio::task::JoinHandle<()> {
        f(&mut *self.lock());
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            if let Err(err) = store.persist() {
                tracing::warn!(path = %store.path.display(), error = %err, "store.write_failed");
            }
        })
    }

    fn persist(&self) -> Result<(), StoreError> {
        let guard = self.lock();
        write_atomic(&self.path, &guard)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoredConfig> {
        // A panic mid-update leaves the previous record intact.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn write_atomic(path: &Path, cfg: &StoredConfig) -> Result<(), StoreError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, serde_json::to_vec_pretty(cfg)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn clip(url: &str) -> RecentClip {
        RecentClip {
            document_id: format!("doc-{url}"),
            title: url.to_string(),
            url: url.to_string(),
            document_url: None,
            clipped_at: Utc::now(),
        }
    }

    #[test]
    fn missing_file_starts_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("state.json")).unwrap();
        let cfg = store.snapshot();
        assert_eq!(cfg, StoredConfig::default());
        assert!(cfg.options.include_images);
        assert!(!cfg.options.simplify_content);
    }

    #[test]
    fn updates_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.json");
        let store = Store::open(&path).unwrap();
        store
            .update(|cfg| {
                cfg.api_url = Some("https://wiki.example.com".into());
                cfg.options.tags = vec!["rust".into()];
            })
            .unwrap();
        store
            .update(|cfg| {
                cfg.last_location = Some(Location {
                    collection_id: "col-1".into(),
                    parent_document_id: None,
                })
            })
            .unwrap();

        let reopened = Store::open(&path).unwrap().snapshot();
        assert_eq!(reopened.api_url.as_deref(), Some("https://wiki.example.com"));
        assert_eq!(reopened.options.tags, vec!["rust".to_string()]);
        assert_eq!(reopened.last_location.unwrap().collection_id, "col-1");
        assert!(!dir.path().join("nested/state.json.tmp").exists());
    }

    #[test]
    fn recent_clips_are_capped_and_deduplicated() {
        let mut cfg = StoredConfig::default();
        for i in 0..12 {
            cfg.push_recent(clip(&format!("https://x.com/{i}")));
        }
        assert_eq!(cfg.recent_clips.len(), MAX_RECENT_CLIPS);
        assert_eq!(cfg.recent_clips[0].url, "https://x.com/11");

        cfg.push_recent(clip("https://x.com/5"));
        assert_eq!(cfg.recent_clips.len(), MAX_RECENT_CLIPS);
        assert_eq!(cfg.recent_clips[0].url, "https://x.com/5");
        assert_eq!(
            cfg.recent_clips.iter().filter(|c| c.url == "https://x.com/5").count(),
            1
        );
    }

    #[test]
    fn upload_state_is_replaced_whole() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("s.json")).unwrap();
        store
            .set_upload_state(UploadState {
                is_uploading: true,
                current_index: 2,
                total_images: 5,
                start_time: Some(Utc::now()),
                should_stop: false,
            })
            .unwrap();
        assert_eq!(store.upload_state().current_index, 2);

        store.set_upload_state(UploadState::default()).unwrap();
        assert_eq!(store.upload_state(), UploadState::default());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(Store::open(&path), Err(StoreError::Json(_))));
    }

    #[tokio::test]
    async fn background_updates_apply_now_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");
        let store = Arc::new(Store::open(&path).unwrap());

        let handle = store.update_in_background(|cfg| {
            cfg.upload_state.current_index = 3;
            cfg.upload_state.total_images = 7;
        });
        assert_eq!(store.upload_state().current_index, 3);
        handle.await.unwrap();

        let reopened = Store::open(&path).unwrap().upload_state();
        assert_eq!(reopened.current_index, 3);
        assert_eq!(reopened.total_images, 7);
    }
}
