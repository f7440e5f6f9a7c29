//! Durable storage for the upload state.
//!
//! The document is written as a single JSON snapshot. Saves go through a
//! debounced writer task: bursts of changes coalesce into at most one
//! write per debounce window, and an explicit flush performs a final
//! write at shutdown. Writes are atomic (temp file + rename), so a
//! concurrent reader observes either the old or the new document.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use directories::ProjectDirs;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::models::{ItemState, UploadState};

/// Reads and writes the persisted upload-state document.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Creates a store at an explicit location.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The OS-appropriate per-user location of the state file.
    pub fn default_path() -> PathBuf {
        if let Some(proj_dirs) = ProjectDirs::from("", "", "gphotos-sync") {
            proj_dirs.data_dir().join("upload-state.json")
        } else {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("gphotos-sync")
                .join("upload-state.json")
        }
    }

    /// Location of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the document.
    ///
    /// A missing file yields the empty state; a file that exists but does
    /// not parse is a fatal error (the run must not silently restart from
    /// scratch and re-upload everything).
    pub fn load(&self) -> Result<UploadState> {
        if !self.path.exists() {
            return Ok(UploadState::default());
        }
        let content = std::fs::read_to_string(&self.path)?;
        serde_json::from_str(&content).map_err(|source| SyncError::CorruptState {
            path: self.path.clone(),
            source,
        })
    }

    /// Writes the document atomically: a sibling temp file is written,
    /// synced, then renamed over the target.
    pub fn save(&self, state: &UploadState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(state)
            .expect("upload state serialises to JSON");

        let temp_path = self.path.with_extension("json.tmp");
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&temp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

enum SaverMsg {
    Dirty,
    Flush(oneshot::Sender<Result<()>>),
}

/// Shared in-memory upload state with a debounced snapshot writer.
///
/// The uploader mutates records through [`record`](Self::record); each
/// mutation nudges the writer task, which coalesces nudges and persists
/// a snapshot at most once per debounce window. [`flush`](Self::flush)
/// writes immediately and reports the outcome; the run controller calls
/// it once at shutdown.
pub struct StateKeeper {
    inner: Arc<KeeperInner>,
    tx: mpsc::UnboundedSender<SaverMsg>,
}

struct KeeperInner {
    store: StateStore,
    state: Mutex<UploadState>,
}

impl StateKeeper {
    /// Wraps `initial` and spawns the writer task.
    pub fn spawn(store: StateStore, initial: UploadState, debounce: Duration) -> Arc<Self> {
        let inner = Arc::new(KeeperInner {
            store,
            state: Mutex::new(initial),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(saver_task(Arc::clone(&inner), rx, debounce));
        Arc::new(Self { inner, tx })
    }

    /// Returns the record for a path, if any.
    pub fn get(&self, path: &Path) -> Option<ItemState> {
        self.inner.state.lock().expect("state poisoned").get(path).cloned()
    }

    /// Replaces the record for a path and nudges the writer.
    pub fn record(&self, path: &Path, item: ItemState) {
        self.inner
            .state
            .lock()
            .expect("state poisoned")
            .insert(path, item);
        // The writer may already have exited at shutdown; the final
        // flush has the last word then.
        let _ = self.tx.send(SaverMsg::Dirty);
    }

    /// A copy of the current in-memory document.
    pub fn snapshot(&self) -> UploadState {
        self.inner.state.lock().expect("state poisoned").clone()
    }

    /// Persists the current document immediately.
    pub async fn flush(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        if self.tx.send(SaverMsg::Flush(ack)).is_err() {
            // Writer gone; save inline.
            return write_snapshot(&self.inner).await;
        }
        done.await
            .unwrap_or_else(|_| write_snapshot_blocking(&self.inner))
    }
}

async fn saver_task(
    inner: Arc<KeeperInner>,
    mut rx: mpsc::UnboundedReceiver<SaverMsg>,
    debounce: Duration,
) {
    while let Some(msg) = rx.recv().await {
        let mut acks: Vec<oneshot::Sender<Result<()>>> = Vec::new();
        match msg {
            SaverMsg::Flush(ack) => acks.push(ack),
            SaverMsg::Dirty => {
                // Coalesce further nudges until the window closes or a
                // flush demands an immediate write.
                let deadline = Instant::now() + debounce;
                loop {
                    match tokio::time::timeout_at(deadline, rx.recv()).await {
                        Ok(Some(SaverMsg::Dirty)) => continue,
                        Ok(Some(SaverMsg::Flush(ack))) => {
                            acks.push(ack);
                            break;
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
            }
        }

        let result = write_snapshot(&inner).await;
        if let Err(e) = &result {
            warn!(error = %e, "failed to persist upload state");
        }
        for ack in acks {
            let _ = ack.send(result.as_ref().map(|_| ()).map_err(SyncError::duplicate));
        }
    }
    debug!("state writer stopped");
}

async fn write_snapshot(inner: &Arc<KeeperInner>) -> Result<()> {
    let store = inner.store.clone();
    let snapshot = inner.state.lock().expect("state poisoned").clone();
    tokio::task::spawn_blocking(move || store.save(&snapshot))
        .await
        .map_err(|e| SyncError::Io(std::io::Error::other(e.to_string())))?
}

fn write_snapshot_blocking(inner: &Arc<KeeperInner>) -> Result<()> {
    let snapshot = inner.state.lock().expect("state poisoned").clone();
    inner.store.save(&snapshot)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> StateStore {
        StateStore::new(dir.path().join("upload-state.json"))
    }

    #[test]
    fn test_load_missing_file_yields_empty_state() {
        let tmp = tempfile::tempdir().unwrap();
        let state = store_in(&tmp).load().unwrap();
        assert!(state.is_empty());
    }

    #[test]
    fn test_save_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp);

        let mut state = UploadState::default();
        state.insert(
            &PathBuf::from("/photos/a.jpg"),
            ItemState::created("m1", None, None),
        );
        store.save(&state).unwrap();

        let reloaded = store.load().unwrap();
        assert_eq!(reloaded, state);

        // No stray temp file after a completed save.
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp);
        std::fs::write(store.path(), b"{not json").unwrap();

        match store.load() {
            Err(SyncError::CorruptState { .. }) => {}
            other => panic!("expected CorruptState, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_keeper_flush_persists_records() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp);
        let keeper = StateKeeper::spawn(
            store.clone(),
            UploadState::default(),
            Duration::from_millis(10),
        );

        for i in 0..5 {
            keeper.record(
                &PathBuf::from(format!("/photos/{i}.jpg")),
                ItemState::created(format!("m{i}"), None, None),
            );
        }
        keeper.flush().await.unwrap();

        let reloaded = store.load().unwrap();
        assert_eq!(reloaded.len(), 5);
        assert_eq!(reloaded, keeper.snapshot());
    }

    #[tokio::test]
    async fn test_keeper_debounce_eventually_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp);
        let keeper = StateKeeper::spawn(
            store.clone(),
            UploadState::default(),
            Duration::from_millis(10),
        );

        keeper.record(
            &PathBuf::from("/photos/a.jpg"),
            ItemState::created("m1", None, None),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(store.load().unwrap().len(), 1);
    }
}
