//! In-memory test doubles: a fake Photos API with scriptable failures
//! and a progress reporter that records every event.
//!
//! The fake mirrors the service behaviours the orchestrator depends on:
//! upload tokens, per-item creation status, album membership, and the
//! 50-item batch limit. Failures are injected either by magic file /
//! album names (so scenario trees stay declarative) or by explicit
//! switches.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::client::{PhotosApi, ADD_BATCH_LIMIT};
use crate::error::{Result, SyncError};
use crate::models::{CloudAlbum, MediaItem};
use crate::progress::{ProgressReporter, ProgressStream};

/// Files with this marker are rejected during media-item creation.
pub const FAIL_CREATE_MARKER: &str = "failOnMeWithInvalidArgumentDuringCreationOfMediaItem";

/// Files with this marker are rejected during the binary upload.
pub const FAIL_UPLOAD_MARKER: &str = "failOnMeWithInvalidArgumentDuringUploadOfMediaData";

/// Adding items to a pre-existing album with this title is rejected.
pub const FAIL_ALBUM_TITLE: &str = "fail-on-me-pre-existing-album";

#[derive(Debug, Clone)]
struct FakeAlbum {
    album: CloudAlbum,
    items: Vec<String>,
}

#[derive(Debug, Default)]
struct FakeInner {
    albums: BTreeMap<String, FakeAlbum>,
    next_album: u64,
    next_media: u64,
    next_token: u64,
    upload_calls: BTreeMap<String, u32>,
    batch_adds: Vec<(String, usize)>,
    transient_remaining: u32,
    fail_next_status: Option<u16>,
    fail_upload_status: Option<u16>,
    created: u64,
}

/// In-memory stand-in for the Google Photos service.
pub struct FakePhotosApi {
    inner: Mutex<FakeInner>,
    failures_enabled: AtomicBool,
}

impl FakePhotosApi {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FakeInner::default()),
            failures_enabled: AtomicBool::new(true),
        }
    }

    /// Creates a pre-existing album holding the given media item ids.
    pub fn seed_album(&self, title: &str, item_ids: &[&str]) -> CloudAlbum {
        let mut inner = self.lock();
        inner.next_album += 1;
        let id = format!("album-{:04}", inner.next_album);
        let album = CloudAlbum {
            id: id.clone(),
            title: title.to_string(),
            media_items_count: item_ids.len() as u64,
            product_url: Some(format!("https://photos.example.com/album/{id}")),
        };
        inner.albums.insert(
            id,
            FakeAlbum {
                album: album.clone(),
                items: item_ids.iter().map(|s| s.to_string()).collect(),
            },
        );
        album
    }

    /// Turns the name-marker failure behaviours on or off.
    pub fn set_failures_enabled(&self, enabled: bool) {
        self.failures_enabled.store(enabled, Ordering::SeqCst);
    }

    /// The next `count` API calls fail with `RESOURCE_EXHAUSTED`.
    pub fn inject_transient(&self, count: u32) {
        self.lock().transient_remaining = count;
    }

    /// The next API call fails with the given HTTP status.
    pub fn fail_next_with_status(&self, status: u16) {
        self.lock().fail_next_status = Some(status);
    }

    /// Every binary upload from now on fails with the given HTTP status.
    pub fn fail_uploads_with_status(&self, status: u16) {
        self.lock().fail_upload_status = Some(status);
    }

    /// How many times a path's bytes were uploaded.
    pub fn upload_count(&self, path: &Path) -> u32 {
        self.lock()
            .upload_calls
            .get(&path.display().to_string())
            .copied()
            .unwrap_or(0)
    }

    /// Total binary uploads across all paths.
    pub fn total_uploads(&self) -> u32 {
        self.lock().upload_calls.values().sum()
    }

    /// Total media items created.
    pub fn created_count(&self) -> u64 {
        self.lock().created
    }

    /// Every recorded `batch_add_to_album` call as `(album id, size)`.
    pub fn batch_add_sizes(&self) -> Vec<(String, usize)> {
        self.lock().batch_adds.clone()
    }

    /// All albums currently carrying `title`.
    pub fn albums_with_title(&self, title: &str) -> Vec<CloudAlbum> {
        self.lock()
            .albums
            .values()
            .filter(|a| a.album.title == title)
            .map(|a| a.album.clone())
            .collect()
    }

    pub fn album_exists(&self, album_id: &str) -> bool {
        self.lock().albums.contains_key(album_id)
    }

    /// Item ids currently inside an album.
    pub fn album_items_for_test(&self, album_id: &str) -> Vec<String> {
        self.lock()
            .albums
            .get(album_id)
            .map(|a| a.items.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeInner> {
        self.inner.lock().expect("fake poisoned")
    }

    fn failures_enabled(&self) -> bool {
        self.failures_enabled.load(Ordering::SeqCst)
    }

    /// Applies any scripted failure for the call being made.
    fn take_injected(&self) -> Result<()> {
        let mut inner = self.lock();
        if let Some(status) = inner.fail_next_status.take() {
            return Err(SyncError::Api {
                status,
                message: "injected failure".into(),
            });
        }
        if inner.transient_remaining > 0 {
            inner.transient_remaining -= 1;
            return Err(SyncError::resource_exhausted("injected transient failure"));
        }
        Ok(())
    }
}

impl Default for FakePhotosApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PhotosApi for FakePhotosApi {
    async fn list_albums(&self) -> Result<Vec<CloudAlbum>> {
        self.take_injected()?;
        let inner = self.lock();
        Ok(inner
            .albums
            .values()
            .map(|a| CloudAlbum {
                media_items_count: a.items.len() as u64,
                ..a.album.clone()
            })
            .collect())
    }

    async fn create_album(&self, title: &str) -> Result<CloudAlbum> {
        self.take_injected()?;
        Ok(self.seed_album(title, &[]))
    }

    async fn upload_media_data(&self, path: &Path) -> Result<String> {
        self.take_injected()?;
        if let Some(status) = self.lock().fail_upload_status {
            return Err(SyncError::Api {
                status,
                message: "injected upload failure".into(),
            });
        }
        let key = path.display().to_string();
        if self.failures_enabled() && key.contains(FAIL_UPLOAD_MARKER) {
            return Err(SyncError::invalid_argument("upload rejected"));
        }

        let mut inner = self.lock();
        *inner.upload_calls.entry(key.clone()).or_insert(0) += 1;
        inner.next_token += 1;
        Ok(format!("{key}::upload-token-{}", inner.next_token))
    }

    async fn create_media_item(
        &self,
        album_id: Option<&str>,
        upload_token: &str,
        file_name: &str,
    ) -> Result<MediaItem> {
        self.take_injected()?;
        if upload_token.is_empty() {
            return Err(SyncError::invalid_argument("missing upload token"));
        }
        if self.failures_enabled() && file_name.contains(FAIL_CREATE_MARKER) {
            return Err(SyncError::invalid_argument("media item rejected"));
        }

        let mut inner = self.lock();
        if let Some(id) = album_id {
            let album = inner
                .albums
                .get(id)
                .ok_or_else(|| SyncError::invalid_argument("unknown album"))?;
            if self.failures_enabled() && album.album.title == FAIL_ALBUM_TITLE {
                return Err(SyncError::invalid_argument(
                    "no permission to add media items to this album",
                ));
            }
        }

        inner.next_media += 1;
        inner.created += 1;
        let media_id = format!("media-{:04}", inner.next_media);
        if let Some(id) = album_id {
            inner
                .albums
                .get_mut(id)
                .expect("album checked above")
                .items
                .push(media_id.clone());
        }

        Ok(MediaItem {
            id: media_id,
            product_url: None,
            filename: Some(file_name.to_string()),
        })
    }

    async fn batch_add_to_album(&self, album_id: &str, media_item_ids: &[String]) -> Result<()> {
        self.take_injected()?;
        if media_item_ids.len() > ADD_BATCH_LIMIT {
            return Err(SyncError::invalid_argument(format!(
                "batch of {} exceeds the {ADD_BATCH_LIMIT}-item limit",
                media_item_ids.len()
            )));
        }

        let mut inner = self.lock();
        inner
            .batch_adds
            .push((album_id.to_string(), media_item_ids.len()));
        let album = inner
            .albums
            .get_mut(album_id)
            .ok_or_else(|| SyncError::invalid_argument("unknown album"))?;
        album.items.extend(media_item_ids.iter().cloned());
        Ok(())
    }

    async fn get_album_items(&self, album_id: &str) -> Result<Vec<MediaItem>> {
        self.take_injected()?;
        let inner = self.lock();
        let album = inner
            .albums
            .get(album_id)
            .ok_or_else(|| SyncError::invalid_argument("unknown album"))?;
        Ok(album
            .items
            .iter()
            .map(|id| MediaItem {
                id: id.clone(),
                product_url: None,
                filename: None,
            })
            .collect())
    }
}

/// Progress reporter that records every event per stream.
pub struct CapturingReporter {
    streams: Mutex<BTreeMap<String, Arc<CapturedStream>>>,
}

impl CapturingReporter {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(BTreeMap::new()),
        }
    }

    /// Names of every stream opened so far.
    pub fn stream_names(&self) -> Vec<String> {
        self.streams
            .lock()
            .expect("streams poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Success count of a stream (0 when never opened).
    pub fn successes(&self, name: &str) -> u64 {
        self.captured(name)
            .map(|s| s.successes.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Recorded `(key, message)` errors of a stream, in arrival order.
    pub fn stream_errors(&self, name: &str) -> Vec<(String, String)> {
        self.captured(name)
            .map(|s| s.errors.lock().expect("errors poisoned").clone())
            .unwrap_or_default()
    }

    /// The flag a stream was closed with, if closed.
    pub fn close_flag(&self, name: &str) -> Option<bool> {
        self.captured(name)
            .and_then(|s| *s.closed.lock().expect("closed poisoned"))
    }

    fn captured(&self, name: &str) -> Option<Arc<CapturedStream>> {
        self.streams
            .lock()
            .expect("streams poisoned")
            .get(name)
            .cloned()
    }
}

impl Default for CapturingReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for CapturingReporter {
    fn stream(&self, name: &str) -> Arc<dyn ProgressStream> {
        let mut streams = self.streams.lock().expect("streams poisoned");
        let stream = streams
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CapturedStream {
                    successes: AtomicU64::new(0),
                    errors: Mutex::new(Vec::new()),
                    closed: Mutex::new(None),
                })
            })
            .clone();
        stream
    }
}

struct CapturedStream {
    successes: AtomicU64,
    errors: Mutex<Vec<(String, String)>>,
    closed: Mutex<Option<bool>>,
}

impl ProgressStream for CapturedStream {
    fn increment_success(&self) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }

    fn keyed_error(&self, key: &str, message: &str) {
        let mut errors = self.errors.lock().expect("errors poisoned");
        if errors.iter().any(|(k, _)| k == key) {
            return;
        }
        errors.push((key.to_string(), message.to_string()));
    }

    fn close(&self, successful: bool) {
        let mut closed = self.closed.lock().expect("closed poisoned");
        if closed.is_none() {
            *closed = Some(successful);
        }
    }
}
