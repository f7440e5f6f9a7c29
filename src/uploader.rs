//! Upload orchestrator.
//!
//! Drives every file through a small state machine persisted in the
//! upload state: Unknown → Tokenised (binary uploaded, token held) →
//! Created (media item exists). Work is submitted through a bounded
//! worker pool with a shared request rate limit; per-path work is
//! coalesced so a path is never uploaded twice concurrently, and
//! completed results stay cached for O(1) skip decisions.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::albums::AlbumBinding;
use crate::client::PhotosApi;
use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::models::{ItemState, MediaItem, UploadedToken};
use crate::progress::ProgressStream;
use crate::retry::{with_backoff, BackoffPolicy, ItemFailure, ItemFailurePolicy, UploadPhase};
use crate::store::StateKeeper;

/// Type alias for the governor rate limiter.
type DirectRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Orchestrator tuning knobs.
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Maximum files in flight at once (≥ 1)
    pub parallelism: usize,

    /// Maximum requests per second to the API
    pub requests_per_sec: u32,

    /// When false, previously recorded uploads are not skipped (records
    /// are still written)
    pub resume: bool,

    /// Upload tokens older than this are discarded and the binary
    /// re-uploaded. The service documents one day of validity.
    pub token_ttl: chrono::Duration,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            parallelism: num_cpus::get().max(1),
            requests_per_sec: 10,
            resume: true,
            token_ttl: chrono::Duration::days(1),
        }
    }
}

/// Terminal outcome for one file.
#[derive(Debug, Clone)]
pub enum UploadOutcome {
    /// A media item was created in this run
    Uploaded {
        /// Remote id of the new media item
        media_id: String,
    },

    /// Skipped: a previous run already created the item
    AlreadyUploaded,

    /// Skipped: a previous run rejected the item permanently and left
    /// nothing to retry
    SkippedRejected,

    /// Permanently rejected in this run
    Rejected,

    /// Fatal failure; surfaces as the run's last failure
    Failed(Arc<SyncError>),
}

type PendingUpload = Shared<BoxFuture<'static, UploadOutcome>>;

/// Per-file upload pipeline with bounded concurrency.
pub struct Uploader {
    client: Arc<dyn PhotosApi>,
    state: Arc<StateKeeper>,
    progress: Arc<dyn ProgressStream>,
    backoff: Arc<BackoffPolicy>,
    item_policy: ItemFailurePolicy,
    clock: Arc<dyn Clock>,
    rate_limiter: DirectRateLimiter,
    concurrency: Arc<Semaphore>,
    pending: Mutex<HashMap<PathBuf, PendingUpload>>,
    config: UploaderConfig,
}

impl Uploader {
    pub fn new(
        client: Arc<dyn PhotosApi>,
        state: Arc<StateKeeper>,
        progress: Arc<dyn ProgressStream>,
        backoff: Arc<BackoffPolicy>,
        clock: Arc<dyn Clock>,
        config: UploaderConfig,
    ) -> Arc<Self> {
        let quota = Quota::per_second(
            NonZeroU32::new(config.requests_per_sec).unwrap_or(nonzero!(10u32)),
        );
        let concurrency = Arc::new(Semaphore::new(config.parallelism.max(1)));

        Arc::new(Self {
            client,
            state,
            progress,
            backoff,
            item_policy: ItemFailurePolicy,
            clock,
            rate_limiter: RateLimiter::direct(quota),
            concurrency,
            pending: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// Submits one file for upload into the bound album (or no album for
    /// root files).
    ///
    /// Calls for a path with an upload already in flight attach to the
    /// pending result instead of launching a duplicate; completed
    /// results are returned immediately.
    pub fn upload_file(
        self: Arc<Self>,
        path: PathBuf,
        binding: Option<Arc<AlbumBinding>>,
    ) -> PendingUpload {
        let mut pending = self.pending.lock().expect("pending poisoned");
        if let Some(existing) = pending.get(&path) {
            return existing.clone();
        }

        let this = Arc::clone(&self);
        let task_path = path.clone();
        let future = async move { this.run_one(task_path, binding).await }
            .boxed()
            .shared();
        pending.insert(path, future.clone());
        future
    }

    async fn run_one(
        self: Arc<Self>,
        path: PathBuf,
        binding: Option<Arc<AlbumBinding>>,
    ) -> UploadOutcome {
        let _permit = match Arc::clone(&self.concurrency).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return UploadOutcome::Failed(Arc::new(SyncError::Cancelled)),
        };

        match self.try_upload(&path, binding.as_deref()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "upload failed");
                UploadOutcome::Failed(Arc::new(e))
            }
        }
    }

    async fn try_upload(
        &self,
        path: &Path,
        binding: Option<&AlbumBinding>,
    ) -> Result<UploadOutcome> {
        let prior = if self.config.resume {
            self.state.get(path)
        } else {
            None
        };

        if let Some(entry) = &prior {
            if entry.is_created() {
                // Also covers an item now sitting under a different
                // directory: it stays in its old album.
                debug!(path = %path.display(), "already uploaded, skipping");
                self.progress.increment_success();
                return Ok(UploadOutcome::AlreadyUploaded);
            }
            if entry.is_rejected() {
                info!(path = %path.display(), "previously rejected, skipping");
                return Ok(UploadOutcome::SkippedRejected);
            }
        }

        // A prior run may have left a reusable upload token behind.
        let now = self.clock.now();
        let reusable = prior
            .and_then(|entry| entry.upload_state)
            .filter(|token| !token.is_expired(now, self.config.token_ttl));

        let token = match reusable {
            Some(token) => {
                debug!(path = %path.display(), "reusing stored upload token");
                token
            }
            None => match self.upload_binary(path).await? {
                Some(token) => token,
                None => return Ok(UploadOutcome::Rejected),
            },
        };

        self.create_item(path, binding, token).await
    }

    /// Uploads the file's bytes, persisting the Tokenised state on
    /// success. Returns `None` when the binary itself is rejected, in
    /// which case nothing is persisted.
    async fn upload_binary(&self, path: &Path) -> Result<Option<UploadedToken>> {
        let uploaded = with_backoff(&self.backoff, || {
            self.rate_limited(self.client.upload_media_data(path))
        })
        .await;

        match uploaded {
            Ok(raw_token) => {
                let token = UploadedToken::new(raw_token, self.clock.now());
                self.state.record(path, ItemState::tokenised(token.clone()));
                Ok(Some(token))
            }
            Err(e) => match self.item_policy.assess(&e, UploadPhase::MediaData, false) {
                Some(ItemFailure::RejectUpload) => {
                    self.progress.keyed_error(
                        &path.display().to_string(),
                        "INVALID_ARGUMENT: uploadMediaData",
                    );
                    Ok(None)
                }
                _ => Err(e),
            },
        }
    }

    /// Exchanges the token for a media item, handling the permanent
    /// rejection and no-permission fallbacks.
    async fn create_item(
        &self,
        path: &Path,
        binding: Option<&AlbumBinding>,
        token: UploadedToken,
    ) -> Result<UploadOutcome> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let album_id = binding.map(|b| b.album.id.clone());
        let into_preexisting = album_id.is_some() && binding.is_some_and(|b| b.preexisting);

        let created = self
            .try_create(album_id.as_deref(), &token, &file_name)
            .await;

        match created {
            Ok(item) => Ok(self.record_created(path, item, album_id, token)),
            Err(e) => match self
                .item_policy
                .assess(&e, UploadPhase::CreateMediaItem, into_preexisting)
            {
                Some(ItemFailure::AlbumPermission) => {
                    self.progress.keyed_error(
                        &path.display().to_string(),
                        "INVALID_ARGUMENT: No permission to add media items to this album",
                    );
                    // One more attempt, into no album at all.
                    match self.try_create(None, &token, &file_name).await {
                        Ok(item) => Ok(self.record_created(path, item, None, token)),
                        Err(retry_err) => match self.item_policy.assess(
                            &retry_err,
                            UploadPhase::CreateMediaItem,
                            false,
                        ) {
                            Some(ItemFailure::RejectCreate) => {
                                Ok(self.record_rejected(path, token))
                            }
                            _ => Err(retry_err),
                        },
                    }
                }
                Some(ItemFailure::RejectCreate) => Ok(self.record_rejected(path, token)),
                _ => Err(e),
            },
        }
    }

    async fn try_create(
        &self,
        album_id: Option<&str>,
        token: &UploadedToken,
        file_name: &str,
    ) -> Result<MediaItem> {
        with_backoff(&self.backoff, || {
            self.rate_limited(
                self.client
                    .create_media_item(album_id, &token.token, file_name),
            )
        })
        .await
    }

    fn record_created(
        &self,
        path: &Path,
        item: MediaItem,
        album_id: Option<String>,
        token: UploadedToken,
    ) -> UploadOutcome {
        info!(path = %path.display(), media_id = %item.id, "uploaded");
        self.state
            .record(path, ItemState::created(item.id.clone(), album_id, Some(token)));
        self.progress.increment_success();
        UploadOutcome::Uploaded { media_id: item.id }
    }

    /// Persists the permanent rejection, keeping the token so the next
    /// run skips the binary upload.
    fn record_rejected(&self, path: &Path, token: UploadedToken) -> UploadOutcome {
        self.state.record(path, ItemState::tokenised(token));
        self.progress.keyed_error(
            &path.display().to_string(),
            "INVALID_ARGUMENT: createMediaItems",
        );
        UploadOutcome::Rejected
    }

    /// Waits for rate limit allowance before executing an operation.
    async fn rate_limited<T>(&self, op: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        self.rate_limiter.until_ready().await;
        op.await
    }
}
