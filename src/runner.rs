//! Run controller.
//!
//! Composes the scanner, albums index, album manager, orchestrator and
//! state keeper into a single run: scan and index in parallel, bind
//! albums, submit every file in order, await all outcomes. Whatever
//! happens, the state is flushed once and both progress streams are
//! closed exactly once with a flag reflecting the outcome.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::albums::{AlbumManager, CloudAlbumsIndex};
use crate::client::PhotosApi;
use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::progress::{reconcile_stream_name, ProgressReporter, ProgressStream, UPLOAD_STREAM_NAME};
use crate::retry::{BackoffPolicy, DEFAULT_RETRY_BUDGET};
use crate::scanner;
use crate::store::{StateKeeper, StateStore};
use crate::uploader::{UploadOutcome, Uploader, UploaderConfig};

/// Settings for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Root of the local directory tree to upload
    pub root: PathBuf,

    /// When false, prior upload state is ignored for skip decisions
    /// (everything re-uploads; records are still written)
    pub resume: bool,

    /// Maximum files in flight at once
    pub parallelism: usize,

    /// Maximum API requests per second
    pub requests_per_sec: u32,

    /// Budget of consecutive transient retries before a failure turns
    /// fatal
    pub retry_budget: u32,

    /// Overall wall-clock limit for the run
    pub deadline: Option<Duration>,

    /// Where the upload state lives; `None` for the per-user default
    pub state_path: Option<PathBuf>,

    /// Debounce window of the state writer
    pub save_debounce: Duration,

    /// Validity window of stored upload tokens
    pub token_ttl: chrono::Duration,
}

impl RunConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            resume: true,
            parallelism: num_cpus::get().max(1),
            requests_per_sec: 10,
            retry_budget: DEFAULT_RETRY_BUDGET,
            deadline: None,
            state_path: None,
            save_debounce: Duration::from_secs(1),
            token_ttl: chrono::Duration::days(1),
        }
    }
}

/// Counters for a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Media items created in this run
    pub uploaded: u64,
    /// Files skipped because a previous run already uploaded them
    pub skipped: u64,
    /// Files permanently rejected (this run or previously)
    pub rejected: u64,
    /// Files whose upload failed fatally
    pub failed: u64,
}

/// Requests cancellation of a running [`Runner::run`].
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Stops admission of new files; in-flight uploads drain and the
    /// final state flush still happens.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Owns the lifecycle of a single upload run.
pub struct Runner {
    client: Arc<dyn PhotosApi>,
    reporter: Arc<dyn ProgressReporter>,
    clock: Arc<dyn Clock>,
    config: RunConfig,
    cancel_tx: watch::Sender<bool>,
}

impl Runner {
    pub fn new(
        client: Arc<dyn PhotosApi>,
        reporter: Arc<dyn ProgressReporter>,
        clock: Arc<dyn Clock>,
        config: RunConfig,
    ) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            client,
            reporter,
            clock,
            config,
            cancel_tx,
        }
    }

    /// A handle that can cancel this run from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: self.cancel_tx.clone(),
        }
    }

    /// Executes the run to a single terminal outcome.
    pub async fn run(&self) -> Result<RunSummary> {
        let store = match &self.config.state_path {
            Some(path) => StateStore::new(path.clone()),
            None => StateStore::new(StateStore::default_path()),
        };
        let initial = store.load()?;
        info!(
            entries = initial.len(),
            state_file = %store.path().display(),
            "loaded upload state"
        );
        let keeper = StateKeeper::spawn(store, initial, self.config.save_debounce);

        // Streams register here as they open, so they can be closed
        // exactly once whichever way the body exits.
        let streams: Mutex<Vec<Arc<dyn ProgressStream>>> = Mutex::new(Vec::new());

        let mut outcome = match self.config.deadline {
            Some(limit) => match tokio::time::timeout(limit, self.run_inner(&keeper, &streams)).await
            {
                Ok(result) => result,
                Err(_) => Err(SyncError::DeadlineExceeded(limit)),
            },
            None => self.run_inner(&keeper, &streams).await,
        };

        if let Err(e) = keeper.flush().await {
            warn!(error = %e, "final state flush failed");
            if outcome.is_ok() {
                outcome = Err(e);
            }
        }

        let successful = outcome.is_ok();
        for stream in streams.lock().expect("streams poisoned").drain(..) {
            stream.close(successful);
        }
        outcome
    }

    async fn run_inner(
        &self,
        keeper: &Arc<StateKeeper>,
        streams: &Mutex<Vec<Arc<dyn ProgressStream>>>,
    ) -> Result<RunSummary> {
        let root = self.config.root.clone();
        let scan_task = tokio::task::spawn_blocking(move || scanner::scan(&root));

        let (album_dirs, index) = tokio::try_join!(
            async {
                scan_task
                    .await
                    .map_err(|e| SyncError::Io(std::io::Error::other(e.to_string())))?
            },
            CloudAlbumsIndex::fetch(self.client.as_ref()),
        )?;

        let titles: Vec<String> = album_dirs
            .iter()
            .filter_map(|dir| dir.title.clone())
            .collect();
        let total_files: usize = album_dirs.iter().map(|dir| dir.files.len()).sum();
        info!(
            albums = titles.len(),
            files = total_files,
            "scanned source tree"
        );

        let upload_stream = self.reporter.stream(UPLOAD_STREAM_NAME);
        let reconcile_stream = self.reporter.stream(&reconcile_stream_name(titles.len()));
        {
            let mut registered = streams.lock().expect("streams poisoned");
            registered.push(Arc::clone(&upload_stream));
            registered.push(Arc::clone(&reconcile_stream));
        }

        let backoff = Arc::new(BackoffPolicy::new(self.config.retry_budget));
        let manager = AlbumManager::new(
            Arc::clone(&self.client),
            Arc::clone(&reconcile_stream),
            Arc::clone(&backoff),
        );
        let bindings = manager.bind(&titles, &index).await?;

        let uploader = Uploader::new(
            Arc::clone(&self.client),
            Arc::clone(keeper),
            Arc::clone(&upload_stream),
            backoff,
            Arc::clone(&self.clock),
            UploaderConfig {
                parallelism: self.config.parallelism,
                requests_per_sec: self.config.requests_per_sec,
                resume: self.config.resume,
                token_ttl: self.config.token_ttl,
            },
        );

        // Submission order is the scan order: albums by path, files by
        // creation time, so remote album ordering follows local.
        let cancel = self.cancel_tx.subscribe();
        let mut cancelled = false;
        let mut submissions = Vec::with_capacity(total_files);
        'submit: for dir in &album_dirs {
            let binding = match &dir.title {
                Some(title) => Some(Arc::clone(
                    bindings.get(title).expect("every scanned title is bound"),
                )),
                None => None,
            };
            for file in &dir.files {
                if *cancel.borrow() {
                    cancelled = true;
                    break 'submit;
                }
                submissions.push(Arc::clone(&uploader).upload_file(file.clone(), binding.clone()));
            }
        }

        let outcomes = futures::future::join_all(submissions).await;

        let mut summary = RunSummary::default();
        let mut last_failure: Option<Arc<SyncError>> = None;
        for outcome in outcomes {
            match outcome {
                UploadOutcome::Uploaded { .. } => summary.uploaded += 1,
                UploadOutcome::AlreadyUploaded => summary.skipped += 1,
                UploadOutcome::Rejected | UploadOutcome::SkippedRejected => summary.rejected += 1,
                UploadOutcome::Failed(e) => {
                    summary.failed += 1;
                    last_failure = Some(e);
                }
            }
        }

        if let Some(failure) = last_failure {
            warn!(failed = summary.failed, "run had fatal upload failures");
            return Err(failure.duplicate());
        }
        if cancelled {
            return Err(SyncError::Cancelled);
        }

        info!(
            uploaded = summary.uploaded,
            skipped = summary.skipped,
            rejected = summary.rejected,
            "run complete"
        );
        Ok(summary)
    }
}
