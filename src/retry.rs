//! Retry and backoff policies.
//!
//! Two concerns, kept apart: transient failures retry the same action
//! under an exponential backoff shared across the run, while
//! `INVALID_ARGUMENT` rejections are permanent for the item that caused
//! them and map to a phase-specific outcome.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tracing::debug;

use crate::error::{ErrorClass, Result, SyncError};

/// Default budget of consecutive transient retries before the failure
/// is treated as fatal.
pub const DEFAULT_RETRY_BUDGET: u32 = 10;

const INITIAL_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Exponential backoff over consecutive transient failures.
///
/// The schedule is per run: any success resets it, and once the number
/// of consecutive failures exceeds the budget the caller converts the
/// failure to fatal. The policy itself only keeps counters.
#[derive(Debug)]
pub struct BackoffPolicy {
    budget: u32,
    consecutive: AtomicU32,
}

impl BackoffPolicy {
    pub fn new(budget: u32) -> Self {
        Self {
            budget,
            consecutive: AtomicU32::new(0),
        }
    }

    /// Resets the schedule after a successful call.
    pub fn on_success(&self) {
        self.consecutive.store(0, Ordering::SeqCst);
    }

    /// Registers one more consecutive transient failure and advises the
    /// delay before the next attempt, or `None` once the budget is
    /// exhausted.
    pub fn next_delay(&self) -> Option<Duration> {
        let failures = self.consecutive.fetch_add(1, Ordering::SeqCst) + 1;
        if failures > self.budget {
            return None;
        }
        let exponent = failures.saturating_sub(1).min(31);
        let delay = INITIAL_DELAY.saturating_mul(1u32 << exponent);
        Some(delay.min(MAX_DELAY))
    }

    /// Consecutive transient failures seen since the last success.
    pub fn consecutive(&self) -> u32 {
        self.consecutive.load(Ordering::SeqCst)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_BUDGET)
    }
}

/// Runs `op`, retrying transient failures under `policy` until it
/// succeeds, fails permanently, or the budget runs out.
pub async fn with_backoff<T, F, Fut>(policy: &BackoffPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        match op().await {
            Ok(value) => {
                policy.on_success();
                return Ok(value);
            }
            Err(e) if e.class() == ErrorClass::Transient => match policy.next_delay() {
                Some(delay) => {
                    debug!(error = %e, ?delay, "transient failure, backing off");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(SyncError::RetriesExhausted {
                        retries: policy.consecutive(),
                        last: e.to_string(),
                    });
                }
            },
            Err(e) => return Err(e),
        }
    }
}

/// Remote interaction that an `INVALID_ARGUMENT` rejection can abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    /// Uploading the binary for an upload token
    MediaData,
    /// Exchanging the token for a media item
    CreateMediaItem,
}

/// Permanent per-item outcome of an `INVALID_ARGUMENT` rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemFailure {
    /// The binary itself was rejected; nothing is persisted
    RejectUpload,
    /// Item creation was rejected; the token is kept so the binary is
    /// not re-uploaded next run
    RejectCreate,
    /// Creation into a pre-existing album was rejected; the upload is
    /// retried once with no album
    AlbumPermission,
}

/// Maps `INVALID_ARGUMENT` rejections to their permanent outcome.
#[derive(Debug, Default, Clone, Copy)]
pub struct ItemFailurePolicy;

impl ItemFailurePolicy {
    /// Assesses `error` for the given phase. Returns `None` when the
    /// error is not an item-level rejection.
    pub fn assess(
        &self,
        error: &SyncError,
        phase: UploadPhase,
        into_preexisting_album: bool,
    ) -> Option<ItemFailure> {
        if error.class() != ErrorClass::InvalidArgument {
            return None;
        }
        Some(match phase {
            UploadPhase::MediaData => ItemFailure::RejectUpload,
            UploadPhase::CreateMediaItem if into_preexisting_album => ItemFailure::AlbumPermission,
            UploadPhase::CreateMediaItem => ItemFailure::RejectCreate,
        })
    }
}
