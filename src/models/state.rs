//! Persisted upload-state document.
//!
//! The document maps each absolute local path to the record of its last
//! upload. Records are immutable values; the uploader replaces a path's
//! record wholesale rather than mutating it in place. Unknown JSON fields
//! at every level are captured and written back verbatim on re-save.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A raw upload token together with the instant the binary upload
/// completed. Tokens are valid server-side for about a day; older ones
/// are discarded and the binary re-uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedToken {
    /// Opaque upload receipt returned by the binary-upload step
    pub token: String,

    /// When the binary upload completed
    pub upload_instant: DateTime<Utc>,

    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl UploadedToken {
    /// Creates a token record stamped at `instant`.
    pub fn new(token: impl Into<String>, instant: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            upload_instant: instant,
            extra: Map::new(),
        }
    }

    /// Whether the token is older than `ttl` at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now.signed_duration_since(self.upload_instant) > ttl
    }
}

/// Per-file upload record.
///
/// The combination of fields encodes the file's position in the upload
/// state machine:
///
/// - `media_id` present: the item was created remotely (**Created**);
/// - `media_id` absent, `upload_state` present: a binary was uploaded but
///   item creation has not succeeded (**Tokenised**). This is also the
///   persisted form of a permanent item rejection, so the binary is not
///   re-uploaded on the next run;
/// - both absent: permanently rejected with nothing worth keeping
///   (**Rejected** sentinel); such records are skipped and never written
///   by this implementation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemState {
    /// Remote media item id of the created item
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_id: Option<String>,

    /// Album the item was added to at the time of its last successful
    /// upload, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album_id: Option<String>,

    /// Upload token for the binary, kept so creation can be retried
    /// without re-uploading
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_state: Option<UploadedToken>,

    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl ItemState {
    /// Record for a successfully created media item.
    pub fn created(
        media_id: impl Into<String>,
        album_id: Option<String>,
        upload_state: Option<UploadedToken>,
    ) -> Self {
        Self {
            media_id: Some(media_id.into()),
            album_id,
            upload_state,
            extra: Map::new(),
        }
    }

    /// Record for an uploaded binary whose media item does not exist yet.
    pub fn tokenised(upload_state: UploadedToken) -> Self {
        Self {
            media_id: None,
            album_id: None,
            upload_state: Some(upload_state),
            extra: Map::new(),
        }
    }

    /// The item was created remotely.
    pub fn is_created(&self) -> bool {
        self.media_id.is_some()
    }

    /// Degenerate sentinel: permanently rejected with no token to reuse.
    pub fn is_rejected(&self) -> bool {
        self.media_id.is_none() && self.upload_state.is_none()
    }

    /// A written record must carry a media id or an upload token;
    /// anything else is meaningless and must not be persisted.
    pub fn is_meaningful(&self) -> bool {
        !self.is_rejected()
    }
}

/// The whole persisted document: absolute path → [`ItemState`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadState {
    #[serde(default)]
    photos_uploader: Section,

    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Section {
    #[serde(default)]
    uploaded_media_item_id_by_absolute_path: BTreeMap<String, ItemState>,

    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl UploadState {
    /// Looks up the record for an absolute path.
    pub fn get(&self, path: &Path) -> Option<&ItemState> {
        self.photos_uploader
            .uploaded_media_item_id_by_absolute_path
            .get(&key_for(path))
    }

    /// Replaces the record for an absolute path.
    ///
    /// Meaningless records (neither media id nor token) are refused:
    /// records are never deleted, and an empty sentinel carries no
    /// information worth writing.
    pub fn insert(&mut self, path: &Path, item: ItemState) {
        if item.is_meaningful() {
            self.photos_uploader
                .uploaded_media_item_id_by_absolute_path
                .insert(key_for(path), item);
        }
    }

    /// Number of recorded paths.
    pub fn len(&self) -> usize {
        self.photos_uploader
            .uploaded_media_item_id_by_absolute_path
            .len()
    }

    /// Whether any path has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over `(path key, record)` pairs in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ItemState)> {
        self.photos_uploader
            .uploaded_media_item_id_by_absolute_path
            .iter()
    }
}

fn key_for(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
