//! Cloud album index and title binding.
//!
//! At run start the remote albums are listed once into an immutable
//! snapshot grouped by title. The album manager then resolves every
//! local album title to exactly one target album: creating a new one,
//! reusing the single match, or, when several cloud albums share the
//! title, draining all of them into a chosen primary.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::try_join_all;
use tracing::info;

use crate::client::{PhotosApi, ADD_BATCH_LIMIT};
use crate::error::Result;
use crate::models::CloudAlbum;
use crate::progress::ProgressStream;
use crate::retry::{with_backoff, BackoffPolicy};

/// Snapshot of all pre-existing cloud albums, grouped by title.
///
/// Built once per run; albums created while binding are tracked in the
/// bindings themselves, never by re-querying.
#[derive(Debug, Default)]
pub struct CloudAlbumsIndex {
    by_title: HashMap<String, Vec<CloudAlbum>>,
}

impl CloudAlbumsIndex {
    /// Lists all albums from the service and groups them by title.
    pub async fn fetch(client: &dyn PhotosApi) -> Result<Self> {
        Ok(Self::from_albums(client.list_albums().await?))
    }

    /// Builds an index from an already-fetched album list.
    pub fn from_albums(albums: Vec<CloudAlbum>) -> Self {
        let mut by_title: HashMap<String, Vec<CloudAlbum>> = HashMap::new();
        for album in albums {
            by_title.entry(album.title.clone()).or_default().push(album);
        }
        Self { by_title }
    }

    /// The cloud albums titled `title`, possibly none.
    pub fn candidates(&self, title: &str) -> &[CloudAlbum] {
        self.by_title.get(title).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// The chosen cloud album for one local album title.
#[derive(Debug, Clone)]
pub struct AlbumBinding {
    /// The target album all of the title's files upload into
    pub album: CloudAlbum,

    /// Whether the album existed before this run. Drives the
    /// no-permission fallback: only adds to pre-existing albums are
    /// retried without an album.
    pub preexisting: bool,

    /// Same-titled albums whose items were moved into the target
    pub drained: Vec<CloudAlbum>,
}

/// Resolves album titles to bindings, merging duplicate cloud albums.
pub struct AlbumManager {
    client: Arc<dyn PhotosApi>,
    progress: Arc<dyn ProgressStream>,
    backoff: Arc<BackoffPolicy>,
}

impl AlbumManager {
    pub fn new(
        client: Arc<dyn PhotosApi>,
        progress: Arc<dyn ProgressStream>,
        backoff: Arc<BackoffPolicy>,
    ) -> Self {
        Self {
            client,
            progress,
            backoff,
        }
    }

    /// Binds every title to exactly one album.
    ///
    /// Distinct titles bind in parallel; within one title, duplicate
    /// merges run sequentially. Any permanent failure aborts the whole
    /// binding (and with it the run).
    pub async fn bind(
        &self,
        titles: &[String],
        index: &CloudAlbumsIndex,
    ) -> Result<BTreeMap<String, Arc<AlbumBinding>>> {
        let bindings =
            try_join_all(titles.iter().map(|title| self.bind_title(title, index))).await?;
        Ok(bindings.into_iter().collect())
    }

    async fn bind_title(
        &self,
        title: &str,
        index: &CloudAlbumsIndex,
    ) -> Result<(String, Arc<AlbumBinding>)> {
        let mut candidates = index.candidates(title).to_vec();

        let binding = match candidates.len() {
            0 => {
                let album =
                    with_backoff(&self.backoff, || self.client.create_album(title)).await?;
                info!(title, album_id = %album.id, "created album");
                AlbumBinding {
                    album,
                    preexisting: false,
                    drained: Vec::new(),
                }
            }
            1 => AlbumBinding {
                album: candidates.pop().expect("one candidate"),
                preexisting: true,
                drained: Vec::new(),
            },
            _ => {
                // Primary: highest item count, ties to the smallest id.
                candidates.sort_by(|a, b| {
                    b.media_items_count
                        .cmp(&a.media_items_count)
                        .then_with(|| a.id.cmp(&b.id))
                });
                let primary = candidates.remove(0);

                // Secondaries drain in id order.
                candidates.sort_by(|a, b| a.id.cmp(&b.id));
                for secondary in &candidates {
                    self.drain_secondary(title, &primary, secondary).await?;
                }

                AlbumBinding {
                    album: primary,
                    preexisting: true,
                    drained: candidates,
                }
            }
        };

        self.progress.increment_success();
        Ok((title.to_string(), Arc::new(binding)))
    }

    /// Moves every item of `secondary` into `primary` in bounded
    /// batches. A transiently failing batch is retried; acknowledged
    /// batches are never resent. The secondary is left in place (the
    /// API forbids deleting it) and reported for manual cleanup.
    async fn drain_secondary(
        &self,
        title: &str,
        primary: &CloudAlbum,
        secondary: &CloudAlbum,
    ) -> Result<()> {
        let items = with_backoff(&self.backoff, || {
            self.client.get_album_items(&secondary.id)
        })
        .await?;
        let ids: Vec<String> = items.into_iter().map(|item| item.id).collect();

        info!(
            title,
            from = %secondary.id,
            to = %primary.id,
            items = ids.len(),
            "merging duplicate album"
        );

        for chunk in ids.chunks(ADD_BATCH_LIMIT) {
            with_backoff(&self.backoff, || {
                self.client.batch_add_to_album(&primary.id, chunk)
            })
            .await?;
        }

        self.progress.keyed_error(
            secondary.display_url(),
            &format!(
                "Album '{title}' may now be empty and will require manual deletion in Google Photos"
            ),
        );
        Ok(())
    }
}
