//! End-to-end runner scenarios against the in-memory fake service.
//!
//! Each test builds a real directory tree under a tempdir, runs the
//! full pipeline (scan → index → bind → upload → flush), and asserts on
//! the fake's call log, the persisted state document, and the captured
//! progress events.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use gphotos_sync::client::PhotosApi;
use gphotos_sync::clock::{Clock, FixedClock};
use gphotos_sync::models::UploadState;
use gphotos_sync::progress::{ProgressReporter, UPLOAD_STREAM_NAME};
use gphotos_sync::store::StateStore;
use gphotos_sync::testing::{
    CapturingReporter, FakePhotosApi, FAIL_ALBUM_TITLE, FAIL_CREATE_MARKER,
};
use gphotos_sync::{RunConfig, Runner, SyncError};

struct Scenario {
    tmp: tempfile::TempDir,
    client: Arc<FakePhotosApi>,
    clock: Arc<FixedClock>,
}

impl Scenario {
    fn new() -> Self {
        Self {
            tmp: tempfile::tempdir().unwrap(),
            client: Arc::new(FakePhotosApi::new()),
            clock: Arc::new(FixedClock::at_epoch()),
        }
    }

    fn root(&self) -> PathBuf {
        self.tmp.path().join("photos")
    }

    /// Canonical absolute path of a file under the root, as it appears
    /// in the persisted state.
    fn state_key(&self, relative: &str) -> PathBuf {
        self.root().canonicalize().unwrap().join(relative)
    }

    fn state_path(&self) -> PathBuf {
        self.tmp.path().join("upload-state.json")
    }

    fn touch(&self, relative: &str) {
        let path = self.root().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"media-bytes").unwrap();
    }

    fn mkdir(&self, relative: &str) {
        let path = if relative == "." {
            self.root()
        } else {
            self.root().join(relative)
        };
        fs::create_dir_all(path).unwrap();
    }

    fn baseline_tree(&self) {
        self.touch("root-photo.jpg");
        self.touch("outer-album/outer-album-photo.jpg");
        self.touch("outer-album/picasa.ini");
        self.touch("outer-album/inner-album/inner-album-photo.jpg");
        self.mkdir("DS_Store");
    }

    fn runner(&self, reporter: &Arc<CapturingReporter>) -> Runner {
        let mut config = RunConfig::new(self.root());
        config.state_path = Some(self.state_path());
        config.save_debounce = Duration::from_millis(10);
        config.parallelism = 4;
        Runner::new(
            Arc::clone(&self.client) as Arc<dyn PhotosApi>,
            Arc::clone(reporter) as Arc<dyn ProgressReporter>,
            Arc::clone(&self.clock) as Arc<dyn Clock>,
            config,
        )
    }

    fn load_state(&self) -> UploadState {
        StateStore::new(self.state_path()).load().unwrap()
    }
}

fn album_id_titled(client: &FakePhotosApi, title: &str) -> String {
    let albums = client.albums_with_title(title);
    assert_eq!(albums.len(), 1, "expected exactly one album titled {title}");
    albums[0].id.clone()
}

#[tokio::test]
async fn test_baseline_tree_uploads_three_items_into_two_albums() {
    let scenario = Scenario::new();
    scenario.baseline_tree();
    let reporter = Arc::new(CapturingReporter::new());

    let summary = scenario.runner(&reporter).run().await.unwrap();
    assert_eq!(summary.uploaded, 3);
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.rejected, 0);

    // Both albums created, named after their directories.
    let outer_id = album_id_titled(&scenario.client, "outer-album");
    let inner_id = album_id_titled(&scenario.client, "outer-album: inner-album");

    // Three entries, all Created, stamped with the test clock.
    let state = scenario.load_state();
    assert_eq!(state.len(), 3);
    for (_, entry) in state.iter() {
        assert!(entry.is_created());
        let token = entry.upload_state.as_ref().unwrap();
        assert_eq!(token.upload_instant, scenario.clock.now());
    }

    // The root photo lands in no album; the others in theirs.
    let root_entry = state.get(&scenario.state_key("root-photo.jpg")).unwrap();
    assert!(root_entry.album_id.is_none());
    let outer_entry = state
        .get(&scenario.state_key("outer-album/outer-album-photo.jpg"))
        .unwrap();
    assert_eq!(outer_entry.album_id.as_deref(), Some(outer_id.as_str()));
    let inner_entry = state
        .get(&scenario.state_key("outer-album/inner-album/inner-album-photo.jpg"))
        .unwrap();
    assert_eq!(inner_entry.album_id.as_deref(), Some(inner_id.as_str()));

    // No errors; one success tick per file and per bound album; both
    // streams closed successfully.
    assert!(reporter.stream_errors(UPLOAD_STREAM_NAME).is_empty());
    assert_eq!(reporter.successes(UPLOAD_STREAM_NAME), 3);
    assert_eq!(
        reporter.successes("Reconciling 2 album(s) with Google Photos"),
        2
    );
    assert_eq!(reporter.close_flag(UPLOAD_STREAM_NAME), Some(true));
    assert_eq!(
        reporter.close_flag("Reconciling 2 album(s) with Google Photos"),
        Some(true)
    );
}

#[tokio::test]
async fn test_resume_skips_previously_created_entry() {
    let scenario = Scenario::new();
    scenario.baseline_tree();

    // A previous run already uploaded the outer photo.
    let mut prior = UploadState::default();
    prior.insert(
        &scenario.state_key("outer-album/outer-album-photo.jpg"),
        gphotos_sync::models::ItemState::created("media-prior", None, None),
    );
    StateStore::new(scenario.state_path()).save(&prior).unwrap();

    let reporter = Arc::new(CapturingReporter::new());
    let summary = scenario.runner(&reporter).run().await.unwrap();

    assert_eq!(summary.uploaded, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(
        scenario
            .client
            .upload_count(&scenario.state_key("outer-album/outer-album-photo.jpg")),
        0,
        "the skipped path's binary must not reach the cloud"
    );
    assert_eq!(scenario.client.total_uploads(), 2);
    assert!(reporter.stream_errors(UPLOAD_STREAM_NAME).is_empty());
}

#[tokio::test]
async fn test_second_identical_run_is_idempotent() {
    let scenario = Scenario::new();
    scenario.baseline_tree();

    let first = Arc::new(CapturingReporter::new());
    scenario.runner(&first).run().await.unwrap();
    let uploads_after_first = scenario.client.total_uploads();

    let second = Arc::new(CapturingReporter::new());
    let summary = scenario.runner(&second).run().await.unwrap();

    assert_eq!(summary.uploaded, 0);
    assert_eq!(summary.skipped, 3);
    assert_eq!(scenario.client.total_uploads(), uploads_after_first);
    assert!(second.stream_errors(UPLOAD_STREAM_NAME).is_empty());
}

#[tokio::test]
async fn test_duplicate_cloud_albums_merge_into_one_primary() {
    let scenario = Scenario::new();
    scenario.baseline_tree();

    // Two pre-existing albums share the outer directory's title, each
    // holding one item already.
    let first = scenario.client.seed_album("outer-album", &["existing-1"]);
    let second = scenario.client.seed_album("outer-album", &["existing-2"]);

    let reporter = Arc::new(CapturingReporter::new());
    let summary = scenario.runner(&reporter).run().await.unwrap();
    assert_eq!(summary.uploaded, 3);

    // One primary ends up with both pre-existing items plus the new
    // photo. Counts tie, so the smaller id wins.
    let primary_items = scenario.client.album_items_for_test(&first.id);
    assert!(primary_items.contains(&"existing-1".to_string()));
    assert!(primary_items.contains(&"existing-2".to_string()));
    assert_eq!(primary_items.len(), 3);

    // One keyed error per drained secondary, on the reconcile stream.
    let reconcile = "Reconciling 2 album(s) with Google Photos";
    let errors = reporter.stream_errors(reconcile);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, second.display_url());
    assert!(errors[0]
        .1
        .contains("Album 'outer-album' may now be empty and will require manual deletion"));
    assert_eq!(reporter.close_flag(reconcile), Some(true));
}

#[tokio::test]
async fn test_invalid_argument_on_creation_rejects_but_run_succeeds() {
    let scenario = Scenario::new();
    scenario.baseline_tree();
    let failing = format!("{FAIL_CREATE_MARKER}.jpg");
    scenario.touch(&failing);

    let reporter = Arc::new(CapturingReporter::new());
    let summary = scenario.runner(&reporter).run().await.unwrap();

    assert_eq!(summary.uploaded, 3);
    assert_eq!(summary.rejected, 1);

    let failing_key = scenario.state_key(&failing);
    let errors = reporter.stream_errors(UPLOAD_STREAM_NAME);
    assert_eq!(
        errors,
        vec![(
            failing_key.display().to_string(),
            "INVALID_ARGUMENT: createMediaItems".to_string()
        )]
    );

    // Rejected entry: no media id, token kept and prefixed by the path.
    let state = scenario.load_state();
    let entry = state.get(&failing_key).unwrap();
    assert!(entry.media_id.is_none());
    let token = entry.upload_state.as_ref().unwrap();
    assert!(token.token.starts_with(&failing_key.display().to_string()));
    assert_eq!(token.upload_instant, scenario.clock.now());

    // With the failure gone, the next run exchanges the stored token:
    // the item is created without re-uploading its binary.
    let uploads_before = scenario.client.total_uploads();
    scenario.client.set_failures_enabled(false);
    let reporter = Arc::new(CapturingReporter::new());
    let summary = scenario.runner(&reporter).run().await.unwrap();

    assert_eq!(summary.uploaded, 1);
    assert_eq!(summary.skipped, 3);
    assert_eq!(scenario.client.total_uploads(), uploads_before);
    assert!(scenario.load_state().get(&failing_key).unwrap().is_created());
}

#[tokio::test]
async fn test_album_permission_denied_uploads_without_album() {
    let scenario = Scenario::new();
    scenario.client.seed_album(FAIL_ALBUM_TITLE, &[]);
    scenario.touch(&format!("{FAIL_ALBUM_TITLE}/photoInPreExistingAlbum.jpg"));

    let reporter = Arc::new(CapturingReporter::new());
    let summary = scenario.runner(&reporter).run().await.unwrap();
    assert_eq!(summary.uploaded, 1);

    let key = scenario.state_key(&format!("{FAIL_ALBUM_TITLE}/photoInPreExistingAlbum.jpg"));
    let state = scenario.load_state();
    let entry = state.get(&key).unwrap();
    assert!(entry.is_created());
    assert!(entry.album_id.is_none(), "item must end in no-album state");

    let errors = reporter.stream_errors(UPLOAD_STREAM_NAME);
    assert_eq!(
        errors,
        vec![(
            key.display().to_string(),
            "INVALID_ARGUMENT: No permission to add media items to this album".to_string()
        )]
    );
}

#[tokio::test]
async fn test_stale_token_is_discarded_on_later_run() {
    let scenario = Scenario::new();
    scenario.touch("a.jpg");
    let key = scenario.state_key("a.jpg");

    // First run is interrupted after the binary upload: simulate by
    // persisting the Tokenised state directly.
    let mut prior = UploadState::default();
    prior.insert(
        &key,
        gphotos_sync::models::ItemState::tokenised(
            gphotos_sync::models::UploadedToken::new("old-token", scenario.clock.now()),
        ),
    );
    StateStore::new(scenario.state_path()).save(&prior).unwrap();

    // Two days later the token is past its validity window.
    scenario.clock.advance(chrono::Duration::days(2));

    let reporter = Arc::new(CapturingReporter::new());
    let summary = scenario.runner(&reporter).run().await.unwrap();

    assert_eq!(summary.uploaded, 1);
    assert_eq!(scenario.client.upload_count(&key), 1, "binary re-uploaded");
}

#[tokio::test]
async fn test_no_resume_reuploads_but_keeps_persisting() {
    let scenario = Scenario::new();
    scenario.touch("a.jpg");

    let reporter = Arc::new(CapturingReporter::new());
    scenario.runner(&reporter).run().await.unwrap();
    assert_eq!(scenario.client.total_uploads(), 1);

    let reporter = Arc::new(CapturingReporter::new());
    let mut config = RunConfig::new(scenario.root());
    config.state_path = Some(scenario.state_path());
    config.save_debounce = Duration::from_millis(10);
    config.resume = false;
    let runner = Runner::new(
        Arc::clone(&scenario.client) as Arc<dyn PhotosApi>,
        Arc::clone(&reporter) as Arc<dyn ProgressReporter>,
        Arc::clone(&scenario.clock) as Arc<dyn Clock>,
        config,
    );
    let summary = runner.run().await.unwrap();

    assert_eq!(summary.uploaded, 1);
    assert_eq!(summary.skipped, 0);
    assert_eq!(scenario.client.total_uploads(), 2);
    assert_eq!(scenario.load_state().len(), 1);
}

#[tokio::test]
async fn test_empty_root_succeeds_with_no_work() {
    let scenario = Scenario::new();
    scenario.mkdir(".");

    let reporter = Arc::new(CapturingReporter::new());
    let summary = scenario.runner(&reporter).run().await.unwrap();

    assert_eq!(summary, Default::default());
    assert_eq!(scenario.client.total_uploads(), 0);
    assert_eq!(reporter.close_flag(UPLOAD_STREAM_NAME), Some(true));
    assert_eq!(
        reporter.close_flag("Reconciling 0 album(s) with Google Photos"),
        Some(true)
    );
    assert_eq!(
        reporter.stream_names(),
        vec![
            "Reconciling 0 album(s) with Google Photos".to_string(),
            UPLOAD_STREAM_NAME.to_string()
        ]
    );
}

#[tokio::test]
async fn test_album_listing_failure_fails_the_run() {
    let scenario = Scenario::new();
    scenario.touch("a.jpg");
    scenario.client.fail_next_with_status(403);

    let reporter = Arc::new(CapturingReporter::new());
    let result = scenario.runner(&reporter).run().await;

    assert!(matches!(result, Err(SyncError::Api { status: 403, .. })));
    assert_eq!(scenario.client.total_uploads(), 0);
}

#[tokio::test]
async fn test_fatal_upload_failure_closes_streams_unsuccessfully() {
    let scenario = Scenario::new();
    scenario.touch("a.jpg");
    scenario.client.fail_uploads_with_status(403);

    let reporter = Arc::new(CapturingReporter::new());
    let result = scenario.runner(&reporter).run().await;

    assert!(matches!(result, Err(SyncError::Api { status: 403, .. })));
    assert_eq!(reporter.close_flag(UPLOAD_STREAM_NAME), Some(false));
    assert_eq!(
        reporter.close_flag("Reconciling 0 album(s) with Google Photos"),
        Some(false)
    );
}

#[tokio::test]
async fn test_corrupt_state_file_is_fatal() {
    let scenario = Scenario::new();
    scenario.touch("a.jpg");
    fs::write(scenario.state_path(), b"{definitely not json").unwrap();

    let reporter = Arc::new(CapturingReporter::new());
    let result = scenario.runner(&reporter).run().await;
    assert!(matches!(result, Err(SyncError::CorruptState { .. })));
}

#[tokio::test]
async fn test_state_entries_accumulate_across_runs() {
    let scenario = Scenario::new();
    scenario.touch("first/a.jpg");

    let reporter = Arc::new(CapturingReporter::new());
    scenario.runner(&reporter).run().await.unwrap();
    assert_eq!(scenario.load_state().len(), 1);

    // A later run sees a grown tree; earlier entries survive.
    scenario.touch("second/b.jpg");
    let reporter = Arc::new(CapturingReporter::new());
    let summary = scenario.runner(&reporter).run().await.unwrap();

    assert_eq!(summary.uploaded, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(scenario.load_state().len(), 2);
}

#[tokio::test]
async fn test_cancel_before_run_stops_admission() {
    let scenario = Scenario::new();
    scenario.baseline_tree();

    let reporter = Arc::new(CapturingReporter::new());
    let runner = scenario.runner(&reporter);
    runner.cancel_handle().cancel();

    let result = runner.run().await;
    assert!(matches!(result, Err(SyncError::Cancelled)));
    assert_eq!(scenario.client.total_uploads(), 0);
    assert_eq!(reporter.close_flag(UPLOAD_STREAM_NAME), Some(false));
}

/// Paths that moved to a different directory are not re-associated:
/// the entry stays Created under its original album.
#[tokio::test]
async fn test_moved_file_is_skipped_not_reassociated() {
    let scenario = Scenario::new();
    scenario.touch("new-album/a.jpg");
    let key = scenario.state_key("new-album/a.jpg");

    let mut prior = UploadState::default();
    prior.insert(
        &key,
        gphotos_sync::models::ItemState::created("media-old", Some("old-album".into()), None),
    );
    StateStore::new(scenario.state_path()).save(&prior).unwrap();

    let reporter = Arc::new(CapturingReporter::new());
    let summary = scenario.runner(&reporter).run().await.unwrap();

    assert_eq!(summary.skipped, 1);
    assert_eq!(scenario.client.total_uploads(), 0);
    let state = scenario.load_state();
    assert_eq!(
        state.get(&key).unwrap().album_id.as_deref(),
        Some("old-album")
    );
}
