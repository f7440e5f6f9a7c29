//! Progress streams.
//!
//! The run reports through named streams: a success counter plus keyed
//! errors (one per key, so a repeating failure does not flood the
//! output). Streams are closed exactly once, with a flag reflecting the
//! run outcome. The console implementation renders each stream as an
//! indicatif progress bar.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Stream carrying per-file upload outcomes.
pub const UPLOAD_STREAM_NAME: &str = "Uploading media files";

/// Name of the stream carrying album reconciliation outcomes, where
/// `albums` is the number of album directories in this run.
pub fn reconcile_stream_name(albums: usize) -> String {
    format!("Reconciling {albums} album(s) with Google Photos")
}

/// One named progress stream.
pub trait ProgressStream: Send + Sync {
    /// Records one more successfully handled unit of work.
    fn increment_success(&self);

    /// Records an error for `key`. At most one error is kept per key;
    /// later reports for the same key are dropped. Never fails into the
    /// caller.
    fn keyed_error(&self, key: &str, message: &str);

    /// Closes the stream. Later events are ignored.
    fn close(&self, successful: bool);
}

/// Creates progress streams on demand.
pub trait ProgressReporter: Send + Sync {
    /// Opens (or returns) the stream with the given name.
    fn stream(&self, name: &str) -> Arc<dyn ProgressStream>;
}

/// Console reporter rendering each stream as a progress bar.
pub struct ConsoleReporter {
    multi: MultiProgress,
}

impl ConsoleReporter {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
        }
    }
}

impl Default for ConsoleReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for ConsoleReporter {
    fn stream(&self, name: &str) -> Arc<dyn ProgressStream> {
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} {msg}: {pos} done")
            .expect("valid template");

        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(style);
        bar.set_message(name.to_string());

        Arc::new(ConsoleStream {
            bar,
            name: name.to_string(),
            errors: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        })
    }
}

struct ConsoleStream {
    bar: ProgressBar,
    name: String,
    errors: Mutex<BTreeMap<String, String>>,
    closed: AtomicBool,
}

impl ProgressStream for ConsoleStream {
    fn increment_success(&self) {
        if !self.closed.load(Ordering::SeqCst) {
            self.bar.inc(1);
        }
    }

    fn keyed_error(&self, key: &str, message: &str) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut errors = self.errors.lock().expect("errors poisoned");
        if errors.contains_key(key) {
            return;
        }
        errors.insert(key.to_string(), message.to_string());
        self.bar
            .println(format!("[{}] {}: {}", self.name, key, message));
    }

    fn close(&self, successful: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let errors = self.errors.lock().expect("errors poisoned").len();
        let summary = match (successful, errors) {
            (true, 0) => "complete".to_string(),
            (true, n) => format!("complete, {n} error(s)"),
            (false, _) => "failed".to_string(),
        };
        self.bar
            .finish_with_message(format!("{}: {}", self.name, summary));
    }
}
