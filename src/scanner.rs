//! Source-tree scanner.
//!
//! Walks the root directory and produces the list of album directories:
//! each local directory that (transitively) contains at least one
//! uploadable file, plus the root itself. Directory structure maps to
//! album titles; nesting is flattened with `": "` between levels.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::UNIX_EPOCH;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use walkdir::WalkDir;

use crate::error::Result;

/// Separator between nested directory names in an album title.
pub const TITLE_SEPARATOR: &str = ": ";

/// Directory names holding platform metadata rather than media.
const METADATA_DIRS: &[&str] = &["DS_Store", "@eaDir", "__MACOSX"];

/// A local directory that becomes, or binds to, one cloud album.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumDirectory {
    /// Absolute path of the directory
    pub path: PathBuf,

    /// Album title; `None` for the root directory, whose files are
    /// uploaded without an album
    pub title: Option<String>,

    /// Uploadable files directly inside this directory, in submission
    /// order (creation-time heuristic)
    pub files: Vec<PathBuf>,
}

/// Scans `root` and returns album directories sorted by path.
///
/// The root is always first and titleless. Every other directory is
/// included iff it or one of its descendants contains an uploadable file.
pub fn scan(root: &Path) -> Result<Vec<AlbumDirectory>> {
    let root = root.canonicalize()?;

    // Collect uploadable files grouped by parent directory, pruning
    // metadata and hidden directories during the walk.
    let mut files_by_dir: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
    let walker = WalkDir::new(&root)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_skippable_dir_name(&e.file_name().to_string_lossy()));

    for entry in walker {
        let entry = entry.map_err(|e| std::io::Error::other(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if is_skippable_file_name(&name) {
            continue;
        }
        let parent = entry
            .path()
            .parent()
            .unwrap_or(&root)
            .to_path_buf();
        files_by_dir
            .entry(parent)
            .or_default()
            .push(entry.path().to_path_buf());
    }

    // A directory is an album directory if any descendant holds a file.
    let mut album_dirs: BTreeSet<PathBuf> = BTreeSet::new();
    album_dirs.insert(root.clone());
    for dir in files_by_dir.keys() {
        let mut current = dir.as_path();
        while current != root {
            album_dirs.insert(current.to_path_buf());
            match current.parent() {
                Some(parent) => current = parent,
                None => break,
            }
        }
    }

    let mut result = Vec::with_capacity(album_dirs.len());
    for dir in album_dirs {
        let title = title_for(&root, &dir);
        let mut files = files_by_dir.remove(&dir).unwrap_or_default();
        sort_by_creation_hint(&mut files);
        result.push(AlbumDirectory {
            path: dir,
            title,
            files,
        });
    }
    Ok(result)
}

/// Whether a file is excluded from upload by name.
fn is_skippable_file_name(name: &str) -> bool {
    name.starts_with('.') || name.eq_ignore_ascii_case("picasa.ini")
}

/// Whether a directory's contents are excluded wholesale.
fn is_skippable_dir_name(name: &str) -> bool {
    name.starts_with('.') || METADATA_DIRS.iter().any(|d| d.eq_ignore_ascii_case(name))
}

/// Album title for `dir`: ancestor directory names below the root,
/// joined with [`TITLE_SEPARATOR`]. The root itself has no title.
fn title_for(root: &Path, dir: &Path) -> Option<String> {
    let relative = dir.strip_prefix(root).ok()?;
    let components: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if components.is_empty() {
        None
    } else {
        Some(components.join(TITLE_SEPARATOR))
    }
}

/// Sorts files by creation time: a `YYYY_MM_DD_HH_MM_SS` pattern in the
/// filename wins, filesystem mtime is the fallback, and remaining ties
/// break on the full path.
fn sort_by_creation_hint(files: &mut [PathBuf]) {
    files.sort_by_cached_key(|path| (creation_hint(path), path.clone()));
}

fn creation_hint(path: &Path) -> DateTime<Utc> {
    let name = path.file_name().map(|n| n.to_string_lossy());
    if let Some(parsed) = name.as_deref().and_then(parse_name_timestamp) {
        return parsed;
    }
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| DateTime::<Utc>::from(UNIX_EPOCH))
}

/// Parses a `…YYYY_MM_DD_HH_MM_SS…` timestamp embedded in a filename.
fn parse_name_timestamp(name: &str) -> Option<DateTime<Utc>> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"(\d{4})_(\d{2})_(\d{2})_(\d{2})_(\d{2})_(\d{2})").expect("valid pattern")
    });

    let captures = pattern.captures(name)?;
    let field = |i: usize| captures.get(i).unwrap().as_str().parse::<u32>().unwrap();

    let date = NaiveDate::from_ymd_opt(field(1) as i32, field(2), field(3))?;
    let time = date.and_hms_opt(field(4), field(5), field(6))?;
    Some(time.and_utc())
}
