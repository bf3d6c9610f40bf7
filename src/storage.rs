//! On-disk layout and file primitives shared by snapshots and the outbox.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Manages the on-disk directory layout of a ledger store.
///
/// ```text
/// <base_dir>/
///     partitions/
///         <partition>/
///             snapshot.json       -- records, revision chains, index entries
///     outbox/
///         pending.json            -- undelivered reciprocal calls
///         dead_letters.jsonl      -- calls that will never be delivered
/// ```
///
/// `StoreLayout` is cheap to clone (it wraps a single `PathBuf`).
#[derive(Debug, Clone)]
pub struct StoreLayout {
    base_dir: PathBuf,
}

impl StoreLayout {
    /// Create a layout rooted at `base_dir`.
    ///
    /// The directory does not need to exist yet; writers create what they
    /// need.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base_dir>/partitions/<partition>/snapshot.json`
    pub fn partition_snapshot(&self, partition: &str) -> PathBuf {
        self.base_dir
            .join("partitions")
            .join(partition)
            .join("snapshot.json")
    }

    /// `<base_dir>/outbox/pending.json`
    pub fn outbox_pending(&self) -> PathBuf {
        self.base_dir.join("outbox").join("pending.json")
    }

    /// `<base_dir>/outbox/dead_letters.jsonl`
    pub fn dead_letters(&self) -> PathBuf {
        self.base_dir.join("outbox").join("dead_letters.jsonl")
    }
}

/// Serialize `value` as pretty JSON and write it atomically to `path`.
///
/// Writes `<path>.tmp` first and renames it over `path`, so readers never
/// see a partially written file. Parent directories are created.
///
/// # Errors
///
/// Returns `io::Error` if serialization, directory creation, writing, or
/// renaming fails.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let json =
        serde_json::to_vec_pretty(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    fs::write(&tmp_path, &json)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Read and deserialize a JSON file.
///
/// # Returns
///
/// - `Ok(Some(value))` if the file exists and parses.
/// - `Ok(None)` if the file does not exist, or if it does not parse. Parse
///   failures are logged as warnings.
///
/// # Errors
///
/// Returns `io::Error` only for unexpected I/O failures.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    match serde_json::from_slice::<T>(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to deserialize file; ignoring its contents"
            );
            Ok(None)
        }
    }
}

/// Append `value` as one JSON line to `path`, creating the file and its
/// parent directory if needed.
pub(crate) fn append_json_line<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let line = serde_json::to_string(value).map_err(io::Error::other)?;
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    Ok(())
}

/// Read every line of a JSONL file. A missing file yields an empty list;
/// lines that do not parse are skipped.
pub fn read_json_lines<T: DeserializeOwned>(path: &Path) -> io::Result<Vec<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    Ok(contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}
