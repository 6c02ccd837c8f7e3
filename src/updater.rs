//! Database refresh
//!
//! The [`Updater`] pulls new copies of configured editions from an
//! [`UpdateSource`], verifies their SHA-256, swaps them into the database
//! directory with a rename and reloads them into the [`DatabaseManager`].
//! Checksums of installed files are kept in `<database_dir>/.checksums` as
//! `edition:hex` lines so unchanged editions are skipped across restarts.

use crate::database::DatabaseManager;
use crate::periodic::PeriodicTask;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

const CHECKSUM_FILE: &str = ".checksums";

/// Update errors
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Edition is not in the configured list
    #[error("edition '{0}' is not configured")]
    UnknownEdition(String),
    /// Source could not provide the edition
    #[error("download failed: {0}")]
    Source(String),
    /// Local file handling failed
    #[error("{context}: {source}")]
    Io {
        /// What was being done
        context: String,
        /// Underlying error
        source: io::Error,
    },
    /// Downloaded bytes do not hash to the advertised checksum
    #[error("SHA-256 mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Advertised checksum
        expected: String,
        /// Checksum of the received bytes
        actual: String,
    },
}

impl UpdateError {
    /// Stable error code
    pub fn code(&self) -> &'static str {
        "update_failed"
    }

    fn io(context: impl Into<String>, source: io::Error) -> Self {
        UpdateError::Io {
            context: context.into(),
            source,
        }
    }
}

/// A new copy of an edition
pub struct Download {
    /// Database bytes
    pub reader: Box<dyn Read + Send>,
    /// Expected SHA-256 (lowercase hex), verified after streaming
    pub sha256: Option<String>,
    /// When the source last changed the edition
    pub modified: DateTime<Utc>,
}

/// What a source has for an edition
pub enum FetchOutcome {
    /// The installed checksum is current
    Unchanged {
        /// When the source last changed the edition
        modified: DateTime<Utc>,
    },
    /// A different copy is available
    Available(Download),
}

/// Where updated databases come from
pub trait UpdateSource: Send + Sync {
    /// Fetch `edition` unless `current_sha256` already matches
    fn fetch(&self, edition: &str, current_sha256: Option<&str>)
        -> Result<FetchOutcome, UpdateError>;
}

/// Reads `<root>/<edition>.mmdb` from a local or mounted mirror
///
/// A sidecar `<edition>.mmdb.sha256` file (first whitespace-separated word)
/// supplies the checksum; without one the file is hashed.
pub struct MirrorSource {
    root: PathBuf,
}

impl MirrorSource {
    /// Mirror rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl UpdateSource for MirrorSource {
    fn fetch(
        &self,
        edition: &str,
        current_sha256: Option<&str>,
    ) -> Result<FetchOutcome, UpdateError> {
        let path = self.root.join(format!("{}.mmdb", edition));
        let meta = fs::metadata(&path)
            .map_err(|e| UpdateError::Source(format!("{}: {}", path.display(), e)))?;
        let modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let sidecar = path.with_extension("mmdb.sha256");
        let expected = match fs::read_to_string(&sidecar) {
            Ok(text) => text
                .split_whitespace()
                .next()
                .map(|s| s.to_ascii_lowercase())
                .ok_or_else(|| {
                    UpdateError::Source(format!("{} is empty", sidecar.display()))
                })?,
            Err(_) => {
                let file = File::open(&path)
                    .map_err(|e| UpdateError::Source(format!("{}: {}", path.display(), e)))?;
                sha256_of(file).map_err(|e| UpdateError::io("hashing mirror file", e))?
            }
        };

        if current_sha256 == Some(expected.as_str()) {
            return Ok(FetchOutcome::Unchanged { modified });
        }

        let reader = File::open(&path)
            .map_err(|e| UpdateError::Source(format!("{}: {}", path.display(), e)))?;
        Ok(FetchOutcome::Available(Download {
            reader: Box::new(reader),
            sha256: Some(expected),
            modified,
        }))
    }
}

/// Outcome of refreshing one edition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateResult {
    /// Edition name
    pub database: String,
    /// True when a new file was installed
    pub updated: bool,
    /// Source modification time, when known
    pub last_update: Option<DateTime<Utc>>,
    /// Bytes written
    pub size: u64,
    /// Failure message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UpdateResult {
    fn failed(edition: &str, err: &UpdateError) -> Self {
        Self {
            database: edition.to_string(),
            updated: false,
            last_update: None,
            size: 0,
            error: Some(err.to_string()),
        }
    }
}

/// Refreshes configured editions
pub struct Updater {
    source: Arc<dyn UpdateSource>,
    manager: Arc<DatabaseManager>,
    database_dir: PathBuf,
    editions: Vec<String>,
    /// Also serializes updates
    checksums: Mutex<HashMap<String, String>>,
    schedule: Mutex<Option<PeriodicTask>>,
}

impl Updater {
    /// Create an updater, reading any saved checksums
    pub fn new(
        source: Arc<dyn UpdateSource>,
        manager: Arc<DatabaseManager>,
        database_dir: impl Into<PathBuf>,
        editions: Vec<String>,
    ) -> Self {
        let database_dir = database_dir.into();
        let checksums = load_checksums(&database_dir.join(CHECKSUM_FILE));
        Self {
            source,
            manager,
            database_dir,
            editions,
            checksums: Mutex::new(checksums),
            schedule: Mutex::new(None),
        }
    }

    /// Configured editions
    pub fn editions(&self) -> &[String] {
        &self.editions
    }

    /// Directory updated files are written to
    pub fn database_dir(&self) -> &Path {
        &self.database_dir
    }

    /// Refresh every configured edition
    pub fn update_all(&self) -> Vec<UpdateResult> {
        let mut checksums = lock(&self.checksums);
        let results = self
            .editions
            .iter()
            .map(|edition| {
                self.update_locked(&mut checksums, edition)
                    .unwrap_or_else(|e| UpdateResult::failed(edition, &e))
            })
            .collect();
        self.save_checksums(&checksums);
        results
    }

    /// Refresh one configured edition
    pub fn update_edition(&self, edition: &str) -> Result<UpdateResult, UpdateError> {
        if !self.editions.iter().any(|e| e == edition) {
            return Err(UpdateError::UnknownEdition(edition.to_string()));
        }
        let mut checksums = lock(&self.checksums);
        let result = self.update_locked(&mut checksums, edition);
        self.save_checksums(&checksums);
        result
    }

    fn update_locked(
        &self,
        checksums: &mut HashMap<String, String>,
        edition: &str,
    ) -> Result<UpdateResult, UpdateError> {
        let current = checksums.get(edition).map(String::as_str);
        let download = match self.source.fetch(edition, current)? {
            FetchOutcome::Unchanged { modified } => {
                return Ok(UpdateResult {
                    database: edition.to_string(),
                    updated: false,
                    last_update: Some(modified),
                    size: 0,
                    error: None,
                })
            }
            FetchOutcome::Available(download) => download,
        };

        fs::create_dir_all(&self.database_dir)
            .map_err(|e| UpdateError::io("failed to create database directory", e))?;

        let db_path = self.database_dir.join(format!("{}.mmdb", edition));
        let temp_path = self.database_dir.join(format!("{}.mmdb.tmp", edition));

        let (size, actual) = match stream_to_file(download.reader, &temp_path) {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                return Err(UpdateError::io("failed to write database", e));
            }
        };

        if let Some(expected) = download.sha256 {
            if !expected.eq_ignore_ascii_case(&actual) {
                let _ = fs::remove_file(&temp_path);
                return Err(UpdateError::ChecksumMismatch { expected, actual });
            }
        }

        if let Err(e) = fs::rename(&temp_path, &db_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(UpdateError::io("failed to replace database file", e));
        }
        checksums.insert(edition.to_string(), actual);

        // The new file is installed either way; a reload failure is reported
        // but does not undo it
        let error = self
            .manager
            .load_database(&db_path)
            .err()
            .map(|e| format!("warning: failed to reload database: {}", e));

        info!(edition, size, "database updated");
        Ok(UpdateResult {
            database: edition.to_string(),
            updated: true,
            last_update: Some(download.modified),
            size,
            error,
        })
    }

    fn save_checksums(&self, checksums: &HashMap<String, String>) {
        let path = self.database_dir.join(CHECKSUM_FILE);
        let mut lines: Vec<_> = checksums
            .iter()
            .map(|(edition, sum)| format!("{}:{}\n", edition, sum))
            .collect();
        lines.sort();

        let result = fs::create_dir_all(&self.database_dir)
            .and_then(|_| fs::write(&path, lines.concat()));
        if let Err(e) = result {
            error!(path = %path.display(), error = %e, "failed to save checksums");
        }
    }

    /// Refresh all editions every `interval` on a background thread
    ///
    /// A running schedule is replaced.
    pub fn start_scheduled(self: &Arc<Self>, interval: Duration) -> io::Result<()> {
        let updater = Arc::downgrade(self);
        let task = PeriodicTask::spawn("database-updater", interval, move || {
            let Some(updater) = updater.upgrade() else {
                return;
            };
            for result in updater.update_all() {
                match &result.error {
                    Some(e) if !result.updated => {
                        error!(edition = %result.database, error = %e, "scheduled update failed")
                    }
                    Some(e) => warn!(edition = %result.database, error = %e, "update warning"),
                    None => {}
                }
            }
        })?;
        info!(?interval, "scheduled database updates");

        if let Some(mut previous) = lock(&self.schedule).replace(task) {
            previous.stop();
        }
        Ok(())
    }

    /// Stop scheduled updates; safe to call more than once
    pub fn stop_scheduled(&self) {
        if let Some(mut task) = lock(&self.schedule).take() {
            task.stop();
        }
    }
}

impl Drop for Updater {
    fn drop(&mut self) {
        self.stop_scheduled();
    }
}

fn stream_to_file(mut reader: Box<dyn Read + Send>, path: &Path) -> io::Result<(u64, String)> {
    let mut file = File::create(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n])?;
        size += n as u64;
    }
    file.sync_all()?;
    Ok((size, format!("{:x}", hasher.finalize())))
}

fn sha256_of(mut reader: impl Read) -> io::Result<String> {
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn load_checksums(path: &Path) -> HashMap<String, String> {
    let Ok(text) = fs::read_to_string(path) else {
        return HashMap::new();
    };
    text.lines()
        .filter_map(|line| line.trim().split_once(':'))
        .map(|(edition, sum)| (edition.to_string(), sum.to_string()))
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
