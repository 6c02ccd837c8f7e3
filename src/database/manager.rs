//! Loaded-database registry with directory watching
//!
//! Databases are keyed by absolute path and addressed by file name. Reloading
//! swaps the `Arc<Database>` in place; scans holding the old one keep reading
//! the old mapping until they finish.

use super::{Database, DatabaseError};
use chrono::{DateTime, Utc};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tracing::{debug, error, info, warn};

/// Database family, guessed from the file name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DatabaseType {
    /// City-level geolocation
    City,
    /// Country-level geolocation
    Country,
    /// Autonomous system data
    #[serde(rename = "ASN")]
    Asn,
    /// ISP data
    #[serde(rename = "ISP")]
    Isp,
    /// Domain data
    Domain,
    /// Enterprise data
    Enterprise,
    /// Anonymous proxy detection
    #[serde(rename = "Anonymous IP")]
    AnonymousIp,
    /// Connection type data
    #[serde(rename = "Connection Type")]
    ConnectionType,
    /// Anything else
    Unknown,
}

impl DatabaseType {
    /// Infer the type from a file name, case-insensitively
    pub fn from_file_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        [
            ("city", DatabaseType::City),
            ("country", DatabaseType::Country),
            ("asn", DatabaseType::Asn),
            ("isp", DatabaseType::Isp),
            ("domain", DatabaseType::Domain),
            ("enterprise", DatabaseType::Enterprise),
            ("anonymous", DatabaseType::AnonymousIp),
            ("connection", DatabaseType::ConnectionType),
        ]
        .into_iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, ty)| ty)
        .unwrap_or(DatabaseType::Unknown)
    }

    /// Human readable summary
    pub fn description(&self) -> &'static str {
        match self {
            DatabaseType::City => "IP geolocation with city-level precision",
            DatabaseType::Country => "IP geolocation with country-level precision",
            DatabaseType::Asn => "Autonomous system number and organization",
            DatabaseType::Isp => "Internet service provider information",
            DatabaseType::Domain => "Domain name information",
            DatabaseType::Enterprise => "Enterprise-level IP intelligence",
            DatabaseType::AnonymousIp => "Anonymous proxy and VPN detection",
            DatabaseType::ConnectionType => "Connection type classification",
            DatabaseType::Unknown => "MaxMind database file",
        }
    }
}

/// Inventory entry for a loaded database
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseInfo {
    /// File name, used to address the database
    pub name: String,
    /// Inferred family
    #[serde(rename = "type")]
    pub db_type: DatabaseType,
    /// Family description
    pub description: String,
    /// File modification time
    pub last_updated: DateTime<Utc>,
    /// File size in bytes
    pub size: u64,
    /// Absolute path
    #[serde(skip)]
    pub path: PathBuf,
}

struct Loaded {
    db: Arc<Database>,
    info: DatabaseInfo,
}

/// Registry of loaded databases
#[derive(Default)]
pub struct DatabaseManager {
    databases: RwLock<HashMap<PathBuf, Loaded>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl DatabaseManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `.mmdb` file below `dir`
    ///
    /// Files that fail to load are logged and skipped. Returns how many
    /// databases were loaded.
    pub fn load_directory(&self, dir: impl AsRef<Path>) -> Result<usize, DatabaseError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(DatabaseError::Io(format!(
                "directory does not exist: {}",
                dir.display()
            )));
        }

        let mut files = Vec::new();
        collect_mmdb_files(dir, &mut files)?;

        let mut loaded = 0;
        for path in files {
            match self.load_database(&path) {
                Ok(_) => loaded += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "failed to load database"),
            }
        }
        info!(dir = %dir.display(), loaded, "scanned database directory");
        Ok(loaded)
    }

    /// Load or reload a single database file
    pub fn load_database(&self, path: impl AsRef<Path>) -> Result<DatabaseInfo, DatabaseError> {
        let path = absolute(path.as_ref());
        let meta = fs::metadata(&path).map_err(|e| {
            DatabaseError::Io(format!("Failed to stat {}: {}", path.display(), e))
        })?;
        let db = Database::open(&path)?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let db_type = DatabaseType::from_file_name(&name);
        let last_updated = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let info = DatabaseInfo {
            name,
            db_type,
            description: db_type.description().to_string(),
            last_updated,
            size: meta.len(),
            path: path.clone(),
        };

        let replaced = self
            .databases
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                path,
                Loaded {
                    db: Arc::new(db),
                    info: info.clone(),
                },
            )
            .is_some();

        if replaced {
            info!(database = %info.name, "reloaded database");
        } else {
            info!(database = %info.name, size = info.size, "loaded database");
        }
        Ok(info)
    }

    /// Database by file name
    pub fn get(&self, name: &str) -> Option<Arc<Database>> {
        self.find(name).map(|(db, _)| db)
    }

    /// Inventory entry by file name
    pub fn info(&self, name: &str) -> Option<DatabaseInfo> {
        self.find(name).map(|(_, info)| info)
    }

    fn find(&self, name: &str) -> Option<(Arc<Database>, DatabaseInfo)> {
        let databases = self.databases.read().unwrap_or_else(PoisonError::into_inner);
        // Lowest path wins when two directories hold the same file name
        databases
            .iter()
            .filter(|(_, loaded)| loaded.info.name == name)
            .min_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, loaded)| (Arc::clone(&loaded.db), loaded.info.clone()))
    }

    /// All databases sorted by name
    pub fn list(&self) -> Vec<DatabaseInfo> {
        let mut infos: Vec<_> = self
            .databases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|loaded| loaded.info.clone())
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.path.cmp(&b.path)));
        infos
    }

    /// `(name, database)` pairs sorted by name
    pub fn all(&self) -> Vec<(String, Arc<Database>)> {
        let databases = self.databases.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = databases
            .values()
            .map(|loaded| (loaded.info.name.clone(), Arc::clone(&loaded.db)))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Forget the database loaded from `path`
    pub fn remove_path(&self, path: impl AsRef<Path>) -> bool {
        let path = absolute(path.as_ref());
        let removed = self
            .databases
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&path);
        if let Some(loaded) = &removed {
            info!(database = %loaded.info.name, "removed database");
        }
        removed.is_some()
    }

    /// Number of loaded databases
    pub fn len(&self) -> usize {
        self.databases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// True when nothing is loaded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Watch directories and keep the registry in sync with them
    ///
    /// Replaces any previous watcher.
    pub fn watch(self: &Arc<Self>, dirs: &[PathBuf]) -> Result<(), DatabaseError> {
        let manager: Weak<Self> = Arc::downgrade(self);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if let Some(manager) = manager.upgrade() {
                        manager.handle_event(event);
                    }
                }
                Err(e) => error!(error = %e, "database watcher error"),
            },
            Config::default(),
        )
        .map_err(|e| DatabaseError::Io(format!("Failed to create file watcher: {}", e)))?;

        for dir in dirs {
            watcher
                .watch(dir, RecursiveMode::Recursive)
                .map_err(|e| {
                    DatabaseError::Io(format!("Failed to watch {}: {}", dir.display(), e))
                })?;
            debug!(dir = %dir.display(), "watching for database changes");
        }

        *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(watcher);
        Ok(())
    }

    /// Stop watching; safe to call when not watching
    pub fn stop_watching(&self) {
        if self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            debug!("stopped database watcher");
        }
    }

    fn handle_event(&self, event: Event) {
        let paths: Vec<&PathBuf> = event.paths.iter().filter(|p| is_mmdb(p)).collect();
        if paths.is_empty() {
            return;
        }

        match event.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) | EventKind::Remove(_) => {
                for path in paths {
                    self.remove_path(path);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                // paths are [from, to]; only the filtered ones remain
                for path in &event.paths {
                    if path.exists() {
                        self.reload(path);
                    } else {
                        self.remove_path(path);
                    }
                }
            }
            EventKind::Create(_) | EventKind::Modify(_) => {
                for path in paths {
                    if path.exists() {
                        self.reload(path);
                    } else {
                        self.remove_path(path);
                    }
                }
            }
            _ => {}
        }
    }

    fn reload(&self, path: &Path) {
        if !is_mmdb(path) {
            return;
        }
        if let Err(e) = self.load_database(path) {
            warn!(path = %path.display(), error = %e, "failed to load database on change");
        }
    }
}

impl Drop for DatabaseManager {
    fn drop(&mut self) {
        self.stop_watching();
    }
}

fn is_mmdb(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("mmdb"))
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn collect_mmdb_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), DatabaseError> {
    let entries = fs::read_dir(dir)
        .map_err(|e| DatabaseError::Io(format!("Failed to read {}: {}", dir.display(), e)))?;
    for entry in entries {
        let entry =
            entry.map_err(|e| DatabaseError::Io(format!("Failed to read {}: {}", dir.display(), e)))?;
        let path = entry.path();
        if path.is_dir() {
            collect_mmdb_files(&path, out)?;
        } else if is_mmdb(&path) {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_section::DataValue;
    use crate::mmdb::{IpVersion, RecordSize};
    use crate::writer::MmdbWriter;
    use std::time::{Duration, Instant};

    fn write_db(path: &Path, tag: &str) {
        let mut writer = MmdbWriter::new(IpVersion::V4, RecordSize::Bits24);
        writer
            .insert_str("1.0.0.0/24", DataValue::String(tag.to_string()))
            .unwrap();
        fs::write(path, writer.build().unwrap()).unwrap();
    }

    fn tag_of(manager: &DatabaseManager, name: &str) -> Option<String> {
        let db = manager.get(name)?;
        let hit = db.lookup_ip("1.0.0.1".parse().unwrap()).ok()??;
        hit.data.as_str().map(str::to_string)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_type_inference() {
        let cases = [
            ("GeoLite2-City.mmdb", DatabaseType::City),
            ("GeoIP2-Country-Test.mmdb", DatabaseType::Country),
            ("GeoLite2-ASN.mmdb", DatabaseType::Asn),
            ("GeoIP2-ISP.mmdb", DatabaseType::Isp),
            ("GeoIP2-Domain.mmdb", DatabaseType::Domain),
            ("GeoIP2-Enterprise.mmdb", DatabaseType::Enterprise),
            ("GeoIP2-Anonymous-IP.mmdb", DatabaseType::AnonymousIp),
            ("GeoIP2-Connection-Type.mmdb", DatabaseType::ConnectionType),
            ("custom.mmdb", DatabaseType::Unknown),
        ];
        for (name, expected) in cases {
            assert_eq!(DatabaseType::from_file_name(name), expected, "{}", name);
        }
        assert_eq!(
            serde_json::to_value(DatabaseType::AnonymousIp).unwrap(),
            serde_json::json!("Anonymous IP")
        );
    }

    #[test]
    fn test_load_directory_recursive() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        write_db(&dir.path().join("GeoLite2-City.mmdb"), "city");
        write_db(&dir.path().join("nested").join("GeoLite2-ASN.MMDB"), "asn");
        fs::write(dir.path().join("broken.mmdb"), b"junk").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let manager = DatabaseManager::new();
        assert_eq!(manager.load_directory(dir.path()).unwrap(), 2);
        assert_eq!(manager.len(), 2);

        let names: Vec<_> = manager.list().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["GeoLite2-ASN.MMDB", "GeoLite2-City.mmdb"]);
        assert_eq!(tag_of(&manager, "GeoLite2-City.mmdb").as_deref(), Some("city"));

        let info = manager.info("GeoLite2-City.mmdb").unwrap();
        assert_eq!(info.db_type, DatabaseType::City);
        assert!(info.size > 0);
        assert!(info.path.is_absolute());
    }

    #[test]
    fn test_load_directory_missing() {
        let manager = DatabaseManager::new();
        assert!(manager.load_directory("/definitely/not/here").is_err());
    }

    #[test]
    fn test_reload_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("GeoLite2-Country.mmdb");
        write_db(&path, "v1");

        let manager = DatabaseManager::new();
        manager.load_database(&path).unwrap();
        let old = manager.get("GeoLite2-Country.mmdb").unwrap();

        let tmp = dir.path().join("next.tmp");
        write_db(&tmp, "v2");
        fs::rename(&tmp, &path).unwrap();
        manager.load_database(&path).unwrap();

        assert_eq!(manager.len(), 1);
        assert_eq!(tag_of(&manager, "GeoLite2-Country.mmdb").as_deref(), Some("v2"));
        // The previous handle still reads the old mapping
        let hit = old.lookup_ip("1.0.0.1".parse().unwrap()).unwrap().unwrap();
        assert_eq!(hit.data.as_str(), Some("v1"));

        assert!(manager.remove_path(&path));
        assert!(!manager.remove_path(&path));
        assert!(manager.get("GeoLite2-Country.mmdb").is_none());
    }

    #[test]
    fn test_info_serialization_skips_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("GeoLite2-ASN.mmdb");
        write_db(&path, "asn");
        let manager = DatabaseManager::new();
        let info = manager.load_database(&path).unwrap();

        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["name"], "GeoLite2-ASN.mmdb");
        assert_eq!(value["type"], "ASN");
        assert_eq!(value["description"], "Autonomous system number and organization");
        assert!(value.get("path").is_none());
        assert!(value["last_updated"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_watch_picks_up_new_and_removed_files() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(DatabaseManager::new());
        manager.watch(&[dir.path().to_path_buf()]).unwrap();

        let path = dir.path().join("GeoLite2-City.mmdb");
        let tmp = dir.path().join("staging.tmp");
        write_db(&tmp, "watched");
        fs::rename(&tmp, &path).unwrap();
        assert!(wait_for(|| manager.get("GeoLite2-City.mmdb").is_some()));

        fs::remove_file(&path).unwrap();
        assert!(wait_for(|| manager.is_empty()));
        manager.stop_watching();
        manager.stop_watching();
    }
}
