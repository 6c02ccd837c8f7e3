//! Server configuration
//!
//! Configuration is a TOML file found by [`resolve_config_path`]. Every
//! field has a default, so an empty or missing file is valid.
//!
//! Durations use Go-style unit strings such as `30s`, `10m`, `1h30m` or
//! `250ms`. A leading `~` in a path expands to the home directory.
//!
//! A `GeoIP.conf` written for `geoipupdate` is accepted in place of the TOML
//! file; see [`GeoIpConf`].

mod geoip;

pub use geoip::{is_geoip_conf, GeoIpConf, GEOIP_CONF_NAME};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Environment variable naming a config file
pub const CONFIG_ENV: &str = "MMDB_MCP_CONFIG";

/// Errors from config loading and validation
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read config file {path}: {source}")]
    Io {
        /// Config path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
    /// File is not valid TOML for this schema
    #[error("Failed to parse config file {path}: {detail}")]
    Parse {
        /// Config path
        path: PathBuf,
        /// Parser message
        detail: String,
    },
    /// A value failed validation
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

/// Where databases come from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Serve `.mmdb` files found in local directories
    #[default]
    Directory,
    /// Copy editions from a mirror into `database_dir` and serve those
    Mirror,
}

/// `[directory]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Directories scanned recursively for `.mmdb` files
    pub paths: Vec<String>,
    /// Reload databases when files change
    pub watch: bool,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            paths: vec!["/var/lib/GeoIP".to_string()],
            watch: true,
        }
    }
}

/// `[mirror]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Directory holding `<edition>.mmdb` files (and optional `.sha256` sidecars)
    pub source: String,
    /// Where installed copies live
    pub database_dir: String,
    /// Editions to install
    pub editions: Vec<String>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            source: String::new(),
            database_dir: "~/.cache/mmdb-mcp/databases".to_string(),
            editions: vec![
                "GeoLite2-City".to_string(),
                "GeoLite2-Country".to_string(),
                "GeoLite2-ASN".to_string(),
            ],
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database source
    pub mode: Mode,
    /// Refresh mirror editions on a schedule
    pub auto_update: bool,
    /// Time between scheduled refreshes
    pub update_interval: String,
    /// Idle time before an iterator is dropped
    pub iterator_ttl: String,
    /// Time between idle-iterator sweeps
    pub iterator_cleanup_interval: String,
    /// Default batch size for `lookup_network`
    pub max_results: usize,
    /// Directory mode settings
    pub directory: DirectoryConfig,
    /// Mirror mode settings
    pub mirror: MirrorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Directory,
            auto_update: true,
            update_interval: "24h".to_string(),
            iterator_ttl: "10m".to_string(),
            iterator_cleanup_interval: "1m".to_string(),
            max_results: 1000,
            directory: DirectoryConfig::default(),
            mirror: MirrorConfig::default(),
        }
    }
}

impl Config {
    /// Find, parse, expand and validate the configuration
    ///
    /// Returns the config and the file it came from, if any.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let path = resolve_config_path(explicit);
        let mut config = match &path {
            Some(path) => Self::from_file(path)?,
            None => {
                debug!("no config file found, using defaults");
                Self::default()
            }
        };
        config.expand_paths();
        config.validate()?;
        Ok((config, path))
    }

    /// Parse a config file without validating it
    ///
    /// A file named `GeoIP.conf` is read as a `geoipupdate` config.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if is_geoip_conf(path) {
            debug!(path = %path.display(), "reading GeoIP.conf");
            return GeoIpConf::from_file(path).map(GeoIpConf::into_config);
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml_str(&content).map_err(|detail| ConfigError::Parse {
            path: path.to_path_buf(),
            detail,
        })
    }

    /// Parse TOML text without validating it
    pub fn from_toml_str(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    /// Check modes, durations and limits
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("update_interval", &self.update_interval),
            ("iterator_ttl", &self.iterator_ttl),
            ("iterator_cleanup_interval", &self.iterator_cleanup_interval),
        ] {
            let parsed = parse_duration(value)
                .map_err(|e| ConfigError::InvalidValue(format!("{}: {}", name, e)))?;
            if parsed.is_zero() {
                return Err(ConfigError::InvalidValue(format!(
                    "{} must be positive",
                    name
                )));
            }
        }

        if self.max_results == 0 {
            return Err(ConfigError::InvalidValue(
                "max_results must be positive".to_string(),
            ));
        }

        match self.mode {
            Mode::Directory => {
                if self.directory.paths.is_empty() {
                    return Err(ConfigError::InvalidValue(
                        "directory mode requires at least one path".to_string(),
                    ));
                }
            }
            Mode::Mirror => {
                if self.mirror.source.is_empty() {
                    return Err(ConfigError::InvalidValue(
                        "mirror mode requires source".to_string(),
                    ));
                }
                if self.mirror.database_dir.is_empty() {
                    return Err(ConfigError::InvalidValue(
                        "mirror mode requires database_dir".to_string(),
                    ));
                }
                if self.mirror.editions.is_empty() {
                    return Err(ConfigError::InvalidValue(
                        "mirror mode requires at least one edition".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Replace a leading `~` in every path with the home directory
    pub fn expand_paths(&mut self) {
        let home = dirs::home_dir();
        let expand = |p: &mut String| *p = expand_home(p.as_str(), home.as_deref());
        self.directory.paths.iter_mut().for_each(expand);
        expand(&mut self.mirror.source);
        expand(&mut self.mirror.database_dir);
    }

    /// Parsed `update_interval`
    pub fn update_interval(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.update_interval).map_err(ConfigError::InvalidValue)
    }

    /// Parsed `iterator_ttl`
    pub fn iterator_ttl(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.iterator_ttl).map_err(ConfigError::InvalidValue)
    }

    /// Parsed `iterator_cleanup_interval`
    pub fn iterator_cleanup_interval(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.iterator_cleanup_interval).map_err(ConfigError::InvalidValue)
    }

    /// Commented default configuration file
    pub fn default_toml() -> &'static str {
        DEFAULT_TOML
    }
}

const DEFAULT_TOML: &str = r#"# mmdb-mcp configuration

# "directory" serves .mmdb files from local directories.
# "mirror" installs editions from a mirror directory into database_dir.
mode = "directory"

# Refresh mirror editions on a schedule (mirror mode only)
auto_update = true
update_interval = "24h"

# Idle network iterators are dropped after iterator_ttl
iterator_ttl = "10m"
iterator_cleanup_interval = "1m"

# Default page size for lookup_network
max_results = 1000

[directory]
paths = ["/var/lib/GeoIP"]
watch = true

[mirror]
source = ""
database_dir = "~/.cache/mmdb-mcp/databases"
editions = ["GeoLite2-City", "GeoLite2-Country", "GeoLite2-ASN"]
"#;

/// Resolve the config file path
///
/// 1. Explicit `--config` path
/// 2. `MMDB_MCP_CONFIG`
/// 3. `./mmdb-mcp.toml`, then `./config.toml`
/// 4. `~/.config/mmdb-mcp/config.toml`, then `~/.config/mmdb-mcp/GeoIP.conf`
/// 5. `/etc/mmdb-mcp/config.toml`
/// 6. `/etc/GeoIP.conf`, then `/usr/local/etc/GeoIP.conf`
///
/// Explicit and environment paths are returned even when missing so that
/// loading reports them. Returns `None` when nothing is found.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }

    let mut candidates = vec![PathBuf::from("mmdb-mcp.toml"), PathBuf::from("config.toml")];
    if let Some(home) = dirs::home_dir() {
        let user_dir = home.join(".config/mmdb-mcp");
        candidates.push(user_dir.join("config.toml"));
        candidates.push(user_dir.join(GEOIP_CONF_NAME));
    }
    candidates.push(PathBuf::from("/etc/mmdb-mcp/config.toml"));
    candidates.push(Path::new("/etc").join(GEOIP_CONF_NAME));
    candidates.push(Path::new("/usr/local/etc").join(GEOIP_CONF_NAME));

    candidates.into_iter().find(|p| p.is_file())
}

fn expand_home(path: &str, home: Option<&Path>) -> String {
    let Some(home) = home else {
        return path.to_string();
    };
    if path == "~" {
        home.display().to_string()
    } else if let Some(rest) = path.strip_prefix("~/") {
        home.join(rest).display().to_string()
    } else {
        path.to_string()
    }
}

/// Parse a Go-style duration (`1h30m`, `250ms`, `1.5s`)
///
/// Units: `ns`, `us`/`µs`, `ms`, `s`, `m`, `h`. A bare `0` is allowed.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return Err(format!("invalid duration '{}'", input));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| format!("invalid duration '{}'", input))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "" => return Err(format!("missing unit in duration '{}'", input)),
            unit => return Err(format!("unknown unit '{}' in duration '{}'", unit, input)),
        };
        total += value * seconds;
        rest = &rest[unit_len..];
    }

    Duration::try_from_secs_f64(total).map_err(|e| format!("invalid duration '{}': {}", input, e))
}
