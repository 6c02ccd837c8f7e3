//! `GeoIP.conf` compatibility
//!
//! Hosts that already run `geoipupdate` have a `GeoIP.conf` describing which
//! editions are kept current and where they are written. When such a file
//! is picked up instead of a TOML config, the server serves that database
//! directory and records the editions. Download credentials are parsed but
//! never used or logged.

use super::{Config, ConfigError, Mode};
use std::path::Path;
use tracing::debug;

/// File name recognized as a `geoipupdate` config
pub const GEOIP_CONF_NAME: &str = "GeoIP.conf";

/// Parsed `GeoIP.conf`
#[derive(Clone, Default, PartialEq, Eq)]
pub struct GeoIpConf {
    /// `AccountID` (or the older `UserId`)
    pub account_id: Option<u32>,
    /// `LicenseKey`
    pub license_key: Option<String>,
    /// `EditionIDs` (or the older `ProductIds`)
    pub edition_ids: Vec<String>,
    /// `DatabaseDirectory`
    pub database_directory: Option<String>,
    /// `Host`
    pub host: Option<String>,
}

impl std::fmt::Debug for GeoIpConf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoIpConf")
            .field("account_id", &self.account_id)
            .field("license_key", &self.license_key.as_ref().map(|_| "<redacted>"))
            .field("edition_ids", &self.edition_ids)
            .field("database_directory", &self.database_directory)
            .field("host", &self.host)
            .finish()
    }
}

impl GeoIpConf {
    /// Parse `Key value` lines
    ///
    /// Blank lines, `#` comments, lines without a value and unknown keys are
    /// skipped. A non-numeric account ID is ignored.
    pub fn parse(content: &str) -> Self {
        let mut conf = GeoIpConf::default();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(char::is_whitespace) else {
                continue;
            };
            let value = value.trim();
            match key {
                "AccountID" | "UserId" => conf.account_id = value.parse().ok(),
                "LicenseKey" => conf.license_key = Some(value.to_string()),
                "EditionIDs" | "ProductIds" => {
                    conf.edition_ids = value.split_whitespace().map(str::to_string).collect();
                }
                "DatabaseDirectory" => conf.database_directory = Some(value.to_string()),
                "Host" => conf.host = Some(value.to_string()),
                _ => {}
            }
        }
        conf
    }

    /// Read and parse a file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(Self::parse(&content))
    }

    /// Map onto a server config
    ///
    /// The database directory is served in directory mode and also becomes
    /// the mirror install target. Listed editions replace the mirror
    /// editions.
    pub fn into_config(self) -> Config {
        let mut config = Config {
            mode: Mode::Directory,
            ..Config::default()
        };
        if let Some(dir) = self.database_directory.filter(|d| !d.is_empty()) {
            config.directory.paths = vec![dir.clone()];
            config.mirror.database_dir = dir;
        }
        if !self.edition_ids.is_empty() {
            config.mirror.editions = self.edition_ids;
        }
        debug!(
            account = ?self.account_id,
            host = ?self.host,
            has_license_key = self.license_key.is_some(),
            "GeoIP.conf download settings are not used"
        );
        config
    }
}

/// True when `path` names a `GeoIP.conf`
pub fn is_geoip_conf(path: &Path) -> bool {
    path.file_name().is_some_and(|name| name == GEOIP_CONF_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# GeoIP.conf file for geoipupdate

AccountID 123456
LicenseKey abcDEF123
EditionIDs GeoLite2-ASN GeoLite2-City   GeoLite2-Country

  DatabaseDirectory /usr/local/share/GeoIP
Host updates.maxmind.com
";

    #[test]
    fn test_parse_sample() {
        let conf = GeoIpConf::parse(SAMPLE);
        assert_eq!(conf.account_id, Some(123456));
        assert_eq!(conf.license_key.as_deref(), Some("abcDEF123"));
        assert_eq!(
            conf.edition_ids,
            vec!["GeoLite2-ASN", "GeoLite2-City", "GeoLite2-Country"]
        );
        assert_eq!(
            conf.database_directory.as_deref(),
            Some("/usr/local/share/GeoIP")
        );
        assert_eq!(conf.host.as_deref(), Some("updates.maxmind.com"));
    }

    #[test]
    fn test_legacy_keys() {
        let conf = GeoIpConf::parse("UserId 42\nProductIds GeoIP2-City 106\n");
        assert_eq!(conf.account_id, Some(42));
        assert_eq!(conf.edition_ids, vec!["GeoIP2-City", "106"]);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let conf = GeoIpConf::parse(
            "LicenseKey\nAccountID not-a-number\nEditionIDs\tGeoLite2-ASN\nUnknownKey 1\n#DatabaseDirectory /x\n",
        );
        assert_eq!(conf.license_key, None);
        assert_eq!(conf.account_id, None);
        assert_eq!(conf.edition_ids, vec!["GeoLite2-ASN"]);
        assert_eq!(conf.database_directory, None);
    }

    #[test]
    fn test_empty_file() {
        assert_eq!(GeoIpConf::parse(""), GeoIpConf::default());
        assert_eq!(GeoIpConf::parse("# only comments\n\n"), GeoIpConf::default());
    }

    #[test]
    fn test_into_config() {
        let config = GeoIpConf::parse(SAMPLE).into_config();
        assert_eq!(config.mode, Mode::Directory);
        assert_eq!(config.directory.paths, vec!["/usr/local/share/GeoIP"]);
        assert_eq!(config.mirror.database_dir, "/usr/local/share/GeoIP");
        assert_eq!(config.mirror.editions.len(), 3);
        assert!(config.validate().is_ok());

        let config = GeoIpConf::default().into_config();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_debug_redacts_license_key() {
        let rendered = format!("{:?}", GeoIpConf::parse(SAMPLE));
        assert!(!rendered.contains("abcDEF123"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_is_geoip_conf() {
        assert!(is_geoip_conf(Path::new("/etc/GeoIP.conf")));
        assert!(!is_geoip_conf(Path::new("/etc/mmdb-mcp/config.toml")));
    }
}
