//! Configuration for Listmail

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an alternative configuration file
pub const CONFIG_ENV: &str = "LISTMAIL_CONFIG";

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/listmail/config.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identity of the list manager
    pub general: GeneralConfig,

    /// Outbound SMTP relay
    #[serde(default)]
    pub smtp: SmtpConfig,

    /// Delivery agent settings
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// DKIM verification oracle
    #[serde(default)]
    pub dkim: DkimConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Identity of the list manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Local part the MTA delivers list mail to
    pub localname: String,

    /// Domain all lists live under
    pub domain: String,

    /// Address receiving fault reports and unsolicited mail
    pub administrator: String,

    /// Character separating a list name from its command extension
    #[serde(default = "default_recipient_delimiter")]
    pub recipient_delimiter: String,

    /// Root URL of the list web pages
    #[serde(default = "default_web_root")]
    pub web_root: String,

    /// Path of the subscriber database
    #[serde(default = "default_database")]
    pub database: PathBuf,
}

fn default_recipient_delimiter() -> String {
    "+".to_string()
}

fn default_web_root() -> String {
    "https://localhost/lists/".to_string()
}

fn default_database() -> PathBuf {
    PathBuf::from("/var/lib/listmail/lists.json")
}

/// SMTP relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Relay host
    #[serde(default = "default_smtp_host")]
    pub host: String,

    /// Relay port
    #[serde(default = "default_smtp_port")]
    pub port: u16,

    /// Per-connection timeout in seconds
    #[serde(default = "default_smtp_timeout")]
    pub timeout_secs: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            timeout_secs: default_smtp_timeout(),
        }
    }
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

fn default_smtp_port() -> u16 {
    25
}

fn default_smtp_timeout() -> u64 {
    30
}

/// Delivery agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Recipient that receives a copy of every message on archived lists
    pub archiver_address: Option<String>,

    /// Upper bound on waiting for a subscriber store lock, in seconds
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            archiver_address: None,
            lock_timeout_secs: default_lock_timeout(),
        }
    }
}

fn default_lock_timeout() -> u64 {
    30
}

/// DKIM oracle configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DkimConfig {
    /// authserv-id of the Authentication-Results header to trust
    pub authserv_id: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::Error::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::parse(&content)
    }

    /// Parse, normalize and validate a TOML document
    pub fn parse(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.normalized()
    }

    /// Load configuration from `$LISTMAIL_CONFIG` or the default location
    pub fn load() -> crate::Result<Self> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        Self::from_file(&path)
    }

    fn normalized(mut self) -> crate::Result<Self> {
        self.general.localname = self.general.localname.trim().to_lowercase();
        self.general.domain = self.general.domain.trim().to_lowercase();
        self.general.administrator = self.general.administrator.trim().to_lowercase();
        self.delivery.archiver_address = self
            .delivery
            .archiver_address
            .map(|a| a.trim().to_lowercase())
            .filter(|a| !a.is_empty());

        if !self.general.web_root.ends_with('/') {
            self.general.web_root.push('/');
        }

        if self.general.recipient_delimiter.chars().count() != 1 {
            return Err(crate::Error::Config(format!(
                "recipient_delimiter must be a single character, got '{}'",
                self.general.recipient_delimiter
            )));
        }
        if self.general.localname.is_empty() || self.general.domain.is_empty() {
            return Err(crate::Error::Config(
                "general.localname and general.domain must not be empty".to_string(),
            ));
        }
        if !self.general.administrator.contains('@') {
            return Err(crate::Error::Config(format!(
                "general.administrator '{}' is not a mail address",
                self.general.administrator
            )));
        }

        Ok(self)
    }

    /// Envelope sender used for everything the list manager sends
    pub fn bounce_address(&self) -> String {
        format!(
            "{}{}bounces@{}",
            self.general.localname, self.general.recipient_delimiter, self.general.domain
        )
    }

    /// From address of administrator reports
    pub fn manager_address(&self) -> String {
        format!("{}@{}", self.general.localname, self.general.domain)
    }

    /// Public posting address of a list
    pub fn list_address(&self, list_name: &str) -> String {
        format!("{}@{}", list_name, self.general.domain)
    }

    /// Address of a list's command extension, e.g. `dev+subscribe@example.org`
    pub fn command_address(&self, list_name: &str, command: &str) -> String {
        format!(
            "{}{}{}@{}",
            list_name, self.general.recipient_delimiter, command, self.general.domain
        )
    }

    /// authserv-id trusted by the DKIM oracle
    pub fn authserv_id(&self) -> &str {
        self.dkim
            .authserv_id
            .as_deref()
            .unwrap_or(&self.general.domain)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery.lock_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MINIMAL: &str = r#"
[general]
localname = "Lists"
domain = "Example.ORG"
administrator = "Postmaster@example.org"
"#;

    #[test]
    fn test_parse_minimal_config() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.general.localname, "lists");
        assert_eq!(config.general.domain, "example.org");
        assert_eq!(config.general.administrator, "postmaster@example.org");
        assert_eq!(config.general.recipient_delimiter, "+");
        assert_eq!(config.smtp.port, 25);
        assert_eq!(config.delivery.lock_timeout_secs, 30);
        assert_eq!(config.logging.format, "text");
        assert_eq!(config.delivery.archiver_address, None);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[general]
localname = "lists"
domain = "example.org"
administrator = "root@example.org"
recipient_delimiter = "-"
web_root = "https://lists.example.org"
database = "/srv/lists.json"

[smtp]
host = "127.0.0.1"
port = 10025

[delivery]
archiver_address = "Archive@example.org"
lock_timeout_secs = 5

[dkim]
authserv_id = "mx.example.org"

[logging]
level = "debug"
format = "json"
"#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.general.web_root, "https://lists.example.org/");
        assert_eq!(config.general.database, PathBuf::from("/srv/lists.json"));
        assert_eq!(config.smtp.host, "127.0.0.1");
        assert_eq!(config.smtp.port, 10025);
        assert_eq!(
            config.delivery.archiver_address.as_deref(),
            Some("archive@example.org")
        );
        assert_eq!(config.lock_timeout(), Duration::from_secs(5));
        assert_eq!(config.authserv_id(), "mx.example.org");
        assert_eq!(config.bounce_address(), "lists-bounces@example.org");
    }

    #[test]
    fn test_derived_addresses() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.bounce_address(), "lists+bounces@example.org");
        assert_eq!(config.manager_address(), "lists@example.org");
        assert_eq!(config.list_address("dev"), "dev@example.org");
        assert_eq!(
            config.command_address("dev", "subscribe"),
            "dev+subscribe@example.org"
        );
        assert_eq!(config.authserv_id(), "example.org");
    }

    #[test]
    fn test_rejects_multi_character_delimiter() {
        let toml = r#"
[general]
localname = "lists"
domain = "example.org"
administrator = "root@example.org"
recipient_delimiter = "++"
"#;
        assert!(matches!(Config::parse(toml), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_missing_general_section() {
        assert!(matches!(
            Config::parse("[smtp]\nport = 25\n"),
            Err(crate::Error::Config(_))
        ));
    }
}
