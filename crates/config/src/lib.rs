//! Certkeeper configuration
//!
//! Typed configuration for the certificate manager, loaded from a YAML file.
//!
//! # Example
//!
//! ```yaml
//! traefik_api: http://traefik:8080/api
//! email: ops@example.com
//! domains:
//!   - service: web
//!     domain: example.com
//!     aliases: [www.example.com]
//! certificates:
//!   renewal_days: 30
//!   storage_path: /var/lib/certkeeper
//! app:
//!   check_interval: 12h
//!   timeout: 10m
//! ```
//!
//! Loading always runs [`Config::validate`] and then fills in defaults, so a
//! [`Config`] obtained from [`Config::from_file`] or [`Config::from_yaml_str`]
//! is ready to use.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

mod duration;
mod validate;

pub use duration::{parse_duration, DurationError};

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Default renewal threshold in days
pub const DEFAULT_RENEWAL_DAYS: u32 = 30;

/// Largest accepted renewal threshold in days
pub const MAX_RENEWAL_DAYS: u32 = 365;

/// Largest accepted check interval, run timeout or initial delay
pub const MAX_SCHEDULE_DURATION: Duration = Duration::from_secs(365 * 86_400);

/// Default days-before-expiry for operator warnings
pub const DEFAULT_WARN_DAYS: u32 = 7;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("{0} is required")]
    Missing(String),

    #[error("invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.to_string(),
        }
    }
}

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the Traefik API (e.g. `http://traefik:8080/api`)
    #[serde(default)]
    pub traefik_api: String,

    /// Operator contact email
    #[serde(default)]
    pub email: String,

    /// Lifecycle notification settings
    #[serde(default)]
    pub notification: NotificationConfig,

    /// Managed domains
    #[serde(default)]
    pub domains: Vec<DomainConfig>,

    /// ACME account and CA settings
    #[serde(default)]
    pub acme: AcmeConfig,

    /// Certificate storage and renewal policy
    #[serde(default)]
    pub certificates: CertificatesConfig,

    /// Process-level settings
    #[serde(default)]
    pub app: AppConfig,
}

/// A domain served by the reverse proxy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainConfig {
    /// Reverse-proxy service name that serves this domain
    #[serde(default)]
    pub service: String,

    /// Primary domain name
    #[serde(default)]
    pub domain: String,

    /// Additional names, each managed as its own certificate
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Notification settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Optional webhook receiving lifecycle events as JSON
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Warn operators when a certificate is this close to expiry
    #[serde(default)]
    pub warn_days: Option<u32>,
}

impl NotificationConfig {
    /// Days-before-expiry at which expiry warnings are emitted
    pub fn warn_days(&self) -> u32 {
        self.warn_days.unwrap_or(DEFAULT_WARN_DAYS)
    }
}

/// Private key algorithm for issued certificates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    /// ECDSA P-256
    #[default]
    #[serde(rename = "EC256")]
    Ec256,
    /// ECDSA P-384
    #[serde(rename = "EC384")]
    Ec384,
    /// RSA 2048-bit
    #[serde(rename = "RSA2048")]
    Rsa2048,
    /// RSA 4096-bit
    #[serde(rename = "RSA4096")]
    Rsa4096,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::Ec256 => f.write_str("EC256"),
            KeyType::Ec384 => f.write_str("EC384"),
            KeyType::Rsa2048 => f.write_str("RSA2048"),
            KeyType::Rsa4096 => f.write_str("RSA4096"),
        }
    }
}

/// ACME settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcmeConfig {
    /// CA directory URL
    #[serde(default)]
    pub ca_dir_url: String,

    /// Account email, defaults to the top-level `email`
    #[serde(default)]
    pub email: Option<String>,

    /// Certificate key algorithm
    #[serde(default)]
    pub key_type: KeyType,
}

/// Certificate storage and renewal policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertificatesConfig {
    /// Renew this many days before expiry
    #[serde(default)]
    pub renewal_days: Option<u32>,

    /// Directory holding `<domain>.crt` / `<domain>.key`
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
}

/// Process-level settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Log level used when `RUST_LOG` is not set
    #[serde(default)]
    pub log_level: String,

    /// Interval between scheduled renewal checks (Go duration syntax)
    #[serde(default)]
    pub check_interval: String,

    /// Upper bound for one renewal run
    #[serde(default)]
    pub timeout: String,

    /// Scheduler warm-up before the first check
    #[serde(default)]
    pub initial_delay: String,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        debug!(path = %path.display(), "Loaded configuration file");
        Self::from_yaml_str(&content)
    }

    /// Parse, validate and apply defaults
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(content)?;
        config.apply_defaults();
        config.validate()?;

        trace!(
            domains = config.domains.len(),
            renewal_days = config.renewal_days(),
            "Parsed configuration"
        );
        Ok(config)
    }

    /// Fill in every optional field left empty
    pub fn apply_defaults(&mut self) {
        if self.acme.ca_dir_url.is_empty() {
            self.acme.ca_dir_url = LETS_ENCRYPT_PRODUCTION.to_string();
        }
        if self.acme.email.as_deref().is_none_or(str::is_empty) {
            self.acme.email = Some(self.email.clone());
        }
        if self.certificates.renewal_days.is_none() {
            self.certificates.renewal_days = Some(DEFAULT_RENEWAL_DAYS);
        }
        if self.certificates.storage_path.is_none() {
            self.certificates.storage_path = Some(PathBuf::from("./certs"));
        }
        if self.app.log_level.is_empty() {
            self.app.log_level = "info".to_string();
        }
        if self.app.check_interval.is_empty() {
            self.app.check_interval = "24h".to_string();
        }
        if self.app.timeout.is_empty() {
            self.app.timeout = "10m".to_string();
        }
        if self.app.initial_delay.is_empty() {
            self.app.initial_delay = "30s".to_string();
        }
    }

    /// Renewal threshold in days
    pub fn renewal_days(&self) -> u32 {
        self.certificates
            .renewal_days
            .unwrap_or(DEFAULT_RENEWAL_DAYS)
    }

    /// Certificate storage directory
    pub fn storage_path(&self) -> PathBuf {
        self.certificates
            .storage_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("./certs"))
    }

    /// ACME account email
    pub fn acme_email(&self) -> &str {
        self.acme.email.as_deref().unwrap_or(&self.email)
    }

    /// Interval between scheduled checks
    pub fn check_interval(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.app.check_interval)
            .map_err(|e| ConfigError::invalid("app.check_interval", e))
    }

    /// Per-run timeout
    pub fn run_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.app.timeout).map_err(|e| ConfigError::invalid("app.timeout", e))
    }

    /// Scheduler warm-up delay
    pub fn initial_delay(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.app.initial_delay)
            .map_err(|e| ConfigError::invalid("app.initial_delay", e))
    }

    /// Path of a domain's certificate file
    pub fn cert_path(&self, domain: &str) -> PathBuf {
        self.storage_path().join(format!("{domain}.crt"))
    }

    /// Path of a domain's private key file
    pub fn key_path(&self, domain: &str) -> PathBuf {
        self.storage_path().join(format!("{domain}.key"))
    }

    /// Every managed domain name, primary names and aliases, in file order
    ///
    /// Duplicates keep their first occurrence.
    pub fn all_domains(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.domains
            .iter()
            .flat_map(|d| std::iter::once(&d.domain).chain(d.aliases.iter()))
            .filter(|name| seen.insert(name.as_str()))
            .cloned()
            .collect()
    }

    /// Primary domain configured for a reverse-proxy service
    pub fn domain_for_service(&self, service: &str) -> Option<&str> {
        self.domains
            .iter()
            .find(|d| d.service == service)
            .map(|d| d.domain.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
traefik_api: http://traefik:8080/api
email: ops@example.com
domains:
  - service: web
    domain: example.com
    aliases: [www.example.com]
  - service: api
    domain: api.example.com
"#;

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_yaml_str(MINIMAL).unwrap();

        assert_eq!(config.acme.ca_dir_url, LETS_ENCRYPT_PRODUCTION);
        assert_eq!(config.acme_email(), "ops@example.com");
        assert_eq!(config.acme.key_type, KeyType::Ec256);
        assert_eq!(config.renewal_days(), 30);
        assert_eq!(config.storage_path(), PathBuf::from("./certs"));
        assert_eq!(config.app.log_level, "info");
        assert_eq!(config.check_interval().unwrap(), Duration::from_secs(24 * 3600));
        assert_eq!(config.run_timeout().unwrap(), Duration::from_secs(600));
        assert_eq!(config.initial_delay().unwrap(), Duration::from_secs(30));
        assert_eq!(config.notification.warn_days(), 7);
    }

    #[test]
    fn test_explicit_values_kept() {
        let yaml = format!(
            "{MINIMAL}\nacme:\n  email: acme@example.com\n  key_type: EC384\ncertificates:\n  renewal_days: 14\n  storage_path: /var/lib/certs\napp:\n  check_interval: 1h30m\n  timeout: 45s\n"
        );
        let config = Config::from_yaml_str(&yaml).unwrap();

        assert_eq!(config.acme_email(), "acme@example.com");
        assert_eq!(config.acme.key_type, KeyType::Ec384);
        assert_eq!(config.renewal_days(), 14);
        assert_eq!(
            config.cert_path("example.com"),
            PathBuf::from("/var/lib/certs/example.com.crt")
        );
        assert_eq!(
            config.key_path("example.com"),
            PathBuf::from("/var/lib/certs/example.com.key")
        );
        assert_eq!(config.check_interval().unwrap(), Duration::from_secs(5400));
        assert_eq!(config.run_timeout().unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn test_all_domains_includes_aliases_in_order() {
        let config = Config::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(
            config.all_domains(),
            vec!["example.com", "www.example.com", "api.example.com"]
        );
    }

    #[test]
    fn test_all_domains_deduplicates() {
        let yaml = r#"
traefik_api: http://traefik:8080/api
email: ops@example.com
domains:
  - service: web
    domain: example.com
    aliases: [www.example.com, example.com]
  - service: www
    domain: www.example.com
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(config.all_domains(), vec!["example.com", "www.example.com"]);
    }

    #[test]
    fn test_domain_for_service() {
        let config = Config::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(config.domain_for_service("api"), Some("api.example.com"));
        assert_eq!(config.domain_for_service("missing"), None);
    }

    #[test]
    fn test_rsa_key_types() {
        for (name, expected) in [("RSA2048", KeyType::Rsa2048), ("RSA4096", KeyType::Rsa4096)] {
            let yaml = format!("{MINIMAL}\nacme:\n  key_type: {name}\n");
            let config = Config::from_yaml_str(&yaml).unwrap();
            assert_eq!(config.acme.key_type, expected);
            assert_eq!(config.acme.key_type.to_string(), name);
        }
    }

    #[test]
    fn test_unknown_key_type_rejected() {
        let yaml = format!("{MINIMAL}\nacme:\n  key_type: RSA1024\n");
        let err = Config::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file_missing() {
        let err = Config::from_file("/nonexistent/certkeeper.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.domains.len(), 2);
    }
}
