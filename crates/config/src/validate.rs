//! Configuration validation

use tracing::warn;
use url::Url;

use crate::{Config, ConfigError, MAX_RENEWAL_DAYS, MAX_SCHEDULE_DURATION};

impl Config {
    /// Validate required fields and value ranges
    ///
    /// Durations are checked here so that a bad check interval or timeout
    /// fails at startup rather than on the first scheduler tick.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.traefik_api.is_empty() {
            return Err(ConfigError::Missing("traefik_api".to_string()));
        }
        Url::parse(&self.traefik_api).map_err(|e| ConfigError::invalid("traefik_api", e))?;

        if self.email.is_empty() {
            return Err(ConfigError::Missing("email".to_string()));
        }

        if self.domains.is_empty() {
            return Err(ConfigError::Missing(
                "at least one domain configuration".to_string(),
            ));
        }

        for (i, domain) in self.domains.iter().enumerate() {
            if domain.service.is_empty() {
                return Err(ConfigError::Missing(format!("domains[{i}].service")));
            }
            if domain.domain.is_empty() {
                return Err(ConfigError::Missing(format!("domains[{i}].domain")));
            }
            for name in std::iter::once(&domain.domain).chain(domain.aliases.iter()) {
                validate_domain_name(name)
                    .map_err(|reason| ConfigError::invalid(format!("domains[{i}]"), reason))?;
            }
        }

        if !self.acme.ca_dir_url.is_empty() {
            Url::parse(&self.acme.ca_dir_url)
                .map_err(|e| ConfigError::invalid("acme.ca_dir_url", e))?;
        }

        match self.certificates.renewal_days {
            Some(0) => {
                return Err(ConfigError::invalid(
                    "certificates.renewal_days",
                    "must be greater than zero",
                ));
            }
            Some(days) if days > MAX_RENEWAL_DAYS => {
                return Err(ConfigError::invalid(
                    "certificates.renewal_days",
                    format!("must be at most {MAX_RENEWAL_DAYS}"),
                ));
            }
            _ => {}
        }

        if let Some(ref url) = self.notification.webhook_url {
            Url::parse(url).map_err(|e| ConfigError::invalid("notification.webhook_url", e))?;
        }

        if !self.app.check_interval.is_empty() && self.check_interval()?.is_zero() {
            return Err(ConfigError::invalid(
                "app.check_interval",
                "must be greater than zero",
            ));
        }
        if !self.app.timeout.is_empty() && self.run_timeout()?.is_zero() {
            return Err(ConfigError::invalid("app.timeout", "must be greater than zero"));
        }
        if !self.app.initial_delay.is_empty() {
            self.initial_delay()?;
        }

        for (field, value) in [
            ("app.check_interval", &self.app.check_interval),
            ("app.timeout", &self.app.timeout),
            ("app.initial_delay", &self.app.initial_delay),
        ] {
            if value.is_empty() {
                continue;
            }
            let duration =
                crate::parse_duration(value).map_err(|e| ConfigError::invalid(field, e))?;
            if duration > MAX_SCHEDULE_DURATION {
                return Err(ConfigError::invalid(
                    field,
                    format!("must be at most {} days", MAX_SCHEDULE_DURATION.as_secs() / 86_400),
                ));
            }
        }

        if let (Ok(interval), Ok(timeout)) = (self.check_interval(), self.run_timeout()) {
            if timeout > interval {
                warn!(
                    check_interval_secs = interval.as_secs(),
                    timeout_secs = timeout.as_secs(),
                    "Run timeout exceeds check interval, runs may be skipped"
                );
            }
        }

        Ok(())
    }
}

/// A domain becomes a file name in the storage directory, so anything that
/// could escape it or collide with the reserved issuer file is rejected.
fn validate_domain_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("empty domain name".to_string());
    }
    if name.contains(['/', '\\']) || name.contains("..") || name.starts_with('.') {
        return Err(format!("'{name}' is not a valid domain name"));
    }
    if name.eq_ignore_ascii_case("issuer") {
        return Err("'issuer' is a reserved name".to_string());
    }
    Ok(())
}
