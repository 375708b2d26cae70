//! Health report for operators and monitoring
//!
//! The exit code contract: `0` when every certificate is valid, `1` when any
//! needs renewal or has expired.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::certificate::{CertificateHealth, HealthStatus};

/// Exit code when every certificate is valid
pub const EXIT_HEALTHY: i32 = 0;

/// Exit code when a certificate needs attention
pub const EXIT_UNHEALTHY: i32 = 1;

/// Per-status counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub valid: usize,
    pub needs_renewal: usize,
    pub expired: usize,
}

/// Health of every managed certificate at one instant
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub summary: HealthSummary,
    pub certificates: Vec<CertificateHealth>,
}

impl HealthReport {
    pub fn new(health: BTreeMap<String, CertificateHealth>) -> Self {
        let mut summary = HealthSummary::default();
        for h in health.values() {
            summary.total += 1;
            match h.status {
                HealthStatus::Valid => summary.valid += 1,
                HealthStatus::NeedsRenewal => summary.needs_renewal += 1,
                HealthStatus::Expired => summary.expired += 1,
            }
        }

        Self {
            generated_at: Utc::now(),
            summary,
            certificates: health.into_values().collect(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        !self.certificates.iter().any(|h| h.status.is_unhealthy())
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_healthy() {
            EXIT_HEALTHY
        } else {
            EXIT_UNHEALTHY
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Fixed-width table plus summary line
    pub fn render_text(&self) -> String {
        let mut out = String::new();

        if self.certificates.is_empty() {
            out.push_str("No certificates managed\n");
        } else {
            let width = self
                .certificates
                .iter()
                .map(|h| h.domain.len())
                .max()
                .unwrap_or(0)
                .max("DOMAIN".len());

            let _ = writeln!(
                out,
                "{:<width$}  {:<13}  {:>5}  EXPIRES",
                "DOMAIN", "STATUS", "DAYS"
            );
            for h in &self.certificates {
                let _ = writeln!(
                    out,
                    "{:<width$}  {:<13}  {:>5}  {}",
                    h.domain,
                    h.status.as_str(),
                    h.days_until_expiry,
                    h.expires_at.format("%Y-%m-%d %H:%M UTC"),
                );
            }
            out.push('\n');
        }

        let s = &self.summary;
        let _ = writeln!(
            out,
            "{} certificates: {} valid, {} need renewal, {} expired",
            s.total, s.valid, s.needs_renewal, s.expired
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::issue;
    use chrono::TimeDelta;

    fn report_for(expiries: &[(&str, i64)]) -> HealthReport {
        let now = Utc::now();
        let health = expiries
            .iter()
            .map(|(domain, days)| {
                let cert = issue(domain, now + TimeDelta::days(*days));
                (domain.to_string(), cert.health(30, now))
            })
            .collect();
        HealthReport::new(health)
    }

    #[test]
    fn test_all_valid_exits_zero() {
        let report = report_for(&[("a.com", 60), ("b.com", 80)]);
        assert!(report.is_healthy());
        assert_eq!(report.exit_code(), EXIT_HEALTHY);
        assert_eq!(report.summary.valid, 2);
    }

    #[test]
    fn test_unhealthy_exits_one() {
        let renewing = report_for(&[("a.com", 60), ("b.com", 10)]);
        assert_eq!(renewing.exit_code(), EXIT_UNHEALTHY);

        let expired = report_for(&[("a.com", -3)]);
        assert_eq!(expired.exit_code(), EXIT_UNHEALTHY);
        assert_eq!(expired.summary.expired, 1);
    }

    #[test]
    fn test_empty_report_is_healthy() {
        let report = HealthReport::new(BTreeMap::new());
        assert_eq!(report.exit_code(), EXIT_HEALTHY);
        assert!(report.render_text().contains("No certificates managed"));
    }

    #[test]
    fn test_text_rendering() {
        let report = report_for(&[("example.com", 60), ("expired.example.com", -2)]);
        let text = report.render_text();

        assert!(text.contains("example.com"));
        assert!(text.contains("needs_renewal") || text.contains("expired"));
        assert!(text.contains("2 certificates: 1 valid, 0 need renewal, 1 expired"));
    }

    #[test]
    fn test_json_fields() {
        let report = report_for(&[("example.com", 10)]);
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();

        assert_eq!(json["summary"]["needs_renewal"], 1);
        let cert = &json["certificates"][0];
        assert_eq!(cert["domain"], "example.com");
        assert_eq!(cert["status"], "needs_renewal");
        assert_eq!(cert["is_expired"], false);
    }
}
