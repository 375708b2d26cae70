//! Certificate entity and health evaluation
//!
//! A [`Certificate`] is one domain's current credential. Its expiry is always
//! read from the certificate bytes, never supplied by the caller, so stored
//! metadata cannot drift from what clients will actually see.
//!
//! Health is a derived snapshot computed from a certificate, a renewal
//! threshold and the current time:
//!
//! | condition                              | status          |
//! |----------------------------------------|-----------------|
//! | `now > expires_at`                     | `expired`       |
//! | `now > expires_at - renewal_days`      | `needs_renewal` |
//! | otherwise                              | `valid`         |
//!
//! Both comparisons are strict: a certificate exactly at its renewal threshold
//! is still `valid`.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x509_parser::pem::Pem;

use crate::error::ParseError;

/// PEM label of an X.509 certificate block
const CERTIFICATE_LABEL: &str = "CERTIFICATE";

/// One domain's certificate, private key and optional issuer chain
///
/// Certificates are immutable. Renewal produces a new value that replaces the
/// old one in the registry.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    domain: String,
    certificate_pem: Vec<u8>,
    private_key_pem: Vec<u8>,
    issuer_certificate_pem: Option<Vec<u8>>,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    fingerprint: String,
}

impl Certificate {
    /// Build a certificate from PEM material
    ///
    /// The leaf (first certificate of the chain) is parsed to derive
    /// `expires_at`.
    pub fn from_pem(
        domain: impl Into<String>,
        certificate_pem: Vec<u8>,
        private_key_pem: Vec<u8>,
        issuer_certificate_pem: Option<Vec<u8>>,
        issued_at: DateTime<Utc>,
    ) -> Result<Self, ParseError> {
        let leaf = parse_leaf(&certificate_pem)?;

        Ok(Self {
            domain: domain.into(),
            certificate_pem,
            private_key_pem,
            issuer_certificate_pem,
            issued_at,
            expires_at: leaf.not_after,
            fingerprint: leaf.fingerprint,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// PEM certificate, possibly a chain with the leaf first
    pub fn certificate_pem(&self) -> &[u8] {
        &self.certificate_pem
    }

    pub fn private_key_pem(&self) -> &[u8] {
        &self.private_key_pem
    }

    pub fn issuer_certificate_pem(&self) -> Option<&[u8]> {
        self.issuer_certificate_pem.as_deref()
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// The leaf's notAfter
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Hex SHA-256 of the leaf's DER encoding
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        is_expired(self.expires_at, now)
    }

    pub fn needs_renewal(&self, renewal_days: u32, now: DateTime<Utc>) -> bool {
        needs_renewal(self.expires_at, renewal_days, now)
    }

    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        days_until_expiry(self.expires_at, now)
    }

    /// Health snapshot at `now`
    pub fn health(&self, renewal_days: u32, now: DateTime<Utc>) -> CertificateHealth {
        let is_expired = self.is_expired(now);
        let needs_renewal = self.needs_renewal(renewal_days, now);

        CertificateHealth {
            domain: self.domain.clone(),
            status: HealthStatus::from_flags(is_expired, needs_renewal),
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            is_expired,
            needs_renewal,
            days_until_expiry: self.days_until_expiry(now),
        }
    }
}

// Key material stays out of debug output.
impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("domain", &self.domain)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("fingerprint", &self.fingerprint)
            .field("has_issuer", &self.issuer_certificate_pem.is_some())
            .finish()
    }
}

/// Health classification of a certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Valid,
    NeedsRenewal,
    Expired,
}

impl HealthStatus {
    /// Expiry takes priority over the renewal window
    pub fn from_flags(is_expired: bool, needs_renewal: bool) -> Self {
        if is_expired {
            HealthStatus::Expired
        } else if needs_renewal {
            HealthStatus::NeedsRenewal
        } else {
            HealthStatus::Valid
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Valid => "valid",
            HealthStatus::NeedsRenewal => "needs_renewal",
            HealthStatus::Expired => "expired",
        }
    }

    /// `true` for statuses an operator has to act on
    pub fn is_unhealthy(&self) -> bool {
        !matches!(self, HealthStatus::Valid)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only health snapshot of one certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateHealth {
    pub domain: String,
    pub status: HealthStatus,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_expired: bool,
    pub needs_renewal: bool,
    pub days_until_expiry: i64,
}

/// `now > expires_at`
pub fn is_expired(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now > expires_at
}

/// `now > expires_at - renewal_days`
///
/// A threshold before the earliest representable instant has always passed.
pub fn needs_renewal(expires_at: DateTime<Utc>, renewal_days: u32, now: DateTime<Utc>) -> bool {
    TimeDelta::try_days(i64::from(renewal_days))
        .and_then(|window| expires_at.checked_sub_signed(window))
        .is_none_or(|threshold| now > threshold)
}

/// Whole days until expiry, truncated toward zero; negative once expired
pub fn days_until_expiry(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (expires_at - now).num_days()
}

/// Parse the notAfter of the leaf certificate in a PEM bundle
pub fn parse_expiry(certificate_pem: &[u8]) -> Result<DateTime<Utc>, ParseError> {
    parse_leaf(certificate_pem).map(|leaf| leaf.not_after)
}

struct Leaf {
    not_after: DateTime<Utc>,
    fingerprint: String,
}

/// The first CERTIFICATE block of a bundle is the leaf; intermediates follow.
fn parse_leaf(certificate_pem: &[u8]) -> Result<Leaf, ParseError> {
    let mut pem = None;
    for block in Pem::iter_from_buffer(certificate_pem) {
        let block = block.map_err(|e| ParseError::InvalidPem(e.to_string()))?;
        if block.label == CERTIFICATE_LABEL {
            pem = Some(block);
            break;
        }
    }
    let pem = pem.ok_or(ParseError::MissingPem)?;

    let cert = pem
        .parse_x509()
        .map_err(|e| ParseError::InvalidCertificate(e.to_string()))?;
    let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or(ParseError::InvalidValidity)?;

    Ok(Leaf {
        not_after,
        fingerprint: hex::encode(Sha256::digest(&pem.contents)),
    })
}
