//! Error types for certificate lifecycle management.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Malformed certificate or PEM data
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("no PEM-encoded certificate found")]
    MissingPem,

    #[error("invalid PEM data: {0}")]
    InvalidPem(String),

    #[error("invalid X.509 certificate: {0}")]
    InvalidCertificate(String),

    #[error("certificate notAfter is out of range")]
    InvalidValidity,
}

/// Certificate store errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no stored certificate for {domain}: {path} is missing")]
    NotFound { domain: String, path: PathBuf },

    #[error("stored certificate for {domain} is malformed: {source}")]
    Parse {
        domain: String,
        #[source]
        source: ParseError,
    },

    #[error("'{0}' cannot be used as a storage name")]
    InvalidDomain(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to persist {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// `true` when the domain simply has nothing stored
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// Failures from the certificate authority or the adapter around it
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("account error: {0}")]
    Account(String),

    #[error("order creation failed: {0}")]
    OrderCreation(String),

    #[error("challenge failed for {domain}: {reason}")]
    Challenge { domain: String, reason: String },

    #[error("order finalization failed: {0}")]
    Finalization(String),

    #[error("timed out after {0:?} waiting for the CA")]
    Timeout(Duration),

    #[error("key or CSR generation failed: {0}")]
    KeyGeneration(String),

    #[error("CA returned an unusable certificate: {0}")]
    InvalidCertificate(#[from] ParseError),

    #[error("ACME protocol error: {0}")]
    Protocol(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<instant_acme::Error> for AcmeError {
    fn from(err: instant_acme::Error) -> Self {
        AcmeError::Protocol(err.to_string())
    }
}

/// Certificate manager errors
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("certificate not found for domain {0}")]
    NotFound(String),

    #[error("failed to obtain certificate for {domain}: {source}")]
    Acme {
        domain: String,
        #[source]
        source: AcmeError,
    },

    #[error("failed to persist certificate for {domain}: {source}")]
    Storage {
        domain: String,
        #[source]
        source: StorageError,
    },

    #[error("adapter returned a certificate for {actual} when {expected} was requested")]
    DomainMismatch { expected: String, actual: String },

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error("operation cancelled")]
    Cancelled,
}

impl ManagerError {
    /// Domain the error relates to, if it concerns a single domain
    pub fn domain(&self) -> Option<&str> {
        match self {
            ManagerError::NotFound(domain) => Some(domain.as_str()),
            ManagerError::Acme { domain, .. } | ManagerError::Storage { domain, .. } => {
                Some(domain.as_str())
            }
            ManagerError::DomainMismatch { expected, .. } => Some(expected.as_str()),
            ManagerError::Aggregate(_) | ManagerError::Cancelled => None,
        }
    }
}

/// One domain's failure inside a batch
#[derive(Debug)]
pub struct DomainFailure {
    pub domain: String,
    pub error: ManagerError,
}

/// Per-domain failures collected from a batch operation
///
/// Batch operations attempt every domain and report the full set of failures
/// instead of stopping at the first one.
#[derive(Debug)]
pub struct AggregateError {
    failures: Vec<DomainFailure>,
    attempted: usize,
}

impl AggregateError {
    /// Build an aggregate, or `None` when nothing failed
    pub fn from_failures(failures: Vec<DomainFailure>, attempted: usize) -> Option<Self> {
        if failures.is_empty() {
            None
        } else {
            Some(Self {
                failures,
                attempted,
            })
        }
    }

    pub fn failures(&self) -> &[DomainFailure] {
        &self.failures
    }

    /// Domains that failed, in the order they were attempted
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|f| f.domain.as_str())
    }

    /// Number of domains the batch attempted
    pub fn attempted(&self) -> usize {
        self.attempted
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} domains failed: ",
            self.failures.len(),
            self.attempted
        )?;
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", failure.domain, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

/// Renewal scheduler errors
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler is already running")]
    AlreadyRunning,

    #[error("scheduler is not running")]
    NotRunning,

    #[error("scheduler is stopping")]
    Stopping,

    #[error("check interval must be greater than zero")]
    InvalidInterval,

    #[error("renewal run timed out after {0:?}")]
    Timeout(Duration),

    #[error("renewal run cancelled")]
    Cancelled,

    #[error("renewal run aborted: {0}")]
    Aborted(String),

    #[error("renewal run failed: {0}")]
    Renewal(#[from] AggregateError),
}

/// Reverse-proxy discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to call reverse-proxy API: {0}")]
    Request(#[from] reqwest::Error),

    #[error("reverse-proxy API returned status {status}: {body}")]
    Status { status: u16, body: String },
}

/// Notification delivery errors
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to deliver notification: {0}")]
    Delivery(#[from] reqwest::Error),

    #[error("notification endpoint returned status {0}")]
    Status(u16),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_empty_is_none() {
        assert!(AggregateError::from_failures(Vec::new(), 3).is_none());
    }

    #[test]
    fn test_aggregate_display_names_domains() {
        let err = AggregateError::from_failures(
            vec![
                DomainFailure {
                    domain: "a.example.com".to_string(),
                    error: ManagerError::NotFound("a.example.com".to_string()),
                },
                DomainFailure {
                    domain: "c.example.com".to_string(),
                    error: ManagerError::Acme {
                        domain: "c.example.com".to_string(),
                        source: AcmeError::Protocol("rateLimited".to_string()),
                    },
                },
            ],
            3,
        )
        .unwrap();

        let msg = err.to_string();
        assert!(msg.starts_with("2 of 3 domains failed"));
        assert!(msg.contains("a.example.com"));
        assert!(msg.contains("rateLimited"));
        assert_eq!(
            err.domains().collect::<Vec<_>>(),
            vec!["a.example.com", "c.example.com"]
        );
    }

    #[test]
    fn test_manager_error_domain() {
        let err = ManagerError::Storage {
            domain: "example.com".to_string(),
            source: StorageError::InvalidDomain("x".to_string()),
        };
        assert_eq!(err.domain(), Some("example.com"));
        assert_eq!(ManagerError::Cancelled.domain(), None);
    }
}
