//! Certkeeper Library
//!
//! Keeps TLS certificates for a set of domains valid by obtaining and renewing
//! them from an ACME certificate authority, storing them where a reverse
//! proxy can serve them.
//!
//! This library provides:
//!
//! - **Certificates**: Immutable certificate records with expiry derived from the PEM itself
//! - **Storage**: Flat, atomically written `<domain>.crt` / `<domain>.key` files
//! - **ACME**: An adapter trait plus an `instant-acme` HTTP-01 implementation
//! - **Manager**: Registry, health reporting and per-domain serialized renewal
//! - **Scheduler**: Periodic renewal checks with bounded runs and statistics
//! - **Discovery**: Domain-to-service bindings read from the Traefik API
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use certkeeper::{AcmeClient, CertificateManager, CertificateStorage, ManagerSettings};
//!
//! let storage = Arc::new(CertificateStorage::new(config.storage_path())?);
//! let acme = Arc::new(AcmeClient::new(&config, Arc::clone(&storage)));
//! let manager = Arc::new(CertificateManager::new(
//!     ManagerSettings::from_config(&config),
//!     acme,
//!     storage,
//! ));
//! manager.load_existing_certificates();
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod certificate;
pub mod discovery;
pub mod error;
pub mod manager;
pub mod notify;
pub mod queue;
pub mod report;
pub mod scheduler;
pub mod storage;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Certificates
pub use certificate::{Certificate, CertificateHealth, HealthStatus};

// Storage
pub use storage::CertificateStorage;

// ACME
pub use acme::{AcmeClient, AcmeProvider, ChallengeManager, PollSettings};

// Manager
pub use manager::{BatchReport, CertificateManager, ManagerSettings, RenewalSource};

// Renewal ordering
pub use queue::{RenewalQueue, RenewalTask};

// Scheduler
pub use scheduler::{RenewalScheduler, SchedulerSettings, SchedulerStats, SchedulerStatus};

// Discovery
pub use discovery::{RouteBinding, RouteDiscovery, TraefikClient};

// Notifications
pub use notify::{LifecycleEvent, LogNotifier, Notifier, NotifierSet, WebhookNotifier};

// Reporting
pub use report::{HealthReport, HealthSummary};

// Errors
pub use error::{
    AcmeError, AggregateError, DiscoveryError, DomainFailure, ManagerError, NotifyError,
    ParseError, SchedulerError, StorageError,
};

// Re-export the configuration crate for binaries and integration tests
pub use certkeeper_config as config;

// ============================================================================
// Test Support
// ============================================================================
