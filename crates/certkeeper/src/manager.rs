//! Certificate manager
//!
//! Owns the in-memory certificate registry and is the only place renewal
//! decisions are enacted.
//!
//! # Locking
//!
//! - The registry sits behind one `RwLock`. It is only ever held for a map
//!   lookup or insert, never across an ACME call or disk write.
//! - Each domain has its own async mutex, held for the whole
//!   check → issue → persist → commit sequence, so two renewals of the same
//!   domain can never interleave.
//! - A certificate is persisted before it is committed to the registry. A
//!   failed save therefore leaves the previous certificate in place.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use certkeeper_config::Config;
use chrono::{TimeDelta, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::acme::AcmeProvider;
use crate::certificate::{Certificate, CertificateHealth};
use crate::error::{AcmeError, AggregateError, DomainFailure, ManagerError};
use crate::notify::{LifecycleEvent, Notifier};
use crate::queue::{RenewalQueue, RenewalTask};
use crate::storage::CertificateStorage;

/// How long an expired certificate stays in the registry
pub const CLEANUP_GRACE_DAYS: i64 = 30;

/// Manager settings taken from configuration
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Renew once fewer than this many days remain
    pub renewal_days: u32,
    /// Domains to keep certificates for
    pub domains: Vec<String>,
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            renewal_days: config.renewal_days(),
            domains: config.all_domains(),
        }
    }
}

/// Outcome of a renewal batch
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Domains a renewal decision was made for
    pub attempted: usize,
    /// Domains renewed in this batch
    pub renewed: Vec<String>,
    /// Domains that no longer needed renewal once their lock was taken
    pub skipped: Vec<String>,
    pub failures: Vec<DomainFailure>,
    /// The batch stopped early on cancellation
    pub cancelled: bool,
}

impl BatchReport {
    /// Collapse into the single-error form used by batch operations
    pub fn into_result(self) -> Result<Self, ManagerError> {
        if self.cancelled {
            return Err(ManagerError::Cancelled);
        }
        let BatchReport {
            attempted,
            renewed,
            skipped,
            failures,
            cancelled,
        } = self;
        match AggregateError::from_failures(failures, attempted) {
            Some(aggregate) => Err(aggregate.into()),
            None => Ok(BatchReport {
                attempted,
                renewed,
                skipped,
                failures: Vec::new(),
                cancelled,
            }),
        }
    }
}

/// Registry owner and renewal coordinator
pub struct CertificateManager {
    settings: ManagerSettings,
    acme: Arc<dyn AcmeProvider>,
    storage: Arc<CertificateStorage>,
    notifier: Option<Arc<dyn Notifier>>,
    registry: RwLock<HashMap<String, Arc<Certificate>>>,
    renewal_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl CertificateManager {
    pub fn new(
        settings: ManagerSettings,
        acme: Arc<dyn AcmeProvider>,
        storage: Arc<CertificateStorage>,
    ) -> Self {
        info!(
            domains = settings.domains.len(),
            renewal_days = settings.renewal_days,
            "Created certificate manager"
        );

        Self {
            settings,
            acme,
            storage,
            notifier: None,
            registry: RwLock::new(HashMap::new()),
            renewal_locks: DashMap::new(),
        }
    }

    /// Announce new issuances through `notifier`
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn renewal_days(&self) -> u32 {
        self.settings.renewal_days
    }

    /// Configured domains
    pub fn domains(&self) -> &[String] {
        &self.settings.domains
    }

    /// On-disk certificate and key paths of a domain
    pub fn certificate_paths(&self, domain: &str) -> (PathBuf, PathBuf) {
        self.storage.certificate_paths(domain)
    }

    // =========================================================================
    // Startup
    // =========================================================================

    /// Load every stored certificate into the registry
    ///
    /// Domains that fail to load are logged and skipped. Returns the number
    /// loaded.
    pub fn load_existing_certificates(&self) -> usize {
        let domains = match self.storage.list_domains() {
            Ok(domains) => domains,
            Err(e) => {
                warn!(
                    storage_path = %self.storage.base_path().display(),
                    error = %e,
                    "Failed to list stored certificates"
                );
                return 0;
            }
        };

        let mut loaded = 0;
        for domain in domains {
            match self.storage.load(&domain) {
                Ok(cert) => {
                    debug!(domain = %domain, expires = %cert.expires_at(), "Loaded stored certificate");
                    self.registry.write().insert(domain, Arc::new(cert));
                    loaded += 1;
                }
                Err(e) => {
                    warn!(domain = %domain, error = %e, "Skipping unloadable stored certificate");
                }
            }
        }

        info!(loaded, "Loaded existing certificates");
        loaded
    }

    // =========================================================================
    // Single-domain operations
    // =========================================================================

    /// Make sure `domain` has a healthy certificate
    ///
    /// A certificate that is neither expired nor due for renewal is left
    /// alone without contacting the CA.
    ///
    /// # Errors
    ///
    /// Returns the adapter or storage failure with the domain attached. The
    /// registry is unchanged on error.
    pub async fn request_certificate(&self, domain: &str) -> Result<(), ManagerError> {
        let issued = {
            let lock = self.domain_lock(domain);
            let _guard = lock.lock().await;

            let existing = self.registry.read().get(domain).cloned();
            if let Some(cert) = existing {
                let now = Utc::now();
                if !cert.is_expired(now) && !cert.needs_renewal(self.settings.renewal_days, now) {
                    debug!(
                        domain = %domain,
                        expires = %cert.expires_at(),
                        "Certificate still valid, skipping request"
                    );
                    return Ok(());
                }
            }

            let cert = self
                .acme
                .request_certificate(domain)
                .await
                .map_err(|source| acme_error(domain, source))?;
            self.commit(domain, cert)?
        };

        info!(domain = %domain, expires = %issued.expires_at(), "Certificate issued");
        self.emit(LifecycleEvent::Issued {
            domain: domain.to_string(),
            expires_at: issued.expires_at(),
        })
        .await;

        Ok(())
    }

    /// Replace `domain`'s certificate with a freshly issued one
    ///
    /// Renews unconditionally. A domain missing from the registry is first
    /// loaded through the adapter, so certificates issued before this process
    /// started can still be renewed.
    ///
    /// # Errors
    ///
    /// [`ManagerError::NotFound`] if nothing is known about the domain,
    /// otherwise the adapter or storage failure. The previous certificate
    /// stays in place on error.
    pub async fn renew_certificate(&self, domain: &str) -> Result<(), ManagerError> {
        let lock = self.domain_lock(domain);
        let _guard = lock.lock().await;

        self.renew_locked(domain).await.map(|_| ())
    }

    /// Current certificate for `domain`
    pub fn get_certificate(&self, domain: &str) -> Result<Arc<Certificate>, ManagerError> {
        self.registry
            .read()
            .get(domain)
            .cloned()
            .ok_or_else(|| ManagerError::NotFound(domain.to_string()))
    }

    /// Snapshot of the registry, sorted by domain
    pub fn list_certificates(&self) -> BTreeMap<String, Arc<Certificate>> {
        self.registry
            .read()
            .iter()
            .map(|(domain, cert)| (domain.clone(), Arc::clone(cert)))
            .collect()
    }

    /// Health of every registered certificate, sorted by domain
    pub fn check_certificate_health(&self) -> BTreeMap<String, CertificateHealth> {
        let now = Utc::now();
        let registry = self.registry.read();

        registry
            .iter()
            .map(|(domain, cert)| {
                (
                    domain.clone(),
                    cert.health(self.settings.renewal_days, now),
                )
            })
            .collect()
    }

    // =========================================================================
    // Batch operations
    // =========================================================================

    /// Request certificates for every configured domain
    ///
    /// Every domain is attempted; failures are collected.
    ///
    /// # Errors
    ///
    /// [`ManagerError::Cancelled`] as soon as `cancel` fires between domains,
    /// otherwise [`ManagerError::Aggregate`] naming each failed domain.
    pub async fn process_all_domains(&self, cancel: &CancellationToken) -> Result<(), ManagerError> {
        let mut failures = Vec::new();

        for domain in &self.settings.domains {
            if cancel.is_cancelled() {
                info!("Domain processing cancelled");
                return Err(ManagerError::Cancelled);
            }

            if let Err(error) = self.request_certificate(domain).await {
                warn!(domain = %domain, error = %error, "Failed to process domain");
                failures.push(DomainFailure {
                    domain: domain.clone(),
                    error,
                });
            }
        }

        match AggregateError::from_failures(failures, self.settings.domains.len()) {
            Some(aggregate) => Err(aggregate.into()),
            None => Ok(()),
        }
    }

    /// Renew every certificate that is due, most urgent first
    ///
    /// Each domain is re-checked under its lock, so a certificate renewed
    /// concurrently elsewhere is skipped rather than renewed twice. The batch
    /// stops between domains once `cancel` fires; a renewal already in
    /// progress is allowed to finish.
    pub async fn renew_due(&self, cancel: &CancellationToken) -> BatchReport {
        let now = Utc::now();
        let mut queue = RenewalQueue::new();

        for (domain, health) in self.check_certificate_health() {
            if !health.needs_renewal {
                continue;
            }
            let (cert_path, key_path) = self.storage.certificate_paths(&domain);
            queue.push(RenewalTask {
                domain,
                cert_path,
                key_path,
                priority: -health.days_until_expiry,
                scheduled_at: now,
            });
        }

        let mut report = BatchReport::default();
        if queue.is_empty() {
            trace!("No certificates due for renewal");
            return report;
        }

        info!(due = queue.len(), "Renewing due certificates");

        while let Some(task) = queue.pop_ready(now) {
            if cancel.is_cancelled() {
                info!(remaining = queue.len() + 1, "Renewal batch cancelled");
                report.cancelled = true;
                break;
            }

            report.attempted += 1;
            let domain = task.domain;

            let lock = self.domain_lock(&domain);
            let _guard = lock.lock().await;

            let current = self.registry.read().get(&domain).cloned();
            let still_due = current
                .is_some_and(|cert| cert.needs_renewal(self.settings.renewal_days, Utc::now()));
            if !still_due {
                debug!(domain = %domain, "Certificate no longer due, skipping");
                report.skipped.push(domain);
                continue;
            }

            match self.renew_locked(&domain).await {
                Ok(_) => report.renewed.push(domain),
                Err(error) => {
                    warn!(domain = %domain, error = %error, "Certificate renewal failed");
                    report.failures.push(DomainFailure { domain, error });
                }
            }
        }

        info!(
            renewed = report.renewed.len(),
            skipped = report.skipped.len(),
            failed = report.failures.len(),
            cancelled = report.cancelled,
            "Renewal batch complete"
        );

        report
    }

    /// Renew every certificate flagged as due
    ///
    /// # Errors
    ///
    /// [`ManagerError::Cancelled`] if the batch was cut short, otherwise
    /// [`ManagerError::Aggregate`] naming each failed domain.
    pub async fn renew_expired_certificates(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), ManagerError> {
        self.renew_due(cancel).await.into_result().map(|_| ())
    }

    /// Drop certificates expired for longer than [`CLEANUP_GRACE_DAYS`]
    ///
    /// Only the registry is pruned; stored files are kept. The renewal locks of
    /// removed domains are dropped unless a renewal still holds or awaits
    /// them. Returns the removed domains.
    pub fn cleanup(&self) -> Vec<String> {
        let cutoff = Utc::now() - TimeDelta::days(CLEANUP_GRACE_DAYS);
        let mut removed = Vec::new();

        self.registry.write().retain(|domain, cert| {
            let keep = cert.expires_at() >= cutoff;
            if !keep {
                removed.push(domain.clone());
            }
            keep
        });

        removed.sort();
        for domain in &removed {
            self.renewal_locks
                .remove_if(domain, |_, lock| Arc::strong_count(lock) == 1);
            info!(domain = %domain, "Removed long-expired certificate from registry");
        }
        removed
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn domain_lock(&self, domain: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.renewal_locks.entry(domain.to_string()).or_default().value())
    }

    /// Renewal body; the caller holds the domain lock
    async fn renew_locked(&self, domain: &str) -> Result<Arc<Certificate>, ManagerError> {
        let existing = self.registry.read().get(domain).cloned();
        let existing = match existing {
            Some(cert) => cert,
            None => self.recover(domain).await?,
        };

        let renewed = self
            .acme
            .renew_certificate(&existing)
            .await
            .map_err(|source| acme_error(domain, source))?;

        let cert = self.commit(domain, renewed)?;
        info!(
            domain = %domain,
            previous_expiry = %existing.expires_at(),
            expires = %cert.expires_at(),
            "Certificate renewed"
        );
        Ok(cert)
    }

    /// Pull a certificate the registry does not know yet
    async fn recover(&self, domain: &str) -> Result<Arc<Certificate>, ManagerError> {
        let cert = self
            .acme
            .load_certificate(domain)
            .await
            .map_err(|source| match source {
                AcmeError::Storage(ref e) if e.is_not_found() => {
                    ManagerError::NotFound(domain.to_string())
                }
                source => acme_error(domain, source),
            })?;

        debug!(domain = %domain, "Recovered certificate from storage");
        let cert = Arc::new(cert);
        self.registry
            .write()
            .insert(domain.to_string(), Arc::clone(&cert));
        Ok(cert)
    }

    /// Persist, then publish to the registry
    fn commit(&self, domain: &str, cert: Certificate) -> Result<Arc<Certificate>, ManagerError> {
        if cert.domain() != domain {
            return Err(ManagerError::DomainMismatch {
                expected: domain.to_string(),
                actual: cert.domain().to_string(),
            });
        }

        self.storage
            .save(&cert)
            .map_err(|source| ManagerError::Storage {
                domain: domain.to_string(),
                source,
            })?;

        let cert = Arc::new(cert);
        self.registry
            .write()
            .insert(domain.to_string(), Arc::clone(&cert));
        Ok(cert)
    }

    async fn emit(&self, event: LifecycleEvent) {
        if let Some(notifier) = &self.notifier {
            crate::notify::deliver(notifier.as_ref(), &event).await;
        }
    }
}

fn acme_error(domain: &str, source: AcmeError) -> ManagerError {
    ManagerError::Acme {
        domain: domain.to_string(),
        source,
    }
}

impl std::fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateManager")
            .field("settings", &self.settings)
            .field("certificates", &self.registry.read().len())
            .finish()
    }
}

/// Lets the scheduler drive a manager through a narrow interface
#[async_trait]
pub trait RenewalSource: Send + Sync {
    async fn renew_due(&self, cancel: &CancellationToken) -> BatchReport;

    fn check_certificate_health(&self) -> BTreeMap<String, CertificateHealth>;
}

#[async_trait]
impl RenewalSource for CertificateManager {
    async fn renew_due(&self, cancel: &CancellationToken) -> BatchReport {
        CertificateManager::renew_due(self, cancel).await
    }

    fn check_certificate_health(&self) -> BTreeMap<String, CertificateHealth> {
        CertificateManager::check_certificate_health(self)
    }
}
