//! Lifecycle notifications
//!
//! Operators hear about issuance, renewal and failures through one or more
//! [`Notifier`]s. Delivery is best effort: [`deliver`] logs failures and
//! never propagates them into certificate operations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::NotifyError;

/// Webhook request timeout
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Something worth telling an operator about
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Issued {
        domain: String,
        expires_at: DateTime<Utc>,
    },
    Renewed {
        domain: String,
        expires_at: DateTime<Utc>,
    },
    RenewalFailed {
        domain: String,
        error: String,
    },
    ExpiringSoon {
        domain: String,
        expires_at: DateTime<Utc>,
        days: i64,
    },
}

impl LifecycleEvent {
    pub fn domain(&self) -> &str {
        match self {
            LifecycleEvent::Issued { domain, .. }
            | LifecycleEvent::Renewed { domain, .. }
            | LifecycleEvent::RenewalFailed { domain, .. }
            | LifecycleEvent::ExpiringSoon { domain, .. } => domain,
        }
    }

    /// One-line human readable summary
    pub fn summary(&self) -> String {
        match self {
            LifecycleEvent::Issued { domain, expires_at } => {
                format!("Certificate issued for {domain}, expires {expires_at}")
            }
            LifecycleEvent::Renewed { domain, expires_at } => {
                format!("Certificate renewed for {domain}, expires {expires_at}")
            }
            LifecycleEvent::RenewalFailed { domain, error } => {
                format!("Certificate renewal failed for {domain}: {error}")
            }
            LifecycleEvent::ExpiringSoon { domain, days, .. } => {
                format!("Certificate for {domain} expires in {days} days")
            }
        }
    }
}

/// Notification sink
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &LifecycleEvent) -> Result<(), NotifyError>;
}

/// Send `event`, logging instead of failing
pub async fn deliver(notifier: &dyn Notifier, event: &LifecycleEvent) {
    if let Err(e) = notifier.notify(event).await {
        warn!(domain = %event.domain(), error = %e, "Failed to deliver notification");
    }
}

/// Writes events to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &LifecycleEvent) -> Result<(), NotifyError> {
        match event {
            LifecycleEvent::RenewalFailed { .. } => {
                error!(domain = %event.domain(), "{}", event.summary());
            }
            LifecycleEvent::ExpiringSoon { .. } => {
                warn!(domain = %event.domain(), "{}", event.summary());
            }
            _ => info!(domain = %event.domain(), "{}", event.summary()),
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    #[serde(flatten)]
    event: &'a LifecycleEvent,
    message: String,
    timestamp: DateTime<Utc>,
}

/// POSTs events as JSON to a URL
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &LifecycleEvent) -> Result<(), NotifyError> {
        let payload = WebhookPayload {
            event,
            message: event.summary(),
            timestamp: Utc::now(),
        };

        let response = self.client.post(&self.url).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Fans an event out to several notifiers
///
/// Every notifier is tried; the first failure is returned.
#[derive(Default, Clone)]
pub struct NotifierSet {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl NotifierSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }
}

#[async_trait]
impl Notifier for NotifierSet {
    async fn notify(&self, event: &LifecycleEvent) -> Result<(), NotifyError> {
        let mut first_error = None;
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(event).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
