//! ACME certificate issuance
//!
//! The manager consumes issuance as a capability through [`AcmeProvider`],
//! so the lifecycle logic never depends on a live certificate authority.
//!
//! # Components
//!
//! - [`AcmeProvider`] - Capability trait: request, renew and load a certificate
//! - [`AcmeClient`] - `instant-acme` implementation using HTTP-01 challenges
//! - [`ChallengeManager`] - Pending HTTP-01 tokens for an external responder
//!
//! # Challenge Flow
//!
//! 1. [`AcmeClient`] creates an order for the domain
//! 2. Each pending authorization yields an HTTP-01 token
//! 3. [`ChallengeManager`] publishes the token and key authorization
//! 4. The CA fetches `/.well-known/acme-challenge/<token>` from the responder
//! 5. Once the order is ready, a CSR is submitted and the chain downloaded
//! 6. The chain is parsed into a [`Certificate`]; the manager persists it

mod challenge;
mod client;

use async_trait::async_trait;

use crate::certificate::Certificate;
use crate::error::AcmeError;

pub use challenge::{ChallengeGuard, ChallengeManager, ACME_CHALLENGE_PREFIX};
pub use client::{AcmeClient, PollSettings};

/// Certificate issuance capability
///
/// Implementations return fully parsed certificates and never touch the
/// certificate store themselves except to read from it in
/// [`load_certificate`](AcmeProvider::load_certificate).
#[async_trait]
pub trait AcmeProvider: Send + Sync {
    /// Obtain a new certificate for `domain`
    async fn request_certificate(&self, domain: &str) -> Result<Certificate, AcmeError>;

    /// Obtain a replacement for `existing`
    async fn renew_certificate(&self, existing: &Certificate) -> Result<Certificate, AcmeError>;

    /// Load a previously issued certificate for `domain`
    async fn load_certificate(&self, domain: &str) -> Result<Certificate, AcmeError>;
}
