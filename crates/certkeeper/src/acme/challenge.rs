//! HTTP-01 challenge token store
//!
//! Pending challenges are published here while an authorization is in
//! flight. Whatever answers `/.well-known/acme-challenge/<token>` for the
//! managed domains (usually a small route in front of the reverse proxy)
//! holds a clone of the [`ChallengeManager`] and looks tokens up with
//! [`ChallengeManager::get_response`].

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace};

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Shared map of challenge token -> key authorization
///
/// Cloning yields another handle to the same map.
#[derive(Debug, Clone, Default)]
pub struct ChallengeManager {
    challenges: Arc<DashMap<String, String>>,
}

impl ChallengeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a challenge until the returned guard is dropped
    pub fn publish(&self, token: &str, key_authorization: &str) -> ChallengeGuard {
        debug!(token = %token, "Publishing ACME HTTP-01 challenge");
        self.challenges
            .insert(token.to_string(), key_authorization.to_string());

        ChallengeGuard {
            challenges: Arc::clone(&self.challenges),
            token: token.to_string(),
        }
    }

    /// Key authorization for a token, if it is currently published
    pub fn get_response(&self, token: &str) -> Option<String> {
        let result = self.challenges.get(token).map(|v| v.clone());
        trace!(token = %token, found = result.is_some(), "ACME challenge lookup");
        result
    }

    /// Token of a challenge request path, if it is one
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
            .filter(|token| !token.is_empty() && !token.contains('/'))
    }

    /// Number of published challenges
    pub fn pending_count(&self) -> usize {
        self.challenges.len()
    }
}

/// Removes its challenge from the store when dropped
#[derive(Debug)]
#[must_use = "the challenge is withdrawn as soon as the guard is dropped"]
pub struct ChallengeGuard {
    challenges: Arc<DashMap<String, String>>,
    token: String,
}

impl Drop for ChallengeGuard {
    fn drop(&mut self) {
        if self.challenges.remove(&self.token).is_some() {
            debug!(token = %self.token, "Withdrew ACME challenge");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_and_get() {
        let manager = ChallengeManager::new();

        let _guard = manager.publish("test-token", "test-key-auth");

        assert_eq!(
            manager.get_response("test-token"),
            Some("test-key-auth".to_string())
        );
        assert_eq!(manager.get_response("nonexistent"), None);
    }

    #[test]
    fn test_guard_withdraws_challenge() {
        let manager = ChallengeManager::new();

        let guard = manager.publish("test-token", "test-key-auth");
        assert_eq!(manager.pending_count(), 1);

        drop(guard);
        assert_eq!(manager.pending_count(), 0);
        assert_eq!(manager.get_response("test-token"), None);
    }

    #[test]
    fn test_clone_shares_state() {
        let manager = ChallengeManager::new();
        let responder = manager.clone();

        let _guard = manager.publish("token", "auth");

        assert_eq!(responder.get_response("token"), Some("auth".to_string()));
    }

    #[test]
    fn test_extract_token() {
        assert_eq!(
            ChallengeManager::extract_token("/.well-known/acme-challenge/abc123"),
            Some("abc123")
        );
        assert_eq!(
            ChallengeManager::extract_token("/.well-known/acme-challenge/"),
            None
        );
        assert_eq!(
            ChallengeManager::extract_token("/.well-known/acme-challenge/a/b"),
            None
        );
        assert_eq!(ChallengeManager::extract_token("/other/path"), None);
    }
}
