//! Reverse-proxy route discovery
//!
//! Reads the Traefik HTTP API to learn which domains are actually routed and
//! to which service. Read-only.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::DiscoveryError;

/// Per-request timeout for API calls
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A domain served by a reverse-proxy service
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct RouteBinding {
    pub domain: String,
    pub service: String,
}

/// Source of domain-to-service bindings
#[async_trait]
pub trait RouteDiscovery: Send + Sync {
    async fn get_routers_and_services(&self) -> Result<Vec<RouteBinding>, DiscoveryError>;
}

/// HTTP router as reported by `GET /api/http/routers`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Router {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub rule: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub entry_points: Vec<String>,
    #[serde(default)]
    pub service: String,
}

impl Router {
    /// Hosts named in the router's `Host(...)` matchers, lower-cased
    pub fn hosts(&self) -> Vec<String> {
        parse_hosts(&self.rule)
    }
}

/// HTTP service as reported by `GET /api/http/services`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Service {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub status: String,
}

/// Traefik API client
#[derive(Debug, Clone)]
pub struct TraefikClient {
    base_url: String,
    client: reqwest::Client,
}

impl TraefikClient {
    /// Client for the API rooted at `base_url` (e.g. `http://traefik:8080/api`)
    pub fn new(base_url: &str) -> Result<Self, DiscoveryError> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, DiscoveryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub async fn routers(&self) -> Result<Vec<Router>, DiscoveryError> {
        self.get_json("http/routers").await
    }

    pub async fn services(&self) -> Result<Vec<Service>, DiscoveryError> {
        self.get_json("http/services").await
    }

    /// Succeeds when the API answers its ping endpoint
    pub async fn is_healthy(&self) -> Result<(), DiscoveryError> {
        let response = self.client.get(self.url("ping")).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DiscoveryError::Status {
                status: status.as_u16(),
                body: String::new(),
            });
        }
        Ok(())
    }

    /// Services routing each of `domains`; unrouted domains are absent
    pub async fn services_by_domain(
        &self,
        domains: &[String],
    ) -> Result<BTreeMap<String, Vec<String>>, DiscoveryError> {
        let bindings = self.get_routers_and_services().await?;
        let mut by_domain: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for domain in domains {
            let wanted = domain.to_lowercase();
            for binding in bindings.iter().filter(|b| b.domain == wanted) {
                let services = by_domain.entry(domain.clone()).or_default();
                if !services.contains(&binding.service) {
                    services.push(binding.service.clone());
                }
            }
        }

        Ok(by_domain)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, DiscoveryError> {
        let url = self.url(path);
        trace!(url = %url, "Calling Traefik API");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DiscoveryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl RouteDiscovery for TraefikClient {
    async fn get_routers_and_services(&self) -> Result<Vec<RouteBinding>, DiscoveryError> {
        let routers = self.routers().await?;

        let mut bindings: Vec<RouteBinding> = routers
            .iter()
            .flat_map(|router| {
                router.hosts().into_iter().map(|domain| RouteBinding {
                    domain,
                    service: router.service.clone(),
                })
            })
            .collect();
        bindings.sort();
        bindings.dedup();

        debug!(
            routers = routers.len(),
            bindings = bindings.len(),
            "Discovered reverse-proxy routes"
        );
        Ok(bindings)
    }
}

/// Backtick-quoted names inside every `Host(...)` matcher of a rule
fn parse_hosts(rule: &str) -> Vec<String> {
    let lower = rule.to_lowercase();
    let mut hosts = Vec::new();
    let mut rest = lower.as_str();

    while let Some(start) = rest.find("host(") {
        // `HostRegexp(` and `HostSNI(` do not match: their `(` is not right after `host`.
        let args = &rest[start + "host(".len()..];
        let end = args.find(')').unwrap_or(args.len());

        for host in args[..end].split('`').skip(1).step_by(2) {
            let host = host.trim();
            if !host.is_empty() && !hosts.iter().any(|h| h == host) {
                hosts.push(host.to_string());
            }
        }

        rest = &args[end..];
    }

    hosts
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parse_single_host() {
        assert_eq!(parse_hosts("Host(`example.com`)"), vec!["example.com"]);
    }

    #[test]
    fn test_parse_multiple_hosts_and_matchers() {
        let rule = "Host(`Example.com`, `www.example.com`) || (Host(`api.example.com`) && PathPrefix(`/v1`))";
        assert_eq!(
            parse_hosts(rule),
            vec!["example.com", "www.example.com", "api.example.com"]
        );
    }

    #[test]
    fn test_parse_ignores_other_matchers() {
        assert!(parse_hosts("HostRegexp(`{sub:[a-z]+}.example.com`)").is_empty());
        assert!(parse_hosts("PathPrefix(`/api`)").is_empty());
        assert!(parse_hosts("").is_empty());
    }

    async fn mock_traefik() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/http/routers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "name": "web@docker",
                    "status": "enabled",
                    "rule": "Host(`example.com`) || Host(`www.example.com`)",
                    "priority": 10,
                    "entryPoints": ["websecure"],
                    "service": "web"
                },
                {
                    "name": "api@docker",
                    "rule": "Host(`api.example.com`)",
                    "service": "api"
                },
                {
                    "name": "dashboard@internal",
                    "rule": "PathPrefix(`/dashboard`)",
                    "service": "api@internal"
                }
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/http/services"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "name": "web", "type": "loadbalancer", "status": "enabled" },
                { "name": "api", "type": "loadbalancer", "status": "enabled" }
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/ping"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_routers_and_services() {
        let server = mock_traefik().await;
        let client = TraefikClient::new(&format!("{}/api/", server.uri())).unwrap();

        let bindings = client.get_routers_and_services().await.unwrap();
        assert_eq!(
            bindings,
            vec![
                RouteBinding { domain: "api.example.com".into(), service: "api".into() },
                RouteBinding { domain: "example.com".into(), service: "web".into() },
                RouteBinding { domain: "www.example.com".into(), service: "web".into() },
            ]
        );

        let routers = client.routers().await.unwrap();
        assert_eq!(routers[0].entry_points, vec!["websecure"]);

        let services = client.services().await.unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].kind, "loadbalancer");

        client.is_healthy().await.unwrap();
    }

    #[tokio::test]
    async fn test_services_by_domain() {
        let server = mock_traefik().await;
        let client = TraefikClient::new(&format!("{}/api", server.uri())).unwrap();

        let by_domain = client
            .services_by_domain(&[
                "Example.com".to_string(),
                "api.example.com".to_string(),
                "unrouted.example.com".to_string(),
            ])
            .await
            .unwrap();

        assert_eq!(by_domain["Example.com"], vec!["web"]);
        assert_eq!(by_domain["api.example.com"], vec!["api"]);
        assert!(!by_domain.contains_key("unrouted.example.com"));
    }

    #[tokio::test]
    async fn test_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("starting"))
            .mount(&server)
            .await;

        let client = TraefikClient::new(&server.uri()).unwrap();

        let err = client.routers().await.unwrap_err();
        assert!(matches!(
            err,
            DiscoveryError::Status { status: 503, ref body } if body == "starting"
        ));
        assert!(client.is_healthy().await.is_err());
    }
}
