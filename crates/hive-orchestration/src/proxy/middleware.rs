//! Built-in proxy middleware.

use crate::{
    Error, Result,
    capabilities::{MiddlewareAction, ProxyMiddleware, ProxyRequest, ProxyResponse},
};
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;

fn parse<T: DeserializeOwned + Default>(middleware: &str, config: &Value) -> Result<T> {
    if config.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(config.clone())
        .map_err(|e| Error::InvalidConfig(format!("invalid {} middleware config: {}", middleware, e)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HeaderSpec {
    request: BTreeMap<String, String>,
    response: BTreeMap<String, String>,
}

/// Injects fixed headers into requests and responses
pub struct HeaderMiddleware;

#[async_trait]
impl ProxyMiddleware for HeaderMiddleware {
    async fn process_request(
        &self,
        config: &Value,
        mut request: ProxyRequest,
    ) -> Result<MiddlewareAction> {
        let spec: HeaderSpec = parse("headers", config)?;
        request.headers.extend(spec.request);
        Ok(MiddlewareAction::Continue(request))
    }

    async fn process_response(
        &self,
        config: &Value,
        mut response: ProxyResponse,
    ) -> Result<ProxyResponse> {
        let spec: HeaderSpec = parse("headers", config)?;
        response.headers.extend(spec.response);
        Ok(response)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PathFilterSpec {
    /// Prefixes that are always rejected
    deny: Vec<String>,
    /// When non-empty, only these prefixes pass
    allow: Vec<String>,
    status: u16,
}

impl Default for PathFilterSpec {
    fn default() -> Self {
        Self {
            deny: Vec::new(),
            allow: Vec::new(),
            status: 403,
        }
    }
}

impl PathFilterSpec {
    fn permits(&self, path: &str) -> bool {
        if self.deny.iter().any(|prefix| path.starts_with(prefix.as_str())) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// Answers requests for filtered paths without reaching the service
pub struct PathFilterMiddleware;

#[async_trait]
impl ProxyMiddleware for PathFilterMiddleware {
    async fn process_request(&self, config: &Value, request: ProxyRequest) -> Result<MiddlewareAction> {
        let spec: PathFilterSpec = parse("path-filter", config)?;
        if spec.permits(&request.path) {
            Ok(MiddlewareAction::Continue(request))
        } else {
            Ok(MiddlewareAction::ShortCircuit(ProxyResponse::new(
                spec.status,
                format!("path {} is not routable", request.path),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[smol_potat::test]
    async fn test_header_injection() {
        let config = json!({
            "request": { "x-forwarded-by": "hive" },
            "response": { "cache-control": "no-store" }
        });

        let action = HeaderMiddleware
            .process_request(&config, ProxyRequest::new("GET", "/"))
            .await
            .unwrap();
        let MiddlewareAction::Continue(request) = action else {
            panic!("header middleware never short-circuits");
        };
        assert_eq!(request.headers["x-forwarded-by"], "hive");

        let response = HeaderMiddleware
            .process_response(&config, ProxyResponse::new(200, "ok"))
            .await
            .unwrap();
        assert_eq!(response.headers["cache-control"], "no-store");
    }

    #[smol_potat::test]
    async fn test_path_filter() {
        let config = json!({ "deny": ["/admin"], "allow": ["/api", "/admin"] });

        let denied = PathFilterMiddleware
            .process_request(&config, ProxyRequest::new("GET", "/admin/users"))
            .await
            .unwrap();
        assert!(matches!(denied, MiddlewareAction::ShortCircuit(ref r) if r.status == 403));

        let outside_allow = PathFilterMiddleware
            .process_request(&config, ProxyRequest::new("GET", "/metrics"))
            .await
            .unwrap();
        assert!(matches!(outside_allow, MiddlewareAction::ShortCircuit(_)));

        let allowed = PathFilterMiddleware
            .process_request(&config, ProxyRequest::new("GET", "/api/v1"))
            .await
            .unwrap();
        assert!(matches!(allowed, MiddlewareAction::Continue(_)));
    }

    #[smol_potat::test]
    async fn test_invalid_config() {
        let err = PathFilterMiddleware
            .process_request(&json!({ "deny": "/admin" }), ProxyRequest::new("GET", "/"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
