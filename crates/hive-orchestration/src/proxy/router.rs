//! Request-path helper that applies a service's middleware chain.

use super::{RouteTarget, RoutingTable};
use crate::{
    Error, Result,
    capabilities::{CapabilityRegistry, MiddlewareAction, ProxyMiddleware, ProxyRequest, ProxyResponse},
    config::ServiceConfig,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

type Chain = Vec<(Value, Arc<dyn ProxyMiddleware>)>;

/// What the proxy should do with a request
#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    /// Forward the (rewritten) request to the target
    Forward {
        /// Current target of the service
        target: RouteTarget,
        /// Request after all middleware ran
        request: ProxyRequest,
    },
    /// Answer without contacting the service
    Respond(ProxyResponse),
}

/// Resolves requests against the routing table
///
/// Only reads the table; lifecycle operations remain the sole writers.
pub struct ProxyRouter {
    routing: Arc<RoutingTable>,
    chains: HashMap<String, Chain>,
}

impl ProxyRouter {
    /// Bind each service's middleware list to registered implementations
    pub fn new(
        routing: Arc<RoutingTable>,
        registry: &CapabilityRegistry,
        configs: &[ServiceConfig],
    ) -> Result<Self> {
        let mut chains = HashMap::new();
        for config in configs {
            let chain = config
                .middleware
                .iter()
                .map(|m| Ok((m.config.clone(), registry.middleware(&m.id)?)))
                .collect::<Result<Chain>>()?;
            chains.insert(config.name.clone(), chain);
        }
        Ok(Self { routing, chains })
    }

    fn chain(&self, service: &str) -> Result<&Chain> {
        self.chains
            .get(service)
            .ok_or_else(|| Error::ServiceNotFound(service.to_string()))
    }

    /// Run the request chain and pick a target
    ///
    /// A short-circuit response travels back through the middleware that
    /// already saw the request. A service without a route gets a 503.
    pub async fn route(&self, service: &str, mut request: ProxyRequest) -> Result<RouteDecision> {
        let chain = self.chain(service)?;

        for (index, (config, middleware)) in chain.iter().enumerate() {
            match middleware.process_request(config, request).await? {
                MiddlewareAction::Continue(next) => request = next,
                MiddlewareAction::ShortCircuit(response) => {
                    debug!(service, index, "Middleware short-circuited request");
                    let response = run_responses(&chain[..index], response).await?;
                    return Ok(RouteDecision::Respond(response));
                }
            }
        }

        match self.routing.target(service) {
            Some(target) => Ok(RouteDecision::Forward { target, request }),
            None => {
                let response = ProxyResponse::new(503, format!("service {} has no live target", service));
                Ok(RouteDecision::Respond(run_responses(chain, response).await?))
            }
        }
    }

    /// Run an upstream response back through the chain, last middleware first
    pub async fn respond(&self, service: &str, response: ProxyResponse) -> Result<ProxyResponse> {
        run_responses(self.chain(service)?, response).await
    }
}

async fn run_responses(chain: &[(Value, Arc<dyn ProxyMiddleware>)], mut response: ProxyResponse) -> Result<ProxyResponse> {
    for (config, middleware) in chain.iter().rev() {
        response = middleware.process_response(config, response).await?;
    }
    Ok(response)
}
