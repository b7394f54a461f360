//! Route configuration.
//!
//! One YAML document describes one endpoint:
//!
//! ```yaml
//! request_body_limit: 1MiB
//! allowed_methods: [GET, POST]
//! policy:
//!   response:
//!     set:
//!       x-route: users
//! proxies:
//!   - name: default
//!     policy:
//!       backends: ["http://users.internal:8080"]
//! error_handlers:
//!   - kinds: [request_body_size_exceeded]
//!     response:
//!       status: 413
//!       body: upload too large
//! ```
//!
//! Error handlers answer for request bodies the endpoint rejects; errors of
//! the selected producer still abort the request.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use gatehouse_core::config::{self, ConfigError};
use gatehouse_core::error::GatewayError;
use gatehouse_core::transport::RoundTrip;
use serde::Deserialize;

use crate::allowed_methods::{self, AllowedMethodsHandler, MethodNotAllowedHandler};
use crate::endpoint::{Endpoint, EndpointOptions};
use crate::error_handler::{ErrorHandler, ErrorResponseHandler, ErrorTemplate};
use crate::eval::{EvalContext, PolicyBody};
use crate::handler::Handler;
use crate::producer::{Producer, Producers};
use crate::proxy::{Proxy, ProxyProducer};
use crate::request::{RequestConfig, RequestProducer};
use crate::response::{Redirect, StaticResponse};

/// Configuration of one endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    /// Human-readable size, 64MiB when unset.
    #[serde(default)]
    pub request_body_limit: Option<String>,
    /// Route policy body.
    #[serde(default)]
    pub policy: PolicyBody,
    #[serde(default)]
    pub redirect: Option<Redirect>,
    #[serde(default)]
    pub response: Option<StaticResponse>,
    #[serde(default)]
    pub error_template: Option<ErrorTemplate>,
    /// Defaults to [`DEFAULT_ALLOWED_METHODS`](crate::allowed_methods::DEFAULT_ALLOWED_METHODS).
    #[serde(default)]
    pub allowed_methods: Option<Vec<String>>,
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
    #[serde(default)]
    pub requests: Vec<RequestConfig>,
    #[serde(default)]
    pub error_handlers: Vec<ErrorHandlerConfig>,
}

/// One `proxy` block.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_name")]
    pub name: String,
    #[serde(default)]
    pub policy: PolicyBody,
}

fn default_proxy_name() -> String {
    "default".to_string()
}

/// One `error_handler` block.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorHandlerConfig {
    /// Error kinds served by this handler; `*` matches every error.
    pub kinds: Vec<String>,
    #[serde(default)]
    pub response: StaticResponse,
    #[serde(default)]
    pub policy: Option<PolicyBody>,
}

impl EndpointConfig {
    /// Load an endpoint from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let conf: Self = config::load_yaml(path)?;
        conf.validate()?;
        Ok(conf)
    }

    /// Validate values that serde cannot check.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSize` for a bad body limit and
    /// `ConfigError::InvalidValue` for duplicate producer names or error
    /// handlers without kinds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        config::parse_body_limit(self.request_body_limit.as_deref())?;

        let mut names = std::collections::HashSet::new();
        for name in self.proxies.iter().map(|p| &p.name) {
            if !names.insert(name) {
                return Err(ConfigError::InvalidValue {
                    field: "proxies".to_string(),
                    message: format!("duplicate proxy name '{}'", name),
                });
            }
        }
        let mut names = std::collections::HashSet::new();
        for name in self.requests.iter().map(|r| &r.name) {
            if !names.insert(name) {
                return Err(ConfigError::InvalidValue {
                    field: "requests".to_string(),
                    message: format!("duplicate request name '{}'", name),
                });
            }
        }

        if self.error_handlers.iter().any(|h| h.kinds.is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: "error_handlers".to_string(),
                message: "kinds must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Build the endpoint handler chain: method allow list, then the
    /// endpoint with its error handlers. All producers send through
    /// `transport`.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Configuration` for invalid settings.
    pub fn build(
        &self,
        transport: Arc<dyn RoundTrip>,
        eval: EvalContext,
    ) -> Result<Arc<dyn Handler>, GatewayError> {
        let template = self.error_template.clone().unwrap_or_default();

        let mut options = EndpointOptions::with_body_limit(self.request_body_limit.as_deref())
            .map_err(|e| GatewayError::Configuration(e.to_string()))?;
        options.context = self.policy.clone();
        options.error_template = template.clone();
        if !self.error_handlers.is_empty() {
            options.error_handler = Some(Arc::new(self.build_error_handler(eval.clone())));
        }
        options.redirect = self.redirect.clone();
        options.response = self.response.clone();

        let proxies = self
            .proxies
            .iter()
            .map(|p| {
                let proxy = Proxy::new(Arc::clone(&transport), p.policy.clone(), eval.clone());
                Arc::new(ProxyProducer::new(p.name.clone(), Arc::new(proxy))) as Arc<dyn Producer>
            })
            .collect();
        let requests = self
            .requests
            .iter()
            .map(|r| {
                RequestProducer::new(r.clone(), Arc::clone(&transport))
                    .map(|p| Arc::new(p) as Arc<dyn Producer>)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let endpoint = Endpoint::new(
            options,
            eval,
            Producers::new(proxies),
            Producers::new(requests),
        );

        let methods = self.allowed_methods.as_deref();
        let advertised = allowed_methods::allowed_methods(methods)?;
        let not_allowed = MethodNotAllowedHandler::new(template, &advertised);
        let handler = AllowedMethodsHandler::new(methods, Arc::new(endpoint), Arc::new(not_allowed))?;
        Ok(Arc::new(handler))
    }

    /// Build the error handler of this endpoint.
    pub fn build_error_handler(&self, eval: EvalContext) -> ErrorHandler {
        let mut kinds: HashMap<String, Arc<dyn Handler>> = HashMap::new();
        for conf in &self.error_handlers {
            let handler: Arc<dyn Handler> = Arc::new(ErrorResponseHandler::new(
                conf.response.clone(),
                conf.policy.clone(),
                eval.clone(),
            ));
            for kind in &conf.kinds {
                kinds.insert(kind.trim().to_string(), Arc::clone(&handler));
            }
        }
        ErrorHandler::new(kinds, self.error_template.clone().unwrap_or_default(), eval)
    }
}
