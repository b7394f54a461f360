//! Method allow-list middleware.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use gatehouse_core::body::GatewayBody;
use gatehouse_core::error::GatewayError;
use http::header::{ALLOW, HeaderValue};
use http::{Method, Request, Response};
use tracing::debug;

use crate::error_handler::ErrorTemplate;
use crate::eval::PolicyBody;
use crate::handler::Handler;

/// Methods allowed when a route does not configure any.
pub const DEFAULT_ALLOWED_METHODS: [Method; 7] = [
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
    Method::OPTIONS,
];

/// Resolve a configured allow list in configuration order.
///
/// `None` means the default set; `*` expands to the default set; names are
/// upper-cased and duplicates dropped.
///
/// # Errors
///
/// Returns `GatewayError::Configuration` for an invalid method name.
pub fn allowed_methods(methods: Option<&[String]>) -> Result<Vec<Method>, GatewayError> {
    let Some(methods) = methods else {
        return Ok(DEFAULT_ALLOWED_METHODS.to_vec());
    };

    let mut allowed = Vec::new();
    let mut push = |method: Method| {
        if !allowed.contains(&method) {
            allowed.push(method);
        }
    };
    for method in methods {
        let method = method.trim();
        if method == "*" {
            DEFAULT_ALLOWED_METHODS.into_iter().for_each(&mut push);
            continue;
        }
        let parsed = Method::from_bytes(method.to_ascii_uppercase().as_bytes()).map_err(|e| {
            GatewayError::Configuration(format!("invalid allowed method '{}': {}", method, e))
        })?;
        push(parsed);
    }
    Ok(allowed)
}

/// Serves allowed methods with one handler and everything else with another.
pub struct AllowedMethodsHandler {
    allowed: HashSet<Method>,
    allowed_handler: Arc<dyn Handler>,
    not_allowed_handler: Arc<dyn Handler>,
}

impl AllowedMethodsHandler {
    /// Build the allow list from [`allowed_methods`].
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Configuration` for an invalid method name.
    pub fn new(
        methods: Option<&[String]>,
        allowed_handler: Arc<dyn Handler>,
        not_allowed_handler: Arc<dyn Handler>,
    ) -> Result<Self, GatewayError> {
        Ok(Self {
            allowed: allowed_methods(methods)?.into_iter().collect(),
            allowed_handler,
            not_allowed_handler,
        })
    }

    /// Whether `method` passes the allow list.
    pub fn method_allowed(&self, method: &str) -> bool {
        Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
            .is_ok_and(|m| self.allowed.contains(&m))
    }

    /// The wrapped handler.
    pub fn child(&self) -> &Arc<dyn Handler> {
        &self.allowed_handler
    }
}

#[async_trait]
impl Handler for AllowedMethodsHandler {
    async fn serve(&self, req: Request<GatewayBody>) -> Result<Response<GatewayBody>, GatewayError> {
        if self.allowed.contains(req.method()) {
            return self.allowed_handler.serve(req).await;
        }
        debug!(method = %req.method(), "Method not allowed");
        self.not_allowed_handler.serve(req).await
    }

    fn body_context(&self) -> Option<&PolicyBody> {
        self.allowed_handler.body_context()
    }
}

/// Answers with a 405 error response listing the allowed methods.
#[derive(Debug, Clone)]
pub struct MethodNotAllowedHandler {
    template: ErrorTemplate,
    allow: Option<HeaderValue>,
}

impl MethodNotAllowedHandler {
    pub fn new(template: ErrorTemplate, allowed: &[Method]) -> Self {
        let allow = allowed
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        Self {
            template,
            allow: HeaderValue::from_str(&allow).ok(),
        }
    }
}

#[async_trait]
impl Handler for MethodNotAllowedHandler {
    async fn serve(&self, req: Request<GatewayBody>) -> Result<Response<GatewayBody>, GatewayError> {
        let err = GatewayError::MethodNotAllowed {
            method: req.method().to_string(),
        };
        let mut res = self.template.serve_error(&req, &err);
        if let Some(allow) = &self.allow {
            res.headers_mut().insert(ALLOW, allow.clone());
        }
        Ok(res)
    }
}
