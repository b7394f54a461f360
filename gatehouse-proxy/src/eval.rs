//! Policy bodies and their evaluation against live messages.
//!
//! A [`PolicyBody`] is the declarative transform set of a route, a proxy or a
//! websockets block: header set/add/remove for requests and responses, an
//! optional `url` attribute and custom access-log fields. String values may
//! reference variables with `${...}`:
//!
//! | Variable                            | Value                                  |
//! |-------------------------------------|----------------------------------------|
//! | `request.method` / `path` / `url`   | from the client request                |
//! | `request.id`                        | request id of the [`RequestContext`]   |
//! | `request.query.<name>`              | first query parameter value            |
//! | `request.headers.<name>`            | header value                           |
//! | `request.body`                      | buffered body as text                  |
//! | `request.json_body.<key>`           | top-level key of the buffered JSON body|
//! | `backend_response.status`           | upstream status (response scope only)  |
//! | `backend_response.headers.<name>`   | upstream header (response scope only)  |
//! | `env.<NAME>`                        | environment variable                   |
//!
//! Unknown values render as the empty string; unknown variable roots and
//! malformed expressions are evaluation errors.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use gatehouse_core::context::RequestContext;
use gatehouse_core::error::GatewayError;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Request, Response};
use serde::Deserialize;

/// Header transforms of one message direction.
///
/// Applied in order: `remove`, then `set`, then `add`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeaderPolicy {
    /// Replace header values.
    #[serde(default)]
    pub set: BTreeMap<String, String>,
    /// Append header values.
    #[serde(default)]
    pub add: BTreeMap<String, String>,
    /// Remove headers.
    #[serde(default)]
    pub remove: Vec<String>,
}

impl HeaderPolicy {
    fn templates(&self) -> impl Iterator<Item = &str> {
        self.set.values().chain(self.add.values()).map(String::as_str)
    }
}

/// A `websockets` block of a proxy.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebsocketsBlock {
    /// Upgrade timeout, humantime format.
    #[serde(default)]
    pub timeout: Option<String>,
    /// Request transforms applied to upgrade requests only.
    #[serde(default)]
    pub request: HeaderPolicy,
}

/// Declarative transform set evaluated against requests and responses.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyBody {
    #[serde(default)]
    pub request: HeaderPolicy,
    #[serde(default)]
    pub response: HeaderPolicy,
    /// Upstream URL; scheme and authority replace the request's.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub websockets: Vec<WebsocketsBlock>,
    /// Backend origins, used when no `url` is set. At most one is allowed.
    #[serde(default)]
    pub backends: Vec<String>,
    #[serde(default)]
    pub custom_log_fields: BTreeMap<String, String>,
}

impl PolicyBody {
    /// Whether any expression reads the request body, which then has to be
    /// buffered before evaluation.
    pub fn must_buffer(&self) -> bool {
        self.templates().any(references_body)
    }

    fn templates(&self) -> impl Iterator<Item = &str> {
        self.request
            .templates()
            .chain(self.response.templates())
            .chain(self.url.as_deref())
            .chain(self.websockets.iter().flat_map(|ws| ws.request.templates()))
            .chain(self.custom_log_fields.values().map(String::as_str))
    }
}

/// Whether a template reads the request body.
pub fn references_body(template: &str) -> bool {
    template.contains("request.body") || template.contains("request.json_body")
}

/// Owned view of the client request that expressions are evaluated against.
#[derive(Debug, Clone, Default)]
pub struct RequestSnapshot {
    method: String,
    url: String,
    path: String,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    request_id: String,
    body: Option<Bytes>,
}

impl RequestSnapshot {
    /// Capture the evaluable state of `req`.
    pub fn of<B>(req: &Request<B>) -> Self {
        let ctx = RequestContext::of(req);
        let query = req
            .uri()
            .query()
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default();

        Self {
            method: req.method().to_string(),
            url: req.uri().to_string(),
            path: req.uri().path().to_string(),
            query,
            headers: req.headers().clone(),
            request_id: ctx.map(|c| c.request_id.clone()).unwrap_or_default(),
            body: ctx.and_then(|c| c.buffered_body.clone()),
        }
    }

    /// Path of the captured request.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn lookup(&self, path: &str) -> Result<String, GatewayError> {
        let (head, rest) = split_first(path);
        let value = match head {
            "method" => self.method.clone(),
            "url" => self.url.clone(),
            "path" => self.path.clone(),
            "id" => self.request_id.clone(),
            "query" => self
                .query
                .iter()
                .find(|(k, _)| k == rest)
                .map(|(_, v)| v.clone())
                .unwrap_or_default(),
            "headers" => header_text(&self.headers, rest),
            "body" => self
                .body
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default(),
            "json_body" => self.json_value(rest),
            _ => return Err(unknown_variable("request", path)),
        };
        Ok(value)
    }

    fn json_value(&self, key: &str) -> String {
        let Some(body) = &self.body else {
            return String::new();
        };
        let Ok(serde_json::Value::Object(map)) = serde_json::from_slice(body) else {
            return String::new();
        };
        match map.get(key) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }
}

/// Owned view of an upstream response.
#[derive(Debug, Clone)]
struct ResponseSnapshot {
    status: u16,
    headers: HeaderMap,
}

impl ResponseSnapshot {
    fn lookup(&self, path: &str) -> Result<String, GatewayError> {
        let (head, rest) = split_first(path);
        match head {
            "status" => Ok(self.status.to_string()),
            "headers" => Ok(header_text(&self.headers, rest)),
            _ => Err(unknown_variable("backend_response", path)),
        }
    }
}

struct Scope<'a> {
    request: &'a RequestSnapshot,
    response: Option<&'a ResponseSnapshot>,
}

/// Evaluation environment shared by every policy of a configuration.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    env: Arc<HashMap<String, String>>,
}

impl EvalContext {
    /// Context with the process environment.
    pub fn from_env() -> Self {
        Self::with_env(std::env::vars())
    }

    /// Context with an explicit environment.
    pub fn with_env<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            env: Arc::new(
                vars.into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    /// Apply the request-scoped parts of `body` to `req`: request header
    /// transforms and custom log fields.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Evaluation` if an expression or a resulting
    /// header is invalid. `req` may be partially modified in that case.
    pub fn apply_request_context<B>(
        &self,
        body: &PolicyBody,
        req: &mut Request<B>,
    ) -> Result<(), GatewayError> {
        self.apply_request_headers(&body.request, req)?;
        self.record_log_fields(body, req)
    }

    /// Evaluate the custom log fields of `body` into the request context.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Evaluation` on invalid expressions.
    pub fn record_log_fields<B>(
        &self,
        body: &PolicyBody,
        req: &mut Request<B>,
    ) -> Result<(), GatewayError> {
        if body.custom_log_fields.is_empty() {
            return Ok(());
        }
        let snapshot = RequestSnapshot::of(req);
        let ctx = RequestContext::of_mut(req);
        for (key, template) in &body.custom_log_fields {
            let value = self.render_request(template, &snapshot)?;
            ctx.add_log_field(key.clone(), value);
        }
        Ok(())
    }

    /// Apply one set of request header transforms to `req`.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Evaluation` on invalid expressions or headers.
    pub fn apply_request_headers<B>(
        &self,
        policy: &HeaderPolicy,
        req: &mut Request<B>,
    ) -> Result<(), GatewayError> {
        let snapshot = RequestSnapshot::of(req);
        let scope = Scope {
            request: &snapshot,
            response: None,
        };
        self.apply_headers(policy, &scope, req.headers_mut())
    }

    /// Apply the response-scoped parts of `body` to `res`.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Evaluation` on invalid expressions or headers.
    pub fn apply_response_context<B>(
        &self,
        body: &PolicyBody,
        request: &RequestSnapshot,
        res: &mut Response<B>,
    ) -> Result<(), GatewayError> {
        let response = ResponseSnapshot {
            status: res.status().as_u16(),
            headers: res.headers().clone(),
        };
        let scope = Scope {
            request,
            response: Some(&response),
        };
        self.apply_headers(&body.response, &scope, res.headers_mut())
    }

    /// Render a template in request scope.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Evaluation` for malformed expressions.
    pub fn render_request(
        &self,
        template: &str,
        request: &RequestSnapshot,
    ) -> Result<String, GatewayError> {
        self.render(
            template,
            &Scope {
                request,
                response: None,
            },
        )
    }

    fn apply_headers(
        &self,
        policy: &HeaderPolicy,
        scope: &Scope<'_>,
        headers: &mut HeaderMap,
    ) -> Result<(), GatewayError> {
        for name in &policy.remove {
            headers.remove(header_name(name)?);
        }
        for (name, template) in &policy.set {
            let value = header_value(name, &self.render(template, scope)?)?;
            headers.insert(header_name(name)?, value);
        }
        for (name, template) in &policy.add {
            let value = header_value(name, &self.render(template, scope)?)?;
            headers.append(header_name(name)?, value);
        }
        Ok(())
    }

    fn render(&self, template: &str, scope: &Scope<'_>) -> Result<String, GatewayError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| {
                GatewayError::Evaluation(format!("unterminated expression in '{}'", template))
            })?;
            out.push_str(&self.lookup(after[..end].trim(), scope)?);
            rest = &after[end + 1..];
        }

        out.push_str(rest);
        Ok(out)
    }

    fn lookup(&self, variable: &str, scope: &Scope<'_>) -> Result<String, GatewayError> {
        let (root, path) = split_first(variable);
        match root {
            "request" => scope.request.lookup(path),
            "backend_response" => match scope.response {
                Some(res) => res.lookup(path),
                None => Err(GatewayError::Evaluation(format!(
                    "'{}' is not available in request scope",
                    variable
                ))),
            },
            "env" => Ok(self.env.get(path).cloned().unwrap_or_default()),
            _ => Err(GatewayError::Evaluation(format!(
                "unknown variable '{}'",
                variable
            ))),
        }
    }
}

fn split_first(path: &str) -> (&str, &str) {
    path.split_once('.').unwrap_or((path, ""))
}

fn unknown_variable(root: &str, path: &str) -> GatewayError {
    GatewayError::Evaluation(format!("unknown variable '{}.{}'", root, path))
}

fn header_text(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name.to_ascii_lowercase().as_str())
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

pub(crate) fn header_name(name: &str) -> Result<HeaderName, GatewayError> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| GatewayError::Evaluation(format!("invalid header name '{}': {}", name, e)))
}

pub(crate) fn header_value(name: &str, value: &str) -> Result<HeaderValue, GatewayError> {
    HeaderValue::from_str(value).map_err(|e| {
        GatewayError::Evaluation(format!("invalid value for header '{}': {}", name, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    fn policy(yaml: &str) -> PolicyBody {
        serde_saphyr::from_str(yaml).unwrap()
    }

    fn request() -> Request<()> {
        let mut req = Request::builder()
            .method("POST")
            .uri("http://gw.local/api/items?page=2&sort=asc")
            .header("x-tenant", "acme")
            .body(())
            .unwrap();
        let ctx = RequestContext::of_mut(&mut req);
        ctx.request_id = "req-1".into();
        ctx.buffered_body = Some(Bytes::from_static(br#"{"user":"ada","n":3}"#));
        req
    }

    #[test]
    fn test_request_headers_applied_in_order() {
        let body = policy(
            "request:\n  \
               remove: [x-tenant]\n  \
               set:\n    x-method: \"${request.method}\"\n    x-tenant: replaced\n  \
               add:\n    x-tenant: extra\n",
        );
        let mut req = request();
        EvalContext::default()
            .apply_request_context(&body, &mut req)
            .unwrap();

        assert_eq!(req.headers()["x-method"], "POST");
        let tenants: Vec<_> = req.headers().get_all("x-tenant").iter().collect();
        assert_eq!(tenants, vec!["replaced", "extra"]);
    }

    #[test]
    fn test_request_variables() {
        let eval = EvalContext::with_env([("STAGE", "prod")]);
        let snapshot = RequestSnapshot::of(&request());
        let rendered = eval
            .render_request(
                "${request.path}|${request.query.page}|${request.headers.X-Tenant}|\
                 ${request.id}|${request.json_body.user}|${request.json_body.n}|${env.STAGE}|${env.MISSING}",
                &snapshot,
            )
            .unwrap();
        assert_eq!(rendered, "/api/items|2|acme|req-1|ada|3|prod|");
    }

    #[test]
    fn test_malformed_expressions_rejected() {
        let eval = EvalContext::default();
        let snapshot = RequestSnapshot::of(&request());
        assert!(matches!(
            eval.render_request("${request.method", &snapshot),
            Err(GatewayError::Evaluation(_))
        ));
        assert!(eval.render_request("${secrets.key}", &snapshot).is_err());
        assert!(eval.render_request("${request.nope}", &snapshot).is_err());
        assert!(
            eval.render_request("${backend_response.status}", &snapshot)
                .is_err()
        );
    }

    #[test]
    fn test_response_scope_sees_backend_response() {
        let body = policy(
            "response:\n  \
               set:\n    x-upstream-status: \"${backend_response.status}\"\n    \
               x-echo: \"${request.method} ${backend_response.headers.server}\"\n  \
               remove: [server]\n",
        );
        let snapshot = RequestSnapshot::of(&request());
        let mut res = Response::builder()
            .status(StatusCode::CREATED)
            .header("server", "nginx")
            .body(())
            .unwrap();

        EvalContext::default()
            .apply_response_context(&body, &snapshot, &mut res)
            .unwrap();

        assert_eq!(res.headers()["x-upstream-status"], "201");
        assert_eq!(res.headers()["x-echo"], "POST nginx");
        assert!(!res.headers().contains_key("server"));
    }

    #[test]
    fn test_custom_log_fields_recorded() {
        let body = policy("custom_log_fields:\n  tenant: \"${request.headers.x-tenant}\"\n");
        let mut req = request();
        EvalContext::default()
            .apply_request_context(&body, &mut req)
            .unwrap();
        let fields = RequestContext::of(&req).unwrap().log_fields();
        assert_eq!(fields.get("tenant").map(String::as_str), Some("acme"));
    }

    #[test]
    fn test_invalid_header_value_is_evaluation_error() {
        let body = policy("request:\n  set:\n    x-bad: \"line\\nbreak\"\n");
        let mut req = request();
        let err = EvalContext::default()
            .apply_request_context(&body, &mut req)
            .unwrap_err();
        assert!(matches!(err, GatewayError::Evaluation(_)));
    }

    #[test]
    fn test_must_buffer_detects_body_references() {
        assert!(!policy("request:\n  set:\n    a: \"${request.method}\"\n").must_buffer());
        assert!(policy("request:\n  set:\n    a: \"${request.json_body.x}\"\n").must_buffer());
        assert!(policy("custom_log_fields:\n  b: \"${request.body}\"\n").must_buffer());
        assert!(
            policy("websockets:\n  - request:\n      add:\n        a: \"${request.body}\"\n")
                .must_buffer()
        );
    }
}
