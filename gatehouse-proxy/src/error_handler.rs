//! Error responses.
//!
//! [`ErrorTemplate`] renders a terminal response for a classified
//! [`GatewayError`]. [`ErrorHandler`] picks a custom handler for the error
//! stored in the request context by trying its kinds from most to least
//! specific, then the `*` wildcard, then falls back to the template.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use gatehouse_core::body::{self, GatewayBody};
use gatehouse_core::context::{REQUEST_ID_HEADER, RequestContext};
use gatehouse_core::error::{GatewayError, WILDCARD_KIND};
use http::header::CONTENT_TYPE;
use http::{Request, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::eval::{EvalContext, PolicyBody, RequestSnapshot};
use crate::handler::Handler;
use crate::response::StaticResponse;

const HTML_TEMPLATE: &str = "<!DOCTYPE html>\n<html>\n<head><title>{{status_code}} {{message}}</title></head>\n<body>\n<h1>{{status_code}} {{message}}</h1>\n<p>Request ID: {{request_id}}</p>\n<p>Path: {{path}}</p>\n</body>\n</html>\n";

const JSON_TEMPLATE: &str = r#"{"error":{"status":{{status_code}},"message":"{{message}}","id":"{{request_id}}","path":"{{path}}"}}"#;

/// Template for terminal error responses.
///
/// Placeholders: `{{status_code}}`, `{{message}}`, `{{request_id}}`,
/// `{{path}}`. Values are escaped for the template's content type.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorTemplate {
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default = "default_template")]
    pub template: String,
}

fn default_content_type() -> String {
    "text/html".to_string()
}

fn default_template() -> String {
    HTML_TEMPLATE.to_string()
}

impl Default for ErrorTemplate {
    fn default() -> Self {
        Self {
            content_type: default_content_type(),
            template: default_template(),
        }
    }
}

impl ErrorTemplate {
    pub fn new(content_type: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            template: template.into(),
        }
    }

    /// The built-in JSON template.
    pub fn json() -> Self {
        Self::new("application/json", JSON_TEMPLATE)
    }

    /// Render the response for `err` in the context of `req`.
    pub fn serve_error<B>(&self, req: &Request<B>, err: &GatewayError) -> Response<GatewayBody> {
        let status = err.status_code();
        let request_id = RequestContext::of(req)
            .map(|c| c.request_id.clone())
            .unwrap_or_default();

        let rendered = self
            .template
            .replace("{{status_code}}", status.as_str())
            .replace("{{message}}", &self.escape(err.client_message()))
            .replace("{{request_id}}", &self.escape(&request_id))
            .replace("{{path}}", &self.escape(req.uri().path()));

        Response::builder()
            .status(status)
            .header(CONTENT_TYPE, &self.content_type)
            .header(REQUEST_ID_HEADER, &request_id)
            .body(body::full(rendered))
            .unwrap_or_else(|_| {
                let mut resp = Response::new(body::full("500 Internal Server Error"));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                resp
            })
    }

    fn escape(&self, value: &str) -> String {
        if self.content_type.contains("json") {
            let quoted = serde_json::Value::String(value.to_string()).to_string();
            quoted[1..quoted.len() - 1].to_string()
        } else if self.content_type.contains("html") {
            value
                .replace('&', "&amp;")
                .replace('<', "&lt;")
                .replace('>', "&gt;")
                .replace('"', "&quot;")
                .replace('\'', "&#39;")
        } else {
            value.to_string()
        }
    }
}

/// Dispatches the error of a request to a handler chosen by error kind.
pub struct ErrorHandler {
    kinds: HashMap<String, Arc<dyn Handler>>,
    template: ErrorTemplate,
    eval: EvalContext,
}

impl std::fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorHandler")
            .field("kinds", &self.kinds.keys().collect::<Vec<_>>())
            .field("template", &self.template)
            .finish()
    }
}

impl ErrorHandler {
    pub fn new(
        kinds: HashMap<String, Arc<dyn Handler>>,
        template: ErrorTemplate,
        eval: EvalContext,
    ) -> Self {
        Self {
            kinds,
            template,
            eval,
        }
    }

    /// Serve `err` for `req`: the error is stored in the request context
    /// first, then dispatched.
    ///
    /// # Errors
    ///
    /// Propagates an abort of the selected handler.
    pub async fn serve_with(
        &self,
        mut req: Request<GatewayBody>,
        err: GatewayError,
    ) -> Result<Response<GatewayBody>, GatewayError> {
        RequestContext::of_mut(&mut req).error = Some(Arc::new(err));
        self.serve(req).await
    }

    fn select(&self, err: &GatewayError) -> Option<&Arc<dyn Handler>> {
        err.kinds()
            .into_iter()
            .find_map(|kind| self.kinds.get(kind))
            .or_else(|| self.kinds.get(WILDCARD_KIND))
    }
}

#[async_trait]
impl Handler for ErrorHandler {
    async fn serve(
        &self,
        mut req: Request<GatewayBody>,
    ) -> Result<Response<GatewayBody>, GatewayError> {
        let Some(err) = RequestContext::of(&req).and_then(|c| c.error.clone()) else {
            // every error path stores its error first
            warn!("Error handler invoked without an error");
            let err = GatewayError::Internal("missing request error".to_string());
            return Ok(self.template.serve_error(&req, &err));
        };

        let Some(handler) = self.select(&err) else {
            return Ok(self.template.serve_error(&req, &err));
        };

        debug!(error_type = err.error_type_name(), "Serving custom error handler");
        if let Some(body) = handler.body_context()
            && let Err(e) = self.eval.record_log_fields(body, &mut req)
        {
            warn!(error = %e, "Error handler log fields could not be evaluated");
        }
        handler.serve(req).await
    }
}

/// Custom error handler answering with a configured response.
#[derive(Debug, Clone)]
pub struct ErrorResponseHandler {
    response: StaticResponse,
    body: Option<PolicyBody>,
    eval: EvalContext,
}

impl ErrorResponseHandler {
    pub fn new(response: StaticResponse, body: Option<PolicyBody>, eval: EvalContext) -> Self {
        Self {
            response,
            body,
            eval,
        }
    }
}

#[async_trait]
impl Handler for ErrorResponseHandler {
    async fn serve(&self, req: Request<GatewayBody>) -> Result<Response<GatewayBody>, GatewayError> {
        let snapshot = RequestSnapshot::of(&req);
        let mut res = self.response.to_response(&self.eval, &snapshot)?;
        if let Some(body) = &self.body
            && let Err(e) = self.eval.apply_response_context(body, &snapshot, &mut res)
        {
            warn!(error = %e, "Error handler response policy failed");
        }
        Ok(res)
    }

    fn body_context(&self) -> Option<&PolicyBody> {
        self.body.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Request<GatewayBody> {
        let mut req = Request::builder()
            .uri("/api/a&b")
            .body(body::empty())
            .unwrap();
        RequestContext::of_mut(&mut req).request_id = "rid-9".into();
        req
    }

    fn response(status: u16) -> StaticResponse {
        StaticResponse {
            status: Some(status),
            ..Default::default()
        }
    }

    async fn text(res: Response<GatewayBody>) -> String {
        let bytes = body::collect(res.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_template_placeholders_and_escaping() {
        let req = request();
        let res = ErrorTemplate::default()
            .serve_error(&req, &GatewayError::BodySizeExceeded { limit: 10 });

        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(res.headers()[CONTENT_TYPE], "text/html");
        assert_eq!(res.headers()[REQUEST_ID_HEADER], "rid-9");
        let html = text(res).await;
        assert!(html.contains("413 request body too large"));
        assert!(html.contains("rid-9"));
        assert!(html.contains("/api/a&amp;b"));
    }

    #[tokio::test]
    async fn test_json_template_is_valid_json() {
        let req = request();
        let res = ErrorTemplate::json()
            .serve_error(&req, &GatewayError::BackendTimeout("slow".into()));
        assert_eq!(res.status(), StatusCode::GATEWAY_TIMEOUT);

        let value: serde_json::Value = serde_json::from_str(&text(res).await).unwrap();
        assert_eq!(value["error"]["status"], 504);
        assert_eq!(value["error"]["id"], "rid-9");
    }

    #[tokio::test]
    async fn test_dispatch_most_specific_kind_first() {
        let eval = EvalContext::default();
        let mut kinds: HashMap<String, Arc<dyn Handler>> = HashMap::new();
        kinds.insert(
            "backend_timeout".into(),
            Arc::new(ErrorResponseHandler::new(response(598), None, eval.clone())),
        );
        kinds.insert(
            "backend".into(),
            Arc::new(ErrorResponseHandler::new(response(599), None, eval.clone())),
        );
        let handler = ErrorHandler::new(kinds, ErrorTemplate::default(), eval);

        let res = handler
            .serve_with(request(), GatewayError::BackendTimeout("x".into()))
            .await
            .unwrap();
        assert_eq!(res.status().as_u16(), 598);

        let res = handler
            .serve_with(request(), GatewayError::BackendRefused("x".into()))
            .await
            .unwrap();
        assert_eq!(res.status().as_u16(), 599);
    }

    #[tokio::test]
    async fn test_wildcard_then_template_fallback() {
        let eval = EvalContext::default();
        let mut kinds: HashMap<String, Arc<dyn Handler>> = HashMap::new();
        kinds.insert(
            WILDCARD_KIND.into(),
            Arc::new(ErrorResponseHandler::new(response(418), None, eval.clone())),
        );
        let handler = ErrorHandler::new(kinds, ErrorTemplate::default(), eval.clone());
        let res = handler
            .serve_with(request(), GatewayError::MethodNotAllowed { method: "PUT".into() })
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::IM_A_TEAPOT);

        let bare = ErrorHandler::new(HashMap::new(), ErrorTemplate::default(), eval);
        let res = bare
            .serve_with(request(), GatewayError::MethodNotAllowed { method: "PUT".into() })
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_missing_error_serves_internal_error() {
        let handler = ErrorHandler::new(HashMap::new(), ErrorTemplate::default(), EvalContext::default());
        let res = handler.serve(request()).await.unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_handler_body_context_adds_log_fields() {
        let eval = EvalContext::default();
        let body: PolicyBody =
            serde_saphyr::from_str("custom_log_fields:\n  failed_path: \"${request.path}\"\n")
                .unwrap();
        let mut kinds: HashMap<String, Arc<dyn Handler>> = HashMap::new();
        kinds.insert(
            "backend".into(),
            Arc::new(ErrorResponseHandler::new(response(502), Some(body), eval.clone())),
        );
        let handler = ErrorHandler::new(kinds, ErrorTemplate::default(), eval);

        let req = request();
        let fields = RequestContext::of(&req).unwrap().log_fields.clone();
        handler
            .serve_with(req, GatewayError::BackendConnection("down".into()))
            .await
            .unwrap();

        assert_eq!(
            fields.lock().get("failed_path").map(String::as_str),
            Some("/api/a&b")
        );
    }
}
