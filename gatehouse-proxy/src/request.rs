//! Synthetic request producer.
//!
//! A `request` block builds a new upstream request from templates instead of
//! forwarding the client request.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use gatehouse_core::body::{self, GatewayBody};
use gatehouse_core::context::RequestContext;
use gatehouse_core::error::GatewayError;
use gatehouse_core::transport::RoundTrip;
use http::{Method, Request, Response};
use serde::Deserialize;
use tracing::debug;

use crate::eval::{EvalContext, RequestSnapshot, header_name, header_value, references_body};
use crate::producer::Producer;

/// Configuration of one `request` block.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Target URL, may contain expressions.
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_name() -> String {
    "default".to_string()
}

fn default_method() -> String {
    "GET".to_string()
}

/// Producer that sends a templated request to its backend.
pub struct RequestProducer {
    config: RequestConfig,
    method: Method,
    backend: Arc<dyn RoundTrip>,
}

impl std::fmt::Debug for RequestProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestProducer")
            .field("config", &self.config)
            .finish()
    }
}

impl RequestProducer {
    /// # Errors
    ///
    /// Returns `GatewayError::Configuration` for an invalid method.
    pub fn new(config: RequestConfig, backend: Arc<dyn RoundTrip>) -> Result<Self, GatewayError> {
        let method = Method::from_bytes(config.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| {
                GatewayError::Configuration(format!(
                    "request '{}': invalid method '{}': {}",
                    config.name, config.method, e
                ))
            })?;
        Ok(Self {
            config,
            method,
            backend,
        })
    }
}

#[async_trait]
impl Producer for RequestProducer {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn must_buffer(&self) -> bool {
        references_body(&self.config.url)
            || self.config.headers.values().any(|v| references_body(v))
            || self.config.body.as_deref().is_some_and(references_body)
    }

    async fn produce(
        &self,
        req: Request<GatewayBody>,
        eval: &EvalContext,
    ) -> Result<Response<GatewayBody>, GatewayError> {
        let snapshot = RequestSnapshot::of(&req);
        let url = eval.render_request(&self.config.url, &snapshot)?;
        let uri: http::Uri = url
            .parse()
            .map_err(|e| GatewayError::InvalidUri(format!("request '{}': {}", self.config.name, e)))?;

        let out_body = match &self.config.body {
            Some(template) => body::full(eval.render_request(template, &snapshot)?),
            None => body::empty(),
        };

        let mut out = Request::new(out_body);
        *out.method_mut() = self.method.clone();
        *out.uri_mut() = uri;
        for (name, template) in &self.config.headers {
            let value = header_value(name, &eval.render_request(template, &snapshot)?)?;
            out.headers_mut().insert(header_name(name)?, value);
        }
        if let Some(ctx) = RequestContext::of(&req) {
            out.extensions_mut().insert(ctx.clone());
        }

        debug!(
            request = %self.config.name,
            method = %out.method(),
            uri = %out.uri(),
            "Sending synthetic request"
        );
        self.backend.round_trip(out).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Echo {
        seen: Mutex<Option<(Method, String, http::HeaderMap, Option<String>)>>,
    }

    #[async_trait]
    impl RoundTrip for Echo {
        async fn round_trip(
            &self,
            req: Request<GatewayBody>,
        ) -> Result<Response<GatewayBody>, GatewayError> {
            let name = RequestContext::of(&req).and_then(|c| c.round_trip_name.clone());
            let (parts, b) = req.into_parts();
            let bytes = body::collect(b).await?;
            *self.seen.lock() = Some((parts.method, parts.uri.to_string(), parts.headers, name));
            Ok(Response::new(body::full(bytes)))
        }
    }

    fn config(yaml: &str) -> RequestConfig {
        serde_saphyr::from_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn test_templated_request() {
        let backend = Arc::new(Echo::default());
        let producer = RequestProducer::new(
            config(
                "name: lookup\n\
                 url: \"http://users.internal/users/${request.query.id}\"\n\
                 method: post\n\
                 headers:\n  x-origin: \"${request.method}\"\n\
                 body: \"{\\\"id\\\": \\\"${request.query.id}\\\"}\"\n",
            ),
            backend.clone(),
        )
        .unwrap();

        let mut client = Request::builder()
            .uri("/profile?id=42")
            .body(body::empty())
            .unwrap();
        RequestContext::of_mut(&mut client).round_trip_name = Some("lookup".into());

        let res = producer
            .produce(client, &EvalContext::default())
            .await
            .unwrap();
        let echoed = body::collect(res.into_body()).await.unwrap();
        assert_eq!(&echoed[..], br#"{"id": "42"}"#);

        let (method, uri, headers, name) = backend.seen.lock().clone().unwrap();
        assert_eq!(method, Method::POST);
        assert_eq!(uri, "http://users.internal/users/42");
        assert_eq!(headers["x-origin"], "GET");
        assert_eq!(name.as_deref(), Some("lookup"));
    }

    #[test]
    fn test_invalid_method_rejected() {
        let err = RequestProducer::new(
            config("url: http://x\nmethod: \"GE T\"\n"),
            Arc::new(Echo::default()),
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));
    }

    #[test]
    fn test_must_buffer() {
        let backend = Arc::new(Echo::default());
        let plain = RequestProducer::new(config("url: http://x\n"), backend.clone()).unwrap();
        assert!(!plain.must_buffer());
        assert_eq!(plain.name(), "default");

        let reads_body = RequestProducer::new(
            config("url: http://x\nbody: \"${request.body}\"\n"),
            backend,
        )
        .unwrap();
        assert!(reads_body.must_buffer());
    }
}
