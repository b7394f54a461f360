//! Proxy round-tripper.
//!
//! # Overview
//!
//! [`Proxy`] wraps a backend [`RoundTrip`] and applies a route's proxy
//! policy around it:
//!
//! 1. request policy (failure aborts the call)
//! 2. websockets block handling
//! 3. `url` attribute / backend origin rewrite
//! 4. director: credential and hop-by-hop header stripping
//! 5. backend round trip
//! 6. response policy (failure is logged, the response is kept)
//!
//! Upgrade headers (`connection`, `upgrade`) and `transfer-encoding` are
//! forwarded untouched so WebSocket handshakes reach the backend. When the
//! backend switches protocols, both connections are handed to a [`Tunnel`].

use std::sync::Arc;

use async_trait::async_trait;
use gatehouse_core::body::GatewayBody;
use gatehouse_core::config::duration_format;
use gatehouse_core::context::RequestContext;
use gatehouse_core::error::GatewayError;
use gatehouse_core::transport::RoundTrip;
use http::header::{AUTHORIZATION, COOKIE, HOST, HeaderName, HeaderValue};
use http::{Request, Response, Uri};
use hyper::upgrade::OnUpgrade;
use tracing::{debug, info, warn};

use crate::eval::{EvalContext, PolicyBody, RequestSnapshot};
use crate::producer::Producer;
use crate::tunnel::Tunnel;

/// Credential headers never passed upstream, applied after policy
/// evaluation.
const STRIPPED_HEADERS: [HeaderName; 2] = [AUTHORIZATION, COOKIE];

/// Reverse proxy with per-route policy.
pub struct Proxy {
    backend: Arc<dyn RoundTrip>,
    body: PolicyBody,
    eval: EvalContext,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy").field("body", &self.body).finish()
    }
}

impl Proxy {
    pub fn new(backend: Arc<dyn RoundTrip>, body: PolicyBody, eval: EvalContext) -> Self {
        Self {
            backend,
            body,
            eval,
        }
    }

    /// The proxy's policy body.
    pub fn body(&self) -> &PolicyBody {
        &self.body
    }

    /// Forward `req` using `eval` for every expression.
    ///
    /// # Errors
    ///
    /// Returns request-policy, configuration and backend transport errors.
    /// Response-policy errors are logged only.
    pub async fn forward(
        &self,
        mut req: Request<GatewayBody>,
        eval: &EvalContext,
    ) -> Result<Response<GatewayBody>, GatewayError> {
        eval.apply_request_context(&self.body, &mut req)?;
        self.apply_websockets(&mut req, eval)?;
        self.apply_url(&mut req, eval)?;
        director(&mut req);

        let ctx = RequestContext::of_mut(&mut req);
        let request_id = ctx.request_id.clone();
        let allow_websockets = ctx.allow_websockets;
        let tunnel_timeout = ctx.websockets_timeout;
        let upgrade_protocol = if allow_websockets && is_upgrade_request(&req) {
            get_upgrade_protocol(&req)
        } else {
            None
        };
        // the client connection is only taken over for upgrades this proxy allows
        let client_upgrade = upgrade_protocol
            .as_ref()
            .and_then(|_| req.extensions_mut().remove::<OnUpgrade>());

        match &upgrade_protocol {
            Some(protocol) => info!(
                request_id = %request_id,
                method = %req.method(),
                uri = %req.uri(),
                upgrade_protocol = %protocol,
                "Proxying upgrade request"
            ),
            None => debug!(
                request_id = %request_id,
                method = %req.method(),
                uri = %req.uri(),
                "Proxying request"
            ),
        }

        let snapshot = RequestSnapshot::of(&req);
        let mut res = self.backend.round_trip(req).await?;

        if upgrade_protocol.is_some() && is_upgrade_response(&res) {
            info!(
                request_id = %request_id,
                upgrade_protocol = ?upgrade_protocol,
                "Backend accepted protocol upgrade"
            );
            match (client_upgrade, res.extensions_mut().remove::<OnUpgrade>()) {
                (Some(client), Some(backend)) => {
                    Tunnel::new(client, backend, tunnel_timeout, request_id.clone()).spawn();
                }
                _ => warn!(
                    request_id = %request_id,
                    "Protocol upgrade without connections to relay"
                ),
            }
        }

        if let Err(e) = eval.apply_response_context(&self.body, &snapshot, &mut res) {
            warn!(
                request_id = %request_id,
                error = %e,
                "Response policy evaluation failed"
            );
        }

        Ok(res)
    }

    fn apply_websockets<B>(
        &self,
        req: &mut Request<B>,
        eval: &EvalContext,
    ) -> Result<(), GatewayError> {
        if self.body.websockets.len() > 1 {
            return Err(GatewayError::Configuration(
                "too many websockets blocks, only one is allowed".to_string(),
            ));
        }
        if self.body.backends.len() > 1 {
            return Err(GatewayError::Configuration(
                "too many backend blocks, only one is allowed".to_string(),
            ));
        }
        let Some(ws) = self.body.websockets.first() else {
            return Ok(());
        };

        RequestContext::of_mut(req).allow_websockets = true;
        if !is_upgrade_request(req) {
            return Ok(());
        }

        eval.apply_request_headers(&ws.request, req)?;

        if let Some(timeout) = ws.timeout.as_deref().filter(|t| !t.trim().is_empty()) {
            let timeout = duration_format::parse_duration(timeout).map_err(|e| {
                GatewayError::Configuration(format!("websockets timeout: {}", e))
            })?;
            RequestContext::of_mut(req).websockets_timeout = Some(timeout);
        }
        Ok(())
    }

    fn apply_url<B>(&self, req: &mut Request<B>, eval: &EvalContext) -> Result<(), GatewayError> {
        let target = match (&self.body.url, self.body.backends.first()) {
            (Some(url), _) => {
                let url = eval.render_request(url, &RequestSnapshot::of(req))?;
                if url.is_empty() {
                    return Ok(());
                }
                RequestContext::of_mut(req).url_attribute = Some(url.clone());
                url
            }
            (None, Some(origin)) => origin.clone(),
            (None, None) => return Ok(()),
        };

        let (uri, authority) = rewrite_uri(req.uri(), &target)?;
        *req.uri_mut() = uri;
        let host = HeaderValue::from_str(&authority)
            .map_err(|e| GatewayError::InvalidUri(format!("invalid host '{}': {}", authority, e)))?;
        req.headers_mut().insert(HOST, host);
        Ok(())
    }
}

#[async_trait]
impl RoundTrip for Proxy {
    async fn round_trip(
        &self,
        req: Request<GatewayBody>,
    ) -> Result<Response<GatewayBody>, GatewayError> {
        self.forward(req, &self.eval).await
    }
}

/// A [`Proxy`] started as an endpoint producer.
#[derive(Debug)]
pub struct ProxyProducer {
    name: String,
    proxy: Arc<Proxy>,
}

impl ProxyProducer {
    pub fn new(name: impl Into<String>, proxy: Arc<Proxy>) -> Self {
        Self {
            name: name.into(),
            proxy,
        }
    }
}

#[async_trait]
impl Producer for ProxyProducer {
    fn name(&self) -> &str {
        &self.name
    }

    fn must_buffer(&self) -> bool {
        self.proxy.body().must_buffer()
    }

    async fn produce(
        &self,
        req: Request<GatewayBody>,
        eval: &EvalContext,
    ) -> Result<Response<GatewayBody>, GatewayError> {
        self.proxy.forward(req, eval).await
    }
}

/// Strip credentials and hop-by-hop headers from an outbound request.
pub fn director<B>(req: &mut Request<B>) {
    let headers = req.headers_mut();
    for name in &STRIPPED_HEADERS {
        headers.remove(name);
    }

    let hop_by_hop: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();
    for name in hop_by_hop {
        headers.remove(&name);
    }
}

/// Point `uri` at `target`, returning the new URI and its authority.
///
/// The target's scheme and authority always win. Its path replaces the
/// request path unless it is empty or `/`; its query replaces the request
/// query when present.
fn rewrite_uri(uri: &Uri, target: &str) -> Result<(Uri, String), GatewayError> {
    let url = url::Url::parse(target)
        .map_err(|e| GatewayError::InvalidUri(format!("invalid url '{}': {}", target, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(GatewayError::InvalidUri(format!(
            "unsupported scheme in url '{}'",
            target
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| GatewayError::InvalidUri(format!("missing host in url '{}'", target)))?;
    let authority = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let path = match url.path() {
        "" | "/" => uri.path(),
        path => path,
    };
    let query = url.query().or(uri.query());

    let full_uri = match query {
        Some(q) => format!("{}://{}{}?{}", url.scheme(), authority, path, q),
        None => format!("{}://{}{}", url.scheme(), authority, path),
    };
    let uri = full_uri
        .parse()
        .map_err(|e| GatewayError::InvalidUri(format!("failed to parse URI: {}", e)))?;
    Ok((uri, authority))
}

/// Check if a header is a hop-by-hop header that shouldn't be forwarded.
///
/// `connection`, `upgrade` and `transfer-encoding` are NOT filtered so
/// protocol upgrades and chunked streaming pass through.
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "keep-alive" | "proxy-authenticate" | "proxy-authorization" | "te" | "trailers"
    )
}

/// Check if a request is attempting a protocol upgrade.
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    req.headers()
        .get("connection")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false)
        && req.headers().contains_key("upgrade")
}

/// Get the upgrade protocol from request headers.
pub fn get_upgrade_protocol<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase())
}

/// Check if a response indicates a successful protocol upgrade.
pub fn is_upgrade_response<B>(res: &Response<B>) -> bool {
    res.status() == http::StatusCode::SWITCHING_PROTOCOLS
}
