//! Upstream round-trip transport.
//!
//! # Overview
//!
//! [`RoundTrip`] is the seam every upstream call goes through: the proxy
//! round-tripper wraps one, producers call one, and the introspector sends
//! its authorization-server requests through one. [`HttpTransport`] is the
//! pooled HTTP/HTTPS implementation.
//!
//! # Error Mapping
//! - Connection refused -> `GatewayError::BackendRefused` (502)
//! - Timeout -> `GatewayError::BackendTimeout` (504)
//! - Other connect failures -> `GatewayError::BackendConnection` (502)
//! - Closed / reset / cancelled -> `GatewayError::ClientDisconnect`

use std::time::Duration;

use async_trait::async_trait;
use hyper::{Request, Response};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

use crate::body::{self, GatewayBody};
use crate::context::RequestContext;
use crate::error::GatewayError;

/// Executes one request against an upstream and returns its response.
#[async_trait]
pub trait RoundTrip: Send + Sync {
    /// Send `req` and wait for the response head.
    ///
    /// # Errors
    ///
    /// Returns a transport-class `GatewayError` when no response was obtained.
    async fn round_trip(
        &self,
        req: Request<GatewayBody>,
    ) -> Result<Response<GatewayBody>, GatewayError>;
}

/// Configuration for the pooled HTTP transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Enable TCP_NODELAY on upstream connections
    pub tcp_nodelay: bool,
    /// Maximum number of idle connections per host
    pub pool_max_idle_per_host: usize,
    /// Idle connection timeout
    pub pool_idle_timeout: Duration,
    /// Time allowed until the response head arrives (None = unbounded)
    pub timeout: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            pool_max_idle_per_host: 128,
            pool_idle_timeout: Duration::from_secs(90),
            timeout: None,
        }
    }
}

/// HTTPS-capable pooled upstream transport.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client<HttpsConnector<HttpConnector>, GatewayBody>,
    config: TransportConfig,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("config", &self.config)
            .finish()
    }
}

impl HttpTransport {
    /// Create a transport with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::BackendConnection` if:
    /// - TLS crypto provider installation fails
    /// - Native TLS root certificates cannot be loaded
    pub fn new(config: TransportConfig) -> Result<Self, GatewayError> {
        // Install default crypto provider for rustls exactly once and keep
        // the result for error reporting.
        static RUSTLS_INIT: std::sync::OnceLock<Result<(), ()>> = std::sync::OnceLock::new();
        let init_result = RUSTLS_INIT.get_or_init(|| {
            if rustls::crypto::CryptoProvider::get_default().is_some() {
                return Ok(());
            }
            rustls::crypto::ring::default_provider()
                .install_default()
                .map_err(|_| ())
        });
        if init_result.is_err() {
            return Err(GatewayError::BackendConnection(
                "Failed to install rustls crypto provider".into(),
            ));
        }

        let mut http_connector = HttpConnector::new();
        http_connector.set_nodelay(config.tcp_nodelay);
        http_connector.enforce_http(false);

        let https_connector = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| {
                GatewayError::BackendConnection(format!("Failed to load native TLS roots: {}", e))
            })?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .http1_preserve_header_case(true)
            .http1_title_case_headers(true)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .build(https_connector);

        Ok(Self { client, config })
    }

    /// Get a reference to the transport configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

#[async_trait]
impl RoundTrip for HttpTransport {
    async fn round_trip(
        &self,
        req: Request<GatewayBody>,
    ) -> Result<Response<GatewayBody>, GatewayError> {
        let ctx = RequestContext::of(&req);
        let cancel = ctx.map(|c| c.cancel.clone());
        // An upgrade-eligible request carries its own timeout.
        let timeout = ctx
            .and_then(|c| c.websockets_timeout.filter(|_| c.allow_websockets))
            .or(self.config.timeout);

        debug!(method = %req.method(), uri = %req.uri(), "Sending upstream request");

        let call = async {
            let request = self.client.request(req);
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, request).await {
                    Ok(res) => res.map_err(map_client_error),
                    Err(_) => Err(GatewayError::BackendTimeout(format!(
                        "no response within {}",
                        humantime::format_duration(limit)
                    ))),
                },
                None => request.await.map_err(map_client_error),
            }
        };

        let res = match cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(GatewayError::ClientDisconnect),
                res = call => res,
            },
            None => call.await,
        }?;

        let (parts, incoming) = res.into_parts();
        Ok(Response::from_parts(parts, body::from_incoming(incoming)))
    }
}

/// Map hyper_util client errors to transport error classes.
fn map_client_error(e: hyper_util::client::legacy::Error) -> GatewayError {
    let error_msg = format!("{:?}", e).to_lowercase();

    if error_msg.contains("connection refused") {
        warn!(error = %e, "Backend connection refused");
        return GatewayError::BackendRefused(format!("backend refused connection: {}", e));
    }

    if error_msg.contains("timeout") || error_msg.contains("timed out") {
        warn!(error = %e, "Backend timeout");
        return GatewayError::BackendTimeout(format!("backend timeout: {}", e));
    }

    if e.is_connect() || error_msg.contains("connect") {
        warn!(error = %e, "Backend connection failed");
        return GatewayError::BackendConnection(format!("failed to connect to backend: {}", e));
    }

    if error_msg.contains("closed") || error_msg.contains("canceled") || error_msg.contains("reset")
    {
        warn!(error = %e, "Connection closed during round trip");
        return GatewayError::ClientDisconnect;
    }

    warn!(error = %e, "Backend error");
    GatewayError::BackendConnection(format!("backend error: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body;
    use http::StatusCode;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_round_trip_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route("/ping", axum::routing::get(|| async { "pong" }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let transport = HttpTransport::new(TransportConfig::default()).unwrap();
        let req = Request::builder()
            .uri(format!("http://{}/ping", addr))
            .body(body::empty())
            .unwrap();

        let res = transport.round_trip(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let bytes = body::collect(res.into_body()).await.unwrap();
        assert_eq!(&bytes[..], b"pong");
    }

    #[tokio::test]
    async fn test_connection_refused_is_backend_error() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new(TransportConfig::default()).unwrap();
        let req = Request::builder()
            .uri(format!("http://{}/", addr))
            .body(body::empty())
            .unwrap();

        let err = transport.round_trip(req).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_cancelled_context_aborts_call() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route(
            "/slow",
            axum::routing::get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "late"
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let transport = HttpTransport::new(TransportConfig::default()).unwrap();
        let mut req = Request::builder()
            .uri(format!("http://{}/slow", addr))
            .body(body::empty())
            .unwrap();
        let token = RequestContext::of_mut(&mut req).cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let err = transport.round_trip(req).await.unwrap_err();
        assert!(matches!(err, GatewayError::ClientDisconnect));
    }
}
