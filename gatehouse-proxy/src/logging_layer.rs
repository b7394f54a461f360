//! Access logging for the gateway service.
//!
//! [`gateway_trace_layer`] wraps a [`GatewayService`](crate::GatewayService)
//! in a `tower_http` trace layer. Every request gets a span carrying the
//! request id the gateway will answer with, so producer and introspection
//! logs emitted below it correlate with the access log lines.
//!
//! Credentials never reach the logs: header dumps (DEBUG only) pass through
//! [`Redacted`].

use std::fmt;
use std::time::Duration;

use gatehouse_core::context::REQUEST_ID_HEADER;
use http::header::{AUTHORIZATION, COOKIE, PROXY_AUTHORIZATION, SET_COOKIE};
use http::{HeaderMap, HeaderName, Request, Response};
use tower_http::classify::{ServerErrorsAsFailures, ServerErrorsFailureClass, SharedClassifier};
use tower_http::trace::{DefaultOnBodyChunk, DefaultOnEos, MakeSpan, OnFailure, OnRequest, OnResponse, TraceLayer};
use tracing::{Level, Span, debug, info, warn};

/// Redacted in addition to the standard credential headers.
const SECRET_HEADERS: &[&str] = &["x-api-key", "x-auth-token", "x-client-secret"];

const MAX_LOGGED_HEADERS: usize = 50;
const MAX_LOGGED_VALUE: usize = 1024;

/// Trace layer type produced by [`gateway_trace_layer`].
pub type GatewayTraceLayer = TraceLayer<
    SharedClassifier<ServerErrorsAsFailures>,
    RequestIdSpan,
    LogRequest,
    LogResponse,
    DefaultOnBodyChunk,
    DefaultOnEos,
    LogFailure,
>;

/// Access-log layer for the gateway service.
pub fn gateway_trace_layer() -> GatewayTraceLayer {
    TraceLayer::new_for_http()
        .make_span_with(RequestIdSpan)
        .on_request(LogRequest)
        .on_response(LogResponse)
        .on_failure(LogFailure)
}

/// Opens the `gateway_request` span.
///
/// The span's `request_id` is the client's `x-request-id` when it sent one;
/// otherwise it stays empty until the response is known and [`LogResponse`]
/// records the id the gateway generated.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestIdSpan;

impl<B> MakeSpan<B> for RequestIdSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let span = tracing::info_span!(
            "gateway_request",
            method = %request.method(),
            path = %request.uri().path(),
            request_id = tracing::field::Empty,
        );
        if let Some(id) = header_str(request.headers(), REQUEST_ID_HEADER) {
            span.record("request_id", id);
        }
        span
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LogRequest;

impl<B> OnRequest<B> for LogRequest {
    fn on_request(&mut self, request: &Request<B>, _span: &Span) {
        info!(
            uri = %request.uri(),
            version = ?request.version(),
            "Client request"
        );
        if tracing::enabled!(Level::DEBUG) {
            debug!(headers = ?Redacted(request.headers()), "Client request headers");
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LogResponse;

impl<B> OnResponse<B> for LogResponse {
    fn on_response(self, response: &Response<B>, latency: Duration, span: &Span) {
        if let Some(id) = header_str(response.headers(), REQUEST_ID_HEADER) {
            span.record("request_id", id);
        }
        info!(
            status = response.status().as_u16(),
            latency_ms = latency.as_millis(),
            "Client response"
        );
        if tracing::enabled!(Level::DEBUG) {
            debug!(headers = ?Redacted(response.headers()), "Client response headers");
        }
    }
}

/// Logs 5xx responses and aborted requests.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogFailure;

impl OnFailure<ServerErrorsFailureClass> for LogFailure {
    fn on_failure(&mut self, failure: ServerErrorsFailureClass, latency: Duration, _span: &Span) {
        match failure {
            ServerErrorsFailureClass::StatusCode(status) => warn!(
                status = status.as_u16(),
                latency_ms = latency.as_millis(),
                "Request answered with server error"
            ),
            ServerErrorsFailureClass::Error(reason) => warn!(
                reason = %reason,
                latency_ms = latency.as_millis(),
                "Request aborted without response"
            ),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn is_secret(name: &HeaderName) -> bool {
    *name == AUTHORIZATION
        || *name == PROXY_AUTHORIZATION
        || *name == COOKIE
        || *name == SET_COOKIE
        || SECRET_HEADERS.contains(&name.as_str())
}

/// Debug view of a header map with credentials masked and long values cut.
pub struct Redacted<'a>(pub &'a HeaderMap);

impl fmt::Debug for Redacted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in self.0.iter().take(MAX_LOGGED_HEADERS) {
            if is_secret(name) {
                map.entry(&name.as_str(), &"<redacted>");
                continue;
            }
            match value.to_str() {
                // visible ASCII only, so byte slicing is safe
                Ok(text) if text.len() > MAX_LOGGED_VALUE => map.entry(
                    &name.as_str(),
                    &format!("{}... ({} bytes)", &text[..MAX_LOGGED_VALUE], text.len()),
                ),
                Ok(text) => map.entry(&name.as_str(), &text),
                Err(_) => map.entry(&name.as_str(), &format!("<{} opaque bytes>", value.len())),
            };
        }
        let skipped = self.0.len().saturating_sub(MAX_LOGGED_HEADERS);
        if skipped > 0 {
            map.entry(&"...", &format!("{} more", skipped));
        }
        map.finish()
    }
}
