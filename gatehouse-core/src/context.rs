//! Request-scoped state carried through every stage of the pipeline.
//!
//! A single [`RequestContext`] rides along as a typed request extension.
//! Stages read and write its named fields instead of looking up values by
//! key, so a stage can never find a value of the wrong type.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::Request;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;

/// Header used to propagate the request id to backends and error templates.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request state shared by the orchestrator, producers and transports.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlation id for logs and error responses.
    pub request_id: String,
    /// Name of the round trip that produced the current outbound request
    /// (e.g. a producer name or `"introspection"`).
    pub round_trip_name: Option<String>,
    /// Replayable copy of the client request body, present once buffered.
    pub buffered_body: Option<Bytes>,
    /// The proxy configuration permits protocol upgrades.
    pub allow_websockets: bool,
    /// Upgrade timeout from the websockets block, if configured.
    pub websockets_timeout: Option<Duration>,
    /// Evaluated `url` attribute of the proxy, if configured.
    pub url_attribute: Option<String>,
    /// Cancelled when the owning request finishes.
    pub cancel: CancellationToken,
    /// Classified error this request is being answered with.
    pub error: Option<Arc<GatewayError>>,
    /// Custom access-log fields collected along the way. Shared between
    /// clones so fields added by inner stages reach the access log.
    pub log_fields: Arc<Mutex<BTreeMap<String, String>>>,
}

impl RequestContext {
    /// Create a context with a fresh request id.
    pub fn new() -> Self {
        Self::with_request_id(uuid::Uuid::new_v4().to_string())
    }

    /// Create a context with a caller-supplied request id.
    pub fn with_request_id(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            round_trip_name: None,
            buffered_body: None,
            allow_websockets: false,
            websockets_timeout: None,
            url_attribute: None,
            cancel: CancellationToken::new(),
            error: None,
            log_fields: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Derive the context for an outbound round trip.
    ///
    /// The child shares the request id and log fields, gets a child
    /// cancellation token and drops per-call state (upgrade flags, url).
    pub fn child(&self, round_trip_name: Option<String>) -> Self {
        Self {
            request_id: self.request_id.clone(),
            round_trip_name,
            buffered_body: self.buffered_body.clone(),
            allow_websockets: false,
            websockets_timeout: None,
            url_attribute: None,
            cancel: self.cancel.child_token(),
            error: None,
            log_fields: Arc::clone(&self.log_fields),
        }
    }

    /// Borrow the context of a request, inserting a fresh one if absent.
    ///
    /// A request id supplied by the client in `x-request-id` is kept.
    pub fn of_mut<B>(req: &mut Request<B>) -> &mut Self {
        let request_id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        req.extensions_mut().get_or_insert_with(|| match request_id {
            Some(id) => Self::with_request_id(id),
            None => Self::new(),
        })
    }

    /// Borrow the context of a request, if one was attached.
    pub fn of<B>(req: &Request<B>) -> Option<&Self> {
        req.extensions().get::<Self>()
    }

    /// Record a custom access-log field.
    pub fn add_log_field(&self, key: impl Into<String>, value: impl Into<String>) {
        self.log_fields.lock().insert(key.into(), value.into());
    }

    /// Snapshot of the collected access-log fields.
    pub fn log_fields(&self) -> BTreeMap<String, String> {
        self.log_fields.lock().clone()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_of_mut_keeps_client_request_id() {
        let mut req = Request::builder()
            .uri("/")
            .header(REQUEST_ID_HEADER, "abc-123")
            .body(())
            .unwrap();
        assert_eq!(RequestContext::of_mut(&mut req).request_id, "abc-123");
        // second access returns the same context
        RequestContext::of_mut(&mut req).allow_websockets = true;
        assert!(RequestContext::of(&req).unwrap().allow_websockets);
    }

    #[test]
    fn test_child_shares_log_fields_and_cancellation() {
        let parent = RequestContext::with_request_id("r1");
        let child = parent.child(Some("backend".into()));
        child.add_log_field("k", "v");

        assert_eq!(parent.log_fields().get("k").map(String::as_str), Some("v"));
        assert_eq!(child.request_id, "r1");
        assert_eq!(child.round_trip_name.as_deref(), Some("backend"));

        parent.cancel.cancel();
        assert!(child.cancel.is_cancelled());
    }
}
