//! Endpoint orchestrator.
//!
//! # Overview
//!
//! An [`Endpoint`] serves one route:
//!
//! ```text
//! buffer body -> request policy -> start producers -> drain results
//!     -> select response -> response policy -> write
//! ```
//!
//! Proxy and request producers run concurrently. Proxy results are drained
//! first, then request results; every result is kept under
//! `(ordinal, name)` until selection.
//!
//! # Response selection
//!
//! 1. configured redirect
//! 2. configured static response
//! 3. the single producer result
//!
//! More than one producer result without a redirect or static response is a
//! configuration error. A selected producer error is logged. In both cases
//! the request is aborted and nothing is written.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use gatehouse_core::body::{self, GatewayBody};
use gatehouse_core::config::{self, ConfigError};
use gatehouse_core::context::RequestContext;
use gatehouse_core::error::GatewayError;
use http::{Method, Request, Response};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error_handler::{ErrorHandler, ErrorTemplate};
use crate::eval::{EvalContext, PolicyBody, RequestSnapshot};
use crate::handler::Handler;
use crate::producer::{ClientRequest, ProducerResult, Producers};
use crate::response::{Redirect, StaticResponse};

type Results = BTreeMap<(usize, String), Result<Response<GatewayBody>, GatewayError>>;

/// Which parts of the client request are buffered before evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BufferOption {
    #[default]
    None,
    /// Read the request body into memory so it can be evaluated and replayed.
    Request,
}

/// Immutable per-route settings.
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    /// Route policy body.
    pub context: PolicyBody,
    pub buffer: BufferOption,
    /// Maximum buffered request body size in bytes.
    pub request_body_limit: u64,
    pub error_template: ErrorTemplate,
    /// Custom handlers for rejected request bodies; the template answers
    /// when unset.
    pub error_handler: Option<Arc<ErrorHandler>>,
    pub redirect: Option<Redirect>,
    pub response: Option<StaticResponse>,
}

impl EndpointOptions {
    /// Options with a human-readable body limit such as `"1MiB"`; `None`
    /// uses the 64MiB default.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSize` for an unparsable limit.
    pub fn with_body_limit(limit: Option<&str>) -> Result<Self, ConfigError> {
        Ok(Self {
            request_body_limit: config::parse_body_limit(limit)?,
            ..Self::default()
        })
    }
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            context: PolicyBody::default(),
            buffer: BufferOption::None,
            request_body_limit: 64 * 1024 * 1024,
            error_template: ErrorTemplate::default(),
            error_handler: None,
            redirect: None,
            response: None,
        }
    }
}

/// Destination of the client response.
#[async_trait]
pub trait ResponseWriter: Send {
    /// Write the complete response.
    ///
    /// # Errors
    ///
    /// Returns an error if the response could not be delivered.
    async fn write_response(&mut self, res: Response<GatewayBody>) -> Result<(), GatewayError>;
}

/// Writer that keeps the response for the caller.
#[derive(Debug, Default)]
pub struct ResponseSlot {
    response: Option<Response<GatewayBody>>,
}

impl ResponseSlot {
    /// Take the written response, if any.
    pub fn take(&mut self) -> Option<Response<GatewayBody>> {
        self.response.take()
    }
}

#[async_trait]
impl ResponseWriter for ResponseSlot {
    async fn write_response(&mut self, res: Response<GatewayBody>) -> Result<(), GatewayError> {
        if self.response.is_some() {
            return Err(GatewayError::Internal("response already written".to_string()));
        }
        self.response = Some(res);
        Ok(())
    }
}

/// Orchestrates the producers of one route.
#[derive(Debug)]
pub struct Endpoint {
    options: EndpointOptions,
    eval: EvalContext,
    proxies: Producers,
    requests: Producers,
}

impl Endpoint {
    /// Create an endpoint. Request buffering is switched on when any
    /// expression of the route or its producers reads the request body.
    pub fn new(
        mut options: EndpointOptions,
        eval: EvalContext,
        proxies: Producers,
        requests: Producers,
    ) -> Self {
        let reads_body = options.context.must_buffer()
            || proxies.must_buffer()
            || requests.must_buffer()
            || options.redirect.as_ref().is_some_and(Redirect::must_buffer)
            || options.response.as_ref().is_some_and(StaticResponse::must_buffer);
        if reads_body {
            options.buffer = BufferOption::Request;
        }

        Self {
            options,
            eval,
            proxies,
            requests,
        }
    }

    pub fn options(&self) -> &EndpointOptions {
        &self.options
    }

    /// Buffer the request body when the route needs it.
    ///
    /// Skipped for `TRACE`, when buffering is off, and when the body was
    /// already captured. At most `limit + 1` bytes are read. On success the
    /// bytes are stored in the request context and the body is replaced by
    /// a replayable copy.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::BodySizeExceeded` when the body is larger than
    /// the limit and `GatewayError::BodyRead` when the stream fails.
    pub async fn set_get_body(&self, req: &mut Request<GatewayBody>) -> Result<(), GatewayError> {
        if req.method() == Method::TRACE || self.options.buffer != BufferOption::Request {
            return Ok(());
        }
        if RequestContext::of_mut(req).buffered_body.is_some() {
            return Ok(());
        }

        let limit = self.options.request_body_limit;
        let stream = std::mem::replace(req.body_mut(), body::empty());
        let max = usize::try_from(limit).unwrap_or(usize::MAX);
        let bytes = match Limited::new(stream, max).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => return Err(classify_body_error(e, limit)),
        };

        *req.body_mut() = body::full(bytes.clone());
        RequestContext::of_mut(req).buffered_body = Some(bytes);
        Ok(())
    }

    /// Serve `req`, writing at most one response to `rw`.
    ///
    /// # Errors
    ///
    /// Returns the reason when the request was aborted and nothing was
    /// written. Write failures are logged only.
    pub async fn serve_http(
        &self,
        rw: &mut dyn ResponseWriter,
        mut req: Request<GatewayBody>,
    ) -> Result<(), GatewayError> {
        let ctx = RequestContext::of_mut(&mut req);
        ctx.cancel = ctx.cancel.child_token();
        let _cancel_on_return = ctx.cancel.clone().drop_guard();
        let request_id = ctx.request_id.clone();

        if let Err(e) = self.set_get_body(&mut req).await {
            warn!(
                request_id = %request_id,
                error_type = e.error_type_name(),
                error = %e,
                "Request body rejected"
            );
            let res = match &self.options.error_handler {
                Some(errors) => errors.serve_with(req, e).await.inspect_err(|e| {
                    error!(request_id = %request_id, error = %e, "Error handler aborted");
                })?,
                None => self.options.error_template.serve_error(&req, &e),
            };
            write(rw, res, &request_id).await;
            return Ok(());
        }

        if let Err(e) = self
            .eval
            .apply_request_context(&self.options.context, &mut req)
        {
            error!(request_id = %request_id, error = %e, "Request policy evaluation failed");
        }

        let snapshot = RequestSnapshot::of(&req);
        let client = Arc::new(ClientRequest::new(req));

        let (proxy_tx, mut proxy_rx) = self.proxies.channel();
        let (request_tx, mut request_rx) = self.requests.channel();
        self.proxies
            .produce(Arc::clone(&client), self.eval.clone(), proxy_tx);
        self.requests.produce(client, self.eval.clone(), request_tx);

        let mut results = Results::new();
        read_results(&mut proxy_rx, &mut results, 0).await;
        read_results(&mut request_rx, &mut results, self.proxies.len()).await;
        debug!(request_id = %request_id, results = results.len(), "Producers finished");

        let mut res = match self.select_response(results, &snapshot, &request_id) {
            Ok(res) => res,
            Err(e) => {
                error!(
                    request_id = %request_id,
                    error_type = e.error_type_name(),
                    error = %e,
                    "Endpoint aborted without response"
                );
                return Err(e);
            }
        };

        if let Err(e) =
            self.eval
                .apply_response_context(&self.options.context, &snapshot, &mut res)
        {
            error!(request_id = %request_id, error = %e, "Response policy evaluation failed");
        }

        write(rw, res, &request_id).await;
        Ok(())
    }

    fn select_response(
        &self,
        mut results: Results,
        snapshot: &RequestSnapshot,
        request_id: &str,
    ) -> Result<Response<GatewayBody>, GatewayError> {
        if let Some(redirect) = &self.options.redirect {
            log_dropped(results, request_id);
            return redirect.to_response(&self.eval, snapshot);
        }
        if let Some(response) = &self.options.response {
            log_dropped(results, request_id);
            return response.to_response(&self.eval, snapshot);
        }

        if results.len() > 1 {
            let count = results.len();
            log_dropped(results, request_id);
            return Err(GatewayError::Configuration(format!(
                "endpoint produced {} results, expected exactly one",
                count
            )));
        }

        match results.pop_first() {
            Some(((_, name), outcome)) => outcome.inspect_err(|e| {
                debug!(request_id = %request_id, producer = %name, error = %e, "Selected producer failed");
            }),
            None => Err(GatewayError::Configuration(
                "endpoint has no response source".to_string(),
            )),
        }
    }
}

#[async_trait]
impl Handler for Endpoint {
    async fn serve(&self, req: Request<GatewayBody>) -> Result<Response<GatewayBody>, GatewayError> {
        let mut slot = ResponseSlot::default();
        self.serve_http(&mut slot, req).await?;
        slot.take()
            .ok_or_else(|| GatewayError::Internal("endpoint wrote no response".to_string()))
    }

    fn body_context(&self) -> Option<&PolicyBody> {
        Some(&self.options.context)
    }
}

async fn read_results(
    rx: &mut mpsc::Receiver<ProducerResult>,
    results: &mut Results,
    offset: usize,
) {
    while let Some(result) = rx.recv().await {
        results.insert(
            (offset.saturating_add(result.ordinal), result.name),
            result.outcome,
        );
    }
}

/// Log producer errors that lost selection.
fn log_dropped(results: Results, request_id: &str) {
    for ((_, name), outcome) in results {
        if let Err(e) = outcome {
            warn!(
                request_id = %request_id,
                producer = %name,
                error_type = e.error_type_name(),
                error = %e,
                "Dropping producer error"
            );
        }
    }
}

async fn write(rw: &mut dyn ResponseWriter, res: Response<GatewayBody>, request_id: &str) {
    if let Err(e) = rw.write_response(res).await {
        error!(request_id = %request_id, error = %e, "Endpoint write error");
    }
}

fn classify_body_error(e: Box<dyn std::error::Error + Send + Sync>, limit: u64) -> GatewayError {
    if e.is::<LengthLimitError>() {
        return GatewayError::BodySizeExceeded { limit };
    }
    match e.downcast::<GatewayError>() {
        Ok(inner) => *inner,
        Err(other) => GatewayError::BodyRead(other.to_string()),
    }
}
