//! Producers: units of upstream work started for one client request.
//!
//! # Overview
//!
//! An endpoint owns two [`Producers`] groups, proxies and synthetic
//! requests. Each group spawns one task per producer and sends exactly one
//! [`ProducerResult`] per producer into a channel with one slot per
//! producer. The channel closes once every task has reported.
//!
//! A task that dies without reporting (panic, abort) is turned into an
//! internal error result so the orchestrator never waits on a silent
//! producer.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use gatehouse_core::body::{self, GatewayBody};
use gatehouse_core::context::RequestContext;
use gatehouse_core::error::GatewayError;
use http::{Request, Response};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error};

use crate::eval::EvalContext;

/// Outcome of one producer.
#[derive(Debug)]
pub struct ProducerResult {
    /// Position of the producer within its group.
    pub ordinal: usize,
    /// Configured producer name.
    pub name: String,
    pub outcome: Result<Response<GatewayBody>, GatewayError>,
}

/// One unit of upstream work.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Name used for logging and result bookkeeping.
    fn name(&self) -> &str;

    /// Whether this producer evaluates the client request body.
    fn must_buffer(&self) -> bool {
        false
    }

    /// Perform the work for one client request.
    ///
    /// # Errors
    ///
    /// Returns the error to report as this producer's result.
    async fn produce(
        &self,
        req: Request<GatewayBody>,
        eval: &EvalContext,
    ) -> Result<Response<GatewayBody>, GatewayError>;
}

/// Client request shared by all producers of one request.
///
/// A buffered body is replayed for every producer. A streaming body can be
/// consumed once; later producers see an empty body.
pub struct ClientRequest {
    parts: http::request::Parts,
    body: Mutex<Option<GatewayBody>>,
    buffered: Option<bytes::Bytes>,
}

impl ClientRequest {
    pub fn new(req: Request<GatewayBody>) -> Self {
        let buffered = RequestContext::of(&req).and_then(|c| c.buffered_body.clone());
        let (parts, body) = req.into_parts();
        Self {
            parts,
            body: Mutex::new(Some(body)),
            buffered,
        }
    }

    /// Parts of the client request.
    pub fn parts(&self) -> &http::request::Parts {
        &self.parts
    }

    /// Build the outbound copy for producer `name`, carrying a child
    /// context named after it.
    pub fn request_for(&self, name: &str) -> Request<GatewayBody> {
        let body = match &self.buffered {
            Some(bytes) => body::full(bytes.clone()),
            None => self.body.lock().take().unwrap_or_else(body::empty),
        };

        let mut req = Request::new(body);
        *req.method_mut() = self.parts.method.clone();
        *req.uri_mut() = self.parts.uri.clone();
        *req.version_mut() = self.parts.version;
        *req.headers_mut() = self.parts.headers.clone();
        *req.extensions_mut() = self.parts.extensions.clone();

        let child = match self.parts.extensions.get::<RequestContext>() {
            Some(parent) => parent.child(Some(name.to_string())),
            None => RequestContext::new().child(Some(name.to_string())),
        };
        req.extensions_mut().insert(child);
        req
    }
}

/// An ordered group of producers of the same kind.
#[derive(Clone, Default)]
pub struct Producers {
    items: Vec<Arc<dyn Producer>>,
}

impl std::fmt::Debug for Producers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.items.iter().map(|p| p.name()))
            .finish()
    }
}

impl Producers {
    pub fn new(items: Vec<Arc<dyn Producer>>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether any producer of the group needs the buffered body.
    pub fn must_buffer(&self) -> bool {
        self.items.iter().any(|p| p.must_buffer())
    }

    /// Channel with one slot per producer of this group.
    pub fn channel(&self) -> (mpsc::Sender<ProducerResult>, mpsc::Receiver<ProducerResult>) {
        mpsc::channel(self.items.len().max(1))
    }

    /// Start every producer concurrently.
    ///
    /// Each producer races its work against the cancellation token of its
    /// request context. `tx` is dropped, closing the channel, once every
    /// producer has reported.
    pub fn produce(
        &self,
        client: Arc<ClientRequest>,
        eval: EvalContext,
        tx: mpsc::Sender<ProducerResult>,
    ) -> JoinHandle<()> {
        let items = self.items.clone();

        tokio::spawn(async move {
            let mut tasks = JoinSet::new();
            let mut names = HashMap::with_capacity(items.len());

            for (ordinal, producer) in items.into_iter().enumerate() {
                let name = producer.name().to_string();
                let req = client.request_for(&name);
                let eval = eval.clone();
                let task_name = name.clone();

                let handle = tasks.spawn(async move {
                    let cancel = RequestContext::of(&req)
                        .map(|c| c.cancel.clone())
                        .unwrap_or_default();
                    debug!(producer = %task_name, ordinal, "Producer started");

                    let outcome = tokio::select! {
                        _ = cancel.cancelled() => Err(GatewayError::ClientDisconnect),
                        res = producer.produce(req, &eval) => res,
                    };
                    ProducerResult {
                        ordinal,
                        name: task_name,
                        outcome,
                    }
                });
                names.insert(handle.id(), (ordinal, name));
            }

            while let Some(joined) = tasks.join_next_with_id().await {
                let result = match joined {
                    Ok((_, result)) => result,
                    Err(e) => {
                        let (ordinal, name) = names
                            .remove(&e.id())
                            .unwrap_or((usize::MAX, "unknown".to_string()));
                        error!(
                            producer = %name,
                            error = %e,
                            "Producer finished without a result"
                        );
                        ProducerResult {
                            ordinal,
                            outcome: Err(GatewayError::Internal(format!(
                                "producer '{}' finished without a result",
                                name
                            ))),
                            name,
                        }
                    }
                };

                if tx.send(result).await.is_err() {
                    // receiver gone; remaining tasks are aborted with the set
                    break;
                }
            }
        })
    }
}
