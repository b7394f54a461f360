//! Tower `Service` adapter for handlers.
//!
//! Attaches a [`RequestContext`] to every inbound request, serves it with the
//! wrapped [`Handler`] and echoes the request id. An aborted request
//! surfaces as a service error so the server drops the connection without
//! writing a response.

use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use gatehouse_core::body::GatewayBody;
use gatehouse_core::context::{REQUEST_ID_HEADER, RequestContext};
use gatehouse_core::error::GatewayError;
use http::header::HeaderValue;
use http::{Request, Response};
use http_body::Body;
use http_body_util::BodyExt;
use tower::Service;
use tracing::{debug, warn};

use crate::handler::Handler;

/// Serves requests with a shared handler.
#[derive(Clone)]
pub struct GatewayService {
    handler: Arc<dyn Handler>,
}

impl GatewayService {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self { handler }
    }
}

impl<B> Service<Request<B>> for GatewayService
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Display,
{
    type Response = Response<GatewayBody>;
    type Error = GatewayError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let handler = Arc::clone(&self.handler);
        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let body = body
                .map_err(|e| GatewayError::BodyRead(e.to_string()))
                .boxed();
            let mut req = Request::from_parts(parts, body);

            let ctx = RequestContext::of_mut(&mut req);
            let request_id = ctx.request_id.clone();
            let log_fields = Arc::clone(&ctx.log_fields);

            let result = handler.serve(req).await;

            let fields = log_fields.lock().clone();
            if !fields.is_empty() {
                debug!(request_id = %request_id, fields = ?fields, "Custom log fields");
            }

            let mut res = result.inspect_err(|e| {
                warn!(
                    request_id = %request_id,
                    error_type = e.error_type_name(),
                    "Request aborted"
                );
            })?;
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                res.headers_mut().entry(REQUEST_ID_HEADER).or_insert(value);
            }
            Ok(res)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gatehouse_core::body;
    use http_body_util::Full;
    use tower::ServiceExt;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn serve(
            &self,
            req: Request<GatewayBody>,
        ) -> Result<Response<GatewayBody>, GatewayError> {
            let ctx = RequestContext::of(&req).unwrap();
            ctx.add_log_field("seen", "yes");
            if req.uri().path() == "/abort" {
                return Err(GatewayError::Configuration("two results".into()));
            }
            let bytes = body::collect(req.into_body()).await?;
            Ok(Response::new(body::full(bytes)))
        }
    }

    #[tokio::test]
    async fn test_serves_and_echoes_request_id() {
        let svc = GatewayService::new(Arc::new(Echo));
        let req = Request::builder()
            .uri("/echo")
            .header(REQUEST_ID_HEADER, "client-id-1")
            .body(Full::new(Bytes::from_static(b"ping")))
            .unwrap();

        let res = svc.oneshot(req).await.unwrap();
        assert_eq!(res.headers()[REQUEST_ID_HEADER], "client-id-1");
        let bytes = body::collect(res.into_body()).await.unwrap();
        assert_eq!(&bytes[..], b"ping");
    }

    #[tokio::test]
    async fn test_generates_request_id() {
        let svc = GatewayService::new(Arc::new(Echo));
        let req = Request::builder()
            .uri("/echo")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let res = svc.oneshot(req).await.unwrap();
        let id = res.headers()[REQUEST_ID_HEADER].to_str().unwrap();
        assert!(uuid::Uuid::parse_str(id).is_ok());
    }

    #[tokio::test]
    async fn test_abort_is_service_error() {
        let svc = GatewayService::new(Arc::new(Echo));
        let req = Request::builder()
            .uri("/abort")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let err = svc.oneshot(req).await.unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));
    }
}
