//! Request handler seam shared by endpoints, error handlers and middleware.

use async_trait::async_trait;
use gatehouse_core::body::GatewayBody;
use gatehouse_core::error::GatewayError;
use http::{Request, Response};

use crate::eval::PolicyBody;

/// Serves one client request.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Produce the client response.
    ///
    /// # Errors
    ///
    /// An error means the request is aborted without a response; the
    /// connection should be dropped.
    async fn serve(&self, req: Request<GatewayBody>) -> Result<Response<GatewayBody>, GatewayError>;

    /// Policy body of the handler, if it has one.
    fn body_context(&self) -> Option<&PolicyBody> {
        None
    }
}
