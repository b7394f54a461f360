//! Unified body type for client, upstream and synthesized messages.

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;

use crate::error::GatewayError;

/// Boxed body shared by every request and response that crosses the core.
///
/// Buffered bodies use `Full<Bytes>`, streamed ones wrap hyper's `Incoming`.
/// Both are boxed so producers can return either.
pub type GatewayBody = http_body_util::combinators::BoxBody<Bytes, GatewayError>;

/// Wrap already-buffered bytes.
pub fn full(bytes: impl Into<Bytes>) -> GatewayBody {
    // Full<Bytes> has Infallible error - convert using absurd pattern
    Full::new(bytes.into()).map_err(|e| match e {}).boxed()
}

/// Body without content.
pub fn empty() -> GatewayBody {
    Empty::<Bytes>::new().map_err(|e| match e {}).boxed()
}

/// Convert a hyper body stream, classifying stream failures as read errors.
pub fn from_incoming(body: Incoming) -> GatewayBody {
    body.map_err(|e| GatewayError::BodyRead(e.to_string()))
        .boxed()
}

/// Collect a body into memory.
///
/// # Errors
///
/// Returns the body's own stream error.
pub async fn collect(body: GatewayBody) -> Result<Bytes, GatewayError> {
    Ok(body.collect().await?.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_collects_to_same_bytes() {
        let bytes = collect(full("hello")).await.unwrap();
        assert_eq!(bytes, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_empty_collects_to_nothing() {
        let bytes = collect(empty()).await.unwrap();
        assert!(bytes.is_empty());
    }
}
