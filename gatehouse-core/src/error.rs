//! Error types for the Gatehouse request core.
//!
//! Every failure the core can produce is a [`GatewayError`]. Each variant maps
//! to a client-facing status code and to a list of error kinds, which the
//! error handler uses to pick a custom handler (most specific kind first).

use http::StatusCode;
use thiserror::Error;

/// Catch-all error kind matched by wildcard error handlers.
pub const WILDCARD_KIND: &str = "*";

/// All error types that can occur while serving a request.
#[derive(Debug, Error)]
pub enum GatewayError {
    // ─────────────────────────────────────────────────────────────────────────
    // Configuration errors (fatal to the request, never retried)
    // ─────────────────────────────────────────────────────────────────────────
    /// The route configuration cannot serve this request.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A policy expression could not be evaluated.
    #[error("evaluation error: {0}")]
    Evaluation(String),

    // ─────────────────────────────────────────────────────────────────────────
    // Transport errors (maps to 502 / 504)
    // ─────────────────────────────────────────────────────────────────────────
    /// Invalid outbound URI built from the route's url templates.
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// Connection error to the backend.
    #[error("backend connection error: {0}")]
    BackendConnection(String),

    /// Connection refused by the backend.
    #[error("backend refused connection: {0}")]
    BackendRefused(String),

    /// The backend did not answer in time.
    #[error("backend timeout: {0}")]
    BackendTimeout(String),

    /// The client went away while the request was in flight.
    #[error("client disconnected")]
    ClientDisconnect,

    // ─────────────────────────────────────────────────────────────────────────
    // Token introspection errors
    // ─────────────────────────────────────────────────────────────────────────
    /// The introspection endpoint could not be reached.
    #[error("introspection response: {0}")]
    IntrospectionTransport(String),

    /// The introspection endpoint answered with a non-200 status.
    #[error("introspection response status code {status}")]
    IntrospectionStatus {
        /// Status code returned by the authorization server
        status: u16,
    },

    /// The introspection response body could not be read.
    #[error("introspection response cannot be read: {0}")]
    IntrospectionRead(String),

    /// The introspection response body is not a JSON object.
    #[error("introspection response is not JSON: {0}")]
    IntrospectionDecode(String),

    // ─────────────────────────────────────────────────────────────────────────
    // Client request validation errors
    // ─────────────────────────────────────────────────────────────────────────
    /// The buffered request body is larger than the configured limit.
    #[error("request body size exceeded: limit is {limit} bytes")]
    BodySizeExceeded {
        /// Configured limit in bytes
        limit: u64,
    },

    /// The request body stream failed while reading.
    #[error("request body cannot be read: {0}")]
    BodyRead(String),

    /// The request method is not in the route's allow list.
    #[error("method {method} not allowed")]
    MethodNotAllowed {
        /// The rejected method
        method: String,
    },

    /// Implementation defect, should not happen.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Client-facing status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Configuration(_) | Self::Evaluation(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::ClientDisconnect | Self::BodyRead(_) => StatusCode::BAD_REQUEST,
            Self::InvalidUri(_)
            | Self::BackendConnection(_)
            | Self::BackendRefused(_)
            | Self::IntrospectionTransport(_)
            | Self::IntrospectionStatus { .. }
            | Self::IntrospectionRead(_)
            | Self::IntrospectionDecode(_) => StatusCode::BAD_GATEWAY,
            Self::BackendTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::BodySizeExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
        }
    }

    /// Returns the error type name for logging.
    pub fn error_type_name(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Evaluation(_) => "evaluation",
            Self::InvalidUri(_) => "invalid_uri",
            Self::BackendConnection(_) => "backend_connection",
            Self::BackendRefused(_) => "backend_refused",
            Self::BackendTimeout(_) => "backend_timeout",
            Self::ClientDisconnect => "client_disconnect",
            Self::IntrospectionTransport(_) => "introspection_transport",
            Self::IntrospectionStatus { .. } => "introspection_status",
            Self::IntrospectionRead(_) => "introspection_read",
            Self::IntrospectionDecode(_) => "introspection_decode",
            Self::BodySizeExceeded { .. } => "request_body_size_exceeded",
            Self::BodyRead(_) => "request_body_read",
            Self::MethodNotAllowed { .. } => "method_not_allowed",
            Self::Internal(_) => "internal",
        }
    }

    /// Error kinds in dispatch order, most specific first.
    ///
    /// Error handlers are looked up by these names; the wildcard kind is not
    /// part of the list and is tried by the handler after all kinds miss.
    pub fn kinds(&self) -> Vec<&'static str> {
        match self {
            Self::BackendConnection(_) | Self::BackendRefused(_) | Self::InvalidUri(_) => {
                vec![self.error_type_name(), "backend"]
            }
            Self::BackendTimeout(_) => vec!["backend_timeout", "backend"],
            Self::IntrospectionTransport(_)
            | Self::IntrospectionStatus { .. }
            | Self::IntrospectionRead(_)
            | Self::IntrospectionDecode(_) => {
                vec![self.error_type_name(), "introspection", "access_control"]
            }
            Self::BodySizeExceeded { .. } | Self::BodyRead(_) | Self::ClientDisconnect => {
                vec![self.error_type_name(), "request"]
            }
            Self::MethodNotAllowed { .. } => vec!["method_not_allowed", "endpoint"],
            Self::Configuration(_) | Self::Evaluation(_) => {
                vec![self.error_type_name(), "endpoint"]
            }
            Self::Internal(_) => vec!["internal"],
        }
    }

    /// Message safe to render to clients (no upstream internals).
    pub fn client_message(&self) -> &'static str {
        match self.status_code() {
            StatusCode::BAD_GATEWAY => "backend error",
            StatusCode::GATEWAY_TIMEOUT => "backend timeout",
            StatusCode::PAYLOAD_TOO_LARGE => "request body too large",
            StatusCode::METHOD_NOT_ALLOWED => "method not allowed",
            StatusCode::BAD_REQUEST => "bad request",
            _ => "internal server error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::BodySizeExceeded { limit: 10 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            GatewayError::BackendTimeout("slow".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::IntrospectionStatus { status: 401 }.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::Configuration("two results".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        // route url templates are gateway faults, not client ones
        let invalid = GatewayError::InvalidUri("missing host".into());
        assert_eq!(invalid.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(invalid.kinds(), vec!["invalid_uri", "backend"]);
    }

    #[test]
    fn test_kinds_most_specific_first() {
        let kinds = GatewayError::BackendTimeout("x".into()).kinds();
        assert_eq!(kinds, vec!["backend_timeout", "backend"]);

        let kinds = GatewayError::IntrospectionDecode("x".into()).kinds();
        assert_eq!(kinds[0], "introspection_decode");
        assert!(kinds.contains(&"access_control"));
        assert!(!kinds.contains(&WILDCARD_KIND));
    }

    #[test]
    fn test_introspection_messages_are_distinct() {
        let status = GatewayError::IntrospectionStatus { status: 500 };
        let decode = GatewayError::IntrospectionDecode("expected value".into());
        assert_eq!(
            status.to_string(),
            "introspection response status code 500"
        );
        assert!(decode.to_string().starts_with("introspection response is not JSON"));
        assert_ne!(status.error_type_name(), decode.error_type_name());
    }
}
