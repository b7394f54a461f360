//! Gatehouse Core: access control and upstream plumbing for the gateway.
//!
//! This library provides the pieces shared by every configured route:
//! the error taxonomy, the request-scoped context, the TTL cache store,
//! OAuth2 client authentication, the upstream round-trip transport and the
//! single-flight access-token introspector. The HTTP request pipeline
//! (policy evaluation, producers, endpoint orchestration) lives in
//! `gatehouse-proxy`.

pub mod body;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod introspection;
pub mod oauth2;
pub mod transport;

pub use body::GatewayBody;
pub use context::RequestContext;
pub use error::GatewayError;
