//! Gatehouse Proxy: the request pipeline of the gateway.
//!
//! Every configured route is served by an [`Endpoint`]: it buffers the
//! client body when expressions need it, runs its proxy and request
//! producers concurrently, selects exactly one response and applies the
//! route's response policy before writing it.
//!
//! - [`proxy`] rewrites the outbound request and forwards it to a backend.
//! - [`request`] sends templated side requests.
//! - [`tunnel`] relays connections after a protocol upgrade.
//! - [`error_handler`] renders terminal error responses.
//! - [`service`] adapts any [`Handler`] to a tower `Service`.

pub mod allowed_methods;
pub mod config;
pub mod endpoint;
pub mod error_handler;
pub mod eval;
pub mod handler;
pub mod logging_layer;
pub mod producer;
pub mod proxy;
pub mod request;
pub mod response;
pub mod service;
pub mod tunnel;

pub use config::EndpointConfig;
pub use endpoint::{Endpoint, EndpointOptions};
pub use eval::EvalContext;
pub use handler::Handler;
pub use logging_layer::gateway_trace_layer;
pub use service::GatewayService;
