//! Configured responses: redirects and static responses.

use std::collections::BTreeMap;

use gatehouse_core::body::{self, GatewayBody};
use gatehouse_core::error::GatewayError;
use http::header::LOCATION;
use http::{Response, StatusCode};
use serde::Deserialize;

use crate::eval::{EvalContext, RequestSnapshot, header_name, header_value, references_body};

/// Status of a redirect without an explicit one.
pub const DEFAULT_REDIRECT_STATUS: StatusCode = StatusCode::MOVED_PERMANENTLY;

/// A `redirect` block.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Redirect {
    /// Location, may contain expressions.
    pub url: String,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Redirect {
    /// Build the redirect response.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Evaluation` for bad expressions or headers and
    /// `GatewayError::Configuration` for an invalid status.
    pub fn to_response(
        &self,
        eval: &EvalContext,
        request: &RequestSnapshot,
    ) -> Result<Response<GatewayBody>, GatewayError> {
        let status = match self.status {
            Some(code) if code > 0 => status_code(code)?,
            _ => DEFAULT_REDIRECT_STATUS,
        };
        let mut res = Response::new(body::empty());
        *res.status_mut() = status;
        let location = eval.render_request(&self.url, request)?;
        res.headers_mut()
            .insert(LOCATION, header_value("location", &location)?);
        render_headers(&self.headers, eval, request, &mut res)?;
        Ok(res)
    }

    pub fn must_buffer(&self) -> bool {
        references_body(&self.url) || self.headers.values().any(|v| references_body(v))
    }
}

/// A static `response` block.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticResponse {
    /// Defaults to 200.
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Body template.
    #[serde(default)]
    pub body: Option<String>,
}

impl StaticResponse {
    /// Build the response.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Evaluation` for bad expressions or headers and
    /// `GatewayError::Configuration` for an invalid status.
    pub fn to_response(
        &self,
        eval: &EvalContext,
        request: &RequestSnapshot,
    ) -> Result<Response<GatewayBody>, GatewayError> {
        let status = match self.status {
            Some(code) => status_code(code)?,
            None => StatusCode::OK,
        };
        let content = match &self.body {
            Some(template) => body::full(eval.render_request(template, request)?),
            None => body::empty(),
        };
        let mut res = Response::new(content);
        *res.status_mut() = status;
        render_headers(&self.headers, eval, request, &mut res)?;
        Ok(res)
    }

    pub fn must_buffer(&self) -> bool {
        self.body.as_deref().is_some_and(references_body)
            || self.headers.values().any(|v| references_body(v))
    }
}

fn status_code(code: u16) -> Result<StatusCode, GatewayError> {
    StatusCode::from_u16(code)
        .map_err(|e| GatewayError::Configuration(format!("invalid status {}: {}", code, e)))
}

fn render_headers(
    headers: &BTreeMap<String, String>,
    eval: &EvalContext,
    request: &RequestSnapshot,
    res: &mut Response<GatewayBody>,
) -> Result<(), GatewayError> {
    for (name, template) in headers {
        let value = header_value(name, &eval.render_request(template, request)?)?;
        res.headers_mut().insert(header_name(name)?, value);
    }
    Ok(())
}
