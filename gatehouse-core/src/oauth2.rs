//! OAuth2 client authentication for calls to authorization-server endpoints.
//!
//! The authenticator adds client credentials to an outbound form request
//! according to the configured endpoint auth method.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::header::{AUTHORIZATION, HeaderValue};
use http::Request;
use serde::Deserialize;
use url::form_urlencoded;

use crate::error::GatewayError;

/// Ordered form parameters of an `application/x-www-form-urlencoded` body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormParams(Vec<(String, String)>);

impl FormParams {
    /// Creates an empty parameter list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parameter.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    /// First value of `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Form-encode all parameters in insertion order.
    pub fn encode(&self) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (k, v) in &self.0 {
            serializer.append_pair(k, v);
        }
        serializer.finish()
    }
}

/// How the client authenticates at the endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointAuthMethod {
    /// Credentials in an HTTP Basic `Authorization` header.
    #[default]
    ClientSecretBasic,
    /// Credentials as `client_id` / `client_secret` form parameters.
    ClientSecretPost,
    /// Public client: only `client_id` is sent.
    None,
}

/// Turns configured credentials into an authenticated outbound request.
pub trait ClientAuthenticator: Send + Sync {
    /// Add credentials to the form and/or the request headers.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Configuration` if the credentials cannot be
    /// expressed for this request.
    fn authenticate(&self, form: &mut FormParams, req: &mut Request<()>)
    -> Result<(), GatewayError>;
}

/// Client id/secret authenticator.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    method: EndpointAuthMethod,
    client_id: String,
    client_secret: String,
}

impl ClientCredentials {
    /// Create an authenticator, validating the credentials against the method.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Configuration` if `client_id` is empty, or if
    /// `client_secret` is empty for a method that sends it.
    pub fn new(
        method: EndpointAuthMethod,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, GatewayError> {
        let client_id = client_id.into();
        let client_secret = client_secret.into();

        if client_id.is_empty() {
            return Err(GatewayError::Configuration(
                "client_id must not be empty".to_string(),
            ));
        }
        if method != EndpointAuthMethod::None && client_secret.is_empty() {
            return Err(GatewayError::Configuration(format!(
                "client_secret required for endpoint_auth_method {:?}",
                method
            )));
        }

        Ok(Self {
            method,
            client_id,
            client_secret,
        })
    }

    /// The configured auth method.
    pub fn method(&self) -> EndpointAuthMethod {
        self.method
    }
}

impl ClientAuthenticator for ClientCredentials {
    fn authenticate(
        &self,
        form: &mut FormParams,
        req: &mut Request<()>,
    ) -> Result<(), GatewayError> {
        match self.method {
            EndpointAuthMethod::ClientSecretBasic => {
                // RFC 6749 §2.3.1: both parts are form-urlencoded before joining
                let id: String = form_urlencoded::byte_serialize(self.client_id.as_bytes()).collect();
                let secret: String =
                    form_urlencoded::byte_serialize(self.client_secret.as_bytes()).collect();
                let credentials = STANDARD.encode(format!("{}:{}", id, secret));
                let value = HeaderValue::from_str(&format!("Basic {}", credentials))
                    .map_err(|e| GatewayError::Configuration(format!("invalid credentials: {}", e)))?;
                req.headers_mut().insert(AUTHORIZATION, value);
            }
            EndpointAuthMethod::ClientSecretPost => {
                form.add("client_id", &self.client_id);
                form.add("client_secret", &self.client_secret);
            }
            EndpointAuthMethod::None => {
                form.add("client_id", &self.client_id);
            }
        }
        Ok(())
    }
}
