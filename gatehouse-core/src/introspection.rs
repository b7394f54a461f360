//! OAuth2 token introspection (RFC 7662) with single-flight caching.
//!
//! # Overview
//!
//! [`Introspector::introspect`] asks the authorization server whether an
//! opaque access token is active. With a positive TTL configured, responses
//! are cached under `ir:<token>` and concurrent lookups of the same token are
//! serialized through a per-token lock, so callers that overlap in time share
//! one remote call.
//!
//! # Lock Table
//!
//! The lock table maps a token to a reference-counted async mutex. The entry
//! is created atomically on first access and removed as soon as its holder
//! is done. A caller arriving after removal creates a new lock, so this
//! collapses overlapping calls only (approximate single-flight).
//!
//! # Cache TTL
//!
//! The stored TTL is the configured TTL, clamped to the token's remaining
//! lifetime. An inactive token that can no longer become active is cached
//! until it expires, regardless of the configured TTL.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use http::header::{ACCEPT, CONTENT_TYPE, HeaderValue};
use http::{Method, Request, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::body;
use crate::cache::CacheStore;
use crate::config::IntrospectionConfig;
use crate::context::RequestContext;
use crate::error::GatewayError;
use crate::oauth2::{ClientAuthenticator, ClientCredentials, FormParams};
use crate::transport::RoundTrip;

/// Round-trip name attached to introspection calls for logging.
pub const ROUND_TRIP_NAME: &str = "introspection";

const CACHE_KEY_PREFIX: &str = "ir:";

/// Response body of an introspection request.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct IntrospectionResult(Map<String, Value>);

impl IntrospectionResult {
    /// Whether the token is active. Absent or non-boolean means inactive.
    pub fn active(&self) -> bool {
        self.0.get("active").and_then(Value::as_bool).unwrap_or(false)
    }

    /// Expiry of the token (Unix seconds), if the server sent one.
    pub fn exp(&self) -> Option<i64> {
        let exp = self.0.get("exp")?;
        exp.as_i64().or_else(|| {
            exp.as_f64()
                .filter(|f| f.fract() == 0.0 && f.is_finite())
                .map(|f| f as i64)
        })
    }

    /// Look up any other claim.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// All claims.
    pub fn claims(&self) -> &Map<String, Value> {
        &self.0
    }
}

/// Token introspector for one access-control block.
pub struct Introspector {
    authenticator: Arc<dyn ClientAuthenticator>,
    config: IntrospectionConfig,
    locks: DashMap<String, Arc<Mutex<()>>>,
    store: Arc<dyn CacheStore>,
    transport: Arc<dyn RoundTrip>,
}

impl std::fmt::Debug for Introspector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Introspector")
            .field("endpoint", &self.config.endpoint)
            .field("ttl_seconds", &self.config.ttl_seconds())
            .field("locks", &self.locks.len())
            .finish()
    }
}

/// Holds the per-token lock; on drop removes the table entry, then releases.
struct TokenLock<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    token: &'a str,
    handle: Arc<Mutex<()>>,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for TokenLock<'_> {
    fn drop(&mut self) {
        // Only remove the entry if it is still ours; a later caller may have
        // installed a fresh lock after an earlier holder removed this one.
        self.locks
            .remove_if(self.token, |_, handle| Arc::ptr_eq(handle, &self.handle));
        // `_guard` is dropped after this body runs, releasing the mutex.
    }
}

impl Introspector {
    /// Create an introspector authenticating with the configured client
    /// credentials.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Configuration` if the endpoint is invalid or
    /// the credentials do not fit the auth method.
    pub fn new(
        config: IntrospectionConfig,
        transport: Arc<dyn RoundTrip>,
        store: Arc<dyn CacheStore>,
    ) -> Result<Self, GatewayError> {
        config
            .validate()
            .map_err(|e| GatewayError::Configuration(e.to_string()))?;
        let authenticator = ClientCredentials::new(
            config.endpoint_auth_method,
            config.client_id.clone(),
            config.client_secret.clone(),
        )?;
        Ok(Self::with_authenticator(
            config,
            Arc::new(authenticator),
            transport,
            store,
        ))
    }

    /// Create an introspector with a custom client authenticator.
    pub fn with_authenticator(
        config: IntrospectionConfig,
        authenticator: Arc<dyn ClientAuthenticator>,
        transport: Arc<dyn RoundTrip>,
        store: Arc<dyn CacheStore>,
    ) -> Self {
        Self {
            authenticator,
            config,
            locks: DashMap::new(),
            store,
            transport,
        }
    }

    /// Number of tokens currently locked.
    pub fn locked_tokens(&self) -> usize {
        self.locks.len()
    }

    /// Retrieve introspection data for `token`, cached or fresh.
    ///
    /// `exp` and `nbf` are the token's own claims when the caller knows them
    /// (e.g. from a JWT); `0` means unknown.
    ///
    /// # Errors
    ///
    /// Returns an introspection-class `GatewayError` when the remote call
    /// fails, answers with a non-200 status, or sends a non-JSON body.
    /// Nothing is cached in that case.
    pub async fn introspect(
        &self,
        ctx: &RequestContext,
        token: &str,
        exp: i64,
        nbf: i64,
    ) -> Result<IntrospectionResult, GatewayError> {
        let ttl_seconds = self.config.ttl_seconds();
        if ttl_seconds <= 0 {
            let (data, _) = self.fetch(ctx, token).await?;
            return Ok(data);
        }

        let _lock = self.lock_token(token).await;

        let key = format!("{}{}", CACHE_KEY_PREFIX, token);
        if let Some(cached) = self.store.get(&key) {
            match serde_json::from_slice::<IntrospectionResult>(&cached) {
                Ok(data) => {
                    debug!(request_id = %ctx.request_id, "Introspection cache hit");
                    return Ok(data);
                }
                Err(e) => {
                    warn!(error = %e, "Discarding undecodable cached introspection response");
                }
            }
        }

        let (data, raw) = self.fetch(ctx, token).await?;

        let now = chrono::Utc::now().timestamp();
        let ttl = cache_ttl(ttl_seconds, &data, exp, nbf, now);
        debug!(
            request_id = %ctx.request_id,
            active = data.active(),
            ttl,
            "Caching introspection response"
        );
        self.store.set(&key, raw, ttl);

        Ok(data)
    }

    /// Acquire the per-token lock, creating it if absent.
    async fn lock_token<'a>(&'a self, token: &'a str) -> TokenLock<'a> {
        // entry() is atomic create-if-absent; the shard lock is released at
        // the end of this statement, before awaiting the mutex.
        let handle = Arc::clone(&*self.locks.entry(token.to_string()).or_default());
        let guard = Arc::clone(&handle).lock_owned().await;
        TokenLock {
            locks: &self.locks,
            token,
            handle,
            _guard: guard,
        }
    }

    /// Perform the remote call. Returns decoded data and raw body bytes.
    async fn fetch(
        &self,
        ctx: &RequestContext,
        token: &str,
    ) -> Result<(IntrospectionResult, Bytes), GatewayError> {
        let mut form = FormParams::new();
        form.add("token", token);

        let mut req = Request::builder()
            .method(Method::POST)
            .uri(&self.config.endpoint)
            .body(())
            .map_err(|e| GatewayError::Configuration(format!("introspection endpoint: {}", e)))?;
        req.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        req.headers_mut()
            .insert(ACCEPT, HeaderValue::from_static("application/json"));

        self.authenticator.authenticate(&mut form, &mut req)?;

        let out_ctx = ctx.child(Some(ROUND_TRIP_NAME.to_string()));
        // Cancel the outbound call on every return path.
        let _cancel_on_return = out_ctx.cancel.clone().drop_guard();

        let mut req = req.map(|()| body::full(form.encode()));
        req.extensions_mut().insert(out_ctx);

        let round_trip = self.transport.round_trip(req);
        let response = match self.config.timeout {
            Some(limit) => tokio::time::timeout(limit, round_trip).await.map_err(|_| {
                GatewayError::IntrospectionTransport(format!(
                    "no response within {}",
                    humantime::format_duration(limit)
                ))
            })?,
            None => round_trip.await,
        }
        .map_err(|e| GatewayError::IntrospectionTransport(e.to_string()))?;

        if response.status() != StatusCode::OK {
            return Err(GatewayError::IntrospectionStatus {
                status: response.status().as_u16(),
            });
        }

        let raw = body::collect(response.into_body())
            .await
            .map_err(|e| GatewayError::IntrospectionRead(e.to_string()))?;

        let data = serde_json::from_slice::<IntrospectionResult>(&raw)
            .map_err(|e| GatewayError::IntrospectionDecode(e.to_string()))?;

        Ok((data, raw))
    }
}

/// Compute how long an introspection response may be cached.
///
/// `exp` is the caller-supplied expiry (0 = unknown), falling back to the
/// response's own `exp`.
pub(crate) fn cache_ttl(
    configured_ttl: i64,
    data: &IntrospectionResult,
    exp: i64,
    nbf: i64,
    now: i64,
) -> i64 {
    let exp = if exp != 0 {
        exp
    } else {
        data.exp().filter(|e| *e > 0).unwrap_or(0)
    };

    let mut ttl = configured_ttl;
    if exp > 0 {
        let max_ttl = exp - now;
        if !data.active() && (nbf <= 0 || now > nbf) {
            // nbf unknown or in the past: the token cannot become active
            // again, keep the answer until it expires anyway
            ttl = max_ttl;
        } else if ttl > max_ttl {
            ttl = max_ttl;
        }
    }
    ttl
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(value: Value) -> IntrospectionResult {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_result_accessors() {
        let r = result(json!({"active": true, "exp": 1700000000, "sub": "alice"}));
        assert!(r.active());
        assert_eq!(r.exp(), Some(1_700_000_000));
        assert_eq!(r.get("sub"), Some(&json!("alice")));

        let r = result(json!({"active": "yes", "exp": 1.7e9}));
        assert!(!r.active());
        assert_eq!(r.exp(), Some(1_700_000_000));

        assert_eq!(result(json!({})).exp(), None);
    }

    #[test]
    fn test_ttl_clamped_to_remaining_lifetime() {
        let now = 1_000;
        let active = result(json!({"active": true}));
        assert_eq!(cache_ttl(60, &active, now + 30, 0, now), 30);
        assert_eq!(cache_ttl(60, &active, now + 300, 0, now), 60);
    }

    #[test]
    fn test_ttl_uses_response_exp_when_caller_has_none() {
        let now = 1_000;
        let active = result(json!({"active": true, "exp": now + 20}));
        assert_eq!(cache_ttl(60, &active, 0, 0, now), 20);
    }

    #[test]
    fn test_ttl_caller_exp_wins_over_response() {
        let now = 1_000;
        let active = result(json!({"active": true, "exp": now + 20}));
        assert_eq!(cache_ttl(60, &active, now + 40, 0, now), 40);
    }

    #[test]
    fn test_inactive_token_cached_until_expiry() {
        let now = 1_000;
        let inactive = result(json!({"active": false}));
        assert_eq!(cache_ttl(10, &inactive, now + 1000, 0, now), 1000);
        // nbf in the past: same
        assert_eq!(cache_ttl(10, &inactive, now + 1000, now - 5, now), 1000);
    }

    #[test]
    fn test_inactive_token_not_yet_valid_uses_configured_ttl() {
        let now = 1_000;
        let inactive = result(json!({"active": false}));
        // may still become active once nbf passes
        assert_eq!(cache_ttl(10, &inactive, now + 1000, now + 100, now), 10);
    }

    #[test]
    fn test_unknown_exp_keeps_configured_ttl() {
        let inactive = result(json!({"active": false}));
        assert_eq!(cache_ttl(10, &inactive, 0, 0, 1_000), 10);
    }

    #[test]
    fn test_expired_token_yields_non_positive_ttl() {
        let now = 1_000;
        let active = result(json!({"active": true}));
        assert!(cache_ttl(60, &active, now - 1, 0, now) <= 0);
    }
}
