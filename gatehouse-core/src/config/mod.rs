//! Configuration contracts consumed by the core.
//!
//! The full gateway configuration grammar lives outside this crate. What is
//! defined here are the typed settings the core needs (introspection blocks,
//! request body limits) plus a small YAML loader used by embedders and tests.

pub mod duration_format;
pub mod error;

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::oauth2::EndpointAuthMethod;
pub use error::ConfigError;

/// Default request body limit when a route does not configure one.
pub const DEFAULT_REQUEST_BODY_LIMIT: &str = "64MiB";

/// Settings of one token-introspection access-control block.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntrospectionConfig {
    /// Introspection endpoint of the authorization server.
    pub endpoint: String,

    /// How long introspection responses may be cached. Zero disables caching.
    #[serde(default, deserialize_with = "duration_format::deserialize_option")]
    pub ttl: Option<Duration>,

    /// How the gateway authenticates at the endpoint.
    #[serde(default)]
    pub endpoint_auth_method: EndpointAuthMethod,

    /// OAuth2 client id.
    pub client_id: String,

    /// OAuth2 client secret (not needed for `none`).
    #[serde(default)]
    pub client_secret: String,

    /// Upper bound on the remote call, independent of the request deadline.
    #[serde(default, deserialize_with = "duration_format::deserialize_option")]
    pub timeout: Option<Duration>,
}

impl IntrospectionConfig {
    /// Cache TTL in whole seconds; `0` means caching is disabled.
    pub fn ttl_seconds(&self) -> i64 {
        self.ttl
            .map(|ttl| i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }

    /// Validate values that serde cannot check.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidUrl` if the endpoint is not an absolute
    /// http(s) URL.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.endpoint).map_err(|e| ConfigError::InvalidUrl {
            url: self.endpoint.clone(),
            message: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUrl {
                url: self.endpoint.clone(),
                message: "scheme must be http or https".to_string(),
            });
        }
        Ok(())
    }
}

/// Parse a human-readable byte size such as `64MiB`, `10kB` or `512`.
///
/// Binary units (`KiB`, `MiB`, `GiB`, `TiB`) are powers of 1024, decimal
/// units (`kB`, `MB`, `GB`, `TB`, with or without `B`) are powers of 1000.
///
/// # Errors
///
/// Returns `ConfigError::InvalidSize` for empty, negative or unknown values.
pub fn parse_byte_size(value: &str) -> Result<u64, ConfigError> {
    let invalid = |message: &str| ConfigError::InvalidSize {
        value: value.to_string(),
        message: message.to_string(),
    };

    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    if number.is_empty() {
        return Err(invalid("missing number"));
    }
    let number: f64 = number.parse().map_err(|_| invalid("not a number"))?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1_000,
        "m" | "mb" => 1_000_000,
        "g" | "gb" => 1_000_000_000,
        "t" | "tb" => 1_000_000_000_000,
        "ki" | "kib" => 1 << 10,
        "mi" | "mib" => 1 << 20,
        "gi" | "gib" => 1 << 30,
        "ti" | "tib" => 1 << 40,
        _ => return Err(invalid("unknown unit")),
    };

    let bytes = (number * multiplier as f64).floor();
    if !bytes.is_finite() || bytes > u64::MAX as f64 {
        return Err(invalid("out of range"));
    }
    Ok(bytes as u64)
}

/// Parse a route's body limit, falling back to [`DEFAULT_REQUEST_BODY_LIMIT`].
///
/// # Errors
///
/// Returns `ConfigError::InvalidSize` for unparsable values.
pub fn parse_body_limit(limit: Option<&str>) -> Result<u64, ConfigError> {
    match limit {
        Some(l) if !l.trim().is_empty() => parse_byte_size(l),
        _ => parse_byte_size(DEFAULT_REQUEST_BODY_LIMIT),
    }
}

/// Load a YAML document from `path` into `T`.
///
/// # Errors
///
/// Returns `ConfigError::IoError` if the file cannot be read,
/// `ConfigError::EmptyConfigFile` if it is blank, and
/// `ConfigError::ParseError` if it does not match `T`.
pub fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::IoError {
        path: path.to_path_buf(),
        source,
    })?;

    if contents.trim().is_empty() {
        return Err(ConfigError::EmptyConfigFile);
    }

    Ok(serde_saphyr::from_str(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_byte_size_units() {
        assert_eq!(parse_byte_size("512").unwrap(), 512);
        assert_eq!(parse_byte_size("10kB").unwrap(), 10_000);
        assert_eq!(parse_byte_size("10KiB").unwrap(), 10_240);
        assert_eq!(parse_byte_size("64MiB").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_byte_size("1.5 MB").unwrap(), 1_500_000);
    }

    #[test]
    fn test_parse_byte_size_invalid() {
        assert!(parse_byte_size("").is_err());
        assert!(parse_byte_size("MiB").is_err());
        assert!(parse_byte_size("-5").is_err());
        assert!(parse_byte_size("12 parsecs").is_err());
    }

    #[test]
    fn test_body_limit_default() {
        assert_eq!(parse_body_limit(None).unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_body_limit(Some("  ")).unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_body_limit(Some("1KiB")).unwrap(), 1024);
    }

    #[test]
    fn test_load_introspection_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "endpoint: https://as.example.com/introspect\n\
             ttl: 10s\n\
             endpoint_auth_method: client_secret_post\n\
             client_id: gateway\n\
             client_secret: s3cret"
        )
        .unwrap();

        let conf: IntrospectionConfig = load_yaml(file.path()).unwrap();
        conf.validate().unwrap();
        assert_eq!(conf.ttl_seconds(), 10);
        assert_eq!(conf.endpoint_auth_method, EndpointAuthMethod::ClientSecretPost);
        assert!(conf.timeout.is_none());
    }

    #[test]
    fn test_missing_ttl_disables_cache() {
        let conf: IntrospectionConfig =
            serde_saphyr::from_str("endpoint: http://as/introspect\nclient_id: a\nclient_secret: b")
                .unwrap();
        assert_eq!(conf.ttl_seconds(), 0);
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let conf: IntrospectionConfig =
            serde_saphyr::from_str("endpoint: ftp://as/introspect\nclient_id: a\nclient_secret: b")
                .unwrap();
        assert!(matches!(conf.validate(), Err(ConfigError::InvalidUrl { .. })));
    }

    #[test]
    fn test_empty_file_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let result: Result<IntrospectionConfig, _> = load_yaml(file.path());
        assert!(matches!(result, Err(ConfigError::EmptyConfigFile)));
    }
}
