//! OpenDAL Operator factory for the archive's S3-compatible inbox

use std::time::Duration;

use anyhow::{Context, Result};
use opendal::Operator;
use secrecy::{ExposeSecret, SecretString};

/// Resolved credentials for one session. Passed in explicitly, never global.
#[derive(Clone)]
pub struct Credentials {
    /// Access key; doubles as the account identifier (bucket and key prefix)
    pub access_key: String,
    /// Secret key, or the access token when the archive authenticates by token
    pub secret: SecretString,
    /// Optional session token sent alongside the secret
    pub session_token: Option<SecretString>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret", &"[REDACTED]")
            .field("session_token", &self.session_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Minimal config needed to build an operator
/// (full config lives in sdt-core's StorageConfig)
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub credentials: Credentials,
    /// Per network call timeout
    pub timeout: Duration,
}

/// Build an OpenDAL Operator for the archive's S3 endpoint.
///
/// Uses path-style addressing (default in opendal 0.55), which the archive
/// requires: the bucket is the account identifier, not a DNS label.
///
/// No RetryLayer here: retries are decided per part by the transfer
/// worker's backoff policy, so each call fails fast after `timeout`.
pub fn build_operator(cfg: &StorageConfig) -> Result<Operator> {
    // opendal 0.55: S3 builder uses consuming pattern (methods take `self`, return `Self`)
    let mut builder = opendal::services::S3::default()
        .endpoint(&cfg.endpoint)
        .region(&cfg.region)
        .bucket(&cfg.bucket)
        .access_key_id(&cfg.credentials.access_key)
        .secret_access_key(cfg.credentials.secret.expose_secret());
    if let Some(token) = &cfg.credentials.session_token {
        builder = builder.session_token(token.expose_secret());
    }

    let op = Operator::new(builder)
        .context("creating OpenDAL S3 operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::TimeoutLayer::default()
                .with_timeout(cfg.timeout)
                .with_io_timeout(cfg.timeout),
        )
        .finish();

    Ok(op)
}

/// Build an operator from sdt-core config + resolved credentials.
///
/// If `enforce_tls` is true and the endpoint uses HTTP, this returns an error.
/// Otherwise, a warning is logged for non-HTTPS endpoints.
pub fn build_from_core_config(
    storage: &sdt_core::config::StorageConfig,
    credentials: &Credentials,
) -> Result<Operator> {
    let endpoint = storage.endpoint_url();
    if endpoint.starts_with("http://") {
        if storage.enforce_tls {
            anyhow::bail!(
                "S3 endpoint uses plaintext HTTP ({endpoint}), but enforce_tls is enabled. \
                 Use an HTTPS endpoint or set storage.enforce_tls = false for local testing."
            );
        }
        tracing::warn!(
            endpoint = %endpoint,
            "S3 endpoint uses plaintext HTTP: credentials are transmitted unencrypted"
        );
    }

    build_operator(&StorageConfig {
        endpoint,
        region: storage.region.clone(),
        bucket: storage.bucket_for(&credentials.access_key),
        credentials: credentials.clone(),
        timeout: Duration::from_secs(storage.socket_timeout_secs.max(1)),
    })
}

/// Object key inside the account's bucket: always prefixed by the account id.
pub fn object_key(account: &str, path: &str) -> String {
    let path = path.trim_start_matches('/');
    let prefix = format!("{account}/");
    if path.starts_with(&prefix) {
        path.to_string()
    } else {
        format!("{prefix}{path}")
    }
}
