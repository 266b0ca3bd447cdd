use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::backoff::{BackoffPolicy, DEFAULT_MAX_BACKOFF_UNITS};
use crate::{RestTransportError, Result};

pub const ENV_BACKOFF_UNIT_MS: &str = "REST_TRANSPORT_BACKOFF_UNIT_MS";
pub const ENV_MAX_BACKOFF_UNITS: &str = "REST_TRANSPORT_MAX_BACKOFF_UNITS";
pub const ENV_MAX_CONNECTIONS_PER_HOST: &str = "REST_TRANSPORT_MAX_CONNECTIONS_PER_HOST";
pub const ENV_CRL_PATHS: &str = "REST_TRANSPORT_CRL_PATHS";
pub const ENV_REQUIRE_CRL: &str = "REST_TRANSPORT_REQUIRE_CRL";

/// Configures the shared transport and its retry pacing.
///
/// Missing fields in a deserialized document fall back to [`Default`].
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    /// Length of one backoff unit in milliseconds.
    pub backoff_unit_ms: u64,
    /// Cap on the retry wait, in backoff units.
    pub max_backoff_units: u32,
    /// Pooled connections kept per host.
    pub max_connections_per_host: usize,
    /// PEM certificate revocation lists enforced during TLS handshakes.
    pub crl_paths: Vec<PathBuf>,
    /// Refuse to build a transport that cannot check revocation.
    pub require_crl: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            backoff_unit_ms: 1_000,
            max_backoff_units: DEFAULT_MAX_BACKOFF_UNITS,
            max_connections_per_host: 20,
            crl_paths: Vec::new(),
            require_crl: false,
        }
    }
}

impl TransportOptions {
    /// Builds options from `REST_TRANSPORT_*` environment variables.
    ///
    /// Reads:
    /// - `REST_TRANSPORT_BACKOFF_UNIT_MS`
    /// - `REST_TRANSPORT_MAX_BACKOFF_UNITS`
    /// - `REST_TRANSPORT_MAX_CONNECTIONS_PER_HOST`
    /// - `REST_TRANSPORT_CRL_PATHS` (platform path-list separator)
    /// - `REST_TRANSPORT_REQUIRE_CRL` (`true` / `false`)
    ///
    /// Unset or blank variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let mut options = Self::default();

        if let Some(value) = var(ENV_BACKOFF_UNIT_MS) {
            options.backoff_unit_ms = parse_number(ENV_BACKOFF_UNIT_MS, &value)?;
        }
        if let Some(value) = var(ENV_MAX_BACKOFF_UNITS) {
            options.max_backoff_units = parse_number(ENV_MAX_BACKOFF_UNITS, &value)?;
        }
        if let Some(value) = var(ENV_MAX_CONNECTIONS_PER_HOST) {
            options.max_connections_per_host = parse_number(ENV_MAX_CONNECTIONS_PER_HOST, &value)?;
        }
        if let Some(value) = var(ENV_CRL_PATHS) {
            options.crl_paths = std::env::split_paths(value.trim()).collect();
        }
        if let Some(value) = var(ENV_REQUIRE_CRL) {
            options.require_crl = value.trim().parse().map_err(|_| {
                RestTransportError::Config(format!("{ENV_REQUIRE_CRL} must be true or false, got '{value}'"))
            })?;
        }

        Ok(options)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff_unit_ms),
            self.max_backoff_units,
        )
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RestTransportError::Config(format!("{name} must be a non-negative integer, got '{value}'")))
}
