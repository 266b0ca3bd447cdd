use std::path::PathBuf;

use reqwest::StatusCode;

use crate::send::SendError;

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum RestTransportError {
    /// The caller's cancellation token fired before a successful response.
    #[error("request cancelled by caller")]
    Cancelled,
    /// The request body is a stream and cannot be re-sent on retry.
    #[error("request body cannot be replayed across retries")]
    BodyNotReplayable,
    /// The underlying HTTP client could not be constructed.
    #[error("failed to build http client: {0}")]
    Build(reqwest::Error),
    /// Invalid option or environment value.
    #[error("invalid transport configuration: {0}")]
    Config(String),
    /// A certificate revocation list could not be loaded.
    #[error("failed to load revocation list {}: {source}", .path.display())]
    Crl {
        /// Location of the offending PEM file.
        path: PathBuf,
        /// Read or parse failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Why a single attempt did not produce a usable response.
///
/// Only [`AttemptFailure::CallerCancelled`] ends the retry loop.
#[derive(Debug)]
pub(crate) enum AttemptFailure {
    CallerCancelled,
    TimedOut,
    Transport(SendError),
    Status(StatusCode),
    NoResponse,
}
