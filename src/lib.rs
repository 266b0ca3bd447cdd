//! `rest-transport` is the resilient outbound transport for a REST query client.
//!
//! Every request goes through a retry loop that hides transient failures:
//! - [`RetryingTransport::send`] retries timeouts, transport errors and
//!   non-success statuses until the caller's token is cancelled
//! - [`UriUpdater`] rewrites `retryCount` / `request_guid` between attempts
//! - [`get_transport`] hands out one shared, lazily built client with TLS 1.2+,
//!   revocation lists, gzip/deflate and a cookie jar
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use rest_transport::get_transport;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> rest_transport::Result<()> {
//! let shared = get_transport()?;
//! let request = shared
//!     .client()
//!     .post("https://acct.example.com/queries/v1/query-request?request_guid=0")
//!     .timeout(Duration::from_secs(30))
//!     .body("{}")
//!     .build()
//!     .expect("valid request");
//!
//! let deadline = CancellationToken::new();
//! let response = shared.send(request, &deadline).await?;
//! # let _ = response;
//! # Ok(())
//! # }
//! ```

mod backoff;
mod error;
mod options;
mod retry;
mod send;
mod shared;
mod uri;

pub mod rest;

pub use backoff::{BackoffPolicy, DEFAULT_BACKOFF_UNIT, DEFAULT_MAX_BACKOFF_UNITS};
pub use error::RestTransportError;
pub use options::TransportOptions;
pub use retry::RetryingTransport;
pub use send::{SendError, SendRequest};
pub use shared::{clear_cookies, get_transport, global, SharedTransport, SharedTransportFactory};
pub use uri::{Rule, UriUpdater};

pub type Result<T> = std::result::Result<T, RestTransportError>;
