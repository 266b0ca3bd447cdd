//! The process-wide transport and its cookie store.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwapOption;
use reqwest::tls::{CertificateRevocationList, Version};
use reqwest::{Client, Request, Response, Url};
use reqwest_cookie_store::CookieStoreMutex;
use tokio_util::sync::CancellationToken;

use crate::{RestTransportError, Result, RetryingTransport, TransportOptions};

static GLOBAL: SharedTransportFactory = SharedTransportFactory::new();

/// Returns the process-wide transport, building it on first use from
/// [`TransportOptions::from_env`].
pub fn get_transport() -> Result<Arc<SharedTransport>> {
    GLOBAL.get_transport()
}

/// Expires every cookie the shared store holds for `url`.
///
/// Does nothing when the shared transport has not been built yet.
pub fn clear_cookies(url: &Url) {
    GLOBAL.clear_cookies(url);
}

/// The process-wide factory behind [`get_transport`].
pub fn global() -> &'static SharedTransportFactory {
    &GLOBAL
}

/// A configured HTTP client wrapped in the retry loop, plus its cookie store.
pub struct SharedTransport {
    transport: RetryingTransport<Client>,
    cookies: Arc<CookieStoreMutex>,
    revocation_lists: usize,
}

impl fmt::Debug for SharedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedTransport")
            .field("backoff", self.transport.backoff())
            .field("revocation_lists", &self.revocation_lists)
            .field("cookies", &"<store>")
            .finish()
    }
}

impl SharedTransport {
    /// Builds a client enforcing TLS 1.2+, the configured revocation lists,
    /// gzip/deflate decoding and a shared cookie store.
    ///
    /// Without revocation lists the handshake cannot check revocation; that
    /// is a [`RestTransportError::Config`] error when
    /// [`TransportOptions::require_crl`] is set and a warning otherwise.
    ///
    /// reqwest never sends `Expect: 100-continue`; Nagle is disabled on every
    /// connection.
    pub fn build(options: &TransportOptions) -> Result<Self> {
        if options.crl_paths.is_empty() {
            if options.require_crl {
                return Err(RestTransportError::Config(
                    "require_crl is set but no revocation lists are configured".to_owned(),
                ));
            }
            #[cfg(feature = "tracing")]
            tracing::warn!(
                "no certificate revocation lists configured; revoked server certificates will not be rejected"
            );
        }

        let cookies = Arc::new(CookieStoreMutex::default());

        let mut builder = Client::builder()
            .use_rustls_tls()
            .min_tls_version(Version::TLS_1_2)
            .gzip(true)
            .deflate(true)
            .cookie_provider(Arc::clone(&cookies))
            .tcp_nodelay(true)
            .pool_max_idle_per_host(options.max_connections_per_host);

        for path in &options.crl_paths {
            let pem = std::fs::read(path).map_err(|err| RestTransportError::Crl {
                path: path.clone(),
                source: err.into(),
            })?;
            let crl = CertificateRevocationList::from_pem(&pem).map_err(|err| {
                RestTransportError::Crl {
                    path: path.clone(),
                    source: err.into(),
                }
            })?;
            builder = builder.add_crl(crl);
        }

        let client = builder.build().map_err(RestTransportError::Build)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            max_connections_per_host = options.max_connections_per_host,
            revocation_lists = options.crl_paths.len(),
            "built shared http transport"
        );

        Ok(Self {
            transport: RetryingTransport::new(client).with_backoff(options.backoff_policy()),
            cookies,
            revocation_lists: options.crl_paths.len(),
        })
    }

    /// Whether TLS handshakes check certificates against revocation lists.
    pub fn checks_revocation(&self) -> bool {
        self.revocation_lists > 0
    }

    /// The underlying client, for building requests.
    pub fn client(&self) -> &Client {
        self.transport.inner()
    }

    pub fn transport(&self) -> &RetryingTransport<Client> {
        &self.transport
    }

    /// See [`RetryingTransport::send`].
    pub async fn send(&self, request: Request, cancel: &CancellationToken) -> Result<Response> {
        self.transport.send(request, cancel).await
    }

    /// Expires every cookie that would currently be sent to `url`.
    pub fn clear_cookies(&self, url: &Url) {
        let mut store = self.cookies.lock().unwrap_or_else(PoisonError::into_inner);
        let matched: Vec<(String, String, String)> = store
            .matches(url)
            .into_iter()
            .map(|cookie| {
                (
                    String::from(&cookie.domain),
                    String::from(&cookie.path),
                    cookie.name().to_owned(),
                )
            })
            .collect();

        for (domain, path, name) in &matched {
            store.remove(domain, path, name);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(%url, cleared = matched.len(), "expired cookies");
    }
}

/// Lazily builds and caches one shared instance.
///
/// Reads after construction are lock-free; the first callers serialize on a
/// mutex so the builder runs once.
pub struct SharedTransportFactory<T = SharedTransport> {
    slot: ArcSwapOption<T>,
    init: Mutex<()>,
}

impl<T> SharedTransportFactory<T> {
    pub const fn new() -> Self {
        Self {
            slot: ArcSwapOption::const_empty(),
            init: Mutex::new(()),
        }
    }

    /// The cached instance, if built.
    pub fn get(&self) -> Option<Arc<T>> {
        self.slot.load_full()
    }

    /// Returns the cached instance or runs `build` exactly once to create it.
    ///
    /// A failed build leaves the factory empty.
    pub fn get_or_init<F>(&self, build: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        if let Some(existing) = self.slot.load_full() {
            return Ok(existing);
        }

        let _guard = self.init.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = self.slot.load_full() {
            return Ok(existing);
        }

        let built = Arc::new(build()?);
        self.slot.store(Some(Arc::clone(&built)));
        Ok(built)
    }

    /// Drops the cached instance so the next call rebuilds it. Test hook.
    #[doc(hidden)]
    pub fn reset(&self) {
        let _guard = self.init.lock().unwrap_or_else(PoisonError::into_inner);
        self.slot.store(None);
    }
}

impl<T> Default for SharedTransportFactory<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedTransportFactory<SharedTransport> {
    /// Returns the instance, building it from the environment on first use.
    pub fn get_transport(&self) -> Result<Arc<SharedTransport>> {
        self.get_or_init(|| SharedTransport::build(&TransportOptions::from_env()?))
    }

    /// Like [`get_transport`](Self::get_transport) with explicit options.
    ///
    /// Options are ignored once the instance exists.
    pub fn get_transport_with(&self, options: &TransportOptions) -> Result<Arc<SharedTransport>> {
        self.get_or_init(|| SharedTransport::build(options))
    }

    /// Expires cookies for `url` in the built instance's store, if any.
    pub fn clear_cookies(&self, url: &Url) {
        if let Some(transport) = self.get() {
            transport.clear_cookies(url);
        }
    }
}
