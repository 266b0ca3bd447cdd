use std::future::Future;

use reqwest::{Request, Response};
use tokio_util::sync::CancellationToken;

/// Error produced by a single physical send.
pub type SendError = Box<dyn std::error::Error + Send + Sync>;

/// One physical attempt against the network stack.
///
/// The retry loop races the returned future against `cancel`, so
/// implementations are free to ignore the token. `Ok(None)` means the stack
/// produced neither a response nor an error.
pub trait SendRequest: Send + Sync {
    fn send(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Option<Response>, SendError>> + Send;
}

impl SendRequest for reqwest::Client {
    fn send(
        &self,
        request: Request,
        _cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Option<Response>, SendError>> + Send {
        let pending = self.execute(request);
        async move { pending.await.map(Some).map_err(SendError::from) }
    }
}
