//! The retry loop wrapped around every outbound request.

use std::time::Duration;

use reqwest::{Request, Response};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::BackoffPolicy,
    error::AttemptFailure,
    send::SendRequest,
    uri::UriUpdater,
    RestTransportError, Result,
};

/// Middleware that retries a request until it succeeds or the caller cancels.
///
/// There is no attempt cap. Termination relies on the caller's
/// [`CancellationToken`], typically cancelled by an overall deadline.
#[derive(Clone, Debug)]
pub struct RetryingTransport<S> {
    inner: S,
    backoff: BackoffPolicy,
}

impl<S: SendRequest> RetryingTransport<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// The wrapped sender, e.g. a [`reqwest::Client`] for building requests.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Sends `request`, retrying every failure except caller cancellation.
    ///
    /// The request's own timeout ([`Request::timeout`]) is applied per attempt;
    /// `None` means attempts never time out. Between attempts only the URL is
    /// rewritten (see [`UriUpdater`]); method, headers and body are resent as is.
    ///
    /// Fails with [`RestTransportError::Cancelled`] once `cancel` fires, and with
    /// [`RestTransportError::BodyNotReplayable`] before any network activity if
    /// the body is a stream.
    pub async fn send(&self, mut request: Request, cancel: &CancellationToken) -> Result<Response> {
        let attempt_timeout = request.timeout_mut().take();
        let mut updater = UriUpdater::new(request.url());
        let mut attempt: u32 = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(RestTransportError::Cancelled);
            }
            let outgoing = request
                .try_clone()
                .ok_or(RestTransportError::BodyNotReplayable)?;

            match self.attempt(outgoing, attempt_timeout, cancel).await {
                Ok(response) => return Ok(response),
                Err(AttemptFailure::CallerCancelled) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(url = %request.url(), attempt, "rest request cancelled by caller");
                    return Err(RestTransportError::Cancelled);
                }
                Err(failure) => log_failure(&request, attempt, &failure),
            }

            *request.url_mut() = updater.update();

            let wait = self.backoff.next_wait(attempt);
            #[cfg(feature = "tracing")]
            tracing::debug!("sleep {} ms and then retry the request", wait.as_millis());

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(RestTransportError::Cancelled),
                () = sleep(wait) => {}
            }
            attempt = attempt.saturating_add(1);
        }
    }

    /// Runs one physical send under a per-attempt token derived from `cancel`.
    async fn attempt(
        &self,
        request: Request,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> std::result::Result<Response, AttemptFailure> {
        let attempt_token = cancel.child_token();

        let sent = tokio::select! {
            biased;
            () = attempt_token.cancelled() => None,
            () = expire(timeout) => {
                attempt_token.cancel();
                None
            }
            sent = self.inner.send(request, &attempt_token) => Some(sent),
        };

        match sent {
            Some(Ok(Some(response))) if response.status().is_success() => Ok(response),
            Some(Ok(Some(response))) => Err(AttemptFailure::Status(response.status())),
            Some(Ok(None)) => Err(AttemptFailure::NoResponse),
            Some(Err(err)) => Err(interrupted(cancel, &attempt_token).unwrap_or(AttemptFailure::Transport(err))),
            None => Err(interrupted(cancel, &attempt_token).unwrap_or(AttemptFailure::TimedOut)),
        }
    }
}

/// Attributes an interruption, checking the caller token first so a timeout
/// never masks caller cancellation.
fn interrupted(cancel: &CancellationToken, attempt_token: &CancellationToken) -> Option<AttemptFailure> {
    if cancel.is_cancelled() {
        Some(AttemptFailure::CallerCancelled)
    } else if attempt_token.is_cancelled() {
        Some(AttemptFailure::TimedOut)
    } else {
        None
    }
}

async fn expire(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => sleep(timeout).await,
        None => std::future::pending().await,
    }
}

#[cfg(feature = "tracing")]
fn log_failure(request: &Request, attempt: u32, failure: &AttemptFailure) {
    let url = request.url();
    match failure {
        AttemptFailure::TimedOut => {
            tracing::warn!(%url, attempt, "http request timeout, retrying");
        }
        AttemptFailure::Transport(err) => {
            tracing::warn!(%url, attempt, error = %err, "error during request, retrying");
        }
        AttemptFailure::Status(status) => {
            tracing::debug!(%url, attempt, %status, "failed response");
        }
        AttemptFailure::NoResponse => {
            tracing::info!(%url, attempt, "response returned was empty");
        }
        AttemptFailure::CallerCancelled => {}
    }
}

#[cfg(not(feature = "tracing"))]
fn log_failure(_request: &Request, _attempt: u32, _failure: &AttemptFailure) {}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::future::Future;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use reqwest::{Method, Request, Response, StatusCode, Url};
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use super::RetryingTransport;
    use crate::{
        backoff::BackoffPolicy,
        send::{SendError, SendRequest},
        RestTransportError,
    };

    #[derive(Clone, Copy, Debug)]
    enum Step {
        Status(u16),
        Fail,
        Empty,
        Hang,
    }

    /// Plays back a script of outcomes and records every URL it was sent.
    #[derive(Clone, Default)]
    struct ScriptedSender {
        script: Arc<Mutex<VecDeque<Step>>>,
        fallback: Option<Step>,
        seen: Arc<Mutex<Vec<(Url, Instant)>>>,
    }

    impl ScriptedSender {
        fn new(steps: impl IntoIterator<Item = Step>) -> Self {
            Self {
                script: Arc::new(Mutex::new(steps.into_iter().collect())),
                ..Self::default()
            }
        }

        fn always(step: Step) -> Self {
            Self {
                fallback: Some(step),
                ..Self::default()
            }
        }

        fn urls(&self) -> Vec<Url> {
            self.seen.lock().unwrap().iter().map(|(url, _)| url.clone()).collect()
        }

        fn sends(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    impl SendRequest for ScriptedSender {
        fn send(
            &self,
            request: Request,
            _cancel: &CancellationToken,
        ) -> impl Future<Output = Result<Option<Response>, SendError>> + Send {
            self.seen.lock().unwrap().push((request.url().clone(), Instant::now()));
            let step = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .or(self.fallback)
                .expect("script exhausted");
            async move {
                match step {
                    Step::Status(code) => {
                        let response = http::Response::builder()
                            .status(code)
                            .body(format!("status {code}"))
                            .unwrap();
                        Ok(Some(Response::from(response)))
                    }
                    Step::Fail => Err(SendError::from("connection reset by peer")),
                    Step::Empty => Ok(None),
                    Step::Hang => std::future::pending().await,
                }
            }
        }
    }

    fn transport(sender: ScriptedSender) -> RetryingTransport<ScriptedSender> {
        RetryingTransport::new(sender).with_backoff(BackoffPolicy::new(Duration::from_secs(1), 16))
    }

    fn request(url: &str, timeout: Option<Duration>) -> Request {
        let mut request = Request::new(Method::POST, Url::parse(url).unwrap());
        *request.body_mut() = Some("select 1".into());
        *request.timeout_mut() = timeout;
        request
    }

    /// Paused-clock timers fire at millisecond granularity.
    fn assert_close(actual: Duration, expected: Duration) {
        assert!(
            actual >= expected && actual <= expected + Duration::from_millis(5),
            "expected ~{expected:?}, got {actual:?}"
        );
    }

    const QUERY_URL: &str = "https://acct.example.com/queries/v1/query-request?requestId=r1";

    #[tokio::test(start_paused = true)]
    async fn success_on_third_attempt_waits_one_then_two_units() {
        let sender = ScriptedSender::new([Step::Status(503), Step::Fail, Step::Status(200)]);
        let transport = transport(sender.clone());
        let started = Instant::now();

        let response = transport
            .send(request(QUERY_URL, None), &CancellationToken::new())
            .await
            .expect("third attempt succeeds");

        assert_eq!(response.status(), StatusCode::OK);
        assert_close(started.elapsed(), Duration::from_secs(3));

        let seen = sender.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);
        assert_close(seen[1].1 - seen[0].1, Duration::from_secs(1));
        assert_close(seen[2].1 - seen[1].1, Duration::from_secs(2));

        let queries: Vec<Option<String>> = sender
            .urls()
            .iter()
            .map(|url| url.query().map(str::to_owned))
            .collect();
        assert_eq!(
            queries,
            vec![
                Some("requestId=r1".to_owned()),
                Some("requestId=r1&retryCount=1".to_owned()),
                Some("requestId=r1&retryCount=2".to_owned()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_retries_until_caller_cancels() {
        let sender = ScriptedSender::always(Step::Fail);
        let transport = transport(sender.clone());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            trigger.cancel();
        });

        let err = transport
            .send(request(QUERY_URL, None), &cancel)
            .await
            .expect_err("must stop on cancellation");
        assert!(matches!(err, RestTransportError::Cancelled));

        // Attempts at t = 0, 1, 3, 7; cancellation lands during the 8 s wait.
        assert_eq!(sender.sends(), 4);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(sender.sends(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn non_success_status_is_retried_even_for_client_errors() {
        let sender = ScriptedSender::new([Step::Status(400), Step::Status(404), Step::Status(204)]);
        let response = transport(sender.clone())
            .send(request("https://acct.example.com/session", None), &CancellationToken::new())
            .await
            .expect("eventually succeeds");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(sender.sends(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_send_result_is_retried() {
        let sender = ScriptedSender::new([Step::Empty, Step::Status(200)]);
        transport(sender.clone())
            .send(request(QUERY_URL, None), &CancellationToken::new())
            .await
            .expect("second attempt succeeds");
        assert_eq!(sender.sends(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_is_retried_not_surfaced() {
        let sender = ScriptedSender::new([Step::Hang, Step::Hang, Step::Status(200)]);
        let transport = transport(sender.clone());
        let started = Instant::now();

        transport
            .send(
                request(QUERY_URL, Some(Duration::from_millis(500))),
                &CancellationToken::new(),
            )
            .await
            .expect("third attempt succeeds");

        assert_eq!(sender.sends(), 3);
        // Two timed-out attempts plus waits of one and two seconds.
        assert_close(started.elapsed(), Duration::from_millis(500 + 1_000 + 500 + 2_000));
    }

    #[tokio::test(start_paused = true)]
    async fn caller_cancellation_during_send_is_not_treated_as_timeout() {
        let sender = ScriptedSender::always(Step::Hang);
        let transport = transport(sender.clone());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = transport
            .send(request(QUERY_URL, Some(Duration::from_secs(5))), &cancel)
            .await
            .expect_err("must be cancelled");

        assert!(matches!(err, RestTransportError::Cancelled));
        assert_close(started.elapsed(), Duration::from_millis(300));
        assert_eq!(sender.sends(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn infinite_attempt_timeout_waits_for_caller() {
        let sender = ScriptedSender::always(Step::Hang);
        let transport = transport(sender.clone());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            trigger.cancel();
        });

        let err = transport
            .send(request(QUERY_URL, None), &cancel)
            .await
            .expect_err("must be cancelled");
        assert!(matches!(err, RestTransportError::Cancelled));
        assert_eq!(sender.sends(), 1);
    }

    #[tokio::test]
    async fn already_cancelled_token_sends_nothing() {
        let sender = ScriptedSender::always(Step::Status(200));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = transport(sender.clone())
            .send(request(QUERY_URL, None), &cancel)
            .await
            .expect_err("must be cancelled");
        assert!(matches!(err, RestTransportError::Cancelled));
        assert_eq!(sender.sends(), 0);
    }

    #[tokio::test]
    async fn streaming_body_is_rejected_before_sending() {
        let sender = ScriptedSender::always(Step::Status(200));
        let mut streaming = request(QUERY_URL, None);
        let chunks = futures_util::stream::iter(vec![Ok::<_, std::io::Error>("chunk")]);
        *streaming.body_mut() = Some(reqwest::Body::wrap_stream(chunks));

        let err = transport(sender.clone())
            .send(streaming, &CancellationToken::new())
            .await
            .expect_err("stream bodies cannot be replayed");
        assert!(matches!(err, RestTransportError::BodyNotReplayable));
        assert_eq!(sender.sends(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn method_and_body_are_unchanged_between_attempts() {
        #[derive(Clone, Default)]
        struct Recorder {
            seen: Arc<Mutex<Vec<(Method, Vec<u8>)>>>,
        }

        impl SendRequest for Recorder {
            fn send(
                &self,
                request: Request,
                _cancel: &CancellationToken,
            ) -> impl Future<Output = Result<Option<Response>, SendError>> + Send {
                let body = request
                    .body()
                    .and_then(reqwest::Body::as_bytes)
                    .map(<[u8]>::to_vec)
                    .unwrap_or_default();
                let mut seen = self.seen.lock().unwrap();
                seen.push((request.method().clone(), body));
                let code = if seen.len() < 3 { 500 } else { 200 };
                async move {
                    let response = http::Response::builder().status(code).body(Vec::new()).unwrap();
                    Ok(Some(Response::from(response)))
                }
            }
        }

        let recorder = Recorder::default();
        RetryingTransport::new(recorder.clone())
            .send(request(QUERY_URL, None), &CancellationToken::new())
            .await
            .expect("third attempt succeeds");

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        for (method, body) in seen.iter() {
            assert_eq!(*method, Method::POST);
            assert_eq!(body.as_slice(), b"select 1");
        }
    }
}
