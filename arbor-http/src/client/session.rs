//! The per-connection session state machine.
//!
//! A session owns one negotiated channel's send/receive multiplexing
//! state: monotonic request ids, the unfinished-response table, the
//! concurrent-stream cap, and the graceful-drain transition once the
//! request-id space is exhausted.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use ahash::AHashMap;
use bytes::Bytes;
use futures::future::BoxFuture;
use http_body::{Frame, SizeHint};
use hyper::client::conn::{http1, http2};
use parking_lot::Mutex;
use pin_project::{pin_project, pinned_drop};
use pin_project::__private::PinnedDrop;
use tokio::{sync::watch, time::Instant};

use super::{
    options::ConnectionOptions,
    pool::{PoolKey, PoolableConnection},
};
use crate::{
    body::Body,
    error::{client::ClientError, BoxError},
    proto::SessionProtocol,
    request::Request,
    response::Response,
};

/// The hard cap on request ids within one session. Comfortably below
/// overflow of the 31-bit stream-id space.
pub const MAX_REQUEST_ID: u32 = 1 << 29;

/// The request body was not drained within the write timeout.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("request body write timed out")]
struct WriteTimedOut;

/// Session construction knobs.
#[derive(Clone)]
pub struct SessionConfig {
    /// Requests allowed on one session before it drains.
    pub max_requests_per_session: u32,
    /// Concurrent-stream seed for HTTP/2 until a SETTINGS update arrives.
    pub initial_max_concurrent_streams: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_requests_per_session: MAX_REQUEST_ID,
            initial_max_concurrent_streams: u32::MAX as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Active,
    Draining,
    Closed,
}

/// The response-side lifecycle of one in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    WaitHeaders,
    WaitBodyOrTrailers,
    Done,
}

pub(crate) enum Dialect {
    H1(http1::SendRequest<Body>),
    H2(http2::SendRequest<Body>),
    #[cfg(test)]
    Mock(mock::MockSender),
}

impl Dialect {
    fn send(&mut self, req: Request) -> BoxFuture<'static, Result<Response, ClientError>> {
        match self {
            Self::H1(sender) => {
                let fut = sender.send_request(req);
                Box::pin(async move {
                    fut.await
                        .map(|resp| resp.map(Body::from_incoming))
                        .map_err(map_hyper_error)
                })
            }
            Self::H2(sender) => {
                let fut = sender.send_request(req);
                Box::pin(async move {
                    fut.await
                        .map(|resp| resp.map(Body::from_incoming))
                        .map_err(map_hyper_error)
                })
            }
            #[cfg(test)]
            Self::Mock(sender) => sender.send(req),
        }
    }
}

struct SessionState {
    phase: SessionPhase,
    in_flight: AHashMap<u32, ResponseState>,
}

/// One connection's protocol session.
pub struct HttpSession {
    id: u64,
    protocol: SessionProtocol,
    sender: Mutex<Option<Dialect>>,
    state: Mutex<SessionState>,
    requests_sent: AtomicU32,
    max_requests: u32,
    max_unfinished: AtomicU64,
    disconnect_when_finished: AtomicBool,
    active: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl HttpSession {
    pub(crate) fn new(
        id: u64,
        protocol: SessionProtocol,
        dialect: Dialect,
        config: &SessionConfig,
    ) -> Arc<Self> {
        debug_assert!(protocol.is_determined());
        let max_unfinished = if protocol.is_multiplex() {
            config.initial_max_concurrent_streams.min(u32::MAX as u64)
        } else {
            // HTTP/1 pipelining is not used: one exchange at a time.
            1
        };
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            id,
            protocol,
            sender: Mutex::new(Some(dialect)),
            state: Mutex::new(SessionState {
                phase: SessionPhase::Active,
                in_flight: AHashMap::new(),
            }),
            requests_sent: AtomicU32::new(0),
            max_requests: config.max_requests_per_session,
            max_unfinished: AtomicU64::new(max_unfinished),
            disconnect_when_finished: AtomicBool::new(false),
            active: AtomicBool::new(true),
            closed_tx,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn protocol(&self) -> SessionProtocol {
        self.protocol
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase
    }

    /// Requests sent so far; ids are strictly monotonic within a session.
    pub fn requests_sent(&self) -> u32 {
        self.requests_sent.load(Ordering::Acquire)
    }

    pub fn unfinished_responses(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    pub fn disconnect_when_finished(&self) -> bool {
        self.disconnect_when_finished.load(Ordering::Acquire)
    }

    /// Applies an HTTP/2 SETTINGS update of MAX_CONCURRENT_STREAMS.
    pub fn update_max_concurrent_streams(&self, value: u64) {
        self.max_unfinished
            .store(value.min(u32::MAX as u64), Ordering::Release);
    }

    pub fn max_concurrent_streams(&self) -> u64 {
        self.max_unfinished.load(Ordering::Acquire)
    }

    /// Whether the session accepts a new request right now.
    pub fn can_send_request(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        let state = self.state.lock();
        state.phase == SessionPhase::Active
            && (state.in_flight.len() as u64) < self.max_concurrent_streams()
    }

    /// Below the stream cap; used by the pool's HTTP/2 rotation.
    pub fn can_accept_more_streams(&self) -> bool {
        (self.unfinished_responses() as u64) < self.max_concurrent_streams()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Submits one request on this session.
    pub async fn invoke(
        self: &Arc<Self>,
        req: Request,
        opts: &ConnectionOptions,
    ) -> Result<Response, ClientError> {
        let request_id = self.begin_request()?;
        let deadline = opts.response_timeout.map(|t| Instant::now() + t);

        let req = match opts.write_timeout {
            Some(timeout) => req.map(|body| {
                Body::from_body(WriteTimeoutBody {
                    inner: body,
                    timeout,
                    sleep: None,
                })
            }),
            None => req,
        };

        let send_fut = {
            let mut sender = self.sender.lock();
            match sender.as_mut() {
                Some(dialect) => dialect.send(req),
                None => {
                    self.finish_request(request_id);
                    return Err(ClientError::ClosedSession);
                }
            }
        };

        let result = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, send_fut).await {
                Ok(result) => result,
                Err(_) => {
                    self.finish_request(request_id);
                    return Err(ClientError::ResponseTimeout);
                }
            },
            None => send_fut.await,
        };

        let resp = match result {
            Ok(resp) => resp,
            Err(err) => {
                self.finish_request(request_id);
                return Err(err);
            }
        };

        self.set_response_state(request_id, ResponseState::WaitBodyOrTrailers);
        let session = self.clone();
        let max_len = opts.max_response_length;
        Ok(resp.map(move |body| {
            Body::from_body(ResponseBody {
                inner: body,
                session,
                request_id,
                remaining: (max_len > 0).then_some(max_len),
                deadline: deadline.map(|d| Box::pin(tokio::time::sleep_until(d))),
                finished: false,
            })
        }))
    }

    fn begin_request(self: &Arc<Self>) -> Result<u32, ClientError> {
        let mut state = self.state.lock();
        if !self.is_active() || state.phase != SessionPhase::Active {
            return Err(ClientError::ClosedSession);
        }
        if (state.in_flight.len() as u64) >= self.max_concurrent_streams() {
            return Err(ClientError::RefusedStream);
        }
        let id = self.requests_sent.fetch_add(1, Ordering::AcqRel) + 1;
        if id >= self.max_requests {
            state.phase = SessionPhase::Draining;
            self.disconnect_when_finished.store(true, Ordering::Release);
            tracing::debug!(session = self.id, "request id space exhausted, draining session");
        }
        state.in_flight.insert(id, ResponseState::WaitHeaders);
        Ok(id)
    }

    fn set_response_state(&self, request_id: u32, response_state: ResponseState) {
        let mut state = self.state.lock();
        if let Some(entry) = state.in_flight.get_mut(&request_id) {
            *entry = response_state;
        }
    }

    /// Removes one in-flight record; closes the channel once a draining
    /// session has no responses left.
    fn finish_request(&self, request_id: u32) {
        let close_now = {
            let mut state = self.state.lock();
            if state.in_flight.remove(&request_id).is_none() {
                return;
            }
            state.phase != SessionPhase::Active && state.in_flight.is_empty()
        };
        if close_now {
            self.close();
        }
    }

    /// Initiates channel close. Dropping the sender lets the transport
    /// finish in-flight exchanges and shut the connection down.
    pub fn close(&self) {
        let sender = self.sender.lock().take();
        drop(sender);
        self.mark_closed();
    }

    /// Called by the connection driver once the channel is inactive.
    /// Every remaining in-flight response fails with `ClosedSession`.
    pub fn mark_closed(&self) {
        self.active.store(false, Ordering::Release);
        let abandoned = {
            let mut state = self.state.lock();
            state.phase = SessionPhase::Closed;
            state.in_flight.drain().count()
        };
        if abandoned > 0 {
            tracing::debug!(
                session = self.id,
                abandoned,
                "channel became inactive with responses in flight",
            );
        }
        let _ = self.closed_tx.send(true);
    }

    /// Resolves when the channel has closed.
    pub fn on_close(&self) -> BoxFuture<'static, ()> {
        let mut rx = self.closed_tx.subscribe();
        Box::pin(async move {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
    }

    #[cfg(test)]
    fn response_state(&self, request_id: u32) -> Option<ResponseState> {
        self.state.lock().in_flight.get(&request_id).copied()
    }
}

/// A pooled connection: one channel plus its session, cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    key: PoolKey,
    session: Arc<HttpSession>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.inner.key)
            .field("id", &self.inner.session.id)
            .field("protocol", &self.inner.session.protocol)
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(key: PoolKey, session: Arc<HttpSession>) -> Self {
        Self {
            inner: Arc::new(ConnectionInner { key, session }),
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.inner.key
    }

    pub fn session(&self) -> &Arc<HttpSession> {
        &self.inner.session
    }

    pub async fn invoke(
        &self,
        req: Request,
        opts: &ConnectionOptions,
    ) -> Result<Response, ClientError> {
        self.inner.session.invoke(req, opts).await
    }
}

impl PoolableConnection for Connection {
    fn id(&self) -> u64 {
        self.inner.session.id()
    }

    fn protocol(&self) -> SessionProtocol {
        self.inner.session.protocol()
    }

    fn is_healthy(&self) -> bool {
        self.inner.session.is_active() && self.inner.session.can_send_request()
    }

    fn can_accept_more_streams(&self) -> bool {
        self.inner.session.can_accept_more_streams()
    }

    fn close(&self) {
        self.inner.session.close();
    }

    fn on_close(&self) -> BoxFuture<'static, ()> {
        self.inner.session.on_close()
    }
}

/// Maps transport failures onto the client error taxonomy.
fn map_hyper_error(err: hyper::Error) -> ClientError {
    if h2_reason(&err) == Some(h2::Reason::REFUSED_STREAM) {
        return ClientError::RefusedStream;
    }
    if source_chain_has::<WriteTimedOut>(&err) {
        return ClientError::WriteTimeout;
    }
    if err.is_parse() || err.is_parse_status() || err.is_parse_too_large() {
        return ClientError::violation(err.to_string());
    }
    // Cancellation and closed channels both mean the exchange died with the
    // connection.
    ClientError::ClosedSession
}

fn h2_reason(err: &(dyn std::error::Error + 'static)) -> Option<h2::Reason> {
    let mut cursor: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(err) = cursor {
        if let Some(h2) = err.downcast_ref::<h2::Error>() {
            return h2.reason();
        }
        cursor = err.source();
    }
    None
}

fn source_chain_has<E: std::error::Error + 'static>(
    err: &(dyn std::error::Error + 'static),
) -> bool {
    let mut cursor: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(err) = cursor {
        if err.downcast_ref::<E>().is_some() {
            return true;
        }
        cursor = err.source();
    }
    false
}

/// Fails the request once the gap between body frames exceeds the write
/// timeout.
#[pin_project]
struct WriteTimeoutBody {
    #[pin]
    inner: Body,
    timeout: Duration,
    sleep: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl http_body::Body for WriteTimeoutBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        match this.inner.poll_frame(cx) {
            Poll::Ready(ready) => {
                *this.sleep = None;
                Poll::Ready(ready)
            }
            Poll::Pending => {
                let sleep = this
                    .sleep
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(*this.timeout)));
                match sleep.as_mut().poll(cx) {
                    Poll::Ready(()) => Poll::Ready(Some(Err(Box::new(WriteTimedOut)))),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// The response stream handed back to callers: enforces the response
/// deadline and the content-length cap, and keeps the session's in-flight
/// table in sync, including consumer cancellation.
#[pin_project(PinnedDrop)]
struct ResponseBody {
    #[pin]
    inner: Body,
    session: Arc<HttpSession>,
    request_id: u32,
    remaining: Option<u64>,
    deadline: Option<Pin<Box<tokio::time::Sleep>>>,
    finished: bool,
}

impl ResponseBody {
    fn finish(session: &HttpSession, request_id: u32, finished: &mut bool) {
        if !*finished {
            *finished = true;
            session.finish_request(request_id);
        }
    }
}

impl http_body::Body for ResponseBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        if *this.finished {
            return Poll::Ready(None);
        }
        if let Some(deadline) = this.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                Self::finish(this.session, *this.request_id, this.finished);
                return Poll::Ready(Some(Err(Box::new(ClientError::ResponseTimeout))));
            }
        }
        match std::task::ready!(this.inner.poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    if let Some(remaining) = this.remaining.as_mut() {
                        let len = data.len() as u64;
                        if len > *remaining {
                            Self::finish(this.session, *this.request_id, this.finished);
                            return Poll::Ready(Some(Err(Box::new(
                                ClientError::ContentTooLarge,
                            ))));
                        }
                        *remaining -= len;
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(err)) => {
                Self::finish(this.session, *this.request_id, this.finished);
                let mapped: BoxError = match err.downcast::<hyper::Error>() {
                    Ok(hyper_err) => Box::new(map_hyper_error(*hyper_err)),
                    Err(err) => err,
                };
                Poll::Ready(Some(Err(mapped)))
            }
            None => {
                Self::finish(this.session, *this.request_id, this.finished);
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.finished || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[pinned_drop]
impl PinnedDrop for ResponseBody {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        // A dropped consumer counts as a cancelled subscription.
        Self::finish(this.session, *this.request_id, this.finished);
    }
}


#[cfg(test)]
mod session_tests {
    use std::{sync::Arc, time::Duration};

    use super::{
        mock::MockSender, Dialect, HttpSession, ResponseState, SessionConfig, SessionPhase,
    };
    use crate::{
        body::Body, client::options::ConnectionOptions, error::client::ClientError,
        proto::SessionProtocol,
    };

    fn session_with(
        responder: MockSender,
        config: SessionConfig,
    ) -> Arc<HttpSession> {
        HttpSession::new(1, SessionProtocol::H2c, Dialect::Mock(responder), &config)
    }

    fn h2_session() -> Arc<HttpSession> {
        session_with(MockSender::ok(), SessionConfig::default())
    }

    #[tokio::test]
    async fn request_ids_are_strictly_monotonic() {
        let session = h2_session();
        let opts = ConnectionOptions::default();

        for expected in 1..=5u32 {
            let resp = session.invoke(http::Request::new(Body::empty()), &opts).await.unwrap();
            let _ = resp.into_body().into_bytes().await.unwrap();
            assert_eq!(session.requests_sent(), expected);
        }
        assert_eq!(session.unfinished_responses(), 0);
        assert_eq!(session.phase(), SessionPhase::Active);
    }

    #[tokio::test]
    async fn graceful_drain_at_request_cap() {
        let config = SessionConfig {
            max_requests_per_session: 3,
            ..Default::default()
        };
        let session = session_with(MockSender::ok(), config);
        let opts = ConnectionOptions::default();

        let mut responses = Vec::new();
        for _ in 0..3 {
            responses.push(
                session
                    .invoke(http::Request::new(Body::empty()), &opts)
                    .await
                    .unwrap(),
            );
        }
        // The cap was hit on the third request.
        assert!(session.disconnect_when_finished());
        assert_eq!(session.phase(), SessionPhase::Draining);
        assert!(!session.can_send_request());

        // A fourth request is refused; the pool would route it elsewhere.
        let err = session
            .invoke(http::Request::new(Body::empty()), &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ClosedSession));

        // Draining closes the channel once the last response finishes.
        for resp in responses {
            let _ = resp.into_body().into_bytes().await.unwrap();
        }
        assert_eq!(session.phase(), SessionPhase::Closed);
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn response_state_progression() {
        let session = h2_session();
        let opts = ConnectionOptions::default();

        let resp = session
            .invoke(http::Request::new(Body::empty()), &opts)
            .await
            .unwrap();
        assert_eq!(
            session.response_state(1),
            Some(ResponseState::WaitBodyOrTrailers),
        );
        let _ = resp.into_body().into_bytes().await.unwrap();
        assert_eq!(session.response_state(1), None);
        assert_eq!(session.unfinished_responses(), 0);
    }

    #[tokio::test]
    async fn dropping_the_response_consumer_releases_the_stream() {
        let session = h2_session();
        let opts = ConnectionOptions::default();

        let resp = session
            .invoke(http::Request::new(Body::empty()), &opts)
            .await
            .unwrap();
        assert_eq!(session.unfinished_responses(), 1);
        drop(resp);
        assert_eq!(session.unfinished_responses(), 0);
    }

    #[tokio::test]
    async fn settings_updates_clamp_the_stream_cap() {
        let session = h2_session();
        session.update_max_concurrent_streams(u64::MAX);
        assert_eq!(session.max_concurrent_streams(), u32::MAX as u64);

        session.update_max_concurrent_streams(1);
        let opts = ConnectionOptions::default();
        let resp = session
            .invoke(http::Request::new(Body::empty()), &opts)
            .await
            .unwrap();
        assert!(!session.can_send_request());
        let err = session
            .invoke(http::Request::new(Body::empty()), &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::RefusedStream));
        let _ = resp.into_body().into_bytes().await.unwrap();
        assert!(session.can_send_request());
    }

    #[tokio::test(start_paused = true)]
    async fn response_timeout_fails_slow_responses() {
        let slow = MockSender::with(|_req| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(http::Response::new(Body::empty()))
            })
        });
        let session = session_with(slow, SessionConfig::default());
        let opts = ConnectionOptions {
            response_timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        };

        let err = session
            .invoke(http::Request::new(Body::empty()), &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ResponseTimeout));
        assert_eq!(session.unfinished_responses(), 0);
    }

    #[tokio::test]
    async fn oversized_response_fails_with_content_too_large() {
        let big = MockSender::with(|_req| {
            Box::pin(async { Ok(http::Response::new(Body::full(vec![0u8; 64]))) })
        });
        let session = session_with(big, SessionConfig::default());
        let opts = ConnectionOptions {
            max_response_length: 16,
            ..Default::default()
        };

        let resp = session
            .invoke(http::Request::new(Body::empty()), &opts)
            .await
            .unwrap();
        let err = resp.into_body().into_bytes().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ClientError>(),
            Some(ClientError::ContentTooLarge),
        ));
        assert_eq!(session.unfinished_responses(), 0);
    }
}
