//! HTTP body implementation and the stream/backpressure primitive.
//!
//! [`Body`] is the message payload used on both sides of the runtime. The
//! [`channel`] constructor builds the demand-driven pair at the heart of
//! streaming: a [`BodyWriter`] that pushes frames and suspends once the
//! buffered byte counter exceeds the watermark, and a [`Body`] whose
//! consumer drains the counter frame by frame. Dropping the consumer closes
//! the stream; the writer observes that as [`ClosedStream`].

use std::{
    collections::VecDeque,
    fmt,
    pin::Pin,
    task::{Context, Poll, Waker},
};

use bytes::Bytes;
use http_body::{Frame, SizeHint};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use parking_lot::Mutex;
use pin_project::{pin_project, pinned_drop};
use pin_project::__private::PinnedDrop;

use crate::error::BoxError;

/// The consumer of a [`channel`] body cancelled its subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stream was closed by the consumer")]
pub struct ClosedStream;

/// A response payload grew past the configured maximum length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("content length exceeds the configured maximum")]
pub struct ContentLengthExceeded;

/// An opaque hook observing body frames, typically for logging previews.
pub type ContentPreviewer = Box<dyn FnMut(&Bytes) + Send + Sync + 'static>;

/// Builds [`ContentPreviewer`]s, one per message.
pub type ContentPreviewerFactory =
    std::sync::Arc<dyn Fn() -> ContentPreviewer + Send + Sync + 'static>;

/// An implementation for [`http_body::Body`].
#[pin_project]
pub struct Body {
    #[pin]
    repr: BodyRepr,
}

#[pin_project(project = BodyProj)]
enum BodyRepr {
    /// Complete [`Bytes`] with a known size.
    Full(#[pin] Full<Bytes>),
    /// Wrapper of [`Incoming`]: a server request or a client response.
    Hyper(#[pin] Incoming),
    /// The read half of a [`channel`] pair.
    Channel(ChannelBody),
    /// Boxed [`http_body::Body`].
    Boxed(#[pin] BoxBody<Bytes, BoxError>),
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl Body {
    /// Creates an empty body.
    pub fn empty() -> Self {
        Self {
            repr: BodyRepr::Full(Full::new(Bytes::new())),
        }
    }

    /// Creates a body from a complete chunk of bytes.
    pub fn full(data: impl Into<Bytes>) -> Self {
        Self {
            repr: BodyRepr::Full(Full::new(data.into())),
        }
    }

    /// Creates a body from a hyper [`Incoming`].
    pub fn from_incoming(incoming: Incoming) -> Self {
        Self {
            repr: BodyRepr::Hyper(incoming),
        }
    }

    /// Creates a body from another [`http_body::Body`] instance.
    pub fn from_body<B>(body: B) -> Self
    where
        B: http_body::Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        Self {
            repr: BodyRepr::Boxed(BoxBody::new(body.map_err(Into::into))),
        }
    }

    /// Caps this body at `max` bytes; frames past the cap fail the stream
    /// with [`ContentLengthExceeded`]. `max == 0` means unlimited.
    pub fn with_length_limit(self, max: u64) -> Self {
        if max == 0 {
            return self;
        }
        Self::from_body(LengthLimited {
            inner: self,
            remaining: max,
        })
    }

    /// Attaches a content previewer observing every data frame.
    pub fn with_previewer(self, previewer: ContentPreviewer) -> Self {
        Self::from_body(Previewed {
            inner: self,
            previewer,
        })
    }

    /// Runs `hook` exactly once when the stream ends, fails, or is dropped
    /// unconsumed.
    pub fn with_completion<F>(self, hook: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self::from_body(WithCompletion {
            inner: self,
            hook: Some(Box::new(hook)),
        })
    }

    /// Collects the whole body into memory.
    pub async fn into_bytes(self) -> Result<Bytes, BoxError> {
        Ok(self.collect().await?.to_bytes())
    }

    /// Collects the whole body into a UTF-8 string.
    pub async fn into_string(self) -> Result<String, BoxError> {
        let bytes = self.into_bytes().await?;
        String::from_utf8(bytes.into()).map_err(|e| Box::new(e) as BoxError)
    }
}

impl http_body::Body for Body {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.project().repr.project() {
            BodyProj::Full(full) => http_body::Body::poll_frame(full, cx).map_err(BoxError::from),
            BodyProj::Hyper(incoming) => {
                http_body::Body::poll_frame(incoming, cx).map_err(BoxError::from)
            }
            BodyProj::Channel(channel) => channel.poll_frame(cx),
            BodyProj::Boxed(body) => http_body::Body::poll_frame(body, cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.repr {
            BodyRepr::Full(full) => http_body::Body::is_end_stream(full),
            BodyRepr::Hyper(incoming) => http_body::Body::is_end_stream(incoming),
            BodyRepr::Channel(channel) => channel.is_end_stream(),
            BodyRepr::Boxed(body) => http_body::Body::is_end_stream(body),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.repr {
            BodyRepr::Full(full) => http_body::Body::size_hint(full),
            BodyRepr::Hyper(incoming) => http_body::Body::size_hint(incoming),
            BodyRepr::Channel(_) => SizeHint::default(),
            BodyRepr::Boxed(body) => http_body::Body::size_hint(body),
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let repr = match &self.repr {
            BodyRepr::Full(_) => "Full",
            BodyRepr::Hyper(_) => "Hyper",
            BodyRepr::Channel(_) => "Channel",
            BodyRepr::Boxed(_) => "Boxed",
        };
        f.debug_struct("Body").field("repr", &repr).finish()
    }
}

impl From<Bytes> for Body {
    fn from(value: Bytes) -> Self {
        Self::full(value)
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Self::full(value)
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Self::full(value)
    }
}

impl From<&'static str> for Body {
    fn from(value: &'static str) -> Self {
        Self::full(Bytes::from_static(value.as_bytes()))
    }
}

/// Creates a demand-driven body pair.
///
/// The writer suspends whenever more than `watermark` bytes sit buffered
/// between it and the consumer, and resumes as the consumer drains frames.
pub fn channel(watermark: usize) -> (BodyWriter, Body) {
    let shared = std::sync::Arc::new(ChannelShared {
        state: Mutex::new(ChannelState {
            queue: VecDeque::new(),
            buffered: 0,
            watermark,
            write_closed: false,
            read_closed: false,
            error: None,
            read_waker: None,
            write_wakers: Vec::new(),
        }),
    });
    let writer = BodyWriter {
        shared: shared.clone(),
    };
    let body = Body {
        repr: BodyRepr::Channel(ChannelBody { shared }),
    };
    (writer, body)
}

struct ChannelShared {
    state: Mutex<ChannelState>,
}

struct ChannelState {
    queue: VecDeque<Frame<Bytes>>,
    buffered: usize,
    watermark: usize,
    write_closed: bool,
    read_closed: bool,
    error: Option<BoxError>,
    read_waker: Option<Waker>,
    write_wakers: Vec<Waker>,
}

impl ChannelState {
    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn wake_writers(&mut self) {
        for waker in self.write_wakers.drain(..) {
            waker.wake();
        }
    }
}

/// The write half of a [`channel`] body.
pub struct BodyWriter {
    shared: std::sync::Arc<ChannelShared>,
}

impl BodyWriter {
    /// Pushes one data frame, waiting for demand when the buffered byte
    /// counter is above the watermark.
    pub async fn send_data(&self, data: Bytes) -> Result<(), ClosedStream> {
        let mut data = Some(data);
        futures::future::poll_fn(|cx| {
            let mut state = self.shared.state.lock();
            if state.read_closed {
                return Poll::Ready(Err(ClosedStream));
            }
            if state.buffered > state.watermark {
                state.write_wakers.push(cx.waker().clone());
                return Poll::Pending;
            }
            let data = data.take().expect("send_data polled after completion");
            state.buffered += data.len();
            state.queue.push_back(Frame::data(data));
            state.wake_reader();
            Poll::Ready(Ok(()))
        })
        .await
    }

    /// Pushes the trailer frame.
    pub fn send_trailers(&self, trailers: http::HeaderMap) -> Result<(), ClosedStream> {
        let mut state = self.shared.state.lock();
        if state.read_closed {
            return Err(ClosedStream);
        }
        state.queue.push_back(Frame::trailers(trailers));
        state.wake_reader();
        Ok(())
    }

    /// Completes the stream normally.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        state.write_closed = true;
        state.wake_reader();
    }

    /// Fails the stream; the consumer observes `error` after draining the
    /// frames already buffered.
    pub fn abort(&self, error: BoxError) {
        let mut state = self.shared.state.lock();
        if state.error.is_none() {
            state.error = Some(error);
        }
        state.write_closed = true;
        state.wake_reader();
    }

    /// Whether the consumer is still subscribed.
    pub fn is_open(&self) -> bool {
        !self.shared.state.lock().read_closed
    }

    /// The signed buffered-byte counter, for observability and tests.
    pub fn buffered_bytes(&self) -> usize {
        self.shared.state.lock().buffered
    }
}

impl Drop for BodyWriter {
    fn drop(&mut self) {
        self.close();
    }
}

struct ChannelBody {
    shared: std::sync::Arc<ChannelShared>,
}

impl ChannelBody {
    fn poll_frame(&self, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let mut state = self.shared.state.lock();
        if let Some(frame) = state.queue.pop_front() {
            if let Some(data) = frame.data_ref() {
                state.buffered -= data.len();
            }
            state.wake_writers();
            return Poll::Ready(Some(Ok(frame)));
        }
        if let Some(error) = state.error.take() {
            return Poll::Ready(Some(Err(error)));
        }
        if state.write_closed {
            return Poll::Ready(None);
        }
        state.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }

    fn is_end_stream(&self) -> bool {
        let state = self.shared.state.lock();
        state.write_closed && state.queue.is_empty() && state.error.is_none()
    }
}

impl Drop for ChannelBody {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.read_closed = true;
        state.queue.clear();
        state.buffered = 0;
        state.wake_writers();
    }
}

#[pin_project]
struct LengthLimited {
    #[pin]
    inner: Body,
    remaining: u64,
}

impl http_body::Body for LengthLimited {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        match std::task::ready!(this.inner.poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    let len = data.len() as u64;
                    if len > *this.remaining {
                        return Poll::Ready(Some(Err(Box::new(ContentLengthExceeded))));
                    }
                    *this.remaining -= len;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            other => Poll::Ready(other),
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[pin_project]
struct Previewed {
    #[pin]
    inner: Body,
    previewer: ContentPreviewer,
}

impl http_body::Body for Previewed {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        match std::task::ready!(this.inner.poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    (this.previewer)(data);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            other => Poll::Ready(other),
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[pin_project(PinnedDrop)]
struct WithCompletion {
    #[pin]
    inner: Body,
    hook: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl http_body::Body for WithCompletion {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let ready = std::task::ready!(this.inner.poll_frame(cx));
        match &ready {
            None | Some(Err(_)) => {
                if let Some(hook) = this.hook.take() {
                    hook();
                }
            }
            Some(Ok(_)) => {}
        }
        Poll::Ready(ready)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[pinned_drop]
impl PinnedDrop for WithCompletion {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if let Some(hook) = this.hook.take() {
            hook();
        }
    }
}

#[cfg(test)]
mod body_tests {
    use bytes::Bytes;
    use http_body_util::BodyExt;

    use super::{channel, Body, ClosedStream, ContentLengthExceeded};

    #[tokio::test]
    async fn channel_round_trip() {
        let (writer, body) = channel(1024);
        let task = tokio::spawn(async move {
            writer.send_data(Bytes::from_static(b"hello ")).await.unwrap();
            writer.send_data(Bytes::from_static(b"world")).await.unwrap();
            writer.close();
        });

        let collected = body.into_string().await.unwrap();
        assert_eq!(collected, "hello world");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn writer_suspends_above_watermark() {
        let (writer, mut body) = channel(8);
        writer.send_data(Bytes::from_static(b"0123456789")).await.unwrap();
        assert_eq!(writer.buffered_bytes(), 10);

        // The second write must wait for the consumer to drain.
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            writer.send_data(Bytes::from_static(b"more")),
        )
        .await;
        assert!(pending.is_err(), "write should be suspended over watermark");

        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.data_ref().unwrap().as_ref(), b"0123456789");
        assert_eq!(writer.buffered_bytes(), 0);

        writer.send_data(Bytes::from_static(b"more")).await.unwrap();
    }

    #[tokio::test]
    async fn dropping_consumer_closes_the_stream() {
        let (writer, body) = channel(1024);
        drop(body);
        assert!(!writer.is_open());
        assert_eq!(
            writer.send_data(Bytes::from_static(b"x")).await,
            Err(ClosedStream),
        );
    }

    #[tokio::test]
    async fn abort_surfaces_after_buffered_frames() {
        let (writer, mut body) = channel(1024);
        writer.send_data(Bytes::from_static(b"partial")).await.unwrap();
        writer.abort(Box::new(ClosedStream));

        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.data_ref().unwrap().as_ref(), b"partial");
        let err = body.frame().await.unwrap().unwrap_err();
        assert!(err.downcast_ref::<ClosedStream>().is_some());
    }

    #[tokio::test]
    async fn length_limit_fails_oversized_bodies() {
        let body = Body::full("0123456789").with_length_limit(4);
        let err = body.into_bytes().await.unwrap_err();
        assert!(err.downcast_ref::<ContentLengthExceeded>().is_some());

        let body = Body::full("0123").with_length_limit(4);
        assert_eq!(body.into_bytes().await.unwrap().as_ref(), b"0123");

        // Zero means unlimited.
        let body = Body::full("0123456789").with_length_limit(0);
        assert_eq!(body.into_bytes().await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn previewer_observes_data_frames() {
        use std::sync::{Arc, Mutex};

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let body = Body::full("hello").with_previewer(Box::new(move |data| {
            sink.lock().unwrap().extend_from_slice(data);
        }));
        let _ = body.into_bytes().await.unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), b"hello");
    }

    #[tokio::test]
    async fn trailers_pass_through() {
        let (writer, body) = channel(1024);
        writer.send_data(Bytes::from_static(b"data")).await.unwrap();
        let mut trailers = http::HeaderMap::new();
        trailers.insert("x-checksum", "ab12".parse().unwrap());
        writer.send_trailers(trailers).unwrap();
        writer.close();

        let collected = body.collect().await.unwrap();
        let trailers = collected.trailers().cloned().unwrap();
        assert_eq!(trailers.get("x-checksum").unwrap(), "ab12");
    }
}
