//! The HTTP client: decorator chain, shared factory, pool and sessions.
//!
//! A [`HttpClient`] is a cheap handle over a composed [`Service`] chain.
//! Decorators are [`Layer`]s over the type-erased [`Handler`]; [`from_fn`]
//! lifts a plain `(next, ctx, req)` async function into one. The heavy
//! state (connector, connection pool, event-loop scheduler) lives in an
//! explicitly constructed [`ClientFactory`] that can be shared by many
//! clients and shut down once by its owner.

use std::{future::Future, sync::Arc};

use arbor::{endpoint::Endpoint, scheduler::EventLoopScheduler};
use faststr::FastStr;
use http::{header, uri::Authority, Method, Uri, Version};
use motore::{layer::Layer, service::Service};

use self::{
    connect::{ConnectorConfig, HttpConnector},
    options::ConnectionOptions,
    pool::{ConnectionPool, PoolKey, PoolListener, PoolableConnection},
    session::Connection,
};
use crate::{
    body::Body,
    error::client::{ClientError, Result},
    proto::{Scheme, SessionProtocol},
    request::Request,
    response::Response,
};

pub mod connect;
pub mod options;
pub mod pool;
pub mod session;

/// Per-request client-side context, visible to every decorator.
pub struct ClientContext {
    pub endpoint: Endpoint,
    pub protocol: SessionProtocol,
    pub options: ConnectionOptions,
}

/// The unit decorators compose around: a type-erased clonable [`Service`]
/// over the client context.
#[derive(Clone)]
pub struct Handler {
    inner: motore::BoxCloneService<ClientContext, Request, Response, ClientError>,
}

impl Handler {
    /// Type-erases a [`Service`].
    pub fn new<S>(inner: S) -> Self
    where
        S: Service<ClientContext, Request, Response = Response, Error = ClientError>
            + Clone
            + Send
            + Sync
            + 'static,
    {
        Self {
            inner: motore::BoxCloneService::new(inner),
        }
    }

    /// Calls the wrapped service; the `next.run(cx, req)` form decorators
    /// use to continue the chain.
    pub async fn run(self, cx: &mut ClientContext, req: Request) -> Result<Response> {
        self.inner.call(cx, req).await
    }
}

impl Service<ClientContext, Request> for Handler {
    type Response = Response;
    type Error = ClientError;

    fn call(
        &self,
        cx: &mut ClientContext,
        req: Request,
    ) -> impl Future<Output = Result<Response>> + Send {
        self.inner.call(cx, req)
    }
}

/// A decorator function `(inner handler, ctx, req) -> response`.
///
/// The `'r` parameter binds the returned future to the context borrow, so
/// plain `async fn`s qualify through the blanket impl.
pub trait DecoratorHandler<'r>: Sized {
    type Future: Future<Output = Result<Response>> + Send + 'r;

    fn handle(&self, next: Handler, cx: &'r mut ClientContext, req: Request) -> Self::Future;
}

impl<'r, F, Fut> DecoratorHandler<'r> for F
where
    F: Fn(Handler, &'r mut ClientContext, Request) -> Fut,
    Fut: Future<Output = Result<Response>> + Send + 'r,
{
    type Future = Fut;

    fn handle(&self, next: Handler, cx: &'r mut ClientContext, req: Request) -> Self::Future {
        self(next, cx, req)
    }
}

/// Creates a decorator [`Layer`] from an async function
/// `(next, ctx, req) -> response`.
pub fn from_fn<F>(f: F) -> FromFnLayer<F> {
    FromFnLayer { f }
}

/// [`Layer`] from an async function; see [`from_fn`].
pub struct FromFnLayer<F> {
    f: F,
}

impl<F> Clone for FromFnLayer<F>
where
    F: Clone,
{
    fn clone(&self) -> Self {
        Self { f: self.f.clone() }
    }
}

impl<S, F> Layer<S> for FromFnLayer<F>
where
    S: Service<ClientContext, Request, Response = Response, Error = ClientError>
        + Clone
        + Send
        + Sync
        + 'static,
{
    type Service = FromFn<S, F>;

    fn layer(self, inner: S) -> Self::Service {
        FromFn { inner, f: self.f }
    }
}

/// [`Service`] implementation from [`FromFnLayer`].
pub struct FromFn<S, F> {
    inner: S,
    f: F,
}

impl<S, F> Clone for FromFn<S, F>
where
    S: Clone,
    F: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            f: self.f.clone(),
        }
    }
}

impl<S, F> Service<ClientContext, Request> for FromFn<S, F>
where
    S: Service<ClientContext, Request, Response = Response, Error = ClientError>
        + Clone
        + Send
        + Sync
        + 'static,
    F: for<'r> DecoratorHandler<'r> + Sync,
{
    type Response = Response;
    type Error = ClientError;

    async fn call(&self, cx: &mut ClientContext, req: Request) -> Result<Response> {
        let next = Handler::new(self.inner.clone());
        self.f.handle(next, cx, req).await
    }
}

/// Where a decorator was declared; client-scope decorators precede
/// request-scope ones at equal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoratorScope {
    Client,
    Request,
}

/// A decorator with an explicit ordering attribute: a [`Layer`] over the
/// type-erased [`Handler`].
#[derive(Clone)]
pub struct Decoration {
    order: i32,
    scope: DecoratorScope,
    layer: Arc<dyn Fn(Handler) -> Handler + Send + Sync>,
}

impl Decoration {
    /// Builds a decoration from a `(next, ctx, req)` async function.
    pub fn new<F>(order: i32, scope: DecoratorScope, decorator: F) -> Self
    where
        F: for<'r> DecoratorHandler<'r> + Clone + Send + Sync + 'static,
    {
        Self::from_layer(order, scope, from_fn(decorator))
    }

    /// Builds a decoration from any [`Layer`] over [`Handler`].
    pub fn from_layer<L>(order: i32, scope: DecoratorScope, layer: L) -> Self
    where
        L: Layer<Handler> + Clone + Send + Sync + 'static,
        L::Service: Service<ClientContext, Request, Response = Response, Error = ClientError>
            + Clone
            + Send
            + Sync
            + 'static,
    {
        Self {
            order,
            scope,
            layer: Arc::new(move |inner| Handler::new(layer.clone().layer(inner))),
        }
    }

    pub fn order(&self) -> i32 {
        self.order
    }

    pub fn scope(&self) -> DecoratorScope {
        self.scope
    }
}

/// Right-fold composition: with declarations `[A, B, C]`, A wraps the
/// (B-wrapping-C-wrapping-`inner`) handler. The sort by order is stable,
/// so equal orders preserve declaration order, and the caller lists
/// client-scope decorations before request-scope ones.
fn compose(decorations: &[Decoration], inner: Handler) -> Handler {
    let mut sorted: Vec<&Decoration> = decorations.iter().collect();
    sorted.sort_by_key(|d| d.order);

    let mut handler = inner;
    for decoration in sorted.into_iter().rev() {
        handler = (decoration.layer)(handler);
    }
    handler
}

/// A fallback invoked when the handler chain fails before a response was
/// constructed. Returning `None` propagates the original error.
pub type FallbackFn = Arc<dyn Fn(&ClientContext, &ClientError) -> Option<Response> + Send + Sync>;

/// Configuration of a [`ClientFactory`].
pub struct FactoryConfig {
    /// Workers in the per-endpoint event-loop scheduler.
    pub workers: usize,
    pub connector: ConnectorConfig,
    pub pool_listeners: Vec<Arc<dyn PoolListener>>,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(4),
            connector: ConnectorConfig::default(),
            pool_listeners: Vec::new(),
        }
    }
}

/// The shared heavy state behind clients: connector, pool, scheduler.
///
/// Construct one explicitly, hand it to every client that should share
/// connections, and call [`shutdown`](Self::shutdown) when the process is
/// done with it. There is no hidden global instance.
pub struct ClientFactory {
    scheduler: EventLoopScheduler,
    pool: ConnectionPool<Connection>,
}

impl ClientFactory {
    pub fn new(config: FactoryConfig) -> Arc<Self> {
        let connector = HttpConnector::new(config.connector);
        let pool =
            ConnectionPool::with_listeners(Arc::new(connector), config.pool_listeners);
        Arc::new(Self {
            scheduler: EventLoopScheduler::new(config.workers),
            pool,
        })
    }

    pub fn pool(&self) -> &ConnectionPool<Connection> {
        &self.pool
    }

    pub fn scheduler(&self) -> &EventLoopScheduler {
        &self.scheduler
    }

    /// Closes the pool and every live channel. Idempotent.
    pub async fn shutdown(&self) {
        self.pool.close().await;
    }
}

struct ClientShared {
    base: Endpoint,
    protocol: SessionProtocol,
    options: ConnectionOptions,
    chain: Handler,
    fallback: Option<FallbackFn>,
}

/// An HTTP client bound to one base endpoint and protocol.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientShared>,
}

impl HttpClient {
    pub fn builder(uri: impl Into<FastStr>) -> ClientBuilder {
        ClientBuilder::new(uri)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.base
    }

    pub fn protocol(&self) -> SessionProtocol {
        self.inner.protocol
    }

    /// Sends `req` through the decorator chain.
    pub async fn execute(&self, mut req: Request) -> Result<Response> {
        let shared = &self.inner;
        for (name, value) in shared.options.headers.iter() {
            if !req.headers().contains_key(name) {
                req.headers_mut().insert(name, value.clone());
            }
        }
        if let Some(previewer) = &shared.options.req_content_previewer {
            req = req.map(|body| body.with_previewer(previewer()));
        }

        let mut cx = ClientContext {
            endpoint: shared.base.clone(),
            protocol: shared.protocol,
            options: shared.options.clone(),
        };

        match shared.chain.call(&mut cx, req).await {
            Ok(resp) => {
                let resp = match &shared.options.res_content_previewer {
                    Some(previewer) => resp.map(|body| body.with_previewer(previewer())),
                    None => resp,
                };
                Ok(resp)
            }
            Err(err) => {
                if let Some(fallback) = &shared.fallback {
                    if let Some(resp) = fallback(&cx, &err) {
                        tracing::debug!("request failed, responding from fallback: {err}");
                        return Ok(resp);
                    }
                }
                Err(err)
            }
        }
    }

    /// Convenience GET of `path` on the base endpoint.
    pub async fn get(&self, path: &str) -> Result<Response> {
        self.request(Method::GET, path, Body::empty()).await
    }

    /// Convenience HEAD of `path` on the base endpoint.
    pub async fn head(&self, path: &str) -> Result<Response> {
        self.request(Method::HEAD, path, Body::empty()).await
    }

    /// Convenience POST of `body` to `path` on the base endpoint.
    pub async fn post(&self, path: &str, body: impl Into<Body>) -> Result<Response> {
        self.request(Method::POST, path, body.into()).await
    }

    pub async fn request(&self, method: Method, path: &str, body: Body) -> Result<Response> {
        let uri: Uri = path
            .parse()
            .map_err(|_| ClientError::violation(format!("invalid request path `{path}`")))?;
        let mut req = http::Request::new(body);
        *req.method_mut() = method;
        *req.uri_mut() = uri;
        self.execute(req).await
    }
}

/// Builds an [`HttpClient`].
pub struct ClientBuilder {
    uri: FastStr,
    factory: Option<Arc<ClientFactory>>,
    options: ConnectionOptions,
    decorations: Vec<Decoration>,
    fallback: Option<FallbackFn>,
}

impl ClientBuilder {
    pub fn new(uri: impl Into<FastStr>) -> Self {
        Self {
            uri: uri.into(),
            factory: None,
            options: ConnectionOptions::standard(),
            decorations: Vec::new(),
            fallback: None,
        }
    }

    /// Shares connections through an existing factory instead of building
    /// a private one.
    pub fn factory(mut self, factory: Arc<ClientFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn write_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.options.write_timeout = Some(timeout);
        self
    }

    pub fn response_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.options.response_timeout = Some(timeout);
        self
    }

    /// `0` disables the limit.
    pub fn max_response_length(mut self, max: u64) -> Self {
        self.options.max_response_length = max;
        self
    }

    pub fn header(
        mut self,
        name: http::header::HeaderName,
        value: http::header::HeaderValue,
    ) -> Self {
        self.options.headers.insert(name, value);
        self
    }

    pub fn options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Adds a client-scope decorator with the given order attribute.
    pub fn decorator<F>(self, order: i32, decorator: F) -> Self
    where
        F: for<'r> DecoratorHandler<'r> + Clone + Send + Sync + 'static,
    {
        self.decoration(Decoration::new(order, DecoratorScope::Client, decorator))
    }

    /// Adds a request-scope decorator; sorts after client-scope decorators
    /// of the same order.
    pub fn request_decorator<F>(self, order: i32, decorator: F) -> Self
    where
        F: for<'r> DecoratorHandler<'r> + Clone + Send + Sync + 'static,
    {
        self.decoration(Decoration::new(order, DecoratorScope::Request, decorator))
    }

    /// Adds a pre-built decoration.
    pub fn decoration(mut self, decoration: Decoration) -> Self {
        self.decorations.push(decoration);
        self
    }

    pub fn fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn(&ClientContext, &ClientError) -> Option<Response> + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    pub fn build(self) -> Result<HttpClient> {
        let (scheme, rest) = self
            .uri
            .split_once("://")
            .ok_or_else(|| ClientError::violation(format!("uri `{}` has no scheme", self.uri)))?;
        let scheme = Scheme::parse(scheme)?;
        let authority = rest.split(['/', '?']).next().unwrap_or(rest);
        let base = Endpoint::parse(authority)
            .map_err(|err| ClientError::violation(format!("bad authority: {err}")))?;

        let factory = self
            .factory
            .unwrap_or_else(|| ClientFactory::new(FactoryConfig::default()));

        // Keep client-scope declarations ahead of request-scope ones; the
        // stable sort in compose() then breaks order ties by scope.
        let mut decorations = self.decorations;
        decorations.sort_by_key(|d| match d.scope() {
            DecoratorScope::Client => 0,
            DecoratorScope::Request => 1,
        });

        let chain = compose(&decorations, Handler::new(ClientTransport { factory }));

        Ok(HttpClient {
            inner: Arc::new(ClientShared {
                base,
                protocol: scheme.protocol,
                options: self.options,
                chain,
                fallback: self.fallback,
            }),
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("no address resolved for the target host")]
struct NoResolvedAddress;

async fn resolve_endpoint(endpoint: Endpoint, default_port: u16) -> Result<Endpoint> {
    if endpoint.has_ip() {
        return Ok(endpoint);
    }
    let port = endpoint.port_or(default_port);
    let host = endpoint.host().to_string();
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(ClientError::unprocessed)?;
    match addrs.next() {
        Some(addr) => Ok(endpoint.with_ip(addr.ip())),
        None => Err(ClientError::unprocessed(NoResolvedAddress)),
    }
}

/// The innermost [`Service`]: resolve, pool acquire, session invoke,
/// release.
#[derive(Clone)]
struct ClientTransport {
    factory: Arc<ClientFactory>,
}

impl Service<ClientContext, Request> for ClientTransport {
    type Response = Response;
    type Error = ClientError;

    async fn call(&self, cx: &mut ClientContext, req: Request) -> Result<Response> {
        let default_port = cx.protocol.default_port();
        let endpoint = resolve_endpoint(cx.endpoint.clone(), default_port).await?;
        let key = PoolKey::from_endpoint(&endpoint, default_port)
            .ok_or_else(|| ClientError::unprocessed(NoResolvedAddress))?;

        // Ordered per-endpoint work stays on one worker for the whole
        // exchange; the lease travels with the response body.
        let lease = self.factory.scheduler.acquire(&endpoint);
        let conn = self.factory.pool.acquire(cx.protocol, &key).await?;
        let req = prepare_request(req, &endpoint, conn.protocol());

        match conn.invoke(req, &cx.options).await {
            Ok(resp) => {
                let pool = self.factory.pool.clone();
                let release_key = key.clone();
                let release_conn = conn.clone();
                Ok(resp.map(move |body| {
                    body.with_completion(move || {
                        pool.release(release_conn, &release_key);
                        drop(lease);
                    })
                }))
            }
            Err(err) => {
                // An exclusive connection that failed mid-exchange cannot
                // be reused safely.
                if !conn.protocol().is_multiplex() {
                    conn.close();
                }
                Err(err)
            }
        }
    }
}

/// Fills in what each dialect needs: a `Host` header for HTTP/1 and an
/// absolute URI (hyper turns it into `:scheme`/`:authority`) for HTTP/2.
fn prepare_request(mut req: Request, endpoint: &Endpoint, negotiated: SessionProtocol) -> Request {
    let authority = endpoint.authority();

    if !req.headers().contains_key(header::HOST) {
        if let Ok(value) = authority.parse() {
            req.headers_mut().insert(header::HOST, value);
        }
    }

    if negotiated.is_multiplex() {
        *req.version_mut() = Version::HTTP_2;
        let mut parts = req.uri().clone().into_parts();
        parts.scheme = Some(if negotiated.is_tls() {
            http::uri::Scheme::HTTPS
        } else {
            http::uri::Scheme::HTTP
        });
        if parts.authority.is_none() {
            parts.authority = Authority::try_from(authority.as_str()).ok();
        }
        if let Ok(uri) = Uri::from_parts(parts) {
            *req.uri_mut() = uri;
        }
    }
    req
}

#[cfg(test)]
mod client_tests {
    use std::{
        net::SocketAddr,
        sync::{Arc, Mutex},
    };

    use hyper_util::rt::{TokioExecutor, TokioIo};
    use motore::{layer::Layer, service::service_fn, Service};

    use super::{
        compose, ClientContext, ClientFactory, Decoration, DecoratorScope, FactoryConfig,
        Handler, HttpClient,
    };
    use crate::{
        body::Body,
        client::pool::PoolKey,
        error::client::{ClientError, Result},
        proto::SessionProtocol,
        request::Request,
        response::Response,
    };

    async fn echo_server(h2: bool) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let service = hyper::service::service_fn(
                        |req: http::Request<hyper::body::Incoming>| async move {
                            let body = format!("echo {}", req.uri().path());
                            Ok::<_, std::convert::Infallible>(http::Response::new(
                                http_body_util::Full::new(bytes::Bytes::from(body)),
                            ))
                        },
                    );
                    if h2 {
                        let _ = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    } else {
                        let _ = hyper::server::conn::http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn http1_round_trip_and_reuse() {
        let addr = echo_server(false).await;
        let factory = ClientFactory::new(FactoryConfig::default());
        let client = HttpClient::builder(format!("h1c://{addr}"))
            .factory(factory.clone())
            .build()
            .unwrap();

        let resp = client.get("/hello").await.unwrap();
        assert_eq!(resp.status(), http::StatusCode::OK);
        let body = resp.into_body().into_string().await.unwrap();
        assert_eq!(body, "echo /hello");

        // The connection was released back to the idle deque.
        let key = PoolKey::new("127.0.0.1".into(), addr.ip(), addr.port());
        assert_eq!(factory.pool().idle_count(SessionProtocol::H1c, &key), 1);

        let resp = client.get("/again").await.unwrap();
        assert_eq!(
            resp.into_body().into_string().await.unwrap(),
            "echo /again",
        );

        factory.shutdown().await;
    }

    #[tokio::test]
    async fn http2_round_trip_multiplexes() {
        let addr = echo_server(true).await;
        let factory = ClientFactory::new(FactoryConfig::default());
        let client = HttpClient::builder(format!("h2c://{addr}"))
            .factory(factory.clone())
            .build()
            .unwrap();

        let (a, b) = tokio::join!(client.get("/a"), client.get("/b"));
        assert_eq!(
            a.unwrap().into_body().into_string().await.unwrap(),
            "echo /a",
        );
        assert_eq!(
            b.unwrap().into_body().into_string().await.unwrap(),
            "echo /b",
        );

        // Both requests multiplexed over one pooled connection.
        let key = PoolKey::new("127.0.0.1".into(), addr.ip(), addr.port());
        assert_eq!(factory.pool().idle_count(SessionProtocol::H2c, &key), 1);

        factory.shutdown().await;
    }

    #[tokio::test]
    async fn undetermined_http_negotiates_cleartext_http1() {
        // `http` resolves to HTTP/1.1 on the wire; h2c needs prior
        // knowledge via an explicit `h2c` target.
        let addr = echo_server(false).await;
        let factory = ClientFactory::new(FactoryConfig::default());
        let client = HttpClient::builder(format!("http://{addr}"))
            .factory(factory.clone())
            .build()
            .unwrap();

        let resp = client.get("/downgrade").await.unwrap();
        assert_eq!(
            resp.into_body().into_string().await.unwrap(),
            "echo /downgrade",
        );

        let key = PoolKey::new("127.0.0.1".into(), addr.ip(), addr.port());
        assert_eq!(factory.pool().idle_count(SessionProtocol::H1c, &key), 1);
        assert_eq!(factory.pool().idle_count(SessionProtocol::H2c, &key), 0);

        factory.shutdown().await;
    }

    /// [`Layer`] recording the order decorators run in.
    #[derive(Clone)]
    struct RecordingLayer {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl RecordingLayer {
        fn new(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Self {
            Self {
                name,
                log: log.clone(),
            }
        }
    }

    impl<S> Layer<S> for RecordingLayer {
        type Service = Recording<S>;

        fn layer(self, inner: S) -> Self::Service {
            Recording {
                name: self.name,
                log: self.log,
                inner,
            }
        }
    }

    #[derive(Clone)]
    struct Recording<S> {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        inner: S,
    }

    impl<S> Service<ClientContext, Request> for Recording<S>
    where
        S: Service<ClientContext, Request, Response = Response, Error = ClientError>
            + Send
            + Sync,
    {
        type Response = Response;
        type Error = ClientError;

        async fn call(&self, cx: &mut ClientContext, req: Request) -> Result<Response> {
            self.log.lock().unwrap().push(self.name);
            self.inner.call(cx, req).await
        }
    }

    #[derive(Clone)]
    struct RecordingInner {
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Service<ClientContext, Request> for RecordingInner {
        type Response = Response;
        type Error = ClientError;

        async fn call(&self, _cx: &mut ClientContext, _req: Request) -> Result<Response> {
            self.log.lock().unwrap().push("inner");
            Ok(http::Response::new(Body::empty()))
        }
    }

    fn test_cx() -> ClientContext {
        ClientContext {
            endpoint: arbor::endpoint::Endpoint::parse("127.0.0.1:1").unwrap(),
            protocol: SessionProtocol::H1c,
            options: Default::default(),
        }
    }

    #[tokio::test]
    async fn decorators_compose_right_fold_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let decorations = vec![
            Decoration::from_layer(
                0,
                DecoratorScope::Client,
                RecordingLayer::new("a", &log),
            ),
            Decoration::from_layer(
                0,
                DecoratorScope::Client,
                RecordingLayer::new("b", &log),
            ),
            Decoration::from_layer(
                -1,
                DecoratorScope::Client,
                RecordingLayer::new("early", &log),
            ),
            Decoration::from_layer(
                1,
                DecoratorScope::Client,
                RecordingLayer::new("late", &log),
            ),
        ];
        let inner = Handler::new(RecordingInner { log: log.clone() });

        let chain = compose(&decorations, inner);
        let mut cx = test_cx();
        chain
            .call(&mut cx, http::Request::new(Body::empty()))
            .await
            .unwrap();

        // Sorted by order; equal orders keep declaration order.
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &["early", "a", "b", "late", "inner"],
        );
    }

    async fn tagging(
        next: Handler,
        cx: &mut ClientContext,
        req: Request,
    ) -> Result<Response> {
        let mut resp = next.run(cx, req).await?;
        resp.headers_mut()
            .insert("x-decorated", http::HeaderValue::from_static("yes"));
        Ok(resp)
    }

    async fn empty_ok(_cx: &mut ClientContext, _req: Request) -> Result<Response> {
        Ok(http::Response::new(Body::empty()))
    }

    #[tokio::test]
    async fn from_fn_decorators_wrap_the_chain() {
        let decorations = vec![Decoration::new(0, DecoratorScope::Client, tagging)];
        let chain = compose(&decorations, Handler::new(service_fn(empty_ok)));

        let mut cx = test_cx();
        let resp = chain
            .call(&mut cx, http::Request::new(Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.headers().get("x-decorated").unwrap(), "yes");
    }

    async fn always_closed(_cx: &mut ClientContext, _req: Request) -> Result<Response> {
        Err(ClientError::ClosedSession)
    }

    #[tokio::test]
    async fn fallback_serves_when_the_chain_fails() {
        use super::ClientShared;

        let chain = Handler::new(service_fn(always_closed));
        let client = HttpClient {
            inner: Arc::new(ClientShared {
                base: arbor::endpoint::Endpoint::parse("127.0.0.1:1").unwrap(),
                protocol: SessionProtocol::H1c,
                options: Default::default(),
                chain,
                fallback: Some(Arc::new(|_cx, err| {
                    assert!(matches!(err, ClientError::ClosedSession));
                    let mut resp = http::Response::new(Body::from("fallback"));
                    *resp.status_mut() = http::StatusCode::SERVICE_UNAVAILABLE;
                    Some(resp)
                })),
            }),
        };

        let resp = client.get("/x").await.unwrap();
        assert_eq!(resp.status(), http::StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            resp.into_body().into_string().await.unwrap(),
            "fallback",
        );
    }

    #[tokio::test]
    async fn extra_headers_do_not_override_request_headers() {
        let addr = echo_server(false).await;
        let client = HttpClient::builder(format!("h1c://{addr}"))
            .header(
                http::header::USER_AGENT,
                http::HeaderValue::from_static("arbor-test"),
            )
            .build()
            .unwrap();

        let mut req = http::Request::new(Body::empty());
        *req.uri_mut() = "/ua".parse().unwrap();
        req.headers_mut().insert(
            http::header::USER_AGENT,
            http::HeaderValue::from_static("explicit"),
        );
        let resp = client.execute(req).await.unwrap();
        assert_eq!(resp.status(), http::StatusCode::OK);
    }
}
