//! The HTTP server: router dispatch, decorator chain, request timeouts.
//!
//! A [`Server`] owns an immutable route table built by
//! [`ServerBuilder`]. Handlers are [`Service`]s over the request context;
//! decorators are [`Layer`]s over the type-erased [`ServerHandler`], with
//! [`from_fn`] lifting plain `(next, ctx, req)` async functions into one.
//! Dispatch is non-blocking: the router picks the best match, the
//! decorated handler runs under a reschedulable request timeout, and
//! misses map onto 404/405/415/406 (or a 307 for trailing-slash-equivalent
//! paths).

use std::{convert::Infallible, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use faststr::FastStr;
use futures::future::BoxFuture;
use http::{header, StatusCode};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use motore::{layer::Layer, service::Service};
use parking_lot::Mutex;
use tokio::sync::watch;

use self::{
    route::{RejectionPolicy, Route, RouteError, Router, RoutingContext, RoutingResult},
    timeout::RequestTimeout,
};
use crate::{
    body::Body,
    error::server::{status_response, ServerError},
    request::Request,
    response::Response,
};

pub mod route;
pub mod timeout;

/// Per-request server-side context.
pub struct ServiceRequestContext {
    peer: SocketAddr,
    routing: RoutingResult,
    timeout: Arc<RequestTimeout>,
}

/// An owned snapshot of the context, handed to blocking tasks.
#[derive(Clone)]
pub struct RequestSnapshot {
    pub peer: SocketAddr,
    pub routing: RoutingResult,
}

impl ServiceRequestContext {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn routing_result(&self) -> &RoutingResult {
        &self.routing
    }

    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.routing.param(name)
    }

    /// The request-timeout controller; decorators may reschedule it.
    pub fn request_timeout(&self) -> &Arc<RequestTimeout> {
        &self.timeout
    }

    /// Reschedules the request timeout from now. Zero disables.
    pub fn set_request_timeout(&self, timeout: Duration) {
        self.timeout.set_request_timeout(timeout);
    }

    pub fn snapshot(&self) -> RequestSnapshot {
        RequestSnapshot {
            peer: self.peer,
            routing: self.routing.clone(),
        }
    }

    /// Runs `f` on the blocking-task executor, propagating a snapshot of
    /// this request's context into the task.
    pub async fn run_blocking<F, T>(&self, f: F) -> T
    where
        F: FnOnce(RequestSnapshot) -> T + Send + 'static,
        T: Send + 'static,
    {
        let snapshot = self.snapshot();
        match tokio::task::spawn_blocking(move || f(snapshot)).await {
            Ok(value) => value,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => unreachable!("blocking task cancelled"),
        }
    }
}

/// The unit server decorators compose around: a type-erased clonable
/// [`Service`] over the request context.
#[derive(Clone)]
pub struct ServerHandler {
    inner: motore::BoxCloneService<ServiceRequestContext, Request, Response, ServerError>,
}

impl ServerHandler {
    /// Type-erases a [`Service`].
    pub fn new<S>(inner: S) -> Self
    where
        S: Service<ServiceRequestContext, Request, Response = Response, Error = ServerError>
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
    pub async fn run(
        self,
        cx: &mut ServiceRequestContext,
        req: Request,
    ) -> Result<Response, ServerError> {
        self.inner.call(cx, req).await
    }
}

impl Service<ServiceRequestContext, Request> for ServerHandler {
    type Response = Response;
    type Error = ServerError;

    fn call(
        &self,
        cx: &mut ServiceRequestContext,
        req: Request,
    ) -> impl Future<Output = Result<Response, ServerError>> + Send {
        self.inner.call(cx, req)
    }
}

/// A decorator function `(inner handler, ctx, req) -> response`.
///
/// The `'r` parameter binds the returned future to the context borrow, so
/// plain `async fn`s qualify through the blanket impl.
pub trait ServerDecoratorHandler<'r>: Sized {
    type Future: Future<Output = Result<Response, ServerError>> + Send + 'r;

    fn handle(
        &self,
        next: ServerHandler,
        cx: &'r mut ServiceRequestContext,
        req: Request,
    ) -> Self::Future;
}

impl<'r, F, Fut> ServerDecoratorHandler<'r> for F
where
    F: Fn(ServerHandler, &'r mut ServiceRequestContext, Request) -> Fut,
    Fut: Future<Output = Result<Response, ServerError>> + Send + 'r,
{
    type Future = Fut;

    fn handle(
        &self,
        next: ServerHandler,
        cx: &'r mut ServiceRequestContext,
        req: Request,
    ) -> Self::Future {
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
    S: Service<ServiceRequestContext, Request, Response = Response, Error = ServerError>
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

impl<S, F> Service<ServiceRequestContext, Request> for FromFn<S, F>
where
    S: Service<ServiceRequestContext, Request, Response = Response, Error = ServerError>
        + Clone
        + Send
        + Sync
        + 'static,
    F: for<'r> ServerDecoratorHandler<'r> + Sync,
{
    type Response = Response;
    type Error = ServerError;

    async fn call(
        &self,
        cx: &mut ServiceRequestContext,
        req: Request,
    ) -> Result<Response, ServerError> {
        let next = ServerHandler::new(self.inner.clone());
        self.f.handle(next, cx, req).await
    }
}

/// Where a server decorator was declared; server-scope decorators precede
/// route-scope ones at equal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerDecoratorScope {
    Server,
    Route,
}

/// A decorator with an explicit ordering attribute: a [`Layer`] over the
/// type-erased [`ServerHandler`].
#[derive(Clone)]
pub struct ServerDecoration {
    order: i32,
    scope: ServerDecoratorScope,
    layer: Arc<dyn Fn(ServerHandler) -> ServerHandler + Send + Sync>,
}

impl ServerDecoration {
    /// Builds a decoration from a `(next, ctx, req)` async function.
    pub fn new<F>(order: i32, scope: ServerDecoratorScope, decorator: F) -> Self
    where
        F: for<'r> ServerDecoratorHandler<'r> + Clone + Send + Sync + 'static,
    {
        Self::from_layer(order, scope, from_fn(decorator))
    }

    /// Builds a decoration from any [`Layer`] over [`ServerHandler`].
    pub fn from_layer<L>(order: i32, scope: ServerDecoratorScope, layer: L) -> Self
    where
        L: Layer<ServerHandler> + Clone + Send + Sync + 'static,
        L::Service: Service<ServiceRequestContext, Request, Response = Response, Error = ServerError>
            + Clone
            + Send
            + Sync
            + 'static,
    {
        Self {
            order,
            scope,
            layer: Arc::new(move |inner| ServerHandler::new(layer.clone().layer(inner))),
        }
    }

    pub fn order(&self) -> i32 {
        self.order
    }

    pub fn scope(&self) -> ServerDecoratorScope {
        self.scope
    }
}

/// Right-fold composition, identical in shape to the client chain: a
/// stable sort by order, declaration order preserved on ties.
fn compose(decorations: &[ServerDecoration], inner: ServerHandler) -> ServerHandler {
    let mut sorted: Vec<&ServerDecoration> = decorations.iter().collect();
    sorted.sort_by_key(|d| d.order);

    let mut handler = inner;
    for decoration in sorted.into_iter().rev() {
        handler = (decoration.layer)(handler);
    }
    handler
}

type ShutdownHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct ServerInner {
    router: Router<ServerHandler>,
    request_timeout: Option<Duration>,
    shutdown: watch::Sender<bool>,
    shutdown_hooks: Mutex<Vec<ShutdownHook>>,
}

/// The server: an immutable route table plus the accept loop.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Dispatches one request; the transport-facing entry point, also
    /// usable directly in tests.
    pub async fn handle(&self, peer: SocketAddr, req: Request) -> Response {
        let hostname = request_hostname(&req);
        let rctx = RoutingContext::from_request(hostname, &req);

        let Some((handler, routing)) = self.inner.router.find(&rctx) else {
            return self.reject(&rctx);
        };

        let timeout = Arc::new(RequestTimeout::new(self.inner.request_timeout));
        let mut cx = ServiceRequestContext {
            peer,
            routing,
            timeout: timeout.clone(),
        };
        let handler = handler.clone();

        tokio::select! {
            result = handler.call(&mut cx, req) => match result {
                Ok(resp) => resp,
                Err(err) => err.into_response(),
            },
            _ = timeout.expired() => {
                tracing::debug!(peer = %peer, "request timed out");
                status_response(StatusCode::SERVICE_UNAVAILABLE)
            }
        }
    }

    /// Maps a routing miss onto its status: the most specific delayed
    /// failure, a trailing-slash 307, or 404.
    fn reject(&self, rctx: &RoutingContext) -> Response {
        if let Some(failure) = rctx.delayed_failure() {
            return status_response(failure.status());
        }
        if let Some(location) = self.slash_redirect_location(rctx) {
            let mut resp = status_response(StatusCode::TEMPORARY_REDIRECT);
            if let Ok(value) = location.parse() {
                resp.headers_mut().insert(header::LOCATION, value);
            }
            return resp;
        }
        status_response(StatusCode::NOT_FOUND)
    }

    /// The prefix trick: when the path differs from a registered route
    /// only by a trailing slash, answer 307 to the equivalent path.
    fn slash_redirect_location(&self, rctx: &RoutingContext) -> Option<String> {
        let path = rctx.path();
        let alternative = match path.strip_suffix('/') {
            Some("") => return None,
            Some(stripped) => stripped.to_string(),
            None => format!("{path}/"),
        };

        let probe = RoutingContext::new(
            FastStr::new(rctx.hostname()),
            rctx.method().clone(),
            alternative.clone(),
            rctx.query().map(FastStr::new),
            rctx.content_type().cloned(),
            rctx.accept().to_vec(),
            rctx.is_cors_preflight(),
        );
        self.inner.router.find(&probe)?;

        Some(match rctx.query() {
            Some(query) => format!("{alternative}?{query}"),
            None => alternative,
        })
    }

    /// Accepts connections until [`shutdown`](Self::shutdown).
    pub async fn serve(&self, listener: tokio::net::TcpListener) -> std::io::Result<()> {
        let mut shutdown = self.inner.shutdown.subscribe();
        tracing::info!(addr = %listener.local_addr()?, "server started");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let server = self.clone();
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = hyper::service::service_fn(move |req| {
                            let server = server.clone();
                            async move {
                                let req = req.map(Body::from_incoming);
                                Ok::<_, Infallible>(server.handle(peer, req).await)
                            }
                        });
                        if let Err(err) = auto::Builder::new(TokioExecutor::new())
                            .serve_connection(io, service)
                            .await
                        {
                            tracing::debug!(peer = %peer, "connection terminated: {err}");
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("server stopping");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Runs the registered shutdown hooks and stops the accept loop.
    /// Idempotent.
    pub async fn shutdown(&self) {
        let hooks: Vec<ShutdownHook> = self.inner.shutdown_hooks.lock().drain(..).collect();
        for hook in hooks {
            hook().await;
        }
        let _ = self.inner.shutdown.send(true);
    }
}

fn request_hostname<B>(req: &http::Request<B>) -> FastStr {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host())
        .unwrap_or_default();
    // Strip a port suffix; bracketed IPv6 literals keep their brackets.
    match host.rsplit_once(':') {
        Some((name, port)) if !name.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            FastStr::new(name)
        }
        _ => FastStr::new(host),
    }
}

/// Builds a [`Server`].
pub struct ServerBuilder {
    registrations: Vec<(Route, ServerHandler, Vec<ServerDecoration>)>,
    decorations: Vec<ServerDecoration>,
    rejection: RejectionPolicy,
    request_timeout: Option<Duration>,
    shutdown_hooks: Vec<ShutdownHook>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            registrations: Vec::new(),
            decorations: Vec::new(),
            rejection: RejectionPolicy::default(),
            request_timeout: Some(Duration::from_secs(10)),
            shutdown_hooks: Vec::new(),
        }
    }

    /// Registers a route with its handler.
    pub fn route(mut self, route: Route, handler: ServerHandler) -> Self {
        self.registrations.push((route, handler, Vec::new()));
        self
    }

    /// Registers a route whose handler carries its own decorators;
    /// server-scope decorators of the same order run outside them.
    pub fn route_decorated(
        mut self,
        route: Route,
        handler: ServerHandler,
        decorations: Vec<ServerDecoration>,
    ) -> Self {
        self.registrations.push((route, handler, decorations));
        self
    }

    /// Adds a server-scope decorator with the given order attribute.
    pub fn decorator<F>(self, order: i32, decorator: F) -> Self
    where
        F: for<'r> ServerDecoratorHandler<'r> + Clone + Send + Sync + 'static,
    {
        self.decoration(ServerDecoration::new(
            order,
            ServerDecoratorScope::Server,
            decorator,
        ))
    }

    /// Adds a pre-built server-scope decoration.
    pub fn decoration(mut self, decoration: ServerDecoration) -> Self {
        self.decorations.push(decoration);
        self
    }

    pub fn rejection_policy(mut self, policy: RejectionPolicy) -> Self {
        self.rejection = policy;
        self
    }

    /// The default per-request timeout; `None` disables.
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn shutdown_hook<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.shutdown_hooks.push(Box::new(hook));
        self
    }

    pub fn build(self) -> Result<Server, RouteError> {
        let mut router = Router::builder().rejection_policy(self.rejection);
        for (route, handler, route_decorations) in self.registrations {
            // Server-scope declarations come first so the stable sort in
            // compose() keeps them outside route-scope ties.
            let mut combined = self.decorations.clone();
            combined.extend(route_decorations);
            router = router.route(route, compose(&combined, handler));
        }
        let (shutdown, _) = watch::channel(false);
        Ok(Server {
            inner: Arc::new(ServerInner {
                router: router.build()?,
                request_timeout: self.request_timeout,
                shutdown,
                shutdown_hooks: Mutex::new(self.shutdown_hooks),
            }),
        })
    }
}
