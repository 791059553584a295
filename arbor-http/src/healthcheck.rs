//! HTTP probing for health-checked endpoint groups.
//!
//! [`HttpCheckerFactory`] plugs the HTTP client into
//! [`arbor::healthcheck::HealthCheckedEndpointGroup`]: every candidate
//! endpoint gets a checker that issues `HEAD` probes on the context's
//! schedule and feeds 2xx/other into `update_health`.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use arbor::healthcheck::{AsyncCloseable, CheckerFactory, HealthCheckerContext};
use faststr::FastStr;
use futures::future::BoxFuture;

use crate::{
    client::{ClientFactory, HttpClient},
    proto::SessionProtocol,
};

/// Builds HTTP checkers bound to a shared [`ClientFactory`].
pub struct HttpCheckerFactory {
    client_factory: Arc<ClientFactory>,
    protocol: SessionProtocol,
    path: FastStr,
}

impl HttpCheckerFactory {
    pub fn new(
        client_factory: Arc<ClientFactory>,
        protocol: SessionProtocol,
        path: impl Into<FastStr>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client_factory,
            protocol,
            path: path.into(),
        })
    }

    fn probe_client(&self, ctx: &HealthCheckerContext) -> Option<HttpClient> {
        // The context's endpoint already carries the probe-port rewrite.
        let uri = format!("{}://{}", self.protocol, ctx.endpoint());
        HttpClient::builder(uri)
            .factory(self.client_factory.clone())
            .build()
            .map_err(|err| {
                tracing::warn!(endpoint = %ctx.endpoint(), "cannot build probe client: {err}");
            })
            .ok()
    }
}

impl CheckerFactory for HttpCheckerFactory {
    fn create(&self, ctx: Arc<HealthCheckerContext>) -> Box<dyn AsyncCloseable> {
        let stopped = Arc::new(AtomicBool::new(false));
        match self.probe_client(&ctx) {
            Some(client) => {
                schedule_probe(
                    client,
                    self.path.clone(),
                    ctx,
                    stopped.clone(),
                    std::time::Duration::ZERO,
                );
            }
            None => ctx.update_health(0.0),
        }
        Box::new(HttpChecker { stopped })
    }
}

fn schedule_probe(
    client: HttpClient,
    path: FastStr,
    ctx: Arc<HealthCheckerContext>,
    stopped: Arc<AtomicBool>,
    delay: std::time::Duration,
) {
    let probe_ctx = ctx.clone();
    let fut: BoxFuture<'static, ()> = Box::pin(async move {
        if stopped.load(Ordering::Acquire) {
            return;
        }
        let healthy = match client.head(&path).await {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                tracing::debug!(endpoint = %probe_ctx.endpoint(), "health probe failed: {err}");
                false
            }
        };
        probe_ctx.update_health(if healthy { 1.0 } else { 0.0 });
        if stopped.load(Ordering::Acquire) || probe_ctx.is_destroyed() {
            return;
        }
        let next = probe_ctx.next_delay();
        schedule_probe(client, path, probe_ctx, stopped, next);
    });
    ctx.schedule(delay, fut);
}

struct HttpChecker {
    stopped: Arc<AtomicBool>,
}

impl AsyncCloseable for HttpChecker {
    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        self.stopped.store(true, Ordering::Release);
        Box::pin(async {})
    }
}
